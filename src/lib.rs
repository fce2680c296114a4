//! Dental AR preview
//!
//! Tracks a printed chessboard with a camera, solves the camera pose and drives
//! three persistent offscreen scenes from it:
//! - an intraoral tooth close-up rendered from the tracked viewpoint
//! - an AR composite that marks where the camera points on the dental model
//! - a calibration overlay for checking tracking accuracy on the raw feed
//!
//! A single worker produces every image and hands them to the display layer
//! through small bounded channels.

pub mod axis;
pub mod capture;
pub mod config;
pub mod pipeline;
pub mod pose;
pub mod render;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::AppConfig;
pub use pipeline::{FramePipeline, OutputKind, StopReason};
