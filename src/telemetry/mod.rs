//! Telemetry
//!
//! Iteration timing for the frame pipeline. Logging itself goes through the
//! `log` facade and is initialized by the binary.

pub mod metrics;

pub use metrics::{FrameProfiler, FrameStats};
