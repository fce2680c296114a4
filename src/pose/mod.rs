//! Pose estimation module
//!
//! Detects the calibration chessboard in camera frames, solves the camera
//! pose against the board's known geometry and hands out the pose in both
//! the vision and the render convention.

pub mod convention;
mod detect;
mod estimator;
mod pattern;
mod solve;

pub use convention::{PosePair, RenderPose, VisionPose};
pub use detect::{ChessboardDetector, CornerSet, DetectorParams};
pub use estimator::{EstimatorState, PoseEstimator};
pub use pattern::CalibrationPattern;
pub use solve::{rms_error, CameraIntrinsics, Extrinsics, PnpSolver, PoseSolveError};
