//! Capture → detect → solve, owning the frame source.

use std::time::Instant;

use crate::capture::{CaptureError, Frame, FrameSource};
use crate::config::AppConfig;

use super::convention::PosePair;
use super::detect::{ChessboardDetector, CornerSet};
use super::pattern::CalibrationPattern;
use super::solve::{CameraIntrinsics, PnpSolver, PoseSolveError};

/// Where the estimator is in its per-frame cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorState {
    Idle,
    Capturing,
    /// No complete grid, or the grid did not yield a valid pose.
    PatternNotFound,
    PatternFound,
    PoseSolved,
    /// Terminal: the source has been released.
    Released,
}

/// Owns the capture device and turns frames into poses.
pub struct PoseEstimator<S: FrameSource> {
    source: S,
    pattern: CalibrationPattern,
    intrinsics: CameraIntrinsics,
    detector: ChessboardDetector,
    solver: PnpSolver,
    state: EstimatorState,
    frames_read: u64,
}

impl<S: FrameSource> PoseEstimator<S> {
    /// Build an estimator around an opened source.
    ///
    /// The principal point is taken from the resolution the source actually
    /// delivers, which may differ from the one requested in the config.
    pub fn new(source: S, config: &AppConfig) -> Self {
        let (width, height) = source.resolution();
        if [width, height] != config.camera_resolution {
            log::warn!(
                "Source delivers {}x{}, config requested {}x{}; intrinsics follow the source",
                width,
                height,
                config.camera_resolution[0],
                config.camera_resolution[1]
            );
        }
        let intrinsics = CameraIntrinsics::new(
            config.focal_length,
            config.focal_length,
            width as f64 / 2.0,
            height as f64 / 2.0,
        );
        let pattern = config.pattern();
        Self::with_parts(source, pattern, intrinsics)
    }

    pub fn with_parts(source: S, pattern: CalibrationPattern, intrinsics: CameraIntrinsics) -> Self {
        Self {
            detector: ChessboardDetector::for_pattern(&pattern),
            source,
            pattern,
            intrinsics,
            solver: PnpSolver::default(),
            state: EstimatorState::Idle,
            frames_read: 0,
        }
    }

    pub fn state(&self) -> EstimatorState {
        self.state
    }

    pub fn pattern(&self) -> &CalibrationPattern {
        &self.pattern
    }

    pub fn intrinsics(&self) -> &CameraIntrinsics {
        &self.intrinsics
    }

    pub fn resolution(&self) -> (u32, u32) {
        self.source.resolution()
    }

    /// Read one frame from the device.
    pub fn capture(&mut self) -> Result<Frame, CaptureError> {
        if self.state == EstimatorState::Released {
            return Err(CaptureError::Released);
        }
        self.state = EstimatorState::Capturing;
        let image = self.source.read_frame()?;
        let frame = Frame {
            image,
            index: self.frames_read,
            timestamp: Instant::now(),
        };
        self.frames_read += 1;
        Ok(frame)
    }

    /// Locate the grid and return the refined solver subset, or `None`.
    pub fn detect_pattern(&mut self, frame: &Frame) -> Option<CornerSet> {
        let corners = self.detector.detect(&frame.image, &self.pattern);
        self.state = if corners.is_some() {
            EstimatorState::PatternFound
        } else {
            log::trace!("frame {}: pattern not found", frame.index);
            EstimatorState::PatternNotFound
        };
        corners
    }

    /// Solve the camera pose for a detected corner set.
    pub fn solve_pose(&mut self, corners: &CornerSet) -> Result<PosePair, PoseSolveError> {
        let world = self.pattern.selected_world_points();
        match self.solver.solve(&world, &corners.selected, &self.intrinsics) {
            Ok(extrinsics) => {
                self.state = EstimatorState::PoseSolved;
                log::trace!("pose solved, rms {:.3}px", extrinsics.rms);
                Ok(PosePair::from_extrinsics(
                    extrinsics.rotation.matrix(),
                    &extrinsics.translation,
                ))
            }
            Err(e) => {
                self.state = EstimatorState::PatternNotFound;
                log::debug!("pose solve failed: {}", e);
                Err(e)
            }
        }
    }

    /// Release the device. Idempotent.
    pub fn release(&mut self) {
        if self.state != EstimatorState::Released {
            self.source.release();
            self.state = EstimatorState::Released;
        }
    }

    pub fn is_released(&self) -> bool {
        self.state == EstimatorState::Released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{render_board, BoardView, ScriptedSource};
    use image::RgbImage;
    use std::sync::atomic::Ordering;

    fn estimator_for(view: &BoardView, source: ScriptedSource) -> PoseEstimator<ScriptedSource> {
        let pattern = CalibrationPattern::new(view.cols, view.rows, view.square_size, (20..50).collect());
        PoseEstimator::with_parts(source, pattern, view.intrinsics)
    }

    #[test]
    fn test_full_cycle_recovers_camera_position() {
        let view = BoardView::frontal();
        let source = ScriptedSource::new((view.width, view.height)).push_frame(render_board(&view));
        let mut estimator = estimator_for(&view, source);
        assert_eq!(estimator.state(), EstimatorState::Idle);

        let frame = estimator.capture().unwrap();
        assert_eq!(frame.index, 0);
        let corners = estimator.detect_pattern(&frame).expect("pattern");
        assert_eq!(estimator.state(), EstimatorState::PatternFound);
        assert_eq!(corners.len(), 30);

        let poses = estimator.solve_pose(&corners).unwrap();
        assert_eq!(estimator.state(), EstimatorState::PoseSolved);

        let expected = -(view.rotation.inverse() * view.translation);
        let position = poses.vision.translation();
        assert!((position - expected).norm() < 2e-3, "{} vs {}", position, expected);
        assert_eq!(poses.render, poses.vision.to_render());
    }

    #[test]
    fn test_blank_frame_is_not_found() {
        let view = BoardView::frontal();
        let blank = RgbImage::from_pixel(view.width, view.height, image::Rgb([128, 128, 128]));
        let source = ScriptedSource::new((view.width, view.height)).push_frame(blank);
        let mut estimator = estimator_for(&view, source);

        let frame = estimator.capture().unwrap();
        assert!(estimator.detect_pattern(&frame).is_none());
        assert_eq!(estimator.state(), EstimatorState::PatternNotFound);
    }

    #[test]
    fn test_capture_error_and_release() {
        let view = BoardView::frontal();
        let source = ScriptedSource::new((view.width, view.height));
        let releases = source.release_counter();
        let mut estimator = estimator_for(&view, source);

        assert!(matches!(estimator.capture(), Err(CaptureError::EndOfStream)));

        estimator.release();
        estimator.release();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert!(estimator.is_released());
        assert!(matches!(estimator.capture(), Err(CaptureError::Released)));
    }

    #[test]
    fn test_intrinsics_follow_source_resolution() {
        let source = ScriptedSource::new((640, 480));
        let estimator = PoseEstimator::new(source, &AppConfig::default());
        assert_eq!(estimator.intrinsics().cx, 320.0);
        assert_eq!(estimator.intrinsics().cy, 240.0);
        assert_eq!(estimator.intrinsics().fx, 1400.0);
    }
}
