//! Shared fixtures for unit tests: synthetic chessboard frames and stub
//! pipeline collaborators.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use image::{Rgb, RgbImage};
use nalgebra::{Point2, Point3, Rotation3, Vector3};

use crate::capture::{CaptureError, FrameSource};
use crate::pose::{CalibrationPattern, CameraIntrinsics, RenderPose};
use crate::render::{RenderError, SceneRenderer};

/// Project world points through `x_cam = R x + t` and the pinhole model.
pub fn project_points(
    intrinsics: &CameraIntrinsics,
    rotation: &Rotation3<f64>,
    translation: &Vector3<f64>,
    world: &[Point3<f64>],
) -> Vec<Point2<f64>> {
    world
        .iter()
        .map(|p| intrinsics.project(&Point3::from(rotation * p.coords + translation)))
        .collect()
}

/// Camera and board geometry for a synthetic frame.
#[derive(Debug, Clone)]
pub struct BoardView {
    pub width: u32,
    pub height: u32,
    pub intrinsics: CameraIntrinsics,
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
    pub cols: usize,
    pub rows: usize,
    pub square_size: f64,
}

impl BoardView {
    /// A 10x7 board, 20 mm squares, nearly facing a 640x480 camera from 0.5 m.
    pub fn frontal() -> Self {
        let mut view = Self {
            width: 640,
            height: 480,
            intrinsics: CameraIntrinsics::new(800.0, 800.0, 320.0, 240.0),
            rotation: Rotation3::from_euler_angles(0.05, -0.04, 0.03),
            translation: Vector3::zeros(),
            cols: 10,
            rows: 7,
            square_size: 0.02,
        };
        view.translation = view.translation_for_center(Vector3::new(0.0, 0.0, 0.5));
        view
    }

    pub fn pattern(&self) -> CalibrationPattern {
        CalibrationPattern::full(self.cols, self.rows, self.square_size)
    }

    /// Translation that puts the board centre at `center_in_camera`.
    pub fn translation_for_center(&self, center_in_camera: Vector3<f64>) -> Vector3<f64> {
        center_in_camera - self.rotation * self.pattern().center().coords
    }
}

/// Checker colour at a board-plane point, or `None` off the printed board.
fn board_color(view: &BoardView, x: f64, y: f64) -> Option<f64> {
    let a = (x / view.square_size).floor() as i64;
    let b = (y / view.square_size).floor() as i64;
    // inner corners sit between squares -1..=cols-1
    if a < -1 || b < -1 || a > view.cols as i64 - 1 || b > view.rows as i64 - 1 {
        return None;
    }
    Some(if (a + b).rem_euclid(2) == 0 { 15.0 } else { 240.0 })
}

/// Ray-trace the board into an image with 2x2 supersampling.
pub fn render_board(view: &BoardView) -> RgbImage {
    let k = &view.intrinsics;
    let normal = view.rotation * Vector3::z();
    let plane_d = normal.dot(&view.translation);
    let r_inv = view.rotation.inverse();

    RgbImage::from_fn(view.width, view.height, |u, v| {
        let mut acc = 0.0;
        for (ox, oy) in [(-0.25, -0.25), (0.25, -0.25), (-0.25, 0.25), (0.25, 0.25)] {
            let dir = Vector3::new(
                (u as f64 + ox - k.cx) / k.fx,
                (v as f64 + oy - k.cy) / k.fy,
                1.0,
            );
            let denom = normal.dot(&dir);
            let shade = if denom.abs() < 1e-12 {
                250.0
            } else {
                let lambda = plane_d / denom;
                if lambda <= 0.0 {
                    250.0
                } else {
                    let w = r_inv * (dir * lambda - view.translation);
                    board_color(view, w.x, w.y).unwrap_or(250.0)
                }
            };
            acc += shade;
        }
        let value = (acc / 4.0).round() as u8;
        Rgb([value, value, value])
    })
}

/// Frame source that replays a fixed queue of results, then reports end of stream.
pub struct ScriptedSource {
    frames: VecDeque<Result<RgbImage, CaptureError>>,
    resolution: (u32, u32),
    released: Arc<AtomicUsize>,
    is_released: bool,
    repeat_last: Option<RgbImage>,
}

impl ScriptedSource {
    pub fn new(resolution: (u32, u32)) -> Self {
        Self {
            frames: VecDeque::new(),
            resolution,
            released: Arc::new(AtomicUsize::new(0)),
            is_released: false,
            repeat_last: None,
        }
    }

    pub fn push_frame(mut self, frame: RgbImage) -> Self {
        self.frames.push_back(Ok(frame));
        self
    }

    pub fn push_error(mut self, error: CaptureError) -> Self {
        self.frames.push_back(Err(error));
        self
    }

    /// Keep returning this frame once the queue is empty.
    pub fn repeat(mut self, frame: RgbImage) -> Self {
        self.repeat_last = Some(frame);
        self
    }

    /// Counts calls to `release`.
    pub fn release_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.released)
    }
}

impl FrameSource for ScriptedSource {
    fn read_frame(&mut self) -> Result<RgbImage, CaptureError> {
        if self.is_released {
            return Err(CaptureError::Released);
        }
        if let Some(next) = self.frames.pop_front() {
            return next;
        }
        match &self.repeat_last {
            Some(frame) => Ok(frame.clone()),
            None => Err(CaptureError::EndOfStream),
        }
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn release(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.is_released = true;
    }

    fn is_released(&self) -> bool {
        self.is_released
    }
}

/// Renderer that returns flat images and counts calls.
pub struct StubRenderer {
    pub size: (u32, u32),
    pub fail_after: Option<usize>,
    pub calls: Arc<AtomicUsize>,
    pub cleanups: Arc<AtomicUsize>,
}

impl StubRenderer {
    pub fn new(size: (u32, u32)) -> Self {
        Self {
            size,
            fail_after: None,
            calls: Arc::new(AtomicUsize::new(0)),
            cleanups: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn image(&self, value: u8) -> Result<RgbImage, RenderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_after.is_some_and(|limit| n >= limit) {
            return Err(RenderError::Device("stub failure".to_string()));
        }
        Ok(RgbImage::from_pixel(self.size.0, self.size.1, Rgb([value, value, value])))
    }
}

impl SceneRenderer for StubRenderer {
    fn render_tooth(&mut self, _pose: &RenderPose) -> Result<RgbImage, RenderError> {
        self.image(10)
    }

    fn render_camera_composite(&mut self, _pose: &RenderPose) -> Result<RgbImage, RenderError> {
        self.image(20)
    }

    fn render_chessboard(&mut self, _pose: &RenderPose) -> Result<RgbImage, RenderError> {
        self.image(30)
    }

    fn cleanup(&mut self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}
