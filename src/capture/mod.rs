//! Frame capture module
//!
//! A [`FrameSource`] is the single owner of the capture device. The pipeline
//! worker pulls frames from it synchronously and never reads ahead, so a slow
//! iteration simply reads the next frame later.

#[cfg(feature = "camera")]
mod device;
mod replay;

#[cfg(feature = "camera")]
pub use device::CameraDevice;
pub use replay::ReplaySource;

use std::time::Instant;

use image::RgbImage;
use thiserror::Error;

/// Capture failures. All of them are fatal for the pipeline.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to open capture device {index}: {reason}")]
    Open { index: u32, reason: String },
    #[error("capture device returned no data: {0}")]
    NoData(String),
    #[error("failed to decode frame: {0}")]
    Decode(String),
    #[error("frame source exhausted")]
    EndOfStream,
    #[error("frame source already released")]
    Released,
    #[error("failed to read frame image: {0}")]
    Image(#[from] image::ImageError),
    #[error("failed to list frame directory: {0}")]
    Io(#[from] std::io::Error),
}

/// One captured RGB frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// RGB pixel data
    pub image: RgbImage,
    /// Monotonic frame number since the source was opened
    pub index: u64,
    /// Capture time
    pub timestamp: Instant,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// A capture device contract: opened once, read synchronously, released once.
pub trait FrameSource: Send {
    /// Read the next frame, blocking until the device delivers one.
    fn read_frame(&mut self) -> Result<RgbImage, CaptureError>;

    /// Resolution the device actually delivers.
    fn resolution(&self) -> (u32, u32);

    /// Release the device. Safe to call repeatedly.
    fn release(&mut self);

    /// Whether [`FrameSource::release`] has been called.
    fn is_released(&self) -> bool;
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn read_frame(&mut self) -> Result<RgbImage, CaptureError> {
        (**self).read_frame()
    }

    fn resolution(&self) -> (u32, u32) {
        (**self).resolution()
    }

    fn release(&mut self) {
        (**self).release()
    }

    fn is_released(&self) -> bool {
        (**self).is_released()
    }
}
