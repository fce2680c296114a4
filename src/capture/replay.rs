//! Replay of recorded frames from a directory of still images.

use std::path::{Path, PathBuf};

use image::RgbImage;

use super::{CaptureError, FrameSource};

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "tif"];

/// Plays a directory of images, sorted by file name, as if it were a camera.
pub struct ReplaySource {
    frames: Vec<PathBuf>,
    next: usize,
    looping: bool,
    resolution: (u32, u32),
    released: bool,
}

impl ReplaySource {
    /// Open a directory of frames.
    ///
    /// The first frame is decoded up front to learn the resolution, so an
    /// empty or unreadable directory fails here rather than on first read.
    pub fn open(dir: &Path, looping: bool) -> Result<Self, CaptureError> {
        let mut frames: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        frames.sort();

        let first = frames.first().ok_or_else(|| {
            CaptureError::NoData(format!("no image frames in {}", dir.display()))
        })?;
        let resolution = image::image_dimensions(first)?;

        log::info!(
            "Replay source opened: {} frames from {} ({}x{}{})",
            frames.len(),
            dir.display(),
            resolution.0,
            resolution.1,
            if looping { ", looping" } else { "" }
        );

        Ok(Self {
            frames,
            next: 0,
            looping,
            resolution,
            released: false,
        })
    }

    /// Number of frames in the sequence.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl FrameSource for ReplaySource {
    fn read_frame(&mut self) -> Result<RgbImage, CaptureError> {
        if self.released {
            return Err(CaptureError::Released);
        }
        if self.next >= self.frames.len() {
            if !self.looping {
                return Err(CaptureError::EndOfStream);
            }
            self.next = 0;
        }
        let path = &self.frames[self.next];
        self.next += 1;
        Ok(image::open(path)?.to_rgb8())
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn release(&mut self) {
        if !self.released {
            log::debug!("Replay source released");
        }
        self.released = true;
    }

    fn is_released(&self) -> bool {
        self.released
    }
}
