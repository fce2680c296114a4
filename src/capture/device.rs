//! Physical camera capture via nokhwa.
//!
//! nokhwa camera handles cannot move between threads, so the handle lives on
//! a small device thread and frames are read on request. Only one request is
//! ever in flight: the caller still sees a plain synchronous read.

use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use image::RgbImage;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
};
use nokhwa::Camera;

use super::{CaptureError, FrameSource};

enum DeviceCommand {
    Read,
    Release,
}

/// Camera opened once for the session at a fixed MJPEG format.
pub struct CameraDevice {
    command_tx: Sender<DeviceCommand>,
    frame_rx: Receiver<Result<RgbImage, CaptureError>>,
    thread_handle: Option<JoinHandle<()>>,
    resolution: (u32, u32),
    released: bool,
}

impl CameraDevice {
    /// Open the camera at `index` with the requested resolution and frame rate.
    pub fn open(index: u32, width: u32, height: u32, fps: u32) -> Result<Self, CaptureError> {
        let (command_tx, command_rx) = bounded::<DeviceCommand>(1);
        let (frame_tx, frame_rx) = bounded::<Result<RgbImage, CaptureError>>(1);
        let (ready_tx, ready_rx) = bounded::<Result<(u32, u32), CaptureError>>(1);

        let thread_handle = std::thread::Builder::new()
            .name("camera-device".to_string())
            .spawn(move || {
                Self::device_thread(index, width, height, fps, command_rx, frame_tx, ready_tx);
            })
            .map_err(|e| CaptureError::Open {
                index,
                reason: format!("failed to spawn device thread: {}", e),
            })?;

        let resolution = ready_rx.recv().map_err(|_| CaptureError::Open {
            index,
            reason: "device thread exited during open".to_string(),
        })??;

        Ok(Self {
            command_tx,
            frame_rx,
            thread_handle: Some(thread_handle),
            resolution,
            released: false,
        })
    }

    fn open_camera(index: u32, width: u32, height: u32, fps: u32) -> Result<Camera, CaptureError> {
        let format = CameraFormat::new(Resolution::new(width, height), FrameFormat::MJPEG, fps);
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(format));

        let mut camera = Camera::new(CameraIndex::Index(index), requested).map_err(|e| {
            CaptureError::Open {
                index,
                reason: e.to_string(),
            }
        })?;
        camera.open_stream().map_err(|e| CaptureError::Open {
            index,
            reason: e.to_string(),
        })?;

        log::info!(
            "Camera opened: {} ({}x{} @ {} fps, requested {}x{} @ {})",
            camera.info().human_name(),
            camera.resolution().width(),
            camera.resolution().height(),
            camera.frame_rate(),
            width,
            height,
            fps
        );
        Ok(camera)
    }

    fn device_thread(
        index: u32,
        width: u32,
        height: u32,
        fps: u32,
        command_rx: Receiver<DeviceCommand>,
        frame_tx: Sender<Result<RgbImage, CaptureError>>,
        ready_tx: Sender<Result<(u32, u32), CaptureError>>,
    ) {
        let mut camera = match Self::open_camera(index, width, height, fps) {
            Ok(camera) => {
                let res = camera.resolution();
                let _ = ready_tx.send(Ok((res.width(), res.height())));
                camera
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

        while let Ok(command) = command_rx.recv() {
            match command {
                DeviceCommand::Read => {
                    if frame_tx.send(Self::read_one(&mut camera)).is_err() {
                        break;
                    }
                }
                DeviceCommand::Release => break,
            }
        }

        if let Err(e) = camera.stop_stream() {
            log::warn!("Failed to stop camera stream: {}", e);
        }
        log::info!("Camera device released");
    }

    fn read_one(camera: &mut Camera) -> Result<RgbImage, CaptureError> {
        let buffer = camera
            .frame()
            .map_err(|e| CaptureError::NoData(e.to_string()))?;
        let decoded = buffer
            .decode_image::<RgbFormat>()
            .map_err(|e| CaptureError::Decode(e.to_string()))?;
        let (w, h) = (decoded.width(), decoded.height());
        RgbImage::from_raw(w, h, decoded.into_raw())
            .ok_or_else(|| CaptureError::Decode(format!("buffer does not match {}x{}", w, h)))
    }
}

impl FrameSource for CameraDevice {
    fn read_frame(&mut self) -> Result<RgbImage, CaptureError> {
        if self.released {
            return Err(CaptureError::Released);
        }
        self.command_tx
            .send(DeviceCommand::Read)
            .map_err(|_| CaptureError::NoData("device thread stopped".to_string()))?;
        self.frame_rx
            .recv()
            .map_err(|_| CaptureError::NoData("device thread stopped".to_string()))?
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let _ = self.command_tx.send(DeviceCommand::Release);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for CameraDevice {
    fn drop(&mut self) {
        self.release();
    }
}
