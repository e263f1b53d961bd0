//! V4L2 still-frame source.
//!
//! Each `capture_frame` call:
//! 1. Opens the device node (e.g., /dev/video0)
//! 2. Negotiates RGB3, accepting YUYV or MJPG when the driver refuses
//! 3. Waits `WARM_UP_DELAY`
//! 4. Dequeues one buffer and converts it to RGB8
//!
//! The device and its buffer stream are locals of that call, so they are
//! released on every return path.

use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;

use super::normalize::{normalize_to_rgb, PixelFormat};
use crate::capture::{CapturedFrame, FrameSource, WARM_UP_DELAY};
use crate::emotion::PipelineError;

const STREAM_BUFFERS: u32 = 2;

/// Configuration for a V4L2 camera.
#[derive(Clone, Debug)]
pub struct V4l2Config {
    /// Device path (e.g., "/dev/video0")
    pub device: String,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
        }
    }
}

pub struct V4l2Camera {
    config: V4l2Config,
}

impl V4l2Camera {
    pub fn new(config: V4l2Config) -> Self {
        Self { config }
    }

    fn negotiate_format(&self, device: &mut v4l::Device) -> Result<v4l::Format, PipelineError> {
        let mut format = device.format().map_err(|err| {
            PipelineError::device_unavailable(format!(
                "read format of {}: {}",
                self.config.device, err
            ))
        })?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        match device.set_format(&format) {
            Ok(format) => Ok(format),
            Err(err) => {
                log::warn!(
                    "V4l2Camera: failed to set format on {}: {}",
                    self.config.device,
                    err
                );
                device.format().map_err(|err| {
                    PipelineError::device_unavailable(format!(
                        "read format of {} after set failure: {}",
                        self.config.device, err
                    ))
                })
            }
        }
    }
}

impl FrameSource for V4l2Camera {
    fn name(&self) -> &str {
        &self.config.device
    }

    fn capture_frame(&self) -> Result<CapturedFrame, PipelineError> {
        let mut device = v4l::Device::with_path(&self.config.device).map_err(|err| {
            PipelineError::device_unavailable(format!("open {}: {}", self.config.device, err))
        })?;
        let format = self.negotiate_format(&mut device)?;
        let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            PipelineError::capture_failed(format!(
                "unsupported pixel format {} on {}",
                format.fourcc, self.config.device
            ))
        })?;

        let mut stream =
            v4l::prelude::MmapStream::with_buffers(&mut device, Type::VideoCapture, STREAM_BUFFERS)
                .map_err(|err| {
                    PipelineError::device_unavailable(format!(
                        "create buffer stream on {}: {}",
                        self.config.device, err
                    ))
                })?;

        std::thread::sleep(WARM_UP_DELAY);

        let (buf, meta) = stream.next().map_err(|err| {
            PipelineError::capture_failed(format!(
                "no frame from {}: {}",
                self.config.device, err
            ))
        })?;
        let used = if meta.bytesused > 0 {
            (meta.bytesused as usize).min(buf.len())
        } else {
            buf.len()
        };
        if used == 0 {
            return Err(PipelineError::capture_failed(format!(
                "empty buffer from {}",
                self.config.device
            )));
        }

        let (pixels, width, height) =
            normalize_to_rgb(&buf[..used], format.width, format.height, pixel_format)
                .map_err(|err| PipelineError::capture_failed(err.to_string()))?;

        log::info!(
            "V4l2Camera: captured {}x{} frame from {} ({:?})",
            width,
            height,
            self.config.device,
            pixel_format
        );
        CapturedFrame::new(pixels, width, height)
            .map_err(|err| PipelineError::capture_failed(err.to_string()))
    }
}
