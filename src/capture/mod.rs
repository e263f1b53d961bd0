//! Still-frame capture.
//!
//! A `FrameSource` opens its device, lets the sensor settle, grabs exactly one
//! frame and releases the device before returning. Nothing is held between
//! calls, so a failed run cannot leak the device into the next one.
//!
//! A `FrameSink` writes that frame to the fixed image path the classifier
//! reads from.

#[cfg(feature = "ingest-v4l2")]
mod normalize;
mod stub;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::emotion::PipelineError;

pub use stub::StubCamera;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::{V4l2Camera, V4l2Config};

/// Pause between opening a device and reading from it so auto-exposure and
/// focus can settle. Not configurable.
pub const WARM_UP_DELAY: Duration = Duration::from_secs(1);

/// Channels per pixel in a `CapturedFrame` (packed RGB8).
pub const FRAME_CHANNELS: u32 = 3;

/// One RGB8 still, owned by the run that captured it.
pub struct CapturedFrame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl CapturedFrame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = width
            .checked_mul(height)
            .and_then(|v| v.checked_mul(FRAME_CHANNELS))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))? as usize;
        if pixels.len() != expected {
            return Err(anyhow!(
                "frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
        })
    }

    pub fn channels(&self) -> u32 {
        FRAME_CHANNELS
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

/// Camera capability used by the pipeline.
pub trait FrameSource: Send + Sync {
    /// Source identifier for logs.
    fn name(&self) -> &str;

    /// Capture a single frame. Must release the device on every path.
    ///
    /// Returns `DeviceUnavailable` when the device cannot be opened and
    /// `CaptureFailed` when it opened but produced no usable frame.
    fn capture_frame(&self) -> Result<CapturedFrame, PipelineError>;
}

/// Builds the frame source for a configured device string.
///
/// `stub://...` yields a synthetic camera; anything else is a V4L2 device
/// path and requires the `ingest-v4l2` feature.
pub fn camera_from_config(device: &str, width: u32, height: u32) -> Result<Box<dyn FrameSource>> {
    if device.starts_with("stub://") {
        return Ok(Box::new(StubCamera::new(device, width, height)));
    }
    #[cfg(feature = "ingest-v4l2")]
    {
        Ok(Box::new(V4l2Camera::new(V4l2Config {
            device: device.to_string(),
            width,
            height,
        })))
    }
    #[cfg(not(feature = "ingest-v4l2"))]
    {
        log::warn!(
            "camera device '{}' requires the ingest-v4l2 feature; every capture will fail",
            device
        );
        Ok(Box::new(UnavailableCamera {
            device: device.to_string(),
        }))
    }
}

/// Stand-in for a device this build cannot drive. Every capture reports
/// `DeviceUnavailable`, so runs end in `error` instead of the process failing.
#[cfg(not(feature = "ingest-v4l2"))]
struct UnavailableCamera {
    device: String,
}

#[cfg(not(feature = "ingest-v4l2"))]
impl FrameSource for UnavailableCamera {
    fn name(&self) -> &str {
        &self.device
    }

    fn capture_frame(&self) -> Result<CapturedFrame, PipelineError> {
        Err(PipelineError::device_unavailable(format!(
            "{}: built without the ingest-v4l2 feature",
            self.device
        )))
    }
}

// -------------------- Frame Sink --------------------

pub trait FrameSink: Send + Sync {
    /// Path the frame is written to and the classifier reads from.
    fn image_path(&self) -> &Path;

    /// Overwrite the image at `image_path`. No retry.
    fn save_frame(&self, frame: &CapturedFrame) -> Result<(), PipelineError>;
}

/// Writes frames with the `image` crate; the format follows the extension.
pub struct JpegFileSink {
    path: PathBuf,
}

impl JpegFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FrameSink for JpegFileSink {
    fn image_path(&self) -> &Path {
        &self.path
    }

    fn save_frame(&self, frame: &CapturedFrame) -> Result<(), PipelineError> {
        let image = image::RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
            .ok_or_else(|| PipelineError::persist_failed("frame buffer does not match dimensions"))?;
        image.save(&self.path).map_err(|err| {
            PipelineError::persist_failed(format!("write {}: {}", self.path.display(), err))
        })?;
        log::debug!(
            "saved {}x{} frame to {}",
            frame.width,
            frame.height,
            self.path.display()
        );
        Ok(())
    }
}
