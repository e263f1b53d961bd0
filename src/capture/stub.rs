use std::sync::atomic::{AtomicU64, Ordering};

use crate::capture::{CapturedFrame, FrameSource};
use crate::emotion::PipelineError;

/// Synthetic camera for `stub://` devices.
///
/// There is no sensor to settle, so no warm-up delay is applied.
pub struct StubCamera {
    device: String,
    width: u32,
    height: u32,
    frame_count: AtomicU64,
}

impl StubCamera {
    pub fn new(device: &str, width: u32, height: u32) -> Self {
        Self {
            device: device.to_string(),
            width,
            height,
            frame_count: AtomicU64::new(0),
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }

    fn generate_pixels(&self, frame_index: u64) -> Vec<u8> {
        let pixel_count = (self.width * self.height * 3) as usize;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + frame_index) % 256) as u8;
        }
        pixels
    }
}

impl FrameSource for StubCamera {
    fn name(&self) -> &str {
        &self.device
    }

    fn capture_frame(&self) -> Result<CapturedFrame, PipelineError> {
        let frame_index = self.frame_count.fetch_add(1, Ordering::Relaxed) + 1;
        let pixels = self.generate_pixels(frame_index);
        log::debug!("StubCamera: synthetic frame #{} from {}", frame_index, self.device);
        CapturedFrame::new(pixels, self.width, self.height)
            .map_err(|err| PipelineError::capture_failed(err.to_string()))
    }
}
