use std::path::Path;

use anyhow::{anyhow, Result};

use crate::classify::{EmotionBackend, FaceEmotion};

/// Scripted backend for tests and camera-less setups.
///
/// The default instance never finds a face.
#[derive(Default)]
pub struct StubBackend {
    faces: Vec<FaceEmotion>,
    failure: Option<String>,
}

impl StubBackend {
    pub fn new(faces: Vec<FaceEmotion>) -> Self {
        Self {
            faces,
            failure: None,
        }
    }

    /// A backend whose every call fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            faces: Vec::new(),
            failure: Some(message.to_string()),
        }
    }
}

impl EmotionBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn analyze(&self, _image_path: &Path) -> Result<Vec<FaceEmotion>> {
        if let Some(message) = &self.failure {
            return Err(anyhow!("{}", message));
        }
        Ok(self.faces.clone())
    }
}
