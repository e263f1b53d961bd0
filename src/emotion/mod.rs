//! Emotion decision pipeline.
//!
//! - `gate`: screen-state check that short-circuits the run
//! - `decision`: the sad-threshold correction
//! - `pipeline`: orchestration from capture to the result store
//!
//! Every stage reports failures as `PipelineError`. Only the orchestration
//! layer turns them into the `"error"` sentinel.

mod decision;
mod gate;
mod pipeline;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;

pub use decision::{apply_threshold, DEFAULT_SAD_THRESHOLD};
pub use gate::is_screen_on;
pub use pipeline::{EmotionPipeline, PipelineSettings};

/// Sentinel written when the pipeline fails anywhere.
pub const ERROR_SENTINEL: &str = "error";
/// Sentinel written when the capture gate is closed.
pub const SCREEN_OFF_SENTINEL: &str = "Screen operation is off";

// -------------------- Labels --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EmotionLabel {
    Angry,
    Disgust,
    Fear,
    Happy,
    Sad,
    Surprise,
    Neutral,
}

impl EmotionLabel {
    /// Classifier output order used by the bundled model backends.
    pub const ALL: [EmotionLabel; 7] = [
        EmotionLabel::Angry,
        EmotionLabel::Disgust,
        EmotionLabel::Fear,
        EmotionLabel::Happy,
        EmotionLabel::Sad,
        EmotionLabel::Surprise,
        EmotionLabel::Neutral,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EmotionLabel::Angry => "angry",
            EmotionLabel::Disgust => "disgust",
            EmotionLabel::Fear => "fear",
            EmotionLabel::Happy => "happy",
            EmotionLabel::Sad => "sad",
            EmotionLabel::Surprise => "surprise",
            EmotionLabel::Neutral => "neutral",
        }
    }
}

impl fmt::Display for EmotionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmotionLabel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim().to_lowercase();
        EmotionLabel::ALL
            .into_iter()
            .find(|label| label.as_str() == token)
            .ok_or_else(|| anyhow!("unknown emotion label '{}'", s))
    }
}

/// Label -> probability on the 0..=100 scale. Values need not sum to 100.
pub type EmotionProbabilities = BTreeMap<EmotionLabel, f32>;

// -------------------- Results --------------------

/// The single durable output of the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmotionResult {
    Label(EmotionLabel),
    Error,
    ScreenOff,
}

impl EmotionResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmotionResult::Label(label) => label.as_str(),
            EmotionResult::Error => ERROR_SENTINEL,
            EmotionResult::ScreenOff => SCREEN_OFF_SENTINEL,
        }
    }
}

impl Default for EmotionResult {
    fn default() -> Self {
        EmotionResult::Label(EmotionLabel::Neutral)
    }
}

impl fmt::Display for EmotionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmotionResult {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed == ERROR_SENTINEL {
            return Ok(EmotionResult::Error);
        }
        if trimmed == SCREEN_OFF_SENTINEL {
            return Ok(EmotionResult::ScreenOff);
        }
        Ok(EmotionResult::Label(trimmed.parse()?))
    }
}

// -------------------- Failures --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    DeviceUnavailable,
    CaptureFailed,
    PersistFailed,
    ClassificationFailed,
    StateReadFailed,
}

impl FailureKind {
    fn code(self) -> &'static str {
        match self {
            FailureKind::DeviceUnavailable => "DEVICE_UNAVAILABLE",
            FailureKind::CaptureFailed => "CAPTURE_FAILED",
            FailureKind::PersistFailed => "PERSIST_FAILED",
            FailureKind::ClassificationFailed => "CLASSIFICATION_FAILED",
            FailureKind::StateReadFailed => "STATE_READ_FAILED",
        }
    }
}

/// Stage-local failure carried back to the orchestration boundary.
#[derive(Clone, Debug)]
pub struct PipelineError {
    pub kind: FailureKind,
    pub detail: String,
}

impl PipelineError {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn device_unavailable(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::DeviceUnavailable, detail)
    }

    pub fn capture_failed(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::CaptureFailed, detail)
    }

    pub fn persist_failed(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::PersistFailed, detail)
    }

    pub fn classification_failed(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::ClassificationFailed, detail)
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.detail)
    }
}

impl std::error::Error for PipelineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_parse_case_insensitively() -> anyhow::Result<()> {
        assert_eq!("Sad".parse::<EmotionLabel>()?, EmotionLabel::Sad);
        assert_eq!(" surprise ".parse::<EmotionLabel>()?, EmotionLabel::Surprise);
        assert!("contempt".parse::<EmotionLabel>().is_err());
        Ok(())
    }

    #[test]
    fn results_round_trip_through_their_tokens() -> anyhow::Result<()> {
        for result in [
            EmotionResult::Label(EmotionLabel::Fear),
            EmotionResult::Error,
            EmotionResult::ScreenOff,
        ] {
            assert_eq!(result.as_str().parse::<EmotionResult>()?, result);
        }
        Ok(())
    }

    #[test]
    fn pipeline_error_display_names_the_kind() {
        let err = PipelineError::device_unavailable("/dev/video0 busy");
        assert_eq!(err.to_string(), "DEVICE_UNAVAILABLE: /dev/video0 busy");
    }
}
