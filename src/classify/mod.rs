//! Emotion classifier boundary.
//!
//! The actual face/emotion model is an external capability behind
//! `EmotionBackend`. `ClassifierAdapter` is the only caller: it bounds the
//! backend with a timeout, maps "no faces" to `neutral`, and turns every
//! backend failure into `ClassificationFailed`.

mod command;
mod stub;
#[cfg(feature = "backend-tract")]
mod tract;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::config::ClassifierSettings;
use crate::emotion::{EmotionLabel, EmotionProbabilities, PipelineError};

pub use command::CommandBackend;
pub use stub::StubBackend;
#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;

/// Per-face classifier output, in the DeepFace result shape.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FaceEmotion {
    pub dominant_emotion: String,
    /// Label -> probability on the 0..=100 scale.
    pub emotion: BTreeMap<String, f32>,
}

impl FaceEmotion {
    pub fn new(dominant: EmotionLabel, probabilities: &[(EmotionLabel, f32)]) -> Self {
        Self {
            dominant_emotion: dominant.as_str().to_string(),
            emotion: probabilities
                .iter()
                .map(|(label, p)| (label.as_str().to_string(), *p))
                .collect(),
        }
    }
}

/// Face/emotion classifier backend.
///
/// Backends receive only a path to a still image. An empty vector means no
/// face was found; errors are reserved for the backend itself failing.
pub trait EmotionBackend: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Classify every face found in the image at `image_path`.
    fn analyze(&self, image_path: &Path) -> Result<Vec<FaceEmotion>>;
}

/// Adapter output: the dominant label plus the probabilities it came with.
#[derive(Clone, Debug, PartialEq)]
pub struct Classification {
    pub dominant: EmotionLabel,
    pub probabilities: EmotionProbabilities,
}

pub struct ClassifierAdapter {
    backend: Arc<dyn EmotionBackend>,
    timeout: Duration,
    in_flight: Mutex<Option<JoinHandle<()>>>,
}

impl ClassifierAdapter {
    pub fn new(backend: Arc<dyn EmotionBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            timeout,
            in_flight: Mutex::new(None),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Runs the backend on a worker thread and waits at most `timeout`.
    ///
    /// A backend that overruns is abandoned and its late result discarded.
    /// Until that worker exits, further calls fail without starting another
    /// one, so at most one backend call is ever running.
    pub fn analyze(&self, image_path: &Path) -> Result<Classification, PipelineError> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if in_flight.as_ref().is_some_and(|worker| !worker.is_finished()) {
            return Err(PipelineError::classification_failed(format!(
                "{}: previous classification still running",
                self.backend.name()
            )));
        }
        if let Some(worker) = in_flight.take() {
            let _ = worker.join();
        }

        let backend = self.backend.clone();
        let path = image_path.to_path_buf();
        let (tx, rx) = mpsc::channel();
        let worker = std::thread::Builder::new()
            .name("emotion-classifier".to_string())
            .spawn(move || {
                let _ = tx.send(backend.analyze(&path));
            })
            .map_err(|err| {
                PipelineError::classification_failed(format!("spawn classifier: {}", err))
            })?;
        *in_flight = Some(worker);

        let received = rx.recv_timeout(self.timeout);
        if !matches!(received, Err(RecvTimeoutError::Timeout)) {
            // The worker has sent or died; reap it so the next call can start.
            if let Some(worker) = in_flight.take() {
                let _ = worker.join();
            }
        }
        drop(in_flight);

        let faces = match received {
            Ok(Ok(faces)) => faces,
            Ok(Err(err)) => {
                return Err(PipelineError::classification_failed(format!(
                    "{}: {:#}",
                    self.backend.name(),
                    err
                )))
            }
            Err(RecvTimeoutError::Timeout) => {
                return Err(PipelineError::classification_failed(format!(
                    "{} timed out after {:?}",
                    self.backend.name(),
                    self.timeout
                )))
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(PipelineError::classification_failed(format!(
                    "{} panicked",
                    self.backend.name()
                )))
            }
        };

        let Some(face) = faces.into_iter().next() else {
            log::info!("classifier found no face; reporting neutral");
            return Ok(Classification {
                dominant: EmotionLabel::Neutral,
                probabilities: EmotionProbabilities::new(),
            });
        };

        let dominant: EmotionLabel = face
            .dominant_emotion
            .parse()
            .map_err(|err: anyhow::Error| PipelineError::classification_failed(err.to_string()))?;
        let mut probabilities = EmotionProbabilities::new();
        for (name, probability) in &face.emotion {
            match name.parse::<EmotionLabel>() {
                Ok(label) => {
                    probabilities.insert(label, *probability);
                }
                Err(_) => log::debug!("ignoring classifier label '{}'", name),
            }
        }
        log::debug!("classifier probabilities: {:?}", probabilities);

        Ok(Classification {
            dominant,
            probabilities,
        })
    }
}

/// Builds the backend selected in configuration.
pub fn backend_from_config(settings: &ClassifierSettings) -> Result<Arc<dyn EmotionBackend>> {
    match settings.backend.as_str() {
        "stub" => Ok(Arc::new(StubBackend::default())),
        "command" => {
            let (program, args) = settings
                .command
                .split_first()
                .ok_or_else(|| anyhow!("classifier backend 'command' needs a command line"))?;
            Ok(Arc::new(CommandBackend::new(
                program,
                args.to_vec(),
                settings.timeout,
            )))
        }
        #[cfg(feature = "backend-tract")]
        "tract" => {
            let model_path = settings
                .model_path
                .as_ref()
                .ok_or_else(|| anyhow!("classifier backend 'tract' needs model_path"))?;
            Ok(Arc::new(TractBackend::new(model_path, settings.input_size)?))
        }
        #[cfg(not(feature = "backend-tract"))]
        "tract" => Err(anyhow!(
            "classifier backend 'tract' requires the backend-tract feature"
        )),
        other => Err(anyhow!("unknown classifier backend '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emotion::FailureKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowBackend;

    impl EmotionBackend for SlowBackend {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn analyze(&self, _image_path: &Path) -> Result<Vec<FaceEmotion>> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(vec![])
        }
    }

    struct PanickingBackend;

    impl EmotionBackend for PanickingBackend {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn analyze(&self, _image_path: &Path) -> Result<Vec<FaceEmotion>> {
            panic!("model crashed");
        }
    }

    fn adapter(backend: impl EmotionBackend + 'static) -> ClassifierAdapter {
        ClassifierAdapter::new(Arc::new(backend), Duration::from_secs(5))
    }

    #[test]
    fn no_faces_reports_neutral() -> anyhow::Result<()> {
        let result = adapter(StubBackend::default()).analyze(Path::new("unused.jpg"))?;
        assert_eq!(result.dominant, EmotionLabel::Neutral);
        assert!(result.probabilities.is_empty());
        Ok(())
    }

    #[test]
    fn first_face_wins_and_unknown_labels_are_dropped() -> anyhow::Result<()> {
        let mut first = FaceEmotion::new(EmotionLabel::Happy, &[(EmotionLabel::Happy, 91.0)]);
        first.emotion.insert("contempt".to_string(), 2.0);
        let second = FaceEmotion::new(EmotionLabel::Sad, &[(EmotionLabel::Sad, 80.0)]);
        let result = adapter(StubBackend::new(vec![first, second])).analyze(Path::new("x.jpg"))?;
        assert_eq!(result.dominant, EmotionLabel::Happy);
        assert_eq!(result.probabilities.len(), 1);
        Ok(())
    }

    #[test]
    fn unknown_dominant_label_fails_classification() {
        let face = FaceEmotion {
            dominant_emotion: "contempt".to_string(),
            emotion: BTreeMap::new(),
        };
        let err = adapter(StubBackend::new(vec![face]))
            .analyze(Path::new("x.jpg"))
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::ClassificationFailed);
    }

    #[test]
    fn backend_errors_become_classification_failures() {
        let err = adapter(StubBackend::failing("corrupt image"))
            .analyze(Path::new("x.jpg"))
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::ClassificationFailed);
        assert!(err.detail.contains("corrupt image"));
    }

    #[test]
    fn panics_become_classification_failures() {
        let err = adapter(PanickingBackend)
            .analyze(Path::new("x.jpg"))
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::ClassificationFailed);
    }

    #[test]
    fn slow_backends_time_out() {
        let adapter = ClassifierAdapter::new(Arc::new(SlowBackend), Duration::from_millis(50));
        let err = adapter.analyze(Path::new("x.jpg")).unwrap_err();
        assert_eq!(err.kind, FailureKind::ClassificationFailed);
        assert!(err.detail.contains("timed out"));
    }

    /// Sleeps, tracking how many calls overlap.
    struct OverlapBackend {
        active: Arc<AtomicUsize>,
        max: Arc<AtomicUsize>,
    }

    impl EmotionBackend for OverlapBackend {
        fn name(&self) -> &'static str {
            "overlap"
        }

        fn analyze(&self, _image_path: &Path) -> Result<Vec<FaceEmotion>> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![])
        }
    }

    #[test]
    fn timed_out_worker_blocks_the_next_call() {
        let active = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));
        let adapter = ClassifierAdapter::new(
            Arc::new(OverlapBackend {
                active: active.clone(),
                max: max.clone(),
            }),
            Duration::from_millis(50),
        );

        let err = adapter.analyze(Path::new("x.jpg")).unwrap_err();
        assert!(err.detail.contains("timed out"));

        let err = adapter.analyze(Path::new("x.jpg")).unwrap_err();
        assert_eq!(err.kind, FailureKind::ClassificationFailed);
        assert!(err.detail.contains("still running"));

        std::thread::sleep(Duration::from_millis(500));
        let err = adapter.analyze(Path::new("x.jpg")).unwrap_err();
        assert!(err.detail.contains("timed out"));
        assert_eq!(max.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_backend_name_is_rejected() {
        let settings = ClassifierSettings {
            backend: "deepdream".to_string(),
            ..ClassifierSettings::default()
        };
        assert!(backend_from_config(&settings).is_err());
    }
}
