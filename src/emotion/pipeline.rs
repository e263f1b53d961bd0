use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::capture::{camera_from_config, FrameSink, FrameSource, JpegFileSink};
use crate::classify::{backend_from_config, ClassifierAdapter};
use crate::config::MirrorConfig;
use crate::emotion::{
    apply_threshold, is_screen_on, EmotionLabel, EmotionResult, PipelineError,
    DEFAULT_SAD_THRESHOLD,
};
use crate::state::{FileStateStore, ResultStore, StateStore};

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    /// `sad` below this probability (0..=100) is reported as `neutral`.
    pub sad_threshold: f32,
    /// Abort with `error` when the frame cannot be written. When false the
    /// failure is logged and classification runs against whatever image is
    /// already at the fixed path.
    pub abort_on_persist_failure: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            sad_threshold: DEFAULT_SAD_THRESHOLD,
            abort_on_persist_failure: false,
        }
    }
}

/// Gate -> capture -> persist -> classify -> threshold -> result store.
///
/// Runs are serialized by an internal lock so two triggers never open the
/// camera at the same time.
pub struct EmotionPipeline {
    state: Arc<dyn StateStore>,
    results: ResultStore<dyn StateStore>,
    camera: Box<dyn FrameSource>,
    sink: Box<dyn FrameSink>,
    classifier: ClassifierAdapter,
    settings: PipelineSettings,
    run_lock: Mutex<()>,
}

impl EmotionPipeline {
    pub fn new(
        state: Arc<dyn StateStore>,
        camera: Box<dyn FrameSource>,
        sink: Box<dyn FrameSink>,
        classifier: ClassifierAdapter,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            results: ResultStore::new(state.clone()),
            state,
            camera,
            sink,
            classifier,
            settings,
            run_lock: Mutex::new(()),
        }
    }

    /// File-backed pipeline for the configured camera and classifier.
    pub fn from_config(cfg: &MirrorConfig) -> Result<Self> {
        let paths = cfg.data_paths();
        let camera = camera_from_config(&cfg.camera.device, cfg.camera.width, cfg.camera.height)?;
        let backend = backend_from_config(&cfg.classifier)?;
        log::info!(
            "emotion pipeline: camera={} classifier={} timeout={:?}",
            camera.name(),
            backend.name(),
            cfg.classifier.timeout
        );
        Ok(Self::new(
            Arc::new(FileStateStore::new(paths.clone())),
            camera,
            Box::new(JpegFileSink::new(paths.captured_image())),
            ClassifierAdapter::new(backend, cfg.classifier.timeout),
            cfg.emotion.pipeline_settings(),
        ))
    }

    pub fn results(&self) -> &ResultStore<dyn StateStore> {
        &self.results
    }

    pub fn state(&self) -> &Arc<dyn StateStore> {
        &self.state
    }

    /// Runs the pipeline once and persists the outcome.
    ///
    /// Never fails: every stage failure, and any panic inside a stage, is
    /// written as `"error"`. The returned value is what was written.
    pub fn run_once(&self) -> EmotionResult {
        let _guard = self
            .run_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.run_stages())) {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                log::error!("emotion pipeline failed: {}", err);
                EmotionResult::Error
            }
            Err(_) => {
                log::error!("emotion pipeline stage panicked");
                EmotionResult::Error
            }
        };

        if let Err(err) = self.results.save_result(&outcome) {
            log::error!("failed to store emotion result '{}': {:#}", outcome, err);
        } else {
            log::info!("emotion result: {}", outcome);
        }
        outcome
    }

    fn run_stages(&self) -> Result<EmotionResult, PipelineError> {
        if !is_screen_on(self.state.as_ref()) {
            log::info!("screen operation is off; skipping capture");
            return Ok(EmotionResult::ScreenOff);
        }

        let frame = self.camera.capture_frame()?;

        if let Err(err) = self.sink.save_frame(&frame) {
            if self.settings.abort_on_persist_failure {
                return Err(err);
            }
            log::warn!(
                "{}; classifying existing contents of {}",
                err,
                self.sink.image_path().display()
            );
        }
        drop(frame);

        let classification = self.classifier.analyze(self.sink.image_path())?;
        let label = apply_threshold(
            classification.dominant,
            &classification.probabilities,
            self.settings.sad_threshold,
        );
        if label != classification.dominant {
            log::info!(
                "sad at {:.1} is below threshold {:.1}; reporting neutral",
                classification
                    .probabilities
                    .get(&EmotionLabel::Sad)
                    .copied()
                    .unwrap_or(0.0),
                self.settings.sad_threshold
            );
        }
        Ok(EmotionResult::Label(label))
    }
}
