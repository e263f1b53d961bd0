//! Smart mirror companion
//!
//! This crate implements the local service behind a smart mirror display.
//!
//! # Architecture
//!
//! The service is a thin shell around one decision pipeline:
//!
//! 1. **Capture Gate**: the persisted screen state must read exactly `on`.
//! 2. **Frame Acquirer**: one still frame per run, device opened and released per call.
//! 3. **Frame Persister**: the frame is written to a fixed image path.
//! 4. **Classifier Adapter**: a pluggable backend labels the viewer's emotion.
//! 5. **Decision Rule**: a weak `sad` is demoted to `neutral`.
//! 6. **Result Store**: the final label or sentinel is the only output.
//!
//! Around it sit the user-settings document, a weather proxy, a happy-news
//! picker and a small HTTP API that serves the mirror page.
//!
//! # Module Structure
//!
//! - `emotion`: pipeline types, gate, decision rule, orchestration
//! - `capture`: frame sources and the frame sink
//! - `classify`: classifier backends and the adapter around them
//! - `state`: screen-state / result persistence behind `StateStore`
//! - `settings`, `weather`, `news`: the surrounding services
//! - `api`: HTTP surface

pub mod api;
pub mod capture;
pub mod classify;
pub mod config;
pub mod emotion;
pub mod news;
pub mod settings;
pub mod state;
pub mod weather;

pub use capture::{CapturedFrame, FrameSink, FrameSource, JpegFileSink, StubCamera};
pub use classify::{ClassifierAdapter, EmotionBackend, FaceEmotion, StubBackend};
pub use config::MirrorConfig;
pub use emotion::{
    apply_threshold, is_screen_on, EmotionLabel, EmotionPipeline, EmotionProbabilities,
    EmotionResult, FailureKind, PipelineError, PipelineSettings,
};
pub use news::{NewsEntry, NewsService};
pub use settings::{ChangeFeed, UserSettingsStore};
pub use state::{
    ensure_data_files, DataPaths, FileStateStore, InMemoryStateStore, ResultStore, ScreenState,
    StateKey, StateStore,
};
pub use weather::{WeatherError, WeatherService};

/// Service version reported by `/health`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
