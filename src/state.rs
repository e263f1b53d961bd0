use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::emotion::EmotionResult;

const USER_SETTINGS_FILE: &str = "user_settings.json";
const EMOTION_FILE: &str = "emotion.txt";
const HAPPY_NEWS_FILE: &str = "happy_news.txt";
const SCREEN_OPERATION_FILE: &str = "screen_operation.txt";
const CAPTURED_IMAGE_FILE: &str = "captured_image.jpg";

/// Well-known file layout under the data directory.
#[derive(Clone, Debug)]
pub struct DataPaths {
    pub data_dir: PathBuf,
}

impl DataPaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn user_settings(&self) -> PathBuf {
        self.data_dir.join(USER_SETTINGS_FILE)
    }

    pub fn emotion(&self) -> PathBuf {
        self.data_dir.join(EMOTION_FILE)
    }

    pub fn happy_news(&self) -> PathBuf {
        self.data_dir.join(HAPPY_NEWS_FILE)
    }

    pub fn screen_operation(&self) -> PathBuf {
        self.data_dir.join(SCREEN_OPERATION_FILE)
    }

    pub fn captured_image(&self) -> PathBuf {
        self.data_dir.join(CAPTURED_IMAGE_FILE)
    }
}

/// Creates the data directory and seeds any missing state files.
///
/// The screen state defaults to `on` so the capture gate is not closed on a
/// fresh install.
pub fn ensure_data_files(paths: &DataPaths) -> Result<()> {
    std::fs::create_dir_all(&paths.data_dir)
        .with_context(|| format!("create data dir {}", paths.data_dir.display()))?;
    seed_if_missing(&paths.user_settings(), "{}")?;
    seed_if_missing(&paths.emotion(), EmotionResult::default().as_str())?;
    seed_if_missing(&paths.screen_operation(), ScreenState::On.as_str())?;
    Ok(())
}

fn seed_if_missing(path: &Path, contents: &str) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    std::fs::write(path, contents).with_context(|| format!("seed {}", path.display()))?;
    log::info!("created {} with default contents", path.display());
    Ok(())
}

// -------------------- Screen State --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScreenState {
    On,
    Off,
}

impl ScreenState {
    /// Anything other than exactly `on` (after trim + lowercase) is `Off`.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().to_lowercase() == "on" {
            ScreenState::On
        } else {
            ScreenState::Off
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScreenState::On => "on",
            ScreenState::Off => "off",
        }
    }
}

// -------------------- State Store --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StateKey {
    ScreenState,
    EmotionResult,
}

/// Small key/value store for the process-wide text state.
///
/// Implementations use interior mutability so one store can be shared between
/// the pipeline and the HTTP handlers.
pub trait StateStore: Send + Sync {
    /// Returns `Ok(None)` when the key has never been written.
    fn get(&self, key: StateKey) -> Result<Option<String>>;

    /// Replaces the stored value. No history is kept.
    fn set(&self, key: StateKey, value: &str) -> Result<()>;
}

/// Flat-file store, one file per key inside the data directory.
pub struct FileStateStore {
    paths: DataPaths,
}

impl FileStateStore {
    pub fn new(paths: DataPaths) -> Self {
        Self { paths }
    }

    fn path_for(&self, key: StateKey) -> PathBuf {
        match key {
            StateKey::ScreenState => self.paths.screen_operation(),
            StateKey::EmotionResult => self.paths.emotion(),
        }
    }
}

impl StateStore for FileStateStore {
    fn get(&self, key: StateKey) -> Result<Option<String>> {
        let path = self.path_for(key);
        match std::fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(anyhow!("failed to read {}: {}", path.display(), err)),
        }
    }

    fn set(&self, key: StateKey, value: &str) -> Result<()> {
        write_atomic(&self.path_for(key), value.as_bytes())
    }
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write-then-rename so a concurrent reader never sees a partial file.
///
/// Every call gets its own temp name, so concurrent writers cannot rename
/// each other's half-written file into place.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!(
        "tmp.{}.{}",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    if let Err(err) = std::fs::write(&tmp, contents) {
        let _ = std::fs::remove_file(&tmp);
        return Err(err).with_context(|| format!("write {}", tmp.display()));
    }
    if let Err(err) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(err).with_context(|| format!("replace {}", path.display()));
    }
    Ok(())
}

#[derive(Default)]
pub struct InMemoryStateStore {
    values: Mutex<HashMap<StateKey, String>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_screen_state(state: &str) -> Self {
        let store = Self::new();
        if let Ok(mut values) = store.values.lock() {
            values.insert(StateKey::ScreenState, state.to_string());
        }
        store
    }
}

impl StateStore for InMemoryStateStore {
    fn get(&self, key: StateKey) -> Result<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|_| anyhow!("state store lock poisoned"))?;
        Ok(values.get(&key).cloned())
    }

    fn set(&self, key: StateKey, value: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| anyhow!("state store lock poisoned"))?;
        values.insert(key, value.to_string());
        Ok(())
    }
}

// -------------------- Result Store --------------------

/// Single-slot store for the latest pipeline outcome.
pub struct ResultStore<S: ?Sized + StateStore> {
    store: std::sync::Arc<S>,
}

impl<S: ?Sized + StateStore> Clone for ResultStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: ?Sized + StateStore> ResultStore<S> {
    pub fn new(store: std::sync::Arc<S>) -> Self {
        Self { store }
    }

    /// Overwrites the stored result with the literal label or sentinel text.
    pub fn save_result(&self, result: &EmotionResult) -> Result<()> {
        self.store.set(StateKey::EmotionResult, result.as_str())
    }

    /// Current stored text, trimmed. Errors when nothing has been stored yet.
    pub fn load_result(&self) -> Result<String> {
        let value = self
            .store
            .get(StateKey::EmotionResult)?
            .ok_or_else(|| anyhow!("no emotion result stored"))?;
        Ok(value.trim().to_string())
    }
}
