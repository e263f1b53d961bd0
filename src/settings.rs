use anyhow::{anyhow, Context, Result};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// JSON object of user preferences (location, API keys, news source, ...).
pub type UserSettings = Map<String, Value>;

/// Flat-file store for the user-preferences document.
#[derive(Clone)]
pub struct UserSettingsStore {
    path: PathBuf,
    changes: Arc<ChangeFeed>,
    write_lock: Arc<Mutex<()>>,
}

impl UserSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            changes: Arc::new(ChangeFeed::new()),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn changes(&self) -> &Arc<ChangeFeed> {
        &self.changes
    }

    /// Current settings; empty when the file is missing or not a JSON object.
    pub fn load(&self) -> UserSettings {
        match self.try_load() {
            Ok(settings) => settings,
            Err(err) => {
                log::error!("error loading user settings: {:#}", err);
                UserSettings::new()
            }
        }
    }

    pub fn try_load(&self) -> Result<UserSettings> {
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        match serde_json::from_str(&raw)
            .with_context(|| format!("parse {}", self.path.display()))?
        {
            Value::Object(map) => Ok(map),
            _ => Err(anyhow!("{} is not a JSON object", self.path.display())),
        }
    }

    /// File contents exactly as stored.
    pub fn raw(&self) -> Result<Vec<u8>> {
        std::fs::read(&self.path).with_context(|| format!("read {}", self.path.display()))
    }

    /// Stores every truthy value from `update`, leaving other keys as they are.
    ///
    /// Returns the names of the keys that were written.
    pub fn merge(&self, update: &UserSettings) -> Result<Vec<String>> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow!("settings lock poisoned"))?;
        let mut settings = self.load();
        let mut written = Vec::new();
        for (key, value) in update {
            if is_truthy(value) {
                settings.insert(key.clone(), value.clone());
                written.push(key.clone());
            }
        }
        let body = serde_json::to_vec(&Value::Object(settings))?;
        crate::state::write_atomic(&self.path, &body)?;
        self.changes.publish();
        Ok(written)
    }
}

/// Empty strings, zero, `false`, `null` and empty containers are not stored.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Publish/subscribe signal for settings writes.
///
/// Subscribers remember the last generation they saw and block until it moves.
pub struct ChangeFeed {
    generation: Mutex<u64>,
    changed: Condvar,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            changed: Condvar::new(),
        }
    }

    pub fn current(&self) -> u64 {
        self.generation.lock().map(|g| *g).unwrap_or(0)
    }

    pub fn publish(&self) {
        if let Ok(mut generation) = self.generation.lock() {
            *generation += 1;
        }
        self.changed.notify_all();
    }

    /// Waits until the generation differs from `seen` or `timeout` passes.
    /// Returns the generation observed on wake-up.
    pub fn wait_for_change(&self, seen: u64, timeout: Duration) -> u64 {
        let Ok(guard) = self.generation.lock() else {
            return seen;
        };
        match self
            .changed
            .wait_timeout_while(guard, timeout, |generation| *generation == seen)
        {
            Ok((generation, _)) => *generation,
            Err(_) => seen,
        }
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_in(dir: &Path) -> UserSettingsStore {
        let path = dir.join("user_settings.json");
        std::fs::write(&path, "{}").expect("seed settings");
        UserSettingsStore::new(path)
    }

    fn object(value: Value) -> UserSettings {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn merge_keeps_existing_values_for_empty_updates() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(dir.path());
        store.merge(&object(json!({"city": "Oslo", "country": "NO"})))?;

        let written = store.merge(&object(json!({"city": "", "newsSource": "BBC News"})))?;
        assert_eq!(written, vec!["newsSource".to_string()]);

        let settings = store.load();
        assert_eq!(settings.get("city"), Some(&json!("Oslo")));
        assert_eq!(settings.get("newsSource"), Some(&json!("BBC News")));
        Ok(())
    }

    #[test]
    fn corrupt_file_loads_as_empty() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(dir.path());
        std::fs::write(store.path(), "{not json")?;
        assert!(store.load().is_empty());
        assert!(store.try_load().is_err());
        Ok(())
    }

    #[test]
    fn truthiness_follows_json_values() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!(3.5)));
        assert!(is_truthy(&json!({"a": 1})));
    }

    #[test]
    fn merge_publishes_a_change() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(dir.path());
        let seen = store.changes().current();

        let waiter = {
            let feed = store.changes().clone();
            std::thread::spawn(move || feed.wait_for_change(seen, Duration::from_secs(5)))
        };
        store.merge(&object(json!({"city": "Paris"})))?;

        let observed = waiter.join().expect("waiter thread");
        assert!(observed > seen);
        Ok(())
    }

    #[test]
    fn readers_never_see_a_partial_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(dir.path());
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let reader = {
            let store = store.clone();
            let done = done.clone();
            std::thread::spawn(move || -> Result<usize> {
                let mut reads = 0;
                while !done.load(std::sync::atomic::Ordering::SeqCst) {
                    store.try_load()?;
                    reads += 1;
                }
                Ok(reads)
            })
        };
        let padding = "x".repeat(64 * 1024);
        for i in 0..50 {
            store.merge(&object(json!({"city": format!("City {}", i), "notes": padding})))?;
        }
        done.store(true, std::sync::atomic::Ordering::SeqCst);

        assert!(reader.join().expect("reader thread")? > 0);
        assert_eq!(store.load().get("city"), Some(&json!("City 49")));
        Ok(())
    }

    #[test]
    fn wait_times_out_without_changes() {
        let feed = ChangeFeed::new();
        assert_eq!(feed.wait_for_change(0, Duration::from_millis(20)), 0);
    }
}
