use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use crate::errors::{CoreError, Result};
use crate::models::DownloadHistoryEntry;
use crate::utils::file::write_json_atomic;

const HISTORY_KEY: &str = "downloadedHistory";
const LAUNCH_COUNT_KEY: &str = "launchCount";
const V7_KEY: &str = "v7";
const TIMESTAMP_KEY: &str = "timestamp";

/// Process-wide bookkeeping kept in `timestamp.ascendara.json`.
///
/// The file is handled as a plain JSON object. Typed accessors read their
/// own key leniently, so an odd value under one key never hides the others.
#[derive(Clone)]
pub struct TimestampStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl TimestampStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Ill-typed entries are skipped.
    pub fn history(&self) -> Vec<DownloadHistoryEntry> {
        match self.snapshot().remove(HISTORY_KEY) {
            Some(Value::Array(entries)) => entries
                .into_iter()
                .filter_map(|entry| serde_json::from_value(entry).ok())
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn push_download_history(&self, game: &str) -> Result<()> {
        let entry = serde_json::to_value(DownloadHistoryEntry {
            game: game.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        })?;
        self.modify(|map| match map.get_mut(HISTORY_KEY) {
            Some(Value::Array(entries)) => entries.push(entry),
            _ => {
                map.insert(HISTORY_KEY.to_string(), Value::Array(vec![entry]));
            }
        })
    }

    pub fn increment_launch_count(&self) -> Result<u64> {
        let mut count = 0;
        self.modify(|map| {
            count = map.get(LAUNCH_COUNT_KEY).and_then(Value::as_u64).unwrap_or(0) + 1;
            map.insert(LAUNCH_COUNT_KEY.to_string(), Value::from(count));
        })?;
        Ok(count)
    }

    pub fn is_v7(&self) -> bool {
        self.snapshot()
            .get(V7_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn set_v7(&self) -> Result<()> {
        self.modify(|map| {
            map.insert(V7_KEY.to_string(), Value::Bool(true));
            if !map.get(TIMESTAMP_KEY).is_some_and(Value::is_i64) {
                map.insert(
                    TIMESTAMP_KEY.to_string(),
                    Value::from(chrono::Utc::now().timestamp_millis()),
                );
            }
        })
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.snapshot().remove(key)
    }

    pub fn set_value(&self, key: &str, value: Value) -> Result<()> {
        self.modify(|map| {
            map.insert(key.to_string(), value);
        })
    }

    /// A missing or unreadable file reads as empty.
    fn snapshot(&self) -> Map<String, Value> {
        let _guard = self.guard();
        self.load().unwrap_or_else(|err| {
            tracing::warn!("timestamp file {} unreadable: {}", self.path.display(), err);
            Map::new()
        })
    }

    /// Writes are refused while the file exists but does not parse.
    fn modify<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        let _guard = self.guard();
        let mut map = self.load().map_err(|err| {
            tracing::warn!(
                "not writing timestamp file {}, existing content unreadable: {}",
                self.path.display(),
                err
            );
            err
        })?;
        apply(&mut map);
        write_json_atomic(&self.path, &Value::Object(map))
    }

    fn load(&self) -> Result<Map<String, Value>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice::<Value>(&bytes)? {
            Value::Object(map) => Ok(map),
            _ => Err(CoreError::Config(format!(
                "{} does not hold a JSON object",
                self.path.display()
            ))),
        }
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
