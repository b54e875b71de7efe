use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{CoreError, Result};
use crate::utils::crypto::SecretSealer;
use crate::utils::file::write_json_atomic;

pub const SETTINGS_FILE: &str = "ascendarasettings.json";
pub const SENSITIVE_KEYS: [&str; 3] = ["twitchSecret", "twitchClientId", "giantBombKey"];

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub download_directory: String,
    pub additional_directories: Vec<String>,
    pub show_old_download_links: bool,
    pub see_inappropriate_content: bool,
    pub early_release_preview: bool,
    pub view_workshop_page: bool,
    pub notifications: bool,
    pub download_handler: bool,
    pub torrent_enabled: bool,
    pub game_source: String,
    pub auto_create_shortcuts: bool,
    pub smooth_transitions: bool,
    pub send_analytics: bool,
    pub auto_update: bool,
    pub end_on_close: bool,
    pub language: String,
    pub theme: String,
    pub thread_count: u32,
    pub download_limit: u64,
    pub side_scroll_bar: bool,
    pub exclude_folders: bool,
    pub crack_directory: String,
    pub twitch_secret: String,
    pub twitch_client_id: String,
    pub giant_bomb_key: String,
    pub ludusavi: LudusaviSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_directory: String::new(),
            additional_directories: Vec::new(),
            show_old_download_links: false,
            see_inappropriate_content: false,
            early_release_preview: false,
            view_workshop_page: false,
            notifications: true,
            download_handler: false,
            torrent_enabled: false,
            game_source: "steamrip".to_string(),
            auto_create_shortcuts: true,
            smooth_transitions: true,
            send_analytics: true,
            auto_update: true,
            end_on_close: false,
            language: "en".to_string(),
            theme: "purple".to_string(),
            thread_count: 4,
            download_limit: 0,
            side_scroll_bar: false,
            exclude_folders: false,
            crack_directory: String::new(),
            twitch_secret: String::new(),
            twitch_client_id: String::new(),
            giant_bomb_key: String::new(),
            ludusavi: LudusaviSettings::default(),
        }
    }
}

impl Settings {
    pub fn primary_directory(&self) -> Option<PathBuf> {
        let trimmed = self.download_directory.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(PathBuf::from(trimmed))
        }
    }

    pub fn uses_torrent_source(&self) -> bool {
        self.game_source.eq_ignore_ascii_case("fitgirl")
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct LudusaviSettings {
    pub backup_location: String,
    pub backup_format: String,
    pub enabled: bool,
    pub backup_options: LudusaviBackupOptions,
}

impl Default for LudusaviSettings {
    fn default() -> Self {
        Self {
            backup_location: String::new(),
            backup_format: "zip".to_string(),
            enabled: false,
            backup_options: LudusaviBackupOptions::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct LudusaviBackupOptions {
    pub backups_to_keep: u32,
    pub skip_manifest_check: bool,
    pub compression_level: String,
}

impl Default for LudusaviBackupOptions {
    fn default() -> Self {
        Self {
            backups_to_keep: 5,
            skip_manifest_check: false,
            compression_level: "default".to_string(),
        }
    }
}

/// Re-reads, merges and rewrites `ascendarasettings.json` on every change so
/// partial updates from different callers do not clobber each other.
#[derive(Clone)]
pub struct SettingsStore {
    path: PathBuf,
    sealer: Arc<dyn SecretSealer>,
    write_lock: Arc<Mutex<()>>,
}

impl SettingsStore {
    pub fn new(data_dir: &Path, sealer: Arc<dyn SecretSealer>) -> Self {
        let store = Self {
            path: data_dir.join(SETTINGS_FILE),
            sealer,
            write_lock: Arc::new(Mutex::new(())),
        };
        store.seal_plaintext_secrets();
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current settings, creating the file with defaults when absent.
    pub fn load(&self) -> Settings {
        let _guard = self.lock();
        self.load_unlocked()
    }

    pub fn save(&self, patch: Value) -> Result<Settings> {
        let Value::Object(patch) = patch else {
            return Err(CoreError::Config("settings patch must be an object".to_string()));
        };
        let _guard = self.lock();
        let current = self.load_unlocked();
        let mut merged = match serde_json::to_value(&current)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (key, value) in patch {
            merged.insert(key, value);
        }
        self.seal_sensitive(&mut merged)?;
        let settings: Settings = serde_json::from_value(Value::Object(merged))
            .map_err(|err| CoreError::Config(format!("invalid settings: {err}")))?;
        write_json_atomic(&self.path, &settings)?;
        tracing::info!("settings saved to {}", self.path.display());
        Ok(settings)
    }

    pub fn update_setting(&self, key: &str, value: Value) -> Result<Settings> {
        let mut patch = Map::new();
        patch.insert(key.to_string(), value);
        self.save(Value::Object(patch))
    }

    /// Single key lookup; sensitive keys come back unsealed.
    pub fn get_setting(&self, key: &str) -> Option<Value> {
        let settings = self.load();
        let value = serde_json::to_value(&settings).ok()?.get(key).cloned()?;
        if SENSITIVE_KEYS.contains(&key) {
            if let Value::String(sealed) = &value {
                return match self.sealer.open(sealed) {
                    Ok(plain) => Some(Value::String(plain)),
                    Err(err) => {
                        tracing::warn!("failed to unseal setting {}: {}", key, err);
                        None
                    }
                };
            }
        }
        Some(value)
    }

    fn load_unlocked(&self) -> Settings {
        let raw: Option<Map<String, Value>> = match std::fs::read(&self.path) {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(Value::Object(map)) => Some(map),
                Ok(_) => {
                    tracing::warn!("settings file {} is not an object", self.path.display());
                    None
                }
                Err(err) => {
                    tracing::warn!("settings file {} is unreadable: {}", self.path.display(), err);
                    None
                }
            },
            Err(_) => None,
        };

        let (settings, merged) = merge_with_defaults(raw.as_ref());
        let needs_write = match raw.as_ref() {
            Some(raw) => *raw != merged,
            None => true,
        };
        if needs_write {
            if let Err(err) = write_json_atomic(&self.path, &settings) {
                tracing::warn!("failed to write default settings: {}", err);
            }
        }
        settings
    }

    fn seal_sensitive(&self, map: &mut Map<String, Value>) -> Result<()> {
        for key in SENSITIVE_KEYS {
            if let Some(Value::String(value)) = map.get(key) {
                if !value.is_empty() && !self.sealer.is_sealed(value) {
                    let sealed = self.sealer.seal(value)?;
                    map.insert(key.to_string(), Value::String(sealed));
                }
            }
        }
        Ok(())
    }

    fn seal_plaintext_secrets(&self) {
        let settings = self.load();
        let plaintext = [
            &settings.twitch_secret,
            &settings.twitch_client_id,
            &settings.giant_bomb_key,
        ]
        .iter()
        .any(|value| !value.is_empty() && !self.sealer.is_sealed(value));
        if !plaintext {
            return;
        }
        match self.save(Value::Object(Map::new())) {
            Ok(_) => tracing::info!("migrated sensitive settings to sealed form"),
            Err(err) => tracing::warn!("failed to seal sensitive settings: {}", err),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Keeps only keys the default schema knows, one at a time, so a single
/// badly typed value does not discard the rest of the file.
fn merge_with_defaults(raw: Option<&Map<String, Value>>) -> (Settings, Map<String, Value>) {
    let defaults = Settings::default();
    let mut merged = match serde_json::to_value(&defaults) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let mut settings = defaults;

    if let Some(raw) = raw {
        for (key, value) in raw {
            if !merged.contains_key(key) {
                continue;
            }
            let mut candidate = merged.clone();
            candidate.insert(key.clone(), value.clone());
            match serde_json::from_value::<Settings>(Value::Object(candidate.clone())) {
                Ok(parsed) => {
                    settings = parsed;
                    merged = candidate;
                }
                Err(err) => tracing::warn!("dropping invalid setting {}: {}", key, err),
            }
        }
    }

    let normalized = match serde_json::to_value(&settings) {
        Ok(Value::Object(map)) => map,
        _ => merged,
    };
    (settings, normalized)
}
