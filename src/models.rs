use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const GAME_RECORD_SUFFIX: &str = ".ascendara.json";
pub const FILEMAP_FILE: &str = "filemap.ascendara.json";
pub const CUSTOM_GAMES_FILE: &str = "games.json";
pub const UNKNOWN_VERSION: &str = "-1";

fn unknown_version() -> String {
    UNKNOWN_VERSION.to_string()
}

/// Helpers are not strict about types: `""` and `"true"` both show up where a
/// bool is expected, and `handleerror` blanks `online`/`dlc` to strings.
fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Bool(flag) => flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Value::String(text) => matches!(text.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    })
}

fn lenient_opt_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.map(|value| match value {
        Value::Bool(flag) => flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Value::String(text) => matches!(text.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    }))
}

fn lenient_version<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(text)) => text,
        Some(Value::Number(number)) => number.to_string(),
        _ => unknown_version(),
    })
}

/// One `<game>.ascendara.json` descriptor.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameRecord {
    #[serde(default)]
    pub game: String,
    #[serde(default = "unknown_version", deserialize_with = "lenient_version")]
    pub version: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub online: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub dlc: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub is_vr: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub has_been_launched: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub has_rated: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub backups: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloading_data: Option<DownloadingData>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GameRecord {
    pub fn new(game: &str) -> Self {
        Self {
            game: game.to_string(),
            version: unknown_version(),
            online: false,
            dlc: false,
            is_vr: false,
            executable: None,
            has_been_launched: false,
            has_rated: false,
            backups: false,
            downloading_data: None,
            extra: Map::new(),
        }
    }

    pub fn is_installed(&self) -> bool {
        self.downloading_data.is_none()
    }

    pub fn phase(&self) -> DownloadPhase {
        DownloadPhase::of(self.downloading_data.as_ref())
    }
}

/// Transient progress written by helpers while a game is not yet installed.
/// Absent fields stay absent on write-back.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadingData {
    #[serde(default, deserialize_with = "lenient_opt_bool", skip_serializing_if = "Option::is_none")]
    pub downloading: Option<bool>,
    #[serde(default, deserialize_with = "lenient_opt_bool", skip_serializing_if = "Option::is_none")]
    pub extracting: Option<bool>,
    #[serde(default, deserialize_with = "lenient_opt_bool", skip_serializing_if = "Option::is_none")]
    pub verifying: Option<bool>,
    #[serde(default, deserialize_with = "lenient_opt_bool", skip_serializing_if = "Option::is_none")]
    pub updating: Option<bool>,
    #[serde(default, deserialize_with = "lenient_opt_bool", skip_serializing_if = "Option::is_none")]
    pub stopped: Option<bool>,
    #[serde(default, deserialize_with = "lenient_opt_bool", skip_serializing_if = "Option::is_none")]
    pub waiting: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_completed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_download_speeds: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_until_complete: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_error: Option<Vec<VerifyError>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// `true` from the python helpers, a description from everything else.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DownloadingData {
    /// Fresh state written when a helper is spawned.
    pub fn waiting() -> Self {
        Self {
            waiting: Some(true),
            ..Self::default()
        }
    }

    pub fn stopped() -> Self {
        Self {
            stopped: Some(true),
            ..Self::default()
        }
    }

    pub fn failed(message: &str) -> Self {
        Self {
            error: Some(Value::Bool(true)),
            message: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn verify_failed(errors: Vec<VerifyError>) -> Self {
        Self {
            downloading: Some(false),
            extracting: Some(false),
            verifying: Some(false),
            updating: Some(false),
            progress_completed: Some("100.00".to_string()),
            progress_download_speeds: Some("0.00 B/s".to_string()),
            time_until_complete: Some("0s".to_string()),
            verify_error: Some(errors),
            ..Self::default()
        }
    }

    fn flag(value: Option<bool>) -> bool {
        value.unwrap_or(false)
    }

    pub fn error_message(&self) -> Option<String> {
        let flagged = match &self.error {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(text)) => !text.is_empty(),
            Some(Value::Null) | None => false,
            Some(_) => true,
        };
        if !flagged && self.message.is_none() {
            return None;
        }
        if let Some(message) = self.message.as_ref().filter(|text| !text.is_empty()) {
            return Some(message.clone());
        }
        match &self.error {
            Some(Value::String(text)) if !text.is_empty() => Some(text.clone()),
            _ if flagged => Some("unknown error".to_string()),
            _ => None,
        }
    }

    /// More than one of the mutually exclusive phase flags is set.
    pub fn has_conflicting_flags(&self) -> bool {
        let active = [
            self.downloading,
            self.extracting,
            self.verifying,
            self.updating,
            self.stopped,
            self.waiting,
        ]
        .into_iter()
        .filter(|flag| Self::flag(*flag))
        .count();
        active > 1
    }

    pub fn clear_phase_flags(&mut self) {
        for flag in [
            &mut self.downloading,
            &mut self.extracting,
            &mut self.verifying,
            &mut self.updating,
            &mut self.stopped,
            &mut self.waiting,
        ] {
            if flag.is_some() {
                *flag = Some(false);
            }
        }
    }

    /// Leftover error and verify results are dropped unless the new phase is
    /// the one they describe.
    pub fn set_phase(&mut self, phase: &DownloadPhase) {
        self.clear_phase_flags();
        if !matches!(phase, DownloadPhase::Failed { .. }) {
            self.error = None;
            self.message = None;
        }
        if !matches!(phase, DownloadPhase::VerifyFailed { .. }) {
            self.verify_error = None;
        }
        match phase {
            DownloadPhase::Waiting => self.waiting = Some(true),
            DownloadPhase::Downloading => self.downloading = Some(true),
            DownloadPhase::Extracting => self.extracting = Some(true),
            DownloadPhase::Verifying => self.verifying = Some(true),
            DownloadPhase::Updating => self.updating = Some(true),
            DownloadPhase::Stopped => self.stopped = Some(true),
            DownloadPhase::Failed { message } => {
                self.error = Some(Value::Bool(true));
                self.message = Some(message.clone());
            }
            DownloadPhase::Idle | DownloadPhase::VerifyFailed { .. } => {}
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct VerifyError {
    pub file: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_size: Option<u64>,
}

/// Single-valued view over the `downloadingData` flag bag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadPhase {
    Idle,
    Waiting,
    Downloading,
    Extracting,
    Verifying,
    Updating,
    Stopped,
    Failed { message: String },
    VerifyFailed { count: usize },
}

impl DownloadPhase {
    pub fn of(data: Option<&DownloadingData>) -> Self {
        let Some(data) = data else {
            return DownloadPhase::Idle;
        };
        if DownloadingData::flag(data.stopped) {
            return DownloadPhase::Stopped;
        }
        if let Some(message) = data.error_message() {
            return DownloadPhase::Failed { message };
        }
        if let Some(errors) = data.verify_error.as_ref().filter(|errors| !errors.is_empty()) {
            return DownloadPhase::VerifyFailed {
                count: errors.len(),
            };
        }
        if DownloadingData::flag(data.verifying) {
            DownloadPhase::Verifying
        } else if DownloadingData::flag(data.extracting) {
            DownloadPhase::Extracting
        } else if DownloadingData::flag(data.updating) {
            DownloadPhase::Updating
        } else if DownloadingData::flag(data.downloading) {
            DownloadPhase::Downloading
        } else {
            DownloadPhase::Waiting
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "idle" | "installed" => Some(DownloadPhase::Idle),
            "waiting" => Some(DownloadPhase::Waiting),
            "downloading" => Some(DownloadPhase::Downloading),
            "extracting" => Some(DownloadPhase::Extracting),
            "verifying" => Some(DownloadPhase::Verifying),
            "updating" => Some(DownloadPhase::Updating),
            "stopped" => Some(DownloadPhase::Stopped),
            _ => None,
        }
    }

    /// Stop and failure are reachable from anywhere; everything else must
    /// move forward through the pipeline. A stopped or failed record only
    /// leaves that state when a download or retry spawns and resets it to
    /// waiting.
    pub fn can_transition_to(&self, next: &DownloadPhase) -> bool {
        use DownloadPhase::*;
        if self == next {
            return true;
        }
        match next {
            Stopped | Failed { .. } => return true,
            _ => {}
        }
        match self {
            Idle | Stopped | Failed { .. } | VerifyFailed { .. } => {
                matches!(next, Waiting | Downloading | Updating | Verifying)
            }
            Waiting => matches!(next, Downloading | Updating | Extracting | Idle),
            Downloading => matches!(next, Extracting | Verifying | Updating | Idle),
            Updating => matches!(next, Downloading | Extracting | Verifying | Idle),
            Extracting => matches!(next, Verifying | Idle),
            Verifying => matches!(next, Idle | VerifyFailed { .. }),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileMapEntry {
    #[serde(default)]
    pub size: Option<u64>,
}

pub type FileMap = BTreeMap<String, FileMapEntry>;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomGameRecord {
    pub game: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub online: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub dlc: bool,
    #[serde(default = "unknown_version", deserialize_with = "lenient_version")]
    pub version: String,
    #[serde(default)]
    pub executable: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub is_running: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub backups: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub has_rated: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct CustomGamesFile {
    #[serde(default)]
    pub games: Vec<CustomGameRecord>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DownloadHistoryEntry {
    pub game: String,
    pub timestamp: String,
}

/// `{success, error?}` shape returned by every orchestration command.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OperationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

impl<E: std::fmt::Display> From<std::result::Result<(), E>> for OperationResult {
    fn from(value: std::result::Result<(), E>) -> Self {
        match value {
            Ok(()) => Self::ok(),
            Err(err) => Self::failed(err.to_string()),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DriveSpace {
    pub free_space: u64,
    pub total_space: u64,
}
