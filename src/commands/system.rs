use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{DriveSpace, OperationResult};
use crate::services::Settings;
use crate::AppState;

#[derive(Clone, Debug, Deserialize)]
pub struct KeyArgs {
    pub key: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct KeyValueArgs {
    pub key: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct DriveSpaceArgs {
    pub directory: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledSize {
    pub success: bool,
    pub calculating: bool,
    pub total_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn get_settings(state: &AppState) -> Settings {
    state.settings.load()
}

pub fn save_settings(state: &AppState, patch: Value) -> OperationResult {
    state.settings.save(patch).map(|_| ()).into()
}

pub fn update_setting(state: &AppState, args: KeyValueArgs) -> OperationResult {
    state.settings.update_setting(&args.key, args.value).map(|_| ()).into()
}

pub fn get_setting(state: &AppState, args: KeyArgs) -> Value {
    state.settings.get_setting(&args.key).unwrap_or(Value::Null)
}

/// Defaults to the primary directory. Any failure reads as zero space.
pub async fn get_drive_space(state: &AppState, args: DriveSpaceArgs) -> DriveSpace {
    let directory = match args.directory.filter(|dir| !dir.trim().is_empty()) {
        Some(dir) => std::path::PathBuf::from(dir),
        None => match state.games.resolver().primary() {
            Ok(primary) => primary,
            Err(err) => {
                tracing::warn!("drive space requested without a directory: {}", err);
                return DriveSpace::default();
            }
        },
    };
    match state.drive_space.get(&directory).await {
        Ok(space) => space,
        Err(err) => {
            tracing::error!("error getting drive space for {}: {}", directory.display(), err);
            DriveSpace::default()
        }
    }
}

pub async fn get_installed_games_size(state: &AppState) -> InstalledSize {
    let result = match state.games.resolver().primary() {
        Ok(primary) => state.installed_size.get(&primary).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(total_size) => InstalledSize {
            success: true,
            calculating: false,
            total_size,
            error: None,
        },
        Err(err) => {
            tracing::error!("error calculating installed games size: {}", err);
            InstalledSize {
                success: false,
                calculating: false,
                total_size: 0,
                error: Some(err.to_string()),
            }
        }
    }
}

pub fn update_launch_count(state: &AppState) -> Value {
    match state.timestamps.increment_launch_count() {
        Ok(count) => Value::from(count),
        Err(err) => {
            tracing::error!("error updating launch count: {}", err);
            Value::Null
        }
    }
}

pub fn get_timestamp_value(state: &AppState, args: KeyArgs) -> Value {
    state.timestamps.get_value(&args.key).unwrap_or(Value::Null)
}

pub fn set_timestamp_value(state: &AppState, args: KeyValueArgs) -> OperationResult {
    state.timestamps.set_value(&args.key, args.value).into()
}

pub fn is_v7(state: &AppState) -> bool {
    state.timestamps.is_v7()
}

pub fn set_v7(state: &AppState) -> OperationResult {
    state.timestamps.set_v7().into()
}
