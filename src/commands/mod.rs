pub mod download;
pub mod game;
pub mod system;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{CoreError, Result};
use crate::models::OperationResult;
use crate::AppState;

/// One stdin line: `{"id": ..., "command": "...", "args": {...}}`.
#[derive(Clone, Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub command: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Response {
    pub id: Value,
    pub result: Value,
}

fn args<T: DeserializeOwned>(command: &str, value: Value) -> Result<T> {
    let value = if value.is_null() {
        Value::Object(Default::default())
    } else {
        value
    };
    serde_json::from_value(value)
        .map_err(|err| CoreError::Config(format!("invalid arguments for {command}: {err}")))
}

fn reply<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

pub async fn dispatch(state: &AppState, request: Request) -> Response {
    tracing::debug!("dispatching {}", request.command);
    let result = match route(state, &request.command, request.args).await {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!("{} failed: {}", request.command, err);
            serde_json::to_value(OperationResult::failed(err.to_string())).unwrap_or(Value::Null)
        }
    };
    Response {
        id: request.id,
        result,
    }
}

async fn route(state: &AppState, command: &str, raw: Value) -> Result<Value> {
    match command {
        "download-file" => reply(download::download_file(state, args(command, raw)?).await),
        "stop-download" => reply(download::stop_download(state, args(command, raw)?).await),
        "retry-download" => reply(download::retry_download(state, args(command, raw)?).await),
        "verify-game" => reply(download::verify_game(state, args(command, raw)?).await),
        "get-download-history" => reply(download::get_download_history(state)),
        "is-downloader-running" => reply(download::is_downloader_running(state).await),

        "get-games" => reply(game::get_games(state).await),
        "get-custom-games" => reply(game::get_custom_games(state).await),
        "save-custom-game" => reply(game::save_custom_game(state, args(command, raw)?).await),
        "delete-game" => reply(game::delete_game(state, args(command, raw)?).await),
        "remove-game" => reply(game::remove_game(state, args(command, raw)?).await),
        "enable-game-auto-backups" => {
            reply(game::enable_game_auto_backups(state, args(command, raw)?).await)
        }
        "disable-game-auto-backups" => {
            reply(game::disable_game_auto_backups(state, args(command, raw)?).await)
        }
        "game-rated" => reply(game::game_rated(state, args(command, raw)?).await),
        "play-game" => reply(game::play_game(state, args(command, raw)?).await),
        "stop-game" => reply(game::stop_game(state, args(command, raw)?).await),
        "is-game-running" => reply(game::is_game_running(state, args(command, raw)?)),

        "get-settings" => reply(system::get_settings(state)),
        "save-settings" => reply(system::save_settings(state, raw)),
        "update-setting" => reply(system::update_setting(state, args(command, raw)?)),
        "get-setting" => reply(system::get_setting(state, args(command, raw)?)),
        "get-drive-space" => reply(system::get_drive_space(state, args(command, raw)?).await),
        "get-installed-games-size" => reply(system::get_installed_games_size(state).await),
        "update-launch-count" => reply(system::update_launch_count(state)),
        "get-timestamp-value" => reply(system::get_timestamp_value(state, args(command, raw)?)),
        "set-timestamp-value" => reply(system::set_timestamp_value(state, args(command, raw)?)),
        "is-v7" => reply(system::is_v7(state)),
        "set-v7" => reply(system::set_v7(state)),

        other => Err(CoreError::NotFound(format!("Unknown command: {other}"))),
    }
}
