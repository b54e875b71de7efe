use serde::Deserialize;
use serde_json::Map;

use crate::commands::download::GameArgs;
use crate::errors::Result;
use crate::models::{CustomGameRecord, GameRecord, OperationResult, UNKNOWN_VERSION};
use crate::services::{normalize_game_name, CustomGameListing};
use crate::AppState;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameFlagArgs {
    pub game: String,
    #[serde(default)]
    pub is_custom: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayGameArgs {
    pub game: String,
    #[serde(default)]
    pub is_custom: bool,
    #[serde(default)]
    pub backup_on_close: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveCustomGameArgs {
    pub game: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub dlc: bool,
    #[serde(default)]
    pub version: Option<String>,
    pub executable: String,
    #[serde(default, rename = "imgID", alias = "imgId")]
    pub img_id: Option<String>,
}

pub async fn get_games(state: &AppState) -> Vec<GameRecord> {
    state.games.list_games().await
}

pub async fn get_custom_games(state: &AppState) -> Vec<CustomGameListing> {
    match state.games.custom_games().await {
        Ok(games) => games,
        Err(err) => {
            tracing::error!("error reading custom games: {}", err);
            Vec::new()
        }
    }
}

pub async fn save_custom_game(state: &AppState, args: SaveCustomGameArgs) -> OperationResult {
    add_custom_game(state, args).await.into()
}

async fn add_custom_game(state: &AppState, args: SaveCustomGameArgs) -> Result<()> {
    if let Some(img_id) = args.img_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
        let torrent_source = state.settings.load().uses_torrent_source();
        let images = state.games.custom_images_dir()?;
        state
            .downloads
            .api()
            .save_image(img_id, torrent_source, &images, &format!("{}.ascendara", args.game))
            .await?;
    }

    state
        .games
        .add_custom_game(CustomGameRecord {
            game: args.game,
            online: args.online,
            dlc: args.dlc,
            version: args
                .version
                .filter(|version| !version.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN_VERSION.to_string()),
            executable: args.executable,
            is_running: false,
            backups: false,
            has_rated: false,
            extra: Map::new(),
        })
        .await
}

pub async fn delete_game(state: &AppState, args: GameArgs) -> OperationResult {
    state
        .games
        .delete_game(&normalize_game_name(&args.game))
        .await
        .map(|_| ())
        .into()
}

pub async fn remove_game(state: &AppState, args: GameArgs) -> OperationResult {
    match state.games.remove_custom_game(&args.game).await {
        Ok(true) => OperationResult::ok(),
        Ok(false) => OperationResult::failed(format!("Custom game not found: {}", args.game)),
        Err(err) => OperationResult::failed(err.to_string()),
    }
}

fn record_name(args: &GameFlagArgs) -> String {
    if args.is_custom {
        args.game.clone()
    } else {
        normalize_game_name(&args.game)
    }
}

pub async fn enable_game_auto_backups(state: &AppState, args: GameFlagArgs) -> OperationResult {
    state
        .games
        .set_backups(&record_name(&args), args.is_custom, true)
        .await
        .into()
}

pub async fn disable_game_auto_backups(state: &AppState, args: GameFlagArgs) -> OperationResult {
    state
        .games
        .set_backups(&record_name(&args), args.is_custom, false)
        .await
        .into()
}

pub async fn game_rated(state: &AppState, args: GameFlagArgs) -> OperationResult {
    state.games.set_rated(&record_name(&args), args.is_custom).await.into()
}

pub async fn play_game(state: &AppState, args: PlayGameArgs) -> OperationResult {
    state
        .runtime
        .play(&args.game, args.is_custom, args.backup_on_close)
        .await
}

pub async fn stop_game(state: &AppState, args: GameArgs) -> bool {
    state.runtime.stop_game(&args.game).await
}

pub fn is_game_running(state: &AppState, args: GameArgs) -> bool {
    state.runtime.is_running(&args.game)
}
