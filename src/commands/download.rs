use serde::Deserialize;

use crate::models::{DownloadHistoryEntry, OperationResult};
use crate::services::{normalize_game_name, DownloadRequest, RetryRequest};
use crate::AppState;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopDownloadArgs {
    pub game: String,
    #[serde(default)]
    pub delete_contents: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GameArgs {
    pub game: String,
}

pub async fn download_file(state: &AppState, args: DownloadRequest) -> OperationResult {
    state.downloads.download(args).await
}

pub async fn stop_download(state: &AppState, args: StopDownloadArgs) -> OperationResult {
    state.downloads.stop(&args.game, args.delete_contents).await
}

pub async fn retry_download(state: &AppState, args: RetryRequest) -> OperationResult {
    state.downloads.retry(args).await
}

pub async fn verify_game(state: &AppState, args: GameArgs) -> OperationResult {
    state.verifier.verify(&normalize_game_name(&args.game)).await
}

pub fn get_download_history(state: &AppState) -> Vec<DownloadHistoryEntry> {
    state.timestamps.history()
}

pub async fn is_downloader_running(state: &AppState) -> bool {
    state.games.is_downloader_running().await
}
