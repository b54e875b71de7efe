mod commands;
mod errors;
mod logging;
mod models;
mod services;
mod utils;

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::commands::Request;
use crate::errors::Result;
use crate::services::{
    DownloadOrchestrator, DriveSpaceCache, EventEmitter, GameRuntime, GameStore, HelperLocator,
    InstalledSizeCache, OrchestratorConfig, ProcessTable, SettingsStore, SysinfoDiskStats,
    TimestampStore, VerificationEngine,
};
use crate::utils::crypto::AesSealer;
use crate::utils::paths::{resolve_data_dir, resolve_helper_dir, resolve_log_dir, resolve_timestamp_file};

#[derive(Clone)]
pub struct AppState {
    pub settings: SettingsStore,
    pub games: GameStore,
    pub timestamps: TimestampStore,
    pub downloads: DownloadOrchestrator,
    pub verifier: VerificationEngine,
    pub runtime: GameRuntime,
    pub drive_space: DriveSpaceCache,
    pub installed_size: InstalledSizeCache,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub helper_dir: PathBuf,
    pub timestamp_file: PathBuf,
    pub orchestrator: OrchestratorConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: resolve_data_dir(),
            helper_dir: resolve_helper_dir(),
            timestamp_file: resolve_timestamp_file(),
            orchestrator: OrchestratorConfig::from_env(),
        }
    }
}

pub fn build_state(config: &AppConfig, events: EventEmitter) -> Result<AppState> {
    let key_path = config.data_dir.join("secret.key");
    let sealer = AesSealer::from_key_file(&key_path)?;
    let settings = SettingsStore::new(&config.data_dir, Arc::new(sealer));
    let games = GameStore::new(settings.clone());
    let timestamps = TimestampStore::new(config.timestamp_file.clone());
    let locator = HelperLocator::platform(config.helper_dir.clone());
    let processes = ProcessTable::new();

    let downloads = DownloadOrchestrator::new(
        settings.clone(),
        games.clone(),
        timestamps.clone(),
        locator.clone(),
        processes.clone(),
        events.clone(),
        config.orchestrator.clone(),
    );
    let verifier = VerificationEngine::new(games.clone());
    let runtime = GameRuntime::new(games.clone(), locator, processes, events);

    Ok(AppState {
        settings,
        games,
        timestamps,
        downloads,
        verifier,
        runtime,
        drive_space: DriveSpaceCache::new(Arc::new(SysinfoDiskStats)),
        installed_size: InstalledSizeCache::default(),
    })
}

fn encode_line<T: serde::Serialize>(value: &T) -> Option<String> {
    match serde_json::to_string(value) {
        Ok(line) => Some(line),
        Err(err) => {
            tracing::error!("failed to encode output line: {}", err);
            None
        }
    }
}

async fn run() -> Result<()> {
    let config = AppConfig::from_env();
    logging::init(&resolve_log_dir())?;
    logging::install_panic_hook();
    tracing::info!(
        "starting with data dir {} and helpers in {}",
        config.data_dir.display(),
        config.helper_dir.display()
    );

    let (events, mut event_rx) = EventEmitter::channel();
    let state = Arc::new(build_state(&config, events)?);

    let adopted = state.downloads.reconcile().await;
    if adopted > 0 {
        tracing::info!("re-adopted {} running helper(s)", adopted);
    }

    // Responses and events share one writer so lines never interleave.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if let Err(err) = stdout.write_all(format!("{line}\n").as_bytes()).await {
                tracing::error!("stdout closed: {}", err);
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let event_tx = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let Some(line) = encode_line(&event) {
                let _ = event_tx.send(line);
            }
        }
    });

    let mut in_flight = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        // Finished requests are reaped while stdin stays open.
        let line = tokio::select! {
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(err) = joined {
                    tracing::error!("request task failed: {}", err);
                }
                continue;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!("malformed request: {}", err);
                let reply = json!({
                    "id": null,
                    "result": { "success": false, "error": format!("Malformed request: {err}") }
                });
                let _ = out_tx.send(reply.to_string());
                continue;
            }
        };
        let state = state.clone();
        let out_tx = out_tx.clone();
        in_flight.spawn(async move {
            let response = commands::dispatch(&state, request).await;
            if let Some(line) = encode_line(&response) {
                let _ = out_tx.send(line);
            }
        });
    }

    tracing::info!("stdin closed, waiting for {} request(s)", in_flight.len());
    while let Some(joined) = in_flight.join_next().await {
        if let Err(err) = joined {
            tracing::error!("request task failed: {}", err);
        }
    }
    forwarder.abort();
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        tracing::error!("host failed: {}", err);
        eprintln!("ascendara-core: {err}");
        std::process::exit(1);
    }
}
