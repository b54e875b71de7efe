use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStdout;
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};

use crate::errors::{CoreError, Result};
use crate::models::{DownloadPhase, DownloadingData, GameRecord, OperationResult};
use crate::services::api_client::{ApiClient, DEFAULT_API_URL};
use crate::services::directory_resolver::{normalize_game_name, DirectoryResolver, GameDirectory};
use crate::services::events::{EventEmitter, DOWNLOAD_ERROR};
use crate::services::game_store::GameStore;
use crate::services::helper_process::{
    is_pid_alive, kill_pid, log_lines, scan_downloader_processes, DownloadArgs, HelperCommand,
    HelperKind, HelperLocator, RetryArgs,
};
use crate::services::process_table::{
    supervise, terminate, ProcessControl, ProcessKind, ProcessTable, TrackedProcess,
};
use crate::services::settings_store::SettingsStore;
use crate::services::timestamp_store::TimestampStore;

const DEFAULT_STOP_SETTLE_MS: u64 = 5_000;
const DEFAULT_DELETE_ATTEMPTS: usize = 5;
const DEFAULT_DELETE_BACKOFF_MS: u64 = 3_000;
const DEFAULT_HTTP_TIMEOUT_SECONDS: u64 = 30;
const ADOPTED_POLL_INTERVAL: Duration = Duration::from_millis(750);
const HEADER_IMAGE_STEM: &str = "header.ascendara";

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub api_url: String,
    pub http_timeout: Duration,
    /// Time given to killed helpers to release file handles.
    pub stop_settle: Duration,
    pub delete_attempts: usize,
    pub delete_backoff: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECONDS),
            stop_settle: Duration::from_millis(DEFAULT_STOP_SETTLE_MS),
            delete_attempts: DEFAULT_DELETE_ATTEMPTS,
            delete_backoff: Duration::from_millis(DEFAULT_DELETE_BACKOFF_MS),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_url: std::env::var("ASCENDARA_API_URL")
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or(defaults.api_url),
            http_timeout: env_u64("ASCENDARA_HTTP_TIMEOUT_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
            stop_settle: env_u64("ASCENDARA_STOP_SETTLE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.stop_settle),
            delete_attempts: env_usize("ASCENDARA_DELETE_ATTEMPTS")
                .unwrap_or(defaults.delete_attempts)
                .max(1),
            delete_backoff: env_u64("ASCENDARA_DELETE_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.delete_backoff),
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub link: String,
    pub game: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub dlc: bool,
    #[serde(default)]
    pub is_vr: bool,
    #[serde(default)]
    pub update_flow: bool,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default, rename = "imgID", alias = "imgId")]
    pub img_id: Option<String>,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub additional_dir_index: usize,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRequest {
    pub link: String,
    pub game: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub dlc: bool,
    #[serde(default)]
    pub version: Option<String>,
}

/// One JSON line on a helper's stdout.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum HelperEvent {
    Progress {
        #[serde(default, rename = "progressCompleted")]
        progress_completed: Option<String>,
        #[serde(default, rename = "progressDownloadSpeeds")]
        progress_download_speeds: Option<String>,
        #[serde(default, rename = "timeUntilComplete")]
        time_until_complete: Option<String>,
    },
    Phase {
        phase: String,
    },
    Complete,
    Error {
        #[serde(default)]
        message: String,
    },
}

fn transition(record: &mut GameRecord, current: &DownloadPhase, next: DownloadPhase) -> bool {
    if !current.can_transition_to(&next) {
        tracing::warn!(
            "ignoring phase change {:?} -> {:?} for {}",
            current,
            next,
            record.game
        );
        return false;
    }
    match next {
        DownloadPhase::Idle => record.downloading_data = None,
        other => record
            .downloading_data
            .get_or_insert_with(DownloadingData::default)
            .set_phase(&other),
    }
    true
}

/// Folds a helper event into the record. Returns whether anything changed.
pub fn apply_helper_event(record: &mut GameRecord, event: &HelperEvent) -> bool {
    let current = record.phase();
    match event {
        HelperEvent::Progress {
            progress_completed,
            progress_download_speeds,
            time_until_complete,
        } => {
            if matches!(current, DownloadPhase::Stopped | DownloadPhase::Failed { .. }) {
                tracing::debug!("dropping progress for {} in {:?}", record.game, current);
                return false;
            }
            let data = record
                .downloading_data
                .get_or_insert_with(DownloadingData::default);
            if progress_completed.is_some() {
                data.progress_completed = progress_completed.clone();
            }
            if progress_download_speeds.is_some() {
                data.progress_download_speeds = progress_download_speeds.clone();
            }
            if time_until_complete.is_some() {
                data.time_until_complete = time_until_complete.clone();
            }
            if matches!(current, DownloadPhase::Idle | DownloadPhase::Waiting) {
                data.set_phase(&DownloadPhase::Downloading);
            }
            true
        }
        HelperEvent::Phase { phase } => match DownloadPhase::parse(phase) {
            Some(next) => transition(record, &current, next),
            None => {
                tracing::warn!("unknown phase {:?} from helper for {}", phase, record.game);
                false
            }
        },
        HelperEvent::Complete => transition(record, &current, DownloadPhase::Idle),
        HelperEvent::Error { message } => {
            if current == DownloadPhase::Stopped {
                tracing::debug!("ignoring helper error for stopped {}: {}", record.game, message);
                return false;
            }
            let message = if message.trim().is_empty() {
                "unknown error".to_string()
            } else {
                message.clone()
            };
            transition(record, &current, DownloadPhase::Failed { message })
        }
    }
}

async fn record_event(store: &GameStore, directory: &GameDirectory, event: &HelperEvent) -> Result<()> {
    let path = directory.record_path();
    match store
        .update_record(&path, |record| {
            apply_helper_event(record, event);
        })
        .await
    {
        Ok(_) => Ok(()),
        Err(CoreError::NotFound(_)) => {
            let mut record = GameRecord::new(&directory.name);
            apply_helper_event(&mut record, event);
            store.write_record(&path, &record).await
        }
        Err(err) => Err(err),
    }
}

/// Supervises downloader helpers: spawn, track, stop, retry and re-adopt.
#[derive(Clone)]
pub struct DownloadOrchestrator {
    settings: SettingsStore,
    store: GameStore,
    timestamps: TimestampStore,
    api: ApiClient,
    locator: HelperLocator,
    processes: ProcessTable,
    events: EventEmitter,
    config: OrchestratorConfig,
    game_locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl DownloadOrchestrator {
    pub fn new(
        settings: SettingsStore,
        store: GameStore,
        timestamps: TimestampStore,
        locator: HelperLocator,
        processes: ProcessTable,
        events: EventEmitter,
        config: OrchestratorConfig,
    ) -> Self {
        let api = ApiClient::new(config.api_url.clone(), config.http_timeout);
        Self {
            settings,
            store,
            timestamps,
            api,
            locator,
            processes,
            events,
            config,
            game_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub async fn download(&self, request: DownloadRequest) -> OperationResult {
        let game = normalize_game_name(&request.game);
        tracing::info!(
            "download requested for {:?} as {:?} (update flow: {}, directory index: {})",
            request.game,
            game,
            request.update_flow,
            request.additional_dir_index
        );
        let _guard = self.game_lock(&game).await;
        if self.processes.downloads.contains(&game) || self.processes.retries.contains(&game) {
            return OperationResult::failed(format!("A download is already running for {game}"));
        }

        match self.start_download(&game, &request).await {
            Ok(pid) => {
                tracing::info!("download helper for {} started with pid {}", game, pid);
                OperationResult::ok()
            }
            Err(err) => {
                tracing::error!("download of {} failed to start: {}", game, err);
                self.events.game_error(DOWNLOAD_ERROR, &game, &err);
                OperationResult::failed(err.to_string())
            }
        }
    }

    async fn start_download(&self, game: &str, request: &DownloadRequest) -> Result<u32> {
        let settings = self.settings.load();
        let resolver = DirectoryResolver::new(&settings);
        let directory = if request.update_flow {
            resolver.prepare_update(game).await?
        } else {
            resolver
                .prepare_new(game, request.additional_dir_index)
                .await?
        };

        let torrent_source = settings.uses_torrent_source();
        match request
            .img_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            Some(img_id) => {
                self.api
                    .save_image(img_id, torrent_source, &directory.path, HEADER_IMAGE_STEM)
                    .await?;
            }
            None => tracing::warn!("no image id for {}, skipping header image", game),
        }

        let kind = HelperKind::for_link(&request.link, torrent_source);
        let args = DownloadArgs {
            link: &request.link,
            game,
            online: request.online,
            dlc: request.dlc,
            is_vr: request.is_vr,
            update_flow: request.update_flow,
            version: request.version.as_deref(),
            size: &request.size,
            target_dir: &directory.root,
            notification_theme: settings.notifications.then_some(settings.theme.as_str()),
        }
        .to_args(kind);
        let command = self.locator.command(kind, args)?;

        if let Err(err) = self.timestamps.push_download_history(game) {
            tracing::warn!("failed to record download history for {}: {}", game, err);
        }

        self.spawn_helper(ProcessKind::Download, game, &command, Some(directory))
            .await
    }

    pub async fn stop(&self, game: &str, delete_contents: bool) -> OperationResult {
        let game = normalize_game_name(game);
        tracing::info!("stopping download for {}, delete contents: {}", game, delete_contents);
        let _guard = self.game_lock(&game).await;
        match self.stop_locked(&game, delete_contents).await {
            Ok(()) => OperationResult::ok(),
            Err(err) => {
                tracing::error!("failed to stop {}: {}", game, err);
                OperationResult::failed(err.to_string())
            }
        }
    }

    async fn stop_locked(&self, game: &str, delete_contents: bool) -> Result<()> {
        let scan_game = game.to_string();
        let found = tokio::task::spawn_blocking(move || scan_downloader_processes(Some(&scan_game)))
            .await
            .unwrap_or_else(|err| {
                tracing::warn!("process scan failed: {}", err);
                Vec::new()
            });
        for info in found {
            tracing::info!("killing {} process {}", info.kind.name(), info.pid);
            let pid = info.pid;
            match tokio::task::spawn_blocking(move || kill_pid(pid)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!("failed to kill process {}: {}", pid, err),
                Err(err) => tracing::warn!("kill task for process {} failed: {}", pid, err),
            }
        }

        for registry in [&self.processes.downloads, &self.processes.retries] {
            if let Some(process) = registry.take(game) {
                terminate(&process).await;
            }
        }

        tokio::time::sleep(self.config.stop_settle).await;

        if let Err(err) = self.store.mark_stopped(game).await {
            tracing::warn!("failed to mark {} as stopped: {}", game, err);
        }

        if delete_contents {
            self.delete_game_dir(game).await?;
        }
        Ok(())
    }

    async fn delete_game_dir(&self, game: &str) -> Result<()> {
        let Some(directory) = self.store.resolver().locate(game).await else {
            tracing::info!("no game directory to delete for {}", game);
            return Ok(());
        };

        let attempts = self.config.delete_attempts.max(1);
        for attempt in 1..=attempts {
            match tokio::fs::remove_dir_all(&directory.path).await {
                Ok(()) => {
                    tracing::info!("deleted {}", directory.path.display());
                    return Ok(());
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(err) if attempt == attempts => {
                    tracing::error!(
                        "giving up deleting {} after {} attempts: {}",
                        directory.path.display(),
                        attempts,
                        err
                    );
                    return Err(err.into());
                }
                Err(err) => {
                    tracing::warn!(
                        "attempt {}/{} to delete {} failed: {}",
                        attempt,
                        attempts,
                        directory.path.display(),
                        err
                    );
                    tokio::time::sleep(self.config.delete_backoff).await;
                }
            }
        }
        Ok(())
    }

    /// Retries always target the primary directory, wherever the game was
    /// first installed. A live download or retry for the game is killed and
    /// replaced.
    pub async fn retry(&self, request: RetryRequest) -> OperationResult {
        let game = normalize_game_name(&request.game);
        let _guard = self.game_lock(&game).await;
        match self.start_retry(&game, &request).await {
            Ok(pid) => {
                tracing::info!("retry helper for {} started with pid {}", game, pid);
                OperationResult::ok()
            }
            Err(err) => {
                tracing::error!("retry of {} failed: {}", game, err);
                OperationResult::failed(err.to_string())
            }
        }
    }

    async fn start_retry(&self, game: &str, request: &RetryRequest) -> Result<u32> {
        let primary = self.store.resolver().primary()?;
        let kind = HelperKind::for_link(&request.link, false);
        let args = RetryArgs {
            link: &request.link,
            game,
            online: request.online,
            dlc: request.dlc,
            version: request.version.as_deref(),
            target_dir: &primary,
        }
        .to_args(kind);
        let command = self.locator.command(kind, args)?;
        if let Some(previous) = self.processes.downloads.take(game) {
            tracing::info!("retry replaces download process {} for {}", previous.pid, game);
            terminate(&previous).await;
        }
        let directory = GameDirectory::new(&primary, game);
        self.spawn_helper(ProcessKind::Retry, game, &command, Some(directory))
            .await
    }

    async fn spawn_helper(
        &self,
        kind: ProcessKind,
        game: &str,
        command: &HelperCommand,
        directory: Option<GameDirectory>,
    ) -> Result<u32> {
        let helper = command.kind.name();
        tracing::info!("spawning {} for {} with {:?}", helper, game, command.args);
        let mut child = match command.to_tokio().spawn() {
            Ok(child) => child,
            Err(err) => {
                if let Some(directory) = directory.as_ref() {
                    match self.store.mark_failed(directory, &err.to_string()).await {
                        Ok(()) | Err(CoreError::NotFound(_)) => {}
                        Err(write_err) => {
                            tracing::warn!("failed to record spawn error for {}: {}", game, write_err)
                        }
                    }
                }
                return Err(CoreError::Process(format!("failed to start {helper}: {err}")));
            }
        };
        let pid = child
            .id()
            .ok_or_else(|| CoreError::Process(format!("{helper} exited before it could be tracked")))?;

        let (control, control_rx) = watch::channel(ProcessControl::Running);
        let registry = self.processes.registry(kind).clone();
        if let Some(previous) = registry.register(TrackedProcess::spawned(game, pid, kind, helper, control)) {
            tracing::info!("replacing {:?} process {} for {}", kind, previous.pid, game);
            terminate(&previous).await;
        }

        if let Some(directory) = directory.as_ref() {
            match self.store.mark_waiting(directory).await {
                Ok(()) | Err(CoreError::NotFound(_)) => {}
                Err(err) => tracing::warn!("failed to reset download state for {}: {}", game, err),
            }
        }

        if let Some(stderr) = child.stderr.take() {
            log_lines(stderr, format!("{helper} stderr"));
        }
        if let Some(stdout) = child.stdout.take() {
            self.pump_events(stdout, game.to_string(), directory);
        }
        supervise(child, registry, game.to_string(), pid, control_rx);
        Ok(pid)
    }

    /// JSON lines become record updates; anything else is helper chatter.
    fn pump_events(&self, stdout: ChildStdout, game: String, directory: Option<GameDirectory>) {
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let parsed = serde_json::from_str::<HelperEvent>(line.trim());
                match (parsed, directory.as_ref()) {
                    (Ok(event), Some(directory)) => {
                        if let Err(err) = record_event(&store, directory, &event).await {
                            tracing::warn!("failed to apply helper event for {}: {}", game, err);
                        }
                    }
                    _ => tracing::debug!("[{}] {}", game, line),
                }
            }
        });
    }

    /// Re-adopts helpers that outlived a previous run. Returns how many were
    /// picked up.
    pub async fn reconcile(&self) -> usize {
        let found = tokio::task::spawn_blocking(|| scan_downloader_processes(None))
            .await
            .unwrap_or_else(|err| {
                tracing::warn!("process scan failed: {}", err);
                Vec::new()
            });

        let mut adopted = 0;
        for info in found {
            let Some(raw_game) = info.game else {
                continue;
            };
            let game = normalize_game_name(&raw_game);
            if game.trim().is_empty() || self.processes.downloads.contains(&game) {
                continue;
            }
            self.adopt(&game, info.pid, info.kind.name());
            adopted += 1;
        }
        adopted
    }

    /// Tracks a helper this host did not spawn until its PID goes away.
    fn adopt(&self, game: &str, pid: u32, helper: &str) {
        self.processes.downloads.register(TrackedProcess::adopted(
            game,
            pid,
            ProcessKind::Download,
            helper,
        ));
        self.watch_adopted(game.to_string(), pid);
        tracing::info!("adopted {} process {} for {}", helper, pid, game);
    }

    fn watch_adopted(&self, game: String, pid: u32) {
        let registry = self.processes.downloads.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ADOPTED_POLL_INTERVAL);
            loop {
                interval.tick().await;
                if !registry.is_pid_registered(&game, pid) {
                    return;
                }
                let alive = tokio::task::spawn_blocking(move || is_pid_alive(pid))
                    .await
                    .unwrap_or(false);
                if !alive {
                    registry.take_if_pid_matches(&game, pid);
                    tracing::info!("adopted process {} for {} exited", pid, game);
                    return;
                }
            }
        });
    }

    async fn game_lock(&self, game: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.game_locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks
                .entry(game.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::events::AppEvent;
    use crate::utils::crypto::AesSealer;
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::UnboundedReceiver;
    use uuid::Uuid;

    const JPEG_BYTES: &[u8] = &[0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10];

    fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ascendara-orchestrator-{label}-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp directory");
        dir
    }

    async fn serve_image() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind image server");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let _ = socket.read(&mut buf).await;
                    let head = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        JPEG_BYTES.len()
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(JPEG_BYTES).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    struct Harness {
        orchestrator: DownloadOrchestrator,
        timestamps: TimestampStore,
        events: UnboundedReceiver<AppEvent>,
        games: PathBuf,
    }

    async fn harness(locator: HelperLocator) -> Harness {
        let root = temp_dir("root");
        let games = root.join("games");
        std::fs::create_dir_all(&games).expect("create games dir");
        let settings = SettingsStore::new(&root, Arc::new(AesSealer::new(vec![5u8; 32])));
        settings
            .save(json!({ "downloadDirectory": games.to_string_lossy(), "notifications": false }))
            .expect("save settings");
        let store = GameStore::new(settings.clone());
        let timestamps = TimestampStore::new(root.join("timestamp.ascendara.json"));
        let (emitter, events) = EventEmitter::channel();
        let config = OrchestratorConfig {
            api_url: serve_image().await,
            http_timeout: Duration::from_secs(5),
            stop_settle: Duration::ZERO,
            delete_attempts: 3,
            delete_backoff: Duration::from_millis(10),
        };
        let orchestrator = DownloadOrchestrator::new(
            settings,
            store,
            timestamps.clone(),
            locator,
            ProcessTable::new(),
            emitter,
            config,
        );
        Harness {
            orchestrator,
            timestamps,
            events,
            games,
        }
    }

    fn sleeper() -> HelperLocator {
        HelperLocator::fixed("sh", vec!["-c".to_string(), "sleep 30".to_string()])
    }

    fn request(game: &str) -> DownloadRequest {
        serde_json::from_value(json!({
            "link": "http://x/file",
            "game": game,
            "online": false,
            "dlc": false,
            "isVr": false,
            "updateFlow": false,
            "version": "1.0",
            "imgID": "img1",
            "size": "5GB",
            "additionalDirIndex": 0
        }))
        .expect("download request")
    }

    fn write_record(dir: &Path, game: &str, value: serde_json::Value) -> PathBuf {
        let game_dir = dir.join(game);
        std::fs::create_dir_all(&game_dir).expect("create game dir");
        let path = game_dir.join(format!("{game}.ascendara.json"));
        std::fs::write(&path, serde_json::to_vec(&value).expect("encode")).expect("write record");
        path
    }

    fn read_value(path: &Path) -> serde_json::Value {
        serde_json::from_slice(&std::fs::read(path).expect("read")).expect("parse")
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn download_creates_folder_image_and_handle() {
        let harness = harness(sleeper()).await;
        let orchestrator = &harness.orchestrator;

        let result = orchestrator.download(request("My Game!")).await;
        assert_eq!(result, OperationResult::ok());

        let game_dir = harness.games.join("My Game");
        assert!(game_dir.is_dir());
        assert_eq!(
            std::fs::read(game_dir.join("header.ascendara.jpg")).expect("header image"),
            JPEG_BYTES
        );
        assert!(orchestrator.processes().downloads.contains("My Game"));
        assert_eq!(harness.timestamps.history()[0].game, "My Game");

        let second = orchestrator.download(request("My Game!")).await;
        assert!(!second.success);

        let stopped = orchestrator.stop("My Game!", true).await;
        assert_eq!(stopped, OperationResult::ok());
        assert!(!game_dir.exists());
        assert!(!orchestrator.processes().downloads.contains("My Game"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_without_delete_leaves_bare_stop_marker() {
        let harness = harness(sleeper()).await;
        let record = write_record(
            &harness.games,
            "Game",
            json!({
                "game": "Game",
                "version": "2.0",
                "downloadingData": {
                    "downloading": true,
                    "extracting": false,
                    "progressCompleted": "12.00",
                    "timeUntilComplete": "3m"
                }
            }),
        );

        let result = harness.orchestrator.stop("Game", false).await;
        assert_eq!(result, OperationResult::ok());
        let value = read_value(&record);
        assert_eq!(value["downloadingData"], json!({ "stopped": true }));
        assert_eq!(value["version"], json!("2.0"));
    }

    #[tokio::test]
    async fn spawn_failure_emits_event_and_marks_record() {
        let locator = HelperLocator::fixed(
            format!("/nonexistent/ascendara-helper-{}", Uuid::new_v4()),
            Vec::new(),
        );
        let mut harness = harness(locator).await;
        let record = write_record(&harness.games, "Broken", json!({ "game": "Broken" }));

        let result = harness.orchestrator.download(request("Broken")).await;
        assert!(!result.success);

        let event = harness.events.recv().await.expect("download error event");
        assert_eq!(event.event, DOWNLOAD_ERROR);
        assert_eq!(event.payload["game"], json!("Broken"));
        let value = read_value(&record);
        assert_eq!(value["downloadingData"]["error"], json!(true));
        assert!(!harness.orchestrator.processes().downloads.contains("Broken"));
    }

    #[tokio::test]
    async fn invalid_directory_index_fails_without_spawning() {
        let mut harness = harness(sleeper()).await;
        let mut invalid = request("Game");
        invalid.additional_dir_index = 3;

        let result = harness.orchestrator.download(invalid).await;
        assert!(!result.success);
        assert_eq!(harness.events.recv().await.expect("event").event, DOWNLOAD_ERROR);
        assert!(!harness.orchestrator.processes().downloads.contains("Game"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn retry_replaces_previous_handle() {
        let harness = harness(sleeper()).await;
        let orchestrator = &harness.orchestrator;
        let retry = retry_request("Game");

        assert!(orchestrator.retry(retry.clone()).await.success);
        let first = orchestrator.processes().retries.get("Game").expect("first retry").pid;
        assert!(orchestrator.retry(retry).await.success);
        let second = orchestrator.processes().retries.get("Game").expect("second retry").pid;
        assert_ne!(first, second);

        assert!(orchestrator.stop("Game", false).await.success);
        assert!(!orchestrator.processes().retries.contains("Game"));
    }

    fn retry_request(game: &str) -> RetryRequest {
        serde_json::from_value(json!({
            "link": "http://x/file",
            "game": game,
            "version": "1.0"
        }))
        .expect("retry request")
    }

    async fn wait_until_installed(record_path: &Path) -> bool {
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if let Ok(bytes) = std::fs::read(record_path) {
                let record: GameRecord = serde_json::from_slice(&bytes).expect("parse record");
                if record.is_installed() {
                    return true;
                }
            }
        }
        false
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn download_and_retry_never_run_side_by_side() {
        let harness = harness(sleeper()).await;
        let orchestrator = &harness.orchestrator;

        assert!(orchestrator.download(request("Game")).await.success);
        let download_pid = orchestrator.processes().downloads.get("Game").expect("download").pid;

        assert!(orchestrator.retry(retry_request("Game")).await.success);
        assert!(!orchestrator.processes().downloads.contains("Game"));
        let retry_pid = orchestrator.processes().retries.get("Game").expect("retry").pid;
        assert_ne!(download_pid, retry_pid);

        let refused = orchestrator.download(request("Game")).await;
        assert!(!refused.success);
        assert!(!orchestrator.processes().downloads.contains("Game"));
        assert!(orchestrator.processes().retries.is_pid_registered("Game", retry_pid));

        assert!(orchestrator.stop("Game", false).await.success);
        assert!(!orchestrator.processes().retries.contains("Game"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stopped_game_is_retried_to_installed() {
        let script = r#"echo '{"event":"progress","progressCompleted":"40.00"}'; echo '{"event":"phase","phase":"extracting"}'; echo '{"event":"complete"}'"#;
        let locator = HelperLocator::fixed("sh", vec!["-c".to_string(), script.to_string()]);
        let harness = harness(locator).await;
        let record_path = write_record(
            &harness.games,
            "Game",
            json!({
                "game": "Game",
                "version": "1.0",
                "downloadingData": { "downloading": true, "progressCompleted": "10.00" }
            }),
        );

        assert!(harness.orchestrator.stop("Game", false).await.success);
        assert_eq!(read_value(&record_path)["downloadingData"], json!({ "stopped": true }));

        assert!(harness.orchestrator.retry(retry_request("Game")).await.success);
        assert!(
            wait_until_installed(&record_path).await,
            "retried record never reached the installed state"
        );
        assert_eq!(read_value(&record_path)["version"], json!("1.0"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_download_is_reset_when_retried() {
        let script = r#"sleep 0.2; echo '{"event":"progress","progressCompleted":"99.00"}'; echo '{"event":"complete"}'"#;
        let locator = HelperLocator::fixed("sh", vec!["-c".to_string(), script.to_string()]);
        let harness = harness(locator).await;
        let record_path = write_record(
            &harness.games,
            "Game",
            json!({
                "game": "Game",
                "downloadingData": {
                    "error": true,
                    "message": "network",
                    "verifyError": [{ "file": "game.exe", "error": "File not found" }]
                }
            }),
        );

        assert!(harness.orchestrator.retry(retry_request("Game")).await.success);
        let reset: GameRecord = serde_json::from_slice(&std::fs::read(&record_path).expect("read record"))
            .expect("parse record");
        assert_eq!(reset.phase(), DownloadPhase::Waiting);
        assert!(
            wait_until_installed(&record_path).await,
            "failed record never recovered"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn adopted_helper_is_dropped_when_it_exits() {
        let harness = harness(sleeper()).await;
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "sleep 30"])
            .spawn()
            .expect("spawn sleep");
        let pid = child.id().expect("pid");

        harness.orchestrator.adopt("Game", pid, "AscendaraDownloader");
        let tracked = harness.orchestrator.processes().downloads.get("Game").expect("adopted entry");
        assert!(tracked.adopted);
        assert_eq!(tracked.pid, pid);

        child.kill().await.expect("kill sleep");
        let mut removed = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(250)).await;
            if !harness.orchestrator.processes().downloads.contains("Game") {
                removed = true;
                break;
            }
        }
        assert!(removed, "adopted entry outlived its process");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_kills_adopted_helper_by_pid() {
        let harness = harness(sleeper()).await;
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "sleep 30"])
            .spawn()
            .expect("spawn sleep");
        let pid = child.id().expect("pid");
        harness.orchestrator.adopt("Game", pid, "AscendaraDownloader");

        assert!(harness.orchestrator.stop("Game", false).await.success);
        assert!(!harness.orchestrator.processes().downloads.contains("Game"));
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("adopted helper exited")
            .expect("wait for adopted helper");
        assert!(!status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn helper_stdout_events_update_record() {
        let script = r#"echo '{"event":"progress","progressCompleted":"50.00"}'; echo 'plain log line'; echo '{"event":"complete"}'"#;
        let locator = HelperLocator::fixed("sh", vec!["-c".to_string(), script.to_string()]);
        let harness = harness(locator).await;

        assert!(harness.orchestrator.download(request("Streamed")).await.success);
        let record_path = harness.games.join("Streamed").join("Streamed.ascendara.json");

        let mut settled = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if let Ok(bytes) = std::fs::read(&record_path) {
                let record: GameRecord = serde_json::from_slice(&bytes).expect("parse record");
                if record.downloading_data.is_none() {
                    settled = true;
                    break;
                }
            }
        }
        assert!(settled, "record never reached the installed state");
    }

    #[test]
    fn helper_events_follow_phase_rules() {
        let mut record = GameRecord::new("Game");
        let progress: HelperEvent =
            serde_json::from_str(r#"{"event":"progress","progressCompleted":"10.00","progressDownloadSpeeds":"1 MB/s"}"#)
                .expect("progress event");
        assert!(apply_helper_event(&mut record, &progress));
        assert_eq!(record.phase(), DownloadPhase::Downloading);

        let extracting = HelperEvent::Phase {
            phase: "extracting".to_string(),
        };
        assert!(apply_helper_event(&mut record, &extracting));
        let backwards = HelperEvent::Phase {
            phase: "downloading".to_string(),
        };
        assert!(!apply_helper_event(&mut record, &backwards));
        assert_eq!(record.phase(), DownloadPhase::Extracting);

        assert!(apply_helper_event(&mut record, &HelperEvent::Complete));
        assert!(record.is_installed());
    }

    #[test]
    fn failed_record_accepts_a_restarted_pipeline() {
        let mut record = GameRecord::new("Game");
        record.downloading_data = Some(DownloadingData::failed("network"));
        let downloading = HelperEvent::Phase {
            phase: "downloading".to_string(),
        };
        assert!(apply_helper_event(&mut record, &downloading));
        assert_eq!(record.phase(), DownloadPhase::Downloading);
        assert!(apply_helper_event(&mut record, &HelperEvent::Complete));
        assert!(record.is_installed());
    }

    #[test]
    fn stopped_records_ignore_progress_and_errors() {
        let mut record = GameRecord::new("Game");
        record.downloading_data = Some(DownloadingData::stopped());
        let progress = HelperEvent::Progress {
            progress_completed: Some("90.00".to_string()),
            progress_download_speeds: None,
            time_until_complete: None,
        };
        assert!(!apply_helper_event(&mut record, &progress));
        assert_eq!(record.downloading_data, Some(DownloadingData::stopped()));

        let error: HelperEvent = serde_json::from_str(r#"{"event":"error","message":"disk full"}"#).expect("error event");
        assert!(!apply_helper_event(&mut record, &error));
        assert_eq!(record.phase(), DownloadPhase::Stopped);

        let mut running = GameRecord::new("Game");
        assert!(apply_helper_event(&mut running, &error));
        assert_eq!(
            running.phase(),
            DownloadPhase::Failed {
                message: "disk full".to_string()
            }
        );
    }
}
