use std::path::{Path, PathBuf};

use tokio::sync::watch;

use crate::errors::{CoreError, Result};
use crate::models::OperationResult;
use crate::services::directory_resolver::{normalize_game_name, GameDirectory};
use crate::services::events::{EventEmitter, GamePayload, GAME_CLOSED, GAME_LAUNCH_ERROR, GAME_LAUNCH_SUCCESS};
use crate::services::game_store::GameStore;
use crate::services::helper_process::{log_lines, HelperKind, HelperLocator};
use crate::services::process_table::{
    supervise, terminate, ProcessControl, ProcessKind, ProcessTable, TrackedProcess,
};

/// Where a launch resolved to. Custom games have no record to update.
#[derive(Clone, Debug)]
struct LaunchTarget {
    executable: PathBuf,
    directory: Option<GameDirectory>,
}

/// Launches installed games through the game handler and tracks them until
/// they exit.
#[derive(Clone)]
pub struct GameRuntime {
    store: GameStore,
    locator: HelperLocator,
    processes: ProcessTable,
    events: EventEmitter,
}

impl GameRuntime {
    pub fn new(store: GameStore, locator: HelperLocator, processes: ProcessTable, events: EventEmitter) -> Self {
        Self {
            store,
            locator,
            processes,
            events,
        }
    }

    pub async fn play(&self, game: &str, is_custom: bool, backup_on_close: bool) -> OperationResult {
        match self.launch(game, is_custom, backup_on_close).await {
            Ok(pid) => {
                tracing::info!("launched {} with pid {}", game, pid);
                OperationResult::ok()
            }
            Err(err) => {
                tracing::error!("failed to launch {}: {}", game, err);
                self.events.game_error(GAME_LAUNCH_ERROR, game, &err);
                OperationResult::failed(err.to_string())
            }
        }
    }

    async fn launch(&self, game: &str, is_custom: bool, backup_on_close: bool) -> Result<u32> {
        let target = if is_custom {
            self.resolve_custom(game).await?
        } else {
            self.resolve_installed(game).await?
        };
        if tokio::fs::metadata(&target.executable).await.is_err() {
            return Err(CoreError::NotFound(format!(
                "Game executable not found: {}",
                target.executable.display()
            )));
        }
        if self.processes.runs.contains(game) {
            return Err(CoreError::Process("Game is already running".to_string()));
        }

        let mut args = vec![
            target.executable.to_string_lossy().to_string(),
            is_custom.to_string(),
        ];
        if backup_on_close {
            args.push("--ludusavi".to_string());
        }
        let command = self.locator.command(HelperKind::GameHandler, args)?;
        let mut child = command.to_tokio().spawn().map_err(|err| {
            CoreError::Process(format!("failed to start {}: {err}", HelperKind::GameHandler.name()))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| CoreError::Process("game handler exited before it could be tracked".to_string()))?;

        let (control, control_rx) = watch::channel(ProcessControl::Running);
        self.processes.runs.register(TrackedProcess::spawned(
            game,
            pid,
            ProcessKind::Run,
            HelperKind::GameHandler.name(),
            control,
        ));
        if let Some(stdout) = child.stdout.take() {
            log_lines(stdout, format!("{game} handler"));
        }
        if let Some(stderr) = child.stderr.take() {
            log_lines(stderr, format!("{game} handler stderr"));
        }

        if let Some(directory) = target.directory.as_ref() {
            if let Err(err) = self.store.mark_launched(directory).await {
                tracing::warn!("failed to mark {} as launched: {}", game, err);
            }
        }

        // Must precede game-closed on the channel.
        self.events.emit(GAME_LAUNCH_SUCCESS, GamePayload { game });
        let exit = supervise(child, self.processes.runs.clone(), game.to_string(), pid, control_rx);
        let events = self.events.clone();
        let closed_game = game.to_string();
        tokio::spawn(async move {
            let code = exit.await.ok().flatten();
            tracing::info!("{} exited with code {:?}", closed_game, code);
            events.emit(GAME_CLOSED, GamePayload { game: &closed_game });
        });
        Ok(pid)
    }

    async fn resolve_installed(&self, game: &str) -> Result<LaunchTarget> {
        let name = normalize_game_name(game);
        let directory = self
            .store
            .locate_record(&name)
            .await
            .ok_or_else(|| CoreError::NotFound(format!("Game info file not found for {game}")))?;
        let record = self.store.read_record(&directory.record_path()).await?;
        let executable = record
            .executable
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| CoreError::NotFound("Executable path not found in game info".to_string()))?;
        Ok(LaunchTarget {
            executable: resolve_executable(&directory.path, executable),
            directory: Some(directory),
        })
    }

    async fn resolve_custom(&self, game: &str) -> Result<LaunchTarget> {
        let record = self
            .store
            .custom_game(game)
            .await?
            .filter(|record| !record.executable.trim().is_empty())
            .ok_or_else(|| CoreError::NotFound(format!("Game not found in games.json: {game}")))?;
        Ok(LaunchTarget {
            executable: PathBuf::from(record.executable.trim()),
            directory: None,
        })
    }

    /// Returns whether there was a running game to stop.
    pub async fn stop_game(&self, game: &str) -> bool {
        match self.processes.runs.take(game) {
            Some(process) => {
                terminate(&process).await;
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, game: &str) -> bool {
        self.processes.runs.contains(game)
    }
}

fn resolve_executable(game_dir: &Path, executable: &str) -> PathBuf {
    let path = Path::new(executable);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        game_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CustomGameRecord;
    use crate::services::events::AppEvent;
    use crate::services::settings_store::SettingsStore;
    use crate::utils::crypto::AesSealer;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use uuid::Uuid;

    struct Harness {
        runtime: GameRuntime,
        store: GameStore,
        events: UnboundedReceiver<AppEvent>,
        games: PathBuf,
    }

    fn harness(script: &str) -> Harness {
        let root = std::env::temp_dir().join(format!("ascendara-runtime-{}", Uuid::new_v4()));
        let games = root.join("games");
        std::fs::create_dir_all(&games).expect("create games dir");
        let settings = SettingsStore::new(&root, Arc::new(AesSealer::new(vec![9u8; 32])));
        settings
            .save(json!({ "downloadDirectory": games.to_string_lossy() }))
            .expect("save settings");
        let store = GameStore::new(settings);
        let (emitter, events) = EventEmitter::channel();
        let locator = HelperLocator::fixed("sh", vec!["-c".to_string(), script.to_string()]);
        Harness {
            runtime: GameRuntime::new(store.clone(), locator, ProcessTable::new(), emitter),
            store,
            events,
            games,
        }
    }

    fn install(games: &Path, game: &str) -> PathBuf {
        let dir = games.join(game);
        std::fs::create_dir_all(dir.join("bin")).expect("create game dir");
        std::fs::write(dir.join("bin").join("game.exe"), b"").expect("write executable");
        let record = dir.join(format!("{game}.ascendara.json"));
        std::fs::write(
            &record,
            serde_json::to_vec(&json!({ "game": game, "executable": "bin/game.exe", "version": "1.0" }))
                .expect("encode"),
        )
        .expect("write record");
        record
    }

    async fn next_event(events: &mut UnboundedReceiver<AppEvent>) -> AppEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .expect("event")
    }

    #[test]
    fn relative_executables_resolve_inside_the_game_folder() {
        assert_eq!(
            resolve_executable(Path::new("/games/Game"), "bin/game.exe"),
            PathBuf::from("/games/Game/bin/game.exe")
        );
        assert_eq!(
            resolve_executable(Path::new("/games/Game"), "/opt/game/run"),
            PathBuf::from("/opt/game/run")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn play_marks_launched_and_reports_close() {
        let mut harness = harness("sleep 30");
        let record = install(&harness.games, "Game");

        assert!(harness.runtime.play("Game", false, false).await.success);
        assert!(harness.runtime.is_running("Game"));
        assert_eq!(next_event(&mut harness.events).await.event, GAME_LAUNCH_SUCCESS);

        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&record).expect("read record")).expect("parse record");
        assert_eq!(value["hasBeenLaunched"], json!(true));
        assert_eq!(value["version"], json!("1.0"));

        let second = harness.runtime.play("Game", false, false).await;
        assert_eq!(second.error.as_deref(), Some("Process error: Game is already running"));
        assert_eq!(next_event(&mut harness.events).await.event, GAME_LAUNCH_ERROR);

        assert!(harness.runtime.stop_game("Game").await);
        let closed = next_event(&mut harness.events).await;
        assert_eq!(closed.event, GAME_CLOSED);
        assert_eq!(closed.payload, json!({ "game": "Game" }));
        assert!(!harness.runtime.is_running("Game"));
        assert!(!harness.runtime.stop_game("Game").await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn custom_games_launch_from_games_json() {
        let mut harness = harness("exit 0");
        let exe = harness.games.join("custom.sh");
        std::fs::write(&exe, b"").expect("write executable");
        harness
            .store
            .add_custom_game(CustomGameRecord {
                game: "Custom".to_string(),
                online: false,
                dlc: false,
                version: "-1".to_string(),
                executable: exe.to_string_lossy().to_string(),
                is_running: false,
                backups: false,
                has_rated: false,
                extra: Default::default(),
            })
            .await
            .expect("add custom game");

        assert!(harness.runtime.play("Custom", true, true).await.success);
        assert_eq!(next_event(&mut harness.events).await.event, GAME_LAUNCH_SUCCESS);
        assert_eq!(next_event(&mut harness.events).await.event, GAME_CLOSED);
    }

    #[tokio::test]
    async fn missing_executable_is_a_launch_error() {
        let mut harness = harness("exit 0");
        let record = install(&harness.games, "Game");
        std::fs::remove_file(harness.games.join("Game").join("bin").join("game.exe")).expect("remove exe");

        let result = harness.runtime.play("Game", false, false).await;
        assert!(!result.success);
        let event = next_event(&mut harness.events).await;
        assert_eq!(event.event, GAME_LAUNCH_ERROR);
        assert_eq!(event.payload["game"], json!("Game"));
        assert!(!harness.runtime.is_running("Game"));
        assert!(record.exists());

        let unknown = harness.runtime.play("Nope", false, false).await;
        assert!(!unknown.success);
    }
}
