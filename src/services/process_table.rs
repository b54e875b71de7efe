use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::services::helper_process::kill_pid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessKind {
    Download,
    Retry,
    Run,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessControl {
    Running,
    Kill,
}

/// One supervised child. Adopted entries were found by a process scan and
/// have no control channel; they can only be killed by PID.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedProcess {
    pub game: String,
    pub pid: u32,
    pub kind: ProcessKind,
    pub helper: String,
    pub started_at: i64,
    pub adopted: bool,
    #[serde(skip)]
    pub control: Option<watch::Sender<ProcessControl>>,
}

impl TrackedProcess {
    pub fn spawned(
        game: &str,
        pid: u32,
        kind: ProcessKind,
        helper: &str,
        control: watch::Sender<ProcessControl>,
    ) -> Self {
        Self {
            game: game.to_string(),
            pid,
            kind,
            helper: helper.to_string(),
            started_at: chrono::Utc::now().timestamp(),
            adopted: false,
            control: Some(control),
        }
    }

    pub fn adopted(game: &str, pid: u32, kind: ProcessKind, helper: &str) -> Self {
        Self {
            game: game.to_string(),
            pid,
            kind,
            helper: helper.to_string(),
            started_at: chrono::Utc::now().timestamp(),
            adopted: true,
            control: None,
        }
    }

    /// Asks the owning watcher to kill the child. Returns false when there is
    /// no watcher left to ask.
    pub fn signal_kill(&self) -> bool {
        match &self.control {
            Some(control) => control.send(ProcessControl::Kill).is_ok(),
            None => false,
        }
    }
}

/// Sanitized game name to tracked process.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<HashMap<String, TrackedProcess>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, game: &str) -> Option<TrackedProcess> {
        let map = self.lock();
        map.get(game).cloned()
    }

    pub fn contains(&self, game: &str) -> bool {
        let map = self.lock();
        map.contains_key(game)
    }

    /// Returns the entry this one replaced, if any.
    pub fn register(&self, process: TrackedProcess) -> Option<TrackedProcess> {
        let mut map = self.lock();
        map.insert(process.game.clone(), process)
    }

    pub fn take(&self, game: &str) -> Option<TrackedProcess> {
        let mut map = self.lock();
        map.remove(game)
    }

    /// Exit watchers use this so a late exit never evicts a newer process
    /// registered under the same name.
    pub fn take_if_pid_matches(&self, game: &str, pid: u32) -> Option<TrackedProcess> {
        let mut map = self.lock();
        match map.get(game) {
            Some(process) if process.pid == pid => map.remove(game),
            _ => None,
        }
    }

    pub fn is_pid_registered(&self, game: &str, pid: u32) -> bool {
        let map = self.lock();
        map.get(game).map(|item| item.pid == pid).unwrap_or(false)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TrackedProcess>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Clone, Default)]
pub struct ProcessTable {
    pub downloads: ProcessRegistry,
    pub retries: ProcessRegistry,
    pub runs: ProcessRegistry,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self, kind: ProcessKind) -> &ProcessRegistry {
        match kind {
            ProcessKind::Download => &self.downloads,
            ProcessKind::Retry => &self.retries,
            ProcessKind::Run => &self.runs,
        }
    }
}

/// Kills through the watcher when there is one, by PID otherwise.
pub async fn terminate(process: &TrackedProcess) {
    if process.signal_kill() {
        return;
    }
    let pid = process.pid;
    match tokio::task::spawn_blocking(move || kill_pid(pid)).await {
        Ok(Ok(())) => tracing::info!("killed process {} for {}", pid, process.game),
        Ok(Err(err)) => tracing::warn!("failed to kill process {}: {}", pid, err),
        Err(err) => tracing::warn!("kill task for process {} failed: {}", pid, err),
    }
}

async fn kill_requested(control: &mut watch::Receiver<ProcessControl>) {
    loop {
        if *control.borrow() == ProcessControl::Kill {
            return;
        }
        if control.changed().await.is_err() {
            if *control.borrow() == ProcessControl::Kill {
                return;
            }
            std::future::pending::<()>().await;
        }
    }
}

/// Waits for the child or a kill request, then drops the registry entry if
/// it still belongs to this PID. Resolves to the exit code when known.
pub fn supervise(
    mut child: Child,
    registry: ProcessRegistry,
    game: String,
    pid: u32,
    mut control: watch::Receiver<ProcessControl>,
) -> JoinHandle<Option<i32>> {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_requested(&mut control) => {
                tracing::info!("killing process {} for {}", pid, game);
                if let Err(err) = child.kill().await {
                    tracing::warn!("failed to kill process {}: {}", pid, err);
                }
                child.wait().await
            }
        };

        let code = match status {
            Ok(status) if status.success() => {
                tracing::info!("process {} for {} exited cleanly", pid, game);
                status.code()
            }
            Ok(status) => {
                tracing::warn!("process {} for {} exited with {}", pid, game, status);
                status.code()
            }
            Err(err) => {
                tracing::warn!("failed to wait for process {}: {}", pid, err);
                None
            }
        };
        registry.take_if_pid_matches(&game, pid);
        code
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn late_exit_does_not_evict_replacement() {
        let registry = ProcessRegistry::new();
        registry.register(TrackedProcess::adopted("Game", 10, ProcessKind::Download, "AscendaraDownloader"));
        let replaced = registry.register(TrackedProcess::adopted("Game", 11, ProcessKind::Download, "AscendaraDownloader"));
        assert_eq!(replaced.map(|process| process.pid), Some(10));

        assert!(registry.take_if_pid_matches("Game", 10).is_none());
        assert!(registry.is_pid_registered("Game", 11));
        assert_eq!(registry.take_if_pid_matches("Game", 11).map(|process| process.pid), Some(11));
        assert!(!registry.contains("Game"));
    }

    #[test]
    fn kill_signal_reaches_watcher() {
        let (tx, rx) = watch::channel(ProcessControl::Running);
        let process = TrackedProcess::spawned("Game", 42, ProcessKind::Run, "AscendaraGameHandler", tx);
        assert!(process.signal_kill());
        assert_eq!(*rx.borrow(), ProcessControl::Kill);

        let adopted = TrackedProcess::adopted("Game", 43, ProcessKind::Download, "AscendaraDownloader");
        assert!(!adopted.signal_kill());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn supervised_child_is_killed_and_unregistered() {
        let child = tokio::process::Command::new("sh")
            .args(["-c", "sleep 30"])
            .spawn()
            .expect("spawn sleep");
        let pid = child.id().expect("pid");
        let registry = ProcessRegistry::new();
        let (tx, rx) = watch::channel(ProcessControl::Running);
        registry.register(TrackedProcess::spawned("Game", pid, ProcessKind::Download, "sh", tx));

        let watcher = supervise(child, registry.clone(), "Game".to_string(), pid, rx);
        assert!(registry.get("Game").map(|process| process.signal_kill()).unwrap_or(false));
        let code = tokio::time::timeout(std::time::Duration::from_secs(5), watcher)
            .await
            .expect("watcher finished")
            .expect("watcher joined");
        assert_ne!(code, Some(0));
        assert!(!registry.contains("Game"));
    }

    #[test]
    fn registries_are_independent() {
        let table = ProcessTable::new();
        table
            .registry(ProcessKind::Retry)
            .register(TrackedProcess::adopted("Game", 1, ProcessKind::Retry, "AscendaraDownloader"));
        assert!(table.retries.contains("Game"));
        assert!(!table.downloads.contains("Game"));
        assert!(!table.runs.contains("Game"));
    }
}
