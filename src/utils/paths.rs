use std::path::{Path, PathBuf};

fn ensure_dir(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        return None;
    }
    if std::fs::create_dir_all(path).is_ok() {
        return Some(path.to_path_buf());
    }
    None
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn is_portable_root(path: &Path) -> bool {
    path.join("portable.config.json").exists()
}

pub fn resolve_root_dir() -> PathBuf {
    if let Some(path) = env_path("ASCENDARA_ROOT_DIR") {
        if let Some(dir) = ensure_dir(&path) {
            return dir;
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if is_portable_root(dir) {
                return dir.to_path_buf();
            }
        }
    }

    if let Some(data) = dirs::data_dir() {
        if let Some(found) = ensure_dir(&data.join("ascendara")) {
            return found;
        }
    }

    if let Some(local) = dirs::data_local_dir() {
        if let Some(found) = ensure_dir(&local.join("ascendara")) {
            return found;
        }
    }

    PathBuf::from(".")
}

/// Holds `ascendarasettings.json` and the settings key.
pub fn resolve_data_dir() -> PathBuf {
    resolve_root_dir()
}

pub fn resolve_log_dir() -> PathBuf {
    if let Some(path) = env_path("ASCENDARA_LOG_DIR") {
        if let Some(dir) = ensure_dir(&path) {
            return dir;
        }
    }

    let root_logs = resolve_root_dir().join("logs");
    if let Some(found) = ensure_dir(&root_logs) {
        return found;
    }

    PathBuf::from("logs")
}

/// Directory holding the downloader/handler helpers.
pub fn resolve_helper_dir() -> PathBuf {
    if let Some(path) = env_path("ASCENDARA_HELPER_DIR") {
        return path;
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            return dir.join("resources");
        }
    }

    PathBuf::from("resources")
}

/// `timestamp.ascendara.json` lives directly in the user's home on every OS.
pub fn resolve_timestamp_file() -> PathBuf {
    if let Some(path) = env_path("ASCENDARA_TIMESTAMP_FILE") {
        return path;
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("timestamp.ascendara.json")
}
