use std::path::{Path, PathBuf};

use crate::errors::{CoreError, Result};
use crate::models::{FILEMAP_FILE, GAME_RECORD_SUFFIX};
use crate::services::settings_store::Settings;
use crate::utils::file::remove_dir_contents_except;

const NAME_PUNCTUATION: &str = " -_.()";

// Upstream listings arrive double-encoded; map the common artifacts back.
const MOJIBAKE: [(&str, &str); 7] = [
    ("ŌĆÖ", "'"),
    ("ŌĆō", "-"),
    ("├Č", "ö"),
    ("ŌĆ£", "\""),
    ("ŌĆØ", "\""),
    ("ŌĆ\"", "..."),
    ("ŌĆś", "'"),
];

pub fn is_allowed_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || NAME_PUNCTUATION.contains(ch)
}

/// Text-level cleanup: repairs encoding artifacts and smart quotes, turns
/// path separators into dashes and drops characters Windows rejects.
pub fn sanitize_text(text: &str) -> String {
    let mut value = text.to_string();
    for (broken, fixed) in MOJIBAKE {
        value = value.replace(broken, fixed);
    }
    value
        .chars()
        .map(|ch| match ch {
            '\u{2018}' | '\u{2019}' => '\'',
            '\u{201C}' | '\u{201D}' => '"',
            '/' | ':' => '-',
            other => other,
        })
        .filter(|ch| !matches!(ch, '<' | '>' | '"' | '\\' | '|' | '?' | '*'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Path-level cleanup: keeps only `[A-Za-z0-9 -_.()]`.
pub fn sanitize_game_name(name: &str) -> String {
    name.chars().filter(|ch| is_allowed_name_char(*ch)).collect()
}

/// Both cleanup stages; this is the on-disk folder name and the process key.
pub fn normalize_game_name(raw: &str) -> String {
    let cleaned = sanitize_game_name(&sanitize_text(raw));
    let trimmed = cleaned.trim();
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }
    sanitize_game_name(raw)
}

pub fn record_file_name(game: &str) -> String {
    format!("{game}{GAME_RECORD_SUFFIX}")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GameDirectory {
    pub root: PathBuf,
    pub path: PathBuf,
    pub name: String,
}

impl GameDirectory {
    pub fn new(root: &Path, name: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            path: root.join(name),
            name: name.to_string(),
        }
    }

    pub fn record_path(&self) -> PathBuf {
        self.path.join(record_file_name(&self.name))
    }

    pub fn filemap_path(&self) -> PathBuf {
        self.path.join(FILEMAP_FILE)
    }
}

/// Maps a game name and directory selector onto an install folder.
#[derive(Clone, Debug)]
pub struct DirectoryResolver {
    primary: Option<PathBuf>,
    additional: Vec<String>,
}

impl DirectoryResolver {
    pub fn new(settings: &Settings) -> Self {
        Self {
            primary: settings.primary_directory(),
            additional: settings.additional_directories.clone(),
        }
    }

    pub fn primary(&self) -> Result<PathBuf> {
        self.primary
            .clone()
            .ok_or_else(|| CoreError::Config("Download directory not set".to_string()))
    }

    pub fn all_directories(&self) -> Vec<PathBuf> {
        self.primary
            .iter()
            .cloned()
            .chain(
                self.additional
                    .iter()
                    .map(|dir| dir.trim())
                    .filter(|dir| !dir.is_empty())
                    .map(PathBuf::from),
            )
            .collect()
    }

    /// 0 is the primary directory, 1..=N index the additional directories.
    pub fn target_root(&self, additional_dir_index: usize) -> Result<PathBuf> {
        if additional_dir_index == 0 {
            return self.primary();
        }
        self.additional
            .get(additional_dir_index - 1)
            .map(|dir| dir.trim())
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| {
                CoreError::Config(format!(
                    "Invalid additional directory index: {additional_dir_index}"
                ))
            })
    }

    pub async fn prepare_new(&self, game: &str, additional_dir_index: usize) -> Result<GameDirectory> {
        ensure_usable_name(game)?;
        let root = self.target_root(additional_dir_index)?;
        let directory = GameDirectory::new(&root, game);
        tracing::info!("creating game directory at {}", directory.path.display());
        tokio::fs::create_dir_all(&directory.path).await?;
        Ok(directory)
    }

    /// Finds the existing install and empties it, keeping only the
    /// descriptor. Never creates a folder: that would orphan the original.
    pub async fn prepare_update(&self, game: &str) -> Result<GameDirectory> {
        ensure_usable_name(game)?;
        let Some(directory) = self.locate(game).await else {
            tracing::error!("no existing game directory for update: {}", game);
            return Err(CoreError::NotFound(format!(
                "Could not find existing game directory for update: {game}"
            )));
        };

        let keep = record_file_name(game);
        let path = directory.path.clone();
        let removed = tokio::task::spawn_blocking(move || {
            remove_dir_contents_except(&path, &[keep.as_str()])
        })
        .await
        .map_err(|err| CoreError::Process(format!("cleanup task failed: {err}")))??;
        tracing::info!(
            "cleaned {} entries from {} for update",
            removed.len(),
            directory.path.display()
        );
        Ok(directory)
    }

    /// First configured directory holding an accessible `<dir>/<game>/`.
    pub async fn locate(&self, game: &str) -> Option<GameDirectory> {
        if game.trim().is_empty() {
            return None;
        }
        for root in self.all_directories() {
            let directory = GameDirectory::new(&root, game);
            match tokio::fs::metadata(&directory.path).await {
                Ok(meta) if meta.is_dir() => return Some(directory),
                Ok(_) => tracing::debug!("{} is not a directory", directory.path.display()),
                Err(_) => tracing::debug!("game directory not found: {}", directory.path.display()),
            }
        }
        None
    }
}

fn ensure_usable_name(game: &str) -> Result<()> {
    if game.trim().is_empty() || game == "." || game == ".." {
        return Err(CoreError::Config(format!(
            "game name has no filesystem-safe characters: {game:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ascendara-resolver-{label}-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp directory");
        dir
    }

    fn settings_with(primary: &Path, additional: &[&Path]) -> Settings {
        Settings {
            download_directory: primary.to_string_lossy().to_string(),
            additional_directories: additional
                .iter()
                .map(|dir| dir.to_string_lossy().to_string())
                .collect(),
            ..Settings::default()
        }
    }

    #[test]
    fn sanitized_names_only_contain_allowed_characters() {
        let samples = [
            "My Game!",
            "Baldur's Gate 3: Deluxe",
            "ŌĆÖQuoteŌĆØ",
            "Half/Life",
            "Ünïcödé ✓ Edition",
            "?*<>|",
            "   ",
            "a",
            "Tom Clancy’s “Division”",
        ];
        for sample in samples {
            let sanitized = sanitize_game_name(sample);
            assert!(sanitized.chars().all(is_allowed_name_char), "{sample:?} -> {sanitized:?}");
            if sample.chars().any(is_allowed_name_char) {
                assert!(!sanitized.is_empty(), "{sample:?} lost every allowed character");
            }

            let normalized = normalize_game_name(sample);
            assert!(normalized.chars().all(is_allowed_name_char), "{sample:?} -> {normalized:?}");
        }
    }

    #[test]
    fn normalization_strips_punctuation_and_keeps_spaces() {
        assert_eq!(normalize_game_name("My Game!"), "My Game");
        assert_eq!(normalize_game_name("Half/Life: Source"), "Half-Life- Source");
        assert_eq!(sanitize_text("Tom Clancy’s"), "Tom Clancy's");
        assert_eq!(sanitize_text("ŌĆ£QuotedŌĆØ"), "Quoted");
    }

    #[test]
    fn index_zero_is_always_primary() {
        let primary = temp_dir("primary");
        let extra = temp_dir("extra");
        let resolver = DirectoryResolver::new(&settings_with(&primary, &[&extra]));
        assert_eq!(resolver.target_root(0).expect("primary"), primary);
        assert_eq!(resolver.target_root(1).expect("additional"), extra);
        assert!(matches!(resolver.target_root(2), Err(CoreError::Config(_))));
    }

    #[test]
    fn missing_primary_is_a_config_error() {
        let resolver = DirectoryResolver::new(&Settings::default());
        assert!(matches!(resolver.target_root(0), Err(CoreError::Config(_))));
    }

    #[tokio::test]
    async fn new_download_creates_game_folder() {
        let primary = temp_dir("new");
        let resolver = DirectoryResolver::new(&settings_with(&primary, &[]));
        let directory = resolver.prepare_new("My Game", 0).await.expect("prepare");
        assert_eq!(directory.path, primary.join("My Game"));
        assert!(directory.path.is_dir());
        assert_eq!(directory.record_path(), primary.join("My Game").join("My Game.ascendara.json"));
    }

    #[tokio::test]
    async fn update_flow_cleans_install_in_additional_directory() {
        let primary = temp_dir("upd-primary");
        let first = temp_dir("upd-first");
        let second = temp_dir("upd-second");
        let game_dir = second.join("Game");
        std::fs::create_dir_all(game_dir.join("bin")).expect("create bin");
        std::fs::write(game_dir.join("Game.ascendara.json"), b"{\"game\":\"Game\"}").expect("write record");
        std::fs::write(game_dir.join("bin").join("game.exe"), b"exe").expect("write exe");
        std::fs::write(game_dir.join("header.ascendara.jpg"), b"img").expect("write image");
        let outside = second.join("Other");
        std::fs::create_dir_all(&outside).expect("create sibling");
        std::fs::write(outside.join("keep.txt"), b"keep").expect("write sibling file");

        let resolver = DirectoryResolver::new(&settings_with(&primary, &[&first, &second]));
        let directory = resolver.prepare_update("Game").await.expect("prepare update");

        assert_eq!(directory.root, second);
        let remaining: Vec<_> = std::fs::read_dir(&game_dir)
            .expect("read game dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(remaining, vec!["Game.ascendara.json".to_string()]);
        assert!(outside.join("keep.txt").exists());
        assert!(!primary.join("Game").exists());
    }

    #[tokio::test]
    async fn update_flow_without_install_fails_and_creates_nothing() {
        let primary = temp_dir("upd-missing");
        let resolver = DirectoryResolver::new(&settings_with(&primary, &[]));
        let result = resolver.prepare_update("Ghost").await;
        assert!(matches!(result, Err(CoreError::NotFound(_))));
        assert!(!primary.join("Ghost").exists());
    }
}
