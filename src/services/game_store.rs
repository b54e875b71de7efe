use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::errors::{CoreError, Result};
use crate::models::{
    CustomGameRecord, CustomGamesFile, DownloadingData, GameRecord, CUSTOM_GAMES_FILE,
};
use crate::services::directory_resolver::{record_file_name, DirectoryResolver, GameDirectory};
use crate::services::settings_store::SettingsStore;
use crate::utils::file::write_json_atomic;

const CUSTOM_IMAGE_DIR: &str = "games";
const CUSTOM_IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomGameListing {
    #[serde(flatten)]
    pub record: CustomGameRecord,
    pub image_path: Option<PathBuf>,
}

/// Owns every read-modify-write of game descriptors and `games.json`.
#[derive(Clone)]
pub struct GameStore {
    settings: SettingsStore,
    locks: Arc<Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>>,
}

impl GameStore {
    pub fn new(settings: SettingsStore) -> Self {
        Self {
            settings,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn resolver(&self) -> DirectoryResolver {
        DirectoryResolver::new(&self.settings.load())
    }

    pub async fn read_record(&self, path: &Path) -> Result<GameRecord> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::NotFound(format!(
                    "game record not found: {}",
                    path.display()
                )))
            }
            Err(err) => return Err(err.into()),
        };
        let record: GameRecord = serde_json::from_slice(&bytes)?;
        if record
            .downloading_data
            .as_ref()
            .map(DownloadingData::has_conflicting_flags)
            .unwrap_or(false)
        {
            tracing::warn!(
                "conflicting phase flags in {}, treating as {:?}",
                path.display(),
                record.phase()
            );
        }
        Ok(record)
    }

    pub async fn write_record(&self, path: &Path, record: &GameRecord) -> Result<()> {
        let _guard = self.file_lock(path).await;
        write_json_atomic(path, record)
    }

    /// Serialised read-modify-write of one descriptor. Fails with `NotFound`
    /// when the file does not exist yet.
    pub async fn update_record<F>(&self, path: &Path, apply: F) -> Result<GameRecord>
    where
        F: FnOnce(&mut GameRecord),
    {
        let _guard = self.file_lock(path).await;
        let mut record = self.read_record(path).await?;
        apply(&mut record);
        write_json_atomic(path, &record)?;
        Ok(record)
    }

    /// First configured directory that holds `<game>/<game>.ascendara.json`.
    pub async fn locate_record(&self, game: &str) -> Option<GameDirectory> {
        for root in self.resolver().all_directories() {
            let directory = GameDirectory::new(&root, game);
            if tokio::fs::metadata(directory.record_path()).await.is_ok() {
                return Some(directory);
            }
        }
        None
    }

    /// Replaces any progress with the bare stop marker. Returns whether a
    /// record was found.
    pub async fn mark_stopped(&self, game: &str) -> Result<bool> {
        let Some(directory) = self.locate_record(game).await else {
            tracing::warn!("no game record to mark stopped for {}", game);
            return Ok(false);
        };
        self.update_record(&directory.record_path(), |record| {
            record.downloading_data = Some(DownloadingData::stopped());
        })
        .await?;
        tracing::info!("marked {} as stopped", game);
        Ok(true)
    }

    /// Drops any stop, failure or verify result left from an earlier run.
    pub async fn mark_waiting(&self, directory: &GameDirectory) -> Result<()> {
        self.update_record(&directory.record_path(), |record| {
            record.downloading_data = Some(DownloadingData::waiting());
        })
        .await
        .map(|_| ())
    }

    pub async fn mark_failed(&self, directory: &GameDirectory, message: &str) -> Result<()> {
        self.update_record(&directory.record_path(), |record| {
            record.downloading_data = Some(DownloadingData::failed(message));
        })
        .await
        .map(|_| ())
    }

    pub async fn mark_launched(&self, directory: &GameDirectory) -> Result<()> {
        self.update_record(&directory.record_path(), |record| {
            record.has_been_launched = true;
        })
        .await
        .map(|_| ())
    }

    /// Every readable descriptor across all install directories.
    pub async fn list_games(&self) -> Vec<GameRecord> {
        let directories = self.resolver().all_directories();
        let per_directory = directories
            .iter()
            .map(|root| self.list_directory(root));
        join_all(per_directory).await.into_iter().flatten().collect()
    }

    async fn list_directory(&self, root: &Path) -> Vec<GameRecord> {
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!("failed to read install directory {}: {}", root.display(), err);
                return Vec::new();
            }
        };

        let mut games = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!("failed to list {}: {}", root.display(), err);
                    break;
                }
            };
            let is_dir = entry.file_type().await.map(|kind| kind.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let record_path = entry.path().join(record_file_name(&name));
            match self.read_record(&record_path).await {
                Ok(record) => games.push(record),
                Err(CoreError::NotFound(_)) => {}
                Err(err) => tracing::warn!("skipping unreadable record {}: {}", record_path.display(), err),
            }
        }
        games
    }

    pub async fn is_downloader_running(&self) -> bool {
        self.list_games()
            .await
            .iter()
            .any(|record| record.downloading_data.is_some())
    }

    /// Removes the game folder from whichever directory holds it.
    pub async fn delete_game(&self, game: &str) -> Result<PathBuf> {
        let directory = self
            .resolver()
            .locate(game)
            .await
            .ok_or_else(|| CoreError::NotFound(format!("Game directory not found for {game}")))?;
        tokio::fs::remove_dir_all(&directory.path).await?;
        tracing::info!("deleted game from directory: {}", directory.path.display());
        Ok(directory.path)
    }

    pub async fn set_backups(&self, game: &str, is_custom: bool, enabled: bool) -> Result<()> {
        if is_custom {
            return self.update_custom_game(game, |entry| entry.backups = enabled).await;
        }
        let directory = self.require_record(game).await?;
        self.update_record(&directory.record_path(), |record| record.backups = enabled)
            .await
            .map(|_| ())
    }

    pub async fn set_rated(&self, game: &str, is_custom: bool) -> Result<()> {
        if is_custom {
            return self.update_custom_game(game, |entry| entry.has_rated = true).await;
        }
        let directory = self.require_record(game).await?;
        self.update_record(&directory.record_path(), |record| record.has_rated = true)
            .await
            .map(|_| ())
    }

    async fn require_record(&self, game: &str) -> Result<GameDirectory> {
        self.locate_record(game)
            .await
            .ok_or_else(|| CoreError::NotFound(format!("Game info file not found for {game}")))
    }

    fn custom_games_path(&self) -> Result<PathBuf> {
        Ok(self.resolver().primary()?.join(CUSTOM_GAMES_FILE))
    }

    pub fn custom_images_dir(&self) -> Result<PathBuf> {
        Ok(self.resolver().primary()?.join(CUSTOM_IMAGE_DIR))
    }

    async fn read_custom_games(&self, path: &Path) -> Result<CustomGamesFile> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(CustomGamesFile::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn custom_game(&self, game: &str) -> Result<Option<CustomGameRecord>> {
        let path = self.custom_games_path()?;
        let file = self.read_custom_games(&path).await?;
        Ok(file.games.into_iter().find(|entry| entry.game == game))
    }

    pub async fn custom_games(&self) -> Result<Vec<CustomGameListing>> {
        let path = self.custom_games_path()?;
        let images = self.custom_images_dir()?;
        let file = self.read_custom_games(&path).await?;
        let mut listings = Vec::with_capacity(file.games.len());
        for record in file.games {
            let image_path = find_custom_image(&images, &record.game).await;
            listings.push(CustomGameListing { record, image_path });
        }
        Ok(listings)
    }

    pub async fn add_custom_game(&self, record: CustomGameRecord) -> Result<()> {
        let path = self.custom_games_path()?;
        let _guard = self.file_lock(&path).await;
        let mut file = self.read_custom_games(&path).await?;
        tracing::info!("adding custom game {}", record.game);
        file.games.push(record);
        write_json_atomic(&path, &file)
    }

    /// Drops the entry and its cover image. Returns whether it existed.
    pub async fn remove_custom_game(&self, game: &str) -> Result<bool> {
        let path = self.custom_games_path()?;
        {
            let _guard = self.file_lock(&path).await;
            let mut file = self.read_custom_games(&path).await?;
            let before = file.games.len();
            file.games.retain(|entry| entry.game != game);
            if file.games.len() == before {
                return Ok(false);
            }
            write_json_atomic(&path, &file)?;
        }

        if let Some(image) = find_custom_image(&self.custom_images_dir()?, game).await {
            tokio::fs::remove_file(&image).await?;
            tracing::info!("removed image file: {}", image.display());
        }
        Ok(true)
    }

    async fn update_custom_game<F>(&self, game: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut CustomGameRecord),
    {
        let path = self.custom_games_path()?;
        let _guard = self.file_lock(&path).await;
        let mut file = self.read_custom_games(&path).await?;
        let entry = file
            .games
            .iter_mut()
            .find(|entry| entry.game == game)
            .ok_or_else(|| CoreError::NotFound("Custom game not found".to_string()))?;
        apply(entry);
        write_json_atomic(&path, &file)
    }

    async fn file_lock(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

async fn find_custom_image(images: &Path, game: &str) -> Option<PathBuf> {
    for extension in CUSTOM_IMAGE_EXTENSIONS {
        let candidate = images.join(format!("{game}.ascendara.{extension}"));
        if tokio::fs::metadata(&candidate).await.is_ok() {
            return Some(candidate);
        }
    }
    None
}
