use std::path::{Path, PathBuf, MAIN_SEPARATOR};

use crate::errors::{CoreError, Result};
use crate::models::{DownloadingData, FileMap, OperationResult, VerifyError};
use crate::services::directory_resolver::GameDirectory;
use crate::services::game_store::GameStore;
use crate::utils::file::read_json;

const MISSING_FILE: &str = "File not found";

/// Checks an install against its `filemap.ascendara.json`.
///
/// Only existence is checked. `size` is carried through as `expected_size`
/// so the record shows what was expected.
#[derive(Clone)]
pub struct VerificationEngine {
    store: GameStore,
}

impl VerificationEngine {
    pub fn new(store: GameStore) -> Self {
        Self { store }
    }

    pub async fn verify(&self, game: &str) -> OperationResult {
        match self.verify_game(game).await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!("error verifying {}: {}", game, err);
                OperationResult::failed(err.to_string())
            }
        }
    }

    async fn verify_game(&self, game: &str) -> Result<OperationResult> {
        let directory = self
            .store
            .locate_record(game)
            .await
            .ok_or_else(|| CoreError::NotFound(format!("Game info file not found for {game}")))?;
        let filemap_path = directory.filemap_path();
        let filemap: FileMap = tokio::task::spawn_blocking(move || read_json(&filemap_path))
            .await
            .map_err(|err| CoreError::Process(format!("verification task failed: {err}")))??;

        let install = directory.path.clone();
        let errors = tokio::task::spawn_blocking(move || missing_files(&install, &filemap))
            .await
            .map_err(|err| CoreError::Process(format!("verification task failed: {err}")))?;

        self.record_outcome(&directory, errors).await
    }

    async fn record_outcome(
        &self,
        directory: &GameDirectory,
        errors: Vec<VerifyError>,
    ) -> Result<OperationResult> {
        if errors.is_empty() {
            self.store
                .update_record(&directory.record_path(), |record| {
                    record.downloading_data = None;
                })
                .await?;
            tracing::info!("{} verified", directory.name);
            return Ok(OperationResult::ok());
        }

        let count = errors.len();
        tracing::warn!("{} files failed verification for {}", count, directory.name);
        self.store
            .update_record(&directory.record_path(), |record| {
                record.downloading_data = Some(DownloadingData::verify_failed(errors));
            })
            .await?;
        Ok(OperationResult::failed(format!("{count} files failed verification")))
    }
}

fn normalize_relative(path: &str) -> PathBuf {
    PathBuf::from(path.replace(|ch: char| ch == '/' || ch == '\\', &MAIN_SEPARATOR.to_string()))
}

#[cfg(target_os = "windows")]
fn file_exists(full: &Path) -> bool {
    if full.exists() {
        return true;
    }
    let text = full.to_string_lossy();
    Path::new(&text.to_lowercase()).exists() || Path::new(&text.to_uppercase()).exists()
}

#[cfg(not(target_os = "windows"))]
fn file_exists(full: &Path) -> bool {
    full.exists()
}

pub fn missing_files(install: &Path, filemap: &FileMap) -> Vec<VerifyError> {
    filemap
        .iter()
        .filter(|(relative, _)| !file_exists(&install.join(normalize_relative(relative))))
        .map(|(relative, entry)| VerifyError {
            file: relative.clone(),
            error: MISSING_FILE.to_string(),
            expected_size: entry.size,
        })
        .collect()
}
