use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sysinfo::Disks;

use crate::errors::{CoreError, Result};
use crate::models::DriveSpace;
use crate::utils::file::dir_size;

const CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const REFRESH_DEBOUNCE: Duration = Duration::from_secs(10);

pub trait DiskStats: Send + Sync {
    fn query(&self, directory: &Path) -> Result<DriveSpace>;
}

/// Picks the disk with the longest mount point that contains the directory.
#[derive(Clone, Copy, Debug, Default)]
pub struct SysinfoDiskStats;

fn nearest_existing_path(path: &Path) -> PathBuf {
    let mut candidate = path.to_path_buf();
    while !candidate.exists() {
        if !candidate.pop() {
            return PathBuf::from(".");
        }
    }
    candidate
}

impl DiskStats for SysinfoDiskStats {
    fn query(&self, directory: &Path) -> Result<DriveSpace> {
        let target = nearest_existing_path(directory);
        let target = std::fs::canonicalize(&target).unwrap_or(target);
        let disks = Disks::new_with_refreshed_list();

        let mut best: Option<(usize, DriveSpace)> = None;
        for disk in disks.list() {
            let mount = disk.mount_point();
            if target.starts_with(mount) {
                let score = mount.as_os_str().to_string_lossy().len();
                match best {
                    Some((best_score, _)) if best_score >= score => {}
                    _ => {
                        best = Some((
                            score,
                            DriveSpace {
                                free_space: disk.available_space(),
                                total_space: disk.total_space(),
                            },
                        ))
                    }
                }
            }
        }

        best.map(|(_, space)| space).ok_or_else(|| {
            CoreError::NotFound(format!("no disk found for {}", directory.display()))
        })
    }
}

#[derive(Clone, Copy)]
struct CachedSpace {
    space: DriveSpace,
    measured_at: Instant,
}

/// Per-directory drive space with stale-while-revalidate refreshes.
#[derive(Clone)]
pub struct DriveSpaceCache {
    stats: Arc<dyn DiskStats>,
    entries: Arc<Mutex<HashMap<PathBuf, CachedSpace>>>,
    pending: Arc<Mutex<HashSet<PathBuf>>>,
    ttl: Duration,
    debounce: Duration,
}

impl DriveSpaceCache {
    pub fn new(stats: Arc<dyn DiskStats>) -> Self {
        Self::with_timing(stats, CACHE_TTL, REFRESH_DEBOUNCE)
    }

    pub fn with_timing(stats: Arc<dyn DiskStats>, ttl: Duration, debounce: Duration) -> Self {
        Self {
            stats,
            entries: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashSet::new())),
            ttl,
            debounce,
        }
    }

    /// Fresh entries are returned as is. Stale entries are returned while one
    /// debounced refresh per directory runs. Unknown directories are queried
    /// inline.
    pub async fn get(&self, directory: &Path) -> Result<DriveSpace> {
        let cached = lock(&self.entries).get(directory).copied();
        if let Some(cached) = cached {
            if cached.measured_at.elapsed() >= self.ttl {
                self.schedule_refresh(directory);
            }
            return Ok(cached.space);
        }

        let space = query_disks(self.stats.clone(), directory.to_path_buf()).await?;
        lock(&self.entries).insert(
            directory.to_path_buf(),
            CachedSpace {
                space,
                measured_at: Instant::now(),
            },
        );
        Ok(space)
    }

    fn schedule_refresh(&self, directory: &Path) {
        if !lock(&self.pending).insert(directory.to_path_buf()) {
            return;
        }
        let cache = self.clone();
        let directory = directory.to_path_buf();
        tokio::spawn(async move {
            tokio::time::sleep(cache.debounce).await;
            match query_disks(cache.stats.clone(), directory.clone()).await {
                Ok(space) => {
                    lock(&cache.entries).insert(
                        directory.clone(),
                        CachedSpace {
                            space,
                            measured_at: Instant::now(),
                        },
                    );
                }
                Err(err) => tracing::warn!("drive space refresh failed for {}: {}", directory.display(), err),
            }
            lock(&cache.pending).remove(&directory);
        });
    }
}

async fn query_disks(stats: Arc<dyn DiskStats>, directory: PathBuf) -> Result<DriveSpace> {
    tokio::task::spawn_blocking(move || stats.query(&directory))
        .await
        .map_err(|err| CoreError::Process(format!("disk query task failed: {err}")))?
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Recursive size of the primary install directory, cached for five minutes.
#[derive(Clone)]
pub struct InstalledSizeCache {
    entry: Arc<Mutex<Option<(PathBuf, u64, Instant)>>>,
    ttl: Duration,
}

impl Default for InstalledSizeCache {
    fn default() -> Self {
        Self::new(CACHE_TTL)
    }
}

impl InstalledSizeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entry: Arc::new(Mutex::new(None)),
            ttl,
        }
    }

    pub async fn get(&self, directory: &Path) -> Result<u64> {
        if let Some((cached_dir, size, measured_at)) = lock(&self.entry).clone() {
            if cached_dir == directory && measured_at.elapsed() < self.ttl {
                return Ok(size);
            }
        }

        let target = directory.to_path_buf();
        let size = tokio::task::spawn_blocking(move || dir_size(&target))
            .await
            .map_err(|err| CoreError::Process(format!("size task failed: {err}")))??;
        *lock(&self.entry) = Some((directory.to_path_buf(), size, Instant::now()));
        Ok(size)
    }
}
