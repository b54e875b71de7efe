use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::errors::Result;

/// Temp file is a unique sibling, renamed over `path` once synced.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    if let Some(parent) = temp_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(&temp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    fs::rename(temp_path, path)?;
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let payload = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &payload)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

/// Deletes every direct child of `dir` except the entries named in `keep`.
/// Returns the removed paths.
pub fn remove_dir_contents_except(dir: &Path, keep: &[&str]) -> io::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if keep.iter().any(|item| name.as_os_str() == *item) {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        removed.push(path);
    }
    Ok(removed)
}

pub fn dir_size(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += metadata.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ascendara-file-test-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).expect("create temp directory");
        dir
    }

    #[test]
    fn removes_everything_but_kept_entries() {
        let dir = temp_dir();
        fs::write(dir.join("Game.ascendara.json"), b"{}").expect("write record");
        fs::write(dir.join("setup.exe"), b"bin").expect("write file");
        fs::create_dir_all(dir.join("data").join("nested")).expect("create nested");
        fs::write(dir.join("data").join("nested").join("a.pak"), b"pak").expect("write nested");

        let removed = remove_dir_contents_except(&dir, &["Game.ascendara.json"]).expect("cleanup");

        assert_eq!(removed.len(), 2);
        let left: Vec<_> = fs::read_dir(&dir)
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name())
            .collect();
        assert_eq!(left, vec![std::ffi::OsString::from("Game.ascendara.json")]);
    }

    #[test]
    fn dir_size_sums_nested_files() {
        let dir = temp_dir();
        fs::create_dir_all(dir.join("sub")).expect("create sub");
        fs::write(dir.join("a"), vec![0u8; 10]).expect("write a");
        fs::write(dir.join("sub").join("b"), vec![0u8; 32]).expect("write b");
        assert_eq!(dir_size(&dir).expect("size"), 42);
    }
}
