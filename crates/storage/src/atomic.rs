//! Write-temp-then-rename file replacement.
//!
//! Readers of the store only ever see a complete old file or a complete new
//! one. Temp files live in the target's directory (rename is only atomic
//! within one filesystem) and start with `.`, so listings skip them.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{StoreError, StoreResult};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A unique temp path next to `target`.
pub fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    target.with_file_name(format!(".{}.{}.{}.tmp", name, std::process::id(), n))
}

/// Whether a directory entry is an in-flight temp file.
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".tmp")
}

/// A fully written temp file waiting to be renamed over its target.
///
/// Dropping it without [`PreparedWrite::commit`] leaves the target untouched;
/// the orphaned temp file is ignored by every reader.
#[derive(Debug)]
#[must_use = "nothing is visible until the write is committed"]
pub struct PreparedWrite {
    temp: PathBuf,
    target: PathBuf,
}

impl PreparedWrite {
    /// Write `data` to a temp file beside `target`, flushed to disk.
    pub async fn prepare(target: &Path, data: &[u8]) -> StoreResult<Self> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.map_err(StoreError::io(parent))?;
        }
        let temp = temp_path_for(target);
        let mut file = fs::File::create(&temp).await.map_err(StoreError::io(&temp))?;
        file.write_all(data).await.map_err(StoreError::io(&temp))?;
        file.sync_all().await.map_err(StoreError::io(&temp))?;
        Ok(Self {
            temp,
            target: target.to_path_buf(),
        })
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    /// Rename the temp file over the target. This is the only mutating step.
    pub async fn commit(self) -> StoreResult<()> {
        if let Err(e) = fs::rename(&self.temp, &self.target).await {
            fs::remove_file(&self.temp).await.ok();
            return Err(StoreError::io(&self.target)(e));
        }
        Ok(())
    }
}

/// Atomically replace `target` with `data`.
pub async fn write_atomic(target: &Path, data: &[u8]) -> StoreResult<()> {
    PreparedWrite::prepare(target, data).await?.commit().await
}

/// Atomically replace `target` with pretty-printed JSON.
pub async fn write_json_atomic<T: Serialize>(target: &Path, value: &T) -> StoreResult<()> {
    let mut data = serde_json::to_vec_pretty(value).map_err(StoreError::json(target))?;
    data.push(b'\n');
    write_atomic(target, &data).await
}

/// Move an already written file into place, e.g. a tile the encoder wrote
/// to a temp path in the same directory.
pub async fn commit_file(written: &Path, target: &Path) -> StoreResult<()> {
    fs::rename(written, target).await.map_err(StoreError::io(target))
}

/// Atomically place a copy of `src` at `target`.
///
/// Tries a hard link first so published frames share storage with staging.
pub async fn link_or_copy_atomic(src: &Path, target: &Path) -> StoreResult<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await.map_err(StoreError::io(parent))?;
    }
    let temp = temp_path_for(target);
    if fs::hard_link(src, &temp).await.is_err() {
        fs::copy(src, &temp).await.map_err(StoreError::io(src))?;
    }
    if let Err(e) = fs::rename(&temp, target).await {
        fs::remove_file(&temp).await.ok();
        return Err(StoreError::io(target)(e));
    }
    Ok(())
}

/// Read and parse a JSON file; `Ok(None)` when it does not exist.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    match fs::read(path).await {
        Ok(data) => serde_json::from_slice(&data)
            .map(Some)
            .map_err(StoreError::json(path)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path)(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_atomic_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/LATEST.json");
        write_atomic(&target, b"one").await.unwrap();
        write_atomic(&target, b"two").await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"two");

        let leftovers: Vec<_> = std::fs::read_dir(target.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| is_temp_name(&e.file_name().to_string_lossy()))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_uncommitted_write_leaves_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("LATEST.json");
        write_atomic(&target, b"{\"run\":\"20260207_00z\"}").await.unwrap();

        let pending = PreparedWrite::prepare(&target, b"{\"run\":\"20260207_06z\"}")
            .await
            .unwrap();
        assert!(pending.temp_path().exists());
        drop(pending);

        assert_eq!(
            std::fs::read_to_string(&target).unwrap(),
            "{\"run\":\"20260207_00z\"}"
        );
    }

    #[tokio::test]
    async fn test_link_or_copy() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, b"tile").unwrap();
        let dst = dir.path().join("out/dst.bin");
        link_or_copy_atomic(&src, &dst).await.unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"tile");
    }

    #[tokio::test]
    async fn test_read_json_missing() {
        let dir = tempfile::tempdir().unwrap();
        let v: Option<serde_json::Value> = read_json(&dir.path().join("nope.json")).await.unwrap();
        assert!(v.is_none());
    }

    #[test]
    fn test_temp_names() {
        let t = temp_path_for(Path::new("/x/manifest.json"));
        let name = t.file_name().unwrap().to_string_lossy().into_owned();
        assert!(is_temp_name(&name));
        assert!(name.starts_with(".manifest.json."));
        assert_ne!(t, temp_path_for(Path::new("/x/manifest.json")));
    }
}
