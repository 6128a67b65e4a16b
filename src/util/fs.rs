//! Atomic file I/O for the JSON stores.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::warn;

use crate::util::time::now_ms;

/// Serialize `value` and write it atomically: write to `<path>.tmp`, then
/// rename over the real path. A best-effort `.bak` copy of the previous
/// contents is kept next to the file.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let bak = backup_path(path);
        if let Err(e) = tokio::fs::copy(path, &bak).await {
            warn!(path = %path.display(), error = %e, "Failed to write backup copy");
        }
    }

    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Move a corrupt file aside with a timestamp suffix so a fresh store can be
/// created in its place. Returns the new path.
pub async fn rename_aside(path: &Path) -> std::io::Result<PathBuf> {
    let aside = path.with_extension(format!("corrupt.{}", now_ms()));
    tokio::fs::rename(path, &aside).await?;
    Ok(aside)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".tmp");
    PathBuf::from(s)
}

fn backup_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".bak");
    PathBuf::from(s)
}
