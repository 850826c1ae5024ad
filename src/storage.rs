//! Atomic file writes: sibling temp file, then rename.

use crate::error::HarvestError;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

fn temp_sibling(dest: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn storage_err(path: &Path) -> impl FnOnce(std::io::Error) -> HarvestError + '_ {
    move |source| HarvestError::StorageFailed {
        path: path.to_path_buf(),
        source,
    }
}

/// Write `bytes` to `dest`, creating parent directories as needed.
pub async fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<(), HarvestError> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(storage_err(parent))?;
    }
    let tmp = temp_sibling(dest, ".tmp");
    tokio::fs::write(&tmp, bytes).await.map_err(storage_err(&tmp))?;
    tokio::fs::rename(&tmp, dest).await.map_err(storage_err(dest))
}

/// Blocking variant of [`write_atomic`].
pub fn write_atomic_blocking(dest: &Path, bytes: &[u8]) -> Result<(), HarvestError> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(storage_err(parent))?;
    }
    let tmp = temp_sibling(dest, ".tmp");
    std::fs::write(&tmp, bytes).map_err(storage_err(&tmp))?;
    std::fs::rename(&tmp, dest).map_err(storage_err(dest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn async_write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a/b/out.md");
        write_atomic(&dest, b"hello").await.unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "hello");
        assert!(!dir.path().join("a/b/out.md.tmp").exists());
    }

    #[test]
    fn blocking_write_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("kb.json");
        std::fs::write(&dest, "old").unwrap();
        write_atomic_blocking(&dest, b"new").unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "new");
    }
}
