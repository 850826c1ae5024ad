//! Best-effort structural repair of problematic PDFs.
//!
//! pdfium rewrites the whole file on save: cross-reference tables are
//! regenerated, unreachable objects are dropped and, because the document
//! was opened with the empty password, owner-password-only encryption is not
//! carried over. That rewrite is the repair. The copy is reopened and must
//! have at least one page before it is handed back.

use crate::config::ConversionConfig;
use crate::pipeline::pdf;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{info, warn};

/// A repaired copy of a PDF. Dropping it deletes the copy.
#[derive(Debug)]
pub struct RepairedPdf {
    path: PathBuf,
    _dir: TempDir,
}

impl RepairedPdf {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Try to produce a cleaner copy of `path`. Never fails; `None` means the
/// caller should continue with the original (and usually force OCR).
pub async fn repair(path: &Path, config: &ConversionConfig) -> Option<RepairedPdf> {
    let owned = path.to_path_buf();
    let config = config.clone();
    match tokio::task::spawn_blocking(move || repair_blocking(&owned, &config)).await {
        Ok(result) => result,
        Err(e) => {
            warn!("Repair task panicked for {}: {}", path.display(), e);
            None
        }
    }
}

/// Blocking variant of [`repair`].
pub fn repair_blocking(path: &Path, config: &ConversionConfig) -> Option<RepairedPdf> {
    let dir = match tempfile::Builder::new().prefix("docharvest-repair-").tempdir() {
        Ok(d) => d,
        Err(e) => {
            warn!("Cannot create repair directory: {}", e);
            return None;
        }
    };

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document.pdf".to_string());
    let target = dir.path().join(format!("repaired_{}", name));

    match pdf::resave(path, &target, config) {
        Ok(pages) if pages >= 1 => {
            info!("Repaired {} → {} ({} pages)", path.display(), target.display(), pages);
            Some(RepairedPdf {
                path: target,
                _dir: dir,
            })
        }
        Ok(_) => {
            warn!("Repaired copy of {} has no pages; discarding", path.display());
            None
        }
        Err(e) => {
            warn!(category = %e.category(), path = %path.display(), "Repair failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_not_repairable() {
        let config = ConversionConfig::default();
        assert!(repair_blocking(Path::new("/no/such/file.pdf"), &config).is_none());
    }

    #[tokio::test]
    async fn garbage_bytes_are_not_repairable() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("junk.pdf");
        std::fs::write(&p, b"this is not a pdf at all").unwrap();
        assert!(repair(&p, &ConversionConfig::default()).await.is_none());
    }
}
