//! Page rasterisation plus tesseract recognition.
//!
//! Pages are rendered to PNG in a scratch directory at the DPI implied by
//! [`OcrQuality`], then fed one by one to the `tesseract` executable. A page
//! that fails to render or recognise yields a placeholder instead of failing
//! the whole document.

use super::{structure_ocr_text, BackendJob, ConversionBackend, MIN_PAGE_CHARS};
use crate::config::ConversionConfig;
use crate::error::HarvestError;
use crate::output::BackendKind;
use crate::pipeline::pdf;
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub struct OcrBackend {
    config: Arc<ConversionConfig>,
    tesseract_ok: OnceCell<bool>,
}

impl OcrBackend {
    pub fn new(config: Arc<ConversionConfig>) -> Self {
        Self {
            config,
            tesseract_ok: OnceCell::new(),
        }
    }

    fn tesseract_present(&self) -> bool {
        *self.tesseract_ok.get_or_init(|| {
            match std::process::Command::new(&self.config.tesseract_path)
                .arg("--version")
                .output()
            {
                Ok(out) if out.status.success() => true,
                Ok(out) => {
                    warn!("tesseract --version exited with {}", out.status);
                    false
                }
                Err(e) => {
                    warn!(
                        "tesseract not found at {}: {}",
                        self.config.tesseract_path.display(),
                        e
                    );
                    false
                }
            }
        })
    }

    async fn recognise(&self, png: &Path, page_num: usize) -> Result<String, HarvestError> {
        let output = Command::new(&self.config.tesseract_path)
            .arg(png)
            .arg("stdout")
            .args(["-l", &self.config.tesseract_lang, "--oem", "1", "--psm", "6"])
            .output()
            .await
            .map_err(|e| HarvestError::OcrFailed {
                page: page_num,
                detail: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HarvestError::OcrFailed {
                page: page_num,
                detail: stderr.lines().next().unwrap_or("tesseract failed").to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ConversionBackend for OcrBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ocr
    }

    fn is_available(&self) -> bool {
        pdf::engine_available(&self.config) && self.tesseract_present()
    }

    async fn convert(&self, pdf_path: &Path, job: &BackendJob) -> Result<String, HarvestError> {
        let scratch = tempfile::Builder::new()
            .prefix("docharvest-ocr-")
            .tempdir()
            .map_err(|e| HarvestError::StorageFailed {
                path: std::env::temp_dir(),
                source: e,
            })?;

        let dpi = job.quality.dpi();
        info!("OCR {} at {} dpi", pdf_path.display(), dpi);

        let path = pdf_path.to_path_buf();
        let dir = scratch.path().to_path_buf();
        let config = Arc::clone(&self.config);
        let pages =
            pdf::run_blocking(move || pdf::render_pages_to_dir(&path, &config, dpi, &dir)).await?;

        let mut out = format!("# {}\n\n", job.stem);
        for (idx, rendered) in pages.into_iter().enumerate() {
            let page_num = idx + 1;
            let text = match rendered {
                Ok(png) => self.recognise(&png, page_num).await,
                Err(e) => Err(e),
            };
            out.push_str(&page_section(page_num, text));
        }
        debug!("OCR produced {} bytes", out.len());
        Ok(out.trim_end().to_string() + "\n")
    }
}

/// Markdown for one OCR'd page, including the failure and blank cases.
fn page_section(page_num: usize, text: Result<String, HarvestError>) -> String {
    let body = match text {
        Ok(t) if t.trim().chars().count() <= MIN_PAGE_CHARS => {
            "*No text detected on this page*".to_string()
        }
        Ok(t) => structure_ocr_text(&t),
        Err(e) => {
            warn!("page {}: {}", page_num, e);
            format!("*OCR processing failed for this page: {}*", e)
        }
    };
    format!("## Page {}\n\n{}\n\n", page_num, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_page_placeholder() {
        let s = page_section(3, Ok("  \n ".into()));
        assert_eq!(s, "## Page 3\n\n*No text detected on this page*\n\n");
    }

    #[test]
    fn short_noise_counts_as_blank() {
        let s = page_section(4, Ok("  |  ~ .\n".into()));
        assert_eq!(s, "## Page 4\n\n*No text detected on this page*\n\n");
    }

    #[test]
    fn blank_lines_are_dropped() {
        let s = page_section(
            5,
            Ok("MEMORANDUM\n\n\nThe cable was received late.\n  \n".into()),
        );
        assert_eq!(
            s,
            "## Page 5\n\n### MEMORANDUM\nThe cable was received late.\n\n"
        );
    }

    #[test]
    fn failed_page_placeholder() {
        let err = HarvestError::OcrFailed {
            page: 2,
            detail: "bad image".into(),
        };
        let s = page_section(2, Err(err));
        assert!(s.starts_with("## Page 2\n\n*OCR processing failed for this page: "));
        assert!(s.contains("bad image"));
    }

    #[test]
    fn recognised_text_gets_headings() {
        let s = page_section(1, Ok("SECRET\nThe cable was received.\n".into()));
        assert_eq!(s, "## Page 1\n\n### SECRET\nThe cable was received.\n\n");
    }

    #[test]
    fn missing_tesseract_is_unavailable() {
        let config = ConversionConfig {
            tesseract_path: "/nonexistent/tesseract-binary".into(),
            ..Default::default()
        };
        let backend = OcrBackend::new(Arc::new(config));
        assert!(!backend.tesseract_present());
        assert!(!backend.is_available());
    }
}
