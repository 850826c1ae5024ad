//! pdfium access: binding, probing, text extraction, re-saving and rendering.
//!
//! Every function here is blocking. pdfium keeps global state and is not
//! safe to drive from several threads at once, so each session holds a
//! process-wide lock and async callers go through the `*_async` wrappers,
//! which move the work onto `spawn_blocking`.

use crate::config::ConversionConfig;
use crate::error::HarvestError;
use image::DynamicImage;
use once_cell::sync::Lazy;
use pdfium_render::prelude::*;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

static PDFIUM_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));
static ENGINE_AVAILABLE: Lazy<Mutex<HashMap<Option<PathBuf>, bool>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Bind to pdfium from an explicit path (file or directory) or the system library.
pub fn bind(lib_path: Option<&Path>) -> Result<Pdfium, HarvestError> {
    let bindings = match lib_path {
        Some(p) if p.is_dir() => {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(p))
        }
        Some(p) => Pdfium::bind_to_library(p),
        None => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| HarvestError::PdfiumBindingFailed(format!("{:?}", e)))?;
    Ok(Pdfium::new(bindings))
}

/// Whether pdfium can be bound from the library `config` resolves to.
/// Checked once per library path.
pub fn engine_available(config: &ConversionConfig) -> bool {
    let lib = config.resolved_pdfium_path();
    let mut checked = ENGINE_AVAILABLE.lock().unwrap_or_else(|p| p.into_inner());
    if let Some(&ok) = checked.get(&lib) {
        return ok;
    }
    let ok = {
        let _guard = PDFIUM_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        match bind(lib.as_deref()) {
            Ok(_) => true,
            Err(e) => {
                warn!("pdfium unavailable: {}", e);
                false
            }
        }
    };
    checked.insert(lib, ok);
    ok
}

/// Open `path` with the empty password and hand the document to `f`.
///
/// Password failures map to [`HarvestError::PasswordRequired`], every other
/// load failure to [`HarvestError::CorruptPdf`].
pub fn with_document<T>(
    path: &Path,
    config: &ConversionConfig,
    f: impl FnOnce(&PdfDocument<'_>) -> Result<T, HarvestError>,
) -> Result<T, HarvestError> {
    let _guard = PDFIUM_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    let lib = config.resolved_pdfium_path();
    let pdfium = bind(lib.as_deref())?;

    let document = pdfium.load_pdf_from_file(path, Some("")).map_err(|e| {
        let detail = format!("{:?}", e);
        if detail.contains("Password") || detail.contains("password") {
            HarvestError::PasswordRequired {
                path: path.to_path_buf(),
            }
        } else {
            HarvestError::CorruptPdf {
                path: path.to_path_buf(),
                detail,
            }
        }
    })?;

    f(&document)
}

// ── Probing ──────────────────────────────────────────────────────────────

/// Per-page observations used by the format detector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSample {
    /// Characters of trimmed extractable text.
    pub text_chars: usize,
    /// Embedded image objects.
    pub image_count: usize,
    /// Page rotation is not 0°.
    pub rotated: bool,
    /// Distinct symbol/decorative font names on the page.
    pub unusual_fonts: usize,
}

/// Page count plus samples of the first `limit` pages.
pub fn sample_pages(
    path: &Path,
    config: &ConversionConfig,
    limit: usize,
) -> Result<(usize, Vec<PageSample>), HarvestError> {
    with_document(path, config, |doc| {
        let pages = doc.pages();
        let total = pages.len() as usize;
        let mut samples = Vec::with_capacity(limit.min(total));

        for (idx, page) in pages.iter().enumerate().take(limit) {
            let text_chars = page
                .text()
                .map(|t| t.all().trim().chars().count())
                .unwrap_or(0);

            let mut image_count = 0;
            let mut fonts = HashSet::new();
            for object in page.objects().iter() {
                if object.as_image_object().is_some() {
                    image_count += 1;
                } else if let Some(text) = object.as_text_object() {
                    let name = text.font().name();
                    if is_unusual_font(&name) {
                        fonts.insert(name);
                    }
                }
            }

            let rotated = !matches!(page.rotation(), Ok(PdfPageRenderRotation::None) | Err(_));

            debug!(
                "Sampled page {}: {} chars, {} images, rotated={}",
                idx + 1,
                text_chars,
                image_count,
                rotated
            );
            samples.push(PageSample {
                text_chars,
                image_count,
                rotated,
                unusual_fonts: fonts.len(),
            });
        }

        Ok((total, samples))
    })
}

/// Symbol and dingbat fonts rarely carry extractable prose.
pub fn is_unusual_font(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("symbol") || lower.contains("zapf")
}

// ── Text extraction ──────────────────────────────────────────────────────

/// Info-dictionary fields of a PDF.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentInfo {
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub creator: Option<String>,
    pub producer: Option<String>,
    pub creation_date: Option<String>,
}

impl DocumentInfo {
    /// Non-empty fields as `(label, value)` pairs in display order.
    pub fn entries(&self) -> Vec<(&'static str, &str)> {
        [
            ("Title", &self.title),
            ("Author", &self.author),
            ("Subject", &self.subject),
            ("Creator", &self.creator),
            ("Producer", &self.producer),
            ("Creation Date", &self.creation_date),
        ]
        .into_iter()
        .filter_map(|(label, v)| v.as_deref().map(|v| (label, v)))
        .collect()
    }
}

/// Text of every page, in order, plus the info dictionary.
#[derive(Debug, Clone, Default)]
pub struct ExtractedText {
    pub info: DocumentInfo,
    pub pages: Vec<String>,
}

pub fn extract_text(path: &Path, config: &ConversionConfig) -> Result<ExtractedText, HarvestError> {
    with_document(path, config, |doc| {
        let metadata = doc.metadata();
        let get_meta = |tag: PdfDocumentMetadataTagType| -> Option<String> {
            metadata.get(tag).and_then(|t| {
                let v = t.value().trim().to_string();
                if v.is_empty() {
                    None
                } else {
                    Some(v)
                }
            })
        };

        let info = DocumentInfo {
            title: get_meta(PdfDocumentMetadataTagType::Title),
            author: get_meta(PdfDocumentMetadataTagType::Author),
            subject: get_meta(PdfDocumentMetadataTagType::Subject),
            creator: get_meta(PdfDocumentMetadataTagType::Creator),
            producer: get_meta(PdfDocumentMetadataTagType::Producer),
            creation_date: get_meta(PdfDocumentMetadataTagType::CreationDate),
        };

        let pages = doc
            .pages()
            .iter()
            .map(|page| page.text().map(|t| t.all()).unwrap_or_default())
            .collect();

        Ok(ExtractedText { info, pages })
    })
}

// ── Re-save ──────────────────────────────────────────────────────────────

/// Write a fresh copy of `src` to `dest` and return the copy's page count.
pub fn resave(src: &Path, dest: &Path, config: &ConversionConfig) -> Result<usize, HarvestError> {
    with_document(src, config, |doc| {
        doc.save_to_file(dest)
            .map_err(|e| HarvestError::CorruptPdf {
                path: src.to_path_buf(),
                detail: format!("re-save failed: {:?}", e),
            })
    })?;
    with_document(dest, config, |doc| Ok(doc.pages().len() as usize))
}

// ── Rendering ────────────────────────────────────────────────────────────

/// Render every page at `dpi` into PNG files inside `dir`.
///
/// Returns one entry per page; a page that fails to render carries its error
/// so the OCR backend can still emit a placeholder for it.
pub fn render_pages_to_dir(
    path: &Path,
    config: &ConversionConfig,
    dpi: u32,
    dir: &Path,
) -> Result<Vec<Result<PathBuf, HarvestError>>, HarvestError> {
    let scale = dpi as f32 / 72.0;
    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(scale)
        .set_maximum_width(10_000)
        .set_maximum_height(10_000);

    with_document(path, config, |doc| {
        let mut out = Vec::new();
        for (idx, page) in doc.pages().iter().enumerate() {
            let page_num = idx + 1;
            let rendered = page
                .render_with_config(&render_config)
                .map_err(|e| HarvestError::RasterisationFailed {
                    page: page_num,
                    detail: format!("{:?}", e),
                })
                .and_then(|bitmap| {
                    let file = dir.join(format!("page-{:04}.png", page_num));
                    bitmap
                        .as_image()
                        .save_with_format(&file, image::ImageFormat::Png)
                        .map_err(|e| HarvestError::RasterisationFailed {
                            page: page_num,
                            detail: e.to_string(),
                        })?;
                    Ok(file)
                });
            if let Err(ref e) = rendered {
                warn!("{}", e);
            }
            out.push(rendered);
        }
        Ok(out)
    })
}

/// Render every page with its longest edge capped at `max_rendered_pixels`.
pub fn render_pages(
    path: &Path,
    config: &ConversionConfig,
) -> Result<Vec<(usize, DynamicImage)>, HarvestError> {
    let max_px = config.max_rendered_pixels as i32;
    let render_config = PdfRenderConfig::new()
        .set_target_width(max_px)
        .set_maximum_height(max_px);

    with_document(path, config, |doc| {
        let mut results = Vec::new();
        for (idx, page) in doc.pages().iter().enumerate() {
            let bitmap = page.render_with_config(&render_config).map_err(|e| {
                HarvestError::RasterisationFailed {
                    page: idx + 1,
                    detail: format!("{:?}", e),
                }
            })?;
            let image = bitmap.as_image();
            debug!("Rendered page {} → {}x{} px", idx + 1, image.width(), image.height());
            results.push((idx, image));
        }
        Ok(results)
    })
}

// ── Async wrappers ───────────────────────────────────────────────────────

/// Run a blocking pdfium job on the blocking pool.
pub async fn run_blocking<T, F>(job: F) -> Result<T, HarvestError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, HarvestError> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| HarvestError::Internal(format!("pdfium task panicked: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unusual_font_names() {
        assert!(is_unusual_font("Symbol"));
        assert!(is_unusual_font("ABCDEF+ZapfDingbats"));
        assert!(!is_unusual_font("Courier-Bold"));
    }

    #[test]
    fn info_entries_skip_missing_fields() {
        let info = DocumentInfo {
            title: Some("Memo".into()),
            producer: Some("Scanner".into()),
            ..Default::default()
        };
        assert_eq!(info.entries(), vec![("Title", "Memo"), ("Producer", "Scanner")]);
    }

    #[test]
    fn engine_check_is_cached_per_library() {
        let missing = ConversionConfig {
            pdfium_lib_path: Some(PathBuf::from("/nonexistent/libpdfium.so")),
            ..Default::default()
        };
        assert!(!engine_available(&missing));
        let key = missing.resolved_pdfium_path();
        let checked = ENGINE_AVAILABLE.lock().unwrap();
        assert_eq!(checked.get(&key), Some(&false));
    }
}
