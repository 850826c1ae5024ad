//! Format detection: classify a PDF and recommend a processing strategy.
//!
//! Detection is split in two. [`probe`] does the I/O (file size, a raw scan
//! for an `/Encrypt` dictionary, opening the document and sampling pages) and
//! [`classify`] turns the resulting [`DocumentProbe`] into a
//! [`FormatReport`]. `classify` is pure, so the whole decision table can be
//! exercised without a pdfium library.
//!
//! Any failure biases the report toward OCR: skipping content silently is
//! worse than a slow conversion.

use crate::config::ConversionConfig;
use crate::error::HarvestError;
use crate::output::{FormatReport, RareFormatKind};
use crate::pipeline::pdf::{self, PageSample};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Files below this size are probably empty shells or error pages.
pub const SMALL_FILE_BYTES: u64 = 10 * 1024;
/// Files above this size get a warning; they are slow to rasterise.
pub const LARGE_FILE_BYTES: u64 = 50 * 1024 * 1024;
/// A page with more trimmed characters than this counts as a text page.
pub const TEXT_PAGE_MIN_CHARS: usize = 100;
/// Unusual-font hits above this force careful extraction.
pub const UNUSUAL_FONT_LIMIT: usize = 3;
/// Pages sampled by [`is_scanned`].
pub const SCAN_SAMPLE_PAGES: usize = 3;

const SNIFF_WINDOW: u64 = 1024 * 1024;

/// Outcome of opening the document with the empty password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened {
        page_count: usize,
        samples: Vec<PageSample>,
    },
    PasswordRejected,
    Failed(String),
}

/// Raw observations about one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentProbe {
    pub file_size: u64,
    /// The file references an `/Encrypt` dictionary.
    pub encrypt_marker: bool,
    pub open: OpenOutcome,
}

/// Inspect `path` and classify it. Never fails.
pub async fn detect(path: &Path, config: &ConversionConfig) -> FormatReport {
    let owned: PathBuf = path.to_path_buf();
    let config = config.clone();
    let report = tokio::task::spawn_blocking(move || detect_blocking(&owned, &config))
        .await
        .unwrap_or_else(|e| FormatReport::analysis_error(format!("detector task panicked: {e}")));

    info!(
        path = %path.display(),
        pages = report.page_count(),
        kind = ?report.rare_format_kind(),
        strategy = ?report.processing_strategy(),
        needs_ocr = report.needs_ocr(),
        "Format detection complete"
    );
    report
}

/// Blocking variant of [`detect`].
pub fn detect_blocking(path: &Path, config: &ConversionConfig) -> FormatReport {
    match probe(path, config) {
        Ok(p) => classify(&p),
        Err(e) => {
            warn!(category = %e.category(), path = %path.display(), "{}", e);
            FormatReport::analysis_error(e.to_string())
        }
    }
}

/// Gather the raw facts the classifier needs.
///
/// Only file-system errors surface as `Err`; pdfium failures are folded into
/// [`OpenOutcome`].
pub fn probe(path: &Path, config: &ConversionConfig) -> Result<DocumentProbe, HarvestError> {
    let file_size = std::fs::metadata(path)
        .map_err(|e| HarvestError::FormatDetection {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?
        .len();

    let encrypt_marker = sniff_encrypt_marker(path).unwrap_or_else(|e| {
        debug!("Encryption sniff failed for {}: {}", path.display(), e);
        false
    });

    let open = match pdf::sample_pages(path, config, config.sample_pages) {
        Ok((page_count, samples)) => OpenOutcome::Opened {
            page_count,
            samples,
        },
        Err(HarvestError::PasswordRequired { .. }) => OpenOutcome::PasswordRejected,
        Err(e) => OpenOutcome::Failed(e.to_string()),
    };

    Ok(DocumentProbe {
        file_size,
        encrypt_marker,
        open,
    })
}

/// Turn a probe into a report.
pub fn classify(probe: &DocumentProbe) -> FormatReport {
    let mut report = FormatReport::default();

    // ── Step 1: File size ────────────────────────────────────────────────
    if probe.file_size < SMALL_FILE_BYTES {
        report.set_kind(RareFormatKind::PotentiallyEmpty);
        report.warn(format!("Unusually small file ({} bytes)", probe.file_size));
    } else if probe.file_size > LARGE_FILE_BYTES {
        report.warn(format!(
            "Unusually large file ({:.1} MB)",
            probe.file_size as f64 / (1024.0 * 1024.0)
        ));
    }

    // ── Step 2: Open / encryption ────────────────────────────────────────
    let (page_count, samples) = match &probe.open {
        OpenOutcome::Failed(detail) => {
            report.set_kind(RareFormatKind::AnalysisError);
            report.set_needs_ocr(true);
            report.warn(format!("Error during format detection: {}", detail));
            return report;
        }
        OpenOutcome::PasswordRejected => {
            report.set_encrypted(true);
            report.set_kind(RareFormatKind::Encrypted);
            report.set_needs_ocr(true);
            report.warn("Document is encrypted and the empty password was rejected");
            return report;
        }
        OpenOutcome::Opened {
            page_count,
            samples,
        } => (*page_count, samples),
    };

    if probe.encrypt_marker {
        report.warn("Document was encrypted but decrypted with empty password");
    }
    report.set_page_count(page_count);

    // ── Step 3: Empty document ───────────────────────────────────────────
    if page_count == 0 {
        report.set_kind(RareFormatKind::EmptyDocument);
        report.set_needs_ocr(false);
        report.warn("Document has no pages");
        return report;
    }

    // ── Step 4: Sample pages ─────────────────────────────────────────────
    let text_pages = samples
        .iter()
        .filter(|s| s.text_chars > TEXT_PAGE_MIN_CHARS)
        .count();
    let image_pages = samples.iter().filter(|s| s.image_count > 0).count();
    let rotated = samples.iter().filter(|s| s.rotated).count();
    let font_hits: usize = samples.iter().map(|s| s.unusual_fonts).sum();

    // ── Step 5: OCR decision ─────────────────────────────────────────────
    if text_pages == 0 && image_pages > 0 {
        report.set_needs_ocr(true);
        report.warn("No text found but images present - likely scanned document");
    } else if text_pages < image_pages {
        report.set_needs_ocr(true);
        report.warn(format!(
            "More image pages than text pages ({} vs {})",
            image_pages, text_pages
        ));
    }

    // ── Step 6: Rare-format overrides ────────────────────────────────────
    if rotated > 0 {
        report.warn(format!("Document has {} pages with unusual rotation", rotated));
    }
    if rotated * 2 > samples.len() {
        report.set_kind(RareFormatKind::UnusualRotation);
    }

    if font_hits > 0 {
        report.warn(format!("Document uses {} unusual fonts", font_hits));
    }
    if font_hits > UNUSUAL_FONT_LIMIT {
        report.set_kind(RareFormatKind::UnusualFonts);
        report.set_needs_ocr(true);
    }

    report
}

/// Standalone scan check for backends used without the detector.
///
/// Samples the first pages with the same text-vs-image rule and answers
/// `true` whenever anything goes wrong.
pub async fn is_scanned(path: &Path, config: &ConversionConfig) -> bool {
    let owned = path.to_path_buf();
    let config = config.clone();
    let sampled = pdf::run_blocking(move || pdf::sample_pages(&owned, &config, SCAN_SAMPLE_PAGES)).await;

    match sampled {
        Ok((_, samples)) => {
            let text = samples
                .iter()
                .filter(|s| s.text_chars > TEXT_PAGE_MIN_CHARS)
                .count();
            let images = samples.iter().filter(|s| s.image_count > 0).count();
            (text == 0 && images > 0) || text < images
        }
        Err(e) => {
            debug!("Scan check failed for {}: {}", path.display(), e);
            true
        }
    }
}

/// Look for an `/Encrypt` reference near the start (linearised files) and the
/// end (trailer) of the file.
fn sniff_encrypt_marker(path: &Path) -> std::io::Result<bool> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();

    let mut head = Vec::new();
    (&mut file).take(SNIFF_WINDOW).read_to_end(&mut head)?;
    if contains(&head, b"/Encrypt") {
        return Ok(true);
    }

    if len > SNIFF_WINDOW {
        file.seek(SeekFrom::Start(len - SNIFF_WINDOW))?;
        let mut tail = Vec::new();
        file.read_to_end(&mut tail)?;
        return Ok(contains(&tail, b"/Encrypt"));
    }
    Ok(false)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::ProcessingStrategy;

    fn text_page() -> PageSample {
        PageSample {
            text_chars: 500,
            ..Default::default()
        }
    }

    fn scanned_page() -> PageSample {
        PageSample {
            text_chars: 0,
            image_count: 1,
            ..Default::default()
        }
    }

    fn opened(samples: Vec<PageSample>) -> DocumentProbe {
        DocumentProbe {
            file_size: 200_000,
            encrypt_marker: false,
            open: OpenOutcome::Opened {
                page_count: samples.len(),
                samples,
            },
        }
    }

    #[test]
    fn zero_page_document_is_empty_and_cautious() {
        let r = classify(&opened(vec![]));
        assert_eq!(r.rare_format_kind(), RareFormatKind::EmptyDocument);
        assert_eq!(r.processing_strategy(), ProcessingStrategy::Cautious);
        assert!(!r.needs_ocr());
        assert!(r.is_rare_format());
    }

    #[test]
    fn text_document_is_standard() {
        let r = classify(&opened(vec![text_page(), text_page()]));
        assert_eq!(r.rare_format_kind(), RareFormatKind::None);
        assert_eq!(r.processing_strategy(), ProcessingStrategy::Standard);
        assert!(!r.needs_ocr());
        assert!(r.warnings().is_empty());
    }

    #[test]
    fn scanned_document_needs_ocr() {
        let r = classify(&opened(vec![scanned_page(), scanned_page()]));
        assert!(r.needs_ocr());
        assert!(r.warnings()[0].contains("likely scanned"));
        assert_eq!(r.processing_strategy(), ProcessingStrategy::Standard);
    }

    #[test]
    fn more_images_than_text_needs_ocr() {
        let mixed = PageSample {
            text_chars: 300,
            image_count: 2,
            ..Default::default()
        };
        let r = classify(&opened(vec![mixed, scanned_page(), text_page()]));
        // 2 text pages (mixed + text_page) vs 2 image pages: not fewer
        assert!(!r.needs_ocr());

        let r = classify(&opened(vec![scanned_page(), scanned_page(), text_page()]));
        assert!(r.needs_ocr());
        assert!(r.warnings()[0].contains("2 vs 1"));
    }

    #[test]
    fn majority_rotation_normalises_pages() {
        let rotated = PageSample {
            rotated: true,
            ..text_page()
        };
        let r = classify(&opened(vec![rotated.clone(), rotated, text_page()]));
        assert_eq!(r.rare_format_kind(), RareFormatKind::UnusualRotation);
        assert_eq!(r.processing_strategy(), ProcessingStrategy::NormalizePages);
        assert!(!r.needs_ocr());
    }

    #[test]
    fn minority_rotation_only_warns() {
        let rotated = PageSample {
            rotated: true,
            ..text_page()
        };
        let r = classify(&opened(vec![rotated, text_page(), text_page()]));
        assert_eq!(r.rare_format_kind(), RareFormatKind::None);
        assert_eq!(r.warnings().len(), 1);
    }

    #[test]
    fn many_unusual_fonts_force_ocr() {
        let fonty = PageSample {
            unusual_fonts: 2,
            ..text_page()
        };
        let r = classify(&opened(vec![fonty.clone(), fonty]));
        assert_eq!(r.rare_format_kind(), RareFormatKind::UnusualFonts);
        assert_eq!(r.processing_strategy(), ProcessingStrategy::CarefulExtraction);
        assert!(r.needs_ocr());
    }

    #[test]
    fn rejected_password_is_encrypted() {
        let r = classify(&DocumentProbe {
            file_size: 50_000,
            encrypt_marker: true,
            open: OpenOutcome::PasswordRejected,
        });
        assert!(r.is_encrypted());
        assert!(r.needs_ocr());
        assert_eq!(r.processing_strategy(), ProcessingStrategy::DecryptFirst);
    }

    #[test]
    fn empty_password_decrypts_and_stays_standard() {
        let mut p = opened(vec![text_page()]);
        p.encrypt_marker = true;
        let r = classify(&p);
        assert!(!r.is_encrypted());
        assert_eq!(r.processing_strategy(), ProcessingStrategy::Standard);
        assert!(r.warnings()[0].contains("empty password"));
    }

    #[test]
    fn small_file_is_potentially_empty() {
        let mut p = opened(vec![text_page()]);
        p.file_size = 2_000;
        let r = classify(&p);
        assert_eq!(r.rare_format_kind(), RareFormatKind::PotentiallyEmpty);
        assert_eq!(r.processing_strategy(), ProcessingStrategy::Cautious);
    }

    #[test]
    fn large_file_only_warns() {
        let mut p = opened(vec![text_page()]);
        p.file_size = 60 * 1024 * 1024;
        let r = classify(&p);
        assert_eq!(r.rare_format_kind(), RareFormatKind::None);
        assert!(r.warnings()[0].starts_with("Unusually large file"));
    }

    #[test]
    fn open_failure_is_analysis_error() {
        let r = classify(&DocumentProbe {
            file_size: 0,
            encrypt_marker: false,
            open: OpenOutcome::Failed("bad xref".into()),
        });
        assert_eq!(r.rare_format_kind(), RareFormatKind::AnalysisError);
        assert_eq!(r.processing_strategy(), ProcessingStrategy::Cautious);
        assert!(r.needs_ocr());
    }

    #[test]
    fn missing_file_detects_as_analysis_error() {
        let r = detect_blocking(Path::new("/nonexistent/definitely/missing.pdf"), &ConversionConfig::default());
        assert_eq!(r.rare_format_kind(), RareFormatKind::AnalysisError);
        assert!(r.needs_ocr());
    }

    #[test]
    fn sniff_finds_encrypt_dictionary() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("enc.pdf");
        std::fs::write(&p, b"%PDF-1.4\ntrailer << /Encrypt 5 0 R >>\n%%EOF").unwrap();
        assert!(sniff_encrypt_marker(&p).unwrap());

        let q = dir.path().join("plain.pdf");
        std::fs::write(&q, b"%PDF-1.4\ntrailer << /Root 1 0 R >>\n%%EOF").unwrap();
        assert!(!sniff_encrypt_marker(&q).unwrap());
    }
}
