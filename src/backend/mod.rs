//! Interchangeable Markdown extraction strategies.
//!
//! Each backend implements [`ConversionBackend`] and reports whether its
//! runtime dependency is present through [`ConversionBackend::is_available`].
//! The [`crate::convert::Converter`] holds them in a ranked list and walks
//! it; nothing outside this module checks for pdfium, tesseract or API keys.
//!
//! | backend | needs | output |
//! |---------|-------|--------|
//! | [`DirectTextBackend`] | pdfium | embedded text, page by page |
//! | [`OcrBackend`] | pdfium + tesseract | recognised text from rendered pages |
//! | [`LlmBackend`] | pdfium + LLM provider | vision-model transcription |

mod direct;
mod llm;
mod ocr;

pub use direct::DirectTextBackend;
pub use llm::{resolve_provider, LlmBackend};
pub use ocr::OcrBackend;

use crate::config::OcrQuality;
use crate::error::HarvestError;
use crate::output::BackendKind;
use async_trait::async_trait;
use std::path::Path;

/// Per-document inputs shared by all backends.
#[derive(Debug, Clone)]
pub struct BackendJob {
    /// File stem used for the top-level `#` heading.
    pub stem: String,
    /// Rasterisation quality for backends that render pages.
    pub quality: OcrQuality,
}

impl BackendJob {
    pub fn for_path(path: &Path, quality: OcrQuality) -> Self {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        Self { stem, quality }
    }
}

/// A Markdown extraction strategy.
#[async_trait]
pub trait ConversionBackend: Send + Sync {
    /// Which strategy this is.
    fn kind(&self) -> BackendKind;

    /// Whether the strategy can run on this host right now.
    fn is_available(&self) -> bool;

    /// Produce Markdown for the PDF at `pdf`.
    ///
    /// Errors are reported to the converter, which records them as a failed
    /// attempt and moves on to the next backend.
    async fn convert(&self, pdf: &Path, job: &BackendJob) -> Result<String, HarvestError>;
}

// ── Shared text structuring ──────────────────────────────────────────────

/// Lines shorter than this that are entirely upper-case become headings.
pub(crate) const HEADING_MAX_CHARS: usize = 100;
/// Pages with less trimmed text than this are treated as blank.
pub(crate) const MIN_PAGE_CHARS: usize = 20;

/// True when `s` has at least one cased letter and no lower-case letters.
pub(crate) fn is_shouting(s: &str) -> bool {
    s.chars().any(|c| c.is_uppercase()) && !s.chars().any(|c| c.is_lowercase())
}

pub(crate) fn is_heading_line(s: &str) -> bool {
    let t = s.trim();
    !t.is_empty() && t.chars().count() < HEADING_MAX_CHARS && is_shouting(t)
}

/// A structural unit of a page of embedded text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Block {
    Heading(String),
    Paragraph(String),
}

/// Split page text into blocks: runs of non-blank lines, with short
/// ALL-CAPS lines standing alone as headings.
pub(crate) fn text_blocks(page_text: &str) -> Vec<Block> {
    let normalised = page_text.replace("\r\n", "\n").replace('\r', "\n");
    let mut blocks = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    let flush = |current: &mut Vec<&str>, blocks: &mut Vec<Block>| {
        if !current.is_empty() {
            blocks.push(Block::Paragraph(current.join(" ")));
            current.clear();
        }
    };

    for line in normalised.lines() {
        let t = line.trim();
        if t.is_empty() {
            flush(&mut current, &mut blocks);
        } else if is_heading_line(t) {
            flush(&mut current, &mut blocks);
            blocks.push(Block::Heading(t.to_string()));
        } else {
            current.push(t);
        }
    }
    flush(&mut current, &mut blocks);
    blocks
}

/// Render blocks as Markdown separated by blank lines.
pub(crate) fn render_blocks(blocks: &[Block]) -> String {
    blocks
        .iter()
        .map(|b| match b {
            Block::Heading(h) => format!("### {}", h),
            Block::Paragraph(p) => p.clone(),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Line-level structure for OCR text: short ALL-CAPS lines become headings.
/// Blank lines are dropped.
pub(crate) fn structure_ocr_text(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| {
            if is_heading_line(t) {
                format!("### {}", t)
            } else {
                t.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shouting_needs_a_letter() {
        assert!(is_shouting("MEMORANDUM FOR THE RECORD"));
        assert!(is_shouting("SECTION 2."));
        assert!(!is_shouting("1963"));
        assert!(!is_shouting("Memorandum"));
    }

    #[test]
    fn long_caps_lines_are_not_headings() {
        let long = "A".repeat(120);
        assert!(!is_heading_line(&long));
        assert!(is_heading_line("  SUBJECT  "));
    }

    #[test]
    fn blocks_split_on_blank_lines_and_headings() {
        let text = "MEMORANDUM\r\nThe subject was seen\r\nin the city.\r\n\r\nSecond paragraph.";
        let blocks = text_blocks(text);
        assert_eq!(
            blocks,
            vec![
                Block::Heading("MEMORANDUM".into()),
                Block::Paragraph("The subject was seen in the city.".into()),
                Block::Paragraph("Second paragraph.".into()),
            ]
        );
        assert_eq!(
            render_blocks(&blocks),
            "### MEMORANDUM\n\nThe subject was seen in the city.\n\nSecond paragraph."
        );
    }

    #[test]
    fn ocr_lines_structured() {
        assert_eq!(
            structure_ocr_text("SECRET\nsome body text\n"),
            "### SECRET\nsome body text"
        );
        assert_eq!(structure_ocr_text("a\n\n  \nb"), "a\nb");
    }

    #[test]
    fn job_uses_file_stem() {
        let job = BackendJob::for_path(Path::new("/x/104-10003-10041.pdf"), OcrQuality::Low);
        assert_eq!(job.stem, "104-10003-10041");
    }
}
