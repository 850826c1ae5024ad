//! Embedded-text extraction through pdfium.

use super::{render_blocks, text_blocks, BackendJob, ConversionBackend, MIN_PAGE_CHARS};
use crate::config::ConversionConfig;
use crate::error::HarvestError;
use crate::output::BackendKind;
use crate::pipeline::pdf::{self, ExtractedText};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub struct DirectTextBackend {
    config: Arc<ConversionConfig>,
}

impl DirectTextBackend {
    pub fn new(config: Arc<ConversionConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConversionBackend for DirectTextBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::DirectText
    }

    fn is_available(&self) -> bool {
        pdf::engine_available(&self.config)
    }

    async fn convert(&self, pdf_path: &Path, job: &BackendJob) -> Result<String, HarvestError> {
        let path = pdf_path.to_path_buf();
        let config = Arc::clone(&self.config);
        let extracted = pdf::run_blocking(move || pdf::extract_text(&path, &config)).await?;
        debug!(
            "direct text: {} pages from {}",
            extracted.pages.len(),
            pdf_path.display()
        );
        Ok(render_extracted(&job.stem, &extracted))
    }
}

/// Lay out extracted text as Markdown.
///
/// Pages with fewer than [`MIN_PAGE_CHARS`] characters of text are skipped.
pub(crate) fn render_extracted(stem: &str, extracted: &ExtractedText) -> String {
    let mut out = match extracted.info.title.as_deref() {
        Some(title) => format!("# {} - {}\n\n", stem, title),
        None => format!("# {}\n\n", stem),
    };

    let entries = extracted.info.entries();
    if !entries.is_empty() {
        out.push_str("## Document Metadata\n\n");
        for (label, value) in entries {
            out.push_str(&format!("- **{}:** {}\n", label, value));
        }
        out.push('\n');
    }

    for (idx, text) in extracted.pages.iter().enumerate() {
        if text.trim().chars().count() <= MIN_PAGE_CHARS {
            continue;
        }
        out.push_str(&format!("## Page {}\n\n", idx + 1));
        out.push_str(&render_blocks(&text_blocks(text)));
        out.push_str("\n\n");
    }

    out.trim_end().to_string() + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::pdf::DocumentInfo;

    #[test]
    fn title_and_metadata_rendered() {
        let extracted = ExtractedText {
            info: DocumentInfo {
                title: Some("Oswald File".into()),
                author: Some("Records Office".into()),
                ..Default::default()
            },
            pages: vec!["MEMORANDUM\nThe subject travelled to the city on the 27th.".into()],
        };
        let md = render_extracted("104-10003-10041", &extracted);
        assert!(md.starts_with("# 104-10003-10041 - Oswald File\n\n## Document Metadata\n"));
        assert!(md.contains("- **Author:** Records Office\n"));
        assert!(md.contains("## Page 1\n\n### MEMORANDUM\n\nThe subject travelled"));
    }

    #[test]
    fn near_empty_pages_skipped_but_numbering_kept() {
        let extracted = ExtractedText {
            info: DocumentInfo::default(),
            pages: vec![
                "   7  ".into(),
                "Second page carries enough words to be kept.".into(),
            ],
        };
        let md = render_extracted("doc", &extracted);
        assert!(!md.contains("## Page 1"));
        assert!(md.contains("## Page 2"));
        assert!(!md.contains("Document Metadata"));
    }
}
