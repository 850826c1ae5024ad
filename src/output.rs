//! Value types produced by the pipeline stages.
//!
//! Everything here is plain data: the detector emits a [`FormatReport`], each
//! backend run becomes a [`ConversionAttempt`], the validator yields a
//! [`QualityScore`], the converter bundles them into a [`ConversionReport`]
//! and the mapper produces the final [`DocumentRecord`].

use serde::{Deserialize, Serialize};
use std::fmt;

// ── Format detection ─────────────────────────────────────────────────────

/// Why a document was classified as a rare format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RareFormatKind {
    #[default]
    None,
    Encrypted,
    UnusualRotation,
    UnusualFonts,
    PotentiallyEmpty,
    EmptyDocument,
    AnalysisError,
}

impl RareFormatKind {
    /// The processing strategy mandated for this kind.
    pub fn strategy(self) -> ProcessingStrategy {
        match self {
            RareFormatKind::None => ProcessingStrategy::Standard,
            RareFormatKind::Encrypted => ProcessingStrategy::DecryptFirst,
            RareFormatKind::UnusualRotation => ProcessingStrategy::NormalizePages,
            RareFormatKind::UnusualFonts => ProcessingStrategy::CarefulExtraction,
            RareFormatKind::PotentiallyEmpty
            | RareFormatKind::EmptyDocument
            | RareFormatKind::AnalysisError => ProcessingStrategy::Cautious,
        }
    }
}

/// How the converter should treat a document before running backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStrategy {
    #[default]
    Standard,
    DeepRepair,
    Cautious,
    DecryptFirst,
    OcrOnly,
    SelectiveOcr,
    NormalizePages,
    CarefulExtraction,
}

/// Classification of a single PDF.
///
/// Built only by [`crate::pipeline::detect`]; the strategy always follows
/// from the rare-format kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawFormatReport")]
pub struct FormatReport {
    page_count: usize,
    is_encrypted: bool,
    needs_ocr: bool,
    is_rare_format: bool,
    rare_format_kind: RareFormatKind,
    processing_strategy: ProcessingStrategy,
    warnings: Vec<String>,
}

/// Wire shape of [`FormatReport`], checked before it becomes one.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFormatReport {
    page_count: usize,
    is_encrypted: bool,
    needs_ocr: bool,
    is_rare_format: bool,
    rare_format_kind: RareFormatKind,
    processing_strategy: ProcessingStrategy,
    #[serde(default)]
    warnings: Vec<String>,
}

impl TryFrom<RawFormatReport> for FormatReport {
    type Error = String;

    fn try_from(raw: RawFormatReport) -> Result<Self, Self::Error> {
        let kind = raw.rare_format_kind;
        if raw.processing_strategy != kind.strategy() {
            return Err(format!(
                "processing strategy {:?} does not match rare format kind {:?}",
                raw.processing_strategy, kind
            ));
        }
        if raw.is_rare_format != (kind != RareFormatKind::None) {
            return Err(format!(
                "isRareFormat = {} contradicts rare format kind {:?}",
                raw.is_rare_format, kind
            ));
        }
        Ok(Self {
            page_count: raw.page_count,
            is_encrypted: raw.is_encrypted,
            needs_ocr: raw.needs_ocr,
            is_rare_format: raw.is_rare_format,
            rare_format_kind: kind,
            processing_strategy: raw.processing_strategy,
            warnings: raw.warnings,
        })
    }
}

impl Default for FormatReport {
    fn default() -> Self {
        Self {
            page_count: 0,
            is_encrypted: false,
            needs_ocr: false,
            is_rare_format: false,
            rare_format_kind: RareFormatKind::None,
            processing_strategy: ProcessingStrategy::Standard,
            warnings: Vec::new(),
        }
    }
}

impl FormatReport {
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn is_encrypted(&self) -> bool {
        self.is_encrypted
    }

    pub fn needs_ocr(&self) -> bool {
        self.needs_ocr
    }

    pub fn is_rare_format(&self) -> bool {
        self.is_rare_format
    }

    pub fn rare_format_kind(&self) -> RareFormatKind {
        self.rare_format_kind
    }

    pub fn processing_strategy(&self) -> ProcessingStrategy {
        self.processing_strategy
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    // Mutators are crate-private: only the detector assembles reports.

    pub(crate) fn set_kind(&mut self, kind: RareFormatKind) {
        self.rare_format_kind = kind;
        self.is_rare_format = kind != RareFormatKind::None;
        self.processing_strategy = kind.strategy();
    }

    pub(crate) fn set_page_count(&mut self, n: usize) {
        self.page_count = n;
    }

    pub(crate) fn set_encrypted(&mut self, v: bool) {
        self.is_encrypted = v;
    }

    pub(crate) fn set_needs_ocr(&mut self, v: bool) {
        self.needs_ocr = v;
    }

    pub(crate) fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// The report returned when analysis itself fails.
    pub(crate) fn analysis_error(detail: impl Into<String>) -> Self {
        let mut r = Self::default();
        r.set_kind(RareFormatKind::AnalysisError);
        r.set_needs_ocr(true);
        r.warn(format!("Error during format detection: {}", detail.into()));
        r
    }
}

// ── Conversion ───────────────────────────────────────────────────────────

/// The extraction strategies a converter can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    DirectText,
    Ocr,
    LlmAssisted,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::DirectText => "direct_text",
            BackendKind::Ocr => "ocr",
            BackendKind::LlmAssisted => "llm_assisted",
        }
    }

    /// Human-readable label used in Markdown output.
    pub fn label(self) -> &'static str {
        match self {
            BackendKind::DirectText => "Direct Text",
            BackendKind::Ocr => "OCR",
            BackendKind::LlmAssisted => "LLM Assisted",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One backend's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionAttempt {
    pub backend: BackendKind,
    pub markdown: Option<String>,
    pub elapsed_secs: f64,
    pub error: Option<String>,
}

impl ConversionAttempt {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.markdown.is_some()
    }
}

/// Structural plausibility of a Markdown text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    /// Unweighted mean of the sub-scores, always within `[0, 1]`.
    pub score: f64,
    pub issues: Vec<String>,
}

/// Everything the converter learned while producing one Markdown document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionReport {
    pub markdown: String,
    pub format: FormatReport,
    pub attempts: Vec<ConversionAttempt>,
    /// The backend whose output was accepted; `None` means the stub was emitted.
    pub backend_used: Option<BackendKind>,
    pub quality: QualityScore,
    /// A repaired copy was used instead of the original file.
    pub repaired: bool,
    pub elapsed_secs: f64,
}

impl ConversionReport {
    pub fn is_stub(&self) -> bool {
        self.backend_used.is_none()
    }

    /// Method label for downstream metadata (`stub` when nothing was accepted).
    pub fn method(&self) -> &'static str {
        self.backend_used.map(BackendKind::as_str).unwrap_or("stub")
    }
}

// ── Structured JSON ──────────────────────────────────────────────────────

/// A titled slice of a Markdown document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub title: String,
    pub level: u8,
    pub content: String,
}

/// Provenance and heuristically extracted facts about a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    pub source: String,
    pub collection: String,
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agency: Option<String>,
    pub conversion_timestamp: String,
    pub page_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// The normalised JSON unit written per document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub doc_id: String,
    pub title: String,
    pub metadata: RecordMetadata,
    pub sections: Vec<Section>,
    pub full_text: String,
}
