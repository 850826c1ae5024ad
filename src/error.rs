//! Error types for the docharvest library.
//!
//! Two layers of failure exist in the pipeline:
//!
//! * [`HarvestError`] is what an individual stage returns internally (a
//!   download that hit a 404, a backend that could not open a PDF, a
//!   checkpoint whose schema does not match).
//!
//! * The public component boundaries (`detect`, `repair`, `Converter::convert`,
//!   `to_document`, `Downloader::download`, ...) never return it. They log the
//!   error with its [`ErrorCategory`], record it in the
//!   [`crate::metrics::MetricsSink`] and degrade to a valid value instead, so
//!   one bad document never stops a batch.

use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, HarvestError>;

/// All errors produced inside the docharvest pipeline.
#[derive(Debug, Error)]
pub enum HarvestError {
    // ── Download errors ───────────────────────────────────────────────────
    /// Network-level failure or an exhausted retry budget.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed {
        url: String,
        reason: String,
        permanent: bool,
    },

    /// Server answered with a non-success status.
    #[error("HTTP {status} while fetching '{url}'")]
    HttpStatus { url: String, status: u16 },

    /// Body length disagrees with the advertised Content-Length.
    #[error("Incomplete download for '{url}': expected {expected} bytes, got {actual}")]
    SizeMismatch {
        url: String,
        expected: u64,
        actual: u64,
    },

    // ── Conversion errors ─────────────────────────────────────────────────
    /// A backend ran but could not extract anything useful.
    #[error("{backend} conversion failed: {detail}")]
    ConversionFailed { backend: String, detail: String },

    /// The backend's runtime dependency (pdfium, tesseract, API key) is missing.
    #[error("{backend} backend is unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// The PDF is encrypted and the empty password does not open it.
    #[error("PDF '{path}' is encrypted and requires a password")]
    PasswordRequired { path: PathBuf },

    /// pdfium could not render a page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// tesseract exited unsuccessfully or could not be spawned.
    #[error("OCR failed for page {page}: {detail}")]
    OcrFailed { page: usize, detail: String },

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Format detection errors ───────────────────────────────────────────
    /// The detector could not analyse the document.
    #[error("Format detection failed for '{path}': {detail}")]
    FormatDetection { path: PathBuf, detail: String },

    // ── Checkpoint errors ─────────────────────────────────────────────────
    /// Reading, writing or parsing a checkpoint file failed.
    #[error("Checkpoint '{name}' failed: {detail}")]
    CheckpointFailed { name: String, detail: String },

    /// The checkpoint was written by an incompatible schema version.
    #[error("Checkpoint '{name}' has schema version {found}, expected {expected}")]
    SchemaMismatch {
        name: String,
        found: u32,
        expected: u32,
    },

    /// The checkpoint was written for a different run configuration.
    #[error("Checkpoint '{name}' was created with parameters {found}, current run uses {expected}")]
    ParamMismatch {
        name: String,
        found: String,
        expected: String,
    },

    // ── Storage errors ────────────────────────────────────────────────────
    /// Could not create or write an output file.
    #[error("Failed to write '{path}': {source}")]
    StorageFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An output artefact was written but violates its format contract.
    #[error("Invalid output '{path}': {detail}")]
    InvalidOutput { path: PathBuf, detail: String },

    // ── Engine errors ─────────────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
    )]
    PdfiumBindingFailed(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error kinds used for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Download,
    Conversion,
    Checkpoint,
    FormatDetection,
    Storage,
    Config,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Download => "download",
            ErrorCategory::Conversion => "conversion",
            ErrorCategory::Checkpoint => "checkpoint",
            ErrorCategory::FormatDetection => "format_detection",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Config => "config",
            ErrorCategory::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl HarvestError {
    /// The kind of failure, independent of the concrete variant.
    pub fn category(&self) -> ErrorCategory {
        match self {
            HarvestError::DownloadFailed { .. }
            | HarvestError::HttpStatus { .. }
            | HarvestError::SizeMismatch { .. } => ErrorCategory::Download,
            HarvestError::ConversionFailed { .. }
            | HarvestError::BackendUnavailable { .. }
            | HarvestError::CorruptPdf { .. }
            | HarvestError::PasswordRequired { .. }
            | HarvestError::RasterisationFailed { .. }
            | HarvestError::OcrFailed { .. }
            | HarvestError::ProviderNotConfigured { .. }
            | HarvestError::PdfiumBindingFailed(_) => ErrorCategory::Conversion,
            HarvestError::FormatDetection { .. } => ErrorCategory::FormatDetection,
            HarvestError::CheckpointFailed { .. }
            | HarvestError::SchemaMismatch { .. }
            | HarvestError::ParamMismatch { .. } => ErrorCategory::Checkpoint,
            HarvestError::StorageFailed { .. } | HarvestError::InvalidOutput { .. } => {
                ErrorCategory::Storage
            }
            HarvestError::InvalidConfig(_) => ErrorCategory::Config,
            HarvestError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Whether retrying the same operation is pointless.
    ///
    /// Only download errors distinguish transient from permanent failures;
    /// 401/403/404 and other client errors are permanent, 429 and 5xx are not.
    pub fn is_permanent(&self) -> bool {
        match self {
            HarvestError::DownloadFailed { permanent, .. } => *permanent,
            HarvestError::HttpStatus { status, .. } => is_permanent_status(*status),
            HarvestError::SizeMismatch { .. } => false,
            _ => true,
        }
    }
}

/// Client errors other than 408 and 429 will not succeed on retry.
pub fn is_permanent_status(status: u16) -> bool {
    (400..500).contains(&status) && status != 408 && status != 429
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_404_is_permanent() {
        let e = HarvestError::HttpStatus {
            url: "https://example.org/a.pdf".into(),
            status: 404,
        };
        assert!(e.is_permanent());
        assert_eq!(e.category(), ErrorCategory::Download);
    }

    #[test]
    fn server_errors_and_throttling_are_transient() {
        for status in [500u16, 502, 503, 429, 408] {
            let e = HarvestError::HttpStatus {
                url: "u".into(),
                status,
            };
            assert!(!e.is_permanent(), "status {status} should be retryable");
        }
    }

    #[test]
    fn size_mismatch_display() {
        let e = HarvestError::SizeMismatch {
            url: "https://example.org/x.pdf".into(),
            expected: 100,
            actual: 42,
        };
        let msg = e.to_string();
        assert!(msg.contains("100"), "got: {msg}");
        assert!(msg.contains("42"), "got: {msg}");
    }

    #[test]
    fn schema_mismatch_is_checkpoint_category() {
        let e = HarvestError::SchemaMismatch {
            name: "batch".into(),
            found: 0,
            expected: 1,
        };
        assert_eq!(e.category(), ErrorCategory::Checkpoint);
        assert!(e.to_string().contains("schema version 0"));
    }

    #[test]
    fn category_display_is_snake_case() {
        assert_eq!(ErrorCategory::FormatDetection.to_string(), "format_detection");
    }
}
