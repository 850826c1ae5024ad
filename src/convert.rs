//! The conversion driver: detection, repair, backend fallback and the stub.
//!
//! [`Converter::convert`] always yields Markdown. Backends are tried in a
//! ranked order that depends on whether the document looks scanned, each at
//! most once; the first output longer than
//! [`ConversionConfig::accept_threshold`] characters wins. When none does, a
//! descriptive stub documents the file and every failed attempt so the
//! downstream JSON mapper still has something to index.

use crate::backend::{BackendJob, ConversionBackend, DirectTextBackend, LlmBackend, OcrBackend};
use crate::config::{ConversionConfig, OcrQuality};
use crate::error::HarvestError;
use crate::output::{
    BackendKind, ConversionAttempt, ConversionReport, FormatReport, ProcessingStrategy,
};
use crate::pipeline::{detect, postprocess, repair};
use crate::storage::write_atomic;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Below this quality score a warning is logged; acceptance is unaffected.
const LOW_QUALITY_SCORE: f64 = 0.5;

/// Per-call conversion switches.
#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    /// Prefer OCR over embedded text regardless of detection.
    pub force_ocr: bool,
    /// Rasterisation quality for OCR.
    pub quality: OcrQuality,
    /// Try the vision-LLM backend first.
    pub use_llm: bool,
    /// Replace the detected processing strategy.
    pub strategy_override: Option<ProcessingStrategy>,
}

/// Runs the ranked backend list against documents.
pub struct Converter {
    config: Arc<ConversionConfig>,
    backends: Vec<Arc<dyn ConversionBackend>>,
}

impl Converter {
    /// A converter with the built-in direct-text, OCR and LLM backends.
    pub fn new(config: ConversionConfig) -> Self {
        let config = Arc::new(config);
        let backends: Vec<Arc<dyn ConversionBackend>> = vec![
            Arc::new(DirectTextBackend::new(Arc::clone(&config))),
            Arc::new(OcrBackend::new(Arc::clone(&config))),
            Arc::new(LlmBackend::new(Arc::clone(&config))),
        ];
        Self { config, backends }
    }

    /// A converter with caller-supplied backends, looked up by [`BackendKind`].
    pub fn with_backends(config: ConversionConfig, backends: Vec<Arc<dyn ConversionBackend>>) -> Self {
        Self {
            config: Arc::new(config),
            backends,
        }
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    /// Kinds of the backends that can run on this host.
    pub fn available_backends(&self) -> Vec<BackendKind> {
        self.backends
            .iter()
            .filter(|b| b.is_available())
            .map(|b| b.kind())
            .collect()
    }

    fn backend(&self, kind: BackendKind) -> Option<&Arc<dyn ConversionBackend>> {
        self.backends.iter().find(|b| b.kind() == kind)
    }

    /// Detect the document format.
    pub async fn detect(&self, path: &Path) -> FormatReport {
        detect::detect(path, &self.config).await
    }

    /// Convert to Markdown, returning only the text.
    pub async fn convert(&self, path: &Path, opts: &ConvertOptions) -> String {
        self.convert_detailed(path, opts).await.markdown
    }

    /// Detect, then convert, returning everything learned on the way.
    pub async fn convert_detailed(&self, path: &Path, opts: &ConvertOptions) -> ConversionReport {
        let format = self.detect(path).await;
        self.convert_with_report(path, format, opts).await
    }

    /// Convert using an already computed [`FormatReport`].
    pub async fn convert_with_report(
        &self,
        path: &Path,
        format: FormatReport,
        opts: &ConvertOptions,
    ) -> ConversionReport {
        let start = Instant::now();
        let job = BackendJob::for_path(path, opts.quality);
        let strategy = opts
            .strategy_override
            .unwrap_or_else(|| format.processing_strategy());
        let mut needs_ocr = opts.force_ocr || format.needs_ocr();

        // Keep the repaired copy alive until every backend has run.
        let mut repaired = None;
        match strategy {
            ProcessingStrategy::DeepRepair
            | ProcessingStrategy::Cautious
            | ProcessingStrategy::DecryptFirst => {
                repaired = repair::repair(path, &self.config).await;
                if repaired.is_none() {
                    debug!("repair failed for {}, forcing OCR", path.display());
                    needs_ocr = true;
                }
            }
            ProcessingStrategy::NormalizePages => {
                repaired = repair::repair(path, &self.config).await;
            }
            ProcessingStrategy::OcrOnly
            | ProcessingStrategy::SelectiveOcr
            | ProcessingStrategy::CarefulExtraction => needs_ocr = true,
            ProcessingStrategy::Standard => {}
        }
        let source: PathBuf = repaired
            .as_ref()
            .map(|r| r.path().to_path_buf())
            .unwrap_or_else(|| path.to_path_buf());

        info!(
            path = %path.display(),
            strategy = ?strategy,
            needs_ocr,
            "converting"
        );

        let mut attempts = Vec::new();
        let mut accepted: Option<(BackendKind, String)> = None;
        for kind in plan(opts.use_llm, needs_ocr) {
            let attempt_start = Instant::now();
            let attempt = match self.backend(kind) {
                Some(backend) if backend.is_available() => {
                    match backend.convert(&source, &job).await {
                        Ok(md) => {
                            let len = md.trim().chars().count();
                            if len > self.config.accept_threshold {
                                ConversionAttempt {
                                    backend: kind,
                                    markdown: Some(md),
                                    elapsed_secs: attempt_start.elapsed().as_secs_f64(),
                                    error: None,
                                }
                            } else {
                                ConversionAttempt {
                                    backend: kind,
                                    markdown: None,
                                    elapsed_secs: attempt_start.elapsed().as_secs_f64(),
                                    error: Some(format!("output too short ({} chars)", len)),
                                }
                            }
                        }
                        Err(e) => {
                            warn!(backend = %kind, path = %path.display(), category = %e.category(), "{}", e);
                            ConversionAttempt {
                                backend: kind,
                                markdown: None,
                                elapsed_secs: attempt_start.elapsed().as_secs_f64(),
                                error: Some(e.to_string()),
                            }
                        }
                    }
                }
                _ => ConversionAttempt {
                    backend: kind,
                    markdown: None,
                    elapsed_secs: 0.0,
                    error: Some("backend unavailable".to_string()),
                },
            };

            if attempt.succeeded() {
                let md = attempt.markdown.clone().unwrap_or_default();
                attempts.push(attempt);
                accepted = Some((kind, md));
                break;
            }
            debug!(backend = %kind, error = ?attempt.error, "attempt rejected");
            attempts.push(attempt);
        }

        let (backend_used, body) = match accepted {
            Some((kind, md)) => (
                Some(kind),
                postprocess::post_process(&md, kind == BackendKind::Ocr),
            ),
            None => {
                warn!(path = %path.display(), "all backends failed, emitting stub");
                (None, fallback_stub(path, &attempts))
            }
        };

        let quality = postprocess::validate_quality(&body);
        if quality.score < LOW_QUALITY_SCORE {
            warn!(
                path = %path.display(),
                score = quality.score,
                issues = ?quality.issues,
                "low quality conversion"
            );
        }

        let elapsed_secs = start.elapsed().as_secs_f64();
        let markdown = if self.config.include_footer {
            format!(
                "{}{}",
                body.trim_end(),
                footer(backend_used, opts.quality, quality.score, elapsed_secs)
            )
        } else {
            body
        };

        ConversionReport {
            markdown,
            format,
            attempts,
            backend_used,
            quality,
            repaired: repaired.is_some(),
            elapsed_secs,
        }
    }

    /// Convert `pdf` and write the Markdown to `md_path` atomically.
    pub async fn convert_to_file(
        &self,
        pdf: &Path,
        md_path: &Path,
        opts: &ConvertOptions,
    ) -> Result<ConversionReport, HarvestError> {
        let report = self.convert_detailed(pdf, opts).await;
        write_atomic(md_path, report.markdown.as_bytes()).await?;
        info!(
            "wrote {} ({} bytes, method {})",
            md_path.display(),
            report.markdown.len(),
            report.method()
        );
        Ok(report)
    }
}

/// Backend order for one document.
pub fn plan(use_llm: bool, needs_ocr: bool) -> Vec<BackendKind> {
    let mut order = Vec::with_capacity(3);
    if use_llm {
        order.push(BackendKind::LlmAssisted);
    }
    if needs_ocr {
        order.extend([BackendKind::Ocr, BackendKind::DirectText]);
    } else {
        order.extend([BackendKind::DirectText, BackendKind::Ocr]);
    }
    order
}

fn footer(backend: Option<BackendKind>, quality: OcrQuality, score: f64, secs: f64) -> String {
    let method = backend.map(BackendKind::label).unwrap_or("Fallback stub");
    let ocr = if backend == Some(BackendKind::Ocr) {
        format!("yes ({} quality)", quality)
    } else {
        "no".to_string()
    };
    format!(
        "\n\n---\n\n*Converted on {}*\n*Method: {}*\n*OCR: {}*\n*Quality score: {:.2}*\n*Processing time: {:.2}s*\n",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        method,
        ocr,
        score,
        secs
    )
}

/// Describe a file from its leading bytes.
pub fn sniff_file_type(header: &[u8]) -> String {
    if let Some(rest) = header.strip_prefix(b"%PDF-") {
        let version: String = rest
            .iter()
            .take(3)
            .map(|&b| b as char)
            .filter(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        format!("PDF document (version {})", version)
    } else if header.starts_with(&[0xFF, 0xD8]) {
        "JPEG image".to_string()
    } else if header.starts_with(b"\x89PNG") {
        "PNG image".to_string()
    } else if header.starts_with(b"GIF") {
        "GIF image".to_string()
    } else {
        "Unknown".to_string()
    }
}

fn read_header(path: &Path) -> Vec<u8> {
    use std::io::Read;
    let mut buf = Vec::with_capacity(16);
    if let Ok(file) = std::fs::File::open(path) {
        let _ = file.take(16).read_to_end(&mut buf);
    }
    buf
}

/// Markdown emitted when no backend produced acceptable output.
pub fn fallback_stub(path: &Path, attempts: &[ConversionAttempt]) -> String {
    let filename = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.clone());
    let size = match std::fs::metadata(path) {
        Ok(m) => format!("{:.1} KB", m.len() as f64 / 1024.0),
        Err(_) => "unavailable (file missing)".to_string(),
    };

    let mut md = format!(
        "# {stem}\n\n\
         ## Document Information\n\n\
         - **Filename**: {filename}\n\
         - **File Size**: {size}\n\
         - **File Type**: {file_type}\n\
         - **Conversion Timestamp**: {ts}\n\
         - **Conversion Note**: No conversion backend produced usable text\n\n\
         ## Content\n\n\
         *Text could not be extracted from this document.*\n\
         *It may be a scanned image that needs OCR; check that pdfium and tesseract are installed.*\n",
        stem = stem,
        filename = filename,
        size = size,
        file_type = sniff_file_type(&read_header(path)),
        ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
    );

    let failed: Vec<_> = attempts.iter().filter(|a| !a.succeeded()).collect();
    if !failed.is_empty() {
        md.push_str("\n## Conversion Attempts\n\n");
        for attempt in failed {
            let first_line = attempt
                .error
                .as_deref()
                .and_then(|e| e.lines().next())
                .unwrap_or("unknown error");
            md.push_str(&format!(
                "### {}\n\n```\n{}\n```\n\n",
                attempt.backend.label(),
                first_line
            ));
        }
    }
    md.trim_end().to_string() + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        kind: BackendKind,
        available: bool,
        output: Result<String, String>,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(kind: BackendKind, available: bool, output: Result<&str, &str>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                available,
                output: output.map(str::to_string).map_err(str::to_string),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ConversionBackend for Fixed {
        fn kind(&self) -> BackendKind {
            self.kind
        }
        fn is_available(&self) -> bool {
            self.available
        }
        async fn convert(&self, _pdf: &Path, _job: &BackendJob) -> Result<String, HarvestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.output.clone().map_err(|detail| HarvestError::ConversionFailed {
                backend: self.kind.as_str().to_string(),
                detail,
            })
        }
    }

    fn dyn_backend(b: &Arc<Fixed>) -> Arc<dyn ConversionBackend> {
        b.clone()
    }

    fn long_text() -> String {
        format!("# doc\n\n## Page 1\n\n{}", "Readable typed memorandum text. ".repeat(10))
    }

    fn quiet_config() -> ConversionConfig {
        ConversionConfig {
            include_footer: false,
            ..Default::default()
        }
    }

    #[test]
    fn plan_orders() {
        use BackendKind::*;
        assert_eq!(plan(false, false), vec![DirectText, Ocr]);
        assert_eq!(plan(false, true), vec![Ocr, DirectText]);
        assert_eq!(plan(true, false), vec![LlmAssisted, DirectText, Ocr]);
    }

    #[tokio::test]
    async fn first_long_output_wins() {
        let direct = Fixed::new(BackendKind::DirectText, true, Ok(long_text().as_str()));
        let ocr = Fixed::new(BackendKind::Ocr, true, Ok("unused"));
        let conv = Converter::with_backends(quiet_config(), vec![dyn_backend(&direct), dyn_backend(&ocr)]);

        let report = conv
            .convert_with_report(Path::new("doc.pdf"), FormatReport::default(), &ConvertOptions::default())
            .await;
        assert_eq!(report.backend_used, Some(BackendKind::DirectText));
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 0);
        assert!(report.markdown.contains("## Page 1"));
    }

    #[tokio::test]
    async fn short_output_falls_through_to_ocr() {
        let direct = Fixed::new(BackendKind::DirectText, true, Ok("tiny"));
        let ocr = Fixed::new(BackendKind::Ocr, true, Ok(long_text().as_str()));
        let conv = Converter::with_backends(quiet_config(), vec![dyn_backend(&direct), dyn_backend(&ocr)]);

        let report = conv
            .convert_with_report(Path::new("doc.pdf"), FormatReport::default(), &ConvertOptions::default())
            .await;
        assert_eq!(report.backend_used, Some(BackendKind::Ocr));
        assert_eq!(
            report.attempts[0].error.as_deref(),
            Some("output too short (4 chars)")
        );
    }

    #[tokio::test]
    async fn each_backend_runs_once_then_stub() {
        let direct = Fixed::new(BackendKind::DirectText, true, Err("no text layer"));
        let ocr = Fixed::new(BackendKind::Ocr, false, Ok("never"));
        let conv = Converter::with_backends(quiet_config(), vec![dyn_backend(&direct), dyn_backend(&ocr)]);

        let report = conv
            .convert_with_report(Path::new("/missing/104-1-2.pdf"), FormatReport::default(), &ConvertOptions::default())
            .await;
        assert!(report.is_stub());
        assert_eq!(report.method(), "stub");
        assert_eq!(direct.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.attempts[1].error.as_deref(), Some("backend unavailable"));
        assert!(report.markdown.starts_with("# 104-1-2\n"));
        assert!(report.markdown.contains("## Conversion Attempts"));
        assert!(report.markdown.contains("### Direct Text\n\n```\n"));
        assert!(report.markdown.contains("no text layer"));
    }

    #[tokio::test]
    async fn force_ocr_reorders() {
        let direct = Fixed::new(BackendKind::DirectText, true, Ok(long_text().as_str()));
        let ocr = Fixed::new(BackendKind::Ocr, true, Ok(long_text().as_str()));
        let conv = Converter::with_backends(quiet_config(), vec![dyn_backend(&direct), dyn_backend(&ocr)]);
        let opts = ConvertOptions {
            force_ocr: true,
            ..Default::default()
        };
        let report = conv
            .convert_with_report(Path::new("doc.pdf"), FormatReport::default(), &opts)
            .await;
        assert_eq!(report.backend_used, Some(BackendKind::Ocr));
        assert_eq!(direct.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn footer_reports_method() {
        let direct = Fixed::new(BackendKind::DirectText, true, Ok(long_text().as_str()));
        let conv = Converter::with_backends(ConversionConfig::default(), vec![dyn_backend(&direct)]);
        let md = conv
            .convert_with_report(Path::new("doc.pdf"), FormatReport::default(), &ConvertOptions::default())
            .await
            .markdown;
        assert!(md.contains("\n---\n"));
        assert!(md.contains("*Method: Direct Text*"));
        assert!(md.contains("*OCR: no*"));
        assert!(md.contains("*Quality score: 0."));
    }

    #[test]
    fn sniffs_magic_bytes() {
        assert_eq!(sniff_file_type(b"%PDF-1.4\n%"), "PDF document (version 1.4)");
        assert_eq!(sniff_file_type(&[0xFF, 0xD8, 0xFF]), "JPEG image");
        assert_eq!(sniff_file_type(b"\x89PNG\r\n"), "PNG image");
        assert_eq!(sniff_file_type(b"GIF89a"), "GIF image");
        assert_eq!(sniff_file_type(b""), "Unknown");
    }

    #[test]
    fn stub_for_missing_file_is_not_empty() {
        let md = fallback_stub(Path::new("/nowhere/ghost.pdf"), &[]);
        assert!(md.starts_with("# ghost\n\n## Document Information"));
        assert!(md.contains("- **Filename**: ghost.pdf"));
        assert!(md.contains("- **File Type**: Unknown"));
        assert!(!md.contains("## Conversion Attempts"));
    }
}
