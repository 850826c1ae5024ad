//! End-to-end tests against real PDFs and real engines.
//!
//! These need a pdfium library (`PDFIUM_LIB_PATH`), the `tesseract`
//! executable and sample files in `./test_cases/`. The LLM test also needs
//! an API key. They are gated behind the `E2E_ENABLED` environment variable.
//!
//! Run with:
//!   E2E_ENABLED=1 cargo test --test e2e -- --nocapture

use docharvest::output::RareFormatKind;
use docharvest::{
    mapper, BackendKind, ConversionConfig, ConvertOptions, Converter, OcrQuality,
    ProcessingStrategy,
};
use std::path::PathBuf;

// ── Test helpers ─────────────────────────────────────────────────────────────

fn test_cases_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("test_cases")
}

/// Skip this test if E2E_ENABLED is not set *or* no file at `path`.
macro_rules! e2e_skip_unless_ready {
    ($path:expr) => {{
        if std::env::var("E2E_ENABLED").is_err() {
            println!("SKIP: set E2E_ENABLED=1 to run e2e tests");
            return;
        }
        let p: PathBuf = $path;
        if !p.exists() {
            println!("SKIP: test file not found: {}", p.display());
            return;
        }
        p
    }};
}

/// Assert the markdown passes basic quality checks.
fn assert_markdown_quality(md: &str, context: &str) {
    assert!(!md.trim().is_empty(), "[{context}] Markdown is empty");
    assert!(
        !md.contains("\n\n\n"),
        "[{context}] Output has runs of blank lines"
    );
    assert!(
        md.contains("*Method: "),
        "[{context}] Output is missing the provenance footer"
    );
}

// ── Detection ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_detect_text_pdf() {
    let path = e2e_skip_unless_ready!(test_cases_dir().join("text.pdf"));
    let converter = Converter::new(ConversionConfig::default());
    let report = converter.detect(&path).await;
    println!("{report:#?}");
    assert!(report.page_count() > 0);
    assert!(!report.needs_ocr());
    assert_eq!(report.processing_strategy(), ProcessingStrategy::Standard);
}

#[tokio::test]
async fn test_detect_scanned_pdf() {
    let path = e2e_skip_unless_ready!(test_cases_dir().join("scanned.pdf"));
    let converter = Converter::new(ConversionConfig::default());
    let report = converter.detect(&path).await;
    println!("{report:#?}");
    assert!(report.needs_ocr());
    assert_ne!(report.rare_format_kind(), RareFormatKind::AnalysisError);
}

// ── Conversion ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_convert_text_pdf_direct() {
    let path = e2e_skip_unless_ready!(test_cases_dir().join("text.pdf"));
    let converter = Converter::new(ConversionConfig::default());
    let report = converter
        .convert_detailed(&path, &ConvertOptions::default())
        .await;
    println!("{}", report.markdown);
    assert_eq!(report.backend_used, Some(BackendKind::DirectText));
    assert_markdown_quality(&report.markdown, "text.pdf");

    let record = mapper::to_document_from_str(&report.markdown, "text");
    assert!(record.metadata.page_count > 0);
}

#[tokio::test]
async fn test_convert_scanned_pdf_ocr() {
    let path = e2e_skip_unless_ready!(test_cases_dir().join("scanned.pdf"));
    let converter = Converter::new(ConversionConfig::default());
    let opts = ConvertOptions {
        force_ocr: true,
        quality: OcrQuality::Medium,
        ..ConvertOptions::default()
    };
    let report = converter.convert_detailed(&path, &opts).await;
    println!("{}", report.markdown);
    assert_eq!(report.backend_used, Some(BackendKind::Ocr));
    assert!(report.markdown.contains("*OCR: yes (medium quality)*"));
    assert_markdown_quality(&report.markdown, "scanned.pdf");
}

#[tokio::test]
async fn test_convert_with_llm_first() {
    let path = e2e_skip_unless_ready!(test_cases_dir().join("scanned.pdf"));
    let converter = Converter::new(ConversionConfig::default());
    if !converter
        .available_backends()
        .contains(&BackendKind::LlmAssisted)
    {
        println!("SKIP: no LLM API key configured");
        return;
    }
    let opts = ConvertOptions {
        use_llm: true,
        ..ConvertOptions::default()
    };
    let report = converter.convert_detailed(&path, &opts).await;
    println!("{}", report.markdown);
    assert_eq!(report.attempts[0].backend, BackendKind::LlmAssisted);
    assert_markdown_quality(&report.markdown, "scanned.pdf (llm)");
}

#[test]
fn test_converter_is_send_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Converter>();
    assert_send_sync::<docharvest::batch::PipelineProcessor>();
}
