//! # docharvest
//!
//! Crawl archive listing pages, download the PDFs they link to, convert each
//! document to Markdown and map it into structured JSON records and a single
//! knowledge-base file.
//!
//! ## Pipeline Overview
//!
//! ```text
//! listing pages
//!  │
//!  ├─ 1. Crawl     collect .pdf links                      (crawl)
//!  ├─ 2. Download  retrying, resumable, organised on disk  (download)
//!  ├─ 3. Detect    encryption, scans, rare formats          (pipeline::detect)
//!  ├─ 4. Repair    re-save damaged files through pdfium     (pipeline::repair)
//!  ├─ 5. Convert   LLM → OCR → direct text fallback chain   (convert, backend)
//!  ├─ 6. Polish    post-processing + quality score          (pipeline::postprocess)
//!  ├─ 7. Map       Markdown → DocumentRecord JSON           (mapper)
//!  └─ 8. Merge     knowledge-base JSON array                (knowledge)
//! ```
//!
//! Steps 2, 5 and 7 run per URL under the [`batch::Orchestrator`], which adds
//! an elastic worker pool, checkpoints and a circuit breaker.
//!
//! Conversion never fails: when every backend is rejected a descriptive stub
//! is produced so the downstream JSON still exists.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docharvest::{ConversionConfig, ConvertOptions, Converter};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() {
//!     let converter = Converter::new(ConversionConfig::default());
//!     let markdown = converter
//!         .convert(Path::new("104-10003-10041.pdf"), &ConvertOptions::default())
//!         .await;
//!     let record = docharvest::mapper::to_document_from_str(&markdown, "104-10003-10041");
//!     println!("{} sections", record.sections.len());
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docharvest` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! ## External tools
//!
//! | Backend | Needs |
//! |---------|-------|
//! | Direct text | a pdfium library (`PDFIUM_LIB_PATH` or system install) |
//! | OCR | pdfium plus the `tesseract` executable |
//! | LLM | pdfium plus an API key (`OPENAI_API_KEY`, `ANTHROPIC_API_KEY`, ...) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backend;
pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod convert;
pub mod crawl;
pub mod download;
pub mod error;
pub mod knowledge;
pub mod mapper;
pub mod metrics;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod storage;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use batch::{
    BatchReport, BatchStats, ItemOutcome, ItemProcessor, ItemStatus, Orchestrator,
    PipelineProcessor,
};
pub use checkpoint::{Checkpoint, CheckpointStore, CheckpointTrigger};
pub use config::{
    BatchConfig, BatchConfigBuilder, ConversionConfig, ConversionConfigBuilder, DownloadConfig,
    OcrQuality, OutputLayout,
};
pub use convert::{ConvertOptions, Converter};
pub use crawl::Crawler;
pub use download::Downloader;
pub use error::{ErrorCategory, HarvestError};
pub use knowledge::KnowledgeBase;
pub use metrics::{InMemoryMetrics, MetricsSink, MetricsSnapshot};
pub use output::{
    BackendKind, ConversionReport, DocumentRecord, FormatReport, ProcessingStrategy, QualityScore,
    Section,
};
pub use progress::{BatchProgressCallback, NoopProgressCallback, ProgressCallback};
