//! Per-URL work run by the orchestrator.

use crate::config::OutputLayout;
use crate::convert::{ConvertOptions, Converter};
use crate::download::Downloader;
use crate::mapper;
use crate::metrics::MetricsSink;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Method label for items whose outputs already existed.
pub const REUSED_METHOD: &str = "reused";

/// Result of processing one URL. Failures are values, not errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemOutcome {
    pub url: String,
    pub succeeded: bool,
    /// Conversion method label, when a conversion happened or was reused.
    pub method: Option<String>,
    /// Only the fallback stub could be produced.
    pub stub: bool,
    pub bytes_downloaded: u64,
    pub error: Option<String>,
    pub elapsed_secs: f64,
}

impl ItemOutcome {
    pub fn success(url: &str, method: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            url: url.to_string(),
            succeeded: true,
            method: Some(method.into()),
            stub: false,
            bytes_downloaded: 0,
            error: None,
            elapsed_secs: elapsed.as_secs_f64(),
        }
    }

    pub fn failure(url: &str, error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            url: url.to_string(),
            succeeded: false,
            method: None,
            stub: false,
            bytes_downloaded: 0,
            error: Some(error.into()),
            elapsed_secs: elapsed.as_secs_f64(),
        }
    }
}

/// Work performed for one URL of a batch.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    async fn process(&self, url: &str) -> ItemOutcome;
}

/// Download → convert → map → write, reusing outputs that already exist.
pub struct PipelineProcessor {
    downloader: Downloader,
    converter: Arc<Converter>,
    options: ConvertOptions,
    layout: OutputLayout,
    metrics: Arc<dyn MetricsSink>,
}

impl PipelineProcessor {
    pub fn new(
        downloader: Downloader,
        converter: Arc<Converter>,
        options: ConvertOptions,
        layout: OutputLayout,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            downloader,
            converter,
            options,
            layout,
            metrics,
        }
    }
}

async fn non_empty(path: &Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(m) if m.len() > 0)
}

#[async_trait]
impl ItemProcessor for PipelineProcessor {
    async fn process(&self, url: &str) -> ItemOutcome {
        let start = Instant::now();
        let downloaded = match self.downloader.try_download(url, &self.layout.pdf_dir).await {
            Ok(d) => d,
            Err(e) => {
                warn!(url, category = %e.category(), "{}", e);
                self.metrics.record_error(e.category(), url, &e.to_string());
                return ItemOutcome::failure(url, e.to_string(), start.elapsed());
            }
        };
        let bytes = if downloaded.reused { 0 } else { downloaded.bytes };

        let stem = downloaded
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        let md_path = self.layout.markdown_dir.join(format!("{}.md", stem));
        let json_path = self.layout.json_dir.join(format!("{}.json", stem));

        let md_exists = non_empty(&md_path).await;
        if md_exists && non_empty(&json_path).await {
            debug!(url, "outputs already present, skipping");
            let mut outcome = ItemOutcome::success(url, REUSED_METHOD, start.elapsed());
            outcome.bytes_downloaded = bytes;
            return outcome;
        }

        let (method, stub) = if md_exists {
            debug!(url, "markdown already present, mapping only");
            (REUSED_METHOD.to_string(), false)
        } else {
            let convert_start = Instant::now();
            match self
                .converter
                .convert_to_file(&downloaded.path, &md_path, &self.options)
                .await
            {
                Ok(report) => {
                    self.metrics
                        .record_conversion(report.method(), convert_start.elapsed());
                    (report.method().to_string(), report.is_stub())
                }
                Err(e) => {
                    warn!(url, category = %e.category(), "{}", e);
                    self.metrics.record_error(e.category(), url, &e.to_string());
                    let mut outcome = ItemOutcome::failure(url, e.to_string(), start.elapsed());
                    outcome.bytes_downloaded = bytes;
                    return outcome;
                }
            }
        };

        let mut record = mapper::to_document(&md_path, None);
        if method != REUSED_METHOD {
            record.metadata.conversion_method = Some(method.clone());
        }
        if let Err(e) = mapper::write_document(&record, &json_path).await {
            warn!(url, category = %e.category(), "{}", e);
            self.metrics.record_error(e.category(), url, &e.to_string());
            let mut outcome = ItemOutcome::failure(url, e.to_string(), start.elapsed());
            outcome.bytes_downloaded = bytes;
            return outcome;
        }

        let mut outcome = ItemOutcome::success(url, method, start.elapsed());
        outcome.stub = stub;
        outcome.bytes_downloaded = bytes;
        outcome
    }
}
