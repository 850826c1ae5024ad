//! Run metrics, injected rather than global.
//!
//! Components that take an `Arc<dyn MetricsSink>` report downloads,
//! conversions, item outcomes and categorised errors into it. The default
//! [`InMemoryMetrics`] keeps counters behind a mutex and can be snapshotted
//! into the batch report.

use crate::error::ErrorCategory;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

/// Most recent errors kept in a snapshot.
const RECENT_ERRORS: usize = 100;

pub trait MetricsSink: Send + Sync {
    fn record_download(&self, bytes: u64, elapsed: Duration);
    fn record_conversion(&self, method: &str, elapsed: Duration);
    fn record_item(&self, succeeded: bool, elapsed: Duration);
    fn record_error(&self, category: ErrorCategory, context: &str, detail: &str);
    fn snapshot(&self) -> MetricsSnapshot;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub category: ErrorCategory,
    pub context: String,
    pub detail: String,
    pub at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub downloads: u64,
    pub download_bytes: u64,
    pub download_secs: f64,
    /// Conversions per method label.
    pub conversions: BTreeMap<String, u64>,
    pub conversion_secs: f64,
    pub items_succeeded: u64,
    pub items_failed: u64,
    pub item_secs: f64,
    pub errors_by_category: BTreeMap<String, u64>,
    pub recent_errors: Vec<ErrorRecord>,
}

impl MetricsSnapshot {
    pub fn total_errors(&self) -> u64 {
        self.errors_by_category.values().sum()
    }

    /// Mean seconds per processed item, 0 when nothing ran.
    pub fn mean_item_secs(&self) -> f64 {
        let n = self.items_succeeded + self.items_failed;
        if n == 0 {
            0.0
        } else {
            self.item_secs / n as f64
        }
    }
}

/// Thread-safe in-process counters.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    inner: Mutex<MetricsSnapshot>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut MetricsSnapshot) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record_download(&self, bytes: u64, elapsed: Duration) {
        self.with(|m| {
            m.downloads += 1;
            m.download_bytes += bytes;
            m.download_secs += elapsed.as_secs_f64();
        });
    }

    fn record_conversion(&self, method: &str, elapsed: Duration) {
        self.with(|m| {
            *m.conversions.entry(method.to_string()).or_default() += 1;
            m.conversion_secs += elapsed.as_secs_f64();
        });
    }

    fn record_item(&self, succeeded: bool, elapsed: Duration) {
        self.with(|m| {
            if succeeded {
                m.items_succeeded += 1;
            } else {
                m.items_failed += 1;
            }
            m.item_secs += elapsed.as_secs_f64();
        });
    }

    fn record_error(&self, category: ErrorCategory, context: &str, detail: &str) {
        self.with(|m| {
            *m.errors_by_category
                .entry(category.as_str().to_string())
                .or_default() += 1;
            if m.recent_errors.len() == RECENT_ERRORS {
                m.recent_errors.remove(0);
            }
            m.recent_errors.push(ErrorRecord {
                category,
                context: context.to_string(),
                detail: detail.to_string(),
                at: chrono::Local::now().to_rfc3339(),
            });
        });
    }

    fn snapshot(&self) -> MetricsSnapshot {
        self.with(|m| m.clone())
    }
}
