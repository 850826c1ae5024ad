//! Progress-callback trait for per-item batch events.
//!
//! Inject an [`Arc<dyn BatchProgressCallback>`] via
//! [`crate::config::BatchConfigBuilder::progress_callback`] to receive events
//! as the orchestrator dispatches and finishes each URL.
//!
//! # Example
//!
//! ```rust
//! use docharvest::{BatchConfig, BatchProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     done: AtomicUsize,
//! }
//!
//! impl BatchProgressCallback for CountingCallback {
//!     fn on_item_complete(&self, url: &str, method: &str) {
//!         let n = self.done.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{n}: {url} via {method}");
//!     }
//! }
//!
//! let config = BatchConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { done: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::batch::BatchStats;
use std::sync::Arc;

/// Called by the batch orchestrator as items move through the pipeline.
///
/// Items run concurrently, so `on_item_*` may be called from several tasks
/// at once. All methods default to no-ops.
pub trait BatchProgressCallback: Send + Sync {
    /// Called once before dispatch starts.
    ///
    /// * `total`   - URLs in the run, including skipped ones
    /// * `skipped` - URLs already completed in a resumed checkpoint
    fn on_batch_start(&self, total: usize, skipped: usize) {
        let _ = (total, skipped);
    }

    /// Called when a worker picks up `url`.
    fn on_item_start(&self, url: &str) {
        let _ = url;
    }

    /// Called when `url` finished; `method` is the conversion method label.
    fn on_item_complete(&self, url: &str, method: &str) {
        let _ = (url, method);
    }

    /// Called when `url` failed.
    fn on_item_error(&self, url: &str, error: &str) {
        let _ = (url, error);
    }

    /// Called once after every dispatched item has finished.
    fn on_batch_complete(&self, stats: &BatchStats) {
        let _ = stats;
    }
}

/// Callback that ignores every event.
pub struct NoopProgressCallback;

impl BatchProgressCallback for NoopProgressCallback {}

/// Type stored in [`crate::config::BatchConfig`].
pub type ProgressCallback = Arc<dyn BatchProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Tracking {
        starts: AtomicUsize,
        completes: AtomicUsize,
        errors: AtomicUsize,
    }

    impl BatchProgressCallback for Tracking {
        fn on_item_start(&self, _url: &str) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_item_complete(&self, _url: &str, _method: &str) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_item_error(&self, _url: &str, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_batch_start(3, 1);
        cb.on_item_start("u");
        cb.on_item_complete("u", "ocr");
        cb.on_item_error("v", "HTTP 404");
        cb.on_batch_complete(&BatchStats::default());
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = Tracking::default();
        tracker.on_item_start("a");
        tracker.on_item_complete("a", "direct_text");
        tracker.on_item_start("b");
        tracker.on_item_error("b", "timeout");
        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_batch_start(10, 0);
        cb.on_item_complete("u", "stub");
    }
}
