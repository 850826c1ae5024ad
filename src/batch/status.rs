//! Per-URL status tracking and run counters.

use crate::error::HarvestError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ItemStatus {
    /// Legal moves: Pending → InProgress → Completed | Failed.
    pub fn can_become(self, next: ItemStatus) -> bool {
        matches!(
            (self, next),
            (ItemStatus::Pending, ItemStatus::InProgress)
                | (ItemStatus::InProgress, ItemStatus::Completed)
                | (ItemStatus::InProgress, ItemStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }
}

/// Run counters persisted in checkpoints and the final report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Already completed in a resumed checkpoint.
    pub skipped: usize,
    /// Completed, but only the fallback stub could be produced.
    pub stubs: usize,
    pub bytes_downloaded: u64,
    /// Completed items per conversion method label.
    #[serde(default)]
    pub methods: BTreeMap<String, usize>,
}

impl BatchStats {
    pub fn finished(&self) -> usize {
        self.completed + self.failed
    }

    /// Completed share of attempted items, 0..=100.
    pub fn success_rate(&self) -> f64 {
        let attempted = self.finished();
        if attempted == 0 {
            0.0
        } else {
            self.completed as f64 * 100.0 / attempted as f64
        }
    }
}

/// Status map guarded by a single mutex.
#[derive(Debug, Default)]
pub struct StatusBoard {
    inner: Mutex<BTreeMap<String, ItemStatus>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Board seeded from a checkpoint.
    ///
    /// Items that were in flight or failed when the checkpoint was taken
    /// are reset to `Pending` so they run again.
    pub fn restore(saved: &BTreeMap<String, ItemStatus>) -> Self {
        let map = saved
            .iter()
            .map(|(url, status)| {
                let status = match status {
                    ItemStatus::Completed => ItemStatus::Completed,
                    _ => ItemStatus::Pending,
                };
                (url.clone(), status)
            })
            .collect();
        Self {
            inner: Mutex::new(map),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, ItemStatus>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register `url` as pending unless it is already known.
    pub fn register(&self, url: &str) {
        self.lock()
            .entry(url.to_string())
            .or_insert(ItemStatus::Pending);
    }

    pub fn get(&self, url: &str) -> Option<ItemStatus> {
        self.lock().get(url).copied()
    }

    /// Move `url` to `next`, rejecting illegal transitions.
    pub fn transition(&self, url: &str, next: ItemStatus) -> Result<(), HarvestError> {
        let mut map = self.lock();
        let current = map.get(url).copied().ok_or_else(|| {
            HarvestError::Internal(format!("unknown batch item '{}'", url))
        })?;
        if !current.can_become(next) {
            return Err(HarvestError::Internal(format!(
                "illegal status change for '{}': {:?} -> {:?}",
                url, current, next
            )));
        }
        map.insert(url.to_string(), next);
        Ok(())
    }

    pub fn snapshot(&self) -> BTreeMap<String, ItemStatus> {
        self.lock().clone()
    }

    pub fn count(&self, status: ItemStatus) -> usize {
        self.lock().values().filter(|s| **s == status).count()
    }
}
