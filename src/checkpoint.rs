//! Versioned JSON checkpoints for resumable batch runs.
//!
//! Layout inside the checkpoint directory:
//!
//! ```text
//! <name>.checkpoint.json                 latest snapshot
//! <name>_<YYYYmmdd_HHMMSS>.history.json  one copy per save, pruned by age and count
//! ```
//!
//! A checkpoint records the parameters of the run that wrote it. Loading one
//! written by a different schema version, or by a run with different
//! parameters, is an error rather than a silent fresh start.

use crate::batch::{BatchStats, ItemStatus, ResourceSample};
use crate::error::HarvestError;
use crate::storage::write_atomic_blocking;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

pub const SCHEMA_VERSION: u32 = 1;

const CURRENT_SUFFIX: &str = ".checkpoint.json";
const HISTORY_SUFFIX: &str = ".history.json";
/// Length of `_YYYYmmdd_HHMMSS`.
const STAMP_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointTrigger {
    Count,
    Time,
    Final,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub schema_version: u32,
    pub name: String,
    pub created_at: String,
    pub url_status: BTreeMap<String, ItemStatus>,
    pub stats: BatchStats,
    pub params: Value,
    pub param_hash: String,
    pub trigger: CheckpointTrigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSample>,
}

impl Checkpoint {
    pub fn new(
        name: impl Into<String>,
        url_status: BTreeMap<String, ItemStatus>,
        stats: BatchStats,
        params: Value,
        trigger: CheckpointTrigger,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            name: name.into(),
            created_at: chrono::Local::now().to_rfc3339(),
            url_status,
            stats,
            param_hash: param_hash(&params),
            params,
            trigger,
            resources: None,
        }
    }

    pub fn with_resources(mut self, sample: Option<ResourceSample>) -> Self {
        self.resources = sample;
        self
    }
}

/// First 8 hex digits of the SHA-256 of the params' JSON text.
pub fn param_hash(params: &Value) -> String {
    let digest = Sha256::digest(params.to_string().as_bytes());
    hex::encode(digest)[..8].to_string()
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    max_history: usize,
    max_age: Duration,
}

impl CheckpointStore {
    /// Store in `dir` keeping 10 history files per name for up to 7 days.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_history: 10,
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }

    pub fn with_retention(mut self, max_history: usize, max_age: Duration) -> Self {
        self.max_history = max_history;
        self.max_age = max_age;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}{}", name, CURRENT_SUFFIX))
    }

    /// Write `cp` as the current snapshot for `name` plus a history copy.
    /// Failures are logged and reported as `None`.
    pub fn save(&self, name: &str, cp: &Checkpoint) -> Option<PathBuf> {
        match self.try_save(name, cp) {
            Ok(path) => Some(path),
            Err(e) => {
                error!(checkpoint = name, category = %e.category(), "{}", e);
                None
            }
        }
    }

    fn try_save(&self, name: &str, cp: &Checkpoint) -> Result<PathBuf, HarvestError> {
        let json = serde_json::to_vec_pretty(cp).map_err(|e| HarvestError::CheckpointFailed {
            name: name.to_string(),
            detail: e.to_string(),
        })?;
        let path = self.path_for(name);
        write_atomic_blocking(&path, &json)?;

        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let history = self.dir.join(format!("{}_{}{}", name, stamp, HISTORY_SUFFIX));
        if let Err(e) = write_atomic_blocking(&history, &json) {
            warn!("history copy failed: {}", e);
        }
        debug!(
            "checkpoint {} saved ({} urls, trigger {:?})",
            name,
            cp.url_status.len(),
            cp.trigger
        );

        if let Err(e) = self.prune(self.max_history, self.max_age) {
            warn!("checkpoint pruning failed: {}", e);
        }
        Ok(path)
    }

    /// Load the current snapshot for `name`, checking only the schema version.
    pub fn load(&self, name: &str) -> Result<Option<Checkpoint>, HarvestError> {
        let path = self.path_for(name);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(HarvestError::StorageFailed { path, source: e }),
        };
        let failed = |detail: String| HarvestError::CheckpointFailed {
            name: name.to_string(),
            detail,
        };
        let value: Value = serde_json::from_slice(&raw).map_err(|e| failed(e.to_string()))?;
        let found = value
            .get("schemaVersion")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        if found != SCHEMA_VERSION {
            return Err(HarvestError::SchemaMismatch {
                name: name.to_string(),
                found,
                expected: SCHEMA_VERSION,
            });
        }
        let cp: Checkpoint = serde_json::from_value(value).map_err(|e| failed(e.to_string()))?;
        info!("loaded checkpoint {} ({} urls)", name, cp.url_status.len());
        Ok(Some(cp))
    }

    /// Load `name` and require that it was written with the same `params`.
    pub fn load_for(&self, name: &str, params: &Value) -> Result<Option<Checkpoint>, HarvestError> {
        let Some(cp) = self.load(name)? else {
            return Ok(None);
        };
        let expected = param_hash(params);
        if cp.param_hash != expected {
            return Err(HarvestError::ParamMismatch {
                name: name.to_string(),
                found: cp.param_hash,
                expected,
            });
        }
        Ok(Some(cp))
    }

    /// Names with a current snapshot, sorted.
    pub fn list(&self) -> Result<Vec<String>, HarvestError> {
        let mut names: Vec<String> = self
            .entries()?
            .into_iter()
            .filter_map(|(file, _)| file.strip_suffix(CURRENT_SUFFIX).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Remove the snapshot and history for `name`. Returns whether anything
    /// was deleted.
    pub fn delete(&self, name: &str) -> Result<bool, HarvestError> {
        let mut removed = false;
        for (file, path) in self.entries()? {
            let is_current = file == format!("{}{}", name, CURRENT_SUFFIX);
            let is_history = history_name(&file) == Some(name);
            if is_current || is_history {
                std::fs::remove_file(&path)
                    .map_err(|e| HarvestError::StorageFailed { path, source: e })?;
                removed = true;
            }
        }
        Ok(removed)
    }

    /// Delete history files older than `max_age`, then keep at most
    /// `max_history` per name. Returns the number removed.
    pub fn prune(&self, max_history: usize, max_age: Duration) -> Result<usize, HarvestError> {
        let now = SystemTime::now();
        let mut by_name: BTreeMap<String, Vec<(String, PathBuf)>> = BTreeMap::new();
        let mut removed = 0;

        for (file, path) in self.entries()? {
            let Some(name) = history_name(&file) else {
                continue;
            };
            let age = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| now.duration_since(t).ok())
                .unwrap_or_default();
            if age > max_age {
                if std::fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
                continue;
            }
            by_name
                .entry(name.to_string())
                .or_default()
                .push((file.clone(), path));
        }

        for files in by_name.values_mut() {
            // Stamps sort chronologically; newest last.
            files.sort();
            let excess = files.len().saturating_sub(max_history);
            for (_, path) in files.drain(..excess) {
                if std::fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!("pruned {} checkpoint history files", removed);
        }
        Ok(removed)
    }

    fn entries(&self) -> Result<Vec<(String, PathBuf)>, HarvestError> {
        let rd = match std::fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(HarvestError::StorageFailed {
                    path: self.dir.clone(),
                    source: e,
                })
            }
        };
        Ok(rd
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_str()?.to_string();
                Some((name, e.path()))
            })
            .collect())
    }
}

/// Checkpoint name of a history file, if `file` is one.
fn history_name(file: &str) -> Option<&str> {
    let stem = file.strip_suffix(HISTORY_SUFFIX)?;
    if stem.len() <= STAMP_LEN || !stem.is_char_boundary(stem.len() - STAMP_LEN) {
        return None;
    }
    let (name, stamp) = stem.split_at(stem.len() - STAMP_LEN);
    let digits = stamp.strip_prefix('_')?;
    let ok = digits.len() == 15
        && digits
            .chars()
            .enumerate()
            .all(|(i, c)| if i == 8 { c == '_' } else { c.is_ascii_digit() });
    ok.then_some(name)
}
