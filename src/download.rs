//! PDF download with retry, size verification and collection layout.
//!
//! Bodies are streamed into `<name>.part` and renamed on success, so a
//! crashed or interrupted run never leaves a truncated file under the final
//! name. Transient failures (network errors, 408/429/5xx, short bodies) are
//! retried with exponential backoff; other 4xx responses are not.
//!
//! Two URLs can share a file name. Work on one destination is serialised,
//! so the second caller waits and then reuses what the first wrote.

use crate::config::DownloadConfig;
use crate::error::HarvestError;
use crate::metrics::MetricsSink;
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::ACCEPT;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

static RE_COLLECTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)-").unwrap());

/// A file present on disk after [`Downloader::try_download`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloaded {
    pub path: PathBuf,
    pub bytes: u64,
    /// The file already existed and was not fetched again.
    pub reused: bool,
}

/// File name for `url`: last path segment, restricted to alphanumerics and
/// `._- `, with `.pdf` appended when missing.
pub fn safe_filename(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let last = without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let mut name = last.to_string();
    if !name.to_lowercase().ends_with(".pdf") {
        name.push_str(".pdf");
    }
    let safe: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-' | ' '))
        .collect();
    let safe = safe.trim();
    if safe.is_empty() || safe.eq_ignore_ascii_case(".pdf") {
        "download.pdf".to_string()
    } else {
        safe.to_string()
    }
}

/// Sub-directory a file belongs in, from its record-number prefix or name.
pub fn collection_dir(filename: &str) -> String {
    if let Some(c) = RE_COLLECTION.captures(filename) {
        return match &c[1] {
            "104" => "nara-104".to_string(),
            "124" => "nara-124".to_string(),
            "179" => "nara-179".to_string(),
            "157" => "hsca".to_string(),
            other => format!("collection-{}", other),
        };
    }
    let lower = filename.to_lowercase();
    if lower.contains("docid") {
        "misc-docid".to_string()
    } else if ["cia", "fbi", "secret"].iter().any(|k| lower.contains(k)) {
        "agency-docs".to_string()
    } else {
        "uncategorized".to_string()
    }
}

type DestinationLocks = Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>;

pub struct Downloader {
    client: reqwest::Client,
    config: DownloadConfig,
    metrics: Option<Arc<dyn MetricsSink>>,
    busy: DestinationLocks,
}

impl Downloader {
    pub fn new(config: DownloadConfig) -> Result<Self, HarvestError> {
        let client = http_client(&config)?;
        Ok(Self {
            client,
            config,
            metrics: None,
            busy: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Where `url` will be stored under `dest_dir`.
    pub fn target_path(&self, url: &str, dest_dir: &Path) -> PathBuf {
        let name = safe_filename(url);
        if self.config.organize {
            dest_dir.join(collection_dir(&name)).join(name)
        } else {
            dest_dir.join(name)
        }
    }

    /// Download `url` into `dest_dir`. Failures are logged, recorded and
    /// reported as `None`.
    pub async fn download(&self, url: &str, dest_dir: &Path) -> Option<PathBuf> {
        match self.try_download(url, dest_dir).await {
            Ok(d) => Some(d.path),
            Err(e) => {
                error!(url, category = %e.category(), "{}", e);
                if let Some(m) = &self.metrics {
                    m.record_error(e.category(), url, &e.to_string());
                }
                None
            }
        }
    }

    /// Download `url` into `dest_dir`, retrying transient failures.
    pub async fn try_download(&self, url: &str, dest_dir: &Path) -> Result<Downloaded, HarvestError> {
        let dest = self.target_path(url, dest_dir);
        let slot = self.destination_lock(&dest);
        let result = {
            let _held = slot.lock().await;
            self.download_locked(url, dest.clone()).await
        };
        self.release_destination(&dest, slot);
        result
    }

    fn destination_lock(&self, dest: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut busy = self.busy.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(busy.entry(dest.to_path_buf()).or_default())
    }

    fn release_destination(&self, dest: &Path, slot: Arc<tokio::sync::Mutex<()>>) {
        let mut busy = self.busy.lock().unwrap_or_else(|p| p.into_inner());
        drop(slot);
        // Only the map's own handle left: nobody is waiting on this file.
        if busy.get(dest).is_some_and(|s| Arc::strong_count(s) == 1) {
            busy.remove(dest);
        }
    }

    async fn download_locked(&self, url: &str, dest: PathBuf) -> Result<Downloaded, HarvestError> {
        match tokio::fs::metadata(&dest).await {
            Ok(meta) if meta.len() > 0 => {
                debug!("already downloaded: {} ({} bytes)", dest.display(), meta.len());
                return Ok(Downloaded {
                    path: dest,
                    bytes: meta.len(),
                    reused: true,
                });
            }
            Ok(_) => {
                warn!("removing empty leftover {}", dest.display());
                tokio::fs::remove_file(&dest)
                    .await
                    .map_err(|e| storage(&dest, e))?;
            }
            Err(_) => {}
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage(parent, e))?;
        }

        let start = Instant::now();
        let mut attempt = 0;
        loop {
            match self.fetch_once(url, &dest).await {
                Ok(bytes) => {
                    let elapsed = start.elapsed();
                    info!(
                        "downloaded {} ({} bytes) in {:.2}s",
                        dest.display(),
                        bytes,
                        elapsed.as_secs_f64()
                    );
                    if let Some(m) = &self.metrics {
                        m.record_download(bytes, elapsed);
                    }
                    return Ok(Downloaded {
                        path: dest,
                        bytes,
                        reused: false,
                    });
                }
                Err(e) if e.is_permanent() => {
                    warn!(url, "permanent failure, not retrying: {}", e);
                    return Err(e);
                }
                Err(e) if attempt >= self.config.max_retries => {
                    return Err(HarvestError::DownloadFailed {
                        url: url.to_string(),
                        reason: format!("gave up after {} attempts: {}", attempt + 1, e),
                        permanent: false,
                    });
                }
                Err(e) => {
                    attempt += 1;
                    let delay = self.config.backoff_for(attempt);
                    warn!(
                        url,
                        "attempt {} failed ({}), retrying in {:?}",
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn fetch_once(&self, url: &str, dest: &Path) -> Result<u64, HarvestError> {
        let mut part_name = dest.as_os_str().to_owned();
        part_name.push(".part");
        let part = PathBuf::from(part_name);

        let result = self.stream_to(url, &part).await;
        match result {
            Ok(bytes) => {
                tokio::fs::rename(&part, dest)
                    .await
                    .map_err(|e| storage(dest, e))?;
                Ok(bytes)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(e)
            }
        }
    }

    async fn stream_to(&self, url: &str, part: &Path) -> Result<u64, HarvestError> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/pdf")
            .send()
            .await
            .map_err(|e| network(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HarvestError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let expected = response.content_length();

        let mut file = tokio::fs::File::create(part)
            .await
            .map_err(|e| storage(part, e))?;
        let mut body = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| network(url, e))?;
            file.write_all(&chunk).await.map_err(|e| storage(part, e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| storage(part, e))?;

        match expected {
            Some(expected) if expected > 0 && expected != written => Err(HarvestError::SizeMismatch {
                url: url.to_string(),
                expected,
                actual: written,
            }),
            _ => Ok(written),
        }
    }
}

/// Shared HTTP client construction for the downloader and crawler.
pub(crate) fn http_client(config: &DownloadConfig) -> Result<reqwest::Client, HarvestError> {
    reqwest::Client::builder()
        .user_agent(&config.user_agent)
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.read_timeout)
        .build()
        .map_err(|e| HarvestError::InvalidConfig(format!("HTTP client: {}", e)))
}

fn network(url: &str, e: reqwest::Error) -> HarvestError {
    HarvestError::DownloadFailed {
        url: url.to_string(),
        reason: e.to_string(),
        permanent: false,
    }
}

fn storage(path: &Path, source: std::io::Error) -> HarvestError {
    HarvestError::StorageFailed {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_names() {
        assert_eq!(
            safe_filename("https://www.archives.gov/files/research/jfk/releases/104-10003-10041.pdf"),
            "104-10003-10041.pdf"
        );
        assert_eq!(safe_filename("https://x.org/files/docid-32204484"), "docid-32204484.pdf");
        assert_eq!(safe_filename("https://x.org/a/b%20c.PDF?dl=1"), "b20c.PDF");
        assert_eq!(safe_filename("https://x.org/"), "x.org.pdf");
    }

    #[test]
    fn collections() {
        assert_eq!(collection_dir("104-10003-10041.pdf"), "nara-104");
        assert_eq!(collection_dir("124-10001-10001.pdf"), "nara-124");
        assert_eq!(collection_dir("179-1-1.pdf"), "nara-179");
        assert_eq!(collection_dir("157-10014-10001.pdf"), "hsca");
        assert_eq!(collection_dir("180-10001-10001.pdf"), "collection-180");
        assert_eq!(collection_dir("docid-32204484.pdf"), "misc-docid");
        assert_eq!(collection_dir("fbi_report.pdf"), "agency-docs");
        assert_eq!(collection_dir("notes.pdf"), "uncategorized");
    }

    #[test]
    fn target_path_respects_organize() {
        let flat = Downloader::new(DownloadConfig {
            organize: false,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            flat.target_path("https://x.org/104-1-1.pdf", Path::new("pdfs")),
            PathBuf::from("pdfs/104-1-1.pdf")
        );
        let organised = Downloader::new(DownloadConfig::default()).unwrap();
        assert_eq!(
            organised.target_path("https://x.org/104-1-1.pdf", Path::new("pdfs")),
            PathBuf::from("pdfs/nara-104/104-1-1.pdf")
        );
    }

    #[tokio::test]
    async fn existing_file_is_reused_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let dl = Downloader::new(DownloadConfig {
            organize: false,
            ..Default::default()
        })
        .unwrap();
        let target = dir.path().join("memo.pdf");
        std::fs::write(&target, b"%PDF-1.4 cached").unwrap();

        let got = dl
            .try_download("http://127.0.0.1:9/memo.pdf", dir.path())
            .await
            .unwrap();
        assert!(got.reused);
        assert_eq!(got.path, target);
        assert!(dl.busy.lock().unwrap().is_empty());
    }
}
