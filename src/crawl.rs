//! Listing-page crawler that collects PDF links.

use crate::config::DownloadConfig;
use crate::download::http_client;
use crate::error::HarvestError;
use crate::metrics::MetricsSink;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

static RE_HREF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<a\s[^>]*?href\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});

/// Absolute URLs of every anchor in `html` whose href ends in `.pdf`.
///
/// Root-relative links resolve against the page origin, other relative
/// links against the page URL without its query. Order of first
/// appearance is kept and duplicates dropped.
pub fn extract_pdf_links(html: &str, page_url: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    RE_HREF
        .captures_iter(html)
        .filter_map(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str().trim().replace("&amp;", "&"))
        .filter(|href| href.to_lowercase().ends_with(".pdf"))
        .filter_map(|href| resolve(&href, page_url))
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

fn resolve(href: &str, page_url: &str) -> Option<String> {
    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }
    let page = reqwest::Url::parse(page_url).ok()?;
    if let Some(rest) = href.strip_prefix("//") {
        return Some(format!("{}://{}", page.scheme(), rest));
    }
    if href.starts_with('/') {
        return Some(format!("{}{}", page.origin().ascii_serialization(), href));
    }
    let base = page_url.split('?').next().unwrap_or(page_url).trim_end_matches('/');
    Some(format!("{}/{}", base, href))
}

pub struct Crawler {
    client: reqwest::Client,
    config: DownloadConfig,
    metrics: Option<Arc<dyn MetricsSink>>,
    pace: bool,
}

impl Crawler {
    pub fn new(config: DownloadConfig) -> Result<Self, HarvestError> {
        Ok(Self {
            client: http_client(&config)?,
            config,
            metrics: None,
            pace: true,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Skip the politeness delay between listing pages.
    pub fn without_pacing(mut self) -> Self {
        self.pace = false;
        self
    }

    /// PDF links on one page. Never fails; exhausted retries yield an empty list.
    pub async fn scrape_page(&self, url: &str) -> Vec<String> {
        match self.try_scrape_page(url).await {
            Ok(links) => links,
            Err(e) => {
                error!(url, category = %e.category(), "{}", e);
                if let Some(m) = &self.metrics {
                    m.record_error(e.category(), url, &e.to_string());
                }
                Vec::new()
            }
        }
    }

    /// PDF links on one page, with `crawl_attempts` tries and
    /// `backoff_base * 2^attempt` between them.
    pub async fn try_scrape_page(&self, url: &str) -> Result<Vec<String>, HarvestError> {
        let attempts = self.config.crawl_attempts.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            match self.fetch(url).await {
                Ok(html) => {
                    let links = extract_pdf_links(&html, url);
                    debug!("{}: {} pdf links", url, links.len());
                    return Ok(links);
                }
                Err(e) => {
                    if attempt < attempts {
                        let delay = self.config.backoff_base * 2u32.saturating_pow(attempt);
                        warn!(url, "scrape attempt {}/{} failed: {}; retrying in {:?}", attempt, attempts, e, delay);
                        tokio::time::sleep(delay).await;
                    }
                    last = Some(e);
                }
            }
        }
        Err(HarvestError::DownloadFailed {
            url: url.to_string(),
            reason: format!(
                "failed to scrape page after {} attempts: {}",
                attempts,
                last.map(|e| e.to_string()).unwrap_or_default()
            ),
            permanent: false,
        })
    }

    /// Links from `{base}?page=N` for `N` in `start..=end`, de-duplicated.
    pub async fn scrape_range(&self, base: &str, start: u32, end: u32) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut all = Vec::new();
        let mut processed = 0u32;
        for page in start..=end {
            let url = format!("{}?page={}", base, page);
            info!("scraping page {} of {}: {}", page, end, url);
            let links = self.scrape_page(&url).await;
            info!("found {} PDF files on page {}", links.len(), page);
            processed += 1;
            all.extend(links.into_iter().filter(|l| seen.insert(l.clone())));

            if self.pace && page < end {
                tokio::time::sleep(page_delay(processed)).await;
            }
        }
        info!("total PDF files found: {}", all.len());
        all
    }

    async fn fetch(&self, url: &str) -> Result<String, HarvestError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| HarvestError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
                permanent: false,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(HarvestError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response.text().await.map_err(|e| HarvestError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
            permanent: false,
        })
    }
}

/// Delay after the `processed`-th page: grows from 0.5 s to a 2 s cap.
fn page_delay(processed: u32) -> Duration {
    Duration::from_secs_f64((0.5 + processed as f64 / 20.0).min(2.0))
}
