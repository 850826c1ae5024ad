//! Configuration types for the acquisition and conversion pipeline.
//!
//! Three structs cover the three moving parts:
//!
//! * [`ConversionConfig`] controls how a single PDF is turned into Markdown
//!   (pdfium location, tesseract invocation, LLM provider, acceptance
//!   threshold).
//! * [`DownloadConfig`] controls HTTP behaviour for the crawler and the
//!   downloader.
//! * [`BatchConfig`] controls the worklist orchestrator (worker limits, rate
//!   limiting, checkpoint cadence, circuit breaker, output layout).
//!
//! Each is built through a builder whose setters clamp obviously invalid
//! values and whose `build()` rejects inconsistent combinations.

use crate::error::HarvestError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// ── Conversion ───────────────────────────────────────────────────────────

/// Configuration for converting one PDF to Markdown.
///
/// # Example
/// ```rust
/// use docharvest::ConversionConfig;
///
/// let config = ConversionConfig::builder()
///     .tesseract_lang("eng+fra")
///     .accept_threshold(200)
///     .build()
///     .unwrap();
/// assert_eq!(config.accept_threshold, 200);
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// Directory or file of the pdfium shared library. Falls back to the
    /// `PDFIUM_LIB_PATH` environment variable, then to the system library.
    pub pdfium_lib_path: Option<PathBuf>,

    /// tesseract executable. Default: `tesseract` (resolved through `PATH`).
    pub tesseract_path: PathBuf,

    /// tesseract language pack(s), e.g. `eng` or `eng+deu`. Default: `eng`.
    pub tesseract_lang: String,

    /// Number of pages the format detector samples. Default: 5.
    pub sample_pages: usize,

    /// Minimum trimmed length (chars) for a backend result to be accepted. Default: 100.
    pub accept_threshold: usize,

    /// Append the provenance footer (method, OCR, quality, timing). Default: true.
    pub include_footer: bool,

    /// Longest edge of pages rendered for the LLM backend, in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// LLM model identifier, e.g. "gpt-4.1-nano". If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature for page transcription. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the LLM may generate per page. Default: 4096.
    pub max_tokens: usize,

    /// Retry attempts per page on LLM failure. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Custom system prompt. If None, uses [`crate::prompts::ARCHIVE_PAGE_PROMPT`].
    pub system_prompt: Option<String>,

    /// Concurrent LLM page calls within one document. Default: 4.
    pub llm_concurrency: usize,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            pdfium_lib_path: None,
            tesseract_path: PathBuf::from("tesseract"),
            tesseract_lang: "eng".to_string(),
            sample_pages: 5,
            accept_threshold: 100,
            include_footer: true,
            max_rendered_pixels: 2000,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 4096,
            max_retries: 3,
            retry_backoff_ms: 500,
            system_prompt: None,
            llm_concurrency: 4,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("pdfium_lib_path", &self.pdfium_lib_path)
            .field("tesseract_path", &self.tesseract_path)
            .field("tesseract_lang", &self.tesseract_lang)
            .field("sample_pages", &self.sample_pages)
            .field("accept_threshold", &self.accept_threshold)
            .field("include_footer", &self.include_footer)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("llm_concurrency", &self.llm_concurrency)
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    /// The pdfium library location after applying the environment fallback.
    pub fn resolved_pdfium_path(&self) -> Option<PathBuf> {
        self.pdfium_lib_path.clone().or_else(|| {
            std::env::var_os("PDFIUM_LIB_PATH")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        })
    }
}

/// Builder for [`ConversionConfig`].
#[derive(Debug)]
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn pdfium_lib_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_lib_path = Some(path.into());
        self
    }

    pub fn tesseract_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tesseract_path = path.into();
        self
    }

    pub fn tesseract_lang(mut self, lang: impl Into<String>) -> Self {
        self.config.tesseract_lang = lang.into();
        self
    }

    pub fn sample_pages(mut self, n: usize) -> Self {
        self.config.sample_pages = n.max(1);
        self
    }

    pub fn accept_threshold(mut self, chars: usize) -> Self {
        self.config.accept_threshold = chars;
        self
    }

    pub fn include_footer(mut self, v: bool) -> Self {
        self.config.include_footer = v;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn llm_concurrency(mut self, n: usize) -> Self {
        self.config.llm_concurrency = n.max(1);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, HarvestError> {
        let c = &self.config;
        if c.tesseract_lang.trim().is_empty() {
            return Err(HarvestError::InvalidConfig(
                "tesseract language must not be empty".into(),
            ));
        }
        if c.max_tokens == 0 {
            return Err(HarvestError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        Ok(self.config)
    }
}

/// OCR rendering quality. Each level maps to a fixed rasterisation DPI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrQuality {
    /// 150 DPI. Fast, adequate for clean typewritten pages.
    Low,
    /// 200 DPI.
    Medium,
    /// 300 DPI. Default; carbon copies and faded type need the resolution.
    #[default]
    High,
}

impl OcrQuality {
    pub fn dpi(self) -> u32 {
        match self {
            OcrQuality::Low => 150,
            OcrQuality::Medium => 200,
            OcrQuality::High => 300,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OcrQuality::Low => "low",
            OcrQuality::Medium => "medium",
            OcrQuality::High => "high",
        }
    }
}

impl fmt::Display for OcrQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OcrQuality {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(OcrQuality::Low),
            "medium" => Ok(OcrQuality::Medium),
            "high" => Ok(OcrQuality::High),
            other => Err(HarvestError::InvalidConfig(format!(
                "OCR quality must be low, medium or high, got '{other}'"
            ))),
        }
    }
}

// ── Download ─────────────────────────────────────────────────────────────

/// HTTP settings shared by the crawler and the downloader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// User-Agent header sent with every request.
    pub user_agent: String,
    /// TCP connect timeout. Default: 10 s.
    pub connect_timeout: Duration,
    /// Whole-request read timeout. Default: 60 s.
    pub read_timeout: Duration,
    /// Retries after the first attempt on transient failures. Default: 3.
    pub max_retries: u32,
    /// First backoff delay; doubles per retry. Default: 1 s.
    pub backoff_base: Duration,
    /// File downloads into per-collection sub-directories. Default: true.
    pub organize: bool,
    /// Attempts per listing page in the crawler. Default: 5.
    pub crawl_attempts: u32,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("docharvest/{} (Research Project)", env!("CARGO_PKG_VERSION")),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            organize: true,
            crawl_attempts: 5,
        }
    }
}

impl DownloadConfig {
    /// Backoff before retry number `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

// ── Batch ────────────────────────────────────────────────────────────────

/// Where the pipeline writes its artefacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputLayout {
    pub pdf_dir: PathBuf,
    pub markdown_dir: PathBuf,
    pub json_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub report_dir: PathBuf,
}

impl OutputLayout {
    /// Conventional layout under a single data root:
    /// `pdfs/`, `markdown/`, `json/`, `checkpoints/`, `reports/`.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            pdf_dir: root.join("pdfs"),
            markdown_dir: root.join("markdown"),
            json_dir: root.join("json"),
            checkpoint_dir: root.join("checkpoints"),
            report_dir: root.join("reports"),
        }
    }
}

impl Default for OutputLayout {
    fn default() -> Self {
        Self::under("data")
    }
}

/// Configuration for the batch orchestrator.
#[derive(Clone)]
pub struct BatchConfig {
    /// Lower bound for the adaptive worker limit. Default: 2.
    pub min_workers: usize,
    /// Worker limit at start-up. Default: 5.
    pub initial_workers: usize,
    /// Upper bound for the adaptive worker limit. Default: 10.
    pub max_workers: usize,

    /// Delay before each dispatch at start-up. Default: 0.5 s.
    pub base_rate_limit: Duration,
    /// Floor for the rate delay when accelerating. Default: 0.2 s.
    pub min_rate_limit: Duration,
    /// Ceiling for the rate delay when throttling. Default: 2.0 s.
    pub max_rate_limit: Duration,
    /// Multiplier applied to the rate delay on each adjustment. Default: 1.5.
    pub rate_factor: f64,

    /// CPU percentage above which the pool throttles. Default: 80.
    pub cpu_high: f32,
    /// CPU percentage below which the pool accelerates. Default: 40.
    pub cpu_low: f32,
    /// Memory percentage above which the pool throttles. Default: 75.
    pub mem_high: f32,
    /// Memory percentage that must not be exceeded to accelerate. Default: 50.
    pub mem_low: f32,
    /// Consecutive samples needed before an adjustment. Default: 3.
    pub adjust_after: u32,
    /// Resource sampling period. Default: 10 s.
    pub monitor_interval: Duration,

    /// Checkpoint after this many finished items. Default: 10.
    pub checkpoint_every: usize,
    /// Checkpoint after this much time regardless of progress. Default: 300 s.
    pub checkpoint_interval: Duration,
    /// Base name of the checkpoint file. Default: "batch".
    pub checkpoint_name: String,
    /// Resume from a matching checkpoint when one exists. Default: true.
    pub resume: bool,

    /// Consecutive failures that trip the circuit breaker. Default: 5.
    pub max_consecutive_errors: u32,
    /// How long dispatch stays paused once tripped. Default: 60 s.
    pub pause_duration: Duration,

    /// Output directories.
    pub layout: OutputLayout,

    /// Optional per-item progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            initial_workers: 5,
            max_workers: 10,
            base_rate_limit: Duration::from_millis(500),
            min_rate_limit: Duration::from_millis(200),
            max_rate_limit: Duration::from_secs(2),
            rate_factor: 1.5,
            cpu_high: 80.0,
            cpu_low: 40.0,
            mem_high: 75.0,
            mem_low: 50.0,
            adjust_after: 3,
            monitor_interval: Duration::from_secs(10),
            checkpoint_every: 10,
            checkpoint_interval: Duration::from_secs(300),
            checkpoint_name: "batch".to_string(),
            resume: true,
            max_consecutive_errors: 5,
            pause_duration: Duration::from_secs(60),
            layout: OutputLayout::default(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for BatchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchConfig")
            .field("min_workers", &self.min_workers)
            .field("initial_workers", &self.initial_workers)
            .field("max_workers", &self.max_workers)
            .field("base_rate_limit", &self.base_rate_limit)
            .field("monitor_interval", &self.monitor_interval)
            .field("checkpoint_every", &self.checkpoint_every)
            .field("checkpoint_interval", &self.checkpoint_interval)
            .field("checkpoint_name", &self.checkpoint_name)
            .field("resume", &self.resume)
            .field("max_consecutive_errors", &self.max_consecutive_errors)
            .field("pause_duration", &self.pause_duration)
            .field("layout", &self.layout)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn BatchProgressCallback>"),
            )
            .finish()
    }
}

impl BatchConfig {
    /// Create a new builder for `BatchConfig`.
    pub fn builder() -> BatchConfigBuilder {
        BatchConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`BatchConfig`].
#[derive(Debug)]
pub struct BatchConfigBuilder {
    config: BatchConfig,
}

impl BatchConfigBuilder {
    /// Set the worker bounds; `initial` is clamped into `[min, max]`.
    pub fn workers(mut self, min: usize, initial: usize, max: usize) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        self.config.min_workers = min;
        self.config.max_workers = max;
        self.config.initial_workers = initial.clamp(min, max);
        self
    }

    /// Fix the pool at `n` workers (min = initial = max).
    pub fn fixed_workers(self, n: usize) -> Self {
        self.workers(n, n, n)
    }

    pub fn rate_limits(mut self, min: Duration, base: Duration, max: Duration) -> Self {
        self.config.min_rate_limit = min;
        self.config.base_rate_limit = base;
        self.config.max_rate_limit = max;
        self
    }

    pub fn cpu_thresholds(mut self, low: f32, high: f32) -> Self {
        self.config.cpu_low = low.clamp(0.0, 100.0);
        self.config.cpu_high = high.clamp(0.0, 100.0);
        self
    }

    pub fn memory_thresholds(mut self, low: f32, high: f32) -> Self {
        self.config.mem_low = low.clamp(0.0, 100.0);
        self.config.mem_high = high.clamp(0.0, 100.0);
        self
    }

    pub fn monitor_interval(mut self, d: Duration) -> Self {
        self.config.monitor_interval = d;
        self
    }

    pub fn checkpoint_every(mut self, n: usize) -> Self {
        self.config.checkpoint_every = n.max(1);
        self
    }

    pub fn checkpoint_interval(mut self, d: Duration) -> Self {
        self.config.checkpoint_interval = d;
        self
    }

    pub fn checkpoint_name(mut self, name: impl Into<String>) -> Self {
        self.config.checkpoint_name = name.into();
        self
    }

    pub fn resume(mut self, v: bool) -> Self {
        self.config.resume = v;
        self
    }

    pub fn circuit_breaker(mut self, max_consecutive_errors: u32, pause: Duration) -> Self {
        self.config.max_consecutive_errors = max_consecutive_errors.max(1);
        self.config.pause_duration = pause;
        self
    }

    pub fn layout(mut self, layout: OutputLayout) -> Self {
        self.config.layout = layout;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<BatchConfig, HarvestError> {
        let c = &self.config;
        if c.min_workers == 0 || c.min_workers > c.max_workers {
            return Err(HarvestError::InvalidConfig(format!(
                "worker bounds must satisfy 1 ≤ min ≤ max, got {}..{}",
                c.min_workers, c.max_workers
            )));
        }
        if c.min_rate_limit > c.base_rate_limit || c.base_rate_limit > c.max_rate_limit {
            return Err(HarvestError::InvalidConfig(
                "rate limits must satisfy min ≤ base ≤ max".into(),
            ));
        }
        if c.cpu_low >= c.cpu_high || c.mem_low >= c.mem_high {
            return Err(HarvestError::InvalidConfig(
                "low resource thresholds must be below high thresholds".into(),
            ));
        }
        if c.checkpoint_name.trim().is_empty() {
            return Err(HarvestError::InvalidConfig(
                "checkpoint name must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}
