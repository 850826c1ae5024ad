//! CLI binary for docharvest.
//!
//! A thin shim over the library crate: each subcommand maps its flags onto
//! the library configuration, runs one pipeline stage (or all of them) and
//! reports on stderr.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use docharvest::batch::{ItemProcessor, PipelineProcessor};
use docharvest::pipeline::pdf;
use docharvest::{
    mapper, BatchConfig, BatchProgressCallback, BatchStats, ConversionConfig, ConvertOptions,
    Converter, Crawler, DownloadConfig, Downloader, InMemoryMetrics, KnowledgeBase, MetricsSink,
    OcrQuality, Orchestrator, OutputLayout,
};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEFAULT_BASE_URL: &str = "https://www.archives.gov/research/jfk/release-2025";

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

fn progress_bar(len: usize, prefix: &'static str, unit: &str) -> ProgressBar {
    let bar = ProgressBar::new(len as u64);
    let style = ProgressStyle::with_template(&format!(
        "{{spinner:.cyan}} {{prefix:.bold}}  [{{bar:42.green/238}}] {{pos:>4}}/{{len}} {unit}  \
         ⏱ {{elapsed_precise}}  ETA {{eta_precise}}"
    ))
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ")
    .tick_strings(TICKS);
    bar.set_style(style);
    bar.set_prefix(prefix);
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Renders batch progress as a bar plus one line per failed item.
struct CliProgressCallback {
    bar: ProgressBar,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bar: progress_bar(0, "Processing", "docs"),
            errors: AtomicUsize::new(0),
        })
    }
}

impl BatchProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total: usize, skipped: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(skipped as u64);
        self.bar.reset_eta();
        if skipped > 0 {
            self.bar
                .println(dim(&format!("  {skipped} documents already done, skipping")));
        }
    }

    fn on_item_start(&self, url: &str) {
        let name = url.rsplit('/').next().unwrap_or(url);
        self.bar.set_message(name.to_string());
    }

    fn on_item_complete(&self, _url: &str, _method: &str) {
        self.bar.inc(1);
    }

    fn on_item_error(&self, url: &str, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!("  {} {}  {}", red("✗"), url, red(&msg)));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, stats: &BatchStats) {
        self.bar.finish_and_clear();
        eprintln!(
            "{} {}/{} documents  ({} failed, {} stubs)",
            if stats.failed == 0 { green("✔") } else { red("⚠") },
            bold(&stats.completed.to_string()),
            stats.total,
            stats.failed,
            stats.stubs,
        );
    }
}

// ── Arguments ────────────────────────────────────────────────────────────────

const AFTER_HELP: &str = r#"EXAMPLES:
  # Collect PDF links from listing pages 1-113
  docharvest scrape -o data/urls.txt

  # Download them into collection folders
  docharvest download --urls data/urls.txt

  # Convert one file or a whole folder
  docharvest convert data/pdfs --ocr --ocr-quality medium

  # Markdown to JSON, then merge into a knowledge base
  docharvest to-json data/markdown
  docharvest aggregate --validate

  # Everything, resumable
  docharvest run --workers 8

ENVIRONMENT VARIABLES:
  PDFIUM_LIB_PATH         Path to libpdfium (directory or file)
  OPENAI_API_KEY          Enables the vision-LLM backend (also ANTHROPIC_API_KEY, GEMINI_API_KEY)
  EDGEQUAKE_LLM_PROVIDER  Override LLM provider
  DOCHARVEST_*            Fallback for most flags, e.g. DOCHARVEST_DATA_DIR
"#;

/// Crawl, download and convert archive PDFs.
#[derive(Parser, Debug)]
#[command(
    name = "docharvest",
    version,
    about = "Crawl, download and convert archive PDFs into Markdown, JSON and a knowledge base",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DOCHARVEST_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "DOCHARVEST_QUIET")]
    quiet: bool,

    /// Disable progress bars.
    #[arg(long, global = true, env = "DOCHARVEST_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Collect PDF links from paginated listing pages.
    Scrape {
        #[command(flatten)]
        listing: ListingArgs,

        /// Write one URL per line here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Download PDFs listed in a file (one URL per line).
    Download {
        /// URL list file.
        #[arg(long, env = "DOCHARVEST_URLS")]
        urls: PathBuf,

        #[command(flatten)]
        http: HttpArgs,

        /// Destination directory.
        #[arg(long, env = "DOCHARVEST_PDF_DIR", default_value = "data/pdfs")]
        dest: PathBuf,

        /// Parallel downloads.
        #[arg(short, long, env = "DOCHARVEST_WORKERS", default_value_t = 5)]
        workers: usize,
    },

    /// Convert a PDF, or every PDF under a directory, to Markdown.
    Convert {
        /// PDF file or directory.
        input: PathBuf,

        /// Output directory for Markdown files.
        #[arg(short, long, env = "DOCHARVEST_MARKDOWN_DIR", default_value = "data/markdown")]
        output: PathBuf,

        #[command(flatten)]
        conversion: ConversionArgs,
    },

    /// Map a Markdown file, or every Markdown file under a directory, to JSON.
    ToJson {
        /// Markdown file or directory.
        input: PathBuf,

        /// Output directory for JSON records.
        #[arg(short, long, env = "DOCHARVEST_JSON_DIR", default_value = "data/json")]
        output: PathBuf,
    },

    /// Merge JSON records into a knowledge-base file.
    Aggregate {
        /// Directory of JSON records.
        #[arg(long, env = "DOCHARVEST_JSON_DIR", default_value = "data/json")]
        json_dir: PathBuf,

        /// Knowledge-base file to write.
        #[arg(short, long, default_value = "data/knowledge_base.json")]
        output: PathBuf,

        /// Re-read the written file and check its structure.
        #[arg(long)]
        validate: bool,
    },

    /// Print the format report and metadata of a PDF.
    Inspect {
        path: PathBuf,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        conversion: ConversionArgs,
    },

    /// Run the whole pipeline with checkpoints.
    Run {
        #[command(flatten)]
        listing: ListingArgs,

        /// Use this URL list instead of crawling.
        #[arg(long, env = "DOCHARVEST_URLS")]
        urls: Option<PathBuf>,

        /// Root of pdfs/, markdown/, json/, checkpoints/ and reports/.
        #[arg(long, env = "DOCHARVEST_DATA_DIR", default_value = "data")]
        data_dir: PathBuf,

        /// Initial worker count; the pool adapts between 2 and 2×workers.
        #[arg(short, long, env = "DOCHARVEST_WORKERS", default_value_t = 5)]
        workers: usize,

        /// Continue from the last checkpoint (default).
        #[arg(long, overrides_with = "no_resume")]
        resume: bool,

        /// Start from scratch, ignoring any checkpoint.
        #[arg(long, overrides_with = "resume")]
        no_resume: bool,

        /// Checkpoint name.
        #[arg(long, env = "DOCHARVEST_CHECKPOINT", default_value = "batch")]
        checkpoint_name: String,

        #[command(flatten)]
        http: HttpArgs,

        #[command(flatten)]
        conversion: ConversionArgs,
    },
}

#[derive(Args, Debug)]
struct ListingArgs {
    /// Listing page URL; pages are fetched as `{base}?page=N`.
    #[arg(long, env = "DOCHARVEST_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// First listing page.
    #[arg(long, default_value_t = 1)]
    start_page: u32,

    /// Last listing page (inclusive).
    #[arg(long, default_value_t = 113)]
    end_page: u32,
}

#[derive(Args, Debug)]
struct HttpArgs {
    /// Retries per download on transient errors.
    #[arg(long, env = "DOCHARVEST_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Read timeout in seconds.
    #[arg(long, env = "DOCHARVEST_TIMEOUT", default_value_t = 60)]
    timeout: u64,

    /// Store downloads directly in the destination, without collection folders.
    #[arg(long)]
    flat: bool,
}

#[derive(Args, Debug)]
struct ConversionArgs {
    /// Prefer OCR over embedded text.
    #[arg(long, env = "DOCHARVEST_OCR")]
    ocr: bool,

    /// OCR rendering quality: low, medium, high.
    #[arg(long, env = "DOCHARVEST_OCR_QUALITY", default_value = "high")]
    ocr_quality: OcrQuality,

    /// Try the vision-LLM backend first.
    #[arg(long, env = "DOCHARVEST_LLM")]
    llm: bool,

    /// LLM provider: openai, anthropic, gemini, ollama, ...
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// LLM model ID.
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// tesseract executable.
    #[arg(long, env = "DOCHARVEST_TESSERACT", default_value = "tesseract")]
    tesseract: PathBuf,

    /// tesseract language pack(s).
    #[arg(long, env = "DOCHARVEST_OCR_LANG", default_value = "eng")]
    lang: String,

    /// Do not append the provenance footer.
    #[arg(long)]
    no_footer: bool,
}

impl ConversionArgs {
    fn config(&self) -> Result<ConversionConfig> {
        let mut builder = ConversionConfig::builder()
            .tesseract_path(&self.tesseract)
            .tesseract_lang(&self.lang)
            .include_footer(!self.no_footer);
        if let Some(ref p) = self.provider {
            builder = builder.provider_name(p);
        }
        if let Some(ref m) = self.model {
            builder = builder.model(m);
        }
        builder.build().context("Invalid conversion configuration")
    }

    fn options(&self) -> ConvertOptions {
        ConvertOptions {
            force_ocr: self.ocr,
            quality: self.ocr_quality,
            use_llm: self.llm,
            strategy_override: None,
        }
    }

    /// Parameters that must match for a checkpoint to be resumed.
    fn params(&self) -> serde_json::Value {
        serde_json::json!({
            "ocr": self.ocr,
            "ocrQuality": self.ocr_quality.as_str(),
            "llm": self.llm,
        })
    }
}

impl HttpArgs {
    fn config(&self) -> DownloadConfig {
        DownloadConfig {
            max_retries: self.max_retries,
            read_timeout: Duration::from_secs(self.timeout.max(1)),
            organize: !self.flat,
            ..DownloadConfig::default()
        }
    }
}

// ── Entry point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Progress bars replace INFO logs; --verbose always wins.
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let ui = Ui {
        quiet: cli.quiet,
        progress: show_progress,
    };
    match cli.command {
        Command::Scrape { listing, output } => scrape(&ui, &listing, output.as_deref()).await,
        Command::Download {
            urls,
            http,
            dest,
            workers,
        } => download(&ui, &urls, &http, &dest, workers).await,
        Command::Convert {
            input,
            output,
            conversion,
        } => convert(&ui, &input, &output, &conversion).await,
        Command::ToJson { input, output } => to_json(&ui, &input, &output).await,
        Command::Aggregate {
            json_dir,
            output,
            validate,
        } => aggregate(&ui, &json_dir, &output, validate).await,
        Command::Inspect {
            path,
            json,
            conversion,
        } => inspect(&path, json, &conversion).await,
        Command::Run {
            listing,
            urls,
            data_dir,
            workers,
            resume: _,
            no_resume,
            checkpoint_name,
            http,
            conversion,
        } => {
            let opts = RunOpts {
                listing,
                urls,
                data_dir,
                workers,
                resume: !no_resume,
                checkpoint_name,
                http,
                conversion,
            };
            run(&ui, opts).await
        }
    }
}

struct Ui {
    quiet: bool,
    progress: bool,
}

impl Ui {
    fn bar(&self, len: usize, prefix: &'static str, unit: &str) -> Option<ProgressBar> {
        self.progress.then(|| progress_bar(len, prefix, unit))
    }

    fn say(&self, msg: String) {
        if !self.quiet {
            eprintln!("{msg}");
        }
    }
}

// ── Subcommands ──────────────────────────────────────────────────────────────

async fn collect_urls(listing: &ListingArgs, http: DownloadConfig) -> Result<Vec<String>> {
    if listing.start_page > listing.end_page {
        bail!(
            "Invalid page range {}-{}: start must be <= end",
            listing.start_page,
            listing.end_page
        );
    }
    let crawler = Crawler::new(http).context("Failed to build HTTP client")?;
    Ok(crawler
        .scrape_range(&listing.base_url, listing.start_page, listing.end_page)
        .await)
}

async fn read_url_list(path: &Path) -> Result<Vec<String>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read URL list {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

async fn scrape(ui: &Ui, listing: &ListingArgs, output: Option<&Path>) -> Result<()> {
    let urls = collect_urls(listing, DownloadConfig::default()).await?;
    if urls.is_empty() {
        bail!("No PDF links found under {}", listing.base_url);
    }
    let mut text = urls.join("\n");
    text.push('\n');
    match output {
        Some(path) => {
            docharvest::storage::write_atomic(path, text.as_bytes())
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            ui.say(format!(
                "{} {} links  →  {}",
                green("✔"),
                urls.len(),
                bold(&path.display().to_string())
            ));
        }
        None => print!("{text}"),
    }
    Ok(())
}

async fn download(
    ui: &Ui,
    list: &Path,
    http: &HttpArgs,
    dest: &Path,
    workers: usize,
) -> Result<()> {
    let urls = read_url_list(list).await?;
    let downloader = Downloader::new(http.config()).context("Failed to build HTTP client")?;
    let bar = ui.bar(urls.len(), "Downloading", "files");

    let results: Vec<bool> = stream::iter(urls.iter())
        .map(|url| {
            let downloader = &downloader;
            let bar = bar.as_ref();
            async move {
                let ok = downloader.download(url, dest).await.is_some();
                if let Some(bar) = bar {
                    if !ok {
                        bar.println(format!("  {} {}", red("✗"), url));
                    }
                    bar.inc(1);
                }
                ok
            }
        })
        .buffer_unordered(workers.max(1))
        .collect()
        .await;
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }

    let failed = results.iter().filter(|ok| !**ok).count();
    ui.say(format!(
        "{} {}/{} downloaded into {}",
        if failed == 0 { green("✔") } else { red("⚠") },
        results.len() - failed,
        results.len(),
        bold(&dest.display().to_string())
    ));
    if failed > 0 {
        bail!("{failed} downloads failed");
    }
    Ok(())
}

/// Files under `root` (or `root` itself) whose extension matches `ext`.
fn files_with_extension(root: &Path, ext: &str) -> Result<Vec<PathBuf>> {
    if root.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }
    let mut found = Vec::new();
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to read directory {}", dir.display()))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
            } else if path
                .extension()
                .is_some_and(|e| e.eq_ignore_ascii_case(ext))
            {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string())
}

async fn convert(ui: &Ui, input: &Path, output: &Path, args: &ConversionArgs) -> Result<()> {
    let pdfs = files_with_extension(input, "pdf")?;
    if pdfs.is_empty() {
        bail!("No PDF files found under {}", input.display());
    }
    let converter = Converter::new(args.config()?);
    let opts = args.options();
    ui.say(dim(&format!(
        "backends available: {:?}",
        converter.available_backends()
    )));

    let bar = ui.bar(pdfs.len(), "Converting", "docs");
    let (mut stubs, mut failed) = (0usize, 0usize);
    for path in &pdfs {
        let md_path = output.join(format!("{}.md", stem(path)));
        if let Some(ref bar) = bar {
            bar.set_message(stem(path));
        }
        match converter.convert_to_file(path, &md_path, &opts).await {
            Ok(report) => {
                if report.is_stub() {
                    stubs += 1;
                }
                if let Some(ref bar) = bar {
                    bar.println(format!(
                        "  {} {:<40} {}",
                        if report.is_stub() { red("~") } else { green("✓") },
                        stem(path),
                        dim(&format!(
                            "{}  q={:.2}  {:.1}s",
                            report.method(),
                            report.quality.score,
                            report.elapsed_secs
                        )),
                    ));
                }
            }
            Err(e) => {
                failed += 1;
                let msg = format!("  {} {}: {}", red("✗"), path.display(), e);
                match bar {
                    Some(ref bar) => bar.println(msg),
                    None => eprintln!("{msg}"),
                }
            }
        }
        if let Some(ref bar) = bar {
            bar.inc(1);
        }
    }
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }

    ui.say(format!(
        "{} {}/{} converted  ({} stubs)  →  {}",
        if failed == 0 { green("✔") } else { red("⚠") },
        pdfs.len() - failed,
        pdfs.len(),
        stubs,
        bold(&output.display().to_string())
    ));
    if failed > 0 {
        bail!("{failed} Markdown files could not be written");
    }
    Ok(())
}

async fn to_json(ui: &Ui, input: &Path, output: &Path) -> Result<()> {
    let files = files_with_extension(input, "md")?;
    if files.is_empty() {
        bail!("No Markdown files found under {}", input.display());
    }
    let mut written = 0;
    for path in &files {
        let record = mapper::to_document(path, None);
        let json_path = output.join(format!("{}.json", stem(path)));
        mapper::write_document(&record, &json_path)
            .await
            .with_context(|| format!("Failed to write {}", json_path.display()))?;
        written += 1;
    }
    ui.say(format!(
        "{} {} records  →  {}",
        green("✔"),
        written,
        bold(&output.display().to_string())
    ));
    Ok(())
}

async fn aggregate(ui: &Ui, json_dir: &Path, output: &Path, validate: bool) -> Result<()> {
    let kb = KnowledgeBase::merge_dir(json_dir)
        .await
        .with_context(|| format!("Failed to read records from {}", json_dir.display()))?;
    kb.write(output)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;
    ui.say(format!(
        "{} {} documents  →  {}",
        green("✔"),
        kb.len(),
        bold(&output.display().to_string())
    ));

    if validate {
        let reread = KnowledgeBase::read(output)
            .await
            .context("Failed to re-read knowledge base")?;
        let problems = reread.validate();
        if !problems.is_empty() {
            for p in &problems {
                eprintln!("  {} {}", red("✗"), p);
            }
            bail!("Knowledge base failed validation ({} problems)", problems.len());
        }
        ui.say(format!("{} knowledge base is valid", green("✔")));
    }
    Ok(())
}

async fn inspect(path: &Path, json: bool, args: &ConversionArgs) -> Result<()> {
    let config = args.config()?;
    let converter = Converter::new(config.clone());
    let report = converter.detect(path).await;

    let owned = path.to_path_buf();
    let info = pdf::run_blocking(move || pdf::extract_text(&owned, &config))
        .await
        .ok()
        .map(|text| text.info);

    if json {
        let value = serde_json::json!({
            "file": path.display().to_string(),
            "format": report,
            "info": info.as_ref().map(|i| {
                i.entries()
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), serde_json::Value::from(v)))
                    .collect::<serde_json::Map<_, _>>()
            }),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&value).context("Failed to serialise report")?
        );
        return Ok(());
    }

    println!("File:         {}", path.display());
    if let Some(ref info) = info {
        for (label, value) in info.entries() {
            println!("{:<14}{}", format!("{label}:"), value);
        }
    }
    println!("Pages:        {}", report.page_count());
    println!("Encrypted:    {}", report.is_encrypted());
    println!("Needs OCR:    {}", report.needs_ocr());
    println!("Rare format:  {:?}", report.rare_format_kind());
    println!("Strategy:     {:?}", report.processing_strategy());
    for w in report.warnings() {
        println!("Warning:      {}", w);
    }
    Ok(())
}

struct RunOpts {
    listing: ListingArgs,
    urls: Option<PathBuf>,
    data_dir: PathBuf,
    workers: usize,
    resume: bool,
    checkpoint_name: String,
    http: HttpArgs,
    conversion: ConversionArgs,
}

async fn run(ui: &Ui, opts: RunOpts) -> Result<()> {
    let urls = match opts.urls {
        Some(ref list) => read_url_list(list).await?,
        None => collect_urls(&opts.listing, opts.http.config()).await?,
    };
    if urls.is_empty() {
        bail!("Nothing to process");
    }
    ui.say(format!("{} {} documents queued", bold("◆"), urls.len()));

    let layout = OutputLayout::under(&opts.data_dir);
    let workers = opts.workers.max(1);
    let mut builder = BatchConfig::builder()
        .workers(2.min(workers), workers, workers * 2)
        .checkpoint_name(&opts.checkpoint_name)
        .resume(opts.resume)
        .layout(layout.clone());
    if ui.progress {
        let cb: Arc<dyn BatchProgressCallback> = CliProgressCallback::new();
        builder = builder.progress_callback(cb);
    }
    let batch = builder.build().context("Invalid batch configuration")?;

    let metrics: Arc<dyn MetricsSink> = Arc::new(InMemoryMetrics::new());
    let downloader = Downloader::new(opts.http.config())
        .context("Failed to build HTTP client")?
        .with_metrics(Arc::clone(&metrics));
    let converter = Arc::new(Converter::new(opts.conversion.config()?));
    let processor: Arc<dyn ItemProcessor> = Arc::new(PipelineProcessor::new(
        downloader,
        converter,
        opts.conversion.options(),
        layout.clone(),
        Arc::clone(&metrics),
    ));

    let report = Orchestrator::new(batch, processor)
        .with_metrics(metrics)
        .with_params(opts.conversion.params())
        .run(&urls)
        .await
        .context("Batch run failed")?;

    let kb_path = opts.data_dir.join("knowledge_base.json");
    let kb = KnowledgeBase::merge_dir(&layout.json_dir)
        .await
        .context("Failed to merge JSON records")?;
    kb.write(&kb_path)
        .await
        .with_context(|| format!("Failed to write {}", kb_path.display()))?;

    ui.say(format!(
        "   {:.1}% success  {:.1} docs/min  {} workers at end  {}",
        report.success_rate,
        report.items_per_minute,
        report.final_workers,
        dim(&format!("{:.0}s total", report.runtime_secs)),
    ));
    ui.say(format!(
        "{} knowledge base: {} documents  →  {}",
        green("✔"),
        kb.len(),
        bold(&kb_path.display().to_string())
    ));

    let attempted = report.stats.finished() - report.stats.skipped;
    if attempted > 0 && report.stats.completed == report.stats.skipped {
        bail!("Every document failed ({} attempted)", attempted);
    }
    Ok(())
}
