//! Batch orchestration: many URLs through the pipeline with bounded,
//! load-aware concurrency and resumable progress.
//!
//! ```text
//! urls ─► resume filter ─► pause gate ─► rate delay ─► ElasticPool permit
//!                                                          │
//!                                          ItemProcessor::process (task)
//!                                                          │
//!        BatchStats + MetricsSink ◄── fold ItemOutcome ◄───┘
//!              │
//!              └─► checkpoint every N items / T seconds, circuit breaker
//! ```
//!
//! A monitor task samples host load and grows or shrinks the pool and the
//! rate delay. In-flight items are never cancelled: throttling only affects
//! what is dispatched next.

pub mod pool;
pub mod processor;
pub mod resources;
pub mod status;

pub use pool::{ElasticPool, PoolPermit};
pub use processor::{ItemOutcome, ItemProcessor, PipelineProcessor, REUSED_METHOD};
pub use resources::{
    default_sampler, Adjustment, LoadTracker, NoopSampler, ProcSampler, ResourceSample,
    ResourceSampler,
};
pub use status::{BatchStats, ItemStatus, StatusBoard};

use crate::checkpoint::{Checkpoint, CheckpointStore, CheckpointTrigger};
use crate::config::BatchConfig;
use crate::error::HarvestError;
use crate::metrics::{InMemoryMetrics, MetricsSink, MetricsSnapshot};
use crate::storage::write_atomic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// File name of the run summary inside the report directory.
pub const REPORT_FILE: &str = "performance_report.json";

/// Summary of one orchestrator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub started_at: String,
    pub finished_at: String,
    pub runtime_secs: f64,
    pub stats: BatchStats,
    /// Percent of attempted items that completed.
    pub success_rate: f64,
    pub items_per_minute: f64,
    pub final_workers: usize,
    pub final_rate_delay_secs: f64,
    pub checkpoints_written: usize,
    pub circuit_breaker_trips: usize,
    pub metrics: MetricsSnapshot,
}

struct Progress {
    stats: BatchStats,
    since_checkpoint: usize,
    last_checkpoint: Instant,
    consecutive_errors: u32,
    checkpoints_written: usize,
    trips: usize,
}

/// State shared between the dispatch loop and the monitor task.
struct RunState {
    board: StatusBoard,
    progress: Mutex<Progress>,
    rate_delay: Mutex<Duration>,
    last_sample: Mutex<Option<ResourceSample>>,
    pause_tx: watch::Sender<bool>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl RunState {
    fn rate_delay(&self) -> Duration {
        *lock(&self.rate_delay)
    }
}

/// A worker's result together with the slot it ran in.
type Finished = (ItemOutcome, PoolPermit);

/// Step sizes for the monitor's adjustments.
#[derive(Debug, Clone, Copy)]
struct RateControl {
    factor: f64,
    min_delay: Duration,
    max_delay: Duration,
}

impl RateControl {
    fn new(config: &BatchConfig) -> Self {
        Self {
            factor: config.rate_factor.max(1.0),
            min_delay: config.min_rate_limit,
            max_delay: config.max_rate_limit,
        }
    }

    /// Throttle: one worker fewer and the delay times `factor`, capped.
    /// Accelerate: one worker more and the delay divided by `factor`,
    /// floored. Returns the worker limit afterwards.
    fn apply(&self, adjustment: Adjustment, pool: &ElasticPool, delay: &mut Duration) -> usize {
        match adjustment {
            Adjustment::Throttle => {
                *delay = delay.mul_f64(self.factor).min(self.max_delay);
                pool.shrink()
            }
            Adjustment::Accelerate => {
                *delay = delay.div_f64(self.factor).max(self.min_delay);
                pool.grow()
            }
            Adjustment::Hold => pool.limit(),
        }
    }
}

/// Drives a list of URLs through an [`ItemProcessor`].
pub struct Orchestrator {
    config: BatchConfig,
    processor: Arc<dyn ItemProcessor>,
    store: CheckpointStore,
    metrics: Arc<dyn MetricsSink>,
    sampler: Arc<dyn ResourceSampler>,
    params: Value,
}

impl Orchestrator {
    /// Orchestrator with in-memory metrics, the platform resource sampler and
    /// checkpoints under `config.layout.checkpoint_dir`.
    pub fn new(config: BatchConfig, processor: Arc<dyn ItemProcessor>) -> Self {
        Self {
            store: CheckpointStore::new(config.layout.checkpoint_dir.clone()),
            processor,
            metrics: Arc::new(InMemoryMetrics::new()),
            sampler: Arc::from(default_sampler()),
            params: Value::Object(Default::default()),
            config,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn ResourceSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_store(mut self, store: CheckpointStore) -> Self {
        self.store = store;
        self
    }

    /// Run parameters stored in checkpoints. Resuming a checkpoint written
    /// with different parameters fails with
    /// [`HarvestError::ParamMismatch`].
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Process `urls`, skipping duplicates and, when resuming, URLs a
    /// checkpoint already marks completed.
    ///
    /// Only a checkpoint that cannot be trusted (schema or parameter
    /// mismatch, unreadable file) or a closed worker pool is an error;
    /// individual item failures are counted in the report.
    pub async fn run(&self, urls: &[String]) -> Result<BatchReport, HarvestError> {
        let started = Instant::now();
        let started_at = chrono::Local::now().to_rfc3339();
        let name = self.config.checkpoint_name.as_str();

        let resumed = if self.config.resume {
            let store = self.store.clone();
            let (owned, params) = (name.to_string(), self.params.clone());
            tokio::task::spawn_blocking(move || store.load_for(&owned, &params))
                .await
                .map_err(|e| HarvestError::Internal(format!("checkpoint load task: {}", e)))??
        } else {
            None
        };
        let (board, mut stats) = match resumed {
            Some(cp) => {
                info!(
                    "resuming from checkpoint {} ({} urls, created {})",
                    name,
                    cp.url_status.len(),
                    cp.created_at
                );
                (StatusBoard::restore(&cp.url_status), cp.stats)
            }
            None => (StatusBoard::new(), BatchStats::default()),
        };

        let mut seen = HashSet::new();
        let mut queue = Vec::new();
        let mut skipped = 0;
        for url in urls {
            if !seen.insert(url.as_str()) {
                continue;
            }
            board.register(url);
            if board.get(url) == Some(ItemStatus::Completed) {
                skipped += 1;
            } else {
                queue.push(url.clone());
            }
        }
        stats.total = seen.len();
        stats.skipped = skipped;
        stats.completed = skipped;
        stats.failed = 0;

        info!(
            total = stats.total,
            skipped,
            queued = queue.len(),
            workers = self.config.initial_workers,
            "starting batch"
        );
        if let Some(cb) = &self.config.progress_callback {
            cb.on_batch_start(stats.total, skipped);
        }

        let (pause_tx, mut pause_rx) = watch::channel(false);
        let state = Arc::new(RunState {
            board,
            progress: Mutex::new(Progress {
                stats,
                since_checkpoint: 0,
                last_checkpoint: Instant::now(),
                consecutive_errors: 0,
                checkpoints_written: 0,
                trips: 0,
            }),
            rate_delay: Mutex::new(self.config.base_rate_limit),
            last_sample: Mutex::new(None),
            pause_tx,
        });
        let pool = ElasticPool::new(
            self.config.initial_workers,
            self.config.min_workers,
            self.config.max_workers,
        );
        let monitor = self.spawn_monitor(Arc::clone(&state), Arc::clone(&pool));

        let mut tasks = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, String> = HashMap::new();
        let dispatched = self
            .dispatch(&state, &pool, &mut pause_rx, queue, &mut tasks, &mut in_flight)
            .await;

        while let Some(joined) = tasks.join_next_with_id().await {
            self.reap(&state, joined, &mut in_flight).await;
        }
        monitor.abort();
        dispatched?;

        self.checkpoint(&state, CheckpointTrigger::Final).await;

        let runtime_secs = started.elapsed().as_secs_f64();
        let progress = lock(&state.progress);
        let finished = progress.stats.finished() - progress.stats.skipped;
        let report = BatchReport {
            started_at,
            finished_at: chrono::Local::now().to_rfc3339(),
            runtime_secs,
            success_rate: progress.stats.success_rate(),
            items_per_minute: if runtime_secs > 0.0 {
                finished as f64 * 60.0 / runtime_secs
            } else {
                0.0
            },
            final_workers: pool.limit(),
            final_rate_delay_secs: state.rate_delay().as_secs_f64(),
            checkpoints_written: progress.checkpoints_written,
            circuit_breaker_trips: progress.trips,
            metrics: self.metrics.snapshot(),
            stats: progress.stats.clone(),
        };
        drop(progress);

        info!(
            completed = report.stats.completed,
            failed = report.stats.failed,
            skipped = report.stats.skipped,
            stubs = report.stats.stubs,
            "batch finished in {:.1}s ({:.1}% success)",
            report.runtime_secs,
            report.success_rate
        );
        if let Some(cb) = &self.config.progress_callback {
            cb.on_batch_complete(&report.stats);
        }
        if let Err(e) = self.write_report(&report).await {
            error!(category = %e.category(), "{}", e);
            self.metrics
                .record_error(e.category(), "performance report", &e.to_string());
        }
        Ok(report)
    }

    async fn dispatch(
        &self,
        state: &Arc<RunState>,
        pool: &Arc<ElasticPool>,
        pause_rx: &mut watch::Receiver<bool>,
        queue: Vec<String>,
        tasks: &mut JoinSet<Finished>,
        in_flight: &mut HashMap<tokio::task::Id, String>,
    ) -> Result<(), HarvestError> {
        for url in queue {
            // Finished items hand their slot back only once reaped, so the
            // breaker and checkpoints see an outcome before the next dispatch.
            let permit = loop {
                tokio::select! {
                    biased;
                    Some(joined) = tasks.join_next_with_id() => {
                        self.reap(state, joined, in_flight).await;
                    }
                    permit = pool.acquire() => break permit?,
                }
            };
            while let Some(joined) = tasks.try_join_next_with_id() {
                self.reap(state, joined, in_flight).await;
            }

            if *pause_rx.borrow() {
                info!("dispatch paused");
            }
            if pause_rx.wait_for(|paused| !*paused).await.is_err() {
                return Err(HarvestError::Internal("pause gate closed".to_string()));
            }
            let delay = state.rate_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            state.board.transition(&url, ItemStatus::InProgress)?;
            if let Some(cb) = &self.config.progress_callback {
                cb.on_item_start(&url);
            }
            debug!(url = %url, "dispatching");

            let processor = Arc::clone(&self.processor);
            let task_url = url.clone();
            let handle = tasks.spawn(async move {
                let outcome = processor.process(&task_url).await;
                (outcome, permit)
            });
            in_flight.insert(handle.id(), url);
        }
        Ok(())
    }

    /// Record a finished task, checkpoint if due, then release its slot.
    async fn reap(
        &self,
        state: &RunState,
        joined: Result<(tokio::task::Id, Finished), JoinError>,
        in_flight: &mut HashMap<tokio::task::Id, String>,
    ) {
        let (trigger, permit) = match joined {
            Ok((id, (outcome, permit))) => {
                in_flight.remove(&id);
                (self.record(state, outcome), Some(permit))
            }
            Err(e) => {
                // The slot went back when the task unwound.
                let url = in_flight.remove(&e.id()).unwrap_or_default();
                error!(url = %url, "worker task failed: {}", e);
                let outcome = ItemOutcome::failure(&url, e.to_string(), Duration::ZERO);
                (self.record(state, outcome), None)
            }
        };
        if let Some(trigger) = trigger {
            self.checkpoint(state, trigger).await;
        }
        drop(permit);
    }

    /// Fold one outcome into the board, counters and metrics. Returns the
    /// checkpoint that is now due, if any.
    fn record(&self, state: &RunState, outcome: ItemOutcome) -> Option<CheckpointTrigger> {
        let status = if outcome.succeeded {
            ItemStatus::Completed
        } else {
            ItemStatus::Failed
        };
        if let Err(e) = state.board.transition(&outcome.url, status) {
            error!(url = %outcome.url, "{}", e);
        }
        let elapsed = Duration::try_from_secs_f64(outcome.elapsed_secs).unwrap_or_default();
        self.metrics.record_item(outcome.succeeded, elapsed);

        match (&outcome.error, &self.config.progress_callback) {
            (Some(err), Some(cb)) => cb.on_item_error(&outcome.url, err),
            (None, Some(cb)) => cb.on_item_complete(
                &outcome.url,
                outcome.method.as_deref().unwrap_or(REUSED_METHOD),
            ),
            _ => {}
        }
        if let Some(err) = &outcome.error {
            warn!(url = %outcome.url, "item failed: {}", err);
        }

        let (trigger, trip) = {
            let mut p = lock(&state.progress);
            if outcome.succeeded {
                p.stats.completed += 1;
                if outcome.stub {
                    p.stats.stubs += 1;
                }
                if let Some(method) = &outcome.method {
                    *p.stats.methods.entry(method.clone()).or_default() += 1;
                }
                p.consecutive_errors = 0;
            } else {
                p.stats.failed += 1;
                p.consecutive_errors += 1;
            }
            p.stats.bytes_downloaded += outcome.bytes_downloaded;
            p.since_checkpoint += 1;

            let trigger = if p.since_checkpoint >= self.config.checkpoint_every {
                Some(CheckpointTrigger::Count)
            } else if p.last_checkpoint.elapsed() >= self.config.checkpoint_interval {
                Some(CheckpointTrigger::Time)
            } else {
                None
            };
            let trip = p.consecutive_errors >= self.config.max_consecutive_errors;
            if trip {
                p.consecutive_errors = 0;
                p.trips += 1;
            }
            (trigger, trip)
        };

        if trip {
            self.trip_breaker(state);
        }
        trigger
    }

    fn trip_breaker(&self, state: &RunState) {
        let pause = self.config.pause_duration;
        warn!(
            "{} consecutive failures, pausing dispatch for {:?}",
            self.config.max_consecutive_errors, pause
        );
        state.pause_tx.send_replace(true);
        let tx = state.pause_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(pause).await;
            tx.send_replace(false);
            info!("dispatch resumed");
        });
    }

    async fn checkpoint(&self, state: &RunState, trigger: CheckpointTrigger) {
        let cp = {
            let p = lock(&state.progress);
            Checkpoint::new(
                self.config.checkpoint_name.clone(),
                state.board.snapshot(),
                p.stats.clone(),
                self.params.clone(),
                trigger,
            )
            .with_resources(*lock(&state.last_sample))
        };
        let store = self.store.clone();
        let name = self.config.checkpoint_name.clone();
        let saved = match tokio::task::spawn_blocking(move || store.save(&name, &cp)).await {
            Ok(path) => path.is_some(),
            Err(e) => {
                error!("checkpoint task failed: {}", e);
                false
            }
        };

        let mut p = lock(&state.progress);
        p.since_checkpoint = 0;
        p.last_checkpoint = Instant::now();
        if saved {
            p.checkpoints_written += 1;
        } else {
            self.metrics.record_error(
                crate::error::ErrorCategory::Checkpoint,
                &self.config.checkpoint_name,
                "checkpoint save failed",
            );
        }
    }

    fn spawn_monitor(&self, state: Arc<RunState>, pool: Arc<ElasticPool>) -> JoinHandle<()> {
        let sampler = Arc::clone(&self.sampler);
        let mut tracker = LoadTracker::new(&self.config);
        let period = self.config.monitor_interval.max(Duration::from_millis(10));
        let control = RateControl::new(&self.config);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(sample) = sampler.sample() else {
                    continue;
                };
                *lock(&state.last_sample) = Some(sample);
                debug!(
                    cpu = sample.cpu_percent,
                    memory = sample.memory_percent,
                    "resource sample"
                );

                let adjustment = tracker.observe(sample);
                if adjustment == Adjustment::Hold {
                    continue;
                }
                let mut delay = lock(&state.rate_delay);
                let workers = control.apply(adjustment, &pool, &mut delay);
                if adjustment == Adjustment::Throttle {
                    info!(workers, delay = ?*delay, "high load, throttling");
                } else {
                    info!(workers, delay = ?*delay, "low load, accelerating");
                }
            }
        })
    }

    async fn write_report(&self, report: &BatchReport) -> Result<PathBuf, HarvestError> {
        let path = self.config.layout.report_dir.join(REPORT_FILE);
        let json = serde_json::to_vec_pretty(report)
            .map_err(|e| HarvestError::Internal(format!("report serialisation: {}", e)))?;
        write_atomic(&path, &json).await?;
        info!("wrote {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputLayout;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails every URL containing "bad".
    #[derive(Default)]
    struct Scripted {
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
        started: Mutex<Vec<Instant>>,
        work: Duration,
    }

    impl Scripted {
        fn taking(work: Duration) -> Self {
            Self {
                work,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ItemProcessor for Scripted {
        async fn process(&self, url: &str) -> ItemOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            lock(&self.seen).push(url.to_string());
            lock(&self.started).push(Instant::now());
            if self.work.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.work).await;
            }
            if url.contains("bad") {
                ItemOutcome::failure(url, "HTTP 404", Duration::from_millis(1))
            } else {
                let mut o = ItemOutcome::success(url, "direct_text", Duration::from_millis(1));
                o.bytes_downloaded = 10;
                o
            }
        }
    }

    fn config(root: &std::path::Path) -> BatchConfig {
        BatchConfig::builder()
            .workers(1, 2, 3)
            .rate_limits(Duration::ZERO, Duration::ZERO, Duration::ZERO)
            .circuit_breaker(5, Duration::from_millis(20))
            .checkpoint_every(2)
            .layout(OutputLayout::under(root))
            .build()
            .unwrap()
    }

    fn urls(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| format!("https://x/{n}.pdf")).collect()
    }

    fn numbered(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("https://x/{i}.pdf")).collect()
    }

    const HIGH: ResourceSample = ResourceSample {
        cpu_percent: 95.0,
        memory_percent: 20.0,
    };
    const LOW: ResourceSample = ResourceSample {
        cpu_percent: 5.0,
        memory_percent: 5.0,
    };

    /// Replays samples in order, then repeats the last one.
    struct LoadScript(Mutex<Vec<ResourceSample>>);

    impl LoadScript {
        fn new(mut samples: Vec<ResourceSample>) -> Arc<Self> {
            samples.reverse();
            Arc::new(Self(Mutex::new(samples)))
        }
    }

    impl ResourceSampler for LoadScript {
        fn sample(&self) -> Option<ResourceSample> {
            let mut left = lock(&self.0);
            if left.len() > 1 {
                left.pop()
            } else {
                left.last().copied()
            }
        }
    }

    /// Adjust on every sample, every 10 ms.
    fn adaptive(
        root: &std::path::Path,
        workers: (usize, usize, usize),
        delays_ms: (u64, u64, u64),
    ) -> BatchConfig {
        let ms = Duration::from_millis;
        let mut cfg = BatchConfig::builder()
            .workers(workers.0, workers.1, workers.2)
            .rate_limits(ms(delays_ms.0), ms(delays_ms.1), ms(delays_ms.2))
            .monitor_interval(ms(10))
            .layout(OutputLayout::under(root))
            .build()
            .unwrap();
        cfg.adjust_after = 1;
        cfg
    }

    fn assert_delay(actual: Duration, expected_ms: f64) {
        let got = actual.as_secs_f64() * 1000.0;
        assert!((got - expected_ms).abs() < 1e-3, "delay {got} ms, expected {expected_ms} ms");
    }

    #[test]
    fn rate_control_scales_and_clamps() {
        let control = RateControl {
            factor: 1.5,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        let pool = ElasticPool::new(3, 1, 4);
        let mut delay = Duration::from_millis(100);

        assert_eq!(control.apply(Adjustment::Throttle, &pool, &mut delay), 2);
        assert_delay(delay, 150.0);
        assert_eq!(control.apply(Adjustment::Throttle, &pool, &mut delay), 1);
        assert_delay(delay, 225.0);
        assert_eq!(control.apply(Adjustment::Throttle, &pool, &mut delay), 1);
        assert_eq!(delay, Duration::from_millis(300));

        assert_eq!(control.apply(Adjustment::Hold, &pool, &mut delay), 1);
        assert_eq!(delay, Duration::from_millis(300));

        assert_eq!(control.apply(Adjustment::Accelerate, &pool, &mut delay), 2);
        assert_delay(delay, 200.0);
        for _ in 0..4 {
            control.apply(Adjustment::Accelerate, &pool, &mut delay);
        }
        assert_eq!(pool.limit(), 4);
        assert_eq!(delay, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn sustained_high_load_throttles_to_the_floor() {
        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(
            adaptive(dir.path(), (1, 3, 3), (5, 10, 20)),
            Arc::new(Scripted::taking(Duration::from_millis(10))),
        )
        .with_sampler(LoadScript::new(vec![HIGH]));
        let report = orch.run(&numbered(10)).await.unwrap();

        assert_eq!(report.stats.completed, 10);
        assert_eq!(report.final_workers, 1);
        assert_eq!(report.final_rate_delay_secs, 0.020);

        let cp = orch.store().load("batch").unwrap().unwrap();
        assert_eq!(cp.resources, Some(HIGH));
    }

    #[tokio::test]
    async fn load_dropping_after_a_spike_accelerates_to_the_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let report = Orchestrator::new(
            adaptive(dir.path(), (1, 2, 3), (5, 10, 40)),
            Arc::new(Scripted::taking(Duration::from_millis(10))),
        )
        .with_sampler(LoadScript::new(vec![HIGH, HIGH, LOW]))
        .run(&numbered(30))
        .await
        .unwrap();

        assert_eq!(report.stats.completed, 30);
        assert_eq!(report.final_workers, 3);
        assert_eq!(report.final_rate_delay_secs, 0.005);
    }

    fn orchestrator(root: &std::path::Path, p: Arc<Scripted>) -> Orchestrator {
        Orchestrator::new(config(root), p).with_sampler(Arc::new(NoopSampler))
    }

    #[tokio::test]
    async fn counts_outcomes_and_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let p = Arc::new(Scripted::default());
        let report = orchestrator(dir.path(), Arc::clone(&p))
            .run(&urls(&["a", "b", "bad", "a"]))
            .await
            .unwrap();

        assert_eq!(p.calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.stats.total, 3);
        assert_eq!(report.stats.completed, 2);
        assert_eq!(report.stats.failed, 1);
        assert_eq!(report.stats.bytes_downloaded, 20);
        assert_eq!(report.stats.methods.get("direct_text"), Some(&2));
        assert_eq!(report.metrics.items_failed, 1);
        assert!(report.checkpoints_written >= 2);
        assert!(dir.path().join("reports").join(REPORT_FILE).exists());
        assert!(dir.path().join("checkpoints/batch.checkpoint.json").exists());
    }

    #[tokio::test]
    async fn resume_skips_completed_and_retries_failed() {
        let dir = tempfile::tempdir().unwrap();
        let list = urls(&["a", "bad", "c"]);
        orchestrator(dir.path(), Arc::new(Scripted::default()))
            .run(&list)
            .await
            .unwrap();

        let second = Arc::new(Scripted::default());
        let report = orchestrator(dir.path(), Arc::clone(&second))
            .run(&list)
            .await
            .unwrap();
        assert_eq!(*lock(&second.seen), vec!["https://x/bad.pdf".to_string()]);
        assert_eq!(report.stats.skipped, 2);
        assert_eq!(report.stats.completed, 2);
        assert_eq!(report.stats.failed, 1);
    }

    #[tokio::test]
    async fn no_resume_reprocesses_everything() {
        let dir = tempfile::tempdir().unwrap();
        let list = urls(&["a", "b"]);
        orchestrator(dir.path(), Arc::new(Scripted::default()))
            .run(&list)
            .await
            .unwrap();

        let p = Arc::new(Scripted::default());
        let mut cfg = config(dir.path());
        cfg.resume = false;
        Orchestrator::new(cfg, Arc::clone(&p) as Arc<dyn ItemProcessor>)
            .with_sampler(Arc::new(NoopSampler))
            .run(&list)
            .await
            .unwrap();
        assert_eq!(p.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn param_mismatch_refuses_to_resume() {
        let dir = tempfile::tempdir().unwrap();
        let list = urls(&["a"]);
        orchestrator(dir.path(), Arc::new(Scripted::default()))
            .with_params(serde_json::json!({"ocr": false}))
            .run(&list)
            .await
            .unwrap();

        let err = orchestrator(dir.path(), Arc::new(Scripted::default()))
            .with_params(serde_json::json!({"ocr": true}))
            .run(&list)
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::ParamMismatch { .. }));
    }

    #[tokio::test]
    async fn consecutive_failures_pause_dispatch_then_resume() {
        let pause = Duration::from_millis(80);
        let dir = tempfile::tempdir().unwrap();
        let serial = BatchConfig::builder()
            .fixed_workers(1)
            .rate_limits(Duration::ZERO, Duration::ZERO, Duration::ZERO)
            .circuit_breaker(5, pause)
            .layout(OutputLayout::under(dir.path()))
            .build()
            .unwrap();
        let p = Arc::new(Scripted::default());
        let report = Orchestrator::new(serial, Arc::clone(&p) as Arc<dyn ItemProcessor>)
            .with_sampler(Arc::new(NoopSampler))
            .run(&urls(&["bad1", "bad2", "bad3", "bad4", "bad5", "ok1", "ok2"]))
            .await
            .unwrap();
        assert_eq!(report.circuit_breaker_trips, 1);
        assert_eq!(report.stats.failed, 5);
        assert_eq!(report.stats.completed, 2);

        let started = lock(&p.started).clone();
        assert_eq!(started.len(), 7);
        let gaps: Vec<Duration> = started.windows(2).map(|w| w[1] - w[0]).collect();
        // Only the dispatch right after the fifth failure waits out the pause.
        assert!(gaps[4] >= pause, "resumed after {:?}", gaps[4]);
        assert!(gaps[..4].iter().all(|g| *g < pause), "{gaps:?}");
        assert!(gaps[5] < pause, "{gaps:?}");
    }
}
