//! Query latency aggregation
//!
//! Callers submit `(descriptor, duration)` samples through a [`StatsHandle`]
//! without ever waiting on the aggregator. A [`StatsCollector`] owns two
//! background tasks:
//!
//! - a consumer applying samples to the per-descriptor aggregates
//! - a reporter logging the slowest descriptors on a schedule, then resetting
//!
//! Both stop on [`StatsCollector::shutdown`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use acton_repository::config::StatsConfig;
//! use acton_repository::stats::StatsCollector;
//!
//! # async fn example() {
//! let collector = StatsCollector::spawn(&StatsConfig::default());
//! let stats = collector.handle();
//! stats.record("loading User", Duration::from_millis(12));
//! collector.flush().await;
//! println!("{}", collector.report());
//! collector.shutdown().await;
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StatsConfig;

/// Aggregate timings for one query descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryStat {
    /// Human-readable query descriptor
    pub descriptor: String,
    /// Number of samples
    pub count: u64,
    /// Fastest sample
    pub min: Duration,
    /// Slowest sample
    pub max: Duration,
    /// Sum of all samples
    pub sum: Duration,
    /// `sum / count`
    pub avg: Duration,
}

impl QueryStat {
    fn new(descriptor: String) -> Self {
        Self {
            descriptor,
            count: 0,
            min: Duration::ZERO,
            max: Duration::ZERO,
            sum: Duration::ZERO,
            avg: Duration::ZERO,
        }
    }

    fn add(&mut self, duration: Duration) {
        self.count += 1;
        self.sum += duration;
        if self.count == 1 || duration < self.min {
            self.min = duration;
        }
        if duration > self.max {
            self.max = duration;
        }
        let avg_nanos = self.sum.as_nanos() / u128::from(self.count);
        self.avg = Duration::from_nanos(u64::try_from(avg_nanos).unwrap_or(u64::MAX));
    }
}

enum StatsCommand {
    Sample { descriptor: String, duration: Duration },
    Flush(oneshot::Sender<()>),
}

/// Cheap, cloneable sink for query timings
#[derive(Debug, Clone, Default)]
pub struct StatsHandle {
    tx: Option<mpsc::Sender<StatsCommand>>,
}

impl std::fmt::Debug for StatsCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sample { descriptor, .. } => write!(f, "Sample({})", descriptor),
            Self::Flush(_) => write!(f, "Flush"),
        }
    }
}

impl StatsHandle {
    /// A handle that discards every sample
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Whether samples go anywhere
    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Submit a sample; never blocks
    ///
    /// A full channel drops the sample with a warning.
    pub fn record(&self, descriptor: impl Into<String>, duration: Duration) {
        let Some(ref tx) = self.tx else {
            return;
        };
        let descriptor = descriptor.into();
        if descriptor.is_empty() {
            warn!("empty query descriptor");
        }
        match tx.try_send(StatsCommand::Sample {
            descriptor,
            duration,
        }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                warn!(sample = ?cmd, "stats channel full, dropping sample");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("stats collector stopped, dropping sample");
            }
        }
    }

    /// Start timing; the sample is recorded when the timer is dropped
    pub fn timer(&self, descriptor: impl Into<String>) -> StatsTimer {
        StatsTimer {
            handle: self.clone(),
            descriptor: descriptor.into(),
            started: Instant::now(),
        }
    }

    /// Wait until every sample sent before this call has been applied
    pub async fn flush(&self) {
        let Some(ref tx) = self.tx else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(StatsCommand::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// Records one sample for its descriptor when dropped
#[derive(Debug)]
pub struct StatsTimer {
    handle: StatsHandle,
    descriptor: String,
    started: Instant,
}

impl StatsTimer {
    /// Elapsed time so far
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for StatsTimer {
    fn drop(&mut self) {
        let descriptor = std::mem::take(&mut self.descriptor);
        self.handle.record(descriptor, self.started.elapsed());
    }
}

fn format_duration(duration: Duration) -> String {
    format!("{:.3}ms", duration.as_secs_f64() * 1000.0)
}

#[derive(Debug)]
struct StatsState {
    title: String,
    top: usize,
    warn_threshold: usize,
    reset_threshold: usize,
    stats: Mutex<HashMap<String, QueryStat>>,
    last_report: Mutex<String>,
}

impl StatsState {
    fn apply(&self, descriptor: String, duration: Duration) {
        let tracked = self.stats.lock().unwrap_or_else(PoisonError::into_inner).len();
        if tracked > self.warn_threshold {
            warn!(tracked, "too many distinct query descriptors");
        }
        if tracked > self.reset_threshold {
            warn!(tracked, "too many distinct query descriptors, resetting");
            self.report_and_reset();
        }

        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats
            .entry(descriptor.clone())
            .or_insert_with(|| QueryStat::new(descriptor))
            .add(duration);
    }

    fn snapshot(&self) -> Vec<QueryStat> {
        let mut list: Vec<QueryStat> = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| {
            b.avg
                .cmp(&a.avg)
                .then_with(|| a.descriptor.cmp(&b.descriptor))
        });
        list
    }

    fn report(&self) -> String {
        let mut report = format!("{} (avg/min/max/count):\n", self.title);
        let list = self.snapshot();
        if list.is_empty() {
            report.push_str("empty\n");
            return report;
        }
        for stat in list.iter().take(self.top) {
            let numbers = format!(
                "{}/{}/{}/n={}",
                format_duration(stat.avg),
                format_duration(stat.min),
                format_duration(stat.max),
                stat.count
            );
            report.push_str(&format!("{:>50}  {}\n", numbers, stat.descriptor));
        }
        report
    }

    fn reset(&self) {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn report_and_reset(&self) -> String {
        let report = self.report();
        info!("{}", report);
        *self
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = report.clone();
        self.reset();
        report
    }
}

/// Background aggregator of query timings
///
/// Must be spawned inside a tokio runtime. Dropping the collector cancels its
/// tasks; [`shutdown`](Self::shutdown) also waits for them.
#[derive(Debug)]
pub struct StatsCollector {
    state: Arc<StatsState>,
    handle: StatsHandle,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StatsCollector {
    /// Start the consumer and reporter tasks
    pub fn spawn(config: &StatsConfig) -> Self {
        let warmup = config
            .warmup_secs
            .iter()
            .map(|secs| Duration::from_secs(*secs))
            .collect();
        Self::spawn_with_schedule(config, warmup, Duration::from_secs(config.interval_secs))
    }

    /// Start with an explicit reporting schedule: one report after each warm-up
    /// delay, then one every `interval`
    pub fn spawn_with_schedule(
        config: &StatsConfig,
        warmup: Vec<Duration>,
        interval: Duration,
    ) -> Self {
        let state = Arc::new(StatsState {
            title: config.title.to_uppercase(),
            top: config.top,
            warn_threshold: config.warn_threshold,
            reset_threshold: config.reset_threshold,
            stats: Mutex::new(HashMap::new()),
            last_report: Mutex::new(String::new()),
        });
        let cancel = CancellationToken::new();
        if !config.enabled {
            debug!(title = %state.title, "stats collection disabled");
            return Self {
                state,
                handle: StatsHandle::disabled(),
                cancel,
                tasks: Mutex::new(Vec::new()),
            };
        }
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));

        let consumer = tokio::spawn(run_consumer(state.clone(), rx, cancel.child_token()));
        let reporter = tokio::spawn(run_reporter(
            state.clone(),
            warmup,
            interval,
            cancel.child_token(),
        ));

        debug!(title = %state.title, "stats collector started");
        Self {
            state,
            handle: StatsHandle { tx: Some(tx) },
            cancel,
            tasks: Mutex::new(vec![consumer, reporter]),
        }
    }

    /// A handle for submitting samples
    pub fn handle(&self) -> StatsHandle {
        self.handle.clone()
    }

    /// Wait until every sample submitted so far has been applied
    pub async fn flush(&self) {
        self.handle.flush().await;
    }

    /// Current aggregates, slowest average first
    pub fn snapshot(&self) -> Vec<QueryStat> {
        self.state.snapshot()
    }

    /// Aggregate for one descriptor
    pub fn stat(&self, descriptor: &str) -> Option<QueryStat> {
        self.state
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(descriptor)
            .cloned()
    }

    /// Render the top-N report without resetting
    pub fn report(&self) -> String {
        self.state.report()
    }

    /// Log the report, remember it and clear the aggregates
    pub fn report_and_reset(&self) -> String {
        self.state.report_and_reset()
    }

    /// The most recent report logged by [`report_and_reset`](Self::report_and_reset)
    pub fn last_report(&self) -> String {
        self.state
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Clear the aggregates
    pub fn reset(&self) {
        self.state.reset();
    }

    /// Stop both tasks and wait for them to finish
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .is_err()
            {
                warn!("stats task did not stop within 5s");
            }
        }
        debug!(title = %self.state.title, "stats collector stopped");
    }

    /// Whether [`shutdown`](Self::shutdown) has been requested
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for StatsCollector {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_consumer(
    state: Arc<StatsState>,
    mut rx: mpsc::Receiver<StatsCommand>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            cmd = rx.recv() => match cmd {
                Some(StatsCommand::Sample { descriptor, duration }) => state.apply(descriptor, duration),
                Some(StatsCommand::Flush(done)) => {
                    let _ = done.send(());
                }
                None => break,
            },
        }
    }
}

async fn run_reporter(
    state: Arc<StatsState>,
    warmup: Vec<Duration>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let schedule = warmup.into_iter().chain(std::iter::repeat(interval));
    for delay in schedule {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {
                state.report_and_reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StatsConfig {
        StatsConfig {
            title: "db stats".to_string(),
            ..StatsConfig::default()
        }
    }

    #[tokio::test]
    async fn test_loading_user_aggregates() {
        let collector = StatsCollector::spawn(&config());
        let stats = collector.handle();
        for ms in [10, 20, 30] {
            stats.record("loading User", Duration::from_millis(ms));
        }
        collector.flush().await;

        let stat = collector.stat("loading User").unwrap();
        assert_eq!(stat.count, 3);
        assert_eq!(stat.min, Duration::from_millis(10));
        assert_eq!(stat.max, Duration::from_millis(30));
        assert_eq!(stat.sum, Duration::from_millis(60));
        assert_eq!(stat.avg, Duration::from_millis(20));
        collector.shutdown().await;
    }

    #[tokio::test]
    async fn test_report_format_and_ordering() {
        let collector = StatsCollector::spawn(&StatsConfig {
            top: 2,
            ..config()
        });
        let stats = collector.handle();
        stats.record("fast", Duration::from_millis(1));
        stats.record("slow", Duration::from_millis(30));
        stats.record("medium", Duration::from_millis(10));
        collector.flush().await;

        let report = collector.report();
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines[0], "DB STATS (avg/min/max/count):");
        assert_eq!(lines.len(), 3);
        assert!(lines[1].ends_with("  slow"));
        assert!(lines[1].contains("30.000ms/30.000ms/30.000ms/n=1"));
        assert!(lines[2].ends_with("  medium"));
        assert!(!report.contains("fast"));

        let snapshot = collector.snapshot();
        assert_eq!(snapshot[0].descriptor, "slow");
        assert_eq!(snapshot[2].descriptor, "fast");
        collector.shutdown().await;
    }

    #[tokio::test]
    async fn test_report_and_reset() {
        let collector = StatsCollector::spawn(&config());
        collector.handle().record("q", Duration::from_millis(5));
        collector.flush().await;

        let report = collector.report_and_reset();
        assert!(report.contains("  q"));
        assert_eq!(collector.last_report(), report);
        assert!(collector.snapshot().is_empty());
        assert_eq!(collector.report(), "DB STATS (avg/min/max/count):\nempty\n");
        collector.shutdown().await;
    }

    #[tokio::test]
    async fn test_reset_threshold_bounds_memory() {
        let collector = StatsCollector::spawn(&StatsConfig {
            warn_threshold: 2,
            reset_threshold: 3,
            ..config()
        });
        let stats = collector.handle();
        for n in 0..5 {
            stats.record(format!("d{}", n), Duration::from_millis(1));
        }
        collector.flush().await;

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].descriptor, "d4");
        assert!(collector.last_report().contains("d3"));
        collector.shutdown().await;
    }

    #[tokio::test]
    async fn test_reporter_runs_on_schedule() {
        let collector = StatsCollector::spawn_with_schedule(
            &config(),
            vec![Duration::from_millis(100)],
            Duration::from_secs(3600),
        );
        collector.handle().record("scheduled", Duration::from_millis(2));
        collector.flush().await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(collector.last_report().contains("scheduled"));
        assert!(collector.snapshot().is_empty());
        collector.shutdown().await;
    }

    #[tokio::test]
    async fn test_timer_records_on_drop() {
        let collector = StatsCollector::spawn(&config());
        {
            let _timer = collector.handle().timer("creating User");
        }
        collector.flush().await;
        assert_eq!(collector.stat("creating User").map(|s| s.count), Some(1));
        collector.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_consumer() {
        let collector = StatsCollector::spawn(&config());
        let stats = collector.handle();
        collector.shutdown().await;
        assert!(collector.is_stopped());

        stats.record("after shutdown", Duration::from_millis(1));
        stats.flush().await;
        assert!(collector.stat("after shutdown").is_none());
    }

    #[tokio::test]
    async fn test_disabled_config_starts_nothing() {
        let collector = StatsCollector::spawn(&StatsConfig {
            enabled: false,
            ..config()
        });
        let stats = collector.handle();
        assert!(!stats.is_enabled());

        stats.record("x", Duration::from_millis(5));
        drop(stats.timer("y"));
        collector.flush().await;
        assert_eq!(collector.stat("x"), None);
        assert!(collector.snapshot().is_empty());
        assert_eq!(collector.report(), "DB STATS (avg/min/max/count):\nempty\n");
        collector.shutdown().await;
    }

    #[tokio::test]
    async fn test_disabled_handle_is_noop() {
        let stats = StatsHandle::disabled();
        assert!(!stats.is_enabled());
        stats.record("anything", Duration::from_millis(1));
        stats.flush().await;
        drop(stats.timer("timed"));
    }
}
