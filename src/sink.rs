//! Bounded batching sink.
//!
//! Records are appended to an in-memory buffer and written to a downstream
//! [`BatchWriter`] in one call per batch. A batch is cut when the buffer
//! reaches its capacity, when [`BoundedBatchSink::flush`] is called, on an
//! optional interval, and once more by [`BoundedBatchSink::drain`] at
//! shutdown.
//!
//! `append` never blocks: a size-triggered batch is swapped out under the
//! lock and written on a spawned tokio task, so records arriving while a
//! write is in flight land in the fresh buffer.

use std::error::Error;
use std::future::Future;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Boxed error returned by downstream writers.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Default number of records per batch.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Default bound on retained records, in batches of `capacity`.
const DEFAULT_REQUEUE_BATCHES: usize = 10;

/// Downstream store that accepts whole batches.
///
/// Implementations return the number of records the store accepted.
pub trait BatchWriter<R>: Send + Sync + 'static {
    fn write_batch(&self, records: &[R]) -> impl Future<Output = Result<usize, BoxError>> + Send;
}

/// What happens to a batch whose write failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Log the failure and discard the batch.
    #[default]
    Drop,

    /// Keep the batch and send it again, ahead of newer records, with the
    /// next flush. Bounded by [`SinkConfig::max_requeued`].
    Requeue,
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(FailurePolicy::Drop),
            "requeue" => Ok(FailurePolicy::Requeue),
            other => Err(format!("unknown failure policy '{}'", other)),
        }
    }
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::Drop => write!(f, "drop"),
            FailurePolicy::Requeue => write!(f, "requeue"),
        }
    }
}

/// Configuration for a sink.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Number of pending records that triggers a flush
    pub capacity: usize,

    /// Optional interval for flushing a non-empty buffer
    pub flush_interval: Option<Duration>,

    /// Handling of batches the writer rejected
    pub failure_policy: FailurePolicy,

    /// Most records retained under the requeue policy; failed runs beyond
    /// this are dropped
    pub max_requeued: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            flush_interval: None,
            failure_policy: FailurePolicy::Drop,
            max_requeued: DEFAULT_CAPACITY * DEFAULT_REQUEUE_BATCHES,
        }
    }
}

impl SinkConfig {
    /// Create a config with the given capacity and the default drop policy.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            max_requeued: capacity.saturating_mul(DEFAULT_REQUEUE_BATCHES),
            ..Self::default()
        }
    }

    pub fn with_flush_interval(mut self, every: Duration) -> Self {
        self.flush_interval = Some(every);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_max_requeued(mut self, records: usize) -> Self {
        self.max_requeued = records;
        self
    }
}

/// Lifecycle of a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    /// Accepting records, no write outstanding
    Idle,

    /// At least one asynchronous write is in flight
    FlushTriggered,

    /// Shutdown started; appends are rejected while in-flight writes and
    /// the final flush complete
    Draining,

    /// Final flush done
    Closed,
}

/// What cut a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Interval,
    Manual,
    Drain,
}

impl std::fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlushTrigger::Size => write!(f, "size"),
            FlushTrigger::Interval => write!(f, "interval"),
            FlushTrigger::Manual => write!(f, "manual"),
            FlushTrigger::Drain => write!(f, "drain"),
        }
    }
}

/// Statistics about sink operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkStats {
    /// Records accepted by `append`
    pub records_received: u64,

    /// Records the writer reported as written
    pub records_flushed: u64,

    /// Records lost to failed writes, including a failed final drain and
    /// runs over the requeue limit
    pub records_dropped: u64,

    /// Records kept after a failed write under the requeue policy
    pub records_requeued: u64,

    /// Records appended once the sink was draining or closed
    pub records_rejected: u64,

    pub size_flushes: u64,
    pub interval_flushes: u64,
    pub manual_flushes: u64,
    pub drain_flushes: u64,

    /// Writes that returned an error
    pub failed_flushes: u64,
}

/// A downstream write failed.
#[derive(Debug)]
pub struct FlushError {
    /// What cut the batch
    pub trigger: FlushTrigger,

    /// Number of records in the failed batch
    pub batch_len: usize,

    /// Whether any of the batch was kept for another attempt
    pub requeued: bool,

    /// Error reported by the writer
    pub source: BoxError,
}

impl std::fmt::Display for FlushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} flush of {} records failed: {}",
            self.trigger, self.batch_len, self.source
        )
    }
}

impl Error for FlushError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.source.as_ref())
    }
}

struct Inner<R> {
    pending: Vec<R>,

    /// Failed batches kept for another attempt, keyed by cut sequence
    retained: BTreeMap<u64, Vec<R>>,
    retained_len: usize,
    next_seq: u64,

    state: SinkState,
    stats: SinkStats,
}

/// Records cut for one write.
///
/// `segments` holds the cut sequence and length of each run of records, so
/// a failed batch can be split back into the runs it was built from.
struct Batch<R> {
    records: Vec<R>,
    segments: Vec<(u64, usize)>,
}

impl<R> Batch<R> {
    fn len(&self) -> usize {
        self.records.len()
    }

    fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

struct Shared<R, W> {
    writer: W,
    config: SinkConfig,
    inner: Mutex<Inner<R>>,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Batching buffer in front of a [`BatchWriter`].
///
/// Cloning yields another handle to the same buffer.
///
/// # Example
///
/// ```no_run
/// use broker_sink_bridge::sink::{BatchWriter, BoundedBatchSink, BoxError, SinkConfig};
///
/// struct Stdout;
///
/// impl BatchWriter<String> for Stdout {
///     async fn write_batch(&self, records: &[String]) -> Result<usize, BoxError> {
///         for r in records {
///             println!("{}", r);
///         }
///         Ok(records.len())
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     let sink = BoundedBatchSink::new(SinkConfig::new(3), Stdout);
///     sink.append("a".to_string());
///     sink.drain().await.ok();
/// }
/// ```
pub struct BoundedBatchSink<R, W> {
    shared: Arc<Shared<R, W>>,
}

impl<R, W> Clone for BoundedBatchSink<R, W> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<R, W> BoundedBatchSink<R, W>
where
    R: Send + Sync + 'static,
    W: BatchWriter<R>,
{
    pub fn new(config: SinkConfig, writer: W) -> Self {
        let capacity = config.capacity.max(1);
        let config = SinkConfig { capacity, ..config };

        Self {
            shared: Arc::new(Shared {
                writer,
                inner: Mutex::new(Inner {
                    pending: Vec::with_capacity(capacity),
                    retained: BTreeMap::new(),
                    retained_len: 0,
                    next_seq: 0,
                    state: SinkState::Idle,
                    stats: SinkStats::default(),
                }),
                config,
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Append a record.
    ///
    /// Once `capacity` new records are pending, the buffer is swapped out
    /// together with any retained batches and written on a spawned task, so
    /// this must be called from within a tokio runtime. Records appended
    /// after `drain` has started are rejected.
    pub fn append(&self, record: R) {
        let batch = {
            let mut inner = self.lock();

            match inner.state {
                SinkState::Draining | SinkState::Closed => {
                    inner.stats.records_rejected += 1;
                    warn!(state = ?inner.state, "Sink is shutting down, record rejected");
                    return;
                }
                SinkState::Idle | SinkState::FlushTriggered => {}
            }

            inner.pending.push(record);
            inner.stats.records_received += 1;

            if inner.pending.len() < self.shared.config.capacity {
                return;
            }

            inner.stats.size_flushes += 1;
            inner.state = SinkState::FlushTriggered;
            debug!(
                batch_size = inner.pending.len(),
                retained = inner.retained_len,
                "Flushing sink: capacity reached"
            );
            self.begin_flight();
            Self::take_batch(&mut inner)
        };

        self.spawn_write(batch, FlushTrigger::Size);
    }

    /// Write everything currently pending and wait for the result.
    ///
    /// Does nothing once the sink is draining; the drain owns the final batch.
    pub async fn flush(&self) -> Result<usize, FlushError> {
        let batch = {
            let mut inner = self.lock();
            if inner.state == SinkState::Draining || inner.state == SinkState::Closed {
                return Ok(0);
            }
            if inner.pending.is_empty() && inner.retained.is_empty() {
                return Ok(0);
            }
            inner.stats.manual_flushes += 1;
            inner.state = SinkState::FlushTriggered;
            self.begin_flight();
            Self::take_batch(&mut inner)
        };

        let result = self.write(batch, FlushTrigger::Manual).await;
        self.end_flight();
        result
    }

    /// Flush the remainder at shutdown and close the sink.
    ///
    /// Appends are rejected from here on. Waits for every in-flight write
    /// before cutting the final batch, which also takes any retained
    /// batches. A failed final write is counted as dropped whatever the
    /// failure policy. A second call returns `Ok(0)`.
    pub async fn drain(&self) -> Result<usize, FlushError> {
        {
            let mut inner = self.lock();
            if inner.state == SinkState::Closed {
                return Ok(0);
            }
            inner.state = SinkState::Draining;
        }

        info!(
            in_flight = self.in_flight(),
            pending = self.len(),
            "Draining sink"
        );
        self.wait_idle().await;

        let batch = {
            let mut inner = self.lock();
            if !inner.pending.is_empty() || !inner.retained.is_empty() {
                inner.stats.drain_flushes += 1;
            }
            Self::take_batch(&mut inner)
        };

        let result = self.write(batch, FlushTrigger::Drain).await;

        self.lock().state = SinkState::Closed;
        result
    }

    /// Spawn a task that flushes a non-empty buffer every `every`.
    ///
    /// Retained batches count as non-empty, so this is also what retries
    /// them between size flushes. The task ends once the sink starts
    /// draining.
    pub fn spawn_interval_flush(&self, every: Duration) -> JoinHandle<()> {
        let sink = self.clone();

        tokio::spawn(async move {
            let mut ticker = interval(every);
            // Skip the first immediate tick
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let batch = {
                    let mut inner = sink.lock();
                    match inner.state {
                        SinkState::Draining | SinkState::Closed => break,
                        _ => {}
                    }
                    if inner.pending.is_empty() && inner.retained.is_empty() {
                        continue;
                    }
                    inner.stats.interval_flushes += 1;
                    inner.state = SinkState::FlushTriggered;
                    debug!(
                        batch_size = inner.pending.len(),
                        retained = inner.retained_len,
                        interval_secs = every.as_secs(),
                        "Flushing sink: interval elapsed"
                    );
                    sink.begin_flight();
                    Self::take_batch(&mut inner)
                };

                sink.spawn_write(batch, FlushTrigger::Interval);
            }
        })
    }

    /// Number of records the next flush would take, retained ones included.
    pub fn len(&self) -> usize {
        let inner = self.lock();
        inner.pending.len() + inner.retained_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records kept from failed writes under the requeue policy.
    pub fn retained(&self) -> usize {
        self.lock().retained_len
    }

    pub fn state(&self) -> SinkState {
        self.lock().state
    }

    /// Writes spawned or awaited that have not resolved yet.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SinkStats {
        self.lock().stats.clone()
    }

    pub fn config(&self) -> &SinkConfig {
        &self.shared.config
    }

    pub fn writer(&self) -> &W {
        &self.shared.writer
    }

    fn lock(&self) -> MutexGuard<'_, Inner<R>> {
        // A panic while holding the lock leaves the buffer itself consistent
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cut retained batches in sequence order followed by the pending
    /// records, which get the next sequence number.
    fn take_batch(inner: &mut Inner<R>) -> Batch<R> {
        let mut records = Vec::with_capacity(inner.retained_len + inner.pending.len());
        let mut segments = Vec::with_capacity(inner.retained.len() + 1);

        for (seq, mut run) in std::mem::take(&mut inner.retained) {
            segments.push((seq, run.len()));
            records.append(&mut run);
        }
        inner.retained_len = 0;

        if !inner.pending.is_empty() {
            let seq = inner.next_seq;
            inner.next_seq += 1;
            segments.push((seq, inner.pending.len()));
            records.append(&mut inner.pending);
        }

        Batch { records, segments }
    }

    /// Put the runs of a failed batch back by sequence, up to
    /// `max_requeued` retained records. Returns (requeued, dropped).
    fn retain(&self, inner: &mut Inner<R>, batch: Batch<R>) -> (usize, usize) {
        let limit = self.shared.config.max_requeued;
        let mut records = batch.records.into_iter();
        let (mut requeued, mut dropped) = (0, 0);

        for (seq, len) in batch.segments {
            let run: Vec<R> = records.by_ref().take(len).collect();
            if inner.retained_len + len <= limit {
                inner.retained_len += len;
                inner.retained.insert(seq, run);
                requeued += len;
            } else {
                dropped += len;
            }
        }

        (requeued, dropped)
    }

    /// Write `batch` on a spawned task. The caller has already counted it
    /// with `begin_flight` while holding the lock.
    fn spawn_write(&self, batch: Batch<R>, trigger: FlushTrigger) {
        let sink = self.clone();

        tokio::spawn(async move {
            // Failures are already logged and counted by `write`
            let _ = sink.write(batch, trigger).await;
            sink.end_flight();
        });
    }

    /// Must be called with the lock held.
    fn begin_flight(&self) {
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    fn end_flight(&self) {
        let idle = {
            let mut inner = self.lock();
            let idle = self.shared.in_flight.fetch_sub(1, Ordering::SeqCst) == 1;
            if idle && inner.state == SinkState::FlushTriggered {
                inner.state = SinkState::Idle;
            }
            idle
        };

        if idle {
            self.shared.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    async fn write(&self, batch: Batch<R>, trigger: FlushTrigger) -> Result<usize, FlushError> {
        let batch_len = batch.len();
        if batch.is_empty() {
            return Ok(0);
        }

        match self.shared.writer.write_batch(&batch.records).await {
            Ok(written) => {
                self.lock().stats.records_flushed += written as u64;
                info!(
                    trigger = %trigger,
                    batch_size = batch_len,
                    written = written,
                    "Flushed batch"
                );
                Ok(written)
            }
            Err(source) => {
                let keep = self.shared.config.failure_policy == FailurePolicy::Requeue
                    && trigger != FlushTrigger::Drain;

                let (requeued, dropped) = {
                    let mut inner = self.lock();
                    inner.stats.failed_flushes += 1;

                    let (requeued, dropped) = if keep {
                        self.retain(&mut inner, batch)
                    } else {
                        (0, batch_len)
                    };
                    inner.stats.records_requeued += requeued as u64;
                    inner.stats.records_dropped += dropped as u64;
                    (requeued, dropped)
                };

                error!(
                    trigger = %trigger,
                    batch_size = batch_len,
                    requeued = requeued,
                    dropped = dropped,
                    error = %source,
                    "Failed to flush batch"
                );
                if keep && dropped > 0 {
                    warn!(
                        dropped = dropped,
                        max_requeued = self.shared.config.max_requeued,
                        "Requeue limit reached, records dropped"
                    );
                }

                Err(FlushError {
                    trigger,
                    batch_len,
                    requeued: requeued > 0,
                    source,
                })
            }
        }
    }
}
