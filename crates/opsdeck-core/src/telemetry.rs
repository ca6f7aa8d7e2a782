//! Telemetry bus: non-blocking publish, one dispatch loop, filtered fan-out.
//!
//! Producers on any thread call [`TelemetryBus::publish`], which only enqueues.
//! A single dispatch task dequeues in FIFO order, applies the [`DisplayPolicy`]
//! and hands each admitted record to every subscriber in turn.

use std::{
    collections::VecDeque,
    fmt,
    panic::{self, AssertUnwindSafe},
    str::FromStr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::metrics::SystemSnapshot;

/// Default number of delivered records kept for [`TelemetryBus::recent`].
const HISTORY_LIMIT: usize = 1000;

/// Severity, ordered `Trace < Debug < Info < Warning < Error < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for TelemetryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        })
    }
}

/// Unknown level name.
#[derive(Debug, thiserror::Error)]
#[error("unknown telemetry level: {0}")]
pub struct ParseLevelError(String);

impl FromStr for TelemetryLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" | "fatal" => Ok(Self::Critical),
            other => Err(ParseLevelError(other.to_string())),
        }
    }
}

/// One telemetry event. Ephemeral; the bus keeps only a bounded history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub level: TelemetryLevel,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub source: String,
    /// Host metrics, present on records emitted by the system sampler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<SystemSnapshot>,
}

impl TelemetryRecord {
    /// Create a record stamped with the current time.
    #[must_use]
    pub fn new(level: TelemetryLevel, message: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            level,
            timestamp: Utc::now(),
            message: message.into(),
            source: source.into(),
            metrics: None,
        }
    }

    /// Attach a metrics snapshot.
    #[must_use]
    pub fn with_metrics(mut self, metrics: SystemSnapshot) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Which records reach subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayPolicy {
    threshold: TelemetryLevel,
    /// Lowercased; OR-combined.
    keywords: Vec<String>,
}

impl DisplayPolicy {
    /// Create a policy.
    #[must_use]
    pub fn new<I, S>(threshold: TelemetryLevel, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut policy = Self {
            threshold,
            keywords: Vec::new(),
        };
        policy.set_keywords(keywords);
        policy
    }

    fn set_keywords<I, S>(&mut self, keywords: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.keywords = keywords
            .into_iter()
            .map(|k| k.as_ref().trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
    }

    /// Level at or above threshold, and (if any keywords) one keyword matches.
    #[must_use]
    pub fn admits(&self, record: &TelemetryRecord) -> bool {
        if record.level < self.threshold {
            return false;
        }
        if self.keywords.is_empty() {
            return true;
        }
        let message = record.message.to_lowercase();
        self.keywords.iter().any(|k| message.contains(k.as_str()))
    }

    #[must_use]
    pub const fn threshold(&self) -> TelemetryLevel {
        self.threshold
    }

    #[must_use]
    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }
}

/// Bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Minimum level delivered to subscribers.
    pub threshold: TelemetryLevel,
    /// Keyword filters; empty means no keyword filtering.
    pub keywords: Vec<String>,
    /// Records waiting in the queue beyond this are dropped. `None` is unbounded.
    pub queue_capacity: Option<usize>,
    /// Delivered records kept for [`TelemetryBus::recent`].
    pub history_limit: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            threshold: TelemetryLevel::Info,
            keywords: Vec::new(),
            queue_capacity: None,
            history_limit: HISTORY_LIMIT,
        }
    }
}

/// Handle returned by [`TelemetryBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub filtered: u64,
    pub dropped: u64,
    pub subscriber_failures: u64,
}

type Callback = Arc<dyn Fn(&TelemetryRecord) + Send + Sync>;

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    filtered: AtomicU64,
    dropped: AtomicU64,
    subscriber_failures: AtomicU64,
}

struct Inner {
    policy: RwLock<DisplayPolicy>,
    subscribers: RwLock<Vec<(SubscriptionId, Callback)>>,
    history: Mutex<VecDeque<TelemetryRecord>>,
    history_limit: usize,
    queue_capacity: Option<usize>,
    pending: AtomicUsize,
    counters: Counters,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Thread-safe telemetry bus. Cheap to clone; clones share one queue.
///
/// The dispatch task ends once every handle (including publishers) is
/// dropped and the queue is drained.
#[derive(Clone)]
pub struct TelemetryBus {
    inner: Arc<Inner>,
    tx: mpsc::UnboundedSender<TelemetryRecord>,
}

impl fmt::Debug for TelemetryBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryBus")
            .field("policy", &*read(&self.inner.policy))
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl TelemetryBus {
    /// Create the bus and spawn its dispatch task.
    ///
    /// Must be called from within a Tokio runtime. Publishing works from any
    /// thread afterwards.
    #[must_use]
    pub fn spawn(config: BusConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            policy: RwLock::new(DisplayPolicy::new(config.threshold, &config.keywords)),
            subscribers: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::with_capacity(32)),
            history_limit: config.history_limit,
            queue_capacity: config.queue_capacity,
            pending: AtomicUsize::new(0),
            counters: Counters::default(),
            shutdown: CancellationToken::new(),
            dispatcher: Mutex::new(None),
        });

        let handle = tokio::spawn(dispatch_loop(Arc::clone(&inner), rx));
        *lock(&inner.dispatcher) = Some(handle);

        Self { inner, tx }
    }

    /// Enqueue a record. Never blocks.
    pub fn publish(&self, level: TelemetryLevel, message: impl Into<String>, source: impl Into<String>) {
        self.publish_record(TelemetryRecord::new(level, message, source));
    }

    /// Enqueue a prepared record. Never blocks.
    pub fn publish_record(&self, record: TelemetryRecord) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let queued = inner.pending.fetch_add(1, Ordering::AcqRel);
        if inner.queue_capacity.is_some_and(|cap| queued >= cap) {
            inner.pending.fetch_sub(1, Ordering::AcqRel);
            inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if self.tx.send(record).is_err() {
            inner.pending.fetch_sub(1, Ordering::AcqRel);
            inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        inner.counters.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Publisher bound to a fixed source tag.
    #[must_use]
    pub fn publisher(&self, source: impl Into<String>) -> TelemetryPublisher {
        TelemetryPublisher {
            bus: self.clone(),
            source: Arc::from(source.into()),
        }
    }

    /// Register a callback for every admitted record.
    ///
    /// Callbacks run on the dispatch task and should return quickly; a
    /// panicking callback is isolated and counted.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&TelemetryRecord) + Send + Sync + 'static,
    {
        let id = SubscriptionId(Uuid::new_v4());
        write(&self.inner.subscribers).push((id, Arc::new(callback)));
        id
    }

    /// Subscribe by handing admitted records to an unbounded channel.
    #[must_use]
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<TelemetryRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |record| {
            let _ = tx.send(record.clone());
        });
        (id, rx)
    }

    /// Remove a subscriber. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = write(&self.inner.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn set_level_threshold(&self, level: TelemetryLevel) {
        write(&self.inner.policy).threshold = level;
    }

    #[must_use]
    pub fn level_threshold(&self) -> TelemetryLevel {
        read(&self.inner.policy).threshold
    }

    /// Replace the keyword filters. An empty list disables keyword filtering.
    pub fn set_keyword_filters<I, S>(&self, words: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        write(&self.inner.policy).set_keywords(words);
    }

    pub fn clear_keyword_filters(&self) {
        write(&self.inner.policy).keywords.clear();
    }

    /// Current display policy.
    #[must_use]
    pub fn policy(&self) -> DisplayPolicy {
        read(&self.inner.policy).clone()
    }

    /// The most recent delivered records, oldest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<TelemetryRecord> {
        let history = lock(&self.inner.history);
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    #[must_use]
    pub fn stats(&self) -> BusStats {
        let c = &self.inner.counters;
        BusStats {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            filtered: c.filtered.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            subscriber_failures: c.subscriber_failures.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
    }

    /// Stop accepting records, drain the queue and wait for the dispatcher.
    ///
    /// Returns `false` if the dispatcher did not finish within `timeout`; it
    /// is aborted in that case.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.inner.shutdown.cancel();
        let Some(mut handle) = lock(&self.inner.dispatcher).take() else {
            return true;
        };
        if tokio::time::timeout(timeout, &mut handle).await.is_ok() {
            true
        } else {
            tracing::warn!(?timeout, "Telemetry dispatcher did not drain in time");
            handle.abort();
            false
        }
    }
}

impl Inner {
    fn deliver(&self, record: TelemetryRecord) {
        self.pending.fetch_sub(1, Ordering::AcqRel);

        if !read(&self.policy).admits(&record) {
            self.counters.filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        {
            let mut history = lock(&self.history);
            if self.history_limit > 0 {
                while history.len() >= self.history_limit {
                    history.pop_front();
                }
                history.push_back(record.clone());
            }
        }

        // Snapshot so callbacks never run under the subscriber lock.
        let callbacks: Vec<(SubscriptionId, Callback)> = read(&self.subscribers)
            .iter()
            .map(|(id, cb)| (*id, Arc::clone(cb)))
            .collect();

        for (id, callback) in callbacks {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(&record))).is_err() {
                self.counters.subscriber_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(subscription = %id, "Telemetry subscriber panicked");
            }
        }
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

async fn dispatch_loop(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<TelemetryRecord>) {
    loop {
        tokio::select! {
            biased;
            () = inner.shutdown.cancelled() => {
                while let Ok(record) = rx.try_recv() {
                    inner.deliver(record);
                }
                break;
            }
            next = rx.recv() => match next {
                Some(record) => inner.deliver(record),
                None => break,
            },
        }
    }
    tracing::debug!("Telemetry dispatcher stopped");
}

/// Publisher with a fixed source tag.
#[derive(Debug, Clone)]
pub struct TelemetryPublisher {
    bus: TelemetryBus,
    source: Arc<str>,
}

impl TelemetryPublisher {
    pub fn publish(&self, level: TelemetryLevel, message: impl Into<String>) {
        self.bus.publish(level, message, self.source.as_ref());
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.publish(TelemetryLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.publish(TelemetryLevel::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.publish(TelemetryLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.publish(TelemetryLevel::Error, message);
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub const fn bus(&self) -> &TelemetryBus {
        &self.bus
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}
