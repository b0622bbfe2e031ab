//! Concurrency-limited, priority-ordered, coalescing task queue
//!
//! Named per-session tasks run under a small global concurrency ceiling.
//! Identical submissions share one execution through a cloned future;
//! re-submitting a pending key can only tighten its priority. Finished
//! tasks land in a bounded, newest-first history.

use crate::TaskError;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracelens_core::ItemKind;

/// Settled result of a queued task
pub type TaskOutcome = Result<Value, TaskError>;

/// Cloneable handle to a task's eventual outcome
///
/// Every submission sharing a key receives a clone of the same future;
/// dropping a clone never cancels the underlying task.
pub type TaskFuture = Shared<BoxFuture<'static, TaskOutcome>>;

/// The work a submission runs on promotion; receives the force-refresh flag
pub type TaskThunk = Box<dyn FnOnce(bool) -> BoxFuture<'static, TaskOutcome> + Send>;

/// Box a closure into a [`TaskThunk`]
pub fn task_thunk<F, Fut>(f: F) -> TaskThunk
where
    F: FnOnce(bool) -> Fut + Send + 'static,
    Fut: Future<Output = TaskOutcome> + Send + 'static,
{
    Box::new(move |force_refresh| f(force_refresh).boxed())
}

/// Scheduling priority
///
/// Two tiers are exposed; internally ordering is numeric (lower rank runs
/// first) so the mechanism generalizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    /// Interactive work; runs before any queued background work
    High,
    /// Background and prefetch work
    Low,
}

impl Priority {
    fn rank(self) -> u8 {
        match self {
            Self::High => 0,
            Self::Low => 10,
        }
    }

    fn label_for_rank(rank: u8) -> &'static str {
        if rank <= Self::High.rank() { "HIGH" } else { "LOW" }
    }
}

/// Options accepted by [`TaskQueue::submit`]
#[derive(Debug, Clone, Copy)]
pub struct SubmitOpts {
    /// Requested priority; an existing pending entry is only ever tightened
    pub priority: Priority,
    /// Passed through to the task body; the queue itself is cache-agnostic
    pub force_refresh: bool,
}

impl Default for SubmitOpts {
    fn default() -> Self {
        Self {
            priority: Priority::Low,
            force_refresh: false,
        }
    }
}

/// Identity of a queued task; the unit of deduplication
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct QueueKey {
    /// What kind of item the task runs
    pub kind: ItemKind,
    /// Project the session belongs to
    pub project: String,
    /// Session the task operates on
    pub session_id: String,
    /// Name of the registered item
    pub item_name: String,
}

impl QueueKey {
    /// Build a key from its four components
    #[must_use]
    pub fn new(
        kind: ItemKind,
        project: impl Into<String>,
        session_id: impl Into<String>,
        item_name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            project: project.into(),
            session_id: session_id.into(),
            item_name: item_name.into(),
        }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.kind, self.project, self.session_id, self.item_name
        )
    }
}

/// Queue tuning; the defaults match interactive use
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Global ceiling on simultaneously running tasks
    pub max_concurrent: usize,
    /// Completed-history retention
    pub history_cap: usize,
    /// Recent-errors retention
    pub errors_cap: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            history_cap: 100,
            errors_cap: 25,
        }
    }
}

/// A finished task, retained newest-first
#[derive(Debug, Clone, Serialize)]
pub struct CompletedEntry {
    /// Item kind
    pub kind: ItemKind,
    /// Project
    pub project: String,
    /// Session
    pub session_id: String,
    /// Item name
    pub item_name: String,
    /// Whether the task settled with a value
    pub success: bool,
    /// Failure text when it did not
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock run time
    pub duration_ms: u64,
    /// When the task settled
    pub completed_at: DateTime<Utc>,
}

/// A pending entry as reported by [`TaskQueue::status`]
#[derive(Debug, Clone, Serialize)]
pub struct PendingSnapshot {
    /// Item kind
    pub kind: ItemKind,
    /// Project
    pub project: String,
    /// Session
    pub session_id: String,
    /// Item name
    pub item_name: String,
    /// Resolved priority label ("HIGH" or "LOW")
    pub priority: String,
    /// When the entry was first enqueued
    pub enqueued_at: DateTime<Utc>,
}

/// A running entry as reported by [`TaskQueue::status`]
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingSnapshot {
    /// Item kind
    pub kind: ItemKind,
    /// Project
    pub project: String,
    /// Session
    pub session_id: String,
    /// Item name
    pub item_name: String,
    /// Priority label the entry was promoted with
    pub priority: String,
    /// When the task started running
    pub started_at: DateTime<Utc>,
}

/// Read-only queue snapshot, directly serializable
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    /// Pending entries in scheduling order
    pub pending: Vec<PendingSnapshot>,
    /// Currently running entries
    pub processing: Vec<ProcessingSnapshot>,
    /// Finished entries, newest first
    pub completed: Vec<CompletedEntry>,
    /// Whether the background drain loop is running
    pub background_running: bool,
    /// Recent failures, newest first
    pub recent_errors: Vec<CompletedEntry>,
}

/// Result of racing a submission against a deadline
#[derive(Debug, Clone)]
pub enum SubmitWait {
    /// The task settled within the deadline
    Settled(TaskOutcome),
    /// Still queued or running; the work was NOT cancelled
    StillQueued,
}

struct PendingEntry {
    rank: u8,
    seq: u64,
    enqueued_at: DateTime<Utc>,
    force_refresh: bool,
    thunk: TaskThunk,
    tx: oneshot::Sender<TaskOutcome>,
    future: TaskFuture,
}

struct ProcessingEntry {
    rank: u8,
    started_at: DateTime<Utc>,
    future: TaskFuture,
}

#[derive(Default)]
struct QueueState {
    next_seq: u64,
    /// Scheduling order: (rank, seq) ascending
    pending_order: BTreeMap<(u8, u64), QueueKey>,
    pending: HashMap<QueueKey, PendingEntry>,
    processing: HashMap<QueueKey, ProcessingEntry>,
    completed: VecDeque<CompletedEntry>,
    recent_errors: VecDeque<CompletedEntry>,
}

struct QueueInner {
    config: QueueConfig,
    state: Mutex<QueueState>,
    background_running: AtomicBool,
}

/// Concurrency-limited, priority-ordered, coalescing task queue
///
/// Cheap to clone; clones share the same queue. Tasks are spawned on the
/// ambient tokio runtime, so submissions must happen inside one.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    /// Create a queue with the given configuration
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                state: Mutex::new(QueueState::default()),
                background_running: AtomicBool::new(false),
            }),
        }
    }

    /// Create a queue with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(QueueConfig::default())
    }

    /// Submit a task, returning a future every identical submission shares
    ///
    /// - Key already running: the existing future is returned and `thunk`
    ///   is dropped unused.
    /// - Key pending: its priority is tightened to the stronger of current
    ///   and requested, and the existing future is returned.
    /// - Key absent: the task starts immediately when a concurrency slot is
    ///   free, otherwise it waits in priority order.
    pub fn submit(&self, key: QueueKey, thunk: TaskThunk, opts: SubmitOpts) -> TaskFuture {
        let requested = opts.priority.rank();
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        if let Some(running) = state.processing.get(&key) {
            tracing::debug!(key = %key, "coalesced onto running task");
            return running.future.clone();
        }

        if let Some(entry) = state.pending.get_mut(&key) {
            if requested < entry.rank {
                // Tighten in place: re-insert the ordering entry under the
                // new rank, keeping the original sequence for FIFO fairness.
                state.pending_order.remove(&(entry.rank, entry.seq));
                entry.rank = requested;
                state
                    .pending_order
                    .insert((entry.rank, entry.seq), key.clone());
                tracing::debug!(key = %key, "pending priority tightened");
            }
            return entry.future.clone();
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let (tx, rx) = oneshot::channel::<TaskOutcome>();
        let future: TaskFuture = rx
            .map(|settled| {
                settled.unwrap_or_else(|_| {
                    Err(TaskError::scheduling("task dropped before settling"))
                })
            })
            .boxed()
            .shared();
        let entry = PendingEntry {
            rank: requested,
            seq,
            enqueued_at: Utc::now(),
            force_refresh: opts.force_refresh,
            thunk,
            tx,
            future: future.clone(),
        };

        if state.processing.len() < self.inner.config.max_concurrent {
            QueueInner::start(&self.inner, state, key, entry);
        } else {
            state.pending_order.insert((requested, seq), key.clone());
            state.pending.insert(key, entry);
        }
        future
    }

    /// Submit and wait up to `deadline` for settlement
    ///
    /// A timeout means "still queued"; the underlying task keeps running and
    /// its result is still recorded in history.
    pub async fn submit_with_timeout(
        &self,
        key: QueueKey,
        thunk: TaskThunk,
        opts: SubmitOpts,
        deadline: Duration,
    ) -> SubmitWait {
        let future = self.submit(key, thunk, opts);
        match tokio::time::timeout(deadline, future).await {
            Ok(outcome) => SubmitWait::Settled(outcome),
            Err(_) => SubmitWait::StillQueued,
        }
    }

    /// Read-only snapshot of the queue
    #[must_use]
    pub fn status(&self) -> QueueStatus {
        let guard = self.inner.state.lock();
        let pending = guard
            .pending_order
            .iter()
            .filter_map(|(_, key)| {
                guard.pending.get(key).map(|entry| PendingSnapshot {
                    kind: key.kind,
                    project: key.project.clone(),
                    session_id: key.session_id.clone(),
                    item_name: key.item_name.clone(),
                    priority: Priority::label_for_rank(entry.rank).to_string(),
                    enqueued_at: entry.enqueued_at,
                })
            })
            .collect();
        let processing = guard
            .processing
            .iter()
            .map(|(key, entry)| ProcessingSnapshot {
                kind: key.kind,
                project: key.project.clone(),
                session_id: key.session_id.clone(),
                item_name: key.item_name.clone(),
                priority: Priority::label_for_rank(entry.rank).to_string(),
                started_at: entry.started_at,
            })
            .collect();
        QueueStatus {
            pending,
            processing,
            completed: guard.completed.iter().cloned().collect(),
            background_running: self.inner.background_running.load(Ordering::SeqCst),
            recent_errors: guard.recent_errors.iter().cloned().collect(),
        }
    }

    /// Start the periodic background drain, at most once per queue
    ///
    /// Each tick, `scan` enumerates known cache-miss work; everything it
    /// returns is submitted at LOW priority. Purely a prefetch optimization.
    /// Returns false when the loop was already running.
    pub fn start_background<S, Fut>(&self, interval: Duration, scan: S) -> bool
    where
        S: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<BackgroundTask>> + Send,
    {
        if self
            .inner
            .background_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("background processor already running");
            return false;
        }

        tracing::info!(interval_secs = interval.as_secs(), "background processor started");
        let queue = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately; skip it
            // so the loop drains on the configured cadence.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !queue.inner.background_running.load(Ordering::SeqCst) {
                    break;
                }
                let tasks = scan().await;
                if tasks.is_empty() {
                    continue;
                }
                tracing::debug!(submitted = tasks.len(), "background drain tick");
                for task in tasks {
                    queue.submit(
                        task.key,
                        task.thunk,
                        SubmitOpts {
                            priority: Priority::Low,
                            force_refresh: false,
                        },
                    );
                }
            }
        });
        true
    }

    /// Stop the background drain after its current tick
    pub fn stop_background(&self) {
        self.inner.background_running.store(false, Ordering::SeqCst);
    }
}

/// One unit of background work produced by a drain scan
pub struct BackgroundTask {
    /// Queue key the work runs under
    pub key: QueueKey,
    /// The work itself
    pub thunk: TaskThunk,
}

impl QueueInner {
    /// Promote an entry to PROCESSING and run it detached
    fn start(inner: &Arc<Self>, state: &mut QueueState, key: QueueKey, entry: PendingEntry) {
        state.processing.insert(
            key.clone(),
            ProcessingEntry {
                rank: entry.rank,
                started_at: Utc::now(),
                future: entry.future.clone(),
            },
        );

        let PendingEntry {
            thunk,
            tx,
            force_refresh,
            ..
        } = entry;
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let started = Instant::now();
            // The thunk is invoked inside the unwind guard so a panic in the
            // factory or the future settles this task instead of leaking its
            // concurrency slot.
            let outcome = AssertUnwindSafe(async move { thunk(force_refresh).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(TaskError::scheduling(format!("task '{key}' panicked")))
                });
            Self::complete(&inner, &key, &outcome, started.elapsed());
            // Settle attached callers after recording, so a caller that
            // awakes sees its task in the completed history.
            let _ = tx.send(outcome);
        });
    }

    /// Record a settlement, free the slot, and promote the next entry
    fn complete(inner: &Arc<Self>, key: &QueueKey, outcome: &TaskOutcome, elapsed: Duration) {
        let mut guard = inner.state.lock();
        let state = &mut *guard;
        state.processing.remove(key);

        let entry = CompletedEntry {
            kind: key.kind,
            project: key.project.clone(),
            session_id: key.session_id.clone(),
            item_name: key.item_name.clone(),
            success: outcome.is_ok(),
            error: outcome.as_ref().err().map(ToString::to_string),
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            completed_at: Utc::now(),
        };
        if entry.error.is_some() {
            tracing::warn!(key = %key, error = entry.error.as_deref().unwrap_or(""), "task failed");
            state.recent_errors.push_front(entry.clone());
            state.recent_errors.truncate(inner.config.errors_cap);
        }
        state.completed.push_front(entry);
        state.completed.truncate(inner.config.history_cap);

        // The slot is free; promote the strongest pending entry, if any.
        if state.processing.len() < inner.config.max_concurrent {
            let next = state.pending_order.keys().next().copied();
            if let Some(order_key) = next
                && let Some(promoted_key) = state.pending_order.remove(&order_key)
                && let Some(promoted) = state.pending.remove(&promoted_key)
            {
                Self::start(inner, state, promoted_key, promoted);
            }
        }
    }
}
