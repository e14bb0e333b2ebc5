//! Vector transfer orchestration.
//!
//! Moves batches of vectors between nodes under resource limits. Tasks wait
//! in a priority queue (higher priority first, creation time breaking
//! ties), at most `max_concurrent` run at once, and failures retry with
//! exponential backoff plus jitter. Large tasks split into sub-tasks that
//! run under a bounded semaphore and report progress independently, so the
//! coordinator can observe partial success.
//!
//! The wire itself is behind [`TransferExecutor`]; the in-memory
//! implementation connects two [`VectorStore`]s directly and is the
//! reference for single-process clusters and tests.

use crate::store::VectorStore;
use lattice_core::{now_nanos, LatticeError, NodeId, Vector, VectorId};
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

// =============================================================================
// Task model
// =============================================================================

/// Lifecycle state of a transfer task or sub-task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InProgress,
    Completed,
    Failed,
    Retrying,
}

impl TaskState {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Pending => "pending",
            TaskState::InProgress => "in_progress",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Retrying => "retrying",
        };
        write!(f, "{}", name)
    }
}

/// A segment of a larger transfer.
#[derive(Debug, Clone)]
pub struct SubTask {
    /// Segment identifier, derived from the parent task id.
    pub segment_id: String,
    /// First and last vector id of the slice.
    pub range: (VectorId, VectorId),
    /// Slice bounds into the parent's `vector_ids`.
    pub start: usize,
    pub end: usize,
    pub state: TaskState,
    pub bytes_moved: u64,
}

/// A planned movement of vectors from one node to another.
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub id: String,
    pub source: NodeId,
    pub dest: NodeId,
    /// Logical shard this movement belongs to.
    pub shard_id: String,
    /// Higher runs first.
    pub priority: i32,
    pub state: TaskState,
    pub vector_ids: Vec<VectorId>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Wall-clock nanoseconds since epoch.
    pub created_at: i64,
    pub updated_at: i64,
    pub sub_tasks: Vec<SubTask>,
    /// Set by cancellation; observed at sub-task boundaries.
    pub cancelled: bool,
    /// Deadline honored between sub-tasks.
    pub deadline: Option<Instant>,
}

impl TransferTask {
    /// Creates a pending task.
    pub fn new(
        source: NodeId,
        dest: NodeId,
        shard_id: impl Into<String>,
        vector_ids: Vec<VectorId>,
        priority: i32,
    ) -> Self {
        let now = now_nanos();
        Self {
            id: format!("task-{}", uuid::Uuid::new_v4()),
            source,
            dest,
            shard_id: shard_id.into(),
            priority,
            state: TaskState::Pending,
            vector_ids,
            attempt_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            sub_tasks: Vec::new(),
            cancelled: false,
            deadline: None,
        }
    }

    /// Attaches a deadline checked between sub-tasks.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Splits the task into `ceil(n / batch_size)` sub-tasks.
    ///
    /// No-op when the id list already fits in one batch.
    pub fn create_sub_tasks(&mut self, batch_size: usize) {
        if batch_size == 0 || self.vector_ids.len() <= batch_size {
            return;
        }

        let n = self.vector_ids.len();
        let batches = n.div_ceil(batch_size);
        self.sub_tasks = (0..batches)
            .map(|i| {
                let start = i * batch_size;
                let end = ((i + 1) * batch_size).min(n);
                SubTask {
                    segment_id: format!("{}-seg-{}", self.id, i),
                    range: (
                        self.vector_ids[start].clone(),
                        self.vector_ids[end - 1].clone(),
                    ),
                    start,
                    end,
                    state: TaskState::Pending,
                    bytes_moved: 0,
                }
            })
            .collect();
    }

    /// True once the task reached `completed` or `failed`.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

// =============================================================================
// Retry policy
// =============================================================================

/// Retry policy for failed transfers.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Failed attempts after which the task goes terminal.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    /// Jitter factor in `[0, 1]`; the delay is scaled by a uniform sample
    /// from `[1 - jitter/2, 1 + jitter/2]`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// Backoff before retrying after the `attempt`-th failure (1-based).
    ///
    /// `min(initial * multiplier^(attempt - 1), max)` scaled by the jitter
    /// sample, so the first retry waits roughly `initial`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exp as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());
        let jitter = 1.0 - self.jitter / 2.0 + rand::random::<f64>() * self.jitter;
        Duration::from_secs_f64(capped * jitter)
    }
}

// =============================================================================
// Wire contract
// =============================================================================

/// The transfer wire: stream one batch of vectors from source to
/// destination.
///
/// Returns the byte volume applied by the destination; any unreported
/// per-vector failure must surface as an `Err`, which the orchestrator
/// treats as a task failure.
pub trait TransferExecutor: Send + Sync {
    fn transfer(
        &self,
        source: &NodeId,
        dest: &NodeId,
        ids: &[VectorId],
    ) -> Result<u64, LatticeError>;
}

/// In-memory executor connecting co-resident stores.
///
/// Reads each id from the source store and applies the batch to the
/// destination via its receive path.
#[derive(Default)]
pub struct InMemoryExecutor {
    stores: RwLock<HashMap<NodeId, Arc<VectorStore>>>,
}

impl InMemoryExecutor {
    /// Creates an executor with no registered stores.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node's store.
    pub fn register(&self, node_id: NodeId, store: Arc<VectorStore>) {
        self.stores.write().insert(node_id, store);
    }
}

impl TransferExecutor for InMemoryExecutor {
    fn transfer(
        &self,
        source: &NodeId,
        dest: &NodeId,
        ids: &[VectorId],
    ) -> Result<u64, LatticeError> {
        let stores = self.stores.read();
        let source_store = stores
            .get(source)
            .ok_or_else(|| LatticeError::TransferFailed(format!("unknown source node {}", source)))?;
        let dest_store = stores
            .get(dest)
            .ok_or_else(|| LatticeError::TransferFailed(format!("unknown dest node {}", dest)))?;

        let mut batch: Vec<Vector> = Vec::with_capacity(ids.len());
        for id in ids {
            match source_store.get(id) {
                Ok(vector) => batch.push(vector),
                // Deleted mid-flight; nothing to move for this id.
                Err(LatticeError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        dest_store.receive_vectors(&batch)
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// State-change notification published for every task transition.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub task_id: String,
    pub state: TaskState,
    pub attempt: u32,
    pub error: Option<String>,
}

/// Counts of tasks per state plus queue/active occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TaskMetrics {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub retrying: usize,
    pub queue_len: usize,
    pub active: usize,
}

/// Queue key: priority descending, then creation time ascending, then id
/// for a total order.
struct QueueEntry {
    priority: i32,
    created_at: i64,
    task_id: String,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

struct TransferState {
    tasks: HashMap<String, TransferTask>,
    queue: BinaryHeap<QueueEntry>,
    active: usize,
}

/// Priority-queued, retrying transfer orchestrator.
pub struct TransferService {
    /// Self-handle for spawning worker tasks from `&self` methods.
    me: Weak<TransferService>,
    state: Mutex<TransferState>,
    retry: RetryConfig,
    /// Configured concurrency ceiling.
    configured_concurrency: usize,
    /// Effective ceiling; lowered by adaptive throttling.
    max_concurrent: AtomicUsize,
    max_sub_task_concurrency: usize,
    executor: Arc<dyn TransferExecutor>,
    events: broadcast::Sender<TaskEvent>,
}

impl TransferService {
    /// Creates an orchestrator draining at most `max_concurrent` tasks at a
    /// time, with the default sub-task concurrency of 10.
    pub fn new(
        retry: RetryConfig,
        max_concurrent: usize,
        executor: Arc<dyn TransferExecutor>,
    ) -> Arc<Self> {
        Self::with_limits(retry, max_concurrent, 10, executor)
    }

    /// Creates an orchestrator with explicit task and sub-task concurrency
    /// bounds.
    pub fn with_limits(
        retry: RetryConfig,
        max_concurrent: usize,
        max_sub_task_concurrency: usize,
        executor: Arc<dyn TransferExecutor>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let concurrency = max_concurrent.max(1);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            state: Mutex::new(TransferState {
                tasks: HashMap::new(),
                queue: BinaryHeap::new(),
                active: 0,
            }),
            retry,
            configured_concurrency: concurrency,
            max_concurrent: AtomicUsize::new(concurrency),
            max_sub_task_concurrency: max_sub_task_concurrency.max(1),
            executor,
            events,
        })
    }

    fn strong(&self) -> Option<Arc<Self>> {
        self.me.upgrade()
    }

    /// The effective concurrency ceiling, after any throttling.
    pub fn current_concurrency(&self) -> usize {
        self.max_concurrent.load(AtomicOrdering::Relaxed)
    }

    /// Halves the effective concurrency ceiling, to a floor of 1.
    pub fn throttle(&self) {
        let current = self.max_concurrent.load(AtomicOrdering::Relaxed);
        let halved = (current / 2).max(1);
        if halved < current {
            self.max_concurrent.store(halved, AtomicOrdering::Relaxed);
            warn!(previous = current, current = halved, "transfer concurrency throttled");
        }
    }

    /// Restores the configured concurrency ceiling and drains the queue.
    pub fn restore_concurrency(&self) {
        let current = self.max_concurrent.load(AtomicOrdering::Relaxed);
        if current < self.configured_concurrency {
            self.max_concurrent
                .store(self.configured_concurrency, AtomicOrdering::Relaxed);
            info!(
                current = self.configured_concurrency,
                "transfer concurrency restored"
            );
            self.process_queue();
        }
    }

    /// Subscribes to task state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Enqueues a task and drains the queue.
    pub fn queue_task(&self, task: TransferTask) -> String {
        let task_id = task.id.clone();
        {
            let mut state = self.state.lock();
            info!(
                task_id = %task_id,
                source = %task.source,
                dest = %task.dest,
                shard = %task.shard_id,
                vectors = task.vector_ids.len(),
                "queuing transfer task"
            );
            state.queue.push(QueueEntry {
                priority: task.priority,
                created_at: task.created_at,
                task_id: task_id.clone(),
            });
            state.tasks.insert(task_id.clone(), task);
        }
        self.process_queue();
        task_id
    }

    /// Starts as many queued tasks as the concurrency cap allows.
    fn process_queue(&self) {
        let mut to_start = Vec::new();
        let cap = self.current_concurrency();
        {
            let mut state = self.state.lock();
            while state.active < cap {
                let Some(entry) = state.queue.pop() else { break };
                // Entries for cancelled or already-terminal tasks are stale;
                // skip them.
                let runnable = state
                    .tasks
                    .get(&entry.task_id)
                    .map(|t| {
                        !t.cancelled
                            && matches!(t.state, TaskState::Pending | TaskState::Retrying)
                    })
                    .unwrap_or(false);
                if !runnable {
                    continue;
                }
                state.active += 1;
                to_start.push(entry.task_id);
            }
            if !state.queue.is_empty() {
                debug!(remaining = state.queue.len(), "tasks remaining in queue");
            }
        }

        let Some(service) = self.strong() else { return };
        for task_id in to_start {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service.execute(task_id).await;
            });
        }
    }

    async fn execute(self: Arc<Self>, task_id: String) {
        // Pickup: pending/retrying -> in-progress.
        let snapshot = {
            let mut state = self.state.lock();
            let Some(task) = state.tasks.get_mut(&task_id) else {
                state.active -= 1;
                return;
            };
            if task.cancelled || task.is_terminal() {
                state.active -= 1;
                return;
            }
            task.state = TaskState::InProgress;
            task.attempt_count += 1;
            task.updated_at = now_nanos();
            let snapshot = task.clone();
            self.emit(&snapshot);
            snapshot
        };

        info!(
            task_id = %task_id,
            attempt = snapshot.attempt_count,
            max = self.retry.max_retries + 1,
            "executing transfer task"
        );

        let outcome = if snapshot.sub_tasks.is_empty() {
            self.run_single(&snapshot)
        } else {
            self.run_sub_tasks(&snapshot).await
        };

        // Settle: completed, retrying, or failed.
        let retry_after = {
            let mut state = self.state.lock();
            let Some(task) = state.tasks.get_mut(&task_id) else {
                state.active -= 1;
                return;
            };

            let mut retry_after = None;
            if task.cancelled {
                // Cancellation already set the terminal state.
            } else {
                match outcome {
                    Ok(bytes) => {
                        task.state = TaskState::Completed;
                        info!(task_id = %task_id, bytes, "transfer task completed");
                    }
                    Err(reason) => {
                        task.last_error = Some(reason.clone());
                        if task.attempt_count <= self.retry.max_retries {
                            task.state = TaskState::Retrying;
                            let backoff = self.retry.backoff_for_attempt(task.attempt_count);
                            warn!(
                                task_id = %task_id,
                                backoff_ms = backoff.as_millis() as u64,
                                error = %reason,
                                "transfer task failed, retrying"
                            );
                            retry_after = Some(backoff);
                        } else {
                            task.state = TaskState::Failed;
                            error!(
                                task_id = %task_id,
                                attempts = task.attempt_count,
                                error = %reason,
                                "transfer task failed permanently"
                            );
                        }
                    }
                }
                task.updated_at = now_nanos();
                let snapshot = task.clone();
                self.emit(&snapshot);
            }
            state.active -= 1;
            retry_after
        };

        if let Some(backoff) = retry_after {
            let service = Arc::clone(&self);
            let task_id = task_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                service.requeue(task_id);
            });
        }

        self.process_queue();
    }

    /// Pushes a retrying task back onto the queue after its backoff.
    fn requeue(&self, task_id: String) {
        {
            let mut state = self.state.lock();
            let Some(task) = state.tasks.get(&task_id) else { return };
            if task.cancelled || task.state != TaskState::Retrying {
                return;
            }
            let entry = QueueEntry {
                priority: task.priority,
                created_at: task.created_at,
                task_id: task_id.clone(),
            };
            state.queue.push(entry);
        }
        self.process_queue();
    }

    fn run_single(&self, task: &TransferTask) -> Result<u64, String> {
        self.executor
            .transfer(&task.source, &task.dest, &task.vector_ids)
            .map_err(|e| e.to_string())
    }

    /// Runs every non-completed sub-task under the sub-task semaphore.
    ///
    /// Cancellation and deadlines are observed between sub-tasks; an
    /// in-flight segment runs to completion.
    async fn run_sub_tasks(&self, task: &TransferTask) -> Result<u64, String> {
        let Some(this) = self.strong() else {
            return Err("transfer service shutting down".to_string());
        };
        let semaphore = Arc::new(Semaphore::new(self.max_sub_task_concurrency));
        let mut handles = Vec::new();

        for (i, sub) in task.sub_tasks.iter().enumerate() {
            if sub.state == TaskState::Completed {
                continue;
            }

            let interrupted = {
                let state = self.state.lock();
                let current = state.tasks.get(&task.id);
                let cancelled = current.map(|t| t.cancelled).unwrap_or(true);
                let expired = task
                    .deadline
                    .map(|d| Instant::now() >= d)
                    .unwrap_or(false);
                cancelled || expired
            };
            if interrupted {
                break;
            }

            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|_| "sub-task semaphore closed".to_string())?;
            let service = Arc::clone(&this);
            let task_id = task.id.clone();
            let source = task.source.clone();
            let dest = task.dest.clone();
            let ids: Vec<VectorId> = task.vector_ids[sub.start..sub.end].to_vec();
            let segment_id = sub.segment_id.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                debug!(segment = %segment_id, "executing sub-task");
                service.set_sub_task_state(&task_id, i, TaskState::InProgress, 0);
                match service.executor.transfer(&source, &dest, &ids) {
                    Ok(bytes) => {
                        service.set_sub_task_state(&task_id, i, TaskState::Completed, bytes);
                        Ok(bytes)
                    }
                    Err(e) => {
                        warn!(segment = %segment_id, error = %e, "sub-task failed");
                        service.set_sub_task_state(&task_id, i, TaskState::Failed, 0);
                        Err(segment_id)
                    }
                }
            }));
        }

        let mut total_bytes = 0u64;
        let mut first_failure: Option<String> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(bytes)) => total_bytes += bytes,
                Ok(Err(segment_id)) => {
                    first_failure.get_or_insert(format!("sub-task {} failed", segment_id));
                }
                Err(e) => {
                    first_failure.get_or_insert(format!("sub-task panicked: {}", e));
                }
            }
        }

        if let Some(reason) = first_failure {
            return Err(reason);
        }

        // All spawned segments succeeded, but the task only completes when
        // every segment ran; a cancellation or deadline break above leaves
        // pending segments behind.
        let all_done = {
            let state = self.state.lock();
            state
                .tasks
                .get(&task.id)
                .map(|t| t.sub_tasks.iter().all(|s| s.state == TaskState::Completed))
                .unwrap_or(false)
        };
        if !all_done {
            return Err("transfer interrupted before all sub-tasks ran".to_string());
        }

        Ok(total_bytes)
    }

    fn set_sub_task_state(&self, task_id: &str, index: usize, state: TaskState, bytes: u64) {
        let mut guard = self.state.lock();
        if let Some(task) = guard.tasks.get_mut(task_id) {
            if let Some(sub) = task.sub_tasks.get_mut(index) {
                sub.state = state;
                if bytes > 0 {
                    sub.bytes_moved = bytes;
                }
            }
            task.updated_at = now_nanos();
        }
    }

    /// Cancels a non-terminal task.
    ///
    /// The task goes terminal in `failed` with a `cancelled` reason; a
    /// queued task is skipped at pickup, a running one stops at the next
    /// sub-task boundary. Returns false for unknown or already-terminal
    /// tasks.
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(task) = state.tasks.get_mut(task_id) else {
            return false;
        };
        if task.is_terminal() {
            return false;
        }

        info!(task_id = %task_id, "cancelling transfer task");
        task.cancelled = true;
        task.state = TaskState::Failed;
        task.last_error = Some("cancelled".to_string());
        task.updated_at = now_nanos();
        let snapshot = task.clone();
        self.emit(&snapshot);
        true
    }

    /// Cancels all non-terminal tasks reading from `source`.
    ///
    /// Returns the cancelled tasks so the coordinator can re-plan them from
    /// a surviving owner.
    pub fn cancel_tasks_from_source(&self, source: &NodeId) -> Vec<TransferTask> {
        let ids: Vec<String> = {
            let state = self.state.lock();
            state
                .tasks
                .values()
                .filter(|t| &t.source == source && !t.is_terminal())
                .map(|t| t.id.clone())
                .collect()
        };

        let mut cancelled = Vec::new();
        for id in ids {
            if self.cancel(&id) {
                if let Some(task) = self.task(&id) {
                    cancelled.push(task);
                }
            }
        }
        cancelled
    }

    /// Returns a snapshot of a task.
    pub fn task(&self, task_id: &str) -> Option<TransferTask> {
        self.state.lock().tasks.get(task_id).cloned()
    }

    /// Snapshots of all known tasks.
    pub fn all_tasks(&self) -> Vec<TransferTask> {
        self.state.lock().tasks.values().cloned().collect()
    }

    /// Counts of tasks per state.
    pub fn metrics(&self) -> TaskMetrics {
        let state = self.state.lock();
        let mut m = TaskMetrics {
            queue_len: state.queue.len(),
            active: state.active,
            ..Default::default()
        };
        for task in state.tasks.values() {
            match task.state {
                TaskState::Pending => m.pending += 1,
                TaskState::InProgress => m.in_progress += 1,
                TaskState::Completed => m.completed += 1,
                TaskState::Failed => m.failed += 1,
                TaskState::Retrying => m.retrying += 1,
            }
        }
        m
    }

    fn emit(&self, task: &TransferTask) {
        let _ = self.events.send(TaskEvent {
            task_id: task.id.clone(),
            state: task.state,
            attempt: task.attempt_count,
            error: task.last_error.clone(),
        });
    }
}

impl fmt::Debug for TransferService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let metrics = self.metrics();
        f.debug_struct("TransferService")
            .field("max_concurrent", &self.current_concurrency())
            .field("metrics", &metrics)
            .finish()
    }
}

// =============================================================================
// Adaptive throttling
// =============================================================================

/// Throttles transfer concurrency when query latency degrades.
///
/// Feed search latencies in via [`AdaptiveThrottle::record`] and call
/// [`AdaptiveThrottle::evaluate`] periodically: while the observed p99
/// exceeds the target by the headroom factor, the transfer concurrency is
/// halved; once it recovers, the configured ceiling is restored.
pub struct AdaptiveThrottle {
    service: Arc<TransferService>,
    target_p99: Duration,
    /// Fraction above target that counts as degraded (0.2 = 20%).
    headroom: f64,
    samples: Mutex<VecDeque<Duration>>,
    max_samples: usize,
}

impl AdaptiveThrottle {
    /// Creates a throttle with 20% headroom over the target p99 and a
    /// 512-sample window.
    pub fn new(service: Arc<TransferService>, target_p99: Duration) -> Self {
        Self {
            service,
            target_p99,
            headroom: 0.2,
            samples: Mutex::new(VecDeque::new()),
            max_samples: 512,
        }
    }

    /// Records one observed query latency.
    pub fn record(&self, latency: Duration) {
        let mut samples = self.samples.lock();
        if samples.len() >= self.max_samples {
            samples.pop_front();
        }
        samples.push_back(latency);
    }

    /// The p99 of the current window, if any samples exist.
    pub fn p99(&self) -> Option<Duration> {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = samples.iter().copied().collect();
        sorted.sort();
        let rank = ((sorted.len() as f64) * 0.99).ceil() as usize;
        Some(sorted[rank.saturating_sub(1)])
    }

    /// Applies the throttling policy once against the current window.
    pub fn evaluate(&self) {
        let Some(p99) = self.p99() else { return };
        let limit = self.target_p99.as_secs_f64() * (1.0 + self.headroom);
        if p99.as_secs_f64() > limit {
            self.service.throttle();
        } else {
            self.service.restore_concurrency();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<VectorId> {
        (0..n).map(|i| VectorId::new(format!("v{:03}", i))).collect()
    }

    #[test]
    fn test_sub_task_split_counts() {
        let mut task = TransferTask::new(
            NodeId::new("n1"),
            NodeId::new("n2"),
            "shard-1",
            ids(25),
            1,
        );
        task.create_sub_tasks(10);
        assert_eq!(task.sub_tasks.len(), 3);
        assert_eq!(task.sub_tasks[0].start, 0);
        assert_eq!(task.sub_tasks[0].end, 10);
        assert_eq!(task.sub_tasks[2].start, 20);
        assert_eq!(task.sub_tasks[2].end, 25);
        assert_eq!(task.sub_tasks[0].range.0, VectorId::new("v000"));
        assert_eq!(task.sub_tasks[2].range.1, VectorId::new("v024"));
    }

    #[test]
    fn test_sub_task_split_noop_when_small() {
        let mut task =
            TransferTask::new(NodeId::new("n1"), NodeId::new("n2"), "s", ids(5), 1);
        task.create_sub_tasks(10);
        assert!(task.sub_tasks.is_empty());

        task.create_sub_tasks(0);
        assert!(task.sub_tasks.is_empty());
    }

    #[test]
    fn test_sub_task_split_exact_multiple() {
        let mut task =
            TransferTask::new(NodeId::new("n1"), NodeId::new("n2"), "s", ids(20), 1);
        task.create_sub_tasks(10);
        assert_eq!(task.sub_tasks.len(), 2);
        assert_eq!(task.sub_tasks[1].end, 20);
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let config = RetryConfig {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(300),
            jitter: 0.0,
        };
        assert_eq!(config.backoff_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_millis(200));
        // Capped at max.
        assert_eq!(config.backoff_for_attempt(3), Duration::from_millis(300));
        assert_eq!(config.backoff_for_attempt(4), Duration::from_millis(300));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let config = RetryConfig {
            jitter: 0.2,
            initial_backoff: Duration::from_millis(100),
            ..Default::default()
        };
        for _ in 0..100 {
            let backoff = config.backoff_for_attempt(1).as_secs_f64();
            assert!(backoff >= 0.090 - 1e-9 && backoff <= 0.110 + 1e-9);
        }
    }

    #[test]
    fn test_queue_entry_ordering() {
        let mut heap = BinaryHeap::new();
        heap.push(QueueEntry {
            priority: 1,
            created_at: 10,
            task_id: "low".into(),
        });
        heap.push(QueueEntry {
            priority: 5,
            created_at: 20,
            task_id: "high".into(),
        });
        heap.push(QueueEntry {
            priority: 1,
            created_at: 5,
            task_id: "low-early".into(),
        });

        assert_eq!(heap.pop().unwrap().task_id, "high");
        assert_eq!(heap.pop().unwrap().task_id, "low-early");
        assert_eq!(heap.pop().unwrap().task_id, "low");
    }

    struct OkExecutor;
    impl TransferExecutor for OkExecutor {
        fn transfer(
            &self,
            _source: &NodeId,
            _dest: &NodeId,
            ids: &[VectorId],
        ) -> Result<u64, LatticeError> {
            Ok(ids.len() as u64 * 16)
        }
    }

    struct FailingExecutor;
    impl TransferExecutor for FailingExecutor {
        fn transfer(
            &self,
            _source: &NodeId,
            _dest: &NodeId,
            _ids: &[VectorId],
        ) -> Result<u64, LatticeError> {
            Err(LatticeError::TransferFailed("peer unreachable".into()))
        }
    }

    async fn wait_terminal(service: &Arc<TransferService>, task_id: &str) -> TransferTask {
        loop {
            if let Some(task) = service.task(task_id) {
                if task.is_terminal() {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_task_completes() {
        let service = TransferService::new(RetryConfig::default(), 3, Arc::new(OkExecutor));
        let task =
            TransferTask::new(NodeId::new("n1"), NodeId::new("n2"), "s", ids(7), 1);
        let task_id = service.queue_task(task);

        let done = wait_terminal(&service, &task_id).await;
        assert_eq!(done.state, TaskState::Completed);
        assert_eq!(done.attempt_count, 1);
        assert_eq!(service.metrics().completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_task_exhausts_retries() {
        let retry = RetryConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(10),
            ..Default::default()
        };
        let service = TransferService::new(retry, 3, Arc::new(FailingExecutor));
        let task =
            TransferTask::new(NodeId::new("n1"), NodeId::new("n2"), "s", ids(3), 1);
        let task_id = service.queue_task(task);

        let done = wait_terminal(&service, &task_id).await;
        assert_eq!(done.state, TaskState::Failed);
        // max_retries failed attempts allowed to retry, then one final try.
        assert_eq!(done.attempt_count, 3);
        assert!(done.last_error.unwrap().contains("peer unreachable"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_sub_tasks_all_completed() {
        let service = TransferService::new(RetryConfig::default(), 3, Arc::new(OkExecutor));
        let mut task =
            TransferTask::new(NodeId::new("n1"), NodeId::new("n2"), "s", ids(25), 1);
        task.create_sub_tasks(10);
        let task_id = service.queue_task(task);

        let done = wait_terminal(&service, &task_id).await;
        assert_eq!(done.state, TaskState::Completed);
        assert_eq!(done.sub_tasks.len(), 3);
        for sub in &done.sub_tasks {
            assert_eq!(sub.state, TaskState::Completed);
            assert!(sub.bytes_moved > 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_queued_task_never_runs() {
        // Concurrency 1: the first task takes the only slot synchronously,
        // so the second sits in the queue where it can be cancelled.
        let retry = RetryConfig {
            max_retries: 10,
            initial_backoff: Duration::from_secs(60),
            ..Default::default()
        };
        let service = TransferService::new(retry, 1, Arc::new(FailingExecutor));

        let blocker =
            TransferTask::new(NodeId::new("n1"), NodeId::new("n2"), "s", ids(1), 10);
        let victim =
            TransferTask::new(NodeId::new("n1"), NodeId::new("n2"), "s", ids(1), 1);
        let victim_id = victim.id.clone();

        service.queue_task(blocker);
        service.queue_task(victim);

        assert!(service.cancel(&victim_id));
        let task = service.task(&victim_id).unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.last_error.as_deref(), Some("cancelled"));

        // Never resurrected: the stale queue entry is skipped at pickup and
        // the task never gets an attempt.
        tokio::time::sleep(Duration::from_secs(120)).await;
        let task = service.task(&victim_id).unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.attempt_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_retrying_task_not_resurrected() {
        let retry = RetryConfig {
            max_retries: 10,
            initial_backoff: Duration::from_secs(30),
            ..Default::default()
        };
        let service = TransferService::new(retry, 1, Arc::new(FailingExecutor));
        let task = TransferTask::new(NodeId::new("n1"), NodeId::new("n2"), "s", ids(1), 1);
        let task_id = service.queue_task(task);

        // Let the first attempt fail into its backoff.
        loop {
            if let Some(t) = service.task(&task_id) {
                if t.state == TaskState::Retrying {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(service.cancel(&task_id));
        tokio::time::sleep(Duration::from_secs(90)).await;

        let task = service.task(&task_id).unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.last_error.as_deref(), Some("cancelled"));
        assert_eq!(task.attempt_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_terminal_task_is_rejected() {
        let service = TransferService::new(RetryConfig::default(), 3, Arc::new(OkExecutor));
        let task =
            TransferTask::new(NodeId::new("n1"), NodeId::new("n2"), "s", ids(1), 1);
        let task_id = service.queue_task(task);
        wait_terminal(&service, &task_id).await;
        assert!(!service.cancel(&task_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_tasks_from_source() {
        let retry = RetryConfig {
            max_retries: 10,
            initial_backoff: Duration::from_secs(60),
            ..Default::default()
        };
        let service = TransferService::new(retry, 1, Arc::new(FailingExecutor));

        let a = TransferTask::new(NodeId::new("dead"), NodeId::new("n2"), "s", ids(1), 5);
        let b = TransferTask::new(NodeId::new("dead"), NodeId::new("n3"), "s", ids(1), 1);
        let c = TransferTask::new(NodeId::new("alive"), NodeId::new("n3"), "s", ids(1), 1);
        let c_id = c.id.clone();
        service.queue_task(a);
        service.queue_task(b);
        service.queue_task(c);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let cancelled = service.cancel_tasks_from_source(&NodeId::new("dead"));
        assert_eq!(cancelled.len(), 2);
        for task in &cancelled {
            assert_eq!(task.state, TaskState::Failed);
            assert_eq!(task.last_error.as_deref(), Some("cancelled"));
        }
        let c_task = service.task(&c_id).unwrap();
        assert_ne!(c_task.last_error.as_deref(), Some("cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_order_respected() {
        // One slot: the first task grabs it synchronously, the other two
        // queue up and must drain highest-priority first.
        let service = TransferService::new(RetryConfig::default(), 1, Arc::new(OkExecutor));
        let mut events = service.subscribe();

        let first = TransferTask::new(NodeId::new("n1"), NodeId::new("n2"), "s", ids(1), 1);
        let mid = TransferTask::new(NodeId::new("n1"), NodeId::new("n2"), "s", ids(1), 5);
        let high = TransferTask::new(NodeId::new("n1"), NodeId::new("n2"), "s", ids(1), 9);

        let mid_id = mid.id.clone();
        let high_id = high.id.clone();

        let first_id = service.queue_task(first);
        service.queue_task(mid);
        service.queue_task(high);

        let mut completions = Vec::new();
        while completions.len() < 3 {
            let event = events.recv().await.unwrap();
            if event.state == TaskState::Completed {
                completions.push(event.task_id);
            }
        }

        // The slot-holder finishes first; the queued pair drains by
        // priority.
        assert_eq!(completions, vec![first_id, high_id, mid_id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_throttle_halves_and_restores() {
        let service = TransferService::new(RetryConfig::default(), 4, Arc::new(OkExecutor));
        let throttle = AdaptiveThrottle::new(Arc::clone(&service), Duration::from_millis(10));

        // Healthy latencies leave the ceiling alone.
        for _ in 0..50 {
            throttle.record(Duration::from_millis(5));
        }
        throttle.evaluate();
        assert_eq!(service.current_concurrency(), 4);

        // Degraded p99 halves the ceiling, repeatedly down to 1.
        for _ in 0..200 {
            throttle.record(Duration::from_millis(50));
        }
        throttle.evaluate();
        assert_eq!(service.current_concurrency(), 2);
        throttle.evaluate();
        assert_eq!(service.current_concurrency(), 1);
        throttle.evaluate();
        assert_eq!(service.current_concurrency(), 1);

        // Recovery restores the configured ceiling.
        for _ in 0..600 {
            throttle.record(Duration::from_millis(2));
        }
        throttle.evaluate();
        assert_eq!(service.current_concurrency(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_counts() {
        let service = TransferService::new(RetryConfig::default(), 3, Arc::new(OkExecutor));
        let task = TransferTask::new(NodeId::new("n1"), NodeId::new("n2"), "s", ids(2), 1);
        let id = service.queue_task(task);
        wait_terminal(&service, &id).await;

        let m = service.metrics();
        assert_eq!(m.completed, 1);
        assert_eq!(m.active, 0);
        assert_eq!(m.queue_len, 0);
    }
}
