//! Rebalance coordination.
//!
//! Turns a debounced batch of membership events into a throttled transfer
//! plan: snapshot the ring, apply the events to a clone, diff the two rings
//! over the known vector ids, materialize one prioritized transfer task per
//! (source, destination) pair, and hand everything to the orchestrator. A
//! monitor watches task outcomes; once all are terminal it records the
//! operation result and submits a [`RingCommit`] to the replicated log. The
//! live ring only swaps when the committed entry is applied, so every node
//! switches ownership at the same log position.

use crate::membership::{ChangeKind, ClusterChangeEvent};
use crate::repl_log::{LogCommand, LogError, OwnershipEntry, ReplicatedLog, RingCommit};
use crate::ring::TokenRing;
use crate::store::VectorStore;
use crate::transfer::{TaskState, TransferService, TransferTask};
use lattice_core::{now_nanos, NodeId, VectorId};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Tuning for rebalance planning.
#[derive(Debug, Clone)]
pub struct RebalanceConfig {
    /// Sub-task batch size for large transfers.
    pub batch_size: usize,
    /// Priority for ordinary moves.
    pub default_priority: i32,
    /// Priority for moves restoring replication of under-replicated ids.
    pub under_replicated_priority: i32,
    /// Attempts when the replicated log refuses a commit.
    pub commit_retries: u32,
    /// Backoff between commit attempts.
    pub commit_backoff: Duration,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            default_priority: 1,
            under_replicated_priority: 10,
            commit_retries: 5,
            commit_backoff: Duration::from_millis(500),
        }
    }
}

/// Status of a rebalance operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One triggered rebalance, from event batch to metadata commit.
#[derive(Debug, Clone, Serialize)]
pub struct RebalanceOperation {
    pub id: String,
    pub events: Vec<ClusterChangeEvent>,
    pub status: OperationStatus,
    /// Wall-clock nanoseconds since epoch.
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub task_ids: Vec<String>,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    /// Failed tasks that still moved some segments; maps task id to the
    /// completed segment ids, so their metadata can be committed
    /// independently.
    pub partial_commits: HashMap<String, Vec<String>>,
    /// Ids left with fewer than `replication_factor` owners by this ring
    /// change.
    pub under_replicated_count: usize,
    pub last_error: Option<String>,
    /// Aggregate metrics bag.
    pub metrics: HashMap<String, serde_json::Value>,
}

/// Plans and tracks rebalancing after membership changes.
pub struct RebalanceCoordinator {
    /// Self-handle for spawning the monitor and applier tasks.
    me: Weak<RebalanceCoordinator>,
    config: RebalanceConfig,
    ring: Arc<RwLock<TokenRing>>,
    store: Arc<VectorStore>,
    transfer: Arc<TransferService>,
    log: Arc<dyn ReplicatedLog>,
    operations: RwLock<HashMap<String, RebalanceOperation>>,
}

impl RebalanceCoordinator {
    /// Creates a coordinator over the shared ring, local store, transfer
    /// orchestrator, and replicated log.
    pub fn new(
        config: RebalanceConfig,
        ring: Arc<RwLock<TokenRing>>,
        store: Arc<VectorStore>,
        transfer: Arc<TransferService>,
        log: Arc<dyn ReplicatedLog>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            ring,
            store,
            transfer,
            log,
            operations: RwLock::new(HashMap::new()),
        })
    }

    /// The shared ring this coordinator manages.
    pub fn ring(&self) -> Arc<RwLock<TokenRing>> {
        Arc::clone(&self.ring)
    }

    /// Starts a rebalance for a batch of membership events.
    ///
    /// Returns the operation id immediately; planning and submission happen
    /// inline, aggregation runs in a spawned monitor.
    pub async fn trigger_rebalance(&self, events: Vec<ClusterChangeEvent>) -> String {
        let op_id = format!("rebalance-{}", uuid::Uuid::new_v4());
        info!(operation = %op_id, events = events.len(), "rebalance triggered");

        let mut operation = RebalanceOperation {
            id: op_id.clone(),
            events: events.clone(),
            status: OperationStatus::Pending,
            started_at: now_nanos(),
            finished_at: None,
            task_ids: Vec::new(),
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            partial_commits: HashMap::new(),
            under_replicated_count: 0,
            last_error: None,
            metrics: HashMap::new(),
        };

        // 1. Snapshot the live ring and derive the candidate ring.
        let old_ring = self.ring.read().clone();
        let mut new_ring = old_ring.clone();
        let mut departed: HashSet<NodeId> = HashSet::new();
        for event in &events {
            match event.kind {
                ChangeKind::NodeJoined => {
                    new_ring.add_node(&event.node_id);
                    departed.remove(&event.node_id);
                }
                ChangeKind::NodeLeft => {
                    new_ring.remove_node(&event.node_id);
                    departed.insert(event.node_id.clone());
                }
            }
        }

        // A departing node can no longer serve as a transfer source.
        for node in &departed {
            for cancelled in self.transfer.cancel_tasks_from_source(node) {
                debug!(task = %cancelled.id, "cancelled transfer sourced from departed node");
            }
        }

        // 2-3. Enumerate known ids and diff ownership.
        let ids = self.store.all_ids();
        let moves = new_ring.diff_moves(&old_ring, &ids);

        // 4. Materialize transfer tasks, grouped by (source, dest).
        let mut under_replicated: usize = 0;
        let want = new_ring.replication_factor();
        let mut groups: HashMap<(NodeId, NodeId), (Vec<VectorId>, bool)> = HashMap::new();

        for (dest, dest_ids) in moves {
            for id in dest_ids {
                let source = old_ring
                    .owners(&id)
                    .into_iter()
                    .find(|owner| owner != &dest && !departed.contains(owner));
                let Some(source) = source else {
                    warn!(vector_id = %id, "no surviving owner to transfer from, skipping");
                    continue;
                };
                let short = new_ring.owners(&id).len() < want;
                if short {
                    under_replicated += 1;
                }
                let entry = groups.entry((source, dest.clone())).or_default();
                entry.0.push(id);
                entry.1 |= short;
            }
        }

        let mut task_ids = Vec::with_capacity(groups.len());
        for ((source, dest), (ids, short)) in groups {
            let priority = if short {
                self.config.under_replicated_priority
            } else {
                self.config.default_priority
            };
            let mut task = TransferTask::new(
                source,
                dest.clone(),
                format!("{}/{}", op_id, dest),
                ids,
                priority,
            );
            task.create_sub_tasks(self.config.batch_size);
            task_ids.push(task.id.clone());
            // 5. Submit.
            self.transfer.queue_task(task);
        }

        operation.under_replicated_count = under_replicated;
        operation.total_tasks = task_ids.len();
        operation.task_ids = task_ids.clone();
        operation.status = OperationStatus::Running;
        if under_replicated > 0 {
            warn!(
                operation = %op_id,
                count = under_replicated,
                "ring change leaves ids under-replicated"
            );
        }
        self.operations.write().insert(op_id.clone(), operation);

        // 6-7. Aggregate outcomes, then commit the ring swap.
        if let Some(coordinator) = self.me.upgrade() {
            let monitor_op_id = op_id.clone();
            let old_nodes = old_ring.all_nodes();
            let new_snapshot = new_ring.clone();
            tokio::spawn(async move {
                coordinator
                    .monitor_operation(monitor_op_id, task_ids, old_nodes, new_snapshot)
                    .await;
            });
        }

        op_id
    }

    /// Waits until every task of the operation is terminal, records the
    /// aggregate outcome, and submits the metadata commit.
    async fn monitor_operation(
        self: Arc<Self>,
        op_id: String,
        task_ids: Vec<String>,
        old_nodes: Vec<NodeId>,
        new_ring: TokenRing,
    ) {
        let mut events = self.transfer.subscribe();
        let tracked: HashSet<String> = task_ids.iter().cloned().collect();
        let mut terminal: HashSet<String> = HashSet::new();

        // Catch tasks that finished before we subscribed processed events.
        for task_id in &task_ids {
            if let Some(task) = self.transfer.task(task_id) {
                if task.is_terminal() {
                    terminal.insert(task_id.clone());
                }
            }
        }

        while terminal.len() < tracked.len() {
            match events.recv().await {
                Ok(event) => {
                    if tracked.contains(&event.task_id) && event.state.is_terminal() {
                        terminal.insert(event.task_id);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    // Missed events; re-poll the task table.
                    for task_id in &task_ids {
                        if let Some(task) = self.transfer.task(task_id) {
                            if task.is_terminal() {
                                terminal.insert(task_id.clone());
                            }
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }

        // Aggregate outcomes.
        let mut completed = 0usize;
        let mut failed = 0usize;
        let mut partial: HashMap<String, Vec<String>> = HashMap::new();
        let mut last_error = None;
        for task_id in &task_ids {
            let Some(task) = self.transfer.task(task_id) else { continue };
            match task.state {
                TaskState::Completed => completed += 1,
                _ => {
                    failed += 1;
                    if let Some(err) = &task.last_error {
                        last_error = Some(err.clone());
                    }
                    let done_segments: Vec<String> = task
                        .sub_tasks
                        .iter()
                        .filter(|s| s.state == TaskState::Completed)
                        .map(|s| s.segment_id.clone())
                        .collect();
                    if !done_segments.is_empty() {
                        partial.insert(task_id.clone(), done_segments);
                    }
                }
            }
        }

        let status = if failed == 0 {
            OperationStatus::Completed
        } else {
            OperationStatus::Failed
        };

        {
            let mut operations = self.operations.write();
            if let Some(op) = operations.get_mut(&op_id) {
                op.completed_tasks = completed;
                op.failed_tasks = failed;
                op.partial_commits = partial;
                op.status = status;
                op.finished_at = Some(now_nanos());
                op.last_error = last_error;
                let elapsed_ms = (now_nanos() - op.started_at) / 1_000_000;
                op.metrics
                    .insert("duration_ms".into(), serde_json::json!(elapsed_ms));
                op.metrics
                    .insert("event_count".into(), serde_json::json!(op.events.len()));
                op.metrics
                    .insert("task_count".into(), serde_json::json!(op.total_tasks));
            }
        }

        info!(
            operation = %op_id,
            ?status,
            completed,
            failed,
            "rebalance tasks terminal"
        );

        // 7. Submit the ring swap; the ring itself changes when the commit
        // is applied from the log.
        let ownership: Vec<OwnershipEntry> = self
            .store
            .all_ids()
            .into_iter()
            .filter(|id| new_ring.owners(id) != self.ring.read().owners(id))
            .map(|id| OwnershipEntry {
                owners: new_ring.owners(&id),
                vector_id: id,
            })
            .collect();

        let commit = RingCommit {
            operation_id: op_id.clone(),
            old_nodes,
            new_nodes: sorted_nodes(&new_ring),
            virtual_nodes: new_ring.virtual_nodes(),
            replication_factor: new_ring.replication_factor(),
            ownership,
        };
        self.submit_commit(&op_id, commit).await;
    }

    /// Submits the commit with bounded backoff retries on leader loss.
    async fn submit_commit(&self, op_id: &str, commit: RingCommit) {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.log.submit(LogCommand::RingCommit(commit.clone())) {
                Ok(index) => {
                    info!(operation = %op_id, index, "metadata commit submitted");
                    return;
                }
                Err(LogError::LeaderLost) if attempt <= self.config.commit_retries => {
                    warn!(
                        operation = %op_id,
                        attempt,
                        "log submit failed, retrying"
                    );
                    tokio::time::sleep(self.config.commit_backoff).await;
                }
                Err(e) => {
                    error!(operation = %op_id, error = %e, "metadata commit abandoned");
                    let mut operations = self.operations.write();
                    if let Some(op) = operations.get_mut(op_id) {
                        op.last_error = Some(format!("log submit failed: {}", e));
                    }
                    return;
                }
            }
        }
    }

    /// Applies a committed ring swap to the live ring.
    ///
    /// Ring construction is deterministic, so rebuilding from the ordered
    /// node list yields the same tokens on every node.
    pub fn apply_commit(&self, commit: &RingCommit) {
        let mut rebuilt = TokenRing::new(commit.virtual_nodes, commit.replication_factor);
        for node in &commit.new_nodes {
            rebuilt.add_node(node);
        }
        *self.ring.write() = rebuilt;
        info!(
            operation = %commit.operation_id,
            nodes = commit.new_nodes.len(),
            "ring swapped from committed metadata"
        );
    }

    /// Subscribes to the replicated log and applies ring commits in order.
    pub fn run_log_applier(&self) -> JoinHandle<()> {
        let coordinator = self.me.upgrade();
        let mut entries = self.log.subscribe();
        tokio::spawn(async move {
            let Some(coordinator) = coordinator else { return };
            loop {
                match entries.recv().await {
                    Ok(entry) => {
                        if let LogCommand::RingCommit(commit) = entry.command {
                            coordinator.apply_commit(&commit);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "log applier lagged behind commits");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Returns a snapshot of one operation.
    pub fn operation(&self, op_id: &str) -> Option<RebalanceOperation> {
        self.operations.read().get(op_id).cloned()
    }

    /// Snapshots of all operations.
    pub fn operations(&self) -> Vec<RebalanceOperation> {
        self.operations.read().values().cloned().collect()
    }
}

fn sorted_nodes(ring: &TokenRing) -> Vec<NodeId> {
    let mut nodes = ring.all_nodes();
    nodes.sort();
    nodes
}

impl std::fmt::Debug for RebalanceCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebalanceCoordinator")
            .field("operations", &self.operations.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repl_log::InMemoryLog;
    use crate::store::StoreConfig;
    use crate::transfer::{InMemoryExecutor, RetryConfig};
    use lattice_core::{DistanceMetric, Vector};

    fn make_store(node: &str) -> Arc<VectorStore> {
        Arc::new(
            VectorStore::new(StoreConfig {
                node_id: NodeId::new(node),
                dimensions: 2,
                metric: DistanceMetric::Cosine,
            })
            .unwrap(),
        )
    }

    fn setup(
        replication: usize,
        nodes: &[&str],
    ) -> (
        Arc<RebalanceCoordinator>,
        Arc<VectorStore>,
        Arc<InMemoryLog>,
        Arc<TransferService>,
    ) {
        let mut ring = TokenRing::new(32, replication);
        for node in nodes {
            ring.add_node(&NodeId::new(*node));
        }
        let ring = Arc::new(RwLock::new(ring));

        let store = make_store(nodes[0]);
        store.set_ring(Arc::clone(&ring));

        let executor = Arc::new(InMemoryExecutor::new());
        executor.register(store.node_id().clone(), Arc::clone(&store));
        // Destinations referenced in tests get stores of their own.
        for node in ["n2", "n3"] {
            if !nodes.contains(&node) {
                let peer = make_store(node);
                peer.set_ring(Arc::clone(&ring));
                executor.register(NodeId::new(node), peer);
            }
        }

        let transfer = TransferService::new(RetryConfig::default(), 3, executor);
        let log = Arc::new(InMemoryLog::new());
        let coordinator = RebalanceCoordinator::new(
            RebalanceConfig::default(),
            ring,
            Arc::clone(&store),
            Arc::clone(&transfer),
            Arc::clone(&log) as Arc<dyn ReplicatedLog>,
        );
        (coordinator, store, log, transfer)
    }

    async fn wait_status(
        coordinator: &Arc<RebalanceCoordinator>,
        op_id: &str,
    ) -> RebalanceOperation {
        loop {
            if let Some(op) = coordinator.operation(op_id) {
                if matches!(op.status, OperationStatus::Completed | OperationStatus::Failed) {
                    return op;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_moves_still_commits_ring_swap() {
        let (coordinator, _store, log, _transfer) = setup(2, &["n1"]);
        let applier = coordinator.run_log_applier();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let event = ClusterChangeEvent::new(ChangeKind::NodeJoined, NodeId::new("n2"));
        let op_id = coordinator.trigger_rebalance(vec![event]).await;

        let op = wait_status(&coordinator, &op_id).await;
        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(op.total_tasks, 0);

        // The commit landed and, once applied, the ring carries n2.
        loop {
            if coordinator.ring().read().contains(&NodeId::new("n2")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(log.len(), 1);
        applier.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_moves_data_and_completes() {
        let (coordinator, store, log, _transfer) = setup(1, &["n1"]);
        for i in 0..50 {
            store
                .put(&Vector::new(format!("v{}", i), vec![i as f32, 1.0], None))
                .unwrap();
        }

        let event = ClusterChangeEvent::new(ChangeKind::NodeJoined, NodeId::new("n2"));
        let op_id = coordinator.trigger_rebalance(vec![event]).await;

        let op = wait_status(&coordinator, &op_id).await;
        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(op.total_tasks, 1);
        assert_eq!(op.completed_tasks, 1);
        assert_eq!(log.len(), 1);
        match &log.entries()[0].command {
            LogCommand::RingCommit(commit) => {
                assert_eq!(commit.operation_id, op_id);
                assert!(commit.new_nodes.contains(&NodeId::new("n2")));
                assert!(!commit.ownership.is_empty());
            }
            other => panic!("expected ring commit, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_under_replicated_moves_get_priority_bump() {
        // One node, replication factor 3: after n2 joins every id still has
        // fewer than 3 owners, so its moves are bumped.
        let (coordinator, store, _log, transfer) = setup(3, &["n1"]);
        for i in 0..20 {
            store
                .put(&Vector::new(format!("v{}", i), vec![i as f32, 1.0], None))
                .unwrap();
        }

        let event = ClusterChangeEvent::new(ChangeKind::NodeJoined, NodeId::new("n2"));
        let op_id = coordinator.trigger_rebalance(vec![event]).await;
        let op = wait_status(&coordinator, &op_id).await;

        assert!(op.under_replicated_count > 0);
        for task in transfer.all_tasks() {
            assert_eq!(
                task.priority,
                RebalanceConfig::default().under_replicated_priority
            );
        }
    }

    #[test]
    fn test_apply_commit_rebuilds_deterministic_ring() {
        let ring = Arc::new(RwLock::new(TokenRing::new(16, 2)));
        let store = make_store("n1");
        let executor = Arc::new(InMemoryExecutor::new());
        let transfer = TransferService::new(RetryConfig::default(), 1, executor);
        let log = Arc::new(InMemoryLog::new());
        let coordinator = RebalanceCoordinator::new(
            RebalanceConfig::default(),
            Arc::clone(&ring),
            store,
            transfer,
            log as Arc<dyn ReplicatedLog>,
        );

        let commit = RingCommit {
            operation_id: "op-1".into(),
            old_nodes: vec![],
            new_nodes: vec![NodeId::new("n1"), NodeId::new("n2")],
            virtual_nodes: 16,
            replication_factor: 2,
            ownership: vec![],
        };
        coordinator.apply_commit(&commit);

        let mut expected = TokenRing::new(16, 2);
        expected.add_node(&NodeId::new("n1"));
        expected.add_node(&NodeId::new("n2"));
        assert_eq!(ring.read().sorted_tokens(), expected.sorted_tokens());
    }
}
