//! Integration tests for transfer retry timing and sub-task partial
//! success.

use lattice_core::{LatticeError, NodeId, VectorId};
use lattice_store::coordinator::{
    OperationStatus, RebalanceConfig, RebalanceCoordinator,
};
use lattice_store::membership::{ChangeKind, ClusterChangeEvent};
use lattice_store::repl_log::{InMemoryLog, ReplicatedLog};
use lattice_store::ring::TokenRing;
use lattice_store::store::{StoreConfig, VectorStore};
use lattice_store::transfer::{
    RetryConfig, TaskState, TransferExecutor, TransferService, TransferTask,
};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn ids(n: usize) -> Vec<VectorId> {
    (0..n).map(|i| VectorId::new(format!("v{:03}", i))).collect()
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

/// Fails a fixed number of initial calls, recording when each call landed.
struct FlakyExecutor {
    failures_left: AtomicU32,
    calls: Mutex<Vec<Instant>>,
}

impl FlakyExecutor {
    fn new(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl TransferExecutor for FlakyExecutor {
    fn transfer(
        &self,
        _source: &NodeId,
        _dest: &NodeId,
        ids: &[VectorId],
    ) -> Result<u64, LatticeError> {
        self.calls.lock().push(Instant::now());
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(LatticeError::TransferFailed("injected failure".into()))
        } else {
            Ok(ids.len() as u64 * 16)
        }
    }
}

/// Fails permanently for any batch containing the marked id.
struct FailIfContains {
    target: VectorId,
}

impl TransferExecutor for FailIfContains {
    fn transfer(
        &self,
        _source: &NodeId,
        _dest: &NodeId,
        ids: &[VectorId],
    ) -> Result<u64, LatticeError> {
        if ids.contains(&self.target) {
            Err(LatticeError::TransferFailed(format!(
                "batch containing {} rejected",
                self.target
            )))
        } else {
            Ok(ids.len() as u64 * 16)
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_retry_gaps_follow_backoff_with_jitter() {
    let retry = RetryConfig {
        max_retries: 3,
        initial_backoff: Duration::from_millis(100),
        multiplier: 2.0,
        max_backoff: Duration::from_millis(800),
        jitter: 0.2,
    };
    let executor = Arc::new(FlakyExecutor::new(3));
    let service = TransferService::new(retry, 3, Arc::clone(&executor) as Arc<dyn TransferExecutor>);

    let task = TransferTask::new(NodeId::new("n1"), NodeId::new("n2"), "s", ids(4), 1);
    let task_id = service.queue_task(task);

    let done = wait_terminal(&service, &task_id).await;
    assert_eq!(done.state, TaskState::Completed);
    assert_eq!(done.attempt_count, 4);

    let calls = executor.calls.lock();
    assert_eq!(calls.len(), 4);

    // Gaps between attempts sit inside the jitter band of 100, 200, 400 ms.
    let expected_ms = [100.0, 200.0, 400.0];
    for (i, expected) in expected_ms.iter().enumerate() {
        let gap = calls[i + 1].duration_since(calls[i]).as_secs_f64() * 1000.0;
        assert!(
            gap >= expected * 0.9 - 1.0 && gap <= expected * 1.1 + 1.0,
            "gap {} was {:.1}ms, expected within [{:.0}, {:.0}]",
            i,
            gap,
            expected * 0.9,
            expected * 1.1
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_sub_task_partial_success_reported() {
    // 25 ids at batch size 10 make three segments; the middle one is
    // poisoned and fails on every attempt.
    let retry = RetryConfig {
        max_retries: 1,
        initial_backoff: Duration::from_millis(10),
        ..Default::default()
    };
    let executor = Arc::new(FailIfContains {
        target: VectorId::new("v010"),
    });
    let service = TransferService::new(retry, 3, executor);

    let mut task = TransferTask::new(NodeId::new("n1"), NodeId::new("n2"), "s", ids(25), 1);
    task.create_sub_tasks(10);
    let task_id = service.queue_task(task);

    let done = wait_terminal(&service, &task_id).await;
    assert_eq!(done.state, TaskState::Failed);
    assert_eq!(done.sub_tasks.len(), 3);
    assert_eq!(done.sub_tasks[0].state, TaskState::Completed);
    assert_eq!(done.sub_tasks[1].state, TaskState::Failed);
    assert_eq!(done.sub_tasks[2].state, TaskState::Completed);
    assert!(done.last_error.unwrap().contains("seg"));
}

#[tokio::test(start_paused = true)]
async fn test_coordinator_records_partial_commit_markers() {
    // A rebalance whose transfer task fails on exactly one segment ends
    // failed but records the completed segments for independent commit.
    let mut ring = TokenRing::new(64, 1);
    ring.add_node(&NodeId::new("n1"));
    let ring = Arc::new(RwLock::new(ring));

    let store = Arc::new(
        VectorStore::new(StoreConfig {
            node_id: NodeId::new("n1"),
            dimensions: 2,
            metric: lattice_core::DistanceMetric::Cosine,
        })
        .unwrap(),
    );
    store.set_ring(Arc::clone(&ring));
    for i in 0..200 {
        store
            .put(&lattice_core::Vector::new(
                format!("vec-{:03}", i),
                vec![i as f32, 1.0],
                None,
            ))
            .unwrap();
    }

    // Work out which ids will move so the executor can poison one segment.
    let mut grown = ring.read().clone();
    grown.add_node(&NodeId::new("n2"));
    let moves = grown.diff_moves(&ring.read(), &store.all_ids());
    let moved = moves.get(&NodeId::new("n2")).unwrap();
    assert!(moved.len() > 20, "need multiple segments for this test");
    let target = moved[0].clone();

    let retry = RetryConfig {
        max_retries: 1,
        initial_backoff: Duration::from_millis(10),
        ..Default::default()
    };
    let transfer = TransferService::new(retry, 3, Arc::new(FailIfContains { target }));
    let log = Arc::new(InMemoryLog::new());
    let coordinator = RebalanceCoordinator::new(
        RebalanceConfig {
            batch_size: 10,
            ..RebalanceConfig::default()
        },
        Arc::clone(&ring),
        Arc::clone(&store),
        transfer,
        log as Arc<dyn ReplicatedLog>,
    );

    let event = ClusterChangeEvent::new(ChangeKind::NodeJoined, NodeId::new("n2"));
    let op_id = coordinator.trigger_rebalance(vec![event]).await;

    let op = loop {
        if let Some(op) = coordinator.operation(&op_id) {
            if matches!(
                op.status,
                OperationStatus::Completed | OperationStatus::Failed
            ) {
                break op;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.failed_tasks, 1);
    let segments: Vec<&String> = op.partial_commits.values().flatten().collect();
    assert!(
        !segments.is_empty(),
        "completed segments of the failed task must be recorded"
    );
}
