mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{at, fast_policy, node_task, source_id, task};
use issue_dispatch::error::{DispatchError, StoreError};
use issue_dispatch::platform::{CapabilityProfile, RequirementSet, Version};
use issue_dispatch::scheduler::{
    FailDisposition, FileStore, MemoryStore, Priority, RetryPolicy, TaskState, TaskStore,
    WorkQueue,
};

fn node_profile() -> CapabilityProfile {
    CapabilityProfile::new().with("nodejs", Version::new(20, 11, 1))
}

#[tokio::test]
async fn test_claim_order_is_priority_then_age() {
    let queue = WorkQueue::in_memory(RetryPolicy::default());

    let mut old_low = node_task(1).with_created_at(at(0));
    old_low.priority = Priority::Low;
    let newer_normal = node_task(2).with_created_at(at(5));
    let older_normal = node_task(3).with_created_at(at(1));
    let mut newest_urgent = node_task(4).with_created_at(at(9));
    newest_urgent.priority = Priority::Urgent;

    for t in [old_low, newer_normal, older_normal, newest_urgent] {
        queue.enqueue(t).await.unwrap();
    }

    let mut order = Vec::new();
    while let Some(claimed) = queue.claim_next(&node_profile()).await.unwrap() {
        assert_eq!(claimed.state, TaskState::Assigned);
        order.push(claimed.source_id);
    }
    assert_eq!(
        order,
        vec![source_id(4), source_id(3), source_id(2), source_id(1)]
    );
}

#[tokio::test]
async fn test_claim_skips_unsatisfiable_tasks() {
    let queue = WorkQueue::in_memory(RetryPolicy::default());
    queue
        .enqueue(task(1, RequirementSet::new().require("python", "3.11")).with_created_at(at(0)))
        .await
        .unwrap();
    queue
        .enqueue(node_task(2).with_created_at(at(1)))
        .await
        .unwrap();

    let claimed = queue.claim_next(&node_profile()).await.unwrap().unwrap();
    assert_eq!(claimed.source_id, source_id(2));
    assert!(queue.claim_next(&node_profile()).await.unwrap().is_none());

    // The python task is still waiting for a capable worker.
    let pending = queue.list(Some(TaskState::Pending)).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].source_id, source_id(1));
}

#[tokio::test]
async fn test_duplicate_enqueue_rejected_while_live() {
    let queue = WorkQueue::in_memory(RetryPolicy::default());
    queue.enqueue(node_task(1)).await.unwrap();

    let err = queue.enqueue(node_task(1)).await.unwrap_err();
    assert!(matches!(err, DispatchError::DuplicateTask(s) if s == source_id(1)));

    // Still rejected once assigned.
    let claimed = queue.claim_next(&node_profile()).await.unwrap().unwrap();
    assert!(queue.enqueue(node_task(1)).await.is_err());

    // A finished task may be queued again.
    queue
        .complete(&claimed.id, serde_json::json!({}))
        .await
        .unwrap();
    queue.enqueue(node_task(1)).await.unwrap();
    assert_eq!(queue.get(&claimed.id).await.unwrap().state, TaskState::Pending);
}

#[tokio::test]
async fn test_transitions_require_assignment() {
    let queue = WorkQueue::in_memory(RetryPolicy::default());
    let t = node_task(1);
    let id = t.id;
    queue.enqueue(t).await.unwrap();

    assert!(matches!(
        queue.complete(&id, serde_json::json!({})).await,
        Err(DispatchError::NotAssigned {
            state: TaskState::Pending,
            ..
        })
    ));
    assert!(matches!(
        queue.fail(&id, "boom").await,
        Err(DispatchError::NotAssigned { .. })
    ));

    queue.claim_next(&node_profile()).await.unwrap().unwrap();
    queue.complete(&id, serde_json::json!({"ok": true})).await.unwrap();

    // Completed is terminal.
    assert!(queue.fail(&id, "late").await.is_err());
    assert!(queue.release(&id).await.is_err());
    let done = queue.get(&id).await.unwrap();
    assert_eq!(done.state, TaskState::Completed);
    assert_eq!(done.result, Some(serde_json::json!({"ok": true})));
}

#[tokio::test]
async fn test_unknown_task_is_reported() {
    let queue = WorkQueue::in_memory(RetryPolicy::default());
    let id = node_task(99).id;
    assert!(matches!(
        queue.complete(&id, serde_json::json!({})).await,
        Err(DispatchError::TaskNotFound(missing)) if missing == id
    ));
}

#[tokio::test]
async fn test_failures_retry_until_exhausted() {
    let queue = WorkQueue::in_memory(fast_policy(3));
    let t = node_task(1);
    let id = t.id;
    queue.enqueue(t).await.unwrap();

    for attempt in 1..=2 {
        queue.claim_next(&node_profile()).await.unwrap().unwrap();
        let disposition = queue.fail(&id, &format!("attempt {attempt}")).await.unwrap();
        assert!(matches!(
            disposition,
            FailDisposition::Requeued { retry_count, .. } if retry_count == attempt
        ));
        assert_eq!(queue.get(&id).await.unwrap().state, TaskState::Pending);
    }

    queue.claim_next(&node_profile()).await.unwrap().unwrap();
    let disposition = queue.fail(&id, "attempt 3").await.unwrap();
    assert_eq!(disposition, FailDisposition::Exhausted { retry_count: 3 });

    let failed = queue.get(&id).await.unwrap();
    assert_eq!(failed.state, TaskState::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("attempt 3"));
    assert!(failed.completed_at.is_some());
    assert!(queue.claim_next(&node_profile()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_backoff_delays_next_claim() {
    let policy = RetryPolicy {
        max_retries: 3,
        backoff: issue_dispatch::backoff::Backoff::new(
            Duration::from_secs(30),
            Duration::from_secs(300),
        ),
    };
    let queue = WorkQueue::in_memory(policy);
    let t = node_task(1);
    let id = t.id;
    queue.enqueue(t).await.unwrap();

    queue.claim_next(&node_profile()).await.unwrap().unwrap();
    let before = Utc::now();
    let FailDisposition::Requeued { not_before, .. } = queue.fail(&id, "flaky").await.unwrap()
    else {
        panic!("expected a requeue");
    };
    assert!(not_before >= before + chrono::Duration::seconds(30));

    // Pending, but not yet claimable.
    assert_eq!(queue.get(&id).await.unwrap().state, TaskState::Pending);
    assert!(queue.claim_next(&node_profile()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_release_does_not_spend_a_retry() {
    let queue = WorkQueue::in_memory(fast_policy(1));
    let t = node_task(1);
    let id = t.id;
    queue.enqueue(t).await.unwrap();

    queue.claim_next(&node_profile()).await.unwrap().unwrap();
    queue.release(&id).await.unwrap();

    let released = queue.get(&id).await.unwrap();
    assert_eq!(released.state, TaskState::Pending);
    assert_eq!(released.retry_count, 0);
    assert!(released.assigned_at.is_none());
    assert!(queue.claim_next(&node_profile()).await.unwrap().is_some());
}

#[tokio::test]
async fn test_reaper_fails_silent_assignments() {
    let queue = WorkQueue::in_memory(fast_policy(3));
    let quiet = node_task(1);
    let alive = node_task(2);
    let (quiet_id, alive_id) = (quiet.id, alive.id);
    queue.enqueue(quiet).await.unwrap();
    queue.enqueue(alive).await.unwrap();
    queue.claim_next(&node_profile()).await.unwrap().unwrap();
    queue.claim_next(&node_profile()).await.unwrap().unwrap();

    let grace = Duration::from_secs(300);
    let later = Utc::now() + chrono::Duration::seconds(600);
    queue
        .heartbeat(&alive_id, later - chrono::Duration::seconds(10))
        .await
        .unwrap();

    let reaped = queue.reap_stale_at(later, grace).await.unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].0, quiet_id);
    assert!(matches!(
        reaped[0].1,
        FailDisposition::Requeued { retry_count: 1, .. }
    ));

    let quiet = queue.get(&quiet_id).await.unwrap();
    assert_eq!(quiet.state, TaskState::Pending);
    assert!(quiet.last_error.unwrap().contains("no heartbeat"));
    assert_eq!(queue.get(&alive_id).await.unwrap().state, TaskState::Assigned);
}

#[tokio::test]
async fn test_purge_removes_only_old_terminal_records() {
    let queue = WorkQueue::in_memory(fast_policy(1));
    let done = node_task(1);
    let failed = node_task(2);
    let waiting = node_task(3);
    let (done_id, failed_id) = (done.id, failed.id);
    for t in [done, failed, waiting] {
        queue.enqueue(t).await.unwrap();
    }
    queue.claim_next(&node_profile()).await.unwrap();
    queue.claim_next(&node_profile()).await.unwrap();
    queue.complete(&done_id, serde_json::json!({})).await.unwrap();
    queue.fail(&failed_id, "broken").await.unwrap();

    let retention = Duration::from_secs(3600);
    assert_eq!(queue.purge_expired_at(Utc::now(), retention).await.unwrap(), 0);

    let much_later = Utc::now() + chrono::Duration::hours(2);
    assert_eq!(queue.purge_expired_at(much_later, retention).await.unwrap(), 2);
    assert_eq!(queue.len().await, 1);
    assert!(!queue.is_known(&source_id(1)).await);
    assert!(queue.is_known(&source_id(3)).await);
}

#[tokio::test]
async fn test_counts_track_every_state() {
    let queue = WorkQueue::in_memory(fast_policy(1));
    for n in 1..=4 {
        queue.enqueue(node_task(n).with_created_at(at(n as u32))).await.unwrap();
    }
    let a = queue.claim_next(&node_profile()).await.unwrap().unwrap();
    let b = queue.claim_next(&node_profile()).await.unwrap().unwrap();
    queue.claim_next(&node_profile()).await.unwrap().unwrap();
    queue.complete(&a.id, serde_json::json!({})).await.unwrap();
    queue.fail(&b.id, "no").await.unwrap();

    let counts = queue.counts().await;
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.assigned, 1);
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.total(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_claims_never_share_a_task() {
    let queue = Arc::new(WorkQueue::in_memory(RetryPolicy::default()));
    for n in 0..200 {
        queue.enqueue(node_task(n)).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..16 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            while let Some(t) = queue.claim_next(&node_profile()).await.unwrap() {
                mine.push(t.id);
                tokio::task::yield_now().await;
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for id in handle.await.unwrap() {
            total += 1;
            assert!(seen.insert(id), "task {id} claimed twice");
        }
    }
    assert_eq!(total, 200);
    assert_eq!(queue.counts().await.assigned, 200);
}

#[tokio::test]
async fn test_store_sees_every_transition() {
    let store = Arc::new(MemoryStore::new());
    let queue = WorkQueue::open(store.clone(), fast_policy(3)).await.unwrap();
    let t = node_task(1);
    let id = t.id;

    queue.enqueue(t).await.unwrap();
    assert_eq!(store.record(&id).unwrap().state, TaskState::Pending);

    queue.claim_next(&node_profile()).await.unwrap();
    let claimed = store.record(&id).unwrap();
    assert_eq!(claimed.state, TaskState::Assigned);

    queue.fail(&id, "x").await.unwrap();
    let requeued = store.record(&id).unwrap();
    assert_eq!(requeued.state, TaskState::Pending);
    assert!(requeued.revision > claimed.revision);
}

// =============================================================================
// Durable store
// =============================================================================

#[tokio::test]
async fn test_file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let (done_id, assigned_id, pending_id);

    {
        let store = FileStore::open(dir.path()).unwrap();
        let queue = WorkQueue::open(Arc::new(store), fast_policy(3)).await.unwrap();
        let done = node_task(1).with_created_at(at(1));
        let assigned = node_task(2).with_created_at(at(2));
        let pending = node_task(3).with_created_at(at(3));
        (done_id, assigned_id, pending_id) = (done.id, assigned.id, pending.id);
        for t in [done, assigned, pending] {
            queue.enqueue(t).await.unwrap();
        }
        queue.claim_next(&node_profile()).await.unwrap();
        queue.claim_next(&node_profile()).await.unwrap();
        queue.complete(&done_id, serde_json::json!({"pr_url": "u"})).await.unwrap();
        // Process "crashes" with task 2 still assigned.
    }

    let store = FileStore::open(dir.path()).unwrap();
    let queue = WorkQueue::open(Arc::new(store), fast_policy(3)).await.unwrap();
    assert_eq!(queue.len().await, 3);
    assert_eq!(queue.get(&done_id).await.unwrap().state, TaskState::Completed);
    assert_eq!(queue.get(&pending_id).await.unwrap().state, TaskState::Pending);

    // The orphaned assignment is recovered by the reaper, not lost.
    let orphan = queue.get(&assigned_id).await.unwrap();
    assert_eq!(orphan.state, TaskState::Assigned);
    let later = Utc::now() + chrono::Duration::hours(1);
    let reaped = queue
        .reap_stale_at(later, Duration::from_secs(300))
        .await
        .unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].0, assigned_id);
    assert_eq!(queue.get(&assigned_id).await.unwrap().state, TaskState::Pending);
}

#[tokio::test]
async fn test_file_store_rejects_corrupt_records() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = FileStore::open(dir.path()).unwrap();
        store.put(&node_task(1)).await.unwrap();
    }
    std::fs::write(dir.path().join("tasks").join("garbage.json"), b"not json").unwrap();

    let store = FileStore::open(dir.path()).unwrap();
    let err = match WorkQueue::open(Arc::new(store), RetryPolicy::default()).await {
        Ok(_) => panic!("corrupt record accepted"),
        Err(e) => e,
    };
    assert!(matches!(err, DispatchError::Storage(StoreError::Corrupt { .. })));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_file_store_allows_one_writer() {
    let dir = tempfile::tempdir().unwrap();
    let first = FileStore::open(dir.path()).unwrap();

    assert!(matches!(
        FileStore::open(dir.path()),
        Err(StoreError::Locked(_))
    ));
    // Readers do not take the lock.
    assert!(FileStore::open_read_only(dir.path()).is_ok());

    drop(first);
    assert!(FileStore::open(dir.path()).is_ok());
}
