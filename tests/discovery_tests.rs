mod common;

use std::sync::Arc;

use common::{fast_policy, item, source_id, MockIssueSource};
use issue_dispatch::config::PollRetryConfig;
use issue_dispatch::discovery::{IssueStatus, TaskDiscoverer};
use issue_dispatch::platform::{CapabilityProfile, Detector, PlatformCatalog, Version};
use issue_dispatch::scheduler::{Priority, TaskId, TaskState, WorkQueue};

fn quick_retry(max_attempts: u32) -> PollRetryConfig {
    PollRetryConfig {
        max_attempts,
        base_delay_ms: 1,
        max_delay_ms: 5,
        jitter: false,
    }
}

fn discoverer(source: &Arc<MockIssueSource>, queue: &Arc<WorkQueue>) -> TaskDiscoverer {
    let detector = Detector::new(
        PlatformCatalog::default(),
        CapabilityProfile::new().with("nodejs", Version::new(18, 16, 0)),
    );
    TaskDiscoverer::new(source.clone(), queue.clone(), detector).with_retry(&quick_retry(3))
}

#[tokio::test]
async fn test_new_items_are_queued_and_labeled() {
    let source = MockIssueSource::new(vec![
        item(1, "Flask route 404s", "pytest is red too", &["claude-bot"]),
        item(2, "Button misaligned", "", &["claude-bot", "priority:high"]),
    ]);
    let queue = Arc::new(WorkQueue::in_memory(fast_policy(3)));

    let discovered = discoverer(&source, &queue).poll().await;

    assert_eq!(discovered.len(), 2);
    assert_eq!(queue.counts().await.pending, 2);

    let flask = queue.get(&TaskId::from_source(&source_id(1))).await.unwrap();
    assert!(flask.requirements.contains("python"));
    assert_eq!(flask.priority, Priority::Normal);
    assert_eq!(flask.payload["title"], "Flask route 404s");

    // Nothing in the text names a platform: the default profile applies.
    let button = queue.get(&TaskId::from_source(&source_id(2))).await.unwrap();
    assert!(button.requirements.contains("nodejs"));
    assert_eq!(button.priority, Priority::High);

    assert_eq!(source.last_status(&source_id(1)), Some(IssueStatus::Queued));
    assert_eq!(source.last_status(&source_id(2)), Some(IssueStatus::Queued));
}

#[tokio::test]
async fn test_rediscovery_is_idempotent() {
    let source = MockIssueSource::new(vec![item(1, "Fix npm build", "", &["claude-bot"])]);
    let queue = Arc::new(WorkQueue::in_memory(fast_policy(3)));
    let discoverer = discoverer(&source, &queue);

    assert_eq!(discoverer.poll().await.len(), 1);
    assert!(discoverer.poll().await.is_empty());
    assert!(discoverer.poll().await.is_empty());

    assert_eq!(queue.len().await, 1);
    assert_eq!(source.annotations_for(&source_id(1)).len(), 1);
}

#[tokio::test]
async fn test_handled_items_are_skipped() {
    let source = MockIssueSource::new(vec![
        item(1, "a", "", &["claude-bot", "bot:in-progress"]),
        item(2, "b", "", &["claude-bot", "bot:completed"]),
        item(3, "c", "", &["claude-bot", "bot:failed"]),
        item(4, "d", "", &["claude-bot", "bot:queued"]),
    ]);
    let queue = Arc::new(WorkQueue::in_memory(fast_policy(3)));

    let discovered = discoverer(&source, &queue).poll().await;

    // Only the queued item comes back, e.g. after the queue directory was lost.
    assert_eq!(discovered.len(), 1);
    assert_eq!(discovered[0].source_id, source_id(4));
    assert_eq!(discovered[0].state, TaskState::Pending);
}

#[tokio::test]
async fn test_transient_source_errors_are_retried() {
    let source = MockIssueSource::new(vec![item(1, "Fix it", "", &["claude-bot"])]);
    source.fail_next(2);
    let queue = Arc::new(WorkQueue::in_memory(fast_policy(3)));

    let discovered = discoverer(&source, &queue).poll().await;

    assert_eq!(source.list_calls(), 3);
    assert_eq!(discovered.len(), 1);
}

#[tokio::test]
async fn test_unreachable_source_yields_empty_batch() {
    let source = MockIssueSource::new(vec![item(1, "Fix it", "", &["claude-bot"])]);
    source.fail_next(10);
    let queue = Arc::new(WorkQueue::in_memory(fast_policy(3)));
    let discoverer = discoverer(&source, &queue).with_retry(&quick_retry(2));

    assert!(discoverer.poll().await.is_empty());
    assert_eq!(source.list_calls(), 2);
    assert!(queue.is_empty().await);
}

#[tokio::test]
async fn test_workspace_manifests_drive_requirements() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(".nvmrc"), "20\n").unwrap();
    std::fs::write(dir.path().join("go.mod"), "module x\n\ngo 1.22\n").unwrap();

    let source = MockIssueSource::new(vec![item(1, "Fix it", "", &["claude-bot"])]);
    let queue = Arc::new(WorkQueue::in_memory(fast_policy(3)));
    let discoverer =
        discoverer(&source, &queue).with_workspace(Some(dir.path().to_path_buf()));

    let discovered = discoverer.poll().await;
    let requirements = &discovered[0].requirements;
    assert_eq!(requirements.len(), 2);
    assert_eq!(requirements.get("nodejs").unwrap().range.as_str(), "20");
    assert_eq!(requirements.get("golang").unwrap().range.as_str(), ">=1.22");
}
