//! Pending operation queue integration tests

mod common;

use common::{register_agents, start_engine, subject, test_config, ScriptedReviewModel};
use hermes_core::broker::{PublishRequest, TopicSpec};
use hermes_core::queue::OperationStatus;
use hermes_core::review::{CreateReviewRequest, ReviewFilter, ReviewType};
use hermes_core::{AgentId, EnqueueRequest, HermesError, OperationPayload, TopicId};
use std::collections::HashSet;
use std::time::Duration;
use tempfile::TempDir;

fn subscribe(topic: &str) -> OperationPayload {
    OperationPayload::Subscribe {
        topic: TopicId::new(topic),
    }
}

#[tokio::test]
async fn test_enqueue_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let engine = start_engine(test_config(&dir), ScriptedReviewModel::hanging()).await;
    let queue = engine.queue();

    let first = queue
        .enqueue(EnqueueRequest::new("op-1", "alice", subscribe("builds")))
        .await
        .unwrap();
    // Same key, different payload: the stored record wins
    let second = queue
        .enqueue(EnqueueRequest::new("op-1", "alice", subscribe("deploys")))
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.payload, subscribe("builds"));
    assert_eq!(
        queue.operations(&AgentId::new("alice")).await.unwrap().len(),
        1
    );

    let err = queue
        .enqueue(EnqueueRequest::new("  ", "alice", subscribe("builds")))
        .await
        .unwrap_err();
    assert!(matches!(err, HermesError::InvalidRequest(_)));

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_drain_claims_in_creation_order_exactly_once() {
    let dir = TempDir::new().unwrap();
    let engine = start_engine(test_config(&dir), ScriptedReviewModel::hanging()).await;
    let queue = engine.queue();

    for (key, topic) in [("a", "t1"), ("b", "t2"), ("c", "t3")] {
        queue
            .enqueue(EnqueueRequest::new(key, "alice", subscribe(topic)))
            .await
            .unwrap();
    }
    queue
        .enqueue(EnqueueRequest::new("d", "bob", subscribe("t1")))
        .await
        .unwrap();

    let alice = AgentId::new("alice");
    let (left, right) = tokio::join!(queue.drain(&alice), queue.drain(&alice));
    let (left, right) = (left.unwrap(), right.unwrap());

    // One drain wins everything, the other sees nothing
    let claimed = if left.is_empty() { right } else { left };
    let keys: Vec<&str> = claimed.iter().map(|op| op.idempotency_key.as_str()).collect();
    assert_eq!(keys, vec!["a", "b", "c"]);
    assert!(claimed.windows(2).all(|w| w[0].seq < w[1].seq));
    assert!(claimed
        .iter()
        .all(|op| op.status == OperationStatus::Delivering));

    let unique: HashSet<_> = claimed.iter().map(|op| op.id).collect();
    assert_eq!(unique.len(), 3);

    assert!(queue.drain(&alice).await.unwrap().is_empty());
    assert_eq!(queue.drain(&AgentId::new("bob")).await.unwrap().len(), 1);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_mark_failed_retries_until_attempt_limit() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.queue.max_attempts = Some(2);
    let engine = start_engine(config, ScriptedReviewModel::hanging()).await;
    let queue = engine.queue();
    let alice = AgentId::new("alice");

    let op = queue
        .enqueue(EnqueueRequest::new("op-1", "alice", subscribe("builds")))
        .await
        .unwrap();

    queue.drain(&alice).await.unwrap();
    let failed_once = queue.mark_failed(op.id, "broker unavailable").await.unwrap();
    assert_eq!(failed_once.status, OperationStatus::Pending);
    assert_eq!(failed_once.attempts, 1);
    assert_eq!(failed_once.last_error.as_deref(), Some("broker unavailable"));

    // Back in the next drain
    assert_eq!(queue.drain(&alice).await.unwrap().len(), 1);
    let failed_twice = queue.mark_failed(op.id, "still unavailable").await.unwrap();
    assert_eq!(failed_twice.status, OperationStatus::Failed);
    assert!(queue.drain(&alice).await.unwrap().is_empty());

    let err = queue.mark_delivered(op.id).await.unwrap_err();
    assert!(matches!(err, HermesError::InvalidRequest(_)));

    // Delivered is final and acknowledging twice is harmless
    let other = queue
        .enqueue(EnqueueRequest::new("op-2", "alice", subscribe("builds")))
        .await
        .unwrap();
    queue.drain(&alice).await.unwrap();
    queue.mark_delivered(other.id).await.unwrap();
    let again = queue.mark_delivered(other.id).await.unwrap();
    assert_eq!(again.status, OperationStatus::Delivered);
    let err = queue.mark_failed(other.id, "late failure").await.unwrap_err();
    assert!(matches!(err, HermesError::InvalidRequest(_)));

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_expired_operations_are_never_drained() {
    let dir = TempDir::new().unwrap();
    let engine = start_engine(test_config(&dir), ScriptedReviewModel::hanging()).await;
    let queue = engine.queue();

    queue
        .enqueue(
            EnqueueRequest::new("short", "alice", subscribe("builds"))
                .with_ttl(Duration::from_millis(50)),
        )
        .await
        .unwrap();
    queue
        .enqueue(EnqueueRequest::new("long", "alice", subscribe("deploys")))
        .await
        .unwrap();
    queue
        .enqueue(
            EnqueueRequest::new("bob-short", "bob", subscribe("builds"))
                .with_ttl(Duration::from_millis(50)),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    // Past its TTL before any purge: reported expired, never drained
    let err = queue.operation_status("bob-short").await.unwrap_err();
    assert!(matches!(err, HermesError::OperationExpired(_)));

    let drained = queue.drain(&AgentId::new("alice")).await.unwrap();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].idempotency_key, "long");

    let err = queue.operation_status("short").await.unwrap_err();
    assert!(matches!(err, HermesError::OperationExpired(_)));
    assert_eq!(err.kind(), hermes_core::ErrorKind::Fatal);

    // Alice's was expired lazily by the drain; only Bob's is left to purge
    let report = engine.sweep().await.unwrap();
    assert_eq!(report.expired_operations, 1);
    assert!(queue
        .drain(&AgentId::new("bob"))
        .await
        .unwrap()
        .is_empty());

    let err = queue.operation_status("missing").await.unwrap_err();
    assert!(matches!(err, HermesError::OperationNotFound(_)));

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_replays_queued_operations() {
    let dir = TempDir::new().unwrap();
    let engine = start_engine(test_config(&dir), ScriptedReviewModel::hanging()).await;
    register_agents(&engine, &["alice", "bob"]).await;
    engine
        .broker()
        .create_topic(TopicSpec::broadcast("builds"))
        .await
        .unwrap();
    let queue = engine.queue();
    let alice = AgentId::new("alice");

    // Issued while alice was offline
    queue
        .enqueue(EnqueueRequest::new("sub-1", "alice", subscribe("builds")))
        .await
        .unwrap();
    queue
        .enqueue(EnqueueRequest::new(
            "pub-1",
            "alice",
            OperationPayload::Publish(PublishRequest::new("builds", "alice", "build 7", "green")),
        ))
        .await
        .unwrap();
    queue
        .enqueue(EnqueueRequest::new(
            "pub-forged",
            "alice",
            OperationPayload::Publish(PublishRequest::new("builds", "bob", "forged", "x")),
        ))
        .await
        .unwrap();

    let (report, _session) = engine.reconnect(&alice).await.unwrap();
    assert_eq!(report.delivered.len(), 2);
    assert_eq!(report.failed.len(), 1);

    let builds = TopicId::new("builds");
    assert!(engine
        .broker()
        .subscriptions(&alice)
        .await
        .unwrap()
        .contains(&builds));
    let log = engine.broker().replay_all(&alice, &builds, 0).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].idempotency_key.as_deref(), Some("pub-1"));

    let forged = queue.operation_status("pub-forged").await.unwrap();
    assert_eq!(forged.status, OperationStatus::Pending);
    assert_eq!(forged.attempts, 1);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_queued_review_request_lands_once() {
    let dir = TempDir::new().unwrap();
    let engine = start_engine(test_config(&dir), ScriptedReviewModel::hanging()).await;
    register_agents(&engine, &["alice"]).await;
    let queue = engine.queue();
    let alice = AgentId::new("alice");

    let request = CreateReviewRequest::new(subject(&dir), ReviewType::Security, "alice");

    // The review was created but the acknowledgement was lost
    engine
        .reviews()
        .create_review(request.clone().with_idempotency_key("review-op"))
        .await
        .unwrap();

    for _ in 0..2 {
        queue
            .enqueue(EnqueueRequest::new(
                "review-op",
                "alice",
                OperationPayload::CreateReview(request.clone()),
            ))
            .await
            .unwrap();
    }

    let (report, _session) = engine.reconnect(&alice).await.unwrap();
    assert_eq!(report.delivered.len(), 1);
    assert!(report.failed.is_empty());

    let reviews = engine
        .reviews()
        .list_reviews(ReviewFilter::default())
        .await
        .unwrap();
    assert_eq!(reviews.len(), 1);
    assert_eq!(
        queue.operation_status("review-op").await.unwrap().status,
        OperationStatus::Delivered
    );

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_unsettled_claims_return_to_pending() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.queue.claim_lease_secs = 0;
    let engine = start_engine(config, ScriptedReviewModel::hanging()).await;
    let queue = engine.queue();
    let alice = AgentId::new("alice");

    let released = queue
        .enqueue(EnqueueRequest::new("op-1", "alice", subscribe("builds")))
        .await
        .unwrap();
    queue
        .enqueue(EnqueueRequest::new("op-2", "alice", subscribe("deploys")))
        .await
        .unwrap();

    // The delivering side went away after claiming both
    assert_eq!(queue.drain(&alice).await.unwrap().len(), 2);
    assert!(queue.drain(&alice).await.unwrap().is_empty());

    let back = queue.release(released.id).await.unwrap().unwrap();
    assert_eq!(back.status, OperationStatus::Pending);
    assert_eq!(back.attempts, 0);
    assert!(queue.release(released.id).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(20)).await;
    let report = engine.sweep().await.unwrap();
    assert_eq!(report.expired_operations, 0);

    let redrained = queue.drain(&alice).await.unwrap();
    let keys: Vec<&str> = redrained
        .iter()
        .map(|op| op.idempotency_key.as_str())
        .collect();
    assert_eq!(keys, vec!["op-1", "op-2"]);

    engine.stop().await.unwrap();
}
