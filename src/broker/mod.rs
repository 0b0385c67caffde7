//! Notification / Topic Broker
//!
//! The broker is the single writer of topics, subscriptions, messages and
//! consumer offsets. Every publish gets the next offset of its topic, is
//! persisted with one recipient row per recipient, and is then pushed to the
//! recipients that hold a live session. Live push is best effort; the log is
//! the source of truth and agents catch up with [`BrokerClient::replay`].

pub mod actor;
pub mod client;
pub mod model;
pub mod replay;
pub mod subscriber;

pub use actor::{BrokerActor, BrokerArgs, BrokerMessage, SYSTEM_AGENT};
pub use client::BrokerClient;
pub use model::{
    Agent, AgentProfile, InboxEntry, InboxFilter, Message, PublishReceipt, PublishRequest,
    RecipientState, Topic, TopicKind, TopicSpec,
};
pub use replay::ReplayStream;
pub use subscriber::Session;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerSettings, NotifyMode};
    use crate::error::HermesError;
    use crate::runtime::mailbox::MailboxPolicy;
    use crate::runtime::registry::{ServiceKey, ServiceRegistry};
    use crate::runtime::{spawn, Addr};
    use crate::storage::Store;
    use crate::types::{AgentId, TopicId};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn start_broker(
        settings: BrokerSettings,
    ) -> (TempDir, BrokerClient, Addr<BrokerMessage>) {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open_path(temp_dir.path().join("broker.db"))
            .await
            .unwrap();
        let registry = ServiceRegistry::new();

        let (addr, _handle) = spawn(
            Some(format!("broker-{}", uuid::Uuid::new_v4())),
            BrokerActor,
            BrokerArgs {
                store: store.clone(),
                settings: settings.clone(),
                session_mailbox: MailboxPolicy::default(),
                scope: None,
            },
            MailboxPolicy::default(),
        )
        .await
        .unwrap();
        registry.register(ServiceKey::broker(), addr.clone()).await;

        let client = BrokerClient::new(registry, store, settings, Duration::from_secs(5));
        (temp_dir, client, addr)
    }

    async fn register(client: &BrokerClient, names: &[&str]) {
        for name in names {
            client
                .register_agent(AgentProfile::named(*name))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_offsets_are_strictly_increasing() {
        let (_dir, client, broker) = start_broker(BrokerSettings::default()).await;
        register(&client, &["alice", "bob"]).await;
        client
            .create_topic(TopicSpec::broadcast("builds"))
            .await
            .unwrap();

        let mut offsets = Vec::new();
        for i in 0..5 {
            let receipt = client
                .publish(PublishRequest::new("builds", "alice", format!("build {}", i), "ok"))
                .await
                .unwrap();
            offsets.push(receipt.offset);
        }
        assert_eq!(offsets, vec![1, 2, 3, 4, 5]);

        broker.stop(None);
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe_are_idempotent() {
        let (_dir, client, broker) = start_broker(BrokerSettings::default()).await;
        register(&client, &["alice"]).await;
        client
            .create_topic(TopicSpec::broadcast("builds"))
            .await
            .unwrap();

        let alice = AgentId::new("alice");
        let builds = TopicId::new("builds");
        assert!(client.subscribe(&alice, &builds).await.unwrap());
        assert!(!client.subscribe(&alice, &builds).await.unwrap());
        assert!(client.unsubscribe(&alice, &builds).await.unwrap());
        assert!(!client.unsubscribe(&alice, &builds).await.unwrap());

        broker.stop(None);
    }

    #[tokio::test]
    async fn test_unknown_topic_and_agent_rejected() {
        let (_dir, client, broker) = start_broker(BrokerSettings::default()).await;
        register(&client, &["alice"]).await;

        let err = client
            .publish(PublishRequest::new("missing", "alice", "s", "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, HermesError::UnknownTopic(_)));

        client
            .create_topic(TopicSpec::broadcast("builds"))
            .await
            .unwrap();
        let err = client
            .publish(PublishRequest::new("builds", "mallory", "s", "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, HermesError::UnknownAgent(_)));

        let err = client
            .replay_all(&AgentId::new("alice"), &TopicId::new("missing"), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, HermesError::UnknownTopic(_)));

        broker.stop(None);
    }

    #[tokio::test]
    async fn test_queue_topic_requires_targets() {
        let (_dir, client, broker) = start_broker(BrokerSettings::default()).await;
        register(&client, &["alice", "bob"]).await;
        client.create_topic(TopicSpec::queue("jobs")).await.unwrap();
        client
            .create_topic(TopicSpec::broadcast("builds"))
            .await
            .unwrap();

        let err = client
            .publish(PublishRequest::new("jobs", "alice", "job", "run"))
            .await
            .unwrap_err();
        assert!(matches!(err, HermesError::InvalidRequest(_)));

        let err = client
            .publish(PublishRequest::new("builds", "alice", "s", "b").to([AgentId::new("bob")]))
            .await
            .unwrap_err();
        assert!(matches!(err, HermesError::InvalidRequest(_)));

        let receipt = client
            .publish(
                PublishRequest::new("jobs", "alice", "job", "run")
                    .to([AgentId::new("bob"), AgentId::new("bob")]),
            )
            .await
            .unwrap();
        assert_eq!(receipt.recipients, vec![AgentId::new("bob")]);

        // Queue replay only shows messages addressed to the reader
        let jobs = TopicId::new("jobs");
        assert_eq!(
            client
                .replay_all(&AgentId::new("bob"), &jobs, 0)
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(client
            .replay_all(&AgentId::new("alice"), &jobs, 0)
            .await
            .unwrap()
            .is_empty());

        broker.stop(None);
    }

    #[tokio::test]
    async fn test_create_topic_conflicting_kind() {
        let (_dir, client, broker) = start_broker(BrokerSettings::default()).await;
        client
            .create_topic(TopicSpec::broadcast("builds"))
            .await
            .unwrap();
        client
            .create_topic(TopicSpec::broadcast("builds"))
            .await
            .unwrap();

        let err = client
            .create_topic(TopicSpec::queue("builds"))
            .await
            .unwrap_err();
        assert!(matches!(err, HermesError::InvalidRequest(_)));

        let err = client
            .create_topic(TopicSpec::broadcast("inbox:alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, HermesError::InvalidRequest(_)));

        broker.stop(None);
    }

    #[tokio::test]
    async fn test_idempotent_publish_returns_original_offset() {
        let (_dir, client, broker) = start_broker(BrokerSettings::default()).await;
        register(&client, &["alice"]).await;
        client
            .create_topic(TopicSpec::broadcast("builds"))
            .await
            .unwrap();

        let request =
            PublishRequest::new("builds", "alice", "s", "b").with_idempotency_key("op-1");
        let first = client.publish(request.clone()).await.unwrap();
        let second = client.publish(request).await.unwrap();

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.message_id, second.message_id);
        assert_eq!(first.offset, second.offset);
        assert_eq!(client.topic(&TopicId::new("builds")).await.unwrap().last_offset, 1);

        broker.stop(None);
    }

    #[tokio::test]
    async fn test_same_key_through_two_brokers_publishes_once() {
        let (dir, client, broker) = start_broker(BrokerSettings::default()).await;
        register(&client, &["alice"]).await;
        client
            .create_topic(TopicSpec::broadcast("builds"))
            .await
            .unwrap();

        let store = Store::open_path(dir.path().join("broker.db")).await.unwrap();
        let (scoped, _handle) = spawn(
            None,
            BrokerActor,
            BrokerArgs {
                store,
                settings: BrokerSettings::default(),
                session_mailbox: MailboxPolicy::default(),
                scope: Some(TopicId::new("builds")),
            },
            MailboxPolicy::default(),
        )
        .await
        .unwrap();

        let request =
            PublishRequest::new("builds", "alice", "s", "b").with_idempotency_key("op-1");
        let publish = |addr: Addr<BrokerMessage>, request: PublishRequest| async move {
            addr.request(
                |reply| BrokerMessage::Publish {
                    request,
                    reply: Some(reply),
                },
                Duration::from_secs(5),
            )
            .await
            .unwrap()
            .unwrap()
        };

        let (left, right) = tokio::join!(
            publish(broker.clone(), request.clone()),
            publish(scoped.clone(), request)
        );
        assert_eq!(left.message_id, right.message_id);
        assert!(left.deduplicated != right.deduplicated);
        assert_eq!(client.topic(&TopicId::new("builds")).await.unwrap().last_offset, 1);

        scoped.stop(None);
        broker.stop(None);
    }

    #[tokio::test]
    async fn test_advance_offset_is_monotonic() {
        let (_dir, client, broker) = start_broker(BrokerSettings::default()).await;
        register(&client, &["alice"]).await;
        client
            .create_topic(TopicSpec::broadcast("builds"))
            .await
            .unwrap();
        for _ in 0..3 {
            client
                .publish(PublishRequest::new("builds", "alice", "s", "b"))
                .await
                .unwrap();
        }

        let alice = AgentId::new("alice");
        let builds = TopicId::new("builds");
        assert_eq!(client.advance_offset(&alice, &builds, 2).await.unwrap(), 2);
        assert_eq!(client.advance_offset(&alice, &builds, 1).await.unwrap(), 2);
        assert_eq!(client.consumer_offset(&alice, &builds).await.unwrap(), 2);

        let err = client.advance_offset(&alice, &builds, 9).await.unwrap_err();
        assert!(matches!(err, HermesError::InvalidRequest(_)));

        broker.stop(None);
    }

    #[tokio::test]
    async fn test_mail_lands_in_inbox_and_is_pushed() {
        let (_dir, client, broker) = start_broker(BrokerSettings::default()).await;
        register(&client, &["alice", "bob"]).await;
        let bob = AgentId::new("bob");

        let mut session = client.connect(&bob).await.unwrap();
        let receipts = client
            .send_mail(
                &AgentId::new("alice"),
                &[bob.clone()],
                "hello",
                "are you there?",
                Some("thread-1"),
                crate::types::Priority::High,
                None,
            )
            .await
            .unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].pushed, 1);

        let pushed = tokio::time::timeout(Duration::from_secs(1), session.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pushed.subject, "hello");
        assert_eq!(pushed.topic, TopicId::inbox(&bob));

        let inbox = client.inbox(&bob, InboxFilter::default()).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].state, RecipientState::Unread);

        client
            .set_recipient_state(pushed.id, &bob, RecipientState::Read)
            .await
            .unwrap();
        client.acknowledge(pushed.id, &bob).await.unwrap();
        let inbox = client.inbox(&bob, InboxFilter::default()).await.unwrap();
        assert_eq!(inbox[0].state, RecipientState::Read);
        assert!(inbox[0].read_at.is_some());
        assert!(inbox[0].acked_at.is_some());

        let err = client
            .acknowledge(pushed.id, &AgentId::new("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, HermesError::InvalidRequest(_)));

        broker.stop(None);
    }

    #[tokio::test]
    async fn test_all_subscribers_notify_mode() {
        let settings = BrokerSettings {
            notify_mode: NotifyMode::AllSubscribers,
            ..BrokerSettings::default()
        };
        let (_dir, client, broker) = start_broker(settings).await;
        register(&client, &["lead", "bob", "carol"]).await;
        client.create_topic(TopicSpec::queue("jobs")).await.unwrap();

        let bob = AgentId::new("bob");
        client.subscribe(&bob, &TopicId::new("jobs")).await.unwrap();
        let mut session = client.connect(&bob).await.unwrap();

        // Bob is not addressed but still hears it as a subscriber
        let receipt = client
            .publish(PublishRequest::new("jobs", "lead", "job", "run").to([AgentId::new("carol")]))
            .await
            .unwrap();
        assert_eq!(receipt.recipients, vec![AgentId::new("carol")]);
        assert_eq!(receipt.pushed, 1);
        assert!(tokio::time::timeout(Duration::from_secs(1), session.recv())
            .await
            .unwrap()
            .is_some());

        broker.stop(None);
    }

    #[tokio::test]
    async fn test_search_finds_published_messages() {
        let (_dir, client, broker) = start_broker(BrokerSettings::default()).await;
        register(&client, &["alice"]).await;
        client
            .create_topic(TopicSpec::broadcast("builds"))
            .await
            .unwrap();
        client
            .publish(PublishRequest::new("builds", "alice", "deploy failed", "timeout in stage"))
            .await
            .unwrap();
        client
            .publish(PublishRequest::new("builds", "alice", "deploy ok", "all green"))
            .await
            .unwrap();

        let found = client.search("timeout", 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].subject, "deploy failed");

        broker.stop(None);
    }
}
