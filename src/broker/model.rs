//! Broker data model: agents, topics, messages and per-recipient state

use crate::types::{AgentId, LogOffset, MessageId, Priority, TopicId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Registered agent identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub name: AgentId,
    pub program: Option<String>,
    pub model: Option<String>,
    pub session_id: Option<String>,
    pub metadata: serde_json::Value,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Registration request; re-registering refreshes everything but `registered_at`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: AgentId,
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl AgentProfile {
    pub fn named(name: impl Into<AgentId>) -> Self {
        Self {
            name: name.into(),
            program: None,
            model: None,
            session_id: None,
            metadata: serde_json::Value::Null,
        }
    }
}

/// Delivery semantics of a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicKind {
    /// Explicitly addressed; agent inboxes are direct topics
    Direct,
    /// Every subscriber is a recipient
    Broadcast,
    /// Explicitly addressed work items
    Queue,
}

impl TopicKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicKind::Direct => "direct",
            TopicKind::Broadcast => "broadcast",
            TopicKind::Queue => "queue",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(TopicKind::Direct),
            "broadcast" => Some(TopicKind::Broadcast),
            "queue" => Some(TopicKind::Queue),
            _ => None,
        }
    }

    /// Whether publishers must name recipients
    pub fn requires_targets(&self) -> bool {
        !matches!(self, TopicKind::Broadcast)
    }
}

impl std::fmt::Display for TopicKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub name: TopicId,
    pub kind: TopicKind,
    /// Messages older than this are pruned; offsets are never reused
    pub retention_secs: Option<u64>,
    /// Highest offset minted so far (0 when empty)
    pub last_offset: LogOffset,
    pub created_at: DateTime<Utc>,
}

impl Topic {
    pub fn retention(&self) -> Option<Duration> {
        self.retention_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSpec {
    pub name: TopicId,
    pub kind: TopicKind,
    #[serde(default)]
    pub retention_secs: Option<u64>,
}

impl TopicSpec {
    pub fn broadcast(name: impl Into<TopicId>) -> Self {
        Self {
            name: name.into(),
            kind: TopicKind::Broadcast,
            retention_secs: None,
        }
    }

    pub fn queue(name: impl Into<TopicId>) -> Self {
        Self {
            name: name.into(),
            kind: TopicKind::Queue,
            retention_secs: None,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention_secs = Some(retention.as_secs());
        self
    }
}

/// Immutable once published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub topic: TopicId,
    pub offset: LogOffset,
    pub sender: AgentId,
    pub thread_id: Option<String>,
    pub priority: Priority,
    pub subject: String,
    pub body: String,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub topic: TopicId,
    pub sender: AgentId,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Required (non-empty) for direct and queue topics, rejected for broadcast
    #[serde(default)]
    pub targets: Vec<AgentId>,
    /// A repeated key returns the original receipt instead of publishing again
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl PublishRequest {
    pub fn new(
        topic: impl Into<TopicId>,
        sender: impl Into<AgentId>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            sender: sender.into(),
            subject: subject.into(),
            body: body.into(),
            thread_id: None,
            priority: Priority::Normal,
            targets: Vec::new(),
            idempotency_key: None,
        }
    }

    pub fn to(mut self, targets: impl IntoIterator<Item = AgentId>) -> Self {
        self.targets = targets.into_iter().collect();
        self
    }

    pub fn in_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub message_id: MessageId,
    pub topic: TopicId,
    pub offset: LogOffset,
    pub recipients: Vec<AgentId>,
    /// Live pushes attempted; zero for deduplicated publishes
    pub pushed: usize,
    /// True when an earlier publish with the same idempotency key was returned
    pub deduplicated: bool,
}

/// Mutable per-recipient message state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientState {
    Unread,
    Read,
    Starred,
    /// Hidden until the recipient brings it back
    Snoozed,
    Archived,
    Trash,
}

impl RecipientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientState::Unread => "unread",
            RecipientState::Read => "read",
            RecipientState::Starred => "starred",
            RecipientState::Snoozed => "snoozed",
            RecipientState::Archived => "archived",
            RecipientState::Trash => "trash",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unread" => Some(RecipientState::Unread),
            "read" => Some(RecipientState::Read),
            "starred" => Some(RecipientState::Starred),
            "snoozed" => Some(RecipientState::Snoozed),
            "archived" => Some(RecipientState::Archived),
            "trash" => Some(RecipientState::Trash),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxEntry {
    pub message: Message,
    pub state: RecipientState,
    pub read_at: Option<DateTime<Utc>>,
    pub acked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxFilter {
    pub state: Option<RecipientState>,
    pub unacked_only: bool,
    pub limit: usize,
}

impl Default for InboxFilter {
    fn default() -> Self {
        Self {
            state: None,
            unacked_only: false,
            limit: 100,
        }
    }
}
