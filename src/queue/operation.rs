//! Pending operation records

use crate::broker::PublishRequest;
use crate::review::CreateReviewRequest;
use crate::types::{AgentId, LogOffset, OperationId, TopicId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting for the origin agent to reconnect
    Pending,
    /// Claimed by a drain
    Delivering,
    Delivered,
    /// Gave up after the attempt limit
    Failed,
    /// Outlived its TTL while pending
    Expired,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Delivering => "delivering",
            OperationStatus::Delivered => "delivered",
            OperationStatus::Failed => "failed",
            OperationStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OperationStatus::Pending),
            "delivering" => Some(OperationStatus::Delivering),
            "delivered" => Some(OperationStatus::Delivered),
            "failed" => Some(OperationStatus::Failed),
            "expired" => Some(OperationStatus::Expired),
            _ => None,
        }
    }
}

/// A command queued while its issuer was offline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationPayload {
    Publish(PublishRequest),
    CreateReview(CreateReviewRequest),
    Subscribe { topic: TopicId },
    Unsubscribe { topic: TopicId },
    AdvanceOffset { topic: TopicId, offset: LogOffset },
}

impl OperationPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            OperationPayload::Publish(_) => "publish",
            OperationPayload::CreateReview(_) => "create_review",
            OperationPayload::Subscribe { .. } => "subscribe",
            OperationPayload::Unsubscribe { .. } => "unsubscribe",
            OperationPayload::AdvanceOffset { .. } => "advance_offset",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: OperationId,
    /// Creation order across the queue
    pub seq: u64,
    pub idempotency_key: String,
    pub origin_agent: AgentId,
    pub origin_session: Option<String>,
    pub payload: OperationPayload,
    pub status: OperationStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingOperation {
    /// Expired, or still pending past its TTL
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            OperationStatus::Expired => true,
            OperationStatus::Pending => self.expires_at <= now,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub idempotency_key: String,
    pub origin_agent: AgentId,
    #[serde(default)]
    pub origin_session: Option<String>,
    pub payload: OperationPayload,
    /// Defaults to the queue's configured TTL
    #[serde(default)]
    pub ttl: Option<Duration>,
}

impl EnqueueRequest {
    pub fn new(
        idempotency_key: impl Into<String>,
        origin_agent: impl Into<AgentId>,
        payload: OperationPayload,
    ) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            origin_agent: origin_agent.into(),
            origin_session: None,
            payload,
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn from_session(mut self, session: impl Into<String>) -> Self {
        self.origin_session = Some(session.into());
        self
    }
}

/// Result of replaying an agent's queued operations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub delivered: Vec<OperationId>,
    /// Operations that failed, with the error they failed with
    pub failed: Vec<(OperationId, String)>,
}
