//! Queue client

use super::actor::QueueMessage;
use super::operation::{EnqueueRequest, PendingOperation};
use crate::error::{HermesError, Result};
use crate::runtime::registry::{ServiceKey, ServiceRegistry};
use crate::runtime::Addr;
use crate::storage::{operations as db, Store};
use crate::types::{AgentId, OperationId};
use chrono::Utc;
use ractor::RpcReplyPort;
use std::time::Duration;

#[derive(Clone)]
pub struct QueueClient {
    registry: ServiceRegistry,
    store: Store,
    timeout: Duration,
}

impl QueueClient {
    pub fn new(registry: ServiceRegistry, store: Store, timeout: Duration) -> Self {
        Self {
            registry,
            store,
            timeout,
        }
    }

    async fn queue(&self) -> Result<Addr<QueueMessage>> {
        self.registry
            .lookup(&ServiceKey::pending_queue())
            .await
            .ok_or_else(|| HermesError::ActorUnavailable(ServiceKey::PENDING_QUEUE.to_string()))
    }

    async fn call<T, F>(&self, build: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(RpcReplyPort<Result<T>>) -> QueueMessage,
    {
        self.queue().await?.request(build, self.timeout).await?
    }

    /// Idempotent: a known key returns the stored operation unchanged
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<PendingOperation> {
        let (operation, _created) = self
            .call(|reply| QueueMessage::Enqueue { request, reply })
            .await?;
        Ok(operation)
    }

    pub async fn drain(&self, agent: &AgentId) -> Result<Vec<PendingOperation>> {
        let agent = agent.clone();
        self.call(|reply| QueueMessage::Drain { agent, reply })
            .await
    }

    pub async fn mark_delivered(&self, id: OperationId) -> Result<PendingOperation> {
        self.call(|reply| QueueMessage::MarkDelivered { id, reply })
            .await
    }

    pub async fn mark_failed(
        &self,
        id: OperationId,
        error: impl Into<String>,
    ) -> Result<PendingOperation> {
        let error = error.into();
        self.call(|reply| QueueMessage::MarkFailed { id, error, reply })
            .await
    }

    /// Hand a claim back without counting an attempt; `None` if not claimed
    pub async fn release(&self, id: OperationId) -> Result<Option<PendingOperation>> {
        self.call(|reply| QueueMessage::Release { id, reply })
            .await
    }

    pub async fn purge_expired(&self) -> Result<usize> {
        self.call(QueueMessage::PurgeExpired).await
    }

    /// Look an operation up by idempotency key.
    ///
    /// An expired operation, or one still pending past its TTL, is reported
    /// as `OperationExpired` rather than returned.
    pub async fn operation_status(&self, key: &str) -> Result<PendingOperation> {
        let lookup = key.to_string();
        let operation = self
            .store
            .read(move |conn| db::find_by_key(conn, &lookup))
            .await?
            .ok_or_else(|| HermesError::OperationNotFound(key.to_string()))?;

        if operation.is_expired(Utc::now()) {
            return Err(HermesError::OperationExpired(operation.idempotency_key));
        }
        Ok(operation)
    }

    pub async fn operation(&self, id: OperationId) -> Result<PendingOperation> {
        self.store
            .read(move |conn| db::get_operation(conn, &id))
            .await?
            .ok_or_else(|| HermesError::OperationNotFound(id.to_string()))
    }

    /// Every operation an agent has queued, in creation order
    pub async fn operations(&self, agent: &AgentId) -> Result<Vec<PendingOperation>> {
        let agent = agent.clone();
        self.store
            .read(move |conn| db::operations_for_agent(conn, &agent))
            .await
    }
}
