//! Queue Actor
//!
//! Sole writer of the pending operation table. Drain claims run on this
//! actor's mailbox, so two concurrent drains for the same agent can never
//! hand out the same operation.

use super::operation::{EnqueueRequest, OperationStatus, PendingOperation};
use crate::config::QueueSettings;
use crate::error::{HermesError, Result};
use crate::storage::{operations as db, Store};
use crate::types::{AgentId, OperationId};
use chrono::Utc;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};

pub enum QueueMessage {
    /// Store an operation; replies with the record and whether it is new
    Enqueue {
        request: EnqueueRequest,
        reply: RpcReplyPort<Result<(PendingOperation, bool)>>,
    },

    /// Claim every live pending operation of an agent, oldest first
    Drain {
        agent: AgentId,
        reply: RpcReplyPort<Result<Vec<PendingOperation>>>,
    },

    MarkDelivered {
        id: OperationId,
        reply: RpcReplyPort<Result<PendingOperation>>,
    },

    MarkFailed {
        id: OperationId,
        error: String,
        reply: RpcReplyPort<Result<PendingOperation>>,
    },

    /// Hand a claimed operation back to `pending` without counting an attempt
    Release {
        id: OperationId,
        reply: RpcReplyPort<Result<Option<PendingOperation>>>,
    },

    /// Expire pending operations past their TTL and reclaim claims past the
    /// lease; replies with the expired count
    PurgeExpired(RpcReplyPort<Result<usize>>),
}

#[derive(Clone)]
pub struct QueueArgs {
    pub store: Store,
    pub settings: QueueSettings,
}

pub struct QueueState {
    store: Store,
    settings: QueueSettings,
}

pub struct QueueActor;

impl QueueActor {
    async fn enqueue(
        state: &QueueState,
        request: EnqueueRequest,
    ) -> Result<(PendingOperation, bool)> {
        if request.idempotency_key.trim().is_empty() {
            return Err(HermesError::InvalidRequest(
                "idempotency key is empty".to_string(),
            ));
        }

        let ttl = request.ttl.unwrap_or_else(|| state.settings.default_ttl());
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| HermesError::InvalidRequest(format!("invalid ttl: {}", e)))?;
        let now = Utc::now();
        let operation = PendingOperation {
            id: OperationId::new(),
            seq: 0,
            idempotency_key: request.idempotency_key,
            origin_agent: request.origin_agent,
            origin_session: request.origin_session,
            payload: request.payload,
            status: OperationStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            expires_at: now + ttl,
            updated_at: now,
        };

        let (stored, created) = state
            .store
            .write(move |conn| db::insert_operation(conn, &operation))
            .await?;

        if created {
            tracing::debug!(
                "Queued {} operation {} for {} (seq {})",
                stored.payload.kind(),
                stored.idempotency_key,
                stored.origin_agent,
                stored.seq
            );
        } else {
            tracing::debug!(
                "Duplicate enqueue for key {}, returning existing operation",
                stored.idempotency_key
            );
        }
        Ok((stored, created))
    }

    async fn drain(state: &QueueState, agent: AgentId) -> Result<Vec<PendingOperation>> {
        let now = Utc::now();
        let name = agent.clone();
        let claimed = state
            .store
            .write(move |conn| db::claim_pending(conn, &name, now))
            .await?;

        if !claimed.is_empty() {
            tracing::info!("Drained {} operations for {}", claimed.len(), agent);
        }
        Ok(claimed)
    }

    async fn purge(state: &QueueState) -> Result<usize> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(state.settings.claim_lease())
            .map_err(|e| HermesError::Config(format!("invalid claim lease: {}", e)))?;
        let claimed_before = now - lease;
        let (expired, reclaimed) = state
            .store
            .write(move |conn| {
                let reclaimed = db::reclaim_stale(conn, claimed_before, now)?;
                let expired = db::expire_overdue(conn, None, now)?;
                Ok((expired, reclaimed))
            })
            .await?;

        if reclaimed > 0 {
            tracing::warn!("Reclaimed {} deliveries past their lease", reclaimed);
        }
        if expired > 0 {
            tracing::info!("Expired {} pending operations", expired);
        }
        Ok(expired)
    }
}

#[ractor::async_trait]
impl Actor for QueueActor {
    type Msg = QueueMessage;
    type State = QueueState;
    type Arguments = QueueArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> std::result::Result<Self::State, ActorProcessingErr> {
        let now = Utc::now();
        let reset = args
            .store
            .write(move |conn| db::reset_delivering(conn, now))
            .await?;
        if reset > 0 {
            tracing::warn!("Returned {} interrupted deliveries to pending", reset);
        }

        tracing::info!("Pending operation queue starting");
        Ok(QueueState {
            store: args.store,
            settings: args.settings,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        match message {
            QueueMessage::Enqueue { request, reply } => {
                let _ = reply.send(Self::enqueue(state, request).await);
            }
            QueueMessage::Drain { agent, reply } => {
                let _ = reply.send(Self::drain(state, agent).await);
            }
            QueueMessage::MarkDelivered { id, reply } => {
                let now = Utc::now();
                let result = state
                    .store
                    .write(move |conn| db::mark_delivered(conn, &id, now))
                    .await;
                let _ = reply.send(result);
            }
            QueueMessage::MarkFailed { id, error, reply } => {
                let now = Utc::now();
                let max_attempts = state.settings.max_attempts;
                let result = state
                    .store
                    .write(move |conn| db::mark_failed(conn, &id, &error, max_attempts, now))
                    .await;
                if let Ok(operation) = &result {
                    if operation.status == OperationStatus::Failed {
                        tracing::warn!(
                            "Operation {} gave up after {} attempts: {}",
                            operation.idempotency_key,
                            operation.attempts,
                            operation.last_error.as_deref().unwrap_or("unknown error")
                        );
                    }
                }
                let _ = reply.send(result);
            }
            QueueMessage::Release { id, reply } => {
                let now = Utc::now();
                let result = state
                    .store
                    .write(move |conn| db::release_claim(conn, &id, now))
                    .await;
                if let Ok(Some(operation)) = &result {
                    tracing::debug!("Released claim on {}", operation.idempotency_key);
                }
                let _ = reply.send(result);
            }
            QueueMessage::PurgeExpired(reply) => {
                let _ = reply.send(Self::purge(state).await);
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        _state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        tracing::info!("Pending operation queue stopped");
        Ok(())
    }
}
