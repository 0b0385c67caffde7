//! Replay of queued operations on reconnect
//!
//! Operations are claimed with a drain and applied one at a time in creation
//! order. Publishes and review requests carry the operation's idempotency key
//! downstream, so an operation that is retried after a lost acknowledgement
//! lands at most once. A claim that is never settled, because the delivering
//! task died or its acknowledgement could not be stored, goes back to pending
//! once the claim lease runs out.

use super::client::QueueClient;
use super::operation::{DeliveryReport, OperationPayload, PendingOperation};
use crate::broker::BrokerClient;
use crate::error::{HermesError, Result};
use crate::review::ReviewClient;
use crate::types::AgentId;

/// Apply one operation against its downstream service
async fn apply(
    operation: &PendingOperation,
    broker: &BrokerClient,
    reviews: &ReviewClient,
) -> Result<()> {
    let origin = &operation.origin_agent;
    match operation.payload.clone() {
        OperationPayload::Publish(mut request) => {
            if request.sender != *origin {
                return Err(HermesError::InvalidRequest(format!(
                    "{} cannot publish as {}",
                    origin, request.sender
                )));
            }
            if request.idempotency_key.is_none() {
                request.idempotency_key = Some(operation.idempotency_key.clone());
            }
            broker.publish(request).await?;
        }
        OperationPayload::CreateReview(mut request) => {
            if request.requested_by != *origin {
                return Err(HermesError::InvalidRequest(format!(
                    "{} cannot request a review as {}",
                    origin, request.requested_by
                )));
            }
            if request.idempotency_key.is_none() {
                request.idempotency_key = Some(operation.idempotency_key.clone());
            }
            reviews.create_review(request).await?;
        }
        OperationPayload::Subscribe { topic } => {
            broker.subscribe(origin, &topic).await?;
        }
        OperationPayload::Unsubscribe { topic } => {
            broker.unsubscribe(origin, &topic).await?;
        }
        OperationPayload::AdvanceOffset { topic, offset } => {
            broker.advance_offset(origin, &topic, offset).await?;
        }
    }
    Ok(())
}

/// Drain `agent`'s queue and replay every claimed operation
pub async fn deliver_pending(
    queue: &QueueClient,
    broker: &BrokerClient,
    reviews: &ReviewClient,
    agent: &AgentId,
) -> Result<DeliveryReport> {
    let claimed = queue.drain(agent).await?;
    let mut report = DeliveryReport::default();

    for operation in claimed {
        match apply(&operation, broker, reviews).await {
            Ok(()) => match queue.mark_delivered(operation.id).await {
                Ok(_) => report.delivered.push(operation.id),
                Err(e) => {
                    tracing::warn!(
                        "Applied operation {} but could not mark it delivered: {}",
                        operation.idempotency_key,
                        e
                    );
                    // Reapplying is safe: downstream dedups on the operation key
                    if let Err(release) = queue.release(operation.id).await {
                        tracing::warn!(
                            "Could not release {}, the sweep will reclaim it: {}",
                            operation.idempotency_key,
                            release
                        );
                    }
                    report.failed.push((operation.id, e.to_string()));
                }
            },
            Err(e) => {
                tracing::warn!(
                    "Replaying {} operation {} for {} failed: {}",
                    operation.payload.kind(),
                    operation.idempotency_key,
                    agent,
                    e
                );
                let error = e.to_string();
                if let Err(mark) = queue.mark_failed(operation.id, error.clone()).await {
                    tracing::warn!(
                        "Could not record failure of {}: {}",
                        operation.idempotency_key,
                        mark
                    );
                }
                report.failed.push((operation.id, error));
            }
        }
    }

    if !report.delivered.is_empty() || !report.failed.is_empty() {
        tracing::info!(
            "Replayed queue for {}: {} delivered, {} failed",
            agent,
            report.delivered.len(),
            report.failed.len()
        );
    }
    Ok(report)
}
