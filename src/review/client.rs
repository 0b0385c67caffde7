//! Review client
//!
//! Commands go to the orchestrator found in the service registry; listings
//! read storage directly.

use super::model::{
    CreateReviewRequest, IssueStatus, Review, ReviewFilter, ReviewIssue, ReviewStatus,
};
use super::orchestrator::OrchestratorMessage;
use crate::error::{HermesError, Result};
use crate::runtime::registry::{ServiceKey, ServiceRegistry};
use crate::runtime::Addr;
use crate::storage::{reviews as db, Store};
use crate::types::{IssueId, ReviewId};
use ractor::RpcReplyPort;
use std::time::Duration;

#[derive(Clone)]
pub struct ReviewClient {
    registry: ServiceRegistry,
    store: Store,
    timeout: Duration,
}

impl ReviewClient {
    pub fn new(registry: ServiceRegistry, store: Store, timeout: Duration) -> Self {
        Self {
            registry,
            store,
            timeout,
        }
    }

    async fn orchestrator(&self) -> Result<Addr<OrchestratorMessage>> {
        self.registry
            .lookup(&ServiceKey::review_orchestrator())
            .await
            .ok_or_else(|| {
                HermesError::ActorUnavailable(ServiceKey::REVIEW_ORCHESTRATOR.to_string())
            })
    }

    async fn call<T, F>(&self, build: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(RpcReplyPort<Result<T>>) -> OrchestratorMessage,
    {
        self.orchestrator().await?.request(build, self.timeout).await?
    }

    pub async fn create_review(&self, request: CreateReviewRequest) -> Result<Review> {
        self.call(|reply| OrchestratorMessage::Create { request, reply })
            .await
    }

    pub async fn start_review(&self, id: ReviewId) -> Result<Review> {
        self.call(|reply| OrchestratorMessage::Start { id, reply })
            .await
    }

    /// Spawn a fresh reviewer after a failed or timed-out one
    pub async fn retry_review(&self, id: ReviewId) -> Result<Review> {
        self.call(|reply| OrchestratorMessage::Retry { id, reply })
            .await
    }

    pub async fn status(&self, id: ReviewId) -> Result<ReviewStatus> {
        self.call(|reply| OrchestratorMessage::Status { id, reply })
            .await
    }

    pub async fn cancel_review(&self, id: ReviewId, reason: Option<&str>) -> Result<Review> {
        let reason = reason.map(str::to_string);
        self.call(|reply| OrchestratorMessage::Cancel { id, reason, reply })
            .await
    }

    pub async fn resubmit_review(&self, id: ReviewId) -> Result<Review> {
        self.call(|reply| OrchestratorMessage::Resubmit { id, reply })
            .await
    }

    pub async fn delete_review(&self, id: ReviewId) -> Result<()> {
        self.call(|reply| OrchestratorMessage::Delete { id, reply })
            .await
    }

    pub async fn resolve_issue(
        &self,
        issue: IssueId,
        status: IssueStatus,
        resolved_in_iteration: Option<u32>,
    ) -> Result<ReviewIssue> {
        self.call(|reply| OrchestratorMessage::ResolveIssue {
            issue,
            status,
            resolved_in_iteration,
            reply,
        })
        .await
    }

    pub async fn list_reviews(&self, filter: ReviewFilter) -> Result<Vec<Review>> {
        self.store
            .read(move |conn| db::list_reviews(conn, &filter))
            .await
    }

    pub async fn list_issues(&self, id: ReviewId) -> Result<Vec<ReviewIssue>> {
        let exists = self
            .store
            .read(move |conn| Ok(db::get_review(conn, &id)?.is_some()))
            .await?;
        if !exists {
            return Err(HermesError::ReviewNotFound(id.to_string()));
        }
        self.store
            .read(move |conn| db::list_issues(conn, &id))
            .await
    }
}
