//! Review Orchestrator Actor
//!
//! Responsibilities:
//! - Sole writer of reviews, iterations and issues
//! - Drives each review through the transition table in [`super::fsm`]
//! - Spawns one sandboxed reviewer per iteration and enforces its deadline
//! - Turns reviewer verdicts into iterations, issues and FSM events
//! - Tells the requester about verdicts and reviewer failures
//!
//! A reviewer that fails or misses its deadline is stopped and the review
//! stays in `under_review` with `last_error` set. Nothing is retried
//! automatically; `Retry` or `Cancel` is up to the caller.

use super::diff::DiffSource;
use super::fsm::{transition, ReviewEvent, ReviewState, SideEffect, Transition};
use super::methodology::{ReviewContext, ReviewModel};
use super::model::{
    ActiveReviewer, CreateReviewRequest, IssueStatus, Review, ReviewIssue, ReviewIteration,
    ReviewStatus, ReviewVerdict,
};
use super::persona::Persona;
use super::reviewer::{ReviewOutcome, ReviewerActor, ReviewerArgs, ReviewerMessage};
use crate::broker::{BrokerClient, PublishRequest, SYSTEM_AGENT};
use crate::config::ReviewSettings;
use crate::error::{HermesError, Result};
use crate::runtime::mailbox::{MailboxGauge, MailboxPolicy};
use crate::runtime::{spawn_with_gauge, Addr};
use crate::storage::{broker as agents_db, reviews as db, Store};
use crate::types::{IssueId, ReviewId, TopicId};
use chrono::{DateTime, Utc};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub enum OrchestratorMessage {
    /// Create a review and submit it; a repeated idempotency key returns
    /// the existing review
    Create {
        request: CreateReviewRequest,
        reply: RpcReplyPort<Result<Review>>,
    },

    /// StartReview: spawn the reviewer for the next iteration
    Start {
        id: ReviewId,
        reply: RpcReplyPort<Result<Review>>,
    },

    /// Spawn a fresh reviewer for a review left in `under_review` by a
    /// failed or timed-out one
    Retry {
        id: ReviewId,
        reply: RpcReplyPort<Result<Review>>,
    },

    Status {
        id: ReviewId,
        reply: RpcReplyPort<Result<ReviewStatus>>,
    },

    Cancel {
        id: ReviewId,
        reason: Option<String>,
        reply: RpcReplyPort<Result<Review>>,
    },

    Resubmit {
        id: ReviewId,
        reply: RpcReplyPort<Result<Review>>,
    },

    /// Remove a review with its iterations and issues, stopping any reviewer
    Delete {
        id: ReviewId,
        reply: RpcReplyPort<Result<()>>,
    },

    /// Move an open issue to a resolved status
    ResolveIssue {
        issue: IssueId,
        status: IssueStatus,
        resolved_in_iteration: Option<u32>,
        reply: RpcReplyPort<Result<ReviewIssue>>,
    },

    /// Sent by a reviewer when it finishes
    ReviewerReported {
        review_id: ReviewId,
        attempt: u64,
        outcome: ReviewOutcome,
    },

    /// Sent by the deadline timer of a reviewer
    ReviewerTimedOut { review_id: ReviewId, attempt: u64 },

    /// Start ready reviews while reviewer slots are free
    Pump,
}

/// Startup arguments
pub struct OrchestratorArgs {
    pub store: Store,
    pub settings: ReviewSettings,
    pub model: Arc<dyn ReviewModel>,
    pub diff_source: Arc<dyn DiffSource>,
    /// Where requester notifications are published; `None` disables them
    pub notifier: Option<BrokerClient>,
    /// Gauge the orchestrator itself was spawned with
    pub gauge: MailboxGauge,
    /// Mailbox policy for reviewer actors
    pub reviewer_mailbox: MailboxPolicy,
}

struct RunningReviewer {
    addr: Addr<ReviewerMessage>,
    attempt: u64,
    iteration: u32,
    persona: Persona,
    started_at: DateTime<Utc>,
    deadline: JoinHandle<()>,
}

/// Orchestrator actor state
pub struct OrchestratorState {
    store: Store,
    settings: ReviewSettings,
    model: Arc<dyn ReviewModel>,
    diff_source: Arc<dyn DiffSource>,
    notifier: Option<BrokerClient>,
    myself: Addr<OrchestratorMessage>,
    reviewer_mailbox: MailboxPolicy,

    /// Reviews with a running reviewer
    active: HashMap<ReviewId, RunningReviewer>,

    /// Reviews waiting for a reviewer slot, oldest first
    ready: VecDeque<ReviewId>,

    next_attempt: u64,
}

/// Orchestrator actor implementation
pub struct OrchestratorActor;

impl OrchestratorActor {
    async fn load(state: &OrchestratorState, id: ReviewId) -> Result<Review> {
        state
            .store
            .read(move |conn| db::get_review(conn, &id))
            .await?
            .ok_or_else(|| HermesError::ReviewNotFound(id.to_string()))
    }

    async fn persist(state: &OrchestratorState, review: &Review) -> Result<()> {
        let review = review.clone();
        state
            .store
            .write(move |conn| db::update_review(conn, &review))
            .await
    }

    /// Apply an event to the in-memory review; the caller persists it
    fn apply(review: &mut Review, event: ReviewEvent) -> Result<Transition> {
        let t = transition(review.state, event).map_err(|e| {
            tracing::warn!("Review {} rejected {}: {}", review.id, event, e);
            e
        })?;

        let now = Utc::now();
        review.state = t.to;
        review.updated_at = now;
        if t.to.is_terminal() {
            review.completed_at = Some(now);
        }
        tracing::info!("Review {}: {} -> {} ({})", review.id, t.from, t.to, event);
        Ok(t)
    }

    fn enqueue(state: &mut OrchestratorState, id: ReviewId) {
        if !state.ready.contains(&id) {
            state.ready.push_back(id);
        }
        if state.settings.auto_start {
            if let Err(e) = state.myself.send(OrchestratorMessage::Pump) {
                tracing::warn!("Could not schedule reviewer start: {}", e);
            }
        }
    }

    fn check_capacity(state: &OrchestratorState) -> Result<()> {
        if state.active.len() >= state.settings.max_concurrent_reviewers {
            return Err(HermesError::CapacityExhausted(format!(
                "{} reviewers already running",
                state.active.len()
            )));
        }
        Ok(())
    }

    async fn create(state: &mut OrchestratorState, request: CreateReviewRequest) -> Result<Review> {
        if request.subject.repository.trim().is_empty() || request.subject.commit.trim().is_empty()
        {
            return Err(HermesError::InvalidRequest(
                "review subject needs a repository and a commit".to_string(),
            ));
        }

        if let Some(key) = request.idempotency_key.clone() {
            let existing = state
                .store
                .read(move |conn| db::find_review_by_key(conn, &key))
                .await?;
            if let Some(existing) = existing {
                tracing::debug!("Review request deduplicated to {}", existing.id);
                return Ok(existing);
            }
        }

        let requester = request.requested_by.clone();
        let known = state
            .store
            .read(move |conn| agents_db::get_agent(conn, &requester))
            .await?;
        if known.is_none() {
            return Err(HermesError::UnknownAgent(request.requested_by.to_string()));
        }

        let now = Utc::now();
        let mut review = Review {
            id: ReviewId::new(),
            subject: request.subject,
            review_type: request.review_type,
            priority: request.priority,
            state: ReviewState::New,
            requested_by: request.requested_by,
            idempotency_key: request.idempotency_key,
            last_error: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        let t = Self::apply(&mut review, ReviewEvent::SubmitForReview)?;

        let candidate = review.clone();
        let (review, created) = state
            .store
            .write(move |conn| {
                if let Some(key) = &candidate.idempotency_key {
                    if let Some(existing) = db::find_review_by_key(conn, key)? {
                        return Ok((existing, false));
                    }
                }
                db::insert_review(conn, &candidate)?;
                Ok((candidate.clone(), true))
            })
            .await?;

        if created {
            tracing::info!(
                "Created {} review {} for {} at {}",
                review.review_type,
                review.id,
                review.requested_by,
                review.subject.commit
            );
            if t.effect == SideEffect::EnqueueReviewerSpawn {
                Self::enqueue(state, review.id);
            }
        }
        Ok(review)
    }

    async fn start(state: &mut OrchestratorState, id: ReviewId) -> Result<Review> {
        let mut review = Self::load(state, id).await?;
        transition(review.state, ReviewEvent::StartReview)?;
        Self::check_capacity(state)?;

        state.ready.retain(|r| *r != id);
        Self::spawn_reviewer(state, &review).await?;

        Self::apply(&mut review, ReviewEvent::StartReview)?;
        if let Err(e) = Self::persist(state, &review).await {
            Self::stop_reviewer(state, &id, "state could not be saved");
            return Err(e);
        }
        Ok(review)
    }

    async fn retry(state: &mut OrchestratorState, id: ReviewId) -> Result<Review> {
        let mut review = Self::load(state, id).await?;
        if review.state != ReviewState::UnderReview {
            return Err(HermesError::InvalidTransition {
                from: review.state,
                event: ReviewEvent::StartReview,
            });
        }
        if state.active.contains_key(&id) {
            return Err(HermesError::InvalidRequest(format!(
                "review {} already has a running reviewer",
                id
            )));
        }
        Self::check_capacity(state)?;

        Self::spawn_reviewer(state, &review).await?;
        review.updated_at = Utc::now();
        Self::persist(state, &review).await?;
        tracing::info!("Retrying review {} with a fresh reviewer", id);
        Ok(review)
    }

    async fn spawn_reviewer(state: &mut OrchestratorState, review: &Review) -> Result<()> {
        let id = review.id;
        let persona = Persona::for_review(review.review_type, &state.settings);
        let (iteration, open_issues) = state
            .store
            .read(move |conn| Ok((db::next_iteration(conn, &id)?, db::open_issues(conn, &id)?)))
            .await?;

        let attempt = state.next_attempt;
        state.next_attempt += 1;

        let context = ReviewContext {
            persona: persona.clone(),
            subject: review.subject.clone(),
            review_type: review.review_type,
            iteration,
            diff: review.subject.diff.clone().unwrap_or_default(),
            open_issues,
        };

        let gauge = MailboxGauge::new(format!("reviewer-{}", id), state.reviewer_mailbox);
        let (addr, _handle) = spawn_with_gauge(
            None,
            ReviewerActor,
            ReviewerArgs {
                review_id: id,
                attempt,
                context,
                model: state.model.clone(),
                diff_source: state.diff_source.clone(),
                orchestrator: state.myself.clone(),
                gauge: gauge.clone(),
            },
            gauge,
            Some(state.myself.cell()),
        )
        .await?;

        let timeout = persona.timeout;
        let orchestrator = state.myself.clone();
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = OrchestratorMessage::ReviewerTimedOut {
                review_id: id,
                attempt,
            };
            if let Err(e) = orchestrator.send_when_ready(expired).await {
                tracing::warn!("Could not deliver reviewer timeout for {}: {}", id, e);
            }
        });

        state.active.insert(
            id,
            RunningReviewer {
                addr,
                attempt,
                iteration,
                persona,
                started_at: Utc::now(),
                deadline,
            },
        );
        Ok(())
    }

    /// Kill the running reviewer of a review, discarding any partial verdict
    fn stop_reviewer(state: &mut OrchestratorState, id: &ReviewId, reason: &str) {
        if let Some(running) = state.active.remove(id) {
            running.deadline.abort();
            running.addr.kill();
            tracing::info!("Stopped reviewer for review {}: {}", id, reason);
        }
    }

    async fn status(state: &OrchestratorState, id: ReviewId) -> Result<ReviewStatus> {
        let review = Self::load(state, id).await?;
        let (iterations, open_issues) = state
            .store
            .read(move |conn| {
                Ok((
                    db::list_iterations(conn, &id)?,
                    db::open_issues(conn, &id)?.len(),
                ))
            })
            .await?;

        let active_reviewer = state.active.get(&id).map(|running| ActiveReviewer {
            persona: running.persona.name.clone(),
            iteration: running.iteration,
            timeout_ms: running.persona.timeout.as_millis() as u64,
            started_at: running.started_at,
        });

        Ok(ReviewStatus {
            review,
            iterations,
            open_issues,
            active_reviewer,
        })
    }

    async fn cancel(
        state: &mut OrchestratorState,
        id: ReviewId,
        reason: Option<String>,
    ) -> Result<Review> {
        let mut review = Self::load(state, id).await?;
        let t = Self::apply(&mut review, ReviewEvent::Cancel)?;
        review.cancel_reason = reason;
        Self::persist(state, &review).await?;

        if t.effect == SideEffect::StopReviewer {
            Self::stop_reviewer(state, &id, "review cancelled");
        }
        state.ready.retain(|r| *r != id);
        Ok(review)
    }

    async fn resubmit(state: &mut OrchestratorState, id: ReviewId) -> Result<Review> {
        let mut review = Self::load(state, id).await?;
        Self::apply(&mut review, ReviewEvent::Resubmit)?;
        Self::persist(state, &review).await?;
        Self::enqueue(state, id);
        Ok(review)
    }

    async fn delete(state: &mut OrchestratorState, id: ReviewId) -> Result<()> {
        Self::load(state, id).await?;
        Self::stop_reviewer(state, &id, "review deleted");
        state.ready.retain(|r| *r != id);
        state
            .store
            .write(move |conn| db::delete_review(conn, &id))
            .await?;
        tracing::info!("Deleted review {}", id);
        Ok(())
    }

    async fn resolve_issue(
        state: &OrchestratorState,
        issue: IssueId,
        status: IssueStatus,
        resolved_in_iteration: Option<u32>,
    ) -> Result<ReviewIssue> {
        if status == IssueStatus::Open {
            return Err(HermesError::InvalidRequest(
                "issues cannot be reopened".to_string(),
            ));
        }

        state
            .store
            .write(move |conn| {
                let current = db::get_issue(conn, &issue)?
                    .ok_or_else(|| HermesError::IssueNotFound(issue.to_string()))?;
                if !db::resolve_issue(conn, &issue, status, resolved_in_iteration, Utc::now())? {
                    return Err(HermesError::InvalidRequest(format!(
                        "issue {} is already {}",
                        issue,
                        current.status.as_str()
                    )));
                }
                db::get_issue(conn, &issue)?
                    .ok_or_else(|| HermesError::IssueNotFound(issue.to_string()))
            })
            .await
    }

    async fn reviewer_reported(
        state: &mut OrchestratorState,
        review_id: ReviewId,
        attempt: u64,
        outcome: ReviewOutcome,
    ) {
        let current = state
            .active
            .get(&review_id)
            .is_some_and(|running| running.attempt == attempt);
        if !current {
            tracing::debug!("Ignoring stale report for review {} (attempt {})", review_id, attempt);
            return;
        }
        if let Some(running) = state.active.remove(&review_id) {
            running.deadline.abort();
        }

        match outcome {
            Ok(verdict) => {
                if let Err(e) = Self::record_verdict(state, review_id, verdict).await {
                    tracing::error!("Could not record verdict for review {}: {}", review_id, e);
                    Self::reviewer_failed(state, review_id, e.to_string()).await;
                }
            }
            Err(reason) => Self::reviewer_failed(state, review_id, reason).await,
        }
    }

    async fn record_verdict(
        state: &mut OrchestratorState,
        id: ReviewId,
        verdict: ReviewVerdict,
    ) -> Result<()> {
        let mut review = Self::load(state, id).await?;
        Self::apply(&mut review, verdict.event())?;
        review.last_error = None;

        let updated = review.clone();
        let recorded = verdict.clone();
        let iteration = state
            .store
            .write(move |conn| {
                let now = Utc::now();
                let number = db::next_iteration(conn, &id)?;
                db::insert_iteration(
                    conn,
                    &ReviewIteration {
                        review_id: id,
                        iteration: number,
                        reviewer: recorded.reviewer.clone(),
                        decision: recorded.decision,
                        summary: recorded.summary.clone(),
                        metrics: recorded.metrics,
                        dropped_issues: recorded.dropped_issues,
                        created_at: now,
                    },
                )?;
                for draft in &recorded.issues {
                    db::insert_issue(
                        conn,
                        &ReviewIssue {
                            id: IssueId::new(),
                            review_id: id,
                            iteration: number,
                            severity: draft.severity,
                            file_path: draft.file_path.clone(),
                            line_start: draft.line_start,
                            line_end: draft.line_end,
                            title: draft.title.clone(),
                            description: draft.description.clone(),
                            suggestion: draft.suggestion.clone(),
                            status: IssueStatus::Open,
                            resolved_in_iteration: None,
                            created_at: now,
                            updated_at: now,
                        },
                    )?;
                }
                db::update_review(conn, &updated)?;
                Ok(number)
            })
            .await?;

        tracing::info!(
            "Review {} iteration {}: {} with {} issues ({} dropped, ${:.4})",
            id,
            iteration,
            verdict.decision.as_str(),
            verdict.issues.len(),
            verdict.dropped_issues,
            verdict.metrics.cost_usd
        );

        let subject = format!("Review {} {}", review.id, review.state);
        let mut body = format!(
            "Iteration {} by {}: {}\n\n{}\n",
            iteration,
            verdict.reviewer,
            verdict.decision.as_str(),
            verdict.summary
        );
        for issue in &verdict.issues {
            body.push_str(&format!(
                "\n- [{}] {}:{}-{} {}",
                issue.severity.as_str(),
                issue.file_path,
                issue.line_start,
                issue.line_end,
                issue.title
            ));
        }
        Self::notify_requester(state, &review, subject, body).await;
        Ok(())
    }

    /// Record a failed iteration; the review stays where it is
    async fn reviewer_failed(state: &mut OrchestratorState, id: ReviewId, reason: String) {
        tracing::error!("Reviewer for review {} failed: {}", id, reason);

        let mut review = match Self::load(state, id).await {
            Ok(review) => review,
            Err(e) => {
                tracing::warn!("Review {} vanished after reviewer failure: {}", id, e);
                return;
            }
        };
        review.last_error = Some(reason.clone());
        review.updated_at = Utc::now();
        if let Err(e) = Self::persist(state, &review).await {
            tracing::error!("Could not record failure of review {}: {}", id, e);
        }

        let subject = format!("Review {} reviewer failed", id);
        let body = format!(
            "{}\n\nThe review remains {}. Retry or cancel it.",
            reason, review.state
        );
        Self::notify_requester(state, &review, subject, body).await;
    }

    async fn reviewer_timed_out(state: &mut OrchestratorState, review_id: ReviewId, attempt: u64) {
        let current = state
            .active
            .get(&review_id)
            .is_some_and(|running| running.attempt == attempt);
        if !current {
            return;
        }
        let timeout = state
            .active
            .get(&review_id)
            .map(|running| running.persona.timeout)
            .unwrap_or_default();

        Self::stop_reviewer(state, &review_id, "deadline passed");
        Self::reviewer_failed(
            state,
            review_id,
            HermesError::ReviewerTimeout(timeout).to_string(),
        )
        .await;
    }

    async fn pump(state: &mut OrchestratorState) {
        if !state.settings.auto_start {
            return;
        }
        while state.active.len() < state.settings.max_concurrent_reviewers {
            let Some(id) = state.ready.pop_front() else {
                break;
            };
            if let Err(e) = Self::start(state, id).await {
                tracing::warn!("Could not start review {}: {}", id, e);
            }
        }
    }

    async fn notify_requester(
        state: &OrchestratorState,
        review: &Review,
        subject: String,
        body: String,
    ) {
        if !state.settings.notify_requester {
            return;
        }
        let Some(notifier) = &state.notifier else {
            return;
        };

        let request = PublishRequest::new(
            TopicId::inbox(&review.requested_by),
            SYSTEM_AGENT,
            subject,
            body,
        )
        .to([review.requested_by.clone()])
        .in_thread(format!("review:{}", review.id))
        .with_priority(review.priority);

        if let Err(e) = notifier.publish_detached(request).await {
            tracing::warn!("Could not notify {} about review {}: {}", review.requested_by, review.id, e);
        }
    }
}

#[ractor::async_trait]
impl Actor for OrchestratorActor {
    type Msg = OrchestratorMessage;
    type State = OrchestratorState;
    type Arguments = OrchestratorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> std::result::Result<Self::State, ActorProcessingErr> {
        let unfinished = args
            .store
            .read(|conn| {
                db::reviews_in_states(
                    conn,
                    &[
                        ReviewState::PendingReview,
                        ReviewState::ReReview,
                        ReviewState::UnderReview,
                    ],
                )
            })
            .await?;

        let mut ready = VecDeque::new();
        for mut review in unfinished {
            if review.state == ReviewState::UnderReview {
                // The reviewer died with the previous process
                review.last_error = Some("reviewer interrupted by restart".to_string());
                review.updated_at = Utc::now();
                args.store
                    .write(move |conn| db::update_review(conn, &review))
                    .await?;
            } else {
                ready.push_back(review.id);
            }
        }

        tracing::info!("Review orchestrator starting ({} ready)", ready.len());
        Ok(OrchestratorState {
            store: args.store,
            settings: args.settings,
            model: args.model,
            diff_source: args.diff_source,
            notifier: args.notifier,
            myself: Addr::from_parts(myself, args.gauge),
            reviewer_mailbox: args.reviewer_mailbox,
            active: HashMap::new(),
            ready,
            next_attempt: 1,
        })
    }

    async fn post_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        if state.settings.auto_start && !state.ready.is_empty() {
            state.myself.send(OrchestratorMessage::Pump)?;
        }
        Ok(())
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        match message {
            OrchestratorMessage::Create { request, reply } => {
                let _ = reply.send(Self::create(state, request).await);
            }
            OrchestratorMessage::Start { id, reply } => {
                let _ = reply.send(Self::start(state, id).await);
            }
            OrchestratorMessage::Retry { id, reply } => {
                let _ = reply.send(Self::retry(state, id).await);
            }
            OrchestratorMessage::Status { id, reply } => {
                let _ = reply.send(Self::status(state, id).await);
            }
            OrchestratorMessage::Cancel { id, reason, reply } => {
                let result = Self::cancel(state, id, reason).await;
                let _ = reply.send(result);
                Self::pump(state).await;
            }
            OrchestratorMessage::Resubmit { id, reply } => {
                let _ = reply.send(Self::resubmit(state, id).await);
            }
            OrchestratorMessage::Delete { id, reply } => {
                let result = Self::delete(state, id).await;
                let _ = reply.send(result);
                Self::pump(state).await;
            }
            OrchestratorMessage::ResolveIssue {
                issue,
                status,
                resolved_in_iteration,
                reply,
            } => {
                let _ = reply.send(
                    Self::resolve_issue(state, issue, status, resolved_in_iteration).await,
                );
            }
            OrchestratorMessage::ReviewerReported {
                review_id,
                attempt,
                outcome,
            } => {
                Self::reviewer_reported(state, review_id, attempt, outcome).await;
                Self::pump(state).await;
            }
            OrchestratorMessage::ReviewerTimedOut { review_id, attempt } => {
                Self::reviewer_timed_out(state, review_id, attempt).await;
                Self::pump(state).await;
            }
            OrchestratorMessage::Pump => Self::pump(state).await,
        }
        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        _myself: ActorRef<Self::Msg>,
        event: SupervisionEvent,
        state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        match event {
            SupervisionEvent::ActorFailed(cell, err) => {
                let crashed = state
                    .active
                    .iter()
                    .find(|(_, running)| running.addr.id() == cell.get_id())
                    .map(|(id, _)| *id);
                if let Some(id) = crashed {
                    if let Some(running) = state.active.remove(&id) {
                        running.deadline.abort();
                    }
                    Self::reviewer_failed(state, id, format!("reviewer crashed: {}", err)).await;
                    Self::pump(state).await;
                }
            }
            // Normal exits are followed by a report, or were caused by us
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                tracing::debug!("Reviewer {} exited: {:?}", cell.get_id(), reason);
            }
            _ => {}
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        let running: Vec<ReviewId> = state.active.keys().copied().collect();
        for id in running {
            Self::stop_reviewer(state, &id, "orchestrator stopped");
        }
        tracing::info!("Review orchestrator stopped");
        Ok(())
    }
}
