//! Reviewer sub-actor
//!
//! One reviewer runs one iteration. It builds its sandbox, fetches the diff,
//! runs the three passes and reports back to the orchestrator, then stops.
//! It is never restarted: a failure or timeout ends the iteration and the
//! sandbox goes away with the actor.

use super::diff::DiffSource;
use super::methodology::{run_methodology, ReviewContext, ReviewModel};
use super::model::ReviewVerdict;
use super::orchestrator::OrchestratorMessage;
use super::sandbox::{SandboxContext, SandboxSpec};
use crate::error::{HermesError, Result};
use crate::runtime::mailbox::MailboxGauge;
use crate::runtime::Addr;
use crate::types::ReviewId;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use std::sync::Arc;

pub enum ReviewerMessage {
    /// Perform the review; sent to itself once started
    Run,
}

/// Outcome reported to the orchestrator
pub type ReviewOutcome = std::result::Result<ReviewVerdict, String>;

pub struct ReviewerArgs {
    pub review_id: ReviewId,
    /// Distinguishes this run from earlier runs of the same review
    pub attempt: u64,
    pub context: ReviewContext,
    pub model: Arc<dyn ReviewModel>,
    pub diff_source: Arc<dyn DiffSource>,
    pub orchestrator: Addr<OrchestratorMessage>,
    pub gauge: MailboxGauge,
}

pub struct ReviewerState {
    review_id: ReviewId,
    attempt: u64,
    context: ReviewContext,
    model: Arc<dyn ReviewModel>,
    diff_source: Arc<dyn DiffSource>,
    orchestrator: Addr<OrchestratorMessage>,
    gauge: MailboxGauge,
}

pub struct ReviewerActor;

impl ReviewerActor {
    async fn review(state: &mut ReviewerState) -> Result<ReviewVerdict> {
        let sandbox = SandboxSpec::new(&state.context.subject.repository)
            .allow_all(state.context.persona.capabilities.iter().copied())
            .build()?;

        if state.context.diff.is_empty() {
            state.context.diff = Self::fetch_diff(state, &sandbox).await?;
        }
        if state.context.diff.trim().is_empty() {
            return Err(HermesError::ReviewerFailed(format!(
                "no changes between base and {}",
                state.context.subject.commit
            )));
        }

        run_methodology(state.model.as_ref(), &state.context, &sandbox).await
    }

    async fn fetch_diff(state: &ReviewerState, sandbox: &SandboxContext) -> Result<String> {
        match &state.context.subject.diff {
            Some(diff) => Ok(diff.clone()),
            None => state.diff_source.diff(&state.context.subject, sandbox).await,
        }
    }
}

#[ractor::async_trait]
impl Actor for ReviewerActor {
    type Msg = ReviewerMessage;
    type State = ReviewerState;
    type Arguments = ReviewerArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> std::result::Result<Self::State, ActorProcessingErr> {
        Ok(ReviewerState {
            review_id: args.review_id,
            attempt: args.attempt,
            context: args.context,
            model: args.model,
            diff_source: args.diff_source,
            orchestrator: args.orchestrator,
            gauge: args.gauge,
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        tracing::info!(
            "Reviewer {} started on review {} (iteration {}, timeout {:?})",
            state.context.persona.name,
            state.review_id,
            state.context.iteration,
            state.context.persona.timeout
        );
        Addr::from_parts(myself, state.gauge.clone()).send(ReviewerMessage::Run)?;
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        match message {
            ReviewerMessage::Run => {
                let outcome = Self::review(state).await.map_err(|e| e.to_string());
                if let Err(reason) = &outcome {
                    tracing::error!("Reviewer for review {} failed: {}", state.review_id, reason);
                }

                let report = OrchestratorMessage::ReviewerReported {
                    review_id: state.review_id,
                    attempt: state.attempt,
                    outcome,
                };
                if let Err(e) = state.orchestrator.send_when_ready(report).await {
                    tracing::warn!(
                        "Could not report verdict for review {}: {}",
                        state.review_id,
                        e
                    );
                }
                myself.stop(Some("review finished".to_string()));
            }
        }
        Ok(())
    }
}
