//! Review Orchestrator
//!
//! Structured code reviews between agents. A review moves through the
//! closed state machine in [`fsm`]; each iteration is carried out by a
//! sandboxed [`reviewer::ReviewerActor`] that runs the three-pass
//! methodology and reports a verdict to the [`orchestrator::OrchestratorActor`].

pub mod client;
pub mod command;
pub mod diff;
pub mod fsm;
pub mod methodology;
pub mod model;
pub mod orchestrator;
pub mod persona;
pub mod reviewer;
pub mod sandbox;

pub use client::ReviewClient;
pub use command::CommandReviewModel;
pub use diff::{ChangeSet, DiffSource, GitCliDiffSource};
pub use fsm::{ReviewEvent, ReviewState};
pub use methodology::{
    Assessment, ContextPassOutput, DiffPassOutput, ReviewContext, ReviewModel,
    ValidationCriteria, ValidationPassOutput,
};
pub use model::{
    ActiveReviewer, CreateReviewRequest, Decision, IssueDraft, IssueStatus, IterationMetrics,
    Review, ReviewFilter, ReviewIssue, ReviewIteration, ReviewStatus, ReviewSubject, ReviewType,
    ReviewVerdict, Severity,
};
pub use orchestrator::{OrchestratorActor, OrchestratorArgs, OrchestratorMessage};
pub use persona::{ModelClass, Persona};
pub use sandbox::{Capability, SandboxContext, SandboxSpec};
