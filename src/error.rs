//! Error types for the Hermes coordination core
//!
//! This module provides comprehensive error handling using thiserror for
//! structured error definitions and anyhow for error propagation.
//!
//! Every error carries an [`ErrorKind`] so callers can tell a rejected request
//! (validation) from a condition worth retrying (transient) and from one that
//! ends the operation (fatal).

use crate::review::fsm::{ReviewEvent, ReviewState};
use std::time::Duration;
use thiserror::Error;

/// Main error type for Hermes operations
#[derive(Error, Debug)]
pub enum HermesError {
    /// Event not permitted from the review's current state
    #[error("Invalid transition: {event} is not permitted from {from}")]
    InvalidTransition { from: ReviewState, event: ReviewEvent },

    /// Topic does not exist
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// Agent is not registered
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    /// Review not found
    #[error("Review not found: {0}")]
    ReviewNotFound(String),

    /// Review issue not found
    #[error("Issue not found: {0}")]
    IssueNotFound(String),

    /// Pending operation not found
    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    /// Malformed or contradictory request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Pending operation outlived its TTL
    #[error("Operation expired: {0}")]
    OperationExpired(String),

    /// Mailbox bound reached; sender must back off
    #[error("Mailbox full for {actor} ({depth} queued)")]
    MailboxFull { actor: String, depth: usize },

    /// Target actor is stopped or not registered
    #[error("Actor unavailable: {0}")]
    ActorUnavailable(String),

    /// Request did not receive a reply in time
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// No reviewer slot available
    #[error("Reviewer capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// Live push to a subscriber failed
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Storage contention persisted through every retry
    #[error("Storage busy: {0}")]
    StorageBusy(String),

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// Reviewer sub-actor failed
    #[error("Reviewer failed: {0}")]
    ReviewerFailed(String),

    /// Reviewer sub-actor did not report before its deadline
    #[error("Reviewer timed out after {0:?}")]
    ReviewerTimeout(Duration),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Coarse classification used to decide how a caller reacts to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected synchronously; retrying the same request cannot succeed
    Validation,
    /// May succeed on retry
    Transient,
    /// Operation is over; surfaced to the requester
    Fatal,
}

impl HermesError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HermesError::InvalidTransition { .. }
            | HermesError::UnknownTopic(_)
            | HermesError::UnknownAgent(_)
            | HermesError::ReviewNotFound(_)
            | HermesError::IssueNotFound(_)
            | HermesError::OperationNotFound(_)
            | HermesError::InvalidRequest(_) => ErrorKind::Validation,

            HermesError::MailboxFull { .. }
            | HermesError::ActorUnavailable(_)
            | HermesError::Timeout(_)
            | HermesError::CapacityExhausted(_)
            | HermesError::Delivery(_)
            | HermesError::StorageBusy(_) => ErrorKind::Transient,

            HermesError::OperationExpired(_)
            | HermesError::Database(_)
            | HermesError::ReviewerFailed(_)
            | HermesError::ReviewerTimeout(_)
            | HermesError::Config(_)
            | HermesError::Io(_)
            | HermesError::Serialization(_)
            | HermesError::Other(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Result type alias for Hermes operations
pub type Result<T> = std::result::Result<T, HermesError>;

/// Convert anyhow::Error to HermesError
impl From<anyhow::Error> for HermesError {
    fn from(err: anyhow::Error) -> Self {
        HermesError::Other(err.to_string())
    }
}

/// SQLite busy/locked conditions are contention, everything else is fatal
impl From<rusqlite::Error> for HermesError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                HermesError::StorageBusy(err.to_string())
            }
            _ => HermesError::Database(err.to_string()),
        }
    }
}

impl From<toml::de::Error> for HermesError {
    fn from(err: toml::de::Error) -> Self {
        HermesError::Config(err.to_string())
    }
}
