//! Review records: reviews, iterations, issues and verdicts

use super::fsm::{ReviewEvent, ReviewState};
use crate::types::{AgentId, IssueId, Priority, ReviewId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewType {
    Full,
    Security,
    Performance,
    Architecture,
}

impl ReviewType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewType::Full => "full",
            ReviewType::Security => "security",
            ReviewType::Performance => "performance",
            ReviewType::Architecture => "architecture",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(ReviewType::Full),
            "security" => Some(ReviewType::Security),
            "performance" => Some(ReviewType::Performance),
            "architecture" => Some(ReviewType::Architecture),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReviewType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The change under review
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewSubject {
    /// Local path of the repository
    pub repository: String,
    pub branch: String,
    pub commit: String,
    /// Base to diff against; defaults to the commit's parent
    #[serde(default)]
    pub base: Option<String>,
    /// Unified diff supplied by the requester; skips diff retrieval
    #[serde(default)]
    pub diff: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateReviewRequest {
    pub subject: ReviewSubject,
    pub review_type: ReviewType,
    #[serde(default)]
    pub priority: Priority,
    pub requested_by: AgentId,
    /// A repeated key returns the existing review
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl CreateReviewRequest {
    pub fn new(
        subject: ReviewSubject,
        review_type: ReviewType,
        requested_by: impl Into<AgentId>,
    ) -> Self {
        Self {
            subject,
            review_type,
            priority: Priority::Normal,
            requested_by: requested_by.into(),
            idempotency_key: None,
        }
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
pub struct Review {
    pub id: ReviewId,
    pub subject: ReviewSubject,
    pub review_type: ReviewType,
    pub priority: Priority,
    pub state: ReviewState,
    pub requested_by: AgentId,
    pub idempotency_key: Option<String>,
    /// Most recent reviewer failure, cleared when a verdict lands
    pub last_error: Option<String>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Verdict recorded for one iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    RequestChanges,
    /// Non-blocking feedback
    Comment,
    /// The change should be abandoned
    Reject,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::RequestChanges => "request_changes",
            Decision::Comment => "comment",
            Decision::Reject => "reject",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approve" => Some(Decision::Approve),
            "request_changes" => Some(Decision::RequestChanges),
            "comment" => Some(Decision::Comment),
            "reject" => Some(Decision::Reject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    pub fn is_blocking(&self) -> bool {
        *self >= Severity::High
    }
}

/// Issue lifecycle; moves forward only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    Fixed,
    WontFix,
    Duplicate,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStatus::Open => "open",
            IssueStatus::Fixed => "fixed",
            IssueStatus::WontFix => "wont_fix",
            IssueStatus::Duplicate => "duplicate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(IssueStatus::Open),
            "fixed" => Some(IssueStatus::Fixed),
            "wont_fix" => Some(IssueStatus::WontFix),
            "duplicate" => Some(IssueStatus::Duplicate),
            _ => None,
        }
    }
}

/// Token usage and spend of one iteration
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationMetrics {
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl IterationMetrics {
    pub fn add(&mut self, other: &IterationMetrics) {
        self.cost_usd += other.cost_usd;
        self.duration_ms += other.duration_ms;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewIteration {
    pub review_id: ReviewId,
    /// 1-based, contiguous per review
    pub iteration: u32,
    pub reviewer: String,
    pub decision: Decision,
    pub summary: String,
    pub metrics: IterationMetrics,
    /// Candidate issues discarded by self-validation
    pub dropped_issues: u32,
    pub created_at: DateTime<Utc>,
}

/// Issue as found by a reviewer, before it is stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueDraft {
    pub severity: Severity,
    pub file_path: String,
    pub line_start: u32,
    pub line_end: u32,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub id: IssueId,
    pub review_id: ReviewId,
    pub iteration: u32,
    pub severity: Severity,
    pub file_path: String,
    pub line_start: u32,
    pub line_end: u32,
    pub title: String,
    pub description: String,
    pub suggestion: Option<String>,
    pub status: IssueStatus,
    pub resolved_in_iteration: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a reviewer reports back for one iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub reviewer: String,
    pub decision: Decision,
    pub summary: String,
    /// Issues that survived self-validation
    pub issues: Vec<IssueDraft>,
    pub dropped_issues: u32,
    pub metrics: IterationMetrics,
}

impl ReviewVerdict {
    /// FSM event this verdict drives.
    ///
    /// `Comment` approves unless a blocking issue survived validation.
    pub fn event(&self) -> ReviewEvent {
        match self.decision {
            Decision::Approve => ReviewEvent::Approve,
            Decision::RequestChanges => ReviewEvent::RequestChanges,
            Decision::Reject => ReviewEvent::Reject,
            Decision::Comment => {
                if self.issues.iter().any(|issue| issue.severity.is_blocking()) {
                    ReviewEvent::RequestChanges
                } else {
                    ReviewEvent::Approve
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewFilter {
    pub state: Option<ReviewState>,
    pub review_type: Option<ReviewType>,
    pub requested_by: Option<AgentId>,
    pub limit: Option<usize>,
}

/// Reviewer currently working on a review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveReviewer {
    pub persona: String,
    pub iteration: u32,
    pub timeout_ms: u64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewStatus {
    pub review: Review,
    pub iterations: Vec<ReviewIteration>,
    pub open_issues: usize,
    pub active_reviewer: Option<ActiveReviewer>,
}
