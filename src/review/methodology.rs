//! Three-pass review methodology
//!
//! 1. Diff pass: the changed hunks alone yield a summary and candidate issues.
//! 2. Contextual pass: each candidate is checked against surrounding code;
//!    only candidates that hold up are returned. The pass can only narrow:
//!    a confirmation is matched back to a diff-pass candidate by location,
//!    and anything that matches none is discarded.
//! 3. Validation pass: every remaining candidate is assessed against four
//!    criteria. A candidate failing any of them, or with no assessment, is
//!    dropped. Severities are never rewritten; an issue is kept or dropped.
//!
//! "Touches changed code" is also checked mechanically against the diff
//! hunks, so a model claiming otherwise cannot keep an out-of-diff issue.

use super::diff::ChangeSet;
use super::model::{
    Decision, IssueDraft, IterationMetrics, ReviewIssue, ReviewSubject, ReviewType, ReviewVerdict,
};
use super::persona::Persona;
use super::sandbox::SandboxContext;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Everything a reviewer sees for one iteration
#[derive(Debug, Clone)]
pub struct ReviewContext {
    pub persona: Persona,
    pub subject: ReviewSubject,
    pub review_type: ReviewType,
    pub iteration: u32,
    pub diff: String,
    /// Issues still open from earlier iterations
    pub open_issues: Vec<ReviewIssue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffPassOutput {
    pub summary: String,
    pub candidates: Vec<IssueDraft>,
    #[serde(default)]
    pub metrics: IterationMetrics,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextPassOutput {
    pub confirmed: Vec<IssueDraft>,
    #[serde(default)]
    pub metrics: IterationMetrics,
}

/// The four self-validation criteria
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationCriteria {
    pub touches_changed_code: bool,
    pub certain: bool,
    pub competent_engineer_would_flag: bool,
    pub not_caught_by_tooling: bool,
}

impl ValidationCriteria {
    pub fn passing() -> Self {
        Self {
            touches_changed_code: true,
            certain: true,
            competent_engineer_would_flag: true,
            not_caught_by_tooling: true,
        }
    }

    pub fn all(&self) -> bool {
        self.touches_changed_code
            && self.certain
            && self.competent_engineer_would_flag
            && self.not_caught_by_tooling
    }
}

/// Assessment of the candidate at `index` in the validation input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub index: usize,
    pub criteria: ValidationCriteria,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationPassOutput {
    pub decision: Decision,
    pub summary: String,
    pub assessments: Vec<Assessment>,
    #[serde(default)]
    pub metrics: IterationMetrics,
}

/// Backend that performs the three passes
#[async_trait]
pub trait ReviewModel: Send + Sync {
    async fn diff_pass(
        &self,
        context: &ReviewContext,
        sandbox: &SandboxContext,
    ) -> Result<DiffPassOutput>;

    async fn contextual_pass(
        &self,
        context: &ReviewContext,
        sandbox: &SandboxContext,
        candidates: &[IssueDraft],
    ) -> Result<ContextPassOutput>;

    async fn validation_pass(
        &self,
        context: &ReviewContext,
        sandbox: &SandboxContext,
        candidates: &[IssueDraft],
    ) -> Result<ValidationPassOutput>;
}

/// Run the passes in order and assemble the verdict
pub async fn run_methodology(
    model: &dyn ReviewModel,
    context: &ReviewContext,
    sandbox: &SandboxContext,
) -> Result<ReviewVerdict> {
    let started = Instant::now();
    let changes = ChangeSet::parse(&context.diff);
    let mut metrics = IterationMetrics::default();

    let diff_pass = model.diff_pass(context, sandbox).await?;
    metrics.add(&diff_pass.metrics);
    tracing::debug!(
        "Diff pass for iteration {} produced {} candidates",
        context.iteration,
        diff_pass.candidates.len()
    );

    let context_pass = model
        .contextual_pass(context, sandbox, &diff_pass.candidates)
        .await?;
    metrics.add(&context_pass.metrics);

    let confirmed = confirmed_candidates(&diff_pass.candidates, &context_pass.confirmed);
    if confirmed.len() < context_pass.confirmed.len() {
        tracing::warn!(
            "Contextual pass returned {} issues outside the diff-pass candidates",
            context_pass.confirmed.len() - confirmed.len()
        );
    }

    let validation = model
        .validation_pass(context, sandbox, &confirmed)
        .await?;
    metrics.add(&validation.metrics);

    let issues = keep_validated(&confirmed, &validation.assessments, &changes);
    let dropped_issues = (confirmed.len() - issues.len()) as u32;
    if dropped_issues > 0 {
        tracing::debug!(
            "Validation dropped {} of {} candidates",
            dropped_issues,
            confirmed.len()
        );
    }

    let decision = match validation.decision {
        Decision::Approve if issues.iter().any(|i| i.severity.is_blocking()) => {
            Decision::RequestChanges
        }
        decision => decision,
    };

    metrics.duration_ms = metrics
        .duration_ms
        .max(started.elapsed().as_millis() as u64);

    Ok(ReviewVerdict {
        reviewer: context.persona.name.clone(),
        decision,
        summary: if validation.summary.is_empty() {
            diff_pass.summary
        } else {
            validation.summary
        },
        issues,
        dropped_issues,
        metrics,
    })
}

/// Diff-pass candidates the contextual pass confirmed, in diff-pass order.
///
/// The candidate itself is kept, so a confirmation cannot rewrite severity.
fn confirmed_candidates(candidates: &[IssueDraft], confirmed: &[IssueDraft]) -> Vec<IssueDraft> {
    candidates
        .iter()
        .filter(|candidate| {
            confirmed.iter().any(|c| {
                c.file_path == candidate.file_path
                    && c.line_start == candidate.line_start
                    && c.line_end == candidate.line_end
            })
        })
        .cloned()
        .collect()
}

fn keep_validated(
    candidates: &[IssueDraft],
    assessments: &[Assessment],
    changes: &ChangeSet,
) -> Vec<IssueDraft> {
    candidates
        .iter()
        .enumerate()
        .filter(|(index, issue)| {
            let passed = assessments
                .iter()
                .find(|a| a.index == *index)
                .is_some_and(|a| a.criteria.all());
            passed && changes.touches(&issue.file_path, issue.line_start, issue.line_end)
        })
        .map(|(_, issue)| issue.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReviewSettings;
    use crate::review::model::Severity;
    use crate::review::sandbox::{Capability, SandboxSpec};
    use proptest::prelude::*;

    const DIFF: &str = "\
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1,2 +1,6 @@
+fn a() {}
+fn b() {}
";

    fn issue(severity: Severity, line: u32) -> IssueDraft {
        IssueDraft {
            severity,
            file_path: "src/lib.rs".to_string(),
            line_start: line,
            line_end: line,
            title: format!("issue at {}", line),
            description: "d".to_string(),
            suggestion: None,
        }
    }

    struct FixedModel {
        candidates: Vec<IssueDraft>,
        /// Issues the contextual pass reports on top of the candidates
        extra: Vec<IssueDraft>,
        criteria: Vec<ValidationCriteria>,
        decision: Decision,
    }

    #[async_trait]
    impl ReviewModel for FixedModel {
        async fn diff_pass(&self, _: &ReviewContext, _: &SandboxContext) -> Result<DiffPassOutput> {
            Ok(DiffPassOutput {
                summary: "adds two functions".to_string(),
                candidates: self.candidates.clone(),
                metrics: IterationMetrics {
                    cost_usd: 0.1,
                    ..Default::default()
                },
            })
        }

        async fn contextual_pass(
            &self,
            _: &ReviewContext,
            _: &SandboxContext,
            candidates: &[IssueDraft],
        ) -> Result<ContextPassOutput> {
            Ok(ContextPassOutput {
                confirmed: candidates.iter().chain(&self.extra).cloned().collect(),
                metrics: IterationMetrics::default(),
            })
        }

        async fn validation_pass(
            &self,
            _: &ReviewContext,
            _: &SandboxContext,
            _: &[IssueDraft],
        ) -> Result<ValidationPassOutput> {
            Ok(ValidationPassOutput {
                decision: self.decision,
                summary: String::new(),
                assessments: self
                    .criteria
                    .iter()
                    .enumerate()
                    .map(|(index, criteria)| Assessment {
                        index,
                        criteria: *criteria,
                    })
                    .collect(),
                metrics: IterationMetrics::default(),
            })
        }
    }

    fn context() -> ReviewContext {
        ReviewContext {
            persona: Persona::for_review(ReviewType::Full, &ReviewSettings::default()),
            subject: ReviewSubject {
                repository: ".".to_string(),
                branch: "main".to_string(),
                commit: "abc1234".to_string(),
                base: None,
                diff: Some(DIFF.to_string()),
            },
            review_type: ReviewType::Full,
            iteration: 1,
            diff: DIFF.to_string(),
            open_issues: Vec::new(),
        }
    }

    fn sandbox() -> SandboxContext {
        SandboxSpec::new(".")
            .allow(Capability::ReadRepository)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_failing_criteria_drop_issues() {
        let uncertain = ValidationCriteria {
            certain: false,
            ..ValidationCriteria::passing()
        };
        let model = FixedModel {
            candidates: vec![
                issue(Severity::High, 1),
                issue(Severity::Critical, 2),
                issue(Severity::Low, 40),
                issue(Severity::Medium, 3),
            ],
            // The fourth candidate has no assessment at all
            criteria: vec![
                ValidationCriteria::passing(),
                uncertain,
                ValidationCriteria::passing(),
            ],
            extra: Vec::new(),
            decision: Decision::RequestChanges,
        };

        let verdict = run_methodology(&model, &context(), &sandbox())
            .await
            .unwrap();
        assert_eq!(verdict.issues.len(), 1);
        assert_eq!(verdict.issues[0].line_start, 1);
        assert_eq!(verdict.issues[0].severity, Severity::High);
        assert_eq!(verdict.dropped_issues, 3);
        assert_eq!(verdict.summary, "adds two functions");
        assert!((verdict.metrics.cost_usd - 0.1).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_approve_with_blocking_issue_requests_changes() {
        let model = FixedModel {
            candidates: vec![issue(Severity::Critical, 2)],
            criteria: vec![ValidationCriteria::passing()],
            extra: Vec::new(),
            decision: Decision::Approve,
        };
        let verdict = run_methodology(&model, &context(), &sandbox())
            .await
            .unwrap();
        assert_eq!(verdict.decision, Decision::RequestChanges);

        let model = FixedModel {
            candidates: vec![issue(Severity::Low, 2)],
            criteria: vec![ValidationCriteria::passing()],
            extra: Vec::new(),
            decision: Decision::Approve,
        };
        let verdict = run_methodology(&model, &context(), &sandbox())
            .await
            .unwrap();
        assert_eq!(verdict.decision, Decision::Approve);
    }

    #[tokio::test]
    async fn test_contextual_pass_cannot_add_issues() {
        let escalated = IssueDraft {
            severity: Severity::Critical,
            description: "worse than it looked".to_string(),
            ..issue(Severity::Low, 1)
        };
        let model = FixedModel {
            candidates: vec![issue(Severity::Low, 1)],
            extra: vec![escalated, issue(Severity::Critical, 2)],
            criteria: vec![ValidationCriteria::passing(); 3],
            decision: Decision::Approve,
        };

        let verdict = run_methodology(&model, &context(), &sandbox())
            .await
            .unwrap();
        assert_eq!(verdict.issues, vec![issue(Severity::Low, 1)]);
        assert_eq!(verdict.dropped_issues, 0);
        assert_eq!(verdict.decision, Decision::Approve);
    }

    fn any_criteria() -> impl Strategy<Value = ValidationCriteria> {
        (any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>()).prop_map(|(a, b, c, d)| {
            ValidationCriteria {
                touches_changed_code: a,
                certain: b,
                competent_engineer_would_flag: c,
                not_caught_by_tooling: d,
            }
        })
    }

    proptest! {
        #[test]
        fn prop_kept_issues_pass_every_criterion(
            criteria in prop::collection::vec(any_criteria(), 0..8),
            lines in prop::collection::vec(1u32..10, 8),
        ) {
            let changes = ChangeSet::parse(DIFF);
            let candidates: Vec<IssueDraft> = lines
                .iter()
                .enumerate()
                .map(|(i, line)| IssueDraft {
                    title: format!("candidate {}", i),
                    ..issue(Severity::High, *line)
                })
                .collect();
            let assessments: Vec<Assessment> = criteria
                .iter()
                .enumerate()
                .map(|(index, criteria)| Assessment { index, criteria: *criteria })
                .collect();

            let kept = keep_validated(&candidates, &assessments, &changes);
            for issue in &kept {
                let index = candidates.iter().position(|c| c == issue).unwrap();
                prop_assert!(criteria.get(index).is_some_and(|c| c.all()));
                prop_assert!(changes.touches(&issue.file_path, issue.line_start, issue.line_end));
                prop_assert_eq!(issue.severity, Severity::High);
            }
        }
    }
}
