//! Common test utilities and helpers

#![allow(dead_code)]

use async_trait::async_trait;
use hermes_core::broker::AgentProfile;
use hermes_core::review::{
    Assessment, ContextPassOutput, Decision, DiffPassOutput, IssueDraft, IterationMetrics,
    ReviewContext, ReviewModel, ReviewSubject, SandboxContext, Severity, ValidationCriteria,
    ValidationPassOutput,
};
use hermes_core::runtime::registry::ServiceRegistry;
use hermes_core::{CoordinationEngine, HermesConfig, Result, Store};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Diff touching lines 1-6 of src/lib.rs
pub const DIFF: &str = "\
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1,2 +1,6 @@
+pub fn parse(input: &str) -> u32 {
+    input.parse().unwrap()
+}
+
 pub fn run() {}
";

/// Config tuned for tests: manual reviewer starts, short request timeout
pub fn test_config(dir: &TempDir) -> HermesConfig {
    let mut config = HermesConfig::default();
    config.storage.path = dir.path().join("hermes.db");
    config.review.auto_start = false;
    config.runtime.request_timeout_ms = 5_000;
    config.queue.sweep_interval_secs = 3_600;
    config
}

pub async fn start_engine(
    config: HermesConfig,
    model: Arc<dyn ReviewModel>,
) -> CoordinationEngine {
    let store = Store::open(&config.storage)
        .await
        .expect("Failed to open test store");
    CoordinationEngine::start_with_reviewer(
        config,
        store,
        ServiceRegistry::new(),
        model,
        Arc::new(InlineDiffOnly),
    )
    .await
    .expect("Failed to start engine")
}

pub async fn register_agents(engine: &CoordinationEngine, names: &[&str]) {
    for name in names {
        engine
            .broker()
            .register_agent(AgentProfile::named(*name))
            .await
            .expect("Failed to register agent");
    }
}

pub fn subject(repository: &TempDir) -> ReviewSubject {
    ReviewSubject {
        repository: repository.path().to_string_lossy().to_string(),
        branch: "feature/parse".to_string(),
        commit: "4f2a9c1".to_string(),
        base: Some("main".to_string()),
        diff: Some(DIFF.to_string()),
    }
}

pub fn issue(severity: Severity, line: u32, title: &str) -> IssueDraft {
    IssueDraft {
        severity,
        file_path: "src/lib.rs".to_string(),
        line_start: line,
        line_end: line,
        title: title.to_string(),
        description: format!("{} at line {}", title, line),
        suggestion: None,
    }
}

/// Poll until `check` holds or the deadline passes
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Diffs always come inline with the subject in tests
pub struct InlineDiffOnly;

#[async_trait]
impl hermes_core::review::DiffSource for InlineDiffOnly {
    async fn diff(&self, _subject: &ReviewSubject, _sandbox: &SandboxContext) -> Result<String> {
        Err(hermes_core::HermesError::ReviewerFailed(
            "tests supply diffs inline".to_string(),
        ))
    }
}

/// What the model answers for one iteration
#[derive(Debug, Clone)]
pub struct Script {
    pub decision: Decision,
    pub candidates: Vec<IssueDraft>,
    /// Criteria per candidate, by position; missing entries get no assessment
    pub criteria: Vec<ValidationCriteria>,
}

impl Script {
    pub fn approve() -> Self {
        Self {
            decision: Decision::Approve,
            candidates: Vec::new(),
            criteria: Vec::new(),
        }
    }

    /// Every candidate passes validation
    pub fn with_issues(decision: Decision, candidates: Vec<IssueDraft>) -> Self {
        let criteria = vec![ValidationCriteria::passing(); candidates.len()];
        Self {
            decision,
            candidates,
            criteria,
        }
    }
}

/// Review model answering from a per-iteration script
pub struct ScriptedReviewModel {
    scripts: Vec<Script>,
    /// Never finish the diff pass
    hang: bool,
    calls: AtomicUsize,
}

impl ScriptedReviewModel {
    /// Iteration `n` uses `scripts[n - 1]`, the last script repeating
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts,
            hang: false,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn hanging() -> Arc<Self> {
        Arc::new(Self {
            scripts: vec![Script::approve()],
            hang: true,
            calls: AtomicUsize::new(0),
        })
    }

    /// Diff passes started so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn script(&self, iteration: u32) -> &Script {
        let index = (iteration.max(1) as usize - 1).min(self.scripts.len() - 1);
        &self.scripts[index]
    }
}

#[async_trait]
impl ReviewModel for ScriptedReviewModel {
    async fn diff_pass(
        &self,
        context: &ReviewContext,
        _sandbox: &SandboxContext,
    ) -> Result<DiffPassOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        Ok(DiffPassOutput {
            summary: format!("iteration {} of {}", context.iteration, context.subject.commit),
            candidates: self.script(context.iteration).candidates.clone(),
            metrics: IterationMetrics {
                cost_usd: 0.01,
                duration_ms: 5,
                input_tokens: 100,
                output_tokens: 20,
            },
        })
    }

    async fn contextual_pass(
        &self,
        _context: &ReviewContext,
        _sandbox: &SandboxContext,
        candidates: &[IssueDraft],
    ) -> Result<ContextPassOutput> {
        Ok(ContextPassOutput {
            confirmed: candidates.to_vec(),
            metrics: IterationMetrics::default(),
        })
    }

    async fn validation_pass(
        &self,
        context: &ReviewContext,
        _sandbox: &SandboxContext,
        _candidates: &[IssueDraft],
    ) -> Result<ValidationPassOutput> {
        let script = self.script(context.iteration);
        Ok(ValidationPassOutput {
            decision: script.decision,
            summary: String::new(),
            assessments: script
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
