//! Review passes backed by an external model CLI
//!
//! Each pass is one invocation of the configured command inside the
//! reviewer's sandbox. The prompt goes in on stdin. Stdout is either the
//! CLI's JSON result envelope or the pass payload itself.

use super::methodology::{
    ContextPassOutput, DiffPassOutput, ReviewContext, ReviewModel, ValidationPassOutput,
};
use super::model::{IssueDraft, IterationMetrics};
use super::sandbox::SandboxContext;
use crate::error::{HermesError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;

const STDERR_EXCERPT: usize = 2000;

#[derive(Debug, Deserialize)]
struct ResultEnvelope {
    result: String,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    total_cost_usd: f64,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct CommandReviewModel {
    command: Vec<String>,
}

impl CommandReviewModel {
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.is_empty() {
            return Err(HermesError::Config("review command is empty".to_string()));
        }
        Ok(Self { command })
    }

    async fn invoke<T: DeserializeOwned>(
        &self,
        context: &ReviewContext,
        sandbox: &SandboxContext,
        prompt: String,
    ) -> Result<(T, IterationMetrics)> {
        let (program, base_args) = self
            .command
            .split_first()
            .ok_or_else(|| HermesError::Config("review command is empty".to_string()))?;

        let mut command = sandbox.command(program);
        command
            .args(base_args)
            .arg("--model")
            .arg(context.persona.model_class.model_name())
            .arg("--allowedTools")
            .arg(sandbox.allowed_tools().join(","))
            .stdin(Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            HermesError::ReviewerFailed(format!("Failed to spawn {}: {}", program, e))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.chars().take(STDERR_EXCERPT).collect();
            return Err(HermesError::ReviewerFailed(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                excerpt.trim()
            )));
        }

        parse_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Decode a pass payload from stdout, unwrapping the result envelope if present
fn parse_output<T: DeserializeOwned>(stdout: &str) -> Result<(T, IterationMetrics)> {
    if let Ok(envelope) = serde_json::from_str::<ResultEnvelope>(stdout) {
        if envelope.is_error {
            return Err(HermesError::ReviewerFailed(envelope.result));
        }
        let payload = serde_json::from_str(extract_json(&envelope.result)?)?;
        let metrics = IterationMetrics {
            cost_usd: envelope.total_cost_usd,
            duration_ms: envelope.duration_ms,
            input_tokens: envelope.usage.input_tokens,
            output_tokens: envelope.usage.output_tokens,
        };
        return Ok((payload, metrics));
    }

    let payload = serde_json::from_str(extract_json(stdout)?)?;
    Ok((payload, IterationMetrics::default()))
}

/// Outermost JSON object in free text (models like to wrap it in prose or fences)
fn extract_json(text: &str) -> Result<&str> {
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => Ok(&text[start..=end]),
        _ => Err(HermesError::ReviewerFailed(
            "reviewer output contains no JSON object".to_string(),
        )),
    }
}

fn issues_json(issues: &[IssueDraft]) -> Result<String> {
    Ok(serde_json::to_string_pretty(issues)?)
}

const ISSUE_SCHEMA: &str = r#"{"severity": "critical|high|medium|low", "file_path": "...", "line_start": 1, "line_end": 1, "title": "...", "description": "...", "suggestion": "... or null"}"#;

fn header(context: &ReviewContext) -> String {
    format!(
        "You are {} reviewing commit {} on branch {} of {}.\n\
         Focus: {}.\n\
         This is iteration {}. You have read-only access to the repository.\n",
        context.persona.name,
        context.subject.commit,
        context.subject.branch,
        context.subject.repository,
        context.persona.focus,
        context.iteration,
    )
}

#[async_trait]
impl ReviewModel for CommandReviewModel {
    async fn diff_pass(
        &self,
        context: &ReviewContext,
        sandbox: &SandboxContext,
    ) -> Result<DiffPassOutput> {
        let mut prompt = header(context);
        prompt.push_str(
            "\nPass 1 of 3. Look only at the changed hunks below. Summarize the change and \
             list candidate issues.\n",
        );
        if !context.open_issues.is_empty() {
            prompt.push_str("\nIssues still open from earlier iterations:\n");
            for issue in &context.open_issues {
                prompt.push_str(&format!(
                    "- [{}] {}:{}-{} {}\n",
                    issue.severity.as_str(),
                    issue.file_path,
                    issue.line_start,
                    issue.line_end,
                    issue.title
                ));
            }
        }
        prompt.push_str(&format!(
            "\nRespond with JSON only: {{\"summary\": \"...\", \"candidates\": [{}]}}\n\
             \nDIFF BEGINS:\n{}\nDIFF ENDS\n",
            ISSUE_SCHEMA, context.diff
        ));

        let (mut output, metrics): (DiffPassOutput, _) =
            self.invoke(context, sandbox, prompt).await?;
        output.metrics = metrics;
        Ok(output)
    }

    async fn contextual_pass(
        &self,
        context: &ReviewContext,
        sandbox: &SandboxContext,
        candidates: &[IssueDraft],
    ) -> Result<ContextPassOutput> {
        if candidates.is_empty() {
            return Ok(ContextPassOutput::default());
        }

        let prompt = format!(
            "{}\nPass 2 of 3. For each candidate below, read the surrounding code and any \
             callers across files. Keep only candidates that still hold with full context. \
             Do not change severities.\n\
             \nRespond with JSON only: {{\"confirmed\": [{}]}}\n\
             \nCANDIDATES:\n{}\n",
            header(context),
            ISSUE_SCHEMA,
            issues_json(candidates)?
        );

        let (mut output, metrics): (ContextPassOutput, _) =
            self.invoke(context, sandbox, prompt).await?;
        output.metrics = metrics;
        Ok(output)
    }

    async fn validation_pass(
        &self,
        context: &ReviewContext,
        sandbox: &SandboxContext,
        candidates: &[IssueDraft],
    ) -> Result<ValidationPassOutput> {
        let prompt = format!(
            "{}\nPass 3 of 3. Assess every candidate (by zero-based index) against four \
             criteria: it touches changed code; you are certain, not speculating; a competent \
             engineer would flag it; a standard linter or CI check would not already catch it. \
             Then decide: approve, request_changes, comment or reject.\n\
             \nRespond with JSON only: {{\"decision\": \"...\", \"summary\": \"...\", \
             \"assessments\": [{{\"index\": 0, \"criteria\": {{\"touches_changed_code\": true, \
             \"certain\": true, \"competent_engineer_would_flag\": true, \
             \"not_caught_by_tooling\": true}}}}]}}\n\
             \nCANDIDATES:\n{}\n",
            header(context),
            issues_json(candidates)?
        );

        let (mut output, metrics): (ValidationPassOutput, _) =
            self.invoke(context, sandbox, prompt).await?;
        output.metrics = metrics;
        Ok(output)
    }
}
