//! Review tables: reviews, review_iterations, review_issues.
//!
//! Writes are issued only by the review orchestrator.

use super::{from_millis, opt_from_millis, parse_column, parse_uuid_column, to_millis};
use crate::error::Result;
use crate::review::fsm::ReviewState;
use crate::review::model::{
    Decision, IssueStatus, IterationMetrics, Review, ReviewFilter, ReviewIssue, ReviewIteration,
    ReviewSubject, ReviewType, Severity,
};
use crate::types::{AgentId, IssueId, Priority, ReviewId};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const REVIEW_COLUMNS: &str = "id, repository, branch, commit_sha, base_ref, inline_diff, \
     review_type, priority, state, requested_by, idempotency_key, last_error, cancel_reason, \
     created_at, updated_at, completed_at";

const ISSUE_COLUMNS: &str = "id, review_id, iteration, severity, file_path, line_start, line_end, \
     title, description, suggestion, status, resolved_in_iteration, created_at, updated_at";

fn review_from_row(row: &Row<'_>) -> rusqlite::Result<Review> {
    Ok(Review {
        id: parse_uuid_column(0, row.get(0)?)?,
        subject: ReviewSubject {
            repository: row.get(1)?,
            branch: row.get(2)?,
            commit: row.get(3)?,
            base: row.get(4)?,
            diff: row.get(5)?,
        },
        review_type: parse_column(6, row.get(6)?, ReviewType::parse)?,
        priority: parse_column(7, row.get(7)?, Priority::parse)?,
        state: parse_column(8, row.get(8)?, ReviewState::parse)?,
        requested_by: AgentId::new(row.get::<_, String>(9)?),
        idempotency_key: row.get(10)?,
        last_error: row.get(11)?,
        cancel_reason: row.get(12)?,
        created_at: from_millis(row.get(13)?),
        updated_at: from_millis(row.get(14)?),
        completed_at: opt_from_millis(row.get(15)?),
    })
}

fn iteration_from_row(row: &Row<'_>) -> rusqlite::Result<ReviewIteration> {
    Ok(ReviewIteration {
        review_id: parse_uuid_column(0, row.get(0)?)?,
        iteration: row.get(1)?,
        reviewer: row.get(2)?,
        decision: parse_column(3, row.get(3)?, Decision::parse)?,
        summary: row.get(4)?,
        metrics: IterationMetrics {
            cost_usd: row.get(5)?,
            duration_ms: row.get::<_, i64>(6)? as u64,
            input_tokens: row.get::<_, i64>(7)? as u64,
            output_tokens: row.get::<_, i64>(8)? as u64,
        },
        dropped_issues: row.get(9)?,
        created_at: from_millis(row.get(10)?),
    })
}

fn issue_from_row(row: &Row<'_>) -> rusqlite::Result<ReviewIssue> {
    Ok(ReviewIssue {
        id: parse_uuid_column(0, row.get(0)?)?,
        review_id: parse_uuid_column(1, row.get(1)?)?,
        iteration: row.get(2)?,
        severity: parse_column(3, row.get(3)?, Severity::parse)?,
        file_path: row.get(4)?,
        line_start: row.get(5)?,
        line_end: row.get(6)?,
        title: row.get(7)?,
        description: row.get(8)?,
        suggestion: row.get(9)?,
        status: parse_column(10, row.get(10)?, IssueStatus::parse)?,
        resolved_in_iteration: row.get(11)?,
        created_at: from_millis(row.get(12)?),
        updated_at: from_millis(row.get(13)?),
    })
}

// Reviews

pub fn insert_review(conn: &Connection, review: &Review) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO reviews ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            REVIEW_COLUMNS
        ),
        params![
            review.id.to_string(),
            review.subject.repository,
            review.subject.branch,
            review.subject.commit,
            review.subject.base,
            review.subject.diff,
            review.review_type.as_str(),
            review.priority.as_str(),
            review.state.as_str(),
            review.requested_by.as_str(),
            review.idempotency_key,
            review.last_error,
            review.cancel_reason,
            to_millis(review.created_at),
            to_millis(review.updated_at),
            review.completed_at.map(to_millis),
        ],
    )?;
    Ok(())
}

/// Persist the mutable columns of a review
pub fn update_review(conn: &Connection, review: &Review) -> Result<()> {
    conn.execute(
        "UPDATE reviews SET state = ?2, last_error = ?3, cancel_reason = ?4,
             updated_at = ?5, completed_at = ?6
         WHERE id = ?1",
        params![
            review.id.to_string(),
            review.state.as_str(),
            review.last_error,
            review.cancel_reason,
            to_millis(review.updated_at),
            review.completed_at.map(to_millis),
        ],
    )?;
    Ok(())
}

pub fn get_review(conn: &Connection, id: &ReviewId) -> Result<Option<Review>> {
    let review = conn
        .query_row(
            &format!("SELECT {} FROM reviews WHERE id = ?1", REVIEW_COLUMNS),
            params![id.to_string()],
            review_from_row,
        )
        .optional()?;
    Ok(review)
}

pub fn find_review_by_key(conn: &Connection, key: &str) -> Result<Option<Review>> {
    let review = conn
        .query_row(
            &format!("SELECT {} FROM reviews WHERE idempotency_key = ?1", REVIEW_COLUMNS),
            params![key],
            review_from_row,
        )
        .optional()?;
    Ok(review)
}

pub fn list_reviews(conn: &Connection, filter: &ReviewFilter) -> Result<Vec<Review>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM reviews
         WHERE (?1 IS NULL OR state = ?1)
           AND (?2 IS NULL OR review_type = ?2)
           AND (?3 IS NULL OR requested_by = ?3)
         ORDER BY created_at DESC, id
         LIMIT ?4",
        REVIEW_COLUMNS
    ))?;
    let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
    let reviews = stmt
        .query_map(
            params![
                filter.state.map(|s| s.as_str()),
                filter.review_type.map(|t| t.as_str()),
                filter.requested_by.as_ref().map(|a| a.as_str()),
                limit,
            ],
            review_from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(reviews)
}

/// Reviews in any of `states`, oldest first
pub fn reviews_in_states(conn: &Connection, states: &[ReviewState]) -> Result<Vec<Review>> {
    let mut reviews = Vec::new();
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM reviews WHERE state = ?1 ORDER BY created_at, id",
        REVIEW_COLUMNS
    ))?;
    for state in states {
        let rows = stmt
            .query_map(params![state.as_str()], review_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        reviews.extend(rows);
    }
    reviews.sort_by_key(|r| r.created_at);
    Ok(reviews)
}

/// Returns true when a review was removed along with its iterations and issues
pub fn delete_review(conn: &Connection, id: &ReviewId) -> Result<bool> {
    let id = id.to_string();
    conn.execute("DELETE FROM review_issues WHERE review_id = ?1", params![id])?;
    conn.execute("DELETE FROM review_iterations WHERE review_id = ?1", params![id])?;
    let changed = conn.execute("DELETE FROM reviews WHERE id = ?1", params![id])?;
    Ok(changed == 1)
}

// Iterations

/// Previous max + 1, starting at 1
pub fn next_iteration(conn: &Connection, review: &ReviewId) -> Result<u32> {
    let max: Option<u32> = conn.query_row(
        "SELECT MAX(iteration) FROM review_iterations WHERE review_id = ?1",
        params![review.to_string()],
        |row| row.get(0),
    )?;
    Ok(max.unwrap_or(0) + 1)
}

pub fn insert_iteration(conn: &Connection, iteration: &ReviewIteration) -> Result<()> {
    conn.execute(
        "INSERT INTO review_iterations
             (review_id, iteration, reviewer, decision, summary, cost_usd, duration_ms,
              input_tokens, output_tokens, dropped_issues, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            iteration.review_id.to_string(),
            iteration.iteration,
            iteration.reviewer,
            iteration.decision.as_str(),
            iteration.summary,
            iteration.metrics.cost_usd,
            iteration.metrics.duration_ms as i64,
            iteration.metrics.input_tokens as i64,
            iteration.metrics.output_tokens as i64,
            iteration.dropped_issues,
            to_millis(iteration.created_at),
        ],
    )?;
    Ok(())
}

pub fn list_iterations(conn: &Connection, review: &ReviewId) -> Result<Vec<ReviewIteration>> {
    let mut stmt = conn.prepare(
        "SELECT review_id, iteration, reviewer, decision, summary, cost_usd, duration_ms,
                input_tokens, output_tokens, dropped_issues, created_at
         FROM review_iterations WHERE review_id = ?1 ORDER BY iteration",
    )?;
    let iterations = stmt
        .query_map(params![review.to_string()], iteration_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(iterations)
}

// Issues

pub fn insert_issue(conn: &Connection, issue: &ReviewIssue) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO review_issues ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            ISSUE_COLUMNS
        ),
        params![
            issue.id.to_string(),
            issue.review_id.to_string(),
            issue.iteration,
            issue.severity.as_str(),
            issue.file_path,
            issue.line_start,
            issue.line_end,
            issue.title,
            issue.description,
            issue.suggestion,
            issue.status.as_str(),
            issue.resolved_in_iteration,
            to_millis(issue.created_at),
            to_millis(issue.updated_at),
        ],
    )?;
    Ok(())
}

pub fn get_issue(conn: &Connection, id: &IssueId) -> Result<Option<ReviewIssue>> {
    let issue = conn
        .query_row(
            &format!("SELECT {} FROM review_issues WHERE id = ?1", ISSUE_COLUMNS),
            params![id.to_string()],
            issue_from_row,
        )
        .optional()?;
    Ok(issue)
}

pub fn list_issues(conn: &Connection, review: &ReviewId) -> Result<Vec<ReviewIssue>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM review_issues WHERE review_id = ?1
         ORDER BY iteration, line_start, file_path",
        ISSUE_COLUMNS
    ))?;
    let issues = stmt
        .query_map(params![review.to_string()], issue_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(issues)
}

pub fn open_issues(conn: &Connection, review: &ReviewId) -> Result<Vec<ReviewIssue>> {
    Ok(list_issues(conn, review)?
        .into_iter()
        .filter(|i| i.status == IssueStatus::Open)
        .collect())
}

/// Move an open issue to a resolved status; returns false if it was not open
pub fn resolve_issue(
    conn: &Connection,
    id: &IssueId,
    status: IssueStatus,
    resolved_in_iteration: Option<u32>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE review_issues SET status = ?2, resolved_in_iteration = ?3, updated_at = ?4
         WHERE id = ?1 AND status = 'open'",
        params![
            id.to_string(),
            status.as_str(),
            resolved_in_iteration,
            to_millis(now),
        ],
    )?;
    Ok(changed == 1)
}
