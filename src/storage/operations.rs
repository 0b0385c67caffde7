//! Pending operation table.
//!
//! Writes are issued only by the queue actor. Expiry is lazy: every drain
//! first expires the agent's overdue operations, so an operation past its
//! TTL is never handed out even if no sweep has run.

use super::{from_millis, parse_column, parse_uuid_column, to_millis};
use crate::error::{HermesError, Result};
use crate::queue::operation::{OperationPayload, OperationStatus, PendingOperation};
use crate::types::{AgentId, OperationId};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const OPERATION_COLUMNS: &str = "seq, id, idempotency_key, origin_agent, origin_session, payload, \
     status, attempts, last_error, created_at, expires_at, updated_at";

fn operation_from_row(row: &Row<'_>) -> rusqlite::Result<PendingOperation> {
    let payload: String = row.get(5)?;
    let payload: OperationPayload = serde_json::from_str(&payload).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(PendingOperation {
        seq: row.get::<_, i64>(0)? as u64,
        id: parse_uuid_column(1, row.get(1)?)?,
        idempotency_key: row.get(2)?,
        origin_agent: AgentId::new(row.get::<_, String>(3)?),
        origin_session: row.get(4)?,
        payload,
        status: parse_column(6, row.get(6)?, OperationStatus::parse)?,
        attempts: row.get(7)?,
        last_error: row.get(8)?,
        created_at: from_millis(row.get(9)?),
        expires_at: from_millis(row.get(10)?),
        updated_at: from_millis(row.get(11)?),
    })
}

/// Insert unless the key exists; returns the stored record and whether it is new
pub fn insert_operation(
    conn: &Connection,
    operation: &PendingOperation,
) -> Result<(PendingOperation, bool)> {
    if let Some(existing) = find_by_key(conn, &operation.idempotency_key)? {
        return Ok((existing, false));
    }

    conn.execute(
        "INSERT INTO pending_operations
             (id, idempotency_key, origin_agent, origin_session, payload, status, attempts,
              last_error, created_at, expires_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            operation.id.to_string(),
            operation.idempotency_key,
            operation.origin_agent.as_str(),
            operation.origin_session,
            serde_json::to_string(&operation.payload)?,
            operation.status.as_str(),
            operation.attempts,
            operation.last_error,
            to_millis(operation.created_at),
            to_millis(operation.expires_at),
            to_millis(operation.updated_at),
        ],
    )?;

    let stored = get_operation(conn, &operation.id)?
        .ok_or_else(|| HermesError::OperationNotFound(operation.id.to_string()))?;
    Ok((stored, true))
}

pub fn find_by_key(conn: &Connection, key: &str) -> Result<Option<PendingOperation>> {
    let operation = conn
        .query_row(
            &format!(
                "SELECT {} FROM pending_operations WHERE idempotency_key = ?1",
                OPERATION_COLUMNS
            ),
            params![key],
            operation_from_row,
        )
        .optional()?;
    Ok(operation)
}

pub fn get_operation(conn: &Connection, id: &OperationId) -> Result<Option<PendingOperation>> {
    let operation = conn
        .query_row(
            &format!("SELECT {} FROM pending_operations WHERE id = ?1", OPERATION_COLUMNS),
            params![id.to_string()],
            operation_from_row,
        )
        .optional()?;
    Ok(operation)
}

pub fn operations_for_agent(conn: &Connection, agent: &AgentId) -> Result<Vec<PendingOperation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM pending_operations WHERE origin_agent = ?1 ORDER BY seq",
        OPERATION_COLUMNS
    ))?;
    let operations = stmt
        .query_map(params![agent.as_str()], operation_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(operations)
}

/// Expire pending operations past their TTL, optionally for one agent only
pub fn expire_overdue(
    conn: &Connection,
    agent: Option<&AgentId>,
    now: DateTime<Utc>,
) -> Result<usize> {
    let expired = conn.execute(
        "UPDATE pending_operations SET status = 'expired', updated_at = ?1
         WHERE status = 'pending' AND expires_at <= ?1
           AND (?2 IS NULL OR origin_agent = ?2)",
        params![to_millis(now), agent.map(|a| a.as_str())],
    )?;
    Ok(expired)
}

/// Claim every live pending operation of `agent`, in creation order.
///
/// Must run inside a write transaction so a concurrent drain sees the claim.
pub fn claim_pending(
    conn: &Connection,
    agent: &AgentId,
    now: DateTime<Utc>,
) -> Result<Vec<PendingOperation>> {
    expire_overdue(conn, Some(agent), now)?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM pending_operations
         WHERE origin_agent = ?1 AND status = 'pending'
         ORDER BY seq",
        OPERATION_COLUMNS
    ))?;
    let mut claimed = stmt
        .query_map(params![agent.as_str()], operation_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for operation in &mut claimed {
        conn.execute(
            "UPDATE pending_operations SET status = 'delivering', updated_at = ?2
             WHERE seq = ?1 AND status = 'pending'",
            params![operation.seq as i64, to_millis(now)],
        )?;
        operation.status = OperationStatus::Delivering;
        operation.updated_at = now;
    }
    Ok(claimed)
}

pub fn mark_delivered(
    conn: &Connection,
    id: &OperationId,
    now: DateTime<Utc>,
) -> Result<PendingOperation> {
    let current = get_operation(conn, id)?
        .ok_or_else(|| HermesError::OperationNotFound(id.to_string()))?;

    match current.status {
        OperationStatus::Delivered => return Ok(current),
        OperationStatus::Expired => {
            return Err(HermesError::OperationExpired(current.idempotency_key))
        }
        OperationStatus::Failed => {
            return Err(HermesError::InvalidRequest(format!(
                "operation {} already failed",
                id
            )))
        }
        OperationStatus::Pending | OperationStatus::Delivering => {}
    }

    conn.execute(
        "UPDATE pending_operations SET status = 'delivered', last_error = NULL, updated_at = ?2
         WHERE id = ?1",
        params![id.to_string(), to_millis(now)],
    )?;
    get_operation(conn, id)?.ok_or_else(|| HermesError::OperationNotFound(id.to_string()))
}

/// Count a failed attempt: back to pending, or failed once `max_attempts` is hit
pub fn mark_failed(
    conn: &Connection,
    id: &OperationId,
    error: &str,
    max_attempts: Option<u32>,
    now: DateTime<Utc>,
) -> Result<PendingOperation> {
    let current = get_operation(conn, id)?
        .ok_or_else(|| HermesError::OperationNotFound(id.to_string()))?;

    match current.status {
        OperationStatus::Delivered => {
            return Err(HermesError::InvalidRequest(format!(
                "operation {} was already delivered",
                id
            )))
        }
        OperationStatus::Expired => {
            return Err(HermesError::OperationExpired(current.idempotency_key))
        }
        OperationStatus::Failed => return Ok(current),
        OperationStatus::Pending | OperationStatus::Delivering => {}
    }

    let attempts = current.attempts + 1;
    let status = match max_attempts {
        Some(max) if attempts >= max => OperationStatus::Failed,
        _ => OperationStatus::Pending,
    };

    conn.execute(
        "UPDATE pending_operations SET status = ?2, attempts = ?3, last_error = ?4, updated_at = ?5
         WHERE id = ?1",
        params![
            id.to_string(),
            status.as_str(),
            attempts,
            error,
            to_millis(now),
        ],
    )?;
    get_operation(conn, id)?.ok_or_else(|| HermesError::OperationNotFound(id.to_string()))
}

/// Return operations stranded in `delivering` to `pending`
pub fn reset_delivering(conn: &Connection, now: DateTime<Utc>) -> Result<usize> {
    let reset = conn.execute(
        "UPDATE pending_operations SET status = 'pending', updated_at = ?1
         WHERE status = 'delivering'",
        params![to_millis(now)],
    )?;
    Ok(reset)
}

/// Give a claimed operation back to `pending` without counting an attempt.
///
/// Returns `None` when the operation is no longer claimed.
pub fn release_claim(
    conn: &Connection,
    id: &OperationId,
    now: DateTime<Utc>,
) -> Result<Option<PendingOperation>> {
    let released = conn.execute(
        "UPDATE pending_operations SET status = 'pending', updated_at = ?2
         WHERE id = ?1 AND status = 'delivering'",
        params![id.to_string(), to_millis(now)],
    )?;
    if released == 0 {
        return Ok(None);
    }
    get_operation(conn, id)
}

/// Return claims taken before `claimed_before` to `pending`
pub fn reclaim_stale(
    conn: &Connection,
    claimed_before: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<usize> {
    let reclaimed = conn.execute(
        "UPDATE pending_operations SET status = 'pending', updated_at = ?2
         WHERE status = 'delivering' AND updated_at < ?1",
        params![to_millis(claimed_before), to_millis(now)],
    )?;
    Ok(reclaimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;
    use crate::types::TopicId;
    use chrono::Duration;
    use tempfile::TempDir;

    fn operation(key: &str, agent: &str, ttl: Duration) -> PendingOperation {
        let now = Utc::now();
        PendingOperation {
            id: OperationId::new(),
            seq: 0,
            idempotency_key: key.to_string(),
            origin_agent: AgentId::new(agent),
            origin_session: None,
            payload: OperationPayload::Subscribe {
                topic: TopicId::new("builds"),
            },
            status: OperationStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            expires_at: now + ttl,
            updated_at: now,
        }
    }

    async fn store() -> (TempDir, Store) {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open_path(temp_dir.path().join("queue.db"))
            .await
            .unwrap();
        (temp_dir, store)
    }

    #[tokio::test]
    async fn test_insert_dedups_by_key() {
        let (_dir, store) = store().await;
        let first = operation("k1", "alice", Duration::days(7));
        let second = operation("k1", "alice", Duration::days(7));

        let (a, created_a) = store
            .write(move |conn| insert_operation(conn, &first))
            .await
            .unwrap();
        let (b, created_b) = store
            .write(move |conn| insert_operation(conn, &second))
            .await
            .unwrap();

        assert!(created_a);
        assert!(!created_b);
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_claim_skips_expired_and_other_agents() {
        let (_dir, store) = store().await;
        let live = operation("live", "alice", Duration::days(7));
        let stale = operation("stale", "alice", Duration::seconds(-1));
        let other = operation("other", "bob", Duration::days(7));

        store
            .write(move |conn| {
                for op in [&live, &stale, &other] {
                    insert_operation(conn, op)?;
                }
                Ok(())
            })
            .await
            .unwrap();

        let alice = AgentId::new("alice");
        let claimed = store
            .write(move |conn| claim_pending(conn, &alice, Utc::now()))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].idempotency_key, "live");
        assert_eq!(claimed[0].status, OperationStatus::Delivering);

        let stale = store
            .read(|conn| find_by_key(conn, "stale"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stale.status, OperationStatus::Expired);
    }

    #[tokio::test]
    async fn test_mark_failed_respects_max_attempts() {
        let (_dir, store) = store().await;
        let op = operation("k", "alice", Duration::days(7));
        let id = op.id;
        store
            .write(move |conn| insert_operation(conn, &op))
            .await
            .unwrap();

        let first = store
            .write(move |conn| mark_failed(conn, &id, "boom", Some(2), Utc::now()))
            .await
            .unwrap();
        assert_eq!(first.status, OperationStatus::Pending);
        assert_eq!(first.attempts, 1);

        let second = store
            .write(move |conn| mark_failed(conn, &id, "boom again", Some(2), Utc::now()))
            .await
            .unwrap();
        assert_eq!(second.status, OperationStatus::Failed);
        assert_eq!(second.last_error.as_deref(), Some("boom again"));
    }

    #[tokio::test]
    async fn test_released_and_stale_claims_return_to_pending() {
        let (_dir, store) = store().await;
        let early = operation("early", "alice", Duration::days(7));
        let late = operation("late", "bob", Duration::days(7));
        let early_id = early.id;
        store
            .write(move |conn| {
                insert_operation(conn, &early)?;
                insert_operation(conn, &late)?;
                Ok(())
            })
            .await
            .unwrap();

        let claimed_at = Utc::now() - Duration::minutes(10);
        store
            .write(move |conn| {
                claim_pending(conn, &AgentId::new("alice"), claimed_at)?;
                claim_pending(conn, &AgentId::new("bob"), Utc::now())?;
                Ok(())
            })
            .await
            .unwrap();

        // Only the claim older than the lease is reclaimed
        let reclaimed = store
            .write(|conn| reclaim_stale(conn, Utc::now() - Duration::minutes(5), Utc::now()))
            .await
            .unwrap();
        assert_eq!(reclaimed, 1);
        let late = store
            .read(|conn| find_by_key(conn, "late"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(late.status, OperationStatus::Delivering);

        let again = store
            .write(|conn| claim_pending(conn, &AgentId::new("alice"), Utc::now()))
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempts, 0);

        let released = store
            .write(move |conn| release_claim(conn, &early_id, Utc::now()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(released.status, OperationStatus::Pending);
        assert_eq!(released.attempts, 0);

        // Releasing something that is not claimed is a no-op
        let twice = store
            .write(move |conn| release_claim(conn, &early_id, Utc::now()))
            .await
            .unwrap();
        assert!(twice.is_none());
    }
}
