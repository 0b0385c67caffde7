//! Broker tables: agents, topics, subscriptions, messages, recipients,
//! consumer offsets and the message search index.
//!
//! Writes are issued only by the broker actor that owns a topic.

use super::{from_millis, opt_from_millis, parse_column, parse_uuid_column, to_millis};
use crate::broker::model::{
    Agent, AgentProfile, InboxEntry, InboxFilter, Message, RecipientState, Topic, TopicKind,
};
use crate::error::Result;
use crate::types::{AgentId, LogOffset, MessageId, Priority, TopicId};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const MESSAGE_COLUMNS: &str = "m.id, m.topic, m.log_offset, m.sender, m.thread_id, m.priority, \
     m.subject, m.body, m.idempotency_key, m.created_at";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: parse_uuid_column(0, row.get(0)?)?,
        topic: TopicId::new(row.get::<_, String>(1)?),
        offset: row.get::<_, i64>(2)? as LogOffset,
        sender: AgentId::new(row.get::<_, String>(3)?),
        thread_id: row.get(4)?,
        priority: parse_column(5, row.get(5)?, Priority::parse)?,
        subject: row.get(6)?,
        body: row.get(7)?,
        idempotency_key: row.get(8)?,
        created_at: from_millis(row.get(9)?),
    })
}

fn topic_from_row(row: &Row<'_>) -> rusqlite::Result<Topic> {
    Ok(Topic {
        name: TopicId::new(row.get::<_, String>(0)?),
        kind: parse_column(1, row.get(1)?, TopicKind::parse)?,
        retention_secs: row.get::<_, Option<i64>>(2)?.map(|s| s as u64),
        last_offset: row.get::<_, i64>(3)? as LogOffset,
        created_at: from_millis(row.get(4)?),
    })
}

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let metadata: String = row.get(4)?;
    Ok(Agent {
        name: AgentId::new(row.get::<_, String>(0)?),
        program: row.get(1)?,
        model: row.get(2)?,
        session_id: row.get(3)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        registered_at: from_millis(row.get(5)?),
        last_seen_at: from_millis(row.get(6)?),
    })
}

// Agents

pub fn upsert_agent(conn: &Connection, profile: &AgentProfile, now: DateTime<Utc>) -> Result<Agent> {
    let metadata = serde_json::to_string(&profile.metadata)?;
    conn.execute(
        "INSERT INTO agents (name, program, model, session_id, metadata, registered_at, last_seen_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
         ON CONFLICT(name) DO UPDATE SET
             program = excluded.program,
             model = excluded.model,
             session_id = excluded.session_id,
             metadata = excluded.metadata,
             last_seen_at = excluded.last_seen_at",
        params![
            profile.name.as_str(),
            profile.program,
            profile.model,
            profile.session_id,
            metadata,
            to_millis(now),
        ],
    )?;

    let agent = conn.query_row(
        "SELECT name, program, model, session_id, metadata, registered_at, last_seen_at
         FROM agents WHERE name = ?1",
        params![profile.name.as_str()],
        agent_from_row,
    )?;
    Ok(agent)
}

pub fn get_agent(conn: &Connection, name: &AgentId) -> Result<Option<Agent>> {
    let agent = conn
        .query_row(
            "SELECT name, program, model, session_id, metadata, registered_at, last_seen_at
             FROM agents WHERE name = ?1",
            params![name.as_str()],
            agent_from_row,
        )
        .optional()?;
    Ok(agent)
}

pub fn list_agents(conn: &Connection) -> Result<Vec<Agent>> {
    let mut stmt = conn.prepare(
        "SELECT name, program, model, session_id, metadata, registered_at, last_seen_at
         FROM agents ORDER BY name",
    )?;
    let agents = stmt
        .query_map([], agent_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(agents)
}

// Topics

/// Insert a topic if absent and return the stored row
pub fn ensure_topic(
    conn: &Connection,
    name: &TopicId,
    kind: TopicKind,
    retention_secs: Option<u64>,
    now: DateTime<Utc>,
) -> Result<Topic> {
    conn.execute(
        "INSERT OR IGNORE INTO topics (name, kind, retention_secs, last_offset, created_at)
         VALUES (?1, ?2, ?3, 0, ?4)",
        params![
            name.as_str(),
            kind.as_str(),
            retention_secs.map(|s| s as i64),
            to_millis(now),
        ],
    )?;

    let topic = conn.query_row(
        "SELECT name, kind, retention_secs, last_offset, created_at FROM topics WHERE name = ?1",
        params![name.as_str()],
        topic_from_row,
    )?;
    Ok(topic)
}

pub fn get_topic(conn: &Connection, name: &TopicId) -> Result<Option<Topic>> {
    let topic = conn
        .query_row(
            "SELECT name, kind, retention_secs, last_offset, created_at FROM topics WHERE name = ?1",
            params![name.as_str()],
            topic_from_row,
        )
        .optional()?;
    Ok(topic)
}

pub fn list_topics(conn: &Connection) -> Result<Vec<Topic>> {
    let mut stmt = conn.prepare(
        "SELECT name, kind, retention_secs, last_offset, created_at FROM topics ORDER BY name",
    )?;
    let topics = stmt
        .query_map([], topic_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(topics)
}

// Subscriptions

/// Returns true when the subscription was created by this call
pub fn insert_subscription(
    conn: &Connection,
    agent: &AgentId,
    topic: &TopicId,
    now: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO subscriptions (agent, topic, created_at) VALUES (?1, ?2, ?3)",
        params![agent.as_str(), topic.as_str(), to_millis(now)],
    )?;
    Ok(changed == 1)
}

/// Returns true when a subscription was removed
pub fn delete_subscription(conn: &Connection, agent: &AgentId, topic: &TopicId) -> Result<bool> {
    let changed = conn.execute(
        "DELETE FROM subscriptions WHERE agent = ?1 AND topic = ?2",
        params![agent.as_str(), topic.as_str()],
    )?;
    Ok(changed == 1)
}

pub fn list_subscriptions(conn: &Connection) -> Result<Vec<(AgentId, TopicId)>> {
    let mut stmt = conn.prepare("SELECT agent, topic FROM subscriptions ORDER BY topic, agent")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                AgentId::new(row.get::<_, String>(0)?),
                TopicId::new(row.get::<_, String>(1)?),
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn subscriptions_for_agent(conn: &Connection, agent: &AgentId) -> Result<Vec<TopicId>> {
    let mut stmt = conn.prepare("SELECT topic FROM subscriptions WHERE agent = ?1 ORDER BY topic")?;
    let rows = stmt
        .query_map(params![agent.as_str()], |row| {
            Ok(TopicId::new(row.get::<_, String>(0)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// Messages

pub fn find_message_by_key(conn: &Connection, key: &str) -> Result<Option<(Message, Vec<AgentId>)>> {
    let message = conn
        .query_row(
            &format!(
                "SELECT {} FROM messages m WHERE m.idempotency_key = ?1",
                MESSAGE_COLUMNS
            ),
            params![key],
            message_from_row,
        )
        .optional()?;

    match message {
        Some(message) => {
            let recipients = message_recipients(conn, &message.id)?;
            Ok(Some((message, recipients)))
        }
        None => Ok(None),
    }
}

pub fn get_message(conn: &Connection, id: &MessageId) -> Result<Option<Message>> {
    let message = conn
        .query_row(
            &format!("SELECT {} FROM messages m WHERE m.id = ?1", MESSAGE_COLUMNS),
            params![id.to_string()],
            message_from_row,
        )
        .optional()?;
    Ok(message)
}

pub fn message_recipients(conn: &Connection, id: &MessageId) -> Result<Vec<AgentId>> {
    let mut stmt = conn.prepare(
        "SELECT agent FROM message_recipients WHERE message_id = ?1 ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map(params![id.to_string()], |row| {
            Ok(AgentId::new(row.get::<_, String>(0)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Next offset for a topic. Call inside the publishing write transaction.
pub fn next_offset(conn: &Connection, topic: &TopicId) -> Result<LogOffset> {
    let last: i64 = conn.query_row(
        "SELECT last_offset FROM topics WHERE name = ?1",
        params![topic.as_str()],
        |row| row.get(0),
    )?;
    Ok(last as LogOffset + 1)
}

pub fn topic_subscribers(conn: &Connection, topic: &TopicId) -> Result<Vec<AgentId>> {
    let mut stmt = conn.prepare("SELECT agent FROM subscriptions WHERE topic = ?1 ORDER BY agent")?;
    let rows = stmt
        .query_map(params![topic.as_str()], |row| {
            Ok(AgentId::new(row.get::<_, String>(0)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Append a message with its recipient rows and raise the topic's high-water
/// offset. The offset must come from [`next_offset`] in the same transaction.
pub fn append_message(conn: &Connection, message: &Message, recipients: &[AgentId]) -> Result<()> {
    conn.execute(
        "UPDATE topics SET last_offset = ?2 WHERE name = ?1",
        params![message.topic.as_str(), message.offset as i64],
    )?;

    conn.execute(
        "INSERT INTO messages (id, topic, log_offset, sender, thread_id, priority, subject, body,
                               idempotency_key, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            message.id.to_string(),
            message.topic.as_str(),
            message.offset as i64,
            message.sender.as_str(),
            message.thread_id,
            message.priority.as_str(),
            message.subject,
            message.body,
            message.idempotency_key,
            to_millis(message.created_at),
        ],
    )?;

    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO message_recipients (message_id, agent, state, updated_at)
         VALUES (?1, ?2, 'unread', ?3)",
    )?;
    for recipient in recipients {
        stmt.execute(params![
            message.id.to_string(),
            recipient.as_str(),
            to_millis(message.created_at),
        ])?;
    }
    Ok(())
}

/// One page of a topic log with `after < offset <= upto`, ascending.
///
/// With `recipient` set, only messages addressed to that agent are returned.
pub fn replay_page(
    conn: &Connection,
    topic: &TopicId,
    recipient: Option<&AgentId>,
    after: LogOffset,
    upto: LogOffset,
    limit: usize,
) -> Result<Vec<Message>> {
    let messages = match recipient {
        Some(agent) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages m
                 JOIN message_recipients r ON r.message_id = m.id AND r.agent = ?2
                 WHERE m.topic = ?1 AND m.log_offset > ?3 AND m.log_offset <= ?4
                 ORDER BY m.log_offset LIMIT ?5",
                MESSAGE_COLUMNS
            ))?;
            let rows = stmt
                .query_map(
                    params![
                        topic.as_str(),
                        agent.as_str(),
                        after as i64,
                        upto as i64,
                        limit as i64
                    ],
                    message_from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages m
                 WHERE m.topic = ?1 AND m.log_offset > ?2 AND m.log_offset <= ?3
                 ORDER BY m.log_offset LIMIT ?4",
                MESSAGE_COLUMNS
            ))?;
            let rows = stmt
                .query_map(
                    params![topic.as_str(), after as i64, upto as i64, limit as i64],
                    message_from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
    };
    Ok(messages)
}

/// Delete messages older than their topic's retention window
/// Delete messages past their topic's retention window.
///
/// `only` limits pruning to one topic; otherwise every topic with a
/// retention window is pruned except those in `skip`.
pub fn prune_expired_messages(
    conn: &Connection,
    only: Option<&TopicId>,
    skip: &[TopicId],
    now: DateTime<Utc>,
) -> Result<usize> {
    let mut stmt = conn.prepare("SELECT name FROM topics WHERE retention_secs IS NOT NULL")?;
    let topics = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    let now_ms = to_millis(now);
    let filter = "SELECT m.id FROM messages m JOIN topics t ON t.name = m.topic
                  WHERE m.topic = ?2
                    AND m.created_at < ?1 - t.retention_secs * 1000";

    let mut removed = 0;
    for name in topics.into_iter().map(TopicId::new) {
        let owned = match only {
            Some(scope) => *scope == name,
            None => !skip.contains(&name),
        };
        if !owned {
            continue;
        }

        let topic = name.as_str();
        conn.execute(
            &format!("DELETE FROM message_recipients WHERE message_id IN ({})", filter),
            params![now_ms, topic],
        )?;
        conn.execute(
            &format!("DELETE FROM messages_fts WHERE message_id IN ({})", filter),
            params![now_ms, topic],
        )?;
        removed += conn.execute(
            &format!("DELETE FROM messages WHERE id IN ({})", filter),
            params![now_ms, topic],
        )?;
    }
    Ok(removed)
}

// Consumer offsets

pub fn consumer_offset(conn: &Connection, agent: &AgentId, topic: &TopicId) -> Result<LogOffset> {
    let offset: Option<i64> = conn
        .query_row(
            "SELECT last_offset FROM consumer_offsets WHERE agent = ?1 AND topic = ?2",
            params![agent.as_str(), topic.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(offset.unwrap_or(0) as LogOffset)
}

/// Move a consumer offset forward; lower values leave it unchanged.
/// Returns the stored offset afterwards.
pub fn advance_consumer_offset(
    conn: &Connection,
    agent: &AgentId,
    topic: &TopicId,
    offset: LogOffset,
    now: DateTime<Utc>,
) -> Result<LogOffset> {
    conn.execute(
        "INSERT INTO consumer_offsets (agent, topic, last_offset, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(agent, topic) DO UPDATE SET
             last_offset = excluded.last_offset,
             updated_at = excluded.updated_at
         WHERE excluded.last_offset > consumer_offsets.last_offset",
        params![agent.as_str(), topic.as_str(), offset as i64, to_millis(now)],
    )?;
    consumer_offset(conn, agent, topic)
}

// Recipient state

pub fn set_recipient_state(
    conn: &Connection,
    message: &MessageId,
    agent: &AgentId,
    state: RecipientState,
    now: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE message_recipients
         SET state = ?3,
             read_at = CASE WHEN ?3 != 'unread' AND read_at IS NULL THEN ?4 ELSE read_at END,
             updated_at = ?4
         WHERE message_id = ?1 AND agent = ?2",
        params![message.to_string(), agent.as_str(), state.as_str(), to_millis(now)],
    )?;
    Ok(changed == 1)
}

pub fn acknowledge(
    conn: &Connection,
    message: &MessageId,
    agent: &AgentId,
    now: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE message_recipients
         SET acked_at = COALESCE(acked_at, ?3), updated_at = ?3
         WHERE message_id = ?1 AND agent = ?2",
        params![message.to_string(), agent.as_str(), to_millis(now)],
    )?;
    Ok(changed == 1)
}

pub fn inbox(conn: &Connection, agent: &AgentId, filter: &InboxFilter) -> Result<Vec<InboxEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {}, r.state, r.read_at, r.acked_at
         FROM message_recipients r JOIN messages m ON m.id = r.message_id
         WHERE r.agent = ?1
           AND (?2 IS NULL OR r.state = ?2)
           AND (?3 = 0 OR r.acked_at IS NULL)
         ORDER BY m.created_at DESC, m.log_offset DESC
         LIMIT ?4",
        MESSAGE_COLUMNS
    ))?;

    let entries = stmt
        .query_map(
            params![
                agent.as_str(),
                filter.state.map(|s| s.as_str()),
                filter.unacked_only as i64,
                filter.limit as i64,
            ],
            |row| {
                Ok(InboxEntry {
                    message: message_from_row(row)?,
                    state: parse_column(10, row.get(10)?, RecipientState::parse)?,
                    read_at: opt_from_millis(row.get(11)?),
                    acked_at: opt_from_millis(row.get(12)?),
                })
            },
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

// Search index

pub fn index_message(conn: &Connection, message: &Message) -> Result<()> {
    conn.execute(
        "INSERT INTO messages_fts (subject, body, message_id) VALUES (?1, ?2, ?3)",
        params![message.subject, message.body, message.id.to_string()],
    )?;
    Ok(())
}

pub fn search_messages(conn: &Connection, query: &str, limit: usize) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM messages_fts f JOIN messages m ON m.id = f.message_id
         WHERE messages_fts MATCH ?1
         ORDER BY rank LIMIT ?2",
        MESSAGE_COLUMNS
    ))?;
    let messages = stmt
        .query_map(params![query, limit as i64], message_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;
    use tempfile::TempDir;

    fn old_message(conn: &Connection, topic: &TopicId, now: DateTime<Utc>) -> Result<()> {
        let message = Message {
            id: MessageId::new(),
            topic: topic.clone(),
            offset: next_offset(conn, topic)?,
            sender: AgentId::new("alice"),
            thread_id: None,
            priority: Priority::Normal,
            subject: "stale".to_string(),
            body: String::new(),
            idempotency_key: None,
            created_at: now - chrono::Duration::hours(1),
        };
        append_message(conn, &message, &[AgentId::new("bob")])
    }

    #[tokio::test]
    async fn test_pruning_stays_within_owned_topics() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open_path(temp_dir.path().join("hermes.db"))
            .await
            .unwrap();
        let now = Utc::now();
        let (shared, hot) = (TopicId::new("shared"), TopicId::new("hot"));

        let (s, h) = (shared.clone(), hot.clone());
        store
            .write(move |conn| {
                for topic in [&s, &h] {
                    ensure_topic(conn, topic, TopicKind::Broadcast, Some(60), now)?;
                    old_message(conn, topic, now)?;
                }
                Ok(())
            })
            .await
            .unwrap();

        // The default broker leaves the hot topic to its own broker
        let skip = vec![hot.clone()];
        let removed = store
            .write(move |conn| prune_expired_messages(conn, None, &skip, now))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let h = hot.clone();
        let left = store
            .read(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM messages WHERE topic = ?1",
                    params![h.as_str()],
                    |row| row.get::<_, i64>(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(left, 1);

        let scope = hot.clone();
        let removed = store
            .write(move |conn| prune_expired_messages(conn, Some(&scope), &[], now))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        // Offsets survive pruning
        let last = store
            .read(move |conn| next_offset(conn, &hot))
            .await
            .unwrap();
        assert_eq!(last, 2);
    }
}
