//! Storage layer for the Hermes coordination core
//!
//! A single SQLite database pooled through deadpool-sqlite. Each service
//! actor is the only writer of its own tables; readers go straight to the
//! pool. Query helpers live in one submodule per owning service.
//!
//! # Contention
//!
//! Writes run in an IMMEDIATE transaction. When SQLite reports busy or
//! locked the whole closure is re-run, up to `max_retries` extra attempts
//! with linear backoff, before `StorageBusy` is surfaced.

pub mod broker;
pub mod operations;
pub mod reviews;

use crate::config::StorageSettings;
use crate::error::{HermesError, Result};
use chrono::{DateTime, Utc};
use deadpool_sqlite::{Config, Pool, Runtime};
use rusqlite::{Connection, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const SCHEMA: &str = include_str!("schema.sql");

/// Bounded retry for busy/locked writes
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: Duration::from_millis(25),
        }
    }
}

/// Pooled handle to the coordination database
#[derive(Clone)]
pub struct Store {
    pool: Pool,
    path: PathBuf,
    retry: RetryPolicy,
    busy_timeout: Duration,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("retry", &self.retry)
            .finish()
    }
}

impl Store {
    /// Open (creating if needed) and migrate the database
    pub async fn open(settings: &StorageSettings) -> Result<Self> {
        Self::open_with(
            &settings.path,
            RetryPolicy {
                max_retries: settings.max_retries,
                backoff: Duration::from_millis(settings.retry_backoff_ms),
            },
            Duration::from_millis(settings.busy_timeout_ms),
        )
        .await
    }

    /// Open with default retry settings
    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path.as_ref(), RetryPolicy::default(), Duration::from_secs(1)).await
    }

    async fn open_with(path: &Path, retry: RetryPolicy, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let pool = Config::new(path).create_pool(Runtime::Tokio1).map_err(|e| {
            HermesError::Database(format!("Failed to create connection pool: {}", e))
        })?;

        let store = Self {
            pool,
            path: path.to_path_buf(),
            retry,
            busy_timeout,
        };
        store.migrate().await?;

        tracing::info!("Opened coordination store at {}", path.display());
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn migrate(&self) -> Result<()> {
        let conn = self.connection().await?;
        let busy_timeout = self.busy_timeout;
        conn.interact(move |conn| -> Result<()> {
            conn.busy_timeout(busy_timeout)?;
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            tracing::debug!("Journal mode: {}", mode);
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(|e| HermesError::Database(format!("Pool interaction failed: {}", e)))??;

        tracing::debug!("Schema applied");
        Ok(())
    }

    async fn connection(&self) -> Result<deadpool_sqlite::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| HermesError::Database(format!("Failed to get connection: {}", e)))
    }

    /// Run a read-only closure on a pooled connection
    pub async fn read<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.connection().await?;
        let busy_timeout = self.busy_timeout;
        conn.interact(move |conn| -> Result<T> {
            conn.busy_timeout(busy_timeout)?;
            f(conn)
        })
        .await
        .map_err(|e| HermesError::Database(format!("Pool interaction failed: {}", e)))?
    }

    /// Run a closure inside one IMMEDIATE transaction, retrying on contention
    pub async fn write<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&Connection) -> Result<T> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let mut attempt = 0;

        loop {
            let conn = self.connection().await?;
            let busy_timeout = self.busy_timeout;
            let body = f.clone();

            let result = conn
                .interact(move |conn| -> Result<T> {
                    conn.busy_timeout(busy_timeout)?;
                    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                    let value = body(&tx)?;
                    tx.commit()?;
                    Ok(value)
                })
                .await
                .map_err(|e| HermesError::Database(format!("Pool interaction failed: {}", e)))?;

            match result {
                Err(HermesError::StorageBusy(reason)) if attempt < self.retry.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        "Storage busy (attempt {}/{}): {}",
                        attempt,
                        self.retry.max_retries,
                        reason
                    );
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                }
                other => return other,
            }
        }
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub(crate) fn opt_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

/// Parse a stored enum column, reporting corruption as a conversion failure
pub(crate) fn parse_column<T>(
    idx: usize,
    value: String,
    parse: impl FnOnce(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    parse(&value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unexpected value '{}'", value).into(),
        )
    })
}

pub(crate) fn parse_uuid_column<T: From<uuid::Uuid>>(
    idx: usize,
    value: String,
) -> rusqlite::Result<T> {
    uuid::Uuid::parse_str(&value)
        .map(T::from)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}
