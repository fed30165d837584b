//! DB Pool: one Postgres pool per owning OS process, with fork safety and bounded retry
//! (§4.2).
//!
//! `original_source/apps/api-services/libs/storage/postgres.py` pins down the retry shape:
//! pool-exhaustion backs off starting at 0.5s with a ×1.5 multiplier, "too many connections"
//! backs off starting at 0.5s with a ×2 multiplier, both capped at three attempts; any other
//! `OperationalError` is not retried. Dictionary-cursor semantics are reproduced by
//! [`DbPool::query_map`], which collects each row into a `HashMap<String, serde_json::Value>`
//! keyed by column name rather than a typed struct.

use std::collections::HashMap;
use std::time::Duration;

use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo};
use tokio::sync::RwLock;

use crate::error::PoolError;

const DEFAULT_MIN_CONNECTIONS: u32 = 1;
const DEFAULT_MAX_CONNECTIONS: u32 = 2;
const MAX_RETRIES: u32 = 3;
const EXHAUSTION_BASE_BACKOFF: Duration = Duration::from_millis(500);
const EXHAUSTION_MULTIPLIER: f64 = 1.5;
const TOO_MANY_CONNECTIONS_BASE_BACKOFF: Duration = Duration::from_millis(500);
const TOO_MANY_CONNECTIONS_MULTIPLIER: f64 = 2.0;

struct OwnedPool {
    pid: u32,
    pool: sqlx::PgPool,
}

/// A lazily-created connection pool scoped to the process that first used it.
///
/// Accessing the pool from a different process id (e.g. after a `fork()` under a prefork
/// server) transparently drops the inherited pool and builds a fresh one, rather than
/// reusing connections that belong to the parent process.
pub struct DbPool {
    database_url: String,
    min_connections: u32,
    max_connections: u32,
    inner: RwLock<Option<OwnedPool>>,
}

impl DbPool {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self::with_limits(database_url, DEFAULT_MIN_CONNECTIONS, DEFAULT_MAX_CONNECTIONS)
    }

    pub fn with_limits(database_url: impl Into<String>, min_connections: u32, max_connections: u32) -> Self {
        Self {
            database_url: database_url.into(),
            min_connections,
            max_connections,
            inner: RwLock::new(None),
        }
    }

    /// Returns the pool owned by the current process, (re)creating it if the cached pool
    /// belongs to a different pid or hasn't been built yet.
    async fn pool(&self) -> Result<sqlx::PgPool, PoolError> {
        let current_pid = std::process::id();
        {
            let guard = self.inner.read().await;
            if let Some(owned) = guard.as_ref() {
                if owned.pid == current_pid {
                    return Ok(owned.pool.clone());
                }
            }
        }

        let mut guard = self.inner.write().await;
        if let Some(owned) = guard.as_ref() {
            if owned.pid == current_pid {
                return Ok(owned.pool.clone());
            }
        }

        let pool = PgPoolOptions::new()
            .min_connections(self.min_connections)
            .max_connections(self.max_connections)
            .connect(&self.database_url)
            .await
            .map_err(|e| PoolError::Other(e.to_string()))?;

        *guard = Some(OwnedPool {
            pid: current_pid,
            pool: pool.clone(),
        });
        Ok(pool)
    }

    /// Acquires a connection with bounded exponential backoff on pool-exhaustion and
    /// "too many connections" failures, then hands it to `op`. Any other error surfaces
    /// immediately without retrying.
    pub async fn with_connection<T, F, Fut>(&self, op: F) -> Result<T, PoolError>
    where
        F: Fn(sqlx::pool::PoolConnection<sqlx::Postgres>) -> Fut,
        Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        let pool = self.pool().await?;
        let mut exhaustion_attempts = 0u32;
        let mut too_many_attempts = 0u32;

        loop {
            match pool.acquire().await {
                Ok(conn) => return op(conn).await.map_err(|e| PoolError::Other(e.to_string())),
                Err(sqlx::Error::PoolTimedOut) => {
                    exhaustion_attempts += 1;
                    if exhaustion_attempts > MAX_RETRIES {
                        return Err(PoolError::Exhausted);
                    }
                    let delay = backoff_delay(
                        EXHAUSTION_BASE_BACKOFF,
                        EXHAUSTION_MULTIPLIER,
                        exhaustion_attempts - 1,
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if is_too_many_connections(&e) => {
                    too_many_attempts += 1;
                    if too_many_attempts > MAX_RETRIES {
                        return Err(PoolError::TooManyConnections);
                    }
                    let delay = backoff_delay(
                        TOO_MANY_CONNECTIONS_BASE_BACKOFF,
                        TOO_MANY_CONNECTIONS_MULTIPLIER,
                        too_many_attempts - 1,
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(PoolError::Other(e.to_string())),
            }
        }
    }

    /// Runs `sql` and collects every row into a column-name → JSON value map, reproducing
    /// the source's dictionary-cursor semantics.
    pub async fn query_map(&self, sql: &str) -> Result<Vec<HashMap<String, serde_json::Value>>, PoolError> {
        self.with_connection(|mut conn| async move {
            let rows = sqlx::query(sql).fetch_all(&mut *conn).await?;
            Ok(rows.iter().map(row_to_map).collect())
        })
        .await
    }

    /// Drops the owned pool, closing every connection. Intended for graceful process
    /// shutdown (§4.2: "on process shutdown all connections are closed").
    pub async fn close(&self) {
        let mut guard = self.inner.write().await;
        if let Some(owned) = guard.take() {
            owned.pool.close().await;
        }
    }
}

fn backoff_delay(base: Duration, multiplier: f64, attempt_index: u32) -> Duration {
    base.mul_f64(multiplier.powi(attempt_index as i32))
}

fn is_too_many_connections(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        // Postgres SQLSTATE 53300 is "too_many_connections".
        if db_err.code().as_deref() == Some("53300") {
            return true;
        }
        return db_err.message().to_lowercase().contains("too many connections");
    }
    false
}

fn row_to_map(row: &PgRow) -> HashMap<String, serde_json::Value> {
    let mut map = HashMap::with_capacity(row.columns().len());
    for column in row.columns() {
        let name = column.name().to_string();
        let value = decode_column(row, column);
        map.insert(name, value);
    }
    map
}

fn decode_column(row: &PgRow, column: &sqlx::postgres::PgColumn) -> serde_json::Value {
    let idx = column.ordinal();
    match column.type_info().name() {
        "BOOL" => row
            .try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(serde_json::Value::Bool)
            .unwrap_or(serde_json::Value::Null),
        "INT2" | "INT4" | "INT8" => row
            .try_get::<Option<i64>, _>(idx)
            .ok()
            .flatten()
            .map(|v| serde_json::Value::Number(v.into()))
            .unwrap_or(serde_json::Value::Null),
        "FLOAT4" | "FLOAT8" | "NUMERIC" => row
            .try_get::<Option<f64>, _>(idx)
            .ok()
            .flatten()
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(idx)
            .ok()
            .flatten()
            .unwrap_or(serde_json::Value::Null),
        "TIMESTAMPTZ" | "TIMESTAMP" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| serde_json::Value::String(v.to_rfc3339()))
            .unwrap_or(serde_json::Value::Null),
        _ => row
            .try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(serde_json::Value::String)
            .unwrap_or(serde_json::Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_backoff_grows_by_1_5x_per_attempt() {
        assert_eq!(backoff_delay(EXHAUSTION_BASE_BACKOFF, EXHAUSTION_MULTIPLIER, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(EXHAUSTION_BASE_BACKOFF, EXHAUSTION_MULTIPLIER, 1), Duration::from_millis(750));
        assert_eq!(backoff_delay(EXHAUSTION_BASE_BACKOFF, EXHAUSTION_MULTIPLIER, 2), Duration::from_millis(1125));
    }

    #[test]
    fn too_many_connections_backoff_doubles_per_attempt() {
        assert_eq!(
            backoff_delay(TOO_MANY_CONNECTIONS_BASE_BACKOFF, TOO_MANY_CONNECTIONS_MULTIPLIER, 0),
            Duration::from_millis(500)
        );
        assert_eq!(
            backoff_delay(TOO_MANY_CONNECTIONS_BASE_BACKOFF, TOO_MANY_CONNECTIONS_MULTIPLIER, 2),
            Duration::from_millis(2000)
        );
    }
}
