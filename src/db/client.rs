//! DB Client — single-connection wrapper with reconnect-with-backoff and
//! transient-error retry (spec section 4.1).

use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgRow};
use sqlx::{Connection, Executor, PgConnection, Row};
use tracing::{debug, warn};

use crate::error::DbError;
use crate::query::FinalizedQuery;

/// Retry budget for transient (admin-terminated / admin-cancelled) faults,
/// and the reconnect-with-backoff bounds for connection loss outside a
/// transaction. Mirrors spec section 4.1 / 9's "bounded exponential backoff
/// with jitter, capped at a sane maximum" note.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with full jitter, capped at `max_delay`.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis().saturating_mul(1u128 << attempt.min(16));
        let capped = exp.min(self.max_delay.as_millis());
        let jittered = (fastrand::u128(0..=capped.max(1))) as u64;
        Duration::from_millis(jittered)
    }
}

/// Owns the single, process-global connection to the database. Lazily
/// connects on first use; reconnects (outside a transaction) on connection
/// loss; retries query execution on transient SQLSTATEs up to the budget.
pub struct DbClient {
    options: PgConnectOptions,
    conn: Option<PgConnection>,
    retry: RetryPolicy,
}

impl DbClient {
    pub fn new(options: PgConnectOptions) -> Self {
        Self {
            options,
            conn: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Establish the connection if it isn't already up, through the same
    /// bounded-backoff budget as [`Self::reconnect`] — the initial lazy
    /// connect is just a reconnect from a blank slate.
    async fn ensure_connected(&mut self) -> Result<(), DbError> {
        if self.conn.is_some() {
            return Ok(());
        }
        self.reconnect().await
    }

    /// Reconnect with bounded exponential backoff. Only valid when no
    /// transaction is open; callers inside a transaction must treat
    /// connection loss as `DbError::TransactionAborted` instead.
    async fn reconnect(&mut self) -> Result<(), DbError> {
        self.conn = None;
        let mut last_err = None;
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry.backoff(attempt)).await;
            }
            match PgConnection::connect_with(&self.options).await {
                Ok(conn) => {
                    self.conn = Some(conn);
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(DbError::Reconnect(last_err.expect("loop ran at least once")))
    }

    pub fn connection_mut(&mut self) -> Result<&mut PgConnection, DbError> {
        self.conn.as_mut().ok_or(DbError::NotConnected)
    }

    /// Execute a finalized query outside of any transaction, retrying
    /// transient faults up to the configured budget and reconnecting on
    /// connection loss.
    pub async fn execute(&mut self, query: &FinalizedQuery) -> Result<Vec<PgRow>, DbError> {
        self.ensure_connected().await?;

        let mut last_err = None;
        for attempt in 0..=self.retry.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry.backoff(attempt)).await;
            }

            let conn = self.connection_mut()?;
            let mut q = sqlx::query(&query.sql);
            for bind in &query.binds {
                q = q.bind(bind.clone());
            }

            match q.fetch_all(conn).await {
                Ok(rows) => return Ok(rows),
                Err(sqlx::Error::Io(_)) => {
                    debug!("connection lost outside transaction, reconnecting");
                    self.reconnect().await?;
                    last_err = Some(sqlx::Error::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionAborted,
                        "connection lost",
                    )));
                }
                Err(e) if DbError::is_transient(&e) => {
                    warn!(attempt, error = %e, "transient fault, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(DbError::Query(e)),
            }
        }

        Err(DbError::RetryBudgetExhausted {
            budget: self.retry.max_attempts,
            last: last_err.expect("loop ran at least once"),
        })
    }

    /// Begin a transaction. The returned `Transaction` borrows the
    /// connection mutably, so the borrow checker prevents a second
    /// transaction from being opened concurrently on this client.
    ///
    /// Connection loss observed here is pre-transaction (nothing has been
    /// claimed or mutated yet), so unlike mid-transaction loss it is safe
    /// to recover from: one reconnect-with-backoff budget is spent before
    /// the `BEGIN` is retried once.
    pub async fn begin(&mut self) -> Result<sqlx::Transaction<'_, sqlx::Postgres>, DbError> {
        self.ensure_connected().await?;

        match self.try_begin().await {
            Ok(tx) => Ok(tx),
            Err(DbError::Query(sqlx::Error::Io(e))) => {
                warn!(error = %e, "connection lost before transaction, reconnecting");
                self.reconnect().await?;
                self.try_begin().await
            }
            Err(e) => Err(e),
        }
    }

    async fn try_begin(&mut self) -> Result<sqlx::Transaction<'_, sqlx::Postgres>, DbError> {
        let conn = self.connection_mut()?;
        conn.begin().await.map_err(DbError::Query)
    }

    /// `LISTEN "<channel>"`, issued once through this client before the
    /// notification loop switches to a dedicated `PgListener`. Routed
    /// through [`Self::execute`] so a transient fault or a connection
    /// dropped between startup and this call is retried/reconnected like
    /// any other pre-transaction query.
    pub async fn listen(&mut self, channel: &str) -> Result<(), DbError> {
        let stmt = format!("LISTEN \"{channel}\"");
        let query = FinalizedQuery {
            sql: stmt,
            binds: Vec::new(),
        };
        self.execute(&query).await?;
        Ok(())
    }

    /// `SELECT 1 FROM pg_extension WHERE extname = $1` probe, used by the
    /// Supervisor both for the required-extension fatal check and for the
    /// optional audit-extension presence flag.
    pub async fn extension_installed(&mut self, name: &str) -> Result<bool, DbError> {
        let query = FinalizedQuery {
            sql: "SELECT 1 FROM pg_extension WHERE extname = $1".to_string(),
            binds: vec![Some(name.to_string())],
        };
        let rows = self.execute(&query).await?;
        Ok(!rows.is_empty())
    }

    pub async fn close(mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.close().await;
        }
    }
}

/// Execute a finalized query against an open transaction. Unlike
/// [`DbClient::execute`], this never retries and never reconnects: per spec
/// section 4.1, connection loss inside a transaction is fatal to that
/// transaction only, surfaced as `DbError::TransactionAborted`.
pub async fn execute_in_tx<'a>(
    tx: &mut sqlx::Transaction<'a, sqlx::Postgres>,
    query: &FinalizedQuery,
) -> Result<Vec<PgRow>, DbError> {
    let mut q = sqlx::query(&query.sql);
    for bind in &query.binds {
        q = q.bind(bind.clone());
    }
    q.fetch_all(&mut **tx).await.map_err(|e| match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed => DbError::TransactionAborted,
        other => DbError::Query(other),
    })
}

/// Column access helpers matching the spec's "by name" + "is-null probe"
/// requirement, thin wrappers over `sqlx::Row`.
pub fn column_text(row: &PgRow, name: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(name).ok().flatten()
}

pub fn is_null(row: &PgRow, name: &str) -> bool {
    column_text(row, name).is_none()
}
