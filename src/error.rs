//! Error taxonomy for the worker.
//!
//! Each component owns a leaf `thiserror` enum; handlers compose these into
//! `anyhow::Error` at their boundary, matching the rest of the call chain.

use thiserror::Error;

/// SQLSTATEs the DB client treats as transient and retries.
pub const SQLSTATE_ADMIN_SHUTDOWN: &str = "57P01";
pub const SQLSTATE_CRASH_SHUTDOWN: &str = "57P02";
pub const SQLSTATE_CANNOT_CONNECT_NOW: &str = "57P03";
pub const SQLSTATE_QUERY_CANCELED: &str = "57014";

/// Errors raised by the DB client.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("not connected")]
    NotConnected,

    #[error("connection lost while a transaction was open")]
    TransactionAborted,

    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("retry budget ({budget}) exhausted, last error: {last}")]
    RetryBudgetExhausted { budget: u32, last: sqlx::Error },

    #[error("reconnect failed: {0}")]
    Reconnect(#[source] sqlx::Error),
}

impl DbError {
    /// Classify a `sqlx::Error` as transient (admin-terminated / admin-cancelled)
    /// per spec section 7's TransientDB class.
    pub fn is_transient(err: &sqlx::Error) -> bool {
        let Some(db_err) = err.as_database_error() else {
            return false;
        };
        is_transient_sqlstate(db_err.code().as_deref())
    }
}

/// The SQLSTATE classification itself, split out from [`DbError::is_transient`]
/// so it can be unit-tested against bare codes without fabricating a
/// `sqlx::Error::Database` (sqlx only constructs those from a live wire
/// response).
fn is_transient_sqlstate(code: Option<&str>) -> bool {
    matches!(
        code,
        Some(SQLSTATE_ADMIN_SHUTDOWN)
            | Some(SQLSTATE_CRASH_SHUTDOWN)
            | Some(SQLSTATE_CANNOT_CONNECT_NOW)
            | Some(SQLSTATE_QUERY_CANCELED)
    )
}


/// Errors raised while building or finalising a templated query.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryBuilderError {
    #[error("bind_json root must be a JSON object, got: {0}")]
    NotAnObject(String),
}

/// Errors raised by the HTTP executor.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("unsupported HTTP method: {0}")]
    UnsupportedMethod(String),

    #[error("HTTP client unavailable")]
    ClientUnavailable,

    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("server responded with status {0}")]
    Status(reqwest::StatusCode),
}

/// Errors raised by the action dispatcher while deciding or running an action.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("action row has both `query` and `uri` populated")]
    ConflictingAction,

    #[error("action row has neither `query` nor `uri` populated")]
    EmptyAction,

    #[error(transparent)]
    Query(#[from] QueryBuilderError),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Db(#[from] DbError),
}

/// Top-level classification used by the Supervisor to decide exit behaviour,
/// matching the taxonomy in spec section 7.
#[derive(Debug)]
pub enum WorkerError {
    Transient(anyhow::Error),
    HandlerFail(anyhow::Error),
    Fatal(anyhow::Error),
    Shutdown,
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::Transient(e) => write!(f, "transient: {e}"),
            WorkerError::HandlerFail(e) => write!(f, "handler failed: {e}"),
            WorkerError::Fatal(e) => write!(f, "fatal: {e}"),
            WorkerError::Shutdown => write!(f, "shutdown"),
        }
    }
}

impl std::error::Error for WorkerError {}
