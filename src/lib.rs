//! Core library backing the `queue-worker` binary: a long-running external
//! queue worker that drains either an event queue or a work queue
//! installed as tables in PostgreSQL, one queue per process instance.

pub mod config;
pub mod db;
pub mod error;
pub mod http_executor;
pub mod logging;
pub mod notify;
pub mod query;
pub mod queue;
pub mod session;
pub mod supervisor;
