//! End-to-end tests for the Work Queue Handler against a real Postgres
//! container: the query-action path (spec section 8 scenario 3's retry
//! shape is exercised at the unit level in `db/client.rs`; this covers the
//! dequeue -> dispatch -> delete happy path and the conflicting-action
//! rejection).

mod common;

use common::QueueTestHarness;
use queue_worker_core::config::{Cli, WorkerConfig};
use queue_worker_core::db::DbClient;
use queue_worker_core::http_executor::HttpExecutor;
use queue_worker_core::notify::QueueHandler;
use queue_worker_core::queue::WorkQueueHandler;
use serde_json::json;
use sqlx::Row;
use test_context::test_context;

fn test_config() -> WorkerConfig {
    let cli = Cli::parse_args(&["-E".to_string()]).expect("parse synthetic cli");
    let mut config = WorkerConfig::from_cli(&cli).expect("build worker config");
    config.default_base_url = "example.invalid".to_string();
    // No UID-setter function exists in the test schema; "1" is a harmless
    // no-op expression so `SELECT {set_uid_function}` stays valid SQL.
    config.set_uid_function = "1".to_string();
    config
}

#[test_context(QueueTestHarness)]
#[tokio::test]
async fn query_action_dequeues_dispatches_and_deletes(ctx: &QueueTestHarness) {
    sqlx::query("CREATE TABLE stamped_actions (label text, value text)")
        .execute(&ctx.pool)
        .await
        .unwrap();

    sqlx::query(
        "INSERT INTO work_queue_action (action, query, uri, static_parameters)
         VALUES (1, 'INSERT INTO stamped_actions (label, value) VALUES (?transaction_label?, ?x?)', NULL, $1)",
    )
    .bind(json!({"y": "2"}))
    .execute(&ctx.pool)
    .await
    .expect("insert action descriptor");

    sqlx::query(
        "INSERT INTO work_queue (parameters, uid, recorded, transaction_label, action, session_values)
         VALUES ($1, NULL, now(), 'label-a', 1, NULL)",
    )
    .bind(json!({"x": "1"}))
    .execute(&ctx.pool)
    .await
    .expect("insert work row");

    let db = DbClient::new(ctx.options.clone());
    let http = HttpExecutor::new("queue-worker-test/1.0").expect("build http executor");
    let mut handler = WorkQueueHandler::new(db, http, test_config(), false);

    let processed = handler.handle_once().await.expect("handle work row");
    assert_eq!(processed, 1);

    let remaining: i64 = sqlx::query("SELECT count(*) AS c FROM work_queue")
        .fetch_one(&ctx.pool)
        .await
        .unwrap()
        .get("c");
    assert_eq!(remaining, 0, "work row should be deleted after dispatch");

    let stamped = sqlx::query("SELECT label, value FROM stamped_actions")
        .fetch_one(&ctx.pool)
        .await
        .expect("action query should have run");
    let label: String = stamped.get("label");
    let value: String = stamped.get("value");
    assert_eq!(label, "label-a");
    assert_eq!(value, "1");
}

#[test_context(QueueTestHarness)]
#[tokio::test]
async fn spurious_wakeup_on_empty_work_queue_returns_zero(ctx: &QueueTestHarness) {
    let db = DbClient::new(ctx.options.clone());
    let http = HttpExecutor::new("queue-worker-test/1.0").expect("build http executor");
    let mut handler = WorkQueueHandler::new(db, http, test_config(), false);

    let processed = handler.handle_once().await.expect("handle empty work queue");
    assert_eq!(processed, 0);
}

#[test_context(QueueTestHarness)]
#[tokio::test]
async fn conflicting_action_fields_fail_the_row_without_crashing_the_loop(ctx: &QueueTestHarness) {
    sqlx::query(
        "INSERT INTO work_queue_action (action, query, uri)
         VALUES (1, 'SELECT 1', 'http://example.invalid/p')",
    )
    .execute(&ctx.pool)
    .await
    .expect("insert conflicting action descriptor");

    sqlx::query(
        "INSERT INTO work_queue (parameters, uid, recorded, transaction_label, action, session_values)
         VALUES (NULL, NULL, now(), NULL, 1, NULL)",
    )
    .execute(&ctx.pool)
    .await
    .expect("insert work row");

    let db = DbClient::new(ctx.options.clone());
    let http = HttpExecutor::new("queue-worker-test/1.0").expect("build http executor");
    let mut handler = WorkQueueHandler::new(db, http, test_config(), false);

    // The row fails to dispatch (conflicting query/uri), so the transaction
    // rolls back; the handler reports it via `Ok(0)`, per spec section 7's
    // HandlerFail policy ("rolls back ... returns 0 to the loop").
    let processed = handler
        .handle_once()
        .await
        .expect("handler itself must not error");
    assert_eq!(processed, 0);

    let remaining: i64 = sqlx::query("SELECT count(*) AS c FROM work_queue")
        .fetch_one(&ctx.pool)
        .await
        .unwrap()
        .get("c");
    assert_eq!(remaining, 1, "row is not deleted when dispatch fails");
}
