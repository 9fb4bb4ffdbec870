//! End-to-end tests for the Event Queue Handler against a real Postgres
//! container, covering spec section 8 scenarios 1 and 2.

mod common;

use common::QueueTestHarness;
use queue_worker_core::db::DbClient;
use queue_worker_core::notify::QueueHandler;
use queue_worker_core::queue::EventQueueHandler;
use serde_json::json;
use sqlx::Row;
use test_context::test_context;

#[test_context(QueueTestHarness)]
#[tokio::test]
async fn event_happy_path_expands_into_one_work_row(ctx: &QueueTestHarness) {
    sqlx::query(
        "INSERT INTO event_queue
            (event_table_work_item, uid, recorded, pk_value, op, action,
             transaction_label, work_item_query, execute_asynchronously, old, new, session_values)
         VALUES
            (1, NULL, now(), 7, 'U', 3, NULL,
             'SELECT ''?op?:'' || ?NEW.a? AS parameters', 'f', $1, $2, $3)",
    )
    .bind(json!({"a": "0"}))
    .bind(json!({"a": "1"}))
    .bind(json!({}))
    .execute(&ctx.pool)
    .await
    .expect("insert event row");

    let db = DbClient::new(ctx.options.clone());
    let mut handler = EventQueueHandler::new(db, "execute_asynchronously".to_string());

    let processed = handler.handle_once().await.expect("handle event row");
    assert_eq!(processed, 1);

    let remaining: i64 = sqlx::query("SELECT count(*) AS c FROM event_queue")
        .fetch_one(&ctx.pool)
        .await
        .unwrap()
        .get("c");
    assert_eq!(remaining, 0, "event row should be deleted after processing");

    let work_row = sqlx::query("SELECT parameters FROM work_queue")
        .fetch_one(&ctx.pool)
        .await
        .expect("one work row should have been inserted");
    let parameters: serde_json::Value = work_row.get("parameters");
    assert_eq!(parameters, json!("U:1"));
}

#[test_context(QueueTestHarness)]
#[tokio::test]
async fn spurious_wakeup_on_empty_queue_returns_zero_and_mutates_nothing(ctx: &QueueTestHarness) {
    let db = DbClient::new(ctx.options.clone());
    let mut handler = EventQueueHandler::new(db, "execute_asynchronously".to_string());

    let processed = handler.handle_once().await.expect("handle empty queue");
    assert_eq!(processed, 0);

    let work_rows: i64 = sqlx::query("SELECT count(*) AS c FROM work_queue")
        .fetch_one(&ctx.pool)
        .await
        .unwrap()
        .get("c");
    assert_eq!(work_rows, 0);
}

#[test_context(QueueTestHarness)]
#[tokio::test]
async fn two_event_rows_are_each_claimed_exactly_once(ctx: &QueueTestHarness) {
    for (id, pk) in [(1i32, 7i32), (2i32, 8i32)] {
        sqlx::query(
            "INSERT INTO event_queue
                (event_table_work_item, uid, recorded, pk_value, op, action,
                 transaction_label, work_item_query, execute_asynchronously, old, new, session_values)
             VALUES
                ($1, NULL, now() + ($1::text || ' seconds')::interval, $2, 'I', 1, NULL,
                 'SELECT ?pk_value?::text AS parameters', 'f', NULL, NULL, NULL)",
        )
        .bind(id)
        .bind(pk)
        .execute(&ctx.pool)
        .await
        .expect("insert event row");
    }

    let db = DbClient::new(ctx.options.clone());
    let mut handler = EventQueueHandler::new(db, "execute_asynchronously".to_string());

    assert_eq!(handler.handle_once().await.unwrap(), 1);
    assert_eq!(handler.handle_once().await.unwrap(), 1);
    assert_eq!(handler.handle_once().await.unwrap(), 0);

    let work_rows: i64 = sqlx::query("SELECT count(*) AS c FROM work_queue")
        .fetch_one(&ctx.pool)
        .await
        .unwrap()
        .get("c");
    assert_eq!(work_rows, 2);
}
