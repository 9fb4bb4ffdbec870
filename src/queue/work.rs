//! Work Queue Handler (spec section 4.6).
//!
//! Dequeues one work row joined with its action descriptor under
//! `FOR UPDATE SKIP LOCKED`, rewrites the `__BASE_URL__` token in the
//! descriptor's URI, dispatches the action, deletes the row, and commits.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::Row;
use tracing::{error, warn};

use crate::config::WorkerConfig;
use crate::db::{column_text, execute_in_tx, DbClient};
use crate::http_executor::HttpExecutor;
use crate::notify::QueueHandler;
use crate::query::QueryBuilder;
use crate::queue::action::{ActionContext, ActionDispatcher, ActionKind};

struct WorkRow {
    parameters: Option<Value>,
    uid: Option<String>,
    recorded: Option<String>,
    transaction_label: Option<String>,
    action: Option<String>,
    session_values: Option<Value>,
    ctid: Option<String>,
    static_parameters: Option<Value>,
    action_kind: ActionKind,
}

/// Joins the work row with its action descriptor, per spec section 4.6; the
/// `__BASE_URL__` token in `uri` is rewritten here, in SQL, rather than in
/// Rust, because the fallback chain (`session_values.base_url` then the
/// worker-configured default) is cheapest to express with `COALESCE`.
const DEQUEUE_WORK: &str = "
WITH claimed AS (
    SELECT ctid FROM work_queue
    ORDER BY recorded DESC
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
SELECT
    w.parameters,
    w.uid::text AS uid,
    w.recorded::text AS recorded,
    w.transaction_label,
    w.action::text AS action,
    w.session_values,
    w.ctid::text AS ctid,
    a.query,
    replace(
        a.uri,
        '__BASE_URL__',
        COALESCE(w.session_values ->> 'base_url', $1, '')
    ) AS uri,
    a.method,
    a.use_ssl,
    a.static_parameters
FROM work_queue w
JOIN claimed c ON w.ctid = c.ctid
JOIN work_queue_action a ON a.action = w.action";

const DELETE_WORK: &str = "
DELETE FROM work_queue
WHERE uid IS NOT DISTINCT FROM ?uid?
  AND recorded = ?recorded?::timestamptz
  AND transaction_label IS NOT DISTINCT FROM ?transaction_label?
  AND action = ?action?
  AND session_values IS NOT DISTINCT FROM ?session_values?::jsonb
  AND ctid::text = ?ctid?";

pub struct WorkQueueHandler {
    db: DbClient,
    http: HttpExecutor,
    config: WorkerConfig,
    audit_extension_available: bool,
}

impl WorkQueueHandler {
    pub fn new(
        db: DbClient,
        http: HttpExecutor,
        config: WorkerConfig,
        audit_extension_available: bool,
    ) -> Self {
        Self {
            db,
            http,
            config,
            audit_extension_available,
        }
    }

    /// The `DEQUEUE_WORK` query has one positional `$1` (the default base
    /// URL) ahead of the `QueryBuilder`'s own placeholders, so it is run
    /// directly through `sqlx` rather than through a `FinalizedQuery`.
    async fn dequeue<'tx>(
        &self,
        tx: &mut sqlx::Transaction<'tx, sqlx::Postgres>,
    ) -> Result<Option<WorkRow>> {
        let row = sqlx::query(DEQUEUE_WORK)
            .bind(&self.config.default_base_url)
            .fetch_optional(&mut **tx)
            .await
            .context("dequeue work row")?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(WorkRow {
            parameters: row.try_get::<Option<Value>, _>("parameters").ok().flatten(),
            uid: column_text(&row, "uid"),
            recorded: column_text(&row, "recorded"),
            transaction_label: column_text(&row, "transaction_label"),
            action: column_text(&row, "action"),
            session_values: row
                .try_get::<Option<Value>, _>("session_values")
                .ok()
                .flatten(),
            ctid: column_text(&row, "ctid"),
            static_parameters: row
                .try_get::<Option<Value>, _>("static_parameters")
                .ok()
                .flatten(),
            action_kind: ActionKind::decode(&row)?,
        }))
    }

    async fn run(&mut self) -> Result<bool> {
        let mut tx = self.db.begin().await.context("begin work transaction")?;

        let Some(work) = self.dequeue(&mut tx).await? else {
            tx.rollback().await.ok();
            return Ok(false);
        };

        let ctx = ActionContext {
            uid: work.uid.clone(),
            recorded: work.recorded.clone(),
            transaction_label: work.transaction_label.clone(),
            parameters: work.parameters.clone(),
            static_parameters: work.static_parameters.clone(),
            session_values: work.session_values.clone(),
        };

        let dispatcher = ActionDispatcher {
            set_uid_function: &self.config.set_uid_function,
            audit_extension_available: self.audit_extension_available,
            audit_label_function: &self.config.audit_label_function,
            http: &self.http,
        };
        dispatcher
            .dispatch(&mut tx, &work.action_kind, &ctx)
            .await
            .context("dispatch action")?;

        let session_text = work.session_values.as_ref().map(|v| v.to_string());
        let delete = QueryBuilder::new(DELETE_WORK)
            .bind("uid", work.uid)
            .bind("recorded", work.recorded)
            .bind("transaction_label", work.transaction_label)
            .bind("action", work.action)
            .bind("session_values", session_text)
            .bind("ctid", work.ctid)
            .finalize();
        execute_in_tx(&mut tx, &delete)
            .await
            .context("delete work row")?;

        tx.commit().await.context("commit work transaction")?;
        Ok(true)
    }
}

#[async_trait::async_trait]
impl QueueHandler for WorkQueueHandler {
    async fn handle_once(&mut self) -> Result<u32> {
        match self.run().await {
            Ok(true) => Ok(1),
            Ok(false) => {
                tracing::debug!("work queue empty");
                Ok(0)
            }
            Err(e) => {
                error!(error = %e, "work queue handler failed");
                warn!("rolling back work transaction");
                Ok(0)
            }
        }
    }
}
