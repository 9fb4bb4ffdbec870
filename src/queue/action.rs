//! Action Dispatcher (spec section 4.7) and the `ActionKind` tagged choice
//! that makes the "conflicting query/uri" state unrepresentable once a row
//! has been decoded (spec section 9, "Dynamic dispatch").

use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::warn;

use crate::db::{column_text, execute_in_tx};
use crate::error::{DbError, DispatchError};
use crate::http_executor::{HttpExecutor, HttpMethod};
use crate::query::QueryBuilder;
use crate::session;

/// An action row, decoded into exactly one shape. Resolves the spec's Open
/// Question 1 as **reject**: a row carrying both `query` and `uri` fails to
/// decode rather than silently preferring one (see SPEC_FULL.md's REDESIGN
/// FLAGS section).
#[derive(Debug, Clone)]
pub enum ActionKind {
    Query { sql: String },
    Http { uri: String, method: HttpMethod, use_ssl: bool },
}

impl ActionKind {
    pub fn decode(row: &PgRow) -> Result<Self, DispatchError> {
        let query = column_text(row, "query");
        let uri = column_text(row, "uri");

        match (query, uri) {
            (Some(_), Some(_)) => {
                warn!("action row has both query and uri populated, rejecting");
                Err(DispatchError::ConflictingAction)
            }
            (Some(sql), None) => Ok(ActionKind::Query { sql }),
            (None, Some(uri)) => {
                let method_raw = column_text(row, "method").unwrap_or_else(|| "GET".to_string());
                let method = HttpMethod::parse(&method_raw).map_err(DispatchError::Http)?;
                let use_ssl = row
                    .try_get::<bool, _>("use_ssl")
                    .unwrap_or(false);
                Ok(ActionKind::Http { uri, method, use_ssl })
            }
            (None, None) => Err(DispatchError::EmptyAction),
        }
    }
}

/// Inputs shared by both action shapes, carried through the row's work-item
/// context.
pub struct ActionContext {
    pub uid: Option<String>,
    pub recorded: Option<String>,
    pub transaction_label: Option<String>,
    pub parameters: Option<Value>,
    pub static_parameters: Option<Value>,
    pub session_values: Option<Value>,
}

pub struct ActionDispatcher<'a> {
    pub set_uid_function: &'a str,
    pub audit_extension_available: bool,
    pub audit_label_function: &'a str,
    pub http: &'a HttpExecutor,
}

impl<'a> ActionDispatcher<'a> {
    pub async fn dispatch<'tx>(
        &self,
        tx: &mut sqlx::Transaction<'tx, sqlx::Postgres>,
        action: &ActionKind,
        ctx: &ActionContext,
    ) -> Result<(), DispatchError> {
        match action {
            ActionKind::Query { sql } => self.dispatch_query(tx, sql, ctx).await,
            ActionKind::Http { uri, method, use_ssl } => {
                self.dispatch_http(uri, *method, *use_ssl, ctx).await
            }
        }
    }

    async fn dispatch_query<'tx>(
        &self,
        tx: &mut sqlx::Transaction<'tx, sqlx::Postgres>,
        sql: &str,
        ctx: &ActionContext,
    ) -> Result<(), DispatchError> {
        session::set_session(tx, ctx.session_values.as_ref()).await?;

        self.set_uid(tx, ctx).await?;

        let query = QueryBuilder::new(sql)
            .bind("uid", ctx.uid.clone())
            .bind("recorded", ctx.recorded.clone())
            .bind("transaction_label", ctx.transaction_label.clone())
            .bind_json_opt(ctx.parameters.as_ref(), "")?
            .bind_json_opt(ctx.static_parameters.as_ref(), "")?
            .bind_json_opt(ctx.session_values.as_ref(), "")?
            .finalize();

        execute_in_tx(tx, &query).await?;

        if self.audit_extension_available {
            self.label_transaction(tx, ctx.transaction_label.as_deref())
                .await?;
        }

        session::clear_session(tx, ctx.session_values.as_ref()).await?;
        Ok(())
    }

    async fn dispatch_http(
        &self,
        uri: &str,
        method: HttpMethod,
        use_ssl: bool,
        ctx: &ActionContext,
    ) -> Result<(), DispatchError> {
        self.http
            .call(
                uri,
                method,
                use_ssl,
                ctx.parameters.as_ref(),
                ctx.static_parameters.as_ref(),
                ctx.session_values.as_ref(),
            )
            .await
            .map_err(DispatchError::Http)?;
        Ok(())
    }

    /// Resolve the configured UID-setter function name and call it with
    /// `?uid?` bound, plus any additional placeholders filled from
    /// `session_values`.
    async fn set_uid<'tx>(
        &self,
        tx: &mut sqlx::Transaction<'tx, sqlx::Postgres>,
        ctx: &ActionContext,
    ) -> Result<(), DispatchError> {
        let template = format!("SELECT {}", self.set_uid_function);
        let query = QueryBuilder::new(template)
            .bind("uid", ctx.uid.clone())
            .bind_json_opt(ctx.session_values.as_ref(), "")?
            .finalize();
        execute_in_tx(tx, &query).await?;
        Ok(())
    }

    async fn label_transaction<'tx>(
        &self,
        tx: &mut sqlx::Transaction<'tx, sqlx::Postgres>,
        transaction_label: Option<&str>,
    ) -> Result<(), DbError> {
        let Some(label) = transaction_label else {
            return Ok(());
        };
        let template = format!("SELECT {}(?label?)", self.audit_label_function);
        let query = QueryBuilder::new(template)
            .bind("label", Some(label.to_string()))
            .finalize();
        execute_in_tx(tx, &query).await?;
        Ok(())
    }
}
