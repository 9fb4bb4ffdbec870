//! Session-Variable Manager (spec section 4.4).
//!
//! Sets and clears transaction-local database configuration keys from a JSON
//! object via `set_config($1, $2, true)` — the `sqlx`-idiomatic equivalent of
//! `SET LOCAL "<key>" = <value>` per key, scoped to the current transaction.

use serde_json::Value;

use crate::db::execute_in_tx;
use crate::error::DbError;
use crate::query::QueryBuilder;

const SET_CONFIG: &str = "SELECT set_config(?key?, ?value?, true)";

/// Apply every top-level key/value pair of `json` to the session. Tolerant
/// of `None`/`Value::Null`/an empty object (no-op).
pub async fn set_session<'a>(
    tx: &mut sqlx::Transaction<'a, sqlx::Postgres>,
    json: Option<&Value>,
) -> Result<(), DbError> {
    apply(tx, json).await
}

/// Reset every key in `json` back to its transaction-scoped default
/// (`NULL`), mirroring `set_session`'s key set.
pub async fn clear_session<'a>(
    tx: &mut sqlx::Transaction<'a, sqlx::Postgres>,
    json: Option<&Value>,
) -> Result<(), DbError> {
    let Some(Value::Object(map)) = json else {
        return Ok(());
    };
    for key in map.keys() {
        let query = QueryBuilder::new(SET_CONFIG)
            .bind("key", Some(key.clone()))
            .bind("value", None)
            .finalize();
        execute_in_tx(tx, &query).await?;
    }
    Ok(())
}

async fn apply<'a>(
    tx: &mut sqlx::Transaction<'a, sqlx::Postgres>,
    json: Option<&Value>,
) -> Result<(), DbError> {
    let Some(Value::Object(map)) = json else {
        return Ok(());
    };
    for (key, value) in map {
        let text = match value {
            Value::Null => None,
            Value::String(s) if s == "null" || s == "NULL" => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        };
        let query = QueryBuilder::new(SET_CONFIG)
            .bind("key", Some(key.clone()))
            .bind("value", text)
            .finalize();
        execute_in_tx(tx, &query).await?;
    }
    Ok(())
}
