//! Query template engine.
//!
//! Substitutes `?name?` placeholders in arbitrary SQL with indexed positional
//! parameters (`$1`, `$2`, ...), flattens JSON objects into keyed bindings
//! with optional prefixes, and rewrites any placeholder left unbound to the
//! literal `NULL`.
//!
//! The residual-placeholder grammar is ported from the original C
//! extension's `_finalize_query` regex (`src/lib/query_helper.c`):
//! `[?](((OLD)|(NEW))[[:punct:]])?[[:alpha:]_]+[?]`.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use crate::error::QueryBuilderError;

/// Sentinel distinguishing an explicit SQL NULL bind from an empty string.
pub type Bind = Option<String>;

lazy_static! {
    static ref RESIDUAL_PLACEHOLDER: Regex =
        Regex::new(r"\?(?:(?:OLD|NEW)[[:punct:]])?[[:alpha:]_]+\?").expect("valid placeholder regex");
}

/// A query template under construction. Binding is append-only and
/// order-preserving: the first `bind` call that matches a name becomes `$1`,
/// the next distinct match becomes `$2`, and so on.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    template: String,
    binds: Vec<Bind>,
}

/// The result of [`QueryBuilder::finalize`]: an immutable SQL template with
/// only positional placeholders, plus its ordered bind list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedQuery {
    pub sql: String,
    pub binds: Vec<Bind>,
}

impl QueryBuilder {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            binds: Vec::new(),
        }
    }

    /// Replace every `?key?` occurrence with the next positional index and
    /// append `value` to the bind list. A no-op (no positional index is
    /// consumed) when `key` does not occur in the template.
    pub fn bind(mut self, key: &str, value: Bind) -> Self {
        let placeholder = format!("?{key}?");
        if !self.template.contains(&placeholder) {
            return self;
        }
        self.binds.push(value);
        let index = self.binds.len();
        let positional = format!("${index}");
        self.template = self.template.replace(&placeholder, &positional);
        self
    }

    /// Bind every top-level key/value pair of a JSON object, optionally
    /// prefixing each key (used for `NEW.`/`OLD.` row images). Nested
    /// objects/arrays are bound as their compact JSON text, unexpanded.
    /// `"null"`/`"NULL"` string values normalise to the NULL sentinel.
    pub fn bind_json(
        mut self,
        value: &Value,
        key_prefix: &str,
    ) -> Result<Self, QueryBuilderError> {
        let Value::Object(map) = value else {
            return Err(QueryBuilderError::NotAnObject(value.to_string()));
        };
        for (key, val) in map {
            let text = json_value_to_bind(val);
            self = self.bind(&format!("{key_prefix}{key}"), text);
        }
        Ok(self)
    }

    /// Same as [`Self::bind_json`] but treats `None`/`Value::Null` as an
    /// empty object (a no-op), matching the source's tolerance of an
    /// absent/empty `session_values` column.
    pub fn bind_json_opt(
        self,
        value: Option<&Value>,
        key_prefix: &str,
    ) -> Result<Self, QueryBuilderError> {
        match value {
            None | Some(Value::Null) => Ok(self),
            Some(v) => self.bind_json(v, key_prefix),
        }
    }

    /// Rewrite any remaining `?name?`/`?OLD.name?`/`?NEW.name?` placeholder
    /// to the literal token `NULL`, then lock the template and bind list.
    pub fn finalize(self) -> FinalizedQuery {
        let sql = RESIDUAL_PLACEHOLDER
            .replace_all(&self.template, "NULL")
            .into_owned();
        FinalizedQuery {
            sql,
            binds: self.binds,
        }
    }
}

/// Converts a JSON value to its bind text, normalising the JSON null
/// literal and the strings `"null"`/`"NULL"` to the NULL sentinel, and
/// re-serialising nested containers as opaque text.
fn json_value_to_bind(value: &Value) -> Bind {
    match value {
        Value::Null => None,
        Value::String(s) if s == "null" || s == "NULL" => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn binds_in_order_across_repeated_and_distinct_names() {
        let q = QueryBuilder::new("?a? = ?b? AND ?a? = ?c?")
            .bind("a", Some("1".into()))
            .bind("b", Some("2".into()))
            .bind("c", Some("3".into()))
            .finalize();

        assert_eq!(q.sql, "$1 = $2 AND $1 = $3");
        assert_eq!(
            q.binds,
            vec![Some("1".into()), Some("2".into()), Some("3".into())]
        );
    }

    #[test]
    fn unbound_placeholder_finalizes_to_null_with_empty_bind_list() {
        let q = QueryBuilder::new("?x?").finalize();
        assert_eq!(q.sql, "NULL");
        assert!(q.binds.is_empty());
    }

    #[test]
    fn unmatched_bind_does_not_leave_a_gap() {
        let q = QueryBuilder::new("?a?")
            .bind("nonexistent", Some("x".into()))
            .bind("a", Some("1".into()))
            .finalize();

        assert_eq!(q.sql, "$1");
        assert_eq!(q.binds, vec![Some("1".into())]);
    }

    #[test]
    fn bind_json_string_null_normalises_to_sentinel() {
        let q = QueryBuilder::new("?k?")
            .bind_json(&json!({"k": "null"}), "")
            .unwrap()
            .finalize();

        assert_eq!(q.sql, "$1");
        assert_eq!(q.binds, vec![None]);
    }

    #[test]
    fn bind_json_nested_object_is_opaque_text() {
        let q = QueryBuilder::new("?nested?")
            .bind_json(&json!({"nested": {"k": "v"}}), "")
            .unwrap()
            .finalize();

        assert_eq!(q.sql, "$1");
        assert_eq!(q.binds, vec![Some(r#"{"k":"v"}"#.into())]);
    }

    #[test]
    fn bind_json_rejects_non_object_root() {
        let err = QueryBuilder::new("?x?")
            .bind_json(&json!([1, 2, 3]), "")
            .unwrap_err();
        assert!(matches!(err, QueryBuilderError::NotAnObject(_)));
    }

    #[test]
    fn prefixed_old_new_placeholders_are_finalized_when_unbound() {
        let q = QueryBuilder::new("SELECT ?OLD.a? , ?NEW.b?").finalize();
        assert_eq!(q.sql, "SELECT NULL , NULL");
    }

    #[test]
    fn event_happy_path_template_from_spec_scenario_1() {
        let new = json!({"a": "1"});
        let old = json!({"a": "0"});
        let session = json!({});

        let q = QueryBuilder::new("SELECT '?op?:' || ?NEW.a? AS parameters")
            .bind("event_table_work_item", Some("1".into()))
            .bind("uid", None)
            .bind("op", Some("U".into()))
            .bind("pk_value", Some("7".into()))
            .bind("recorded", Some("2026-01-01T00:00:00Z".into()))
            .bind_json(&new, "NEW.")
            .unwrap()
            .bind_json(&old, "OLD.")
            .unwrap()
            .bind_json(&session, "")
            .unwrap()
            .finalize();

        assert_eq!(q.sql, "SELECT '$3:' || $4 AS parameters");
        assert_eq!(q.binds.len(), 4);
    }
}
