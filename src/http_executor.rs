//! HTTP Executor (spec section 4.8).
//!
//! Builds one URL-encoded parameter string from `parameters`,
//! `static_parameters`, and `session_values`, in that order, and performs
//! the configured method with a long-lived `reqwest::Client`.

use serde_json::Value;
use tracing::debug;

use crate::error::HttpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Put,
    Post,
}

impl HttpMethod {
    pub fn parse(raw: &str) -> Result<Self, HttpError> {
        match raw.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "PUT" => Ok(Self::Put),
            "POST" => Ok(Self::Post),
            other => Err(HttpError::UnsupportedMethod(other.to_string())),
        }
    }
}

pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(user_agent: &str) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent.to_string())
            .build()
            .map_err(HttpError::Request)?;
        Ok(Self { client })
    }

    /// Execute the configured method against `uri`, with the
    /// `use_ssl`-resolved scheme applied when `uri` is schemeless.
    pub async fn call(
        &self,
        uri: &str,
        method: HttpMethod,
        use_ssl: bool,
        parameters: Option<&Value>,
        static_parameters: Option<&Value>,
        session_values: Option<&Value>,
    ) -> Result<String, HttpError> {
        let encoded = build_url_encoded_body(parameters, static_parameters, session_values);
        let url = resolve_scheme(uri, use_ssl);

        debug!(url = %url, method = ?method, "dispatching HTTP action");

        let response = match method {
            HttpMethod::Get => {
                let full = if encoded.is_empty() {
                    url
                } else {
                    format!("{url}?{encoded}")
                };
                self.client.get(full).send().await
            }
            HttpMethod::Put => self
                .client
                .put(url)
                .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(encoded)
                .send()
                .await,
            HttpMethod::Post => self
                .client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(encoded)
                .send()
                .await,
        }
        .map_err(HttpError::Request)?;

        let status = response.status();
        if !status.is_success() {
            return Err(HttpError::Status(status));
        }

        response.text().await.map_err(HttpError::Request)
    }
}

/// If `uri` already carries a scheme, it is used verbatim; otherwise the
/// scheme is chosen by `use_ssl`.
fn resolve_scheme(uri: &str, use_ssl: bool) -> String {
    if uri.contains("://") {
        uri.to_string()
    } else {
        let scheme = if use_ssl { "https" } else { "http" };
        format!("{scheme}://{uri}")
    }
}

/// Iterate, in order, `parameters`, `static_parameters`, `session_values`;
/// each non-empty JSON object contributes `key=urlencode(value_text)`
/// entries, joined with `&`.
fn build_url_encoded_body(
    parameters: Option<&Value>,
    static_parameters: Option<&Value>,
    session_values: Option<&Value>,
) -> String {
    let mut parts = Vec::new();
    for json in [parameters, static_parameters, session_values] {
        append_entries(json, &mut parts);
    }
    parts.join("&")
}

fn append_entries(json: Option<&Value>, parts: &mut Vec<String>) {
    let Some(Value::Object(map)) = json else {
        return;
    };
    for (key, value) in map {
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        parts.push(format!("{key}={}", urlencoding::encode(&text)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_supported_methods_case_insensitively() {
        assert_eq!(HttpMethod::parse("get").unwrap(), HttpMethod::Get);
        assert_eq!(HttpMethod::parse("PUT").unwrap(), HttpMethod::Put);
        assert_eq!(HttpMethod::parse("Post").unwrap(), HttpMethod::Post);
    }

    #[test]
    fn rejects_unsupported_method() {
        assert!(HttpMethod::parse("DELETE").is_err());
    }

    #[test]
    fn builds_url_encoded_body_in_declared_order() {
        let parameters = json!({"x": "1"});
        let statics = json!({"y": "2"});
        let body = build_url_encoded_body(Some(&parameters), Some(&statics), None);
        assert_eq!(body, "x=1&y=2");
    }

    #[test]
    fn schemeless_uri_resolves_per_use_ssl() {
        assert_eq!(resolve_scheme("h/p", false), "http://h/p");
        assert_eq!(resolve_scheme("h/p", true), "https://h/p");
        assert_eq!(resolve_scheme("https://h/p", false), "https://h/p");
    }
}
