//! HTTP delivery to the upstream REST API.

use super::{DispatchContext, HandlerError, HandlerOutcome, OperationHandler};
use async_trait::async_trait;
use lifeline_engine::{Endpoint, Operation};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;

/// Sends an operation's payload to its configured endpoint.
#[derive(Debug, Clone)]
pub struct HttpHandler {
    client: Client,
    base_url: String,
    endpoint: Endpoint,
}

impl HttpHandler {
    pub fn new(client: Client, base_url: &str, endpoint: Endpoint) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            endpoint,
        }
    }

    /// Full URL for `op`, with `{field}` segments filled from the payload.
    pub fn url_for(&self, op: &Operation) -> Result<String, String> {
        let mut path = String::with_capacity(self.endpoint.path.len());
        let mut rest = self.endpoint.path.as_str();

        while let Some(start) = rest.find('{') {
            let Some(len) = rest[start..].find('}') else {
                break;
            };
            path.push_str(&rest[..start]);
            let field = &rest[start + 1..start + len];
            let value = match op.payload.get(field) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => return Err(format!("payload has no path parameter {field}")),
            };
            path.push_str(&value);
            rest = &rest[start + len + 1..];
        }
        path.push_str(rest);

        Ok(format!("{}{}", self.base_url, path))
    }
}

#[async_trait]
impl OperationHandler for HttpHandler {
    async fn dispatch(
        &self,
        op: &Operation,
        ctx: &DispatchContext,
    ) -> Result<HandlerOutcome, HandlerError> {
        let url = match self.url_for(op) {
            Ok(url) => url,
            Err(reason) => return Ok(HandlerOutcome::Permanent(reason)),
        };
        let method = match Method::from_bytes(self.endpoint.method.as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                return Ok(HandlerOutcome::Permanent(format!(
                    "invalid method {}",
                    self.endpoint.method
                )))
            }
        };

        let mut request = self
            .client
            .request(method, &url)
            .header("Idempotency-Key", &op.id)
            .json(&op.payload);
        if let Some(token) = &ctx.access_token {
            request = request.bearer_auth(token);
        }
        if let Some(correlation_id) = &op.metadata.correlation_id {
            request = request.header("X-Correlation-Id", correlation_id);
        }

        tracing::debug!(op_id = %op.id, kind = %op.kind, %url, "Dispatching operation");
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        Ok(classify_response(status, &body))
    }
}

/// Map an HTTP status and body onto a handler outcome.
///
/// - a body with `conflict: true` and `serverData`, or a 409 carrying
///   `serverData`: conflict
/// - other 2xx: delivered, with the JSON body if there is one
/// - 401, 408, 429 and 5xx: retryable
/// - other 4xx: permanent
pub fn classify_response(status: StatusCode, body: &str) -> HandlerOutcome {
    let json: Option<Value> = serde_json::from_str(body).ok();
    let server_data = json.as_ref().and_then(|v| v.get("serverData")).cloned();
    let flagged = json
        .as_ref()
        .and_then(|v| v.get("conflict"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if let Some(server_data) = server_data.filter(|_| flagged || status == StatusCode::CONFLICT) {
        return HandlerOutcome::Conflict { server_data };
    }

    if status.is_success() {
        return HandlerOutcome::Delivered(json);
    }

    let reason = format!("{status}: {}", truncate(body, 200));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            HandlerOutcome::Retryable(reason)
        }
        s if s.is_server_error() => HandlerOutcome::Retryable(reason),
        _ => HandlerOutcome::Permanent(reason),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
