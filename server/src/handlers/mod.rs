//! Per-type delivery handlers.
//!
//! The executor only knows the [`OperationHandler`] trait; concrete handlers
//! (HTTP, or anything a host application registers) live behind it in a
//! [`HandlerRegistry`].

mod http;

pub use http::{classify_response, HttpHandler};

use async_trait::async_trait;
use lifeline_engine::{Operation, OperationKind, PolicyRegistry};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Per-attempt information passed to a handler.
#[derive(Clone, Default)]
pub struct DispatchContext {
    /// Current session access token, if any
    pub access_token: Option<String>,
}

impl fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchContext")
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// How a handler classified one delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// Accepted; optionally with the server's resulting state
    Delivered(Option<Value>),
    /// Server state diverged; its current view is attached
    Conflict { server_data: Value },
    /// Worth trying again later
    Retryable(String),
    /// Will never succeed
    Permanent(String),
}

/// Failures a handler could not classify. The executor retries them.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("handler unavailable: {0}")]
    Unavailable(String),
}

/// Delivers operations of one kind.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn dispatch(
        &self,
        op: &Operation,
        ctx: &DispatchContext,
    ) -> Result<HandlerOutcome, HandlerError>;
}

/// Handlers by operation kind.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<OperationKind, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One [`HttpHandler`] per kind that has an endpoint configured.
    pub fn http(client: reqwest::Client, base_url: &str, policies: &PolicyRegistry) -> Self {
        let mut registry = Self::new();
        for kind in policies.kinds() {
            if let Some(endpoint) = &policies.policy(kind).endpoint {
                registry.register(
                    kind,
                    Arc::new(HttpHandler::new(client.clone(), base_url, endpoint.clone())),
                );
            }
        }
        registry
    }

    /// Register or replace the handler for `kind`.
    pub fn register(&mut self, kind: OperationKind, handler: Arc<dyn OperationHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: OperationKind) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Registered kinds in stable order.
    pub fn kinds(&self) -> Vec<OperationKind> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
