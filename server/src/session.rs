//! Session token upkeep.
//!
//! The executor attaches the current access token to every dispatch. The
//! [`SessionTokenRefresher`] runs on its own timer and refreshes the token
//! before it expires. If a refresh fails the session is cleared, so the
//! executor pauses instead of burning retry budget on auth failures.

use crate::events::{EngineEvent, EventBus};
use async_trait::async_trait;
use lifeline_engine::{Clock, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

/// An authenticated session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Expiry in milliseconds since the epoch
    pub expires_at: Timestamp,
}

impl Session {
    pub fn remaining_ms(&self, now: Timestamp) -> u64 {
        self.expires_at.saturating_sub(now)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("refresh rejected: {0}")]
    Rejected(String),

    #[error("session has no refresh token")]
    MissingRefreshToken,

    #[error("invalid refresh response: {0}")]
    InvalidResponse(String),
}

/// Holder of the current session.
#[derive(Debug, Default)]
pub struct SessionStore {
    current: RwLock<Option<Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, session: Session) {
        *self.current.write().await = Some(session);
    }

    pub async fn get(&self) -> Option<Session> {
        self.current.read().await.clone()
    }

    pub async fn clear(&self) {
        *self.current.write().await = None;
    }

    /// Replace the session only if it still carries `access_token`.
    ///
    /// Returns false, changing nothing, when another writer got there first.
    pub async fn replace_if(&self, access_token: &str, next: Option<Session>) -> bool {
        let mut current = self.current.write().await;
        let unchanged = current
            .as_ref()
            .is_some_and(|session| session.access_token == access_token);
        if unchanged {
            *current = next;
        }
        unchanged
    }

    pub async fn access_token(&self) -> Option<String> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|session| session.access_token.clone())
    }
}

/// Exchanges a session for a fresh one.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn refresh(&self, session: &Session, now: Timestamp) -> Result<Session, SessionError>;
}

/// Refreshes against a REST endpoint.
///
/// Sends `{"refreshToken": ...}` and accepts `accessToken` with either
/// `expiresAt` (ms) or `expiresIn` (seconds), plus an optional rotated
/// `refreshToken`.
#[derive(Debug, Clone)]
pub struct HttpTokenProvider {
    client: reqwest::Client,
    url: String,
}

impl HttpTokenProvider {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: Option<Timestamp>,
    expires_in: Option<u64>,
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn refresh(&self, session: &Session, now: Timestamp) -> Result<Session, SessionError> {
        let refresh_token = session
            .refresh_token
            .as_deref()
            .filter(|token| !token.trim().is_empty())
            .ok_or(SessionError::MissingRefreshToken)?;

        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "refreshToken": refresh_token }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SessionError::Rejected(format!("{status}: {body}")));
        }

        let body: RefreshResponse = response.json().await?;
        let access_token = body
            .access_token
            .ok_or_else(|| SessionError::InvalidResponse("missing accessToken".into()))?;
        let expires_at = body
            .expires_at
            .or_else(|| body.expires_in.map(|secs| now.saturating_add(secs * 1_000)))
            .ok_or_else(|| SessionError::InvalidResponse("missing expiry".into()))?;

        Ok(Session {
            access_token,
            refresh_token: body.refresh_token.or_else(|| session.refresh_token.clone()),
            expires_at,
        })
    }
}

/// What one check did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    NoSession,
    /// Enough lifetime left
    Fresh,
    Refreshed { expires_at: Timestamp },
    Cleared { reason: String },
    /// The session was replaced while the refresh was in flight; the
    /// newer session is kept
    Superseded,
}

/// Keeps the session token valid.
pub struct SessionTokenRefresher {
    sessions: Arc<SessionStore>,
    provider: Arc<dyn TokenProvider>,
    clock: Arc<dyn Clock>,
    threshold: Duration,
    events: EventBus,
}

impl SessionTokenRefresher {
    pub fn new(
        sessions: Arc<SessionStore>,
        provider: Arc<dyn TokenProvider>,
        clock: Arc<dyn Clock>,
        threshold: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            sessions,
            provider,
            clock,
            threshold,
            events,
        }
    }

    /// Refresh the token if its remaining lifetime is below the threshold.
    pub async fn check(&self) -> RefreshOutcome {
        let Some(session) = self.sessions.get().await else {
            return RefreshOutcome::NoSession;
        };

        let now = self.clock.now();
        let threshold_ms = u64::try_from(self.threshold.as_millis()).unwrap_or(u64::MAX);
        if session.remaining_ms(now) >= threshold_ms {
            return RefreshOutcome::Fresh;
        }

        match self.provider.refresh(&session, now).await {
            Ok(refreshed) => {
                let expires_at = refreshed.expires_at;
                if !self
                    .sessions
                    .replace_if(&session.access_token, Some(refreshed))
                    .await
                {
                    tracing::debug!("Session replaced during refresh, keeping the newer one");
                    return RefreshOutcome::Superseded;
                }
                tracing::info!(expires_at, "Session token refreshed");
                self.events
                    .publish(EngineEvent::SessionRefreshed { expires_at });
                RefreshOutcome::Refreshed { expires_at }
            }
            Err(e) => {
                let reason = e.to_string();
                if !self.sessions.replace_if(&session.access_token, None).await {
                    tracing::debug!(error = %reason, "Refresh failed for a replaced session, ignoring");
                    return RefreshOutcome::Superseded;
                }
                tracing::warn!(error = %reason, "Session refresh failed, session cleared");
                self.events.publish(EngineEvent::SessionCleared {
                    reason: reason.clone(),
                });
                RefreshOutcome::Cleared { reason }
            }
        }
    }

    /// Run [`check`](Self::check) every `interval` until `shutdown` flips.
    pub fn spawn(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let outcome = self.check().await;
                        tracing::trace!(?outcome, "Session check");
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Session refresher stopped");
        })
    }
}
