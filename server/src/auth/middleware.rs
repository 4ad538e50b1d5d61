//! Bearer secret check for the control API.
//!
//! With `AUTH_SECRET` unset the API is open, which suits a loopback-only
//! agent. With it set every guarded route needs `Authorization: Bearer <secret>`.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::error::AppError;
use crate::AppState;

/// A caller that passed the secret check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthUser {
    /// No secret is configured
    Anonymous,
    /// Presented the configured secret
    Authenticated,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(secret) = state.config.auth_secret.as_deref() else {
            return Ok(AuthUser::Anonymous);
        };

        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        match auth_header {
            Some(header) => match header.strip_prefix("Bearer ") {
                Some(token) if constant_time_eq(token.as_bytes(), secret.as_bytes()) => {
                    Ok(AuthUser::Authenticated)
                }
                Some(_) => Err(AppError::Unauthorized("Invalid bearer token")),
                None => Err(AppError::Unauthorized("Invalid authorization header format")),
            },
            None => Err(AppError::Unauthorized("Missing authorization header")),
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
