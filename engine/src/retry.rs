//! Retry and dead-letter decisions.
//!
//! Backoff is deterministic (no jitter) so that a replayed failure sequence
//! always produces the same schedule.

use crate::{Operation, OperationPatch, PolicyRegistry, Timestamp};
use serde::{Deserialize, Serialize};

/// Shape of the delay curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// `min(base * 2^(attempts - 1), max)`
    #[default]
    Exponential,
    /// `base * attempts`
    Linear,
    /// `base`
    Fixed,
}

/// Per-type retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default)]
    pub backoff: BackoffPolicy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(1_000, 60_000, 5)
    }
}

impl RetryPolicy {
    pub fn exponential(base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            backoff: BackoffPolicy::Exponential,
            base_delay_ms,
            max_delay_ms,
            max_attempts,
        }
    }

    pub fn linear(base_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            backoff: BackoffPolicy::Linear,
            base_delay_ms,
            max_delay_ms: u64::MAX,
            max_attempts,
        }
    }

    pub fn fixed(base_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            backoff: BackoffPolicy::Fixed,
            base_delay_ms,
            max_delay_ms: base_delay_ms,
            max_attempts,
        }
    }

    /// Delay before the next attempt, given how many attempts have been made.
    pub fn backoff(&self, attempts: u32) -> u64 {
        backoff(attempts, self)
    }
}

/// Delay in milliseconds after `attempts` failed attempts.
///
/// `attempts` below 1 is treated as 1.
pub fn backoff(attempts: u32, policy: &RetryPolicy) -> u64 {
    let attempts = attempts.max(1);
    match policy.backoff {
        BackoffPolicy::Exponential => {
            let factor = 2u64.checked_pow(attempts - 1).unwrap_or(u64::MAX);
            policy
                .base_delay_ms
                .saturating_mul(factor)
                .min(policy.max_delay_ms)
        }
        BackoffPolicy::Linear => policy.base_delay_ms.saturating_mul(u64::from(attempts)),
        BackoffPolicy::Fixed => policy.base_delay_ms,
    }
}

/// Why a handler call did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// Network error, timeout, 5xx: try again later
    Retryable(String),
    /// The server rejected the operation for good
    Permanent(String),
}

impl Failure {
    pub fn message(&self) -> &str {
        match self {
            Failure::Retryable(msg) | Failure::Permanent(msg) => msg,
        }
    }
}

/// What to do with an operation after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry {
        delay_ms: u64,
        next_attempt_at: Timestamp,
        error: String,
    },
    DeadLetter {
        reason: String,
    },
}

impl RetryDecision {
    /// Store patch that records this decision.
    pub fn to_patch(&self, now: Timestamp) -> OperationPatch {
        match self {
            RetryDecision::Retry {
                next_attempt_at,
                error,
                ..
            } => OperationPatch::schedule_retry(*next_attempt_at, error.clone()),
            RetryDecision::DeadLetter { reason } => OperationPatch::fail(now, reason.clone()),
        }
    }

    pub fn is_dead_letter(&self) -> bool {
        matches!(self, RetryDecision::DeadLetter { .. })
    }
}

/// Decides between another attempt and the dead-letter state.
#[derive(Debug, Clone, Copy)]
pub struct RetryController<'a> {
    registry: &'a PolicyRegistry,
}

impl<'a> RetryController<'a> {
    pub fn new(registry: &'a PolicyRegistry) -> Self {
        Self { registry }
    }

    /// Decide the fate of `op` (already counted the failed attempt) at `now`.
    pub fn decide(&self, op: &Operation, failure: &Failure, now: Timestamp) -> RetryDecision {
        let policy = &self.registry.policy(op.kind).retry;
        match failure {
            Failure::Permanent(msg) => RetryDecision::DeadLetter {
                reason: format!("permanent failure: {msg}"),
            },
            Failure::Retryable(msg) if op.attempts >= policy.max_attempts => {
                RetryDecision::DeadLetter {
                    reason: format!(
                        "retry budget exhausted after {} attempts: {msg}",
                        op.attempts
                    ),
                }
            }
            Failure::Retryable(msg) => {
                let delay_ms = policy.backoff(op.attempts);
                RetryDecision::Retry {
                    delay_ms,
                    next_attempt_at: now.saturating_add(delay_ms),
                    error: msg.clone(),
                }
            }
        }
    }

    /// Patch for an operation found mid-attempt after a restart.
    ///
    /// The interrupted attempt stays counted, so an operation that already
    /// spent its budget is dead-lettered instead of dispatched again.
    pub fn recover(&self, op: &Operation, now: Timestamp) -> OperationPatch {
        let policy = &self.registry.policy(op.kind).retry;
        if op.attempts >= policy.max_attempts {
            OperationPatch::fail(
                now,
                format!(
                    "attempt interrupted with retry budget exhausted after {} attempts",
                    op.attempts
                ),
            )
        } else {
            OperationPatch::recover(now)
        }
    }
}
