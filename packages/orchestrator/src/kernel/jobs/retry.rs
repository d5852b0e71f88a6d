//! Typed retry strategies and the retry decision.
//!
//! A job carries a snapshot of its policy from enqueue time, so a routing
//! table change never reinterprets jobs already in flight. Delays are stored
//! in milliseconds to keep the snapshot JSON stable.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// delay = D
    Fixed { delay_ms: u64 },
    /// delay = D + attempt × M
    Linear { base_ms: u64, increment_ms: u64 },
    /// delay = min(D × F^(attempt−1), max)
    Exponential {
        base_ms: u64,
        factor: f64,
        max_delay_ms: u64,
    },
    /// Resolved at runtime from the processor registry; the snapshot only
    /// records that the class computes its own delays.
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub strategy: RetryStrategy,
    pub max_attempts: u32,
    /// Error codes that never retry for this class.
    #[serde(default)]
    pub non_retryable: Vec<String>,
    /// When set, only these error codes retry.
    #[serde(default)]
    pub retryable_only: Option<Vec<String>>,
}

impl RetryPolicy {
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            strategy: RetryStrategy::Fixed {
                delay_ms: delay.as_millis() as u64,
            },
            max_attempts,
            non_retryable: vec![],
            retryable_only: None,
        }
    }

    pub fn linear(base: Duration, increment: Duration, max_attempts: u32) -> Self {
        Self {
            strategy: RetryStrategy::Linear {
                base_ms: base.as_millis() as u64,
                increment_ms: increment.as_millis() as u64,
            },
            max_attempts,
            non_retryable: vec![],
            retryable_only: None,
        }
    }

    pub fn exponential(base: Duration, factor: f64, cap: Duration, max_attempts: u32) -> Self {
        Self {
            strategy: RetryStrategy::Exponential {
                base_ms: base.as_millis() as u64,
                factor,
                max_delay_ms: cap.as_millis() as u64,
            },
            max_attempts,
            non_retryable: vec![],
            retryable_only: None,
        }
    }

    pub fn non_retryable_on(mut self, codes: &[&str]) -> Self {
        self.non_retryable = codes.iter().map(|code| code.to_string()).collect();
        self
    }

    pub fn retryable_only_on(mut self, codes: &[&str]) -> Self {
        self.retryable_only = Some(codes.iter().map(|code| code.to_string()).collect());
        self
    }

    /// Backoff before the next attempt, where `attempt` is the 1-based
    /// attempt that just failed. `Custom` falls back to zero here; the
    /// worker consults the processor's own delay function first.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match &self.strategy {
            RetryStrategy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            RetryStrategy::Linear { base_ms, increment_ms } => {
                Duration::from_millis(base_ms + u64::from(attempt) * increment_ms)
            }
            RetryStrategy::Exponential {
                base_ms,
                factor,
                max_delay_ms,
            } => {
                let raw = (*base_ms as f64) * factor.powi(attempt as i32 - 1);
                Duration::from_millis((raw as u64).min(*max_delay_ms))
            }
            RetryStrategy::Custom => Duration::ZERO,
        }
    }

    /// The §4.3 retry decision: refuse when the code is denylisted, when an
    /// allowlist exists and the code is not on it, or when attempts are
    /// exhausted.
    pub fn should_retry(&self, error_code: &str, attempts_made: u32) -> bool {
        if attempts_made >= self.max_attempts {
            return false;
        }
        if self.non_retryable.iter().any(|code| code == error_code) {
            return false;
        }
        if let Some(allowlist) = &self.retryable_only {
            return allowlist.iter().any(|code| code == error_code);
        }
        true
    }
}
