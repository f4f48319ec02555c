//! Backoff and error classification for chain calls
//!
//! Engines retry transient I/O at their loop boundary. A [`ChainError`]
//! that a retry cannot fix (bad key, empty wallet) stops the attempt
//! instead of spinning until the attempt budget runs out.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ChainError;

/// Delay schedule for one kind of retried operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Failures tolerated before giving up
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Ceiling for the grown delay
    pub max_delay: Duration,
    /// Growth per consecutive failure; 1 keeps the delay constant
    pub factor: u32,
}

impl RetryConfig {
    /// Constant delay between attempts
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            factor: 1,
        }
    }

    /// Delay doubles per failure up to `max_delay`
    pub fn exponential(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: max_delay.max(base_delay),
            factor: 2,
        }
    }

    /// Delay to wait after `failures` consecutive failures
    pub fn delay_after(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(self.factor.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

/// How a failed call should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Node or network hiccup
    Transient,
    /// The node already has this transaction; only a re-read can tell more
    Duplicate,
    /// Retrying cannot help
    Permanent,
    Unknown,
}

const TRANSIENT_HINTS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "network",
    "rate limit",
    "too many requests",
    "502",
    "503",
    "temporarily unavailable",
    "loading block index",
];

const DUPLICATE_HINTS: &[&str] = &[
    "already known",
    "nonce too low",
    "replacement transaction",
    "txn-already-in-mempool",
];

const PERMANENT_HINTS: &[&str] = &[
    "insufficient funds",
    "invalid signature",
    "unauthorized",
    "401",
    "403",
];

impl ErrorClass {
    /// Classify a node or contract error message
    pub fn of_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        let hit = |hints: &[&str]| hints.iter().any(|h| lower.contains(h));

        if hit(TRANSIENT_HINTS) {
            ErrorClass::Transient
        } else if hit(DUPLICATE_HINTS) {
            ErrorClass::Duplicate
        } else if hit(PERMANENT_HINTS) {
            ErrorClass::Permanent
        } else {
            ErrorClass::Unknown
        }
    }

    pub fn of(error: &ChainError) -> Self {
        match error {
            ChainError::Transport(_) => ErrorClass::Transient,
            ChainError::Decode(_) | ChainError::NotFound(_) => ErrorClass::Unknown,
            ChainError::Rpc { message, .. } | ChainError::Contract(message) => {
                Self::of_message(message)
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Duplicate => "duplicate",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Unknown => "unknown",
        }
    }
}

/// Decision after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    RetryAfter(Duration),
    GiveUp,
}

/// Consecutive failures of one logical operation
#[derive(Debug, Clone)]
pub struct RetryTracker {
    config: RetryConfig,
    failures: u32,
}

impl RetryTracker {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Count a failure of class `class` and decide what comes next
    pub fn fail(&mut self, class: ErrorClass) -> RetryAction {
        self.failures += 1;
        if class == ErrorClass::Permanent {
            warn!(failures = self.failures, "Permanent error, not retrying");
            return RetryAction::GiveUp;
        }
        if self.failures >= self.config.max_attempts {
            return RetryAction::GiveUp;
        }

        let delay = match class {
            // Re-read soon; a longer wait tells us nothing new
            ErrorClass::Duplicate => self.config.base_delay,
            _ => self.config.delay_after(self.failures),
        };
        debug!(
            failures = self.failures,
            class = class.as_str(),
            ?delay,
            "Retrying"
        );
        RetryAction::RetryAfter(delay)
    }
}
