//! Bounded retry with a fixed delay for transient fetch failures.
//!
//! [`RetryPolicy`] answers "may attempt N be followed by another one?" and
//! [`retry`] drives an async action through that policy, reporting every
//! failed attempt to the [`EventSink`].
//!
//! # Example
//!
//! ```
//! use mirrordl_core::download::{RetryDecision, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(3, Duration::from_secs(5));
//!
//! match policy.should_retry(1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {}", reason);
//!     }
//! }
//! ```

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument};

use super::constants::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY};
use super::error::{FailureType, FetchError, classify_error};
use crate::events::{DownloadEvent, EventSink};

/// Errors that can be classified for retry decisions.
pub trait Classify {
    /// Returns the failure class of this error.
    fn failure_type(&self) -> FailureType;
}

impl Classify for FetchError {
    fn failure_type(&self) -> FailureType {
        classify_error(self)
    }
}

/// Decision on whether to make another attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Give up.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Attempt ceiling and fixed delay.
///
/// Defaults: 5 attempts, 5 seconds between attempts. No backoff, no jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Pause between a failed attempt and the next one.
    delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy. `max_attempts` is clamped to at least 1.
    #[must_use]
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the fixed delay between attempts.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Decides whether a retriable failure on `attempt` (1-indexed) is
    /// followed by another attempt.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, attempt: u32) -> RetryDecision {
        if attempt >= self.max_attempts {
            debug!(attempt, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }
        RetryDecision::Retry {
            delay: self.delay,
            attempt: attempt + 1,
        }
    }
}

/// Terminal failure of [`retry`].
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The predicate rejected the error; no further attempt was made.
    #[error("{source} (not retried, failed on attempt {attempt})")]
    NotRetriable {
        /// Attempt on which the error occurred.
        attempt: u32,
        /// The error.
        #[source]
        source: E,
    },

    /// Every attempt failed with a retriable error.
    #[error("{source} (gave up after {attempts} attempts)")]
    Exhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Error of the last attempt.
        #[source]
        source: E,
    },
}

impl<E> RetryError<E> {
    /// Returns the error of the final attempt.
    pub fn source_error(&self) -> &E {
        match self {
            Self::NotRetriable { source, .. } | Self::Exhausted { source, .. } => source,
        }
    }

    /// Consumes the wrapper and returns the error of the final attempt.
    pub fn into_source(self) -> E {
        match self {
            Self::NotRetriable { source, .. } | Self::Exhausted { source, .. } => source,
        }
    }

    /// Returns how many times the action ran.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::NotRetriable { attempt, .. } => *attempt,
            Self::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Runs `action` until it succeeds, the predicate rejects its error, or the
/// policy's attempt ceiling is reached.
///
/// Every failed attempt, including the last, is emitted as
/// [`DownloadEvent::AttemptRetry`].
///
/// # Errors
///
/// [`RetryError::NotRetriable`] when `is_retriable` returned false, or
/// [`RetryError::Exhausted`] after `max_attempts` retriable failures.
pub async fn retry<T, E, F, Fut, P>(
    name: &str,
    policy: &RetryPolicy,
    sink: &dyn EventSink,
    is_retriable: P,
    mut action: F,
) -> Result<T, RetryError<E>>
where
    E: Classify,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(FailureType) -> bool,
{
    let mut attempt = 1;
    loop {
        let error = match action().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let error_kind = error.failure_type();
        let decision = if is_retriable(error_kind) {
            policy.should_retry(attempt)
        } else {
            RetryDecision::DoNotRetry {
                reason: format!("{error_kind} failure is not retriable"),
            }
        };

        sink.emit(DownloadEvent::AttemptRetry {
            name: name.to_string(),
            attempt,
            max_attempts: policy.max_attempts(),
            error_kind,
            will_retry: matches!(decision, RetryDecision::Retry { .. }),
        });

        match decision {
            RetryDecision::Retry {
                delay,
                attempt: next,
            } => {
                tokio::time::sleep(delay).await;
                attempt = next;
            }
            RetryDecision::DoNotRetry { reason } => {
                debug!(operation = name, attempt, %reason, "giving up");
                return Err(if is_retriable(error_kind) {
                    RetryError::Exhausted {
                        attempts: attempt,
                        source: error,
                    }
                } else {
                    RetryError::NotRetriable {
                        attempt,
                        source: error,
                    }
                });
            }
        }
    }
}
