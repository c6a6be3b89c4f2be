//! # Adapter Error Classification
//!
//! Maps an adapter failure plus attempt context to a handling decision:
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │ AdapterError    │────▶│ ErrorClassifier │────▶│ Classification  │
//! │ + attempts      │     │                 │     │ retry / fail    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! Ambiguous outcomes reach the classifier only after the executor's verification query
//! could not confirm the effect; they are then retried like transient failures.

use super::backoff_calculator::BackoffCalculator;
use crate::adapters::{AdapterError, PermanentKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Permanent(PermanentKind),
    /// Unverified outcome, handled as transient
    Ambiguous,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Permanent(kind) => write!(f, "permanent:{kind}"),
            Self::Ambiguous => f.write_str("ambiguous"),
        }
    }
}

/// Result of error classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub error_category: ErrorCategory,

    /// Whether the task goes back to the queue
    pub is_retryable: bool,

    /// Delay before the next attempt (if retryable)
    pub retry_delay: Option<Duration>,

    /// This failure consumes the last attempt; the state machine escalates it to FAILED
    pub is_final_attempt: bool,

    /// Message recorded as the task's `last_error`
    pub error_message: String,
}

#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    backoff: BackoffCalculator,
}

impl ErrorClassifier {
    pub fn new(backoff: BackoffCalculator) -> Self {
        Self { backoff }
    }

    pub fn backoff(&self) -> &BackoffCalculator {
        &self.backoff
    }

    /// `attempts` is the number of attempts consumed before this failure
    pub fn classify(
        &self,
        error: &AdapterError,
        attempts: i32,
        max_attempts: i32,
    ) -> ErrorClassification {
        let is_final_attempt = attempts + 1 >= max_attempts;
        let error_message = error.to_string();

        match error {
            AdapterError::Permanent { kind, .. } => ErrorClassification {
                error_category: ErrorCategory::Permanent(*kind),
                is_retryable: false,
                retry_delay: None,
                is_final_attempt: true,
                error_message,
            },
            AdapterError::Transient { retry_after, .. } => ErrorClassification {
                error_category: ErrorCategory::Transient,
                is_retryable: true,
                retry_delay: Some(self.backoff.calculate_delay(attempts, *retry_after)),
                is_final_attempt,
                error_message,
            },
            AdapterError::Ambiguous { .. } => ErrorClassification {
                error_category: ErrorCategory::Ambiguous,
                is_retryable: true,
                retry_delay: Some(self.backoff.calculate_delay(attempts, None)),
                is_final_attempt,
                error_message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::new(BackoffCalculator::new(BackoffConfig {
            jitter_enabled: false,
            ..BackoffConfig::default()
        }))
    }

    #[test]
    fn test_permanent_is_not_retryable() {
        let c = classifier().classify(
            &AdapterError::permanent(PermanentKind::Auth, "bad token"),
            0,
            5,
        );
        assert!(!c.is_retryable);
        assert_eq!(c.error_category, ErrorCategory::Permanent(PermanentKind::Auth));
        assert_eq!(c.error_category.to_string(), "permanent:auth");
    }

    #[test]
    fn test_transient_uses_backoff_and_flags_last_attempt() {
        let c = classifier().classify(&AdapterError::transient("502"), 1, 5);
        assert!(c.is_retryable);
        assert_eq!(c.retry_delay, Some(Duration::from_secs(4)));
        assert!(!c.is_final_attempt);

        let last = classifier().classify(&AdapterError::transient("502"), 4, 5);
        assert!(last.is_final_attempt);
    }

    #[test]
    fn test_retry_after_honoured() {
        let c = classifier().classify(
            &AdapterError::Transient {
                message: "429".into(),
                retry_after: Some(Duration::from_secs(20)),
            },
            0,
            5,
        );
        assert_eq!(c.retry_delay, Some(Duration::from_secs(20)));
    }

    #[test]
    fn test_unverified_ambiguity_retries() {
        let c = classifier().classify(&AdapterError::ambiguous("timeout"), 0, 5);
        assert!(c.is_retryable);
        assert_eq!(c.error_category, ErrorCategory::Ambiguous);
    }
}
