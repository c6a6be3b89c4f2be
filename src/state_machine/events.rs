use crate::models::StepResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events that can trigger provisioning task state transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TaskEvent {
    /// Claim engine hands the task to a worker
    Claim {
        worker_id: String,
        lease_expires_at: DateTime<Utc>,
    },
    /// Worker begins the adapter call
    Start { lease_expires_at: DateTime<Utc> },
    /// Adapter call succeeded
    Complete { result: StepResult },
    /// Transient failure; retry after backoff
    Retry {
        error: String,
        next_retry_at: DateTime<Utc>,
    },
    /// Permanent failure
    Fail { error: String },
    /// Lease ran out without a heartbeat
    LeaseExpired,
    /// Subscription teardown made the task non-actionable
    Cancel { reason: String },
    /// Operator dismissed the task
    AdminCancel { reason: String },
}

impl TaskEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Claim { .. } => "claim",
            Self::Start { .. } => "start",
            Self::Complete { .. } => "complete",
            Self::Retry { .. } => "retry",
            Self::Fail { .. } => "fail",
            Self::LeaseExpired => "lease_expired",
            Self::Cancel { .. } => "cancel",
            Self::AdminCancel { .. } => "admin_cancel",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Retry { error, .. } | Self::Fail { error } => Some(error),
            _ => None,
        }
    }

    /// Whether this event consumes one of the task's attempts
    pub fn counts_attempt(&self) -> bool {
        matches!(self, Self::Retry { .. } | Self::Fail { .. })
    }
}
