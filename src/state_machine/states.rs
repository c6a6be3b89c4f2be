use serde::{Deserialize, Serialize};
use std::fmt;

/// Provisioning task states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting to be claimed
    #[default]
    Pending,
    /// Leased by a worker that has not started the adapter call yet
    Claimed,
    /// Adapter call in flight
    Running,
    /// Transient failure, claimable again once `next_retry_at` passes
    Retrying,
    /// Step succeeded
    Completed,
    /// Permanent failure or retries exhausted
    Failed,
    /// Made non-actionable by deprovisioning or dismissed by an operator
    Cancelled,
}

impl TaskState {
    pub const ALL: [TaskState; 7] = [
        Self::Pending,
        Self::Claimed,
        Self::Running,
        Self::Retrying,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Check if this is a terminal state (no further transitions for this task instance)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if a worker holds (or held) a lease in this state
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Claimed | Self::Running)
    }

    /// Check if the task is waiting in the queue
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Pending | Self::Retrying)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("Invalid task state: {s}"))
    }
}
