//! Error types for the provisioning orchestrator.
//!
//! Adapter failures never surface here: the step executor converts them into task state
//! transitions. `ProvisioningError` covers store, state machine, configuration and
//! validation failures that callers have to handle.

use crate::config::ConfigurationError;
use crate::state_machine::StateMachineError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProvisioningError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("State transition error: {0}")]
    StateTransitionError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("Task {task_id} is no longer leased by worker {worker_id}")]
    LeaseLost { task_id: Uuid, worker_id: String },
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProvisioningError {
    pub fn task_not_found(id: Uuid) -> Self {
        Self::NotFound { entity: "Task", id }
    }

    pub fn subscription_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "Subscription",
            id,
        }
    }

    pub fn lease_lost(task_id: Uuid, worker_id: &str) -> Self {
        Self::LeaseLost {
            task_id,
            worker_id: worker_id.to_string(),
        }
    }

    /// Lease loss is expected under crash recovery and is not an operational fault.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, Self::LeaseLost { .. })
    }
}

impl From<sqlx::Error> for ProvisioningError {
    fn from(err: sqlx::Error) -> Self {
        ProvisioningError::DatabaseError(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for ProvisioningError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        ProvisioningError::DatabaseError(format!("Migration failed: {err}"))
    }
}

impl From<serde_json::Error> for ProvisioningError {
    fn from(error: serde_json::Error) -> Self {
        ProvisioningError::ValidationError(format!("JSON serialization error: {error}"))
    }
}

impl From<StateMachineError> for ProvisioningError {
    fn from(error: StateMachineError) -> Self {
        ProvisioningError::StateTransitionError(error.to_string())
    }
}

impl From<ConfigurationError> for ProvisioningError {
    fn from(error: ConfigurationError) -> Self {
        ProvisioningError::ConfigurationError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProvisioningError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let id = Uuid::nil();
        assert_eq!(
            ProvisioningError::task_not_found(id).to_string(),
            format!("Task {id} not found")
        );
        assert_eq!(
            ProvisioningError::ValidationError("bad plan".to_string()).to_string(),
            "Validation error: bad plan"
        );
    }

    #[test]
    fn test_lease_lost_detection() {
        let err = ProvisioningError::lease_lost(Uuid::nil(), "worker-1");
        assert!(err.is_lease_lost());
        assert!(!ProvisioningError::Internal("x".into()).is_lease_lost());
    }
}
