use super::states::TaskState;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateMachineError {
    #[error("Invalid transition from {from} on event {event}")]
    InvalidTransition { from: TaskState, event: &'static str },

    #[error("Invalid state in storage: {0}")]
    InvalidStoredState(String),
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
