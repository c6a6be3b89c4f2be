// State machine module for provisioning tasks
//
// Every task write in every store goes through `TaskStateMachine::apply`, so the set of legal
// transitions lives in exactly one place.

pub mod errors;
pub mod events;
pub mod states;
pub mod task_state_machine;

pub use errors::{StateMachineError, StateMachineResult};
pub use events::TaskEvent;
pub use states::TaskState;
pub use task_state_machine::TaskStateMachine;
