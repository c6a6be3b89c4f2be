//! # Data Models
//!
//! The two persisted entities of the orchestrator and the typed values that flow through them.
//!
//! - [`task`] - `ProvisioningTask`, its tagged payload union, step results and idempotency keys
//! - [`subscription`] - `CloudPodSubscription` and its customer-visible status

pub mod subscription;
pub mod task;

pub use subscription::{CloudPodSubscription, NewSubscription, SubscriptionStatus};
pub use task::{
    ContainerSpec, IdempotencyKey, NewProvisioningTask, ProvisioningTask, StepResult, TaskPayload,
    TaskType,
};
