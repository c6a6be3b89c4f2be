//! # Task Store
//!
//! The single source of truth for subscriptions and provisioning tasks, and the place
//! where all concurrency control happens. Workers never talk to each other; they
//! coordinate only through the conditional writes of a [`ProvisioningStore`].
//!
//! Every task mutation goes through [`TaskStateMachine::apply`](crate::state_machine::TaskStateMachine::apply),
//! so both implementations enforce the same transition rules:
//!
//! - [`PgProvisioningStore`]: PostgreSQL via sqlx. Claims are an optimistic compare-and-set
//!   on a `version` column; everything else is a short transaction over `SELECT ... FOR UPDATE`.
//! - [`InMemoryProvisioningStore`]: one mutex around the whole data set, for tests and
//!   local simulation.

pub mod memory;
pub mod postgres;

use crate::error::{ProvisioningError, Result};
use crate::models::{
    CloudPodSubscription, NewProvisioningTask, ProvisioningTask, StepResult, SubscriptionStatus,
    TaskType,
};
use crate::state_machine::TaskState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub use memory::InMemoryProvisioningStore;
pub use postgres::PgProvisioningStore;

/// Result of one claim attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimAttempt {
    Claimed(ProvisioningTask),
    /// A candidate existed but another worker won the conditional write
    Contended,
    /// Nothing claimable right now
    Empty,
}

/// How a failed adapter call is recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Retry after backoff; escalated to failed when attempts run out
    Retry { next_retry_at: DateTime<Utc> },
    Permanent,
}

/// A completed task plus the dependents its completion enqueued
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOutcome {
    pub task: ProvisioningTask,
    pub enqueued: Vec<ProvisioningTask>,
}

/// Changes the aggregator wants applied to a subscription
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionUpdate {
    pub status: Option<SubscriptionStatus>,
    pub enqueue: Vec<NewProvisioningTask>,
    /// Human-readable cause of the status change
    pub reason: Option<String>,
}

/// What `apply_aggregate` did
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateOutcome {
    pub previous_status: SubscriptionStatus,
    pub subscription: CloudPodSubscription,
    pub enqueued: Vec<ProvisioningTask>,
    pub reason: Option<String>,
}

impl AggregateOutcome {
    pub fn status_changed(&self) -> bool {
        self.previous_status != self.subscription.status
    }
}

/// Decision function evaluated over a locked, consistent snapshot of one subscription
pub type AggregateDecision =
    dyn Fn(&CloudPodSubscription, &[ProvisioningTask]) -> SubscriptionUpdate + Send + Sync;

/// Result of a deprovision request
#[derive(Debug, Clone, PartialEq)]
pub struct DeprovisionOutcome {
    pub subscription: CloudPodSubscription,
    /// Queued tasks made non-actionable
    pub cancelled: Vec<Uuid>,
    pub deprovision_task: ProvisioningTask,
}

/// Task count for one `(type, status)` bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub task_type: TaskType,
    pub status: TaskState,
    pub count: i64,
}

#[async_trait]
pub trait ProvisioningStore: Send + Sync {
    /// Insert a subscription and its seed task in one transaction
    async fn create_subscription_with_seed(
        &self,
        subscription: CloudPodSubscription,
        seed: NewProvisioningTask,
    ) -> Result<(CloudPodSubscription, ProvisioningTask)>;

    /// Insert a task unless its idempotency key already exists.
    /// Returns the stored task either way.
    async fn enqueue(&self, task: NewProvisioningTask) -> Result<ProvisioningTask>;

    /// Return active tasks whose lease ran out to the queue (or fail them when their
    /// attempts are exhausted). Returns the tasks that were released.
    async fn release_expired_leases(&self) -> Result<Vec<ProvisioningTask>>;

    /// One conditional claim of the oldest claimable task of a capable type
    async fn try_claim(
        &self,
        worker_id: &str,
        capabilities: &[TaskType],
        lease: Duration,
    ) -> Result<ClaimAttempt>;

    /// `CLAIMED -> RUNNING` for the claiming worker
    async fn mark_running(
        &self,
        task_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<ProvisioningTask>;

    /// Extend a live lease. `false` when the worker no longer holds it.
    async fn heartbeat(&self, task_id: Uuid, worker_id: &str, lease: Duration) -> Result<bool>;

    /// `RUNNING -> COMPLETED`, recording container details on the subscription and
    /// enqueueing ready dependents in the same transaction
    async fn complete(
        &self,
        task_id: Uuid,
        worker_id: &str,
        result: StepResult,
    ) -> Result<CompletionOutcome>;

    async fn fail(
        &self,
        task_id: Uuid,
        worker_id: &str,
        error: &str,
        disposition: FailureDisposition,
    ) -> Result<ProvisioningTask>;

    /// Cancel a task the worker holds because its subscription is being torn down
    async fn cancel(&self, task_id: Uuid, worker_id: &str, reason: &str)
        -> Result<ProvisioningTask>;

    async fn get_task(&self, task_id: Uuid) -> Result<Option<ProvisioningTask>>;

    async fn get_subscription(&self, subscription_id: Uuid)
        -> Result<Option<CloudPodSubscription>>;

    /// All tasks of a subscription, oldest first
    async fn list_by_subscription(&self, subscription_id: Uuid) -> Result<Vec<ProvisioningTask>>;

    /// Mark the subscription DEPROVISIONING, cancel its queued tasks and enqueue teardown.
    /// Repeated requests return the existing teardown task.
    async fn request_deprovision(
        &self,
        subscription_id: Uuid,
        reason: &str,
        max_attempts: i32,
    ) -> Result<DeprovisionOutcome>;

    /// Hold the subscription in SUSPENDED
    async fn suspend(&self, subscription_id: Uuid) -> Result<CloudPodSubscription>;

    /// Release a suspension; the next aggregation derives the real status
    async fn resume(&self, subscription_id: Uuid) -> Result<CloudPodSubscription>;

    /// Evaluate `decide` over a locked snapshot and apply its status change and enqueues
    async fn apply_aggregate(
        &self,
        subscription_id: Uuid,
        decide: &AggregateDecision,
    ) -> Result<AggregateOutcome>;

    async fn queue_depth(&self) -> Result<Vec<QueueDepth>>;

    /// Re-enqueue a FAILED task as the next generation of its scope
    async fn admin_retry(&self, task_id: Uuid) -> Result<ProvisioningTask>;

    /// Dismiss a FAILED (or still queued) task
    async fn admin_cancel(&self, task_id: Uuid, reason: &str) -> Result<ProvisioningTask>;
}

/// Whether `candidate` must wait because a sibling holds a live lease.
///
/// At most one live claim per `(subscription, type)`; teardown waits for every other
/// in-flight task of the subscription.
pub(crate) fn claim_blocked(
    candidate: &ProvisioningTask,
    siblings: &[&ProvisioningTask],
    now: DateTime<Utc>,
) -> bool {
    siblings.iter().any(|other| {
        other.id != candidate.id
            && other.subscription_id == candidate.subscription_id
            && other.has_live_lease(now)
            && (other.task_type == candidate.task_type
                || candidate.task_type == TaskType::Deprovision)
    })
}

/// The claiming worker must still hold the task in `expected` state
pub(crate) fn ensure_held(
    task: &ProvisioningTask,
    worker_id: &str,
    expected: &[TaskState],
) -> Result<()> {
    if expected.contains(&task.status) && task.worker_id.as_deref() == Some(worker_id) {
        Ok(())
    } else {
        Err(ProvisioningError::lease_lost(task.id, worker_id))
    }
}

/// Validate an admin retry and build the next generation of the task's scope
pub(crate) fn next_generation(
    task: &ProvisioningTask,
    subscription: &CloudPodSubscription,
    siblings: &[ProvisioningTask],
) -> Result<NewProvisioningTask> {
    if task.status != TaskState::Failed {
        return Err(ProvisioningError::InvalidState(format!(
            "only failed tasks can be retried; task {} is {}",
            task.id, task.status
        )));
    }
    if subscription.status.is_tearing_down() && task.task_type != TaskType::Deprovision {
        return Err(ProvisioningError::InvalidState(format!(
            "subscription {} is {}",
            subscription.id, subscription.status
        )));
    }
    let latest = siblings
        .iter()
        .filter(|t| t.scope == task.scope)
        .map(|t| t.generation)
        .max()
        .unwrap_or(task.generation);
    if latest != task.generation {
        return Err(ProvisioningError::InvalidState(format!(
            "task {} is generation {} but {} already has generation {latest}",
            task.id, task.generation, task.scope
        )));
    }

    Ok(
        NewProvisioningTask::new(task.subscription_id, task.payload.clone(), task.max_attempts)
            .with_generation(task.generation + 1),
    )
}

pub(crate) fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(lease)
        .map(|lease| now + lease)
        .map_err(|e| ProvisioningError::ValidationError(format!("invalid lease duration: {e}")))
}
