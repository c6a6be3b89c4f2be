//! # In-Memory Provisioning Store
//!
//! Thread-safe store for tests and local simulation. All state sits behind one
//! `parking_lot::Mutex`, which makes every operation trivially atomic; the lock is never
//! held across an `.await`.

use super::{
    claim_blocked, ensure_held, lease_deadline, next_generation, AggregateDecision,
    AggregateOutcome, ClaimAttempt, CompletionOutcome, DeprovisionOutcome, FailureDisposition,
    ProvisioningStore, QueueDepth,
};
use crate::error::{ProvisioningError, Result};
use crate::models::{
    CloudPodSubscription, IdempotencyKey, NewProvisioningTask, ProvisioningTask, StepResult,
    SubscriptionStatus, TaskPayload, TaskType,
};
use crate::orchestration::dependency_graph::{latest_of_type, plan_followups};
use crate::state_machine::{TaskEvent, TaskState, TaskStateMachine};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Debug, Default)]
struct MemoryState {
    subscriptions: HashMap<Uuid, CloudPodSubscription>,
    /// Insertion order doubles as the `created_at` tie-breaker
    tasks: Vec<ProvisioningTask>,
    index: HashMap<Uuid, usize>,
    keys: HashMap<IdempotencyKey, Uuid>,
}

impl MemoryState {
    fn task(&self, task_id: Uuid) -> Result<&ProvisioningTask> {
        self.index
            .get(&task_id)
            .map(|&i| &self.tasks[i])
            .ok_or_else(|| ProvisioningError::task_not_found(task_id))
    }

    fn task_mut(&mut self, task_id: Uuid) -> Result<&mut ProvisioningTask> {
        match self.index.get(&task_id) {
            Some(&i) => Ok(&mut self.tasks[i]),
            None => Err(ProvisioningError::task_not_found(task_id)),
        }
    }

    fn subscription_mut(&mut self, id: Uuid) -> Result<&mut CloudPodSubscription> {
        self.subscriptions
            .get_mut(&id)
            .ok_or_else(|| ProvisioningError::subscription_not_found(id))
    }

    fn tasks_of(&self, subscription_id: Uuid) -> Vec<ProvisioningTask> {
        self.tasks
            .iter()
            .filter(|t| t.subscription_id == subscription_id)
            .cloned()
            .collect()
    }

    /// Insert unless the key exists; `None` when it did
    fn insert(&mut self, new: NewProvisioningTask, now: DateTime<Utc>) -> Option<ProvisioningTask> {
        let key = new.idempotency_key();
        if self.keys.contains_key(&key) {
            return None;
        }
        let task = new.into_task(now);
        self.keys.insert(key, task.id);
        self.index.insert(task.id, self.tasks.len());
        self.tasks.push(task.clone());
        Some(task)
    }

    fn insert_all(
        &mut self,
        planned: Vec<NewProvisioningTask>,
        now: DateTime<Utc>,
    ) -> Vec<ProvisioningTask> {
        planned
            .into_iter()
            .filter_map(|new| self.insert(new, now))
            .collect()
    }
}

/// In-memory [`ProvisioningStore`]
#[derive(Debug, Default)]
pub struct InMemoryProvisioningStore {
    state: Mutex<MemoryState>,
}

impl InMemoryProvisioningStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tasks (for testing)
    pub fn task_count(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// Overwrite a task's lease expiry (for testing crash recovery)
    pub fn force_lease_expiry(&self, task_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock();
        state.task_mut(task_id)?.lease_expires_at = Some(at);
        Ok(())
    }

    /// Overwrite a task's retry time (for testing backoff without waiting)
    pub fn force_retry_due(&self, task_id: Uuid) -> Result<()> {
        let mut state = self.state.lock();
        let task = state.task_mut(task_id)?;
        if task.status == TaskState::Retrying {
            task.next_retry_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[async_trait]
impl ProvisioningStore for InMemoryProvisioningStore {
    async fn create_subscription_with_seed(
        &self,
        subscription: CloudPodSubscription,
        seed: NewProvisioningTask,
    ) -> Result<(CloudPodSubscription, ProvisioningTask)> {
        if seed.subscription_id != subscription.id {
            return Err(ProvisioningError::ValidationError(
                "seed task belongs to a different subscription".to_string(),
            ));
        }
        let mut state = self.state.lock();
        if state.subscriptions.contains_key(&subscription.id) {
            return Err(ProvisioningError::ValidationError(format!(
                "subscription {} already exists",
                subscription.id
            )));
        }
        let now = Utc::now();
        let task = state.insert(seed, now).ok_or_else(|| {
            ProvisioningError::ValidationError("seed task already exists".to_string())
        })?;
        state
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok((subscription, task))
    }

    async fn enqueue(&self, task: NewProvisioningTask) -> Result<ProvisioningTask> {
        let mut state = self.state.lock();
        if !state.subscriptions.contains_key(&task.subscription_id) {
            return Err(ProvisioningError::subscription_not_found(
                task.subscription_id,
            ));
        }
        let key = task.idempotency_key();
        match state.insert(task, Utc::now()) {
            Some(inserted) => Ok(inserted),
            None => {
                let existing = state.keys[&key];
                state.task(existing).cloned()
            }
        }
    }

    async fn release_expired_leases(&self) -> Result<Vec<ProvisioningTask>> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let mut released = Vec::new();
        for task in state.tasks.iter_mut().filter(|t| t.lease_expired(now)) {
            TaskStateMachine::apply(task, TaskEvent::LeaseExpired, now)?;
            released.push(task.clone());
        }
        Ok(released)
    }

    #[instrument(skip(self, capabilities))]
    async fn try_claim(
        &self,
        worker_id: &str,
        capabilities: &[TaskType],
        lease: Duration,
    ) -> Result<ClaimAttempt> {
        let now = Utc::now();
        let lease_expires_at = lease_deadline(now, lease)?;
        let mut state = self.state.lock();

        let live: Vec<&ProvisioningTask> =
            state.tasks.iter().filter(|t| t.has_live_lease(now)).collect();
        let candidate = state
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| capabilities.contains(&t.task_type) && t.is_claimable(now))
            .filter(|(_, t)| !claim_blocked(t, &live, now))
            .min_by_key(|(i, t)| (t.created_at, *i))
            .map(|(i, _)| i);

        let Some(i) = candidate else {
            return Ok(ClaimAttempt::Empty);
        };
        let task = &mut state.tasks[i];
        TaskStateMachine::apply(
            task,
            TaskEvent::Claim {
                worker_id: worker_id.to_string(),
                lease_expires_at,
            },
            now,
        )?;
        debug!(task_id = %task.id, task_type = %task.task_type, "Claimed task");
        Ok(ClaimAttempt::Claimed(task.clone()))
    }

    async fn mark_running(
        &self,
        task_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<ProvisioningTask> {
        let now = Utc::now();
        let lease_expires_at = lease_deadline(now, lease)?;
        let mut state = self.state.lock();
        let task = state.task_mut(task_id)?;
        ensure_held(task, worker_id, &[TaskState::Claimed])?;
        TaskStateMachine::apply(task, TaskEvent::Start { lease_expires_at }, now)?;
        Ok(task.clone())
    }

    async fn heartbeat(&self, task_id: Uuid, worker_id: &str, lease: Duration) -> Result<bool> {
        let now = Utc::now();
        let lease_expires_at = lease_deadline(now, lease)?;
        let mut state = self.state.lock();
        let task = state.task_mut(task_id)?;
        if ensure_held(task, worker_id, &[TaskState::Claimed, TaskState::Running]).is_err()
            || !task.has_live_lease(now)
        {
            return Ok(false);
        }
        task.lease_expires_at = Some(lease_expires_at);
        task.last_heartbeat_at = Some(now);
        task.updated_at = now;
        Ok(true)
    }

    async fn complete(
        &self,
        task_id: Uuid,
        worker_id: &str,
        result: StepResult,
    ) -> Result<CompletionOutcome> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let task = state.task_mut(task_id)?;
        ensure_held(task, worker_id, &[TaskState::Running])?;
        TaskStateMachine::apply(
            task,
            TaskEvent::Complete {
                result: result.clone(),
            },
            now,
        )?;
        let task = task.clone();

        let subscription = state.subscription_mut(task.subscription_id)?;
        if let (
            TaskType::CreateContainer,
            StepResult::ContainerReady {
                container_ref,
                ip_address,
            },
        ) = (task.task_type, &result)
        {
            subscription.container_ref = Some(container_ref.clone());
            subscription.ip_address = Some(ip_address.clone());
            subscription.updated_at = now;
        }
        let subscription = subscription.clone();

        let planned = plan_followups(&subscription, &state.tasks_of(subscription.id));
        let enqueued = state.insert_all(planned, now);
        Ok(CompletionOutcome { task, enqueued })
    }

    async fn fail(
        &self,
        task_id: Uuid,
        worker_id: &str,
        error: &str,
        disposition: FailureDisposition,
    ) -> Result<ProvisioningTask> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let task = state.task_mut(task_id)?;
        ensure_held(task, worker_id, &[TaskState::Running])?;
        let event = match disposition {
            FailureDisposition::Retry { next_retry_at } => TaskEvent::Retry {
                error: error.to_string(),
                next_retry_at,
            },
            FailureDisposition::Permanent => TaskEvent::Fail {
                error: error.to_string(),
            },
        };
        TaskStateMachine::apply(task, event, now)?;
        Ok(task.clone())
    }

    async fn cancel(
        &self,
        task_id: Uuid,
        worker_id: &str,
        reason: &str,
    ) -> Result<ProvisioningTask> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let task = state.task_mut(task_id)?;
        ensure_held(task, worker_id, &[TaskState::Claimed, TaskState::Running])?;
        TaskStateMachine::apply(
            task,
            TaskEvent::Cancel {
                reason: reason.to_string(),
            },
            now,
        )?;
        Ok(task.clone())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<ProvisioningTask>> {
        Ok(self.state.lock().task(task_id).ok().cloned())
    }

    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<CloudPodSubscription>> {
        Ok(self
            .state
            .lock()
            .subscriptions
            .get(&subscription_id)
            .cloned())
    }

    async fn list_by_subscription(&self, subscription_id: Uuid) -> Result<Vec<ProvisioningTask>> {
        Ok(self.state.lock().tasks_of(subscription_id))
    }

    async fn request_deprovision(
        &self,
        subscription_id: Uuid,
        reason: &str,
        max_attempts: i32,
    ) -> Result<DeprovisionOutcome> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let subscription = state.subscription_mut(subscription_id)?.clone();
        let tasks = state.tasks_of(subscription_id);

        if subscription.status.is_tearing_down() {
            if let Some(existing) = latest_of_type(&tasks, TaskType::Deprovision) {
                return Ok(DeprovisionOutcome {
                    subscription,
                    cancelled: Vec::new(),
                    deprovision_task: existing.clone(),
                });
            }
        }

        let mut cancelled = Vec::new();
        for task in state
            .tasks
            .iter_mut()
            .filter(|t| t.subscription_id == subscription_id && t.status.is_queued())
        {
            TaskStateMachine::apply(
                task,
                TaskEvent::Cancel {
                    reason: format!("deprovision requested: {reason}"),
                },
                now,
            )?;
            cancelled.push(task.id);
        }

        let subscription = state.subscription_mut(subscription_id)?;
        subscription.status = SubscriptionStatus::Deprovisioning;
        subscription.updated_at = now;
        let subscription = subscription.clone();

        let generation = latest_of_type(&tasks, TaskType::Deprovision)
            .map_or(1, |t| t.generation + 1);
        let new = NewProvisioningTask::new(
            subscription_id,
            TaskPayload::Deprovision {
                reason: reason.to_string(),
            },
            max_attempts,
        )
        .with_generation(generation);
        let key = new.idempotency_key();
        let deprovision_task = match state.insert(new, now) {
            Some(task) => task,
            None => state.task(state.keys[&key])?.clone(),
        };

        Ok(DeprovisionOutcome {
            subscription,
            cancelled,
            deprovision_task,
        })
    }

    async fn suspend(&self, subscription_id: Uuid) -> Result<CloudPodSubscription> {
        let mut state = self.state.lock();
        let subscription = state.subscription_mut(subscription_id)?;
        if subscription.status.is_tearing_down() {
            return Err(ProvisioningError::InvalidState(format!(
                "subscription {subscription_id} is {}",
                subscription.status
            )));
        }
        subscription.status = SubscriptionStatus::Suspended;
        subscription.updated_at = Utc::now();
        Ok(subscription.clone())
    }

    async fn resume(&self, subscription_id: Uuid) -> Result<CloudPodSubscription> {
        let mut state = self.state.lock();
        let subscription = state.subscription_mut(subscription_id)?;
        if subscription.status != SubscriptionStatus::Suspended {
            return Err(ProvisioningError::InvalidState(format!(
                "subscription {subscription_id} is {}, not suspended",
                subscription.status
            )));
        }
        subscription.status = SubscriptionStatus::Provisioning;
        subscription.updated_at = Utc::now();
        Ok(subscription.clone())
    }

    async fn apply_aggregate(
        &self,
        subscription_id: Uuid,
        decide: &AggregateDecision,
    ) -> Result<AggregateOutcome> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let snapshot = state.subscription_mut(subscription_id)?.clone();
        let tasks = state.tasks_of(subscription_id);
        let update = decide(&snapshot, &tasks);

        let enqueued = state.insert_all(update.enqueue, now);
        let subscription = state.subscription_mut(subscription_id)?;
        if let Some(status) = update.status.filter(|s| *s != subscription.status) {
            subscription.status = status;
            subscription.updated_at = now;
            if status == SubscriptionStatus::Active && subscription.activated_at.is_none() {
                subscription.activated_at = Some(now);
            }
        }

        Ok(AggregateOutcome {
            previous_status: snapshot.status,
            subscription: subscription.clone(),
            enqueued,
            reason: update.reason,
        })
    }

    async fn queue_depth(&self) -> Result<Vec<QueueDepth>> {
        let state = self.state.lock();
        let mut buckets: BTreeMap<(TaskType, &'static str), (TaskState, i64)> = BTreeMap::new();
        for task in &state.tasks {
            buckets
                .entry((task.task_type, task.status.as_str()))
                .or_insert((task.status, 0))
                .1 += 1;
        }
        Ok(buckets
            .into_iter()
            .map(|((task_type, _), (status, count))| QueueDepth {
                task_type,
                status,
                count,
            })
            .collect())
    }

    async fn admin_retry(&self, task_id: Uuid) -> Result<ProvisioningTask> {
        let mut state = self.state.lock();
        let task = state.task(task_id)?.clone();
        let subscription = state
            .subscriptions
            .get(&task.subscription_id)
            .cloned()
            .ok_or_else(|| ProvisioningError::subscription_not_found(task.subscription_id))?;
        let siblings = state.tasks_of(task.subscription_id);
        let next = next_generation(&task, &subscription, &siblings)?;
        state.insert(next, Utc::now()).ok_or_else(|| {
            ProvisioningError::InvalidState(format!("retry of task {task_id} already exists"))
        })
    }

    async fn admin_cancel(&self, task_id: Uuid, reason: &str) -> Result<ProvisioningTask> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let task = state.task_mut(task_id)?;
        TaskStateMachine::apply(
            task,
            TaskEvent::AdminCancel {
                reason: reason.to_string(),
            },
            now,
        )?;
        Ok(task.clone())
    }
}
