//! # PostgreSQL Provisioning Store
//!
//! ## Claiming
//!
//! A claim selects the oldest claimable candidate (skipping `(subscription, type)` pairs that
//! already hold a live lease) and then writes the claim with a compare-and-set on `version`:
//!
//! ```sql
//! UPDATE provisioning_tasks SET status = 'claimed', ..., version = version + 1
//! WHERE id = $1 AND version = $2
//! ```
//!
//! Zero affected rows means another worker won; the claim engine retries selection.
//!
//! ## Other writes
//!
//! Short transactions over `SELECT ... FOR UPDATE`. When both are needed, the subscription
//! row is locked before any of its task rows. No transaction spans an adapter call.
//!
//! ## Leases
//!
//! Lease deadlines are granted and checked against the database clock (`NOW()`), so workers
//! with skewed clocks agree on which leases are live.

use super::{
    ensure_held, lease_deadline, next_generation, AggregateDecision, AggregateOutcome,
    ClaimAttempt, CompletionOutcome, DeprovisionOutcome, FailureDisposition, ProvisioningStore,
    QueueDepth,
};
use crate::error::{ProvisioningError, Result};
use crate::models::{
    CloudPodSubscription, IdempotencyKey, NewProvisioningTask, ProvisioningTask, StepResult,
    SubscriptionStatus, TaskPayload, TaskType,
};
use crate::orchestration::dependency_graph::{latest_of_type, plan_followups};
use crate::state_machine::{StateMachineError, TaskEvent, TaskState, TaskStateMachine};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgExecutor, PgPool};
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

macro_rules! task_columns {
    () => {
        "id, subscription_id, task_type, scope, generation, status, payload, result, \
         idempotency_key, worker_id, lease_expires_at, last_heartbeat_at, attempts, \
         max_attempts, next_retry_at, last_error, version, created_at, updated_at, completed_at"
    };
}

macro_rules! subscription_columns {
    () => {
        "id, customer_id, plan_code, domain, status, container_ref, ip_address, \
         created_at, updated_at, activated_at"
    };
}

#[derive(Debug, FromRow)]
struct TaskRow {
    id: Uuid,
    subscription_id: Uuid,
    task_type: String,
    scope: String,
    generation: i32,
    status: String,
    payload: Json<TaskPayload>,
    result: Option<Json<StepResult>>,
    idempotency_key: Uuid,
    worker_id: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    attempts: i32,
    max_attempts: i32,
    next_retry_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TaskRow {
    /// Convert to the domain model, returning the row version alongside
    fn into_task(self) -> Result<(ProvisioningTask, i64)> {
        let task_type = self
            .task_type
            .parse::<TaskType>()
            .map_err(StateMachineError::InvalidStoredState)?;
        let status = self
            .status
            .parse::<TaskState>()
            .map_err(StateMachineError::InvalidStoredState)?;

        Ok((
            ProvisioningTask {
                id: self.id,
                subscription_id: self.subscription_id,
                task_type,
                scope: self.scope,
                generation: self.generation,
                status,
                payload: self.payload.0,
                result: self.result.map(|r| r.0),
                idempotency_key: IdempotencyKey::from_uuid(self.idempotency_key),
                worker_id: self.worker_id,
                lease_expires_at: self.lease_expires_at,
                last_heartbeat_at: self.last_heartbeat_at,
                attempts: self.attempts,
                max_attempts: self.max_attempts,
                next_retry_at: self.next_retry_at,
                last_error: self.last_error,
                created_at: self.created_at,
                updated_at: self.updated_at,
                completed_at: self.completed_at,
            },
            self.version,
        ))
    }
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: Uuid,
    customer_id: String,
    plan_code: String,
    domain: Option<String>,
    status: String,
    container_ref: Option<String>,
    ip_address: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    activated_at: Option<DateTime<Utc>>,
}

impl TryFrom<SubscriptionRow> for CloudPodSubscription {
    type Error = ProvisioningError;

    fn try_from(row: SubscriptionRow) -> Result<Self> {
        let status = row
            .status
            .parse::<SubscriptionStatus>()
            .map_err(StateMachineError::InvalidStoredState)?;
        Ok(CloudPodSubscription {
            id: row.id,
            customer_id: row.customer_id,
            plan_code: row.plan_code,
            domain: row.domain,
            status,
            container_ref: row.container_ref,
            ip_address: row.ip_address,
            created_at: row.created_at,
            updated_at: row.updated_at,
            activated_at: row.activated_at,
        })
    }
}

/// PostgreSQL-backed [`ProvisioningStore`]
#[derive(Debug, Clone)]
pub struct PgProvisioningStore {
    pool: PgPool,
}

impl PgProvisioningStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Current time on the database server
async fn database_now<'e>(executor: impl PgExecutor<'e>) -> Result<DateTime<Utc>> {
    Ok(sqlx::query_scalar::<_, DateTime<Utc>>("SELECT NOW()")
        .fetch_one(executor)
        .await?)
}

async fn insert_task(conn: &mut PgConnection, task: &ProvisioningTask) -> Result<bool> {
    let inserted = sqlx::query(concat!(
        "INSERT INTO provisioning_tasks (",
        task_columns!(),
        ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, 0, \
         $17, $18, $19) ON CONFLICT DO NOTHING"
    ))
    .bind(task.id)
    .bind(task.subscription_id)
    .bind(task.task_type.as_str())
    .bind(&task.scope)
    .bind(task.generation)
    .bind(task.status.as_str())
    .bind(Json(&task.payload))
    .bind(task.result.as_ref().map(Json))
    .bind(task.idempotency_key.as_uuid())
    .bind(&task.worker_id)
    .bind(task.lease_expires_at)
    .bind(task.last_heartbeat_at)
    .bind(task.attempts)
    .bind(task.max_attempts)
    .bind(task.next_retry_at)
    .bind(&task.last_error)
    .bind(task.created_at)
    .bind(task.updated_at)
    .bind(task.completed_at)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(inserted == 1)
}

/// Insert planned tasks, skipping keys that already exist
async fn insert_all(
    conn: &mut PgConnection,
    planned: Vec<NewProvisioningTask>,
    now: DateTime<Utc>,
) -> Result<Vec<ProvisioningTask>> {
    let mut inserted = Vec::with_capacity(planned.len());
    for new in planned {
        let task = new.into_task(now);
        if insert_task(conn, &task).await? {
            inserted.push(task);
        }
    }
    Ok(inserted)
}

/// Persist every mutable column. With `expected_version`, the write is a compare-and-set.
async fn write_task(
    conn: &mut PgConnection,
    task: &ProvisioningTask,
    expected_version: Option<i64>,
) -> Result<bool> {
    let affected = sqlx::query(
        "UPDATE provisioning_tasks SET status = $2, result = $3, worker_id = $4, \
         lease_expires_at = $5, last_heartbeat_at = $6, attempts = $7, next_retry_at = $8, \
         last_error = $9, updated_at = $10, completed_at = $11, version = version + 1 \
         WHERE id = $1 AND ($12::BIGINT IS NULL OR version = $12)",
    )
    .bind(task.id)
    .bind(task.status.as_str())
    .bind(task.result.as_ref().map(Json))
    .bind(&task.worker_id)
    .bind(task.lease_expires_at)
    .bind(task.last_heartbeat_at)
    .bind(task.attempts)
    .bind(task.next_retry_at)
    .bind(&task.last_error)
    .bind(task.updated_at)
    .bind(task.completed_at)
    .bind(expected_version)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

async fn lock_task(conn: &mut PgConnection, task_id: Uuid) -> Result<ProvisioningTask> {
    let row = sqlx::query_as::<_, TaskRow>(concat!(
        "SELECT ",
        task_columns!(),
        " FROM provisioning_tasks WHERE id = $1 FOR UPDATE"
    ))
    .bind(task_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| ProvisioningError::task_not_found(task_id))?;
    Ok(row.into_task()?.0)
}

async fn lock_subscription(
    conn: &mut PgConnection,
    subscription_id: Uuid,
) -> Result<CloudPodSubscription> {
    sqlx::query_as::<_, SubscriptionRow>(concat!(
        "SELECT ",
        subscription_columns!(),
        " FROM cloud_pod_subscriptions WHERE id = $1 FOR UPDATE"
    ))
    .bind(subscription_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| ProvisioningError::subscription_not_found(subscription_id))?
    .try_into()
}

async fn write_subscription(
    conn: &mut PgConnection,
    subscription: &CloudPodSubscription,
) -> Result<()> {
    sqlx::query(
        "UPDATE cloud_pod_subscriptions SET status = $2, container_ref = $3, ip_address = $4, \
         updated_at = $5, activated_at = $6 WHERE id = $1",
    )
    .bind(subscription.id)
    .bind(subscription.status.as_str())
    .bind(&subscription.container_ref)
    .bind(&subscription.ip_address)
    .bind(subscription.updated_at)
    .bind(subscription.activated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn tasks_of(conn: &mut PgConnection, subscription_id: Uuid) -> Result<Vec<ProvisioningTask>> {
    sqlx::query_as::<_, TaskRow>(concat!(
        "SELECT ",
        task_columns!(),
        " FROM provisioning_tasks WHERE subscription_id = $1 ORDER BY created_at, id"
    ))
    .bind(subscription_id)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(|row| row.into_task().map(|(task, _)| task))
    .collect()
}

#[async_trait]
impl ProvisioningStore for PgProvisioningStore {
    #[instrument(skip(self, subscription, seed), fields(subscription_id = %subscription.id))]
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
        let mut tx = self.pool.begin().await?;

        sqlx::query(concat!(
            "INSERT INTO cloud_pod_subscriptions (",
            subscription_columns!(),
            ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(subscription.id)
        .bind(&subscription.customer_id)
        .bind(&subscription.plan_code)
        .bind(&subscription.domain)
        .bind(subscription.status.as_str())
        .bind(&subscription.container_ref)
        .bind(&subscription.ip_address)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .bind(subscription.activated_at)
        .execute(&mut *tx)
        .await?;

        let task = seed.into_task(Utc::now());
        if !insert_task(&mut tx, &task).await? {
            return Err(ProvisioningError::ValidationError(
                "seed task already exists".to_string(),
            ));
        }
        tx.commit().await?;

        Ok((subscription, task))
    }

    async fn enqueue(&self, task: NewProvisioningTask) -> Result<ProvisioningTask> {
        let key = task.idempotency_key();
        let mut conn = self.pool.acquire().await?;
        let task = task.into_task(Utc::now());
        if insert_task(&mut conn, &task).await? {
            return Ok(task);
        }

        let row = sqlx::query_as::<_, TaskRow>(concat!(
            "SELECT ",
            task_columns!(),
            " FROM provisioning_tasks WHERE idempotency_key = $1"
        ))
        .bind(key.as_uuid())
        .fetch_one(&mut *conn)
        .await?;
        Ok(row.into_task()?.0)
    }

    #[instrument(skip(self))]
    async fn release_expired_leases(&self) -> Result<Vec<ProvisioningTask>> {
        let mut tx = self.pool.begin().await?;
        let now = database_now(&mut *tx).await?;

        let rows = sqlx::query_as::<_, TaskRow>(concat!(
            "SELECT ",
            task_columns!(),
            " FROM provisioning_tasks WHERE status IN ('claimed', 'running') \
              AND (lease_expires_at IS NULL OR lease_expires_at <= $1) \
              FOR UPDATE SKIP LOCKED"
        ))
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut released = Vec::with_capacity(rows.len());
        for row in rows {
            let (mut task, _) = row.into_task()?;
            TaskStateMachine::apply(&mut task, TaskEvent::LeaseExpired, now)?;
            write_task(&mut tx, &task, None).await?;
            released.push(task);
        }
        tx.commit().await?;

        if !released.is_empty() {
            debug!(count = released.len(), "Released expired leases");
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
        let types: Vec<&str> = capabilities.iter().map(TaskType::as_str).collect();
        let mut conn = self.pool.acquire().await?;
        let now = database_now(&mut *conn).await?;
        let lease_expires_at = lease_deadline(now, lease)?;

        let candidate = sqlx::query_as::<_, TaskRow>(concat!(
            "SELECT ",
            task_columns!(),
            " FROM provisioning_tasks t \
              WHERE t.task_type = ANY($1) \
                AND (t.status = 'pending' \
                     OR (t.status = 'retrying' AND (t.next_retry_at IS NULL OR t.next_retry_at <= $2))) \
                AND NOT EXISTS ( \
                    SELECT 1 FROM provisioning_tasks o \
                    WHERE o.subscription_id = t.subscription_id \
                      AND o.id <> t.id \
                      AND o.status IN ('claimed', 'running') \
                      AND o.lease_expires_at > $2 \
                      AND (o.task_type = t.task_type OR t.task_type = 'deprovision')) \
              ORDER BY t.created_at, t.id \
              LIMIT 1"
        ))
        .bind(&types[..])
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = candidate else {
            return Ok(ClaimAttempt::Empty);
        };
        let (mut task, version) = row.into_task()?;
        TaskStateMachine::apply(
            &mut task,
            TaskEvent::Claim {
                worker_id: worker_id.to_string(),
                lease_expires_at,
            },
            now,
        )?;

        if write_task(&mut conn, &task, Some(version)).await? {
            debug!(task_id = %task.id, task_type = %task.task_type, "Claimed task");
            Ok(ClaimAttempt::Claimed(task))
        } else {
            debug!(task_id = %task.id, "Lost claim race");
            Ok(ClaimAttempt::Contended)
        }
    }

    async fn mark_running(
        &self,
        task_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<ProvisioningTask> {
        let mut tx = self.pool.begin().await?;
        let now = database_now(&mut *tx).await?;
        let lease_expires_at = lease_deadline(now, lease)?;
        let mut task = lock_task(&mut tx, task_id).await?;
        ensure_held(&task, worker_id, &[TaskState::Claimed])?;
        TaskStateMachine::apply(&mut task, TaskEvent::Start { lease_expires_at }, now)?;
        write_task(&mut tx, &task, None).await?;
        tx.commit().await?;
        Ok(task)
    }

    async fn heartbeat(&self, task_id: Uuid, worker_id: &str, lease: Duration) -> Result<bool> {
        let now = database_now(&self.pool).await?;
        let lease_expires_at = lease_deadline(now, lease)?;
        let affected = sqlx::query(
            "UPDATE provisioning_tasks \
             SET lease_expires_at = $3, last_heartbeat_at = $4, updated_at = $4, \
                 version = version + 1 \
             WHERE id = $1 AND worker_id = $2 AND status IN ('claimed', 'running') \
               AND lease_expires_at > $4",
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(lease_expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    #[instrument(skip(self, result))]
    async fn complete(
        &self,
        task_id: Uuid,
        worker_id: &str,
        result: StepResult,
    ) -> Result<CompletionOutcome> {
        let now = Utc::now();
        let subscription_id = self
            .get_task(task_id)
            .await?
            .ok_or_else(|| ProvisioningError::task_not_found(task_id))?
            .subscription_id;

        let mut tx = self.pool.begin().await?;
        let mut subscription = lock_subscription(&mut tx, subscription_id).await?;
        let mut task = lock_task(&mut tx, task_id).await?;
        ensure_held(&task, worker_id, &[TaskState::Running])?;
        TaskStateMachine::apply(
            &mut task,
            TaskEvent::Complete {
                result: result.clone(),
            },
            now,
        )?;
        write_task(&mut tx, &task, None).await?;

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
            write_subscription(&mut tx, &subscription).await?;
        }

        let siblings = tasks_of(&mut tx, subscription_id).await?;
        let planned = plan_followups(&subscription, &siblings);
        let enqueued = insert_all(&mut tx, planned, now).await?;
        tx.commit().await?;

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
        let mut tx = self.pool.begin().await?;
        let mut task = lock_task(&mut tx, task_id).await?;
        ensure_held(&task, worker_id, &[TaskState::Running])?;
        let event = match disposition {
            FailureDisposition::Retry { next_retry_at } => TaskEvent::Retry {
                error: error.to_string(),
                next_retry_at,
            },
            FailureDisposition::Permanent => TaskEvent::Fail {
                error: error.to_string(),
            },
        };
        TaskStateMachine::apply(&mut task, event, now)?;
        write_task(&mut tx, &task, None).await?;
        tx.commit().await?;
        Ok(task)
    }

    async fn cancel(
        &self,
        task_id: Uuid,
        worker_id: &str,
        reason: &str,
    ) -> Result<ProvisioningTask> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut task = lock_task(&mut tx, task_id).await?;
        ensure_held(&task, worker_id, &[TaskState::Claimed, TaskState::Running])?;
        TaskStateMachine::apply(
            &mut task,
            TaskEvent::Cancel {
                reason: reason.to_string(),
            },
            now,
        )?;
        write_task(&mut tx, &task, None).await?;
        tx.commit().await?;
        Ok(task)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<ProvisioningTask>> {
        sqlx::query_as::<_, TaskRow>(concat!(
            "SELECT ",
            task_columns!(),
            " FROM provisioning_tasks WHERE id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row.into_task().map(|(task, _)| task))
        .transpose()
    }

    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<CloudPodSubscription>> {
        sqlx::query_as::<_, SubscriptionRow>(concat!(
            "SELECT ",
            subscription_columns!(),
            " FROM cloud_pod_subscriptions WHERE id = $1"
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?
        .map(CloudPodSubscription::try_from)
        .transpose()
    }

    async fn list_by_subscription(&self, subscription_id: Uuid) -> Result<Vec<ProvisioningTask>> {
        let mut conn = self.pool.acquire().await?;
        tasks_of(&mut conn, subscription_id).await
    }

    #[instrument(skip(self))]
    async fn request_deprovision(
        &self,
        subscription_id: Uuid,
        reason: &str,
        max_attempts: i32,
    ) -> Result<DeprovisionOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut subscription = lock_subscription(&mut tx, subscription_id).await?;
        let tasks = tasks_of(&mut tx, subscription_id).await?;

        if subscription.status.is_tearing_down() {
            if let Some(existing) = latest_of_type(&tasks, TaskType::Deprovision) {
                let existing = existing.clone();
                tx.commit().await?;
                return Ok(DeprovisionOutcome {
                    subscription,
                    cancelled: Vec::new(),
                    deprovision_task: existing,
                });
            }
        }

        let mut cancelled = Vec::new();
        for task in tasks.iter().filter(|t| t.status.is_queued()) {
            let mut task = lock_task(&mut tx, task.id).await?;
            if !task.status.is_queued() {
                continue;
            }
            TaskStateMachine::apply(
                &mut task,
                TaskEvent::Cancel {
                    reason: format!("deprovision requested: {reason}"),
                },
                now,
            )?;
            write_task(&mut tx, &task, None).await?;
            cancelled.push(task.id);
        }

        subscription.status = SubscriptionStatus::Deprovisioning;
        subscription.updated_at = now;
        write_subscription(&mut tx, &subscription).await?;

        let generation =
            latest_of_type(&tasks, TaskType::Deprovision).map_or(1, |t| t.generation + 1);
        let deprovision_task = NewProvisioningTask::new(
            subscription_id,
            TaskPayload::Deprovision {
                reason: reason.to_string(),
            },
            max_attempts,
        )
        .with_generation(generation)
        .into_task(now);
        if !insert_task(&mut tx, &deprovision_task).await? {
            return Err(ProvisioningError::InvalidState(format!(
                "deprovision generation {generation} already exists for {subscription_id}"
            )));
        }
        tx.commit().await?;

        Ok(DeprovisionOutcome {
            subscription,
            cancelled,
            deprovision_task,
        })
    }

    async fn suspend(&self, subscription_id: Uuid) -> Result<CloudPodSubscription> {
        let mut tx = self.pool.begin().await?;
        let mut subscription = lock_subscription(&mut tx, subscription_id).await?;
        if subscription.status.is_tearing_down() {
            return Err(ProvisioningError::InvalidState(format!(
                "subscription {subscription_id} is {}",
                subscription.status
            )));
        }
        subscription.status = SubscriptionStatus::Suspended;
        subscription.updated_at = Utc::now();
        write_subscription(&mut tx, &subscription).await?;
        tx.commit().await?;
        Ok(subscription)
    }

    async fn resume(&self, subscription_id: Uuid) -> Result<CloudPodSubscription> {
        let mut tx = self.pool.begin().await?;
        let mut subscription = lock_subscription(&mut tx, subscription_id).await?;
        if subscription.status != SubscriptionStatus::Suspended {
            return Err(ProvisioningError::InvalidState(format!(
                "subscription {subscription_id} is {}, not suspended",
                subscription.status
            )));
        }
        subscription.status = SubscriptionStatus::Provisioning;
        subscription.updated_at = Utc::now();
        write_subscription(&mut tx, &subscription).await?;
        tx.commit().await?;
        Ok(subscription)
    }

    #[instrument(skip(self, decide))]
    async fn apply_aggregate(
        &self,
        subscription_id: Uuid,
        decide: &AggregateDecision,
    ) -> Result<AggregateOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut subscription = lock_subscription(&mut tx, subscription_id).await?;
        let previous_status = subscription.status;
        let tasks = tasks_of(&mut tx, subscription_id).await?;
        let update = decide(&subscription, &tasks);

        let enqueued = insert_all(&mut tx, update.enqueue, now).await?;
        if let Some(status) = update.status.filter(|s| *s != subscription.status) {
            subscription.status = status;
            subscription.updated_at = now;
            if status == SubscriptionStatus::Active && subscription.activated_at.is_none() {
                subscription.activated_at = Some(now);
            }
            write_subscription(&mut tx, &subscription).await?;
        }
        tx.commit().await?;

        Ok(AggregateOutcome {
            previous_status,
            subscription,
            enqueued,
            reason: update.reason,
        })
    }

    async fn queue_depth(&self) -> Result<Vec<QueueDepth>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT task_type, status, COUNT(*) FROM provisioning_tasks \
             GROUP BY task_type, status ORDER BY task_type, status",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(task_type, status, count)| {
                Ok(QueueDepth {
                    task_type: task_type
                        .parse()
                        .map_err(StateMachineError::InvalidStoredState)?,
                    status: status
                        .parse()
                        .map_err(StateMachineError::InvalidStoredState)?,
                    count,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn admin_retry(&self, task_id: Uuid) -> Result<ProvisioningTask> {
        let subscription_id = self
            .get_task(task_id)
            .await?
            .ok_or_else(|| ProvisioningError::task_not_found(task_id))?
            .subscription_id;

        let mut tx = self.pool.begin().await?;
        let subscription = lock_subscription(&mut tx, subscription_id).await?;
        let task = lock_task(&mut tx, task_id).await?;
        let siblings = tasks_of(&mut tx, subscription_id).await?;
        let next = next_generation(&task, &subscription, &siblings)?.into_task(Utc::now());
        if !insert_task(&mut tx, &next).await? {
            return Err(ProvisioningError::InvalidState(format!(
                "retry of task {task_id} already exists"
            )));
        }
        tx.commit().await?;
        Ok(next)
    }

    #[instrument(skip(self))]
    async fn admin_cancel(&self, task_id: Uuid, reason: &str) -> Result<ProvisioningTask> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut task = lock_task(&mut tx, task_id).await?;
        TaskStateMachine::apply(
            &mut task,
            TaskEvent::AdminCancel {
                reason: reason.to_string(),
            },
            now,
        )?;
        write_task(&mut tx, &task, None).await?;
        tx.commit().await?;
        Ok(task)
    }
}

