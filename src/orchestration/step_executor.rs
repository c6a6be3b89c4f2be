//! # Step Executor
//!
//! Runs one claimed task against the infrastructure adapters and records the outcome.
//!
//! ## Execution Flow
//!
//! 1. Re-read the subscription; tasks of a subscription being torn down are cancelled
//!    instead of executed (DEPROVISION itself excepted).
//! 2. `CLAIMED -> RUNNING`.
//! 3. Call the adapter under the step's timeout while a heartbeat keeps the lease alive.
//!    A timeout is an ambiguous outcome.
//! 4. Ambiguous outcomes are re-queried by idempotency key before any status write.
//! 5. Success completes the task (enqueueing dependents in the same write); failures are
//!    classified into a retry with backoff or a terminal failure.
//! 6. The subscription aggregator re-derives the subscription status.
//!
//! Adapter errors never escape this module; they always become a task transition. No store
//! transaction is open while an adapter call is in flight.

use super::aggregator::SubscriptionAggregator;
use super::dependency_graph::latest_of_type;
use super::error_classifier::ErrorClassifier;
use crate::adapters::{AdapterError, AdapterResult, Adapters, PermanentKind};
use crate::config::{ProvisionerConfig, StepTimeouts};
use crate::error::{ProvisioningError, Result};
use crate::logging::{log_adapter_operation, log_task_operation};
use crate::models::{
    CloudPodSubscription, IdempotencyKey, ProvisioningTask, StepResult, TaskPayload, TaskType,
};
use crate::state_machine::TaskState;
use crate::store::{FailureDisposition, ProvisioningStore};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for step execution
#[derive(Debug, Clone)]
pub struct StepExecutorConfig {
    /// Lease extension granted by each heartbeat
    pub lease_duration: Duration,
    pub heartbeat_interval: Duration,
    pub timeouts: StepTimeouts,
}

impl Default for StepExecutorConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(240),
            heartbeat_interval: Duration::from_secs(60),
            timeouts: StepTimeouts::default(),
        }
    }
}

impl StepExecutorConfig {
    pub fn from_config(config: &ProvisionerConfig) -> Self {
        Self {
            lease_duration: config.worker.lease_duration(),
            heartbeat_interval: config.worker.heartbeat_interval(),
            timeouts: config.execution.step_timeouts.clone(),
        }
    }
}

/// What happened to a claimed task
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed { result: StepResult },
    Retrying { next_retry_at: DateTime<Utc> },
    Failed { error: String },
    /// The subscription is being torn down
    Cancelled,
    /// Another worker took the task over; this worker's write was discarded
    LeaseLost,
}

/// Everything DEPROVISION needs, gathered before the adapter calls start
#[derive(Debug, Clone, Default)]
struct TeardownPlan {
    domain: Option<String>,
    mail_domain: Option<String>,
    container_ref: Option<String>,
    create_keys: Vec<IdempotencyKey>,
}

pub struct StepExecutor {
    store: Arc<dyn ProvisioningStore>,
    adapters: Adapters,
    aggregator: SubscriptionAggregator,
    classifier: ErrorClassifier,
    config: StepExecutorConfig,
}

impl StepExecutor {
    pub fn new(
        store: Arc<dyn ProvisioningStore>,
        adapters: Adapters,
        aggregator: SubscriptionAggregator,
        classifier: ErrorClassifier,
        config: StepExecutorConfig,
    ) -> Self {
        Self {
            store,
            adapters,
            aggregator,
            classifier,
            config,
        }
    }

    pub fn config(&self) -> &StepExecutorConfig {
        &self.config
    }

    pub fn aggregator(&self) -> &SubscriptionAggregator {
        &self.aggregator
    }

    /// Execute a task claimed by `worker_id` through to a recorded outcome
    #[instrument(
        skip(self, task),
        fields(task_id = %task.id, task_type = %task.task_type, attempt = task.attempts + 1)
    )]
    pub async fn execute(
        &self,
        task: ProvisioningTask,
        worker_id: &str,
    ) -> Result<ExecutionOutcome> {
        let subscription = self
            .store
            .get_subscription(task.subscription_id)
            .await?
            .ok_or_else(|| ProvisioningError::subscription_not_found(task.subscription_id))?;

        if subscription.status.is_tearing_down() && task.task_type != TaskType::Deprovision {
            let reason = format!("subscription is {}", subscription.status);
            let outcome = match self.store.cancel(task.id, worker_id, &reason).await {
                Ok(cancelled) => {
                    log_task_operation(
                        "cancel",
                        cancelled.id,
                        cancelled.subscription_id,
                        cancelled.task_type.as_str(),
                        cancelled.status.as_str(),
                        Some(&reason),
                    );
                    ExecutionOutcome::Cancelled
                }
                Err(e) if e.is_lease_lost() => return Ok(ExecutionOutcome::LeaseLost),
                Err(e) => return Err(e),
            };
            self.reconcile(task.subscription_id).await;
            return Ok(outcome);
        }

        let task = match self
            .store
            .mark_running(task.id, worker_id, self.config.lease_duration)
            .await
        {
            Ok(task) => task,
            Err(e) if e.is_lease_lost() => {
                warn!("Lease lost before execution started");
                return Ok(ExecutionOutcome::LeaseLost);
            }
            Err(e) => return Err(e),
        };

        let teardown = if task.task_type == TaskType::Deprovision {
            Some(self.teardown_plan(&subscription).await?)
        } else {
            None
        };

        let started = Instant::now();
        let limit = self.config.timeouts.for_payload(&task.payload);
        let call = self.perform(&task, teardown.as_ref());
        let mut outcome = self.call_with_heartbeat(&task, worker_id, limit, call).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if let Err(error) = &outcome {
            log_adapter_operation(
                task.task_type.as_str(),
                "execute",
                task.id,
                "error",
                Some(elapsed_ms),
                Some(&error.to_string()),
            );
            if error.is_ambiguous() {
                if let Some(result) = self.verify(&task).await {
                    info!("Ambiguous outcome resolved by re-query: step already applied");
                    outcome = Ok(result);
                }
            }
        } else {
            log_adapter_operation(
                task.task_type.as_str(),
                "execute",
                task.id,
                "ok",
                Some(elapsed_ms),
                None,
            );
        }

        let recorded = match outcome {
            Ok(result) => self.record_success(&task, worker_id, result).await,
            Err(error) => self.record_failure(&task, worker_id, &error).await,
        };

        match recorded {
            Ok(outcome) => {
                self.reconcile(task.subscription_id).await;
                Ok(outcome)
            }
            Err(e) if e.is_lease_lost() => {
                warn!("Lease lost during execution; result discarded");
                Ok(ExecutionOutcome::LeaseLost)
            }
            Err(e) => Err(e),
        }
    }

    async fn record_success(
        &self,
        task: &ProvisioningTask,
        worker_id: &str,
        result: StepResult,
    ) -> Result<ExecutionOutcome> {
        let completion = self.store.complete(task.id, worker_id, result.clone()).await?;
        log_task_operation(
            "complete",
            task.id,
            task.subscription_id,
            task.task_type.as_str(),
            completion.task.status.as_str(),
            None,
        );
        for child in &completion.enqueued {
            debug!(child_id = %child.id, child_type = %child.task_type, "Enqueued dependent");
        }
        Ok(ExecutionOutcome::Completed { result })
    }

    async fn record_failure(
        &self,
        task: &ProvisioningTask,
        worker_id: &str,
        error: &AdapterError,
    ) -> Result<ExecutionOutcome> {
        let classification = self
            .classifier
            .classify(error, task.attempts, task.max_attempts);

        let disposition = match classification.retry_delay {
            Some(delay) if classification.is_retryable => FailureDisposition::Retry {
                next_retry_at: Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
            },
            _ => FailureDisposition::Permanent,
        };

        let failed = self
            .store
            .fail(task.id, worker_id, &classification.error_message, disposition)
            .await?;
        log_task_operation(
            "fail",
            failed.id,
            failed.subscription_id,
            failed.task_type.as_str(),
            failed.status.as_str(),
            Some(&format!(
                "{} ({})",
                classification.error_message, classification.error_category
            )),
        );

        Ok(match (failed.status, failed.next_retry_at) {
            (TaskState::Retrying, Some(next_retry_at)) => {
                ExecutionOutcome::Retrying { next_retry_at }
            }
            _ => ExecutionOutcome::Failed {
                error: classification.error_message,
            },
        })
    }

    async fn reconcile(&self, subscription_id: uuid::Uuid) {
        if let Err(e) = self.aggregator.reconcile(subscription_id).await {
            warn!(
                subscription_id = %subscription_id,
                error = %e,
                "Subscription reconcile failed after task finalization"
            );
        }
    }

    /// Await `call` bounded by `limit`, extending the lease every heartbeat interval.
    ///
    /// A rejected heartbeat does not abort the call: the final write will be refused
    /// instead, and the idempotency key makes the takeover's repeat harmless.
    async fn call_with_heartbeat<T, F>(
        &self,
        task: &ProvisioningTask,
        worker_id: &str,
        limit: Duration,
        call: F,
    ) -> AdapterResult<T>
    where
        F: Future<Output = AdapterResult<T>>,
    {
        let call = tokio::time::timeout(limit, call);
        tokio::pin!(call);

        let period = self.config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                finished = &mut call => {
                    return match finished {
                        Ok(outcome) => outcome,
                        Err(_) => Err(AdapterError::ambiguous(format!(
                            "{} exceeded its {}ms timeout",
                            task.task_type,
                            limit.as_millis()
                        ))),
                    };
                }
                _ = ticker.tick() => {
                    match self
                        .store
                        .heartbeat(task.id, worker_id, self.config.lease_duration)
                        .await
                    {
                        Ok(true) => debug!("Heartbeat extended lease"),
                        Ok(false) => warn!("Heartbeat rejected; lease no longer held"),
                        Err(e) => warn!(error = %e, "Heartbeat failed"),
                    }
                }
            }
        }
    }

    async fn perform(
        &self,
        task: &ProvisioningTask,
        teardown: Option<&TeardownPlan>,
    ) -> AdapterResult<StepResult> {
        let payload = match &task.payload {
            TaskPayload::Remediate { target } if target.task_type().is_secondary() => {
                target.as_ref()
            }
            TaskPayload::Remediate { target } => {
                return Err(AdapterError::permanent(
                    PermanentKind::Validation,
                    format!("{} cannot be remediated", target.task_type()),
                ))
            }
            other => other,
        };
        let key = task.idempotency_key;

        match payload {
            TaskPayload::CreateContainer { container, .. } => {
                let handle = self.adapters.compute.clone_and_start(key, container).await?;
                Ok(StepResult::ContainerReady {
                    container_ref: handle.container_ref,
                    ip_address: handle.ip_address,
                })
            }
            TaskPayload::ConfigureDns { domain, ip_address } => {
                self.adapters
                    .dns
                    .ensure_zone_and_records(key, domain, ip_address)
                    .await?;
                Ok(StepResult::DnsConfigured {
                    domain: domain.clone(),
                    ip_address: ip_address.clone(),
                })
            }
            TaskPayload::SetupEmail { domain } => {
                self.adapters.mail.ensure_mailbox(key, domain).await?;
                Ok(StepResult::MailboxReady {
                    domain: domain.clone(),
                })
            }
            TaskPayload::SetupBackup {
                container_ref,
                tier,
            } => {
                self.adapters
                    .backup
                    .ensure_backup_schedule(key, container_ref, tier)
                    .await?;
                Ok(StepResult::BackupScheduled {
                    container_ref: container_ref.clone(),
                    tier: tier.clone(),
                })
            }
            TaskPayload::Activate { container_ref } => {
                self.adapters
                    .compute
                    .ensure_running(key, container_ref)
                    .await?;
                Ok(StepResult::Activated {
                    container_ref: container_ref.clone(),
                })
            }
            TaskPayload::Deprovision { .. } => {
                let plan = teardown.cloned().unwrap_or_default();
                self.tear_down(key, plan).await
            }
            TaskPayload::Remediate { .. } => Err(AdapterError::permanent(
                PermanentKind::Validation,
                "nested remediation",
            )),
        }
    }

    async fn teardown_plan(&self, subscription: &CloudPodSubscription) -> Result<TeardownPlan> {
        let tasks = self.store.list_by_subscription(subscription.id).await?;
        let mail_domain = latest_of_type(&tasks, TaskType::CreateContainer).and_then(|create| {
            match &create.payload {
                TaskPayload::CreateContainer { mail_domain, .. } => Some(mail_domain.clone()),
                _ => None,
            }
        });
        let create_keys = tasks
            .iter()
            .filter(|t| t.task_type == TaskType::CreateContainer)
            .map(|t| t.idempotency_key)
            .collect();

        Ok(TeardownPlan {
            domain: subscription.domain.clone(),
            mail_domain,
            container_ref: subscription.container_ref.clone(),
            create_keys,
        })
    }

    /// Idempotent teardown: every removal succeeds when the resource is already gone
    async fn tear_down(&self, key: IdempotencyKey, plan: TeardownPlan) -> AdapterResult<StepResult> {
        let mut removed = Vec::new();

        if let Some(domain) = &plan.domain {
            self.adapters.dns.remove_zone(key, domain).await?;
            removed.push(format!("dns:{domain}"));
        }
        if let Some(mail_domain) = &plan.mail_domain {
            self.adapters.mail.remove_mailbox(key, mail_domain).await?;
            removed.push(format!("mailbox:{mail_domain}"));
        }

        // Containers created by an in-flight or lost CREATE response are only findable by key
        let mut containers: BTreeSet<String> = plan.container_ref.into_iter().collect();
        for create_key in &plan.create_keys {
            if let Some(handle) = self.adapters.compute.find_container(*create_key).await? {
                containers.insert(handle.container_ref);
            }
        }

        for container_ref in containers {
            self.adapters
                .backup
                .remove_backup_schedule(key, &container_ref)
                .await?;
            self.adapters
                .compute
                .destroy_container(key, &container_ref)
                .await?;
            removed.push(format!("container:{container_ref}"));
        }

        Ok(StepResult::Deprovisioned { removed })
    }

    /// Re-query an ambiguous outcome. `Some` when the step's effect is confirmed present.
    async fn verify(&self, task: &ProvisioningTask) -> Option<StepResult> {
        let payload = task.payload.remediation_target().unwrap_or(&task.payload);
        let key = task.idempotency_key;

        let verified = match payload {
            TaskPayload::CreateContainer { .. } => {
                self.adapters.compute.find_container(key).await.map(|found| {
                    found.map(|handle| StepResult::ContainerReady {
                        container_ref: handle.container_ref,
                        ip_address: handle.ip_address,
                    })
                })
            }
            TaskPayload::ConfigureDns { domain, ip_address } => self
                .adapters
                .dns
                .records_present(domain, ip_address)
                .await
                .map(|present| {
                    present.then(|| StepResult::DnsConfigured {
                        domain: domain.clone(),
                        ip_address: ip_address.clone(),
                    })
                }),
            TaskPayload::SetupEmail { domain } => {
                self.adapters.mail.mailbox_present(domain).await.map(|present| {
                    present.then(|| StepResult::MailboxReady {
                        domain: domain.clone(),
                    })
                })
            }
            TaskPayload::SetupBackup {
                container_ref,
                tier,
            } => self
                .adapters
                .backup
                .schedule_present(container_ref)
                .await
                .map(|present| {
                    present.then(|| StepResult::BackupScheduled {
                        container_ref: container_ref.clone(),
                        tier: tier.clone(),
                    })
                }),
            // Re-running these is cheap and idempotent; retry instead of guessing
            TaskPayload::Activate { .. }
            | TaskPayload::Deprovision { .. }
            | TaskPayload::Remediate { .. } => Ok(None),
        };

        match verified {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "Verification query failed; treating outcome as unresolved");
                None
            }
        }
    }
}
