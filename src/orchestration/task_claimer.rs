//! # Task Claimer
//!
//! The claim engine: "pick up the next runnable task" for one worker.
//!
//! Each call first returns tasks with expired leases to the queue, then asks the store for
//! the oldest claimable task of a type the worker can execute. A lost compare-and-set race
//! is retried with a fresh selection, up to `claim_retry_limit` times, so one hot row never
//! starves a worker while other work is available.
//!
//! A lease that expires on a task's last attempt escalates it to `failed`. That is a
//! finalization like any other, so the owning subscriptions are reconciled after the sweep.

use super::aggregator::SubscriptionAggregator;
use crate::error::Result;
use crate::logging::log_task_operation;
use crate::models::{ProvisioningTask, TaskType};
use crate::state_machine::TaskState;
use crate::store::{ClaimAttempt, ProvisioningStore};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

/// Configuration for task claiming behavior
#[derive(Debug, Clone)]
pub struct TaskClaimerConfig {
    /// Lease granted on claim
    pub lease_duration: Duration,
    /// Selection retries after losing a claim race
    pub claim_retry_limit: u32,
}

impl Default for TaskClaimerConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(240),
            claim_retry_limit: 5,
        }
    }
}

/// Claims tasks for one worker
#[derive(Clone)]
pub struct TaskClaimer {
    store: Arc<dyn ProvisioningStore>,
    worker_id: String,
    config: TaskClaimerConfig,
    aggregator: Option<SubscriptionAggregator>,
}

impl TaskClaimer {
    pub fn new(store: Arc<dyn ProvisioningStore>, worker_id: impl Into<String>) -> Self {
        Self::with_config(store, worker_id, TaskClaimerConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn ProvisioningStore>,
        worker_id: impl Into<String>,
        config: TaskClaimerConfig,
    ) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            config,
            aggregator: None,
        }
    }

    /// Reconcile subscriptions whose task the lease sweep escalated to `failed`
    pub fn with_aggregator(mut self, aggregator: SubscriptionAggregator) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &TaskClaimerConfig {
        &self.config
    }

    /// Claim the next runnable task of a type in `capabilities`, or `None` when the queue
    /// has nothing this worker can take right now.
    #[instrument(skip(self, capabilities), fields(worker_id = %self.worker_id))]
    pub async fn claim_next(
        &self,
        capabilities: &[TaskType],
    ) -> Result<Option<ProvisioningTask>> {
        self.release_expired().await?;

        for attempt in 0..self.config.claim_retry_limit {
            match self
                .store
                .try_claim(&self.worker_id, capabilities, self.config.lease_duration)
                .await?
            {
                ClaimAttempt::Claimed(task) => {
                    log_task_operation(
                        "claim",
                        task.id,
                        task.subscription_id,
                        task.task_type.as_str(),
                        task.status.as_str(),
                        None,
                    );
                    return Ok(Some(task));
                }
                ClaimAttempt::Empty => return Ok(None),
                ClaimAttempt::Contended => {
                    debug!(attempt = attempt + 1, "Claim contended, reselecting");
                }
            }
        }

        debug!(
            retry_limit = self.config.claim_retry_limit,
            "Claim retry limit reached"
        );
        Ok(None)
    }

    /// Return expired leases to the queue. A subscription whose task the sweep escalated to
    /// `failed` is reconciled here, since no executor will finalize that task.
    pub async fn release_expired(&self) -> Result<Vec<ProvisioningTask>> {
        let released = self.store.release_expired_leases().await?;
        let mut exhausted = BTreeSet::new();
        for task in &released {
            warn!(
                task_id = %task.id,
                task_type = %task.task_type,
                status = %task.status,
                attempts = task.attempts,
                "Reclaimed task whose lease expired without heartbeat"
            );
            log_task_operation(
                "lease_expired",
                task.id,
                task.subscription_id,
                task.task_type.as_str(),
                task.status.as_str(),
                task.last_error.as_deref(),
            );
            if task.status == TaskState::Failed {
                exhausted.insert(task.subscription_id);
            }
        }

        if let Some(aggregator) = &self.aggregator {
            for subscription_id in exhausted {
                self.reconcile(aggregator, subscription_id).await;
            }
        }
        Ok(released)
    }

    async fn reconcile(&self, aggregator: &SubscriptionAggregator, subscription_id: Uuid) {
        if let Err(e) = aggregator.reconcile(subscription_id).await {
            error!(
                subscription_id = %subscription_id,
                error = %e,
                "Subscription reconcile failed after lease exhaustion"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ContainerSpec, NewProvisioningTask, NewSubscription, SubscriptionStatus, TaskPayload,
    };
    use crate::store::InMemoryProvisioningStore;
    use chrono::Utc;

    async fn store_with_email_task() -> Arc<InMemoryProvisioningStore> {
        let store = Arc::new(InMemoryProvisioningStore::new());
        let id = Uuid::new_v4();
        let sub = NewSubscription {
            customer_id: "c".into(),
            plan_code: "pod-small".into(),
            domain: None,
        }
        .into_subscription(id, Utc::now());
        let seed = NewProvisioningTask::new(
            id,
            TaskPayload::SetupEmail {
                domain: "x.mail.test".into(),
            },
            3,
        );
        store.create_subscription_with_seed(sub, seed).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_claims_once_then_empty() {
        let store = store_with_email_task().await;
        let a = TaskClaimer::new(store.clone(), "worker-a");
        let b = TaskClaimer::new(store.clone(), "worker-b");

        let task = a
            .claim_next(&TaskType::default_capabilities())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskState::Claimed);
        assert!(b
            .claim_next(&TaskType::default_capabilities())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_expired_claim_is_reclaimed_by_next_caller() {
        let store = store_with_email_task().await;
        let a = TaskClaimer::new(store.clone(), "worker-a");
        let b = TaskClaimer::new(store.clone(), "worker-b");

        let task = a
            .claim_next(&[TaskType::SetupEmail])
            .await
            .unwrap()
            .unwrap();
        store
            .force_lease_expiry(task.id, Utc::now() - chrono::Duration::seconds(1))
            .unwrap();

        let reclaimed = b
            .claim_next(&[TaskType::SetupEmail])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.id, task.id);
        assert_eq!(reclaimed.worker_id.as_deref(), Some("worker-b"));
        // Expiry from CLAIMED does not consume an attempt
        assert_eq!(reclaimed.attempts, 0);
    }

    #[tokio::test]
    async fn test_lease_exhaustion_fails_the_subscription() {
        let store = Arc::new(InMemoryProvisioningStore::new());
        let id = Uuid::new_v4();
        let sub = NewSubscription {
            customer_id: "c".into(),
            plan_code: "pod-small".into(),
            domain: None,
        }
        .into_subscription(id, Utc::now());
        let seed = NewProvisioningTask::new(
            id,
            TaskPayload::CreateContainer {
                plan_code: "pod-small".into(),
                container: ContainerSpec {
                    template_id: "tmpl-debian-12".into(),
                    cpu_cores: 1,
                    ram_mb: 2048,
                    disk_gb: 20,
                    network: "pods-vlan".into(),
                },
                domain: None,
                mail_domain: "x.mail.test".into(),
                backup_tier: "daily-7".into(),
            },
            1,
        );
        store.create_subscription_with_seed(sub, seed).await.unwrap();

        let claimer = TaskClaimer::new(store.clone(), "worker-a")
            .with_aggregator(SubscriptionAggregator::with_logging_notifier(store.clone()));
        let task = claimer
            .claim_next(&[TaskType::CreateContainer])
            .await
            .unwrap()
            .unwrap();
        store
            .mark_running(task.id, "worker-a", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .force_lease_expiry(task.id, Utc::now() - chrono::Duration::seconds(1))
            .unwrap();

        let released = claimer.release_expired().await.unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].status, TaskState::Failed);

        let sub = store.get_subscription(id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Failed);
    }
}
