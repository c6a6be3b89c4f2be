//! # Admin Surface
//!
//! Operator queries and explicit interventions. These are the only ways a task leaves
//! `failed`, and every mutation re-runs subscription aggregation so the customer-visible
//! status follows immediately.

use crate::error::{ProvisioningError, Result};
use crate::logging::{log_subscription_operation, log_task_operation};
use crate::models::{CloudPodSubscription, ProvisioningTask};
use crate::orchestration::SubscriptionAggregator;
use crate::store::{DeprovisionOutcome, ProvisioningStore, QueueDepth};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// A subscription with its full task history, oldest first
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionHistory {
    pub subscription: CloudPodSubscription,
    pub tasks: Vec<ProvisioningTask>,
}

pub struct AdminService {
    store: Arc<dyn ProvisioningStore>,
    aggregator: SubscriptionAggregator,
    default_max_attempts: i32,
}

impl AdminService {
    pub fn new(
        store: Arc<dyn ProvisioningStore>,
        aggregator: SubscriptionAggregator,
        default_max_attempts: i32,
    ) -> Self {
        Self {
            store,
            aggregator,
            default_max_attempts,
        }
    }

    /// Task counts grouped by type and status
    pub async fn queue_depth(&self) -> Result<Vec<QueueDepth>> {
        self.store.queue_depth().await
    }

    pub async fn history(&self, subscription_id: Uuid) -> Result<SubscriptionHistory> {
        let subscription = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| ProvisioningError::subscription_not_found(subscription_id))?;
        let tasks = self.store.list_by_subscription(subscription_id).await?;
        Ok(SubscriptionHistory {
            subscription,
            tasks,
        })
    }

    /// Re-enqueue a failed task as the next generation of its step, with a fresh
    /// idempotency key
    #[instrument(skip(self))]
    pub async fn retry_failed(&self, task_id: Uuid) -> Result<ProvisioningTask> {
        let retried = self.store.admin_retry(task_id).await?;
        log_task_operation(
            "admin_retry",
            retried.id,
            retried.subscription_id,
            retried.task_type.as_str(),
            retried.status.as_str(),
            Some(&format!("retry_of={task_id} generation={}", retried.generation)),
        );
        self.aggregator.reconcile(retried.subscription_id).await?;
        Ok(retried)
    }

    /// Dismiss a failed task. A dismissed secondary step counts as skipped.
    #[instrument(skip(self))]
    pub async fn cancel_failed(&self, task_id: Uuid, reason: &str) -> Result<ProvisioningTask> {
        let cancelled = self.store.admin_cancel(task_id, reason).await?;
        log_task_operation(
            "admin_cancel",
            cancelled.id,
            cancelled.subscription_id,
            cancelled.task_type.as_str(),
            cancelled.status.as_str(),
            Some(reason),
        );
        self.aggregator.reconcile(cancelled.subscription_id).await?;
        Ok(cancelled)
    }

    /// Customer cancellation: stop provisioning and tear everything down
    #[instrument(skip(self))]
    pub async fn request_deprovision(
        &self,
        subscription_id: Uuid,
        reason: &str,
    ) -> Result<DeprovisionOutcome> {
        let outcome = self
            .store
            .request_deprovision(subscription_id, reason, self.default_max_attempts)
            .await?;
        info!(
            subscription_id = %subscription_id,
            cancelled = outcome.cancelled.len(),
            deprovision_task_id = %outcome.deprovision_task.id,
            "Deprovision requested"
        );
        Ok(outcome)
    }

    #[instrument(skip(self))]
    pub async fn suspend(&self, subscription_id: Uuid) -> Result<CloudPodSubscription> {
        let before = self.history(subscription_id).await?.subscription.status;
        let suspended = self.store.suspend(subscription_id).await?;
        log_subscription_operation(
            "suspend",
            subscription_id,
            before.as_str(),
            suspended.status.as_str(),
            None,
        );
        Ok(suspended)
    }

    /// Lift a suspension and re-derive the status from the tasks
    #[instrument(skip(self))]
    pub async fn resume(&self, subscription_id: Uuid) -> Result<CloudPodSubscription> {
        self.store.resume(subscription_id).await?;
        let outcome = self.aggregator.reconcile(subscription_id).await?;
        log_subscription_operation(
            "resume",
            subscription_id,
            "suspended",
            outcome.subscription.status.as_str(),
            None,
        );
        Ok(outcome.subscription)
    }
}
