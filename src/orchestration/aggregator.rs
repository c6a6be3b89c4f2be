//! # Subscription Aggregator
//!
//! Derives a subscription's customer-visible status from its tasks and applies it.
//!
//! Derivation ([`derive_update`]) is a pure function evaluated by the store over a locked
//! snapshot, so concurrent finalizations of sibling tasks cannot interleave their reads and
//! writes. Besides the status it returns the tasks that should exist but do not yet: the
//! follow-up backstop and remediations for failed secondary steps. Both are idempotent by key.
//!
//! | Tasks                                              | Status           |
//! |----------------------------------------------------|------------------|
//! | latest CREATE_CONTAINER failed or dismissed        | `failed`         |
//! | ACTIVATE completed (or remediated)                 | `active`         |
//! | a secondary step failed with no completed fix      | `degraded`       |
//! | DEPROVISION completed                              | `deprovisioned`  |
//! | anything else                                      | `provisioning`   |
//!
//! `suspended` and `deprovisioned` are never derived away from.

use super::dependency_graph::{
    has_scope, is_satisfied, latest_of_type, plan_followups, remediation_completed,
    remediation_scope,
};
use crate::error::Result;
use crate::logging::log_subscription_operation;
use crate::models::{
    CloudPodSubscription, NewProvisioningTask, ProvisioningTask, SubscriptionStatus, TaskPayload,
    TaskType,
};
use crate::state_machine::TaskState;
use crate::store::{AggregateOutcome, ProvisioningStore, SubscriptionUpdate};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Order-fulfillment callback for terminal provisioning failures
#[async_trait]
pub trait FulfillmentNotifier: Send + Sync {
    /// Called exactly once per transition into `failed`, by the reconcile that performed it
    async fn provisioning_failed(
        &self,
        subscription: &CloudPodSubscription,
        reason: &str,
    ) -> Result<()>;
}

/// Notifier that only records the failure in the log
#[derive(Debug, Clone, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl FulfillmentNotifier for LoggingNotifier {
    async fn provisioning_failed(
        &self,
        subscription: &CloudPodSubscription,
        reason: &str,
    ) -> Result<()> {
        error!(
            subscription_id = %subscription.id,
            customer_id = %subscription.customer_id,
            plan_code = %subscription.plan_code,
            reason = %reason,
            "Provisioning failed; subscription is refund-eligible"
        );
        Ok(())
    }
}

/// Compute the status and missing tasks for one subscription snapshot
pub fn derive_update(
    subscription: &CloudPodSubscription,
    tasks: &[ProvisioningTask],
) -> SubscriptionUpdate {
    if subscription.status.is_externally_held() {
        return SubscriptionUpdate::default();
    }

    if subscription.status == SubscriptionStatus::Deprovisioning {
        let torn_down = latest_of_type(tasks, TaskType::Deprovision)
            .is_some_and(|t| t.status == TaskState::Completed);
        return if torn_down {
            SubscriptionUpdate {
                status: Some(SubscriptionStatus::Deprovisioned),
                ..Default::default()
            }
        } else {
            SubscriptionUpdate::default()
        };
    }

    let Some(create) = latest_of_type(tasks, TaskType::CreateContainer) else {
        return status_only(SubscriptionStatus::Provisioning);
    };

    match create.status {
        TaskState::Failed | TaskState::Cancelled => {
            let reason = create
                .last_error
                .clone()
                .unwrap_or_else(|| format!("{} {}", create.task_type, create.status));
            return SubscriptionUpdate {
                status: Some(SubscriptionStatus::Failed),
                enqueue: Vec::new(),
                reason: Some(reason),
            };
        }
        TaskState::Completed => {}
        _ => return status_only(SubscriptionStatus::Provisioning),
    }

    let mut enqueue = plan_followups(subscription, tasks);

    if is_satisfied(tasks, TaskType::Activate) {
        return SubscriptionUpdate {
            status: Some(SubscriptionStatus::Active),
            enqueue,
            reason: None,
        };
    }

    let failed_steps: Vec<&ProvisioningTask> = TaskType::SECONDARY
        .iter()
        .filter_map(|step| latest_of_type(tasks, *step))
        .filter(|t| t.status == TaskState::Failed && !remediation_completed(tasks, t.task_type))
        .collect();

    if failed_steps.is_empty() {
        return SubscriptionUpdate {
            status: Some(SubscriptionStatus::Provisioning),
            enqueue,
            reason: None,
        };
    }

    let mut reasons = Vec::with_capacity(failed_steps.len());
    for failed in failed_steps {
        reasons.push(format!(
            "{}: {}",
            failed.task_type,
            failed.last_error.as_deref().unwrap_or("failed")
        ));
        if has_scope(tasks, &remediation_scope(failed.task_type)) {
            continue;
        }
        if let Some(remediation) = TaskPayload::remediation_for(&failed.payload) {
            enqueue.push(NewProvisioningTask::new(
                subscription.id,
                remediation,
                failed.max_attempts,
            ));
        }
    }

    SubscriptionUpdate {
        status: Some(SubscriptionStatus::Degraded),
        enqueue,
        reason: Some(reasons.join("; ")),
    }
}

fn status_only(status: SubscriptionStatus) -> SubscriptionUpdate {
    SubscriptionUpdate {
        status: Some(status),
        ..Default::default()
    }
}

/// Applies [`derive_update`] and fans out the side effects of a status change
#[derive(Clone)]
pub struct SubscriptionAggregator {
    store: Arc<dyn ProvisioningStore>,
    notifier: Arc<dyn FulfillmentNotifier>,
}

impl std::fmt::Debug for SubscriptionAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionAggregator").finish_non_exhaustive()
    }
}

impl SubscriptionAggregator {
    pub fn new(store: Arc<dyn ProvisioningStore>, notifier: Arc<dyn FulfillmentNotifier>) -> Self {
        Self { store, notifier }
    }

    pub fn with_logging_notifier(store: Arc<dyn ProvisioningStore>) -> Self {
        Self::new(store, Arc::new(LoggingNotifier))
    }

    /// Re-derive the subscription's status after a task finalized or an admin action
    #[instrument(skip(self))]
    pub async fn reconcile(&self, subscription_id: Uuid) -> Result<AggregateOutcome> {
        let outcome = self
            .store
            .apply_aggregate(subscription_id, &derive_update)
            .await?;

        for task in &outcome.enqueued {
            info!(
                subscription_id = %subscription_id,
                task_id = %task.id,
                task_type = %task.task_type,
                scope = %task.scope,
                "Aggregator enqueued task"
            );
        }

        if !outcome.status_changed() {
            debug!(status = %outcome.subscription.status, "Subscription status unchanged");
            return Ok(outcome);
        }

        log_subscription_operation(
            "status_change",
            subscription_id,
            outcome.previous_status.as_str(),
            outcome.subscription.status.as_str(),
            outcome.reason.as_deref(),
        );

        if outcome.subscription.status == SubscriptionStatus::Failed {
            let reason = outcome.reason.as_deref().unwrap_or("provisioning failed");
            if let Err(e) = self
                .notifier
                .provisioning_failed(&outcome.subscription, reason)
                .await
            {
                warn!(
                    subscription_id = %subscription_id,
                    error = %e,
                    "Fulfillment notification failed"
                );
            }
        }

        Ok(outcome)
    }
}
