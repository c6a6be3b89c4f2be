//! # Order Fulfillment Entry Point
//!
//! Turns a paid order into a subscription plus its seed `CREATE_CONTAINER` task, written
//! atomically so a subscription never exists without the work that provisions it.

use crate::config::{ExecutionConfig, ProvisioningConfig};
use crate::error::{ProvisioningError, Result};
use crate::logging::log_subscription_operation;
use crate::models::{
    CloudPodSubscription, NewProvisioningTask, NewSubscription, ProvisioningTask, TaskPayload,
};
use crate::store::ProvisioningStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// A customer order as received from order fulfillment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub customer_id: String,
    pub plan_code: String,
    /// Customer-owned domain; pods without one get a platform mail domain and no DNS
    pub domain: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedOrder {
    pub subscription: CloudPodSubscription,
    pub seed_task: ProvisioningTask,
}

pub struct OrderFulfillment {
    store: Arc<dyn ProvisioningStore>,
    provisioning: ProvisioningConfig,
    default_max_attempts: i32,
}

impl OrderFulfillment {
    pub fn new(
        store: Arc<dyn ProvisioningStore>,
        provisioning: ProvisioningConfig,
        execution: &ExecutionConfig,
    ) -> Self {
        Self {
            store,
            provisioning,
            default_max_attempts: execution.default_max_attempts,
        }
    }

    /// Validate the order and create the subscription with its seed task
    #[instrument(skip(self, order), fields(customer_id = %order.customer_id, plan_code = %order.plan_code))]
    pub async fn submit_order(&self, order: OrderRequest) -> Result<AcceptedOrder> {
        if order.customer_id.trim().is_empty() {
            return Err(ProvisioningError::ValidationError(
                "customer_id is required".to_string(),
            ));
        }
        let plan = self.provisioning.plans.get(&order.plan_code).ok_or_else(|| {
            ProvisioningError::ValidationError(format!("unknown plan code: {}", order.plan_code))
        })?;
        let domain = order
            .domain
            .as_deref()
            .map(normalize_domain)
            .transpose()?;

        let subscription = NewSubscription {
            customer_id: order.customer_id,
            plan_code: order.plan_code.clone(),
            domain: domain.clone(),
        }
        .into_subscription(Uuid::new_v4(), Utc::now());

        let mail_domain = domain.clone().unwrap_or_else(|| {
            format!(
                "{}.{}",
                subscription.short_id(),
                self.provisioning.mail_domain_suffix
            )
        });
        let seed = NewProvisioningTask::new(
            subscription.id,
            TaskPayload::CreateContainer {
                plan_code: order.plan_code,
                container: plan.container_spec(&self.provisioning.network),
                domain,
                mail_domain,
                backup_tier: plan.backup_tier.clone(),
            },
            self.default_max_attempts,
        );

        let (subscription, seed_task) = self
            .store
            .create_subscription_with_seed(subscription, seed)
            .await?;

        log_subscription_operation(
            "create",
            subscription.id,
            "none",
            subscription.status.as_str(),
            Some(&format!("seed_task={}", seed_task.id)),
        );
        info!(
            subscription_id = %subscription.id,
            seed_task_id = %seed_task.id,
            "Order accepted for provisioning"
        );

        Ok(AcceptedOrder {
            subscription,
            seed_task,
        })
    }
}

/// Lowercase and check hostname syntax: at least two labels of `[a-z0-9-]`, no label
/// starting or ending with a hyphen.
pub fn normalize_domain(raw: &str) -> Result<String> {
    let domain = raw.trim().trim_end_matches('.').to_ascii_lowercase();
    let invalid =
        |why: &str| ProvisioningError::ValidationError(format!("invalid domain {raw:?}: {why}"));

    if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
        return Err(invalid("length"));
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return Err(invalid("needs at least two labels"));
    }
    for label in labels {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(invalid("label length"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("label starts or ends with '-'"));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(invalid("unsupported character"));
        }
    }
    Ok(domain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SubscriptionStatus, TaskType};
    use crate::state_machine::TaskState;
    use crate::store::InMemoryProvisioningStore;

    fn fulfillment() -> (Arc<InMemoryProvisioningStore>, OrderFulfillment) {
        let store = Arc::new(InMemoryProvisioningStore::new());
        let service = OrderFulfillment::new(
            store.clone(),
            ProvisioningConfig::default(),
            &ExecutionConfig::default(),
        );
        (store, service)
    }

    #[test]
    fn test_domain_normalization() {
        assert_eq!(normalize_domain(" Example.TEST. ").unwrap(), "example.test");
        assert!(normalize_domain("localhost").is_err());
        assert!(normalize_domain("-bad.test").is_err());
        assert!(normalize_domain("under_score.test").is_err());
        assert!(normalize_domain("a..test").is_err());
    }

    #[tokio::test]
    async fn test_submit_order_seeds_create_container() {
        let (store, service) = fulfillment();
        let accepted = service
            .submit_order(OrderRequest {
                customer_id: "cust-1".into(),
                plan_code: "pod-medium".into(),
                domain: Some("Example.test".into()),
            })
            .await
            .unwrap();

        assert_eq!(accepted.subscription.status, SubscriptionStatus::Provisioning);
        assert_eq!(accepted.subscription.domain.as_deref(), Some("example.test"));
        assert_eq!(accepted.seed_task.task_type, TaskType::CreateContainer);
        assert_eq!(accepted.seed_task.status, TaskState::Pending);
        assert_eq!(accepted.seed_task.max_attempts, 5);
        match &accepted.seed_task.payload {
            TaskPayload::CreateContainer {
                container,
                mail_domain,
                backup_tier,
                ..
            } => {
                assert_eq!(container.cpu_cores, 2);
                assert_eq!(container.network, "pods-vlan");
                assert_eq!(mail_domain, "example.test");
                assert_eq!(backup_tier, "daily-14");
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(store.task_count(), 1);
    }

    #[tokio::test]
    async fn test_platform_mail_domain_without_customer_domain() {
        let (_, service) = fulfillment();
        let accepted = service
            .submit_order(OrderRequest {
                customer_id: "cust-2".into(),
                plan_code: "pod-small".into(),
                domain: None,
            })
            .await
            .unwrap();
        let TaskPayload::CreateContainer {
            domain,
            mail_domain,
            ..
        } = &accepted.seed_task.payload
        else {
            panic!("seed must create the container");
        };
        assert!(domain.is_none());
        assert_eq!(
            mail_domain,
            &format!("{}.mail.pods.local", accepted.subscription.short_id())
        );
    }

    #[tokio::test]
    async fn test_unknown_plan_rejected_without_writes() {
        let (store, service) = fulfillment();
        let err = service
            .submit_order(OrderRequest {
                customer_id: "cust-3".into(),
                plan_code: "pod-gigantic".into(),
                domain: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::ValidationError(_)));
        assert_eq!(store.task_count(), 0);
    }
}
