//! Shared fixtures for the provisioning integration suites: an in-memory store, simulated
//! infrastructure, and every service wired the way the binary wires them.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use pod_provisioner::adapters::simulated::SimulatedInfrastructure;
use pod_provisioner::orchestration::{
    ErrorClassifier, FulfillmentNotifier, OrderFulfillment, OrderRequest, StepExecutor,
    StepExecutorConfig, SubscriptionAggregator, WorkerPool,
};
use pod_provisioner::orchestration::backoff_calculator::BackoffCalculator;
use pod_provisioner::{
    AdminService, CloudPodSubscription, InMemoryProvisioningStore, ProvisionerConfig,
    ProvisioningStore, ProvisioningTask, TaskType,
};
use std::sync::Arc;
use uuid::Uuid;

/// Records every failure notification instead of calling order fulfillment
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    failures: Mutex<Vec<(Uuid, String)>>,
}

impl RecordingNotifier {
    pub fn failures(&self) -> Vec<(Uuid, String)> {
        self.failures.lock().clone()
    }

    pub fn count_for(&self, subscription_id: Uuid) -> usize {
        self.failures
            .lock()
            .iter()
            .filter(|(id, _)| *id == subscription_id)
            .count()
    }
}

#[async_trait]
impl FulfillmentNotifier for RecordingNotifier {
    async fn provisioning_failed(
        &self,
        subscription: &CloudPodSubscription,
        reason: &str,
    ) -> pod_provisioner::Result<()> {
        self.failures
            .lock()
            .push((subscription.id, reason.to_string()));
        Ok(())
    }
}

/// Fast retries, no jitter, small attempt budget
pub fn test_config() -> ProvisionerConfig {
    let mut config = ProvisionerConfig::default();
    config.worker.worker_count = 2;
    config.worker.poll_interval_ms = 10;
    config.backoff.base_delay_ms = 0;
    config.backoff.jitter_enabled = false;
    config.execution.default_max_attempts = 3;
    config
}

pub struct TestHarness {
    pub config: ProvisionerConfig,
    pub store: Arc<InMemoryProvisioningStore>,
    pub infra: SimulatedInfrastructure,
    pub notifier: Arc<RecordingNotifier>,
    pub aggregator: SubscriptionAggregator,
    pub orders: OrderFulfillment,
    pub admin: AdminService,
    pub executor: Arc<StepExecutor>,
    pub pool: WorkerPool,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ProvisionerConfig) -> Self {
        let store = Arc::new(InMemoryProvisioningStore::new());
        let infra = SimulatedInfrastructure::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let aggregator = SubscriptionAggregator::new(store.clone(), notifier.clone());

        let orders = OrderFulfillment::new(
            store.clone(),
            config.provisioning.clone(),
            &config.execution,
        );
        let admin = AdminService::new(
            store.clone(),
            aggregator.clone(),
            config.execution.default_max_attempts,
        );
        let executor = Arc::new(StepExecutor::new(
            store.clone(),
            infra.adapters(),
            aggregator.clone(),
            ErrorClassifier::new(BackoffCalculator::new(config.backoff.clone())),
            StepExecutorConfig::from_config(&config),
        ));
        let pool =
            WorkerPool::from_config(&config, store.clone(), infra.adapters(), notifier.clone());

        Self {
            config,
            store,
            infra,
            notifier,
            aggregator,
            orders,
            admin,
            executor,
            pool,
        }
    }

    /// A pool over the same store and infrastructure with different worker settings
    pub fn pool_with(&self, configure: impl FnOnce(&mut ProvisionerConfig)) -> WorkerPool {
        let mut config = self.config.clone();
        configure(&mut config);
        WorkerPool::from_config(
            &config,
            self.store.clone(),
            self.infra.adapters(),
            self.notifier.clone(),
        )
    }

    pub async fn order(&self, domain: Option<&str>) -> Uuid {
        self.orders
            .submit_order(OrderRequest {
                customer_id: format!("cust-{}", Uuid::new_v4().simple()),
                plan_code: "pod-small".to_string(),
                domain: domain.map(str::to_string),
            })
            .await
            .expect("order accepted")
            .subscription
            .id
    }

    pub async fn drain(&self) -> usize {
        self.pool.run_until_idle().await.expect("drain succeeds")
    }

    pub async fn subscription(&self, id: Uuid) -> CloudPodSubscription {
        self.store
            .get_subscription(id)
            .await
            .unwrap()
            .expect("subscription exists")
    }

    pub async fn tasks(&self, id: Uuid) -> Vec<ProvisioningTask> {
        self.store.list_by_subscription(id).await.unwrap()
    }

    /// Latest generation of a step
    pub async fn task_of(&self, id: Uuid, task_type: TaskType) -> Option<ProvisioningTask> {
        self.tasks(id)
            .await
            .into_iter()
            .filter(|t| t.task_type == task_type)
            .max_by_key(|t| t.generation)
    }

    pub async fn count_of(&self, id: Uuid, task_type: TaskType) -> usize {
        self.tasks(id)
            .await
            .iter()
            .filter(|t| t.task_type == task_type)
            .count()
    }
}
