//! # Provisioning Workers
//!
//! A worker repeats: claim a task whose type it can execute, execute it, loop. Workers share
//! nothing but the store; running N of them is just spawning N loops.
//!
//! Shutdown stops claiming. A task already claimed is executed to its recorded outcome (or
//! its lease runs out) before the loop exits.

use super::aggregator::{FulfillmentNotifier, SubscriptionAggregator};
use super::backoff_calculator::BackoffCalculator;
use super::error_classifier::ErrorClassifier;
use super::step_executor::{ExecutionOutcome, StepExecutor, StepExecutorConfig};
use super::task_claimer::{TaskClaimer, TaskClaimerConfig};
use crate::adapters::Adapters;
use crate::config::{ProvisionerConfig, WorkerConfig};
use crate::error::{ProvisioningError, Result};
use crate::logging::log_worker_operation;
use crate::models::TaskType;
use crate::store::ProvisioningStore;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct ProvisioningWorker {
    worker_id: String,
    capabilities: Vec<TaskType>,
    claimer: TaskClaimer,
    executor: Arc<StepExecutor>,
    poll_interval: Duration,
    error_backoff: Duration,
    running: AtomicBool,
    shutdown_notify: Notify,
    processed: AtomicU64,
}

impl std::fmt::Debug for ProvisioningWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningWorker")
            .field("worker_id", &self.worker_id)
            .field("capabilities", &self.capabilities)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ProvisioningWorker {
    pub fn new(
        worker_id: impl Into<String>,
        store: Arc<dyn ProvisioningStore>,
        executor: Arc<StepExecutor>,
        config: &WorkerConfig,
    ) -> Self {
        let worker_id = worker_id.into();
        let claimer = TaskClaimer::with_config(
            store,
            worker_id.clone(),
            TaskClaimerConfig {
                lease_duration: config.lease_duration(),
                claim_retry_limit: config.claim_retry_limit,
            },
        )
        .with_aggregator(executor.aggregator().clone());
        Self {
            worker_id,
            capabilities: config.capabilities.clone(),
            claimer,
            executor,
            poll_interval: config.poll_interval(),
            error_backoff: config.error_backoff(),
            running: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            processed: AtomicU64::new(0),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn capabilities(&self) -> &[TaskType] {
        &self.capabilities
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Tasks this worker has driven to a recorded outcome
    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Claim and execute at most one task
    pub async fn run_once(&self) -> Result<Option<ExecutionOutcome>> {
        let Some(task) = self.claimer.claim_next(&self.capabilities).await? else {
            return Ok(None);
        };
        let task_id = task.id;
        let outcome = self.executor.execute(task, &self.worker_id).await?;
        if outcome != ExecutionOutcome::LeaseLost {
            self.processed.fetch_add(1, Ordering::Relaxed);
        }
        debug!(worker_id = %self.worker_id, task_id = %task_id, outcome = ?outcome, "Task processed");
        Ok(Some(outcome))
    }

    /// Process claimable tasks until none is left. Returns how many were processed.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut processed = 0;
        while self.run_once().await?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }

    /// Poll until [`shutdown`](Self::shutdown) is called
    pub async fn run(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ProvisioningError::InvalidState(format!(
                "worker {} is already running",
                self.worker_id
            )));
        }
        log_worker_operation(&self.worker_id, "start", None);
        info!(
            worker_id = %self.worker_id,
            capabilities = ?self.capabilities,
            "Starting worker loop"
        );

        while self.is_running() {
            let wait = match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => self.poll_interval,
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "Worker iteration failed");
                    self.error_backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {},
                _ = self.shutdown_notify.notified() => {
                    debug!(worker_id = %self.worker_id, "Shutdown notification received");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::Release);
        log_worker_operation(
            &self.worker_id,
            "stop",
            Some(&format!("processed={}", self.processed_count())),
        );
        info!(worker_id = %self.worker_id, "Worker loop ended");
        Ok(())
    }

    /// Stop claiming; an in-flight task still finishes
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.shutdown_notify.notify_one();
    }
}

/// N independent workers over one store
#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: Vec<Arc<ProvisioningWorker>>,
}

impl WorkerPool {
    pub fn new(workers: Vec<Arc<ProvisioningWorker>>) -> Self {
        Self { workers }
    }

    /// Wire executor, aggregator and `worker.worker_count` workers from configuration
    pub fn from_config(
        config: &ProvisionerConfig,
        store: Arc<dyn ProvisioningStore>,
        adapters: Adapters,
        notifier: Arc<dyn FulfillmentNotifier>,
    ) -> Self {
        let aggregator = SubscriptionAggregator::new(store.clone(), notifier);
        let classifier = ErrorClassifier::new(BackoffCalculator::new(config.backoff.clone()));
        let executor = Arc::new(StepExecutor::new(
            store.clone(),
            adapters,
            aggregator,
            classifier,
            StepExecutorConfig::from_config(config),
        ));

        let run_id = Uuid::new_v4().simple().to_string();
        let workers = (0..config.worker.worker_count)
            .map(|index| {
                Arc::new(ProvisioningWorker::new(
                    format!("{}-{}-{index}", config.worker.worker_id_prefix, &run_id[..8]),
                    store.clone(),
                    executor.clone(),
                    &config.worker,
                ))
            })
            .collect();
        Self::new(workers)
    }

    pub fn workers(&self) -> &[Arc<ProvisioningWorker>] {
        &self.workers
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Run every worker loop until shutdown
    pub async fn run(&self) -> Result<()> {
        let handles = self.workers.iter().cloned().map(|worker| {
            tokio::spawn(async move { worker.run().await })
        });
        for joined in join_all(handles).await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Worker exited with error"),
                Err(e) => {
                    return Err(ProvisioningError::Internal(format!(
                        "worker task panicked: {e}"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Drain claimable work concurrently and return the total processed
    pub async fn run_until_idle(&self) -> Result<usize> {
        let handles = self.workers.iter().cloned().map(|worker| {
            tokio::spawn(async move { worker.run_until_idle().await })
        });
        let mut total = 0;
        for joined in join_all(handles).await {
            total += joined
                .map_err(|e| ProvisioningError::Internal(format!("worker task panicked: {e}")))??;
        }
        Ok(total)
    }

    pub fn shutdown(&self) {
        info!(workers = self.workers.len(), "Shutting down worker pool");
        for worker in &self.workers {
            worker.shutdown();
        }
    }
}
