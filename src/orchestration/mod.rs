//! # Orchestration Engine
//!
//! Drives pods from a paid order to a running service (or a well-defined failure).
//!
//! ## Core Components
//!
//! - **OrderFulfillment**: Accepts orders and writes the subscription plus its seed task
//! - **TaskClaimer**: Lease-based claim engine, one task per worker at a time
//! - **StepExecutor**: Runs a claimed task against the adapters and records the outcome
//! - **DependencyGraph**: Pure planning of ready dependents over a subscription's tasks
//! - **SubscriptionAggregator**: Derives subscription status and enqueues remediations
//! - **ErrorClassifier / BackoffCalculator**: Retry policy for adapter failures
//! - **ProvisioningWorker / WorkerPool**: The claim → execute → finalize loop
//!
//! Workers coordinate only through the store; there is no in-process registry of in-flight
//! tasks, so any number of processes can run pools against the same database.

pub mod aggregator;
pub mod backoff_calculator;
pub mod dependency_graph;
pub mod error_classifier;
pub mod fulfillment;
pub mod step_executor;
pub mod task_claimer;
pub mod worker;

pub use aggregator::{derive_update, FulfillmentNotifier, LoggingNotifier, SubscriptionAggregator};
pub use backoff_calculator::BackoffCalculator;
pub use dependency_graph::plan_followups;
pub use error_classifier::{ErrorCategory, ErrorClassification, ErrorClassifier};
pub use fulfillment::{AcceptedOrder, OrderFulfillment, OrderRequest};
pub use step_executor::{ExecutionOutcome, StepExecutor, StepExecutorConfig};
pub use task_claimer::{TaskClaimer, TaskClaimerConfig};
pub use worker::{ProvisioningWorker, WorkerPool};
