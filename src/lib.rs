#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Pod Provisioner
//!
//! Lease-based task orchestrator that turns a paid hosting order into a running pod.
//!
//! ## Overview
//!
//! Each order becomes a `CloudPodSubscription` and a seed `CREATE_CONTAINER` task. Workers
//! claim tasks from a shared store under time-bounded leases, drive the Compute, DNS, Mail
//! and Backup adapters with deterministic idempotency keys, and record every outcome as a
//! task state transition. Completing a task enqueues its ready dependents in the same
//! write; an aggregator derives the subscription's customer-visible status from its tasks.
//!
//! ```text
//! CREATE_CONTAINER ──┬──▶ CONFIGURE_DNS (with a domain) ──┐
//!                    ├──▶ SETUP_EMAIL ────────────────────┼──▶ ACTIVATE
//!                    └──▶ SETUP_BACKUP ───────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`models`] - Subscriptions, tasks, payloads and idempotency keys
//! - [`state_machine`] - Task transition rules
//! - [`store`] - PostgreSQL and in-memory task stores; all concurrency control lives here
//! - [`adapters`] - Infrastructure capability traits and simulated backends
//! - [`orchestration`] - Claiming, execution, dependency planning, aggregation, workers
//! - [`admin`] - Operator queries and interventions
//! - [`config`] - Layered TOML/environment configuration
//! - [`database`] - Connection pool and migrations
//! - [`logging`] - Structured logging setup
//! - [`error`] - Crate error type
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pod_provisioner::adapters::simulated::SimulatedInfrastructure;
//! use pod_provisioner::orchestration::{LoggingNotifier, OrderFulfillment, OrderRequest, WorkerPool};
//! use pod_provisioner::store::InMemoryProvisioningStore;
//! use pod_provisioner::ProvisionerConfig;
//! use std::sync::Arc;
//!
//! # async fn example() -> pod_provisioner::Result<()> {
//! let config = ProvisionerConfig::default();
//! let store = Arc::new(InMemoryProvisioningStore::new());
//! let infra = SimulatedInfrastructure::new();
//!
//! let orders = OrderFulfillment::new(store.clone(), config.provisioning.clone(), &config.execution);
//! orders
//!     .submit_order(OrderRequest {
//!         customer_id: "cust-42".into(),
//!         plan_code: "pod-small".into(),
//!         domain: Some("example.test".into()),
//!     })
//!     .await?;
//!
//! let pool = WorkerPool::from_config(&config, store, infra.adapters(), Arc::new(LoggingNotifier));
//! pool.run_until_idle().await?;
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod admin;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod state_machine;
pub mod store;

pub use admin::{AdminService, SubscriptionHistory};
pub use config::{ConfigManager, ProvisionerConfig};
pub use error::{ProvisioningError, Result};
pub use models::{
    CloudPodSubscription, IdempotencyKey, NewProvisioningTask, ProvisioningTask, StepResult,
    SubscriptionStatus, TaskPayload, TaskType,
};
pub use state_machine::TaskState;
pub use store::{InMemoryProvisioningStore, PgProvisioningStore, ProvisioningStore};
