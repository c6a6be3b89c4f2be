//! # Infrastructure Adapters
//!
//! Capability interfaces for the external systems a pod is built from. Concrete wire
//! protocols live behind these traits; the orchestrator only relies on the contract:
//!
//! - Every mutating call takes an [`IdempotencyKey`]. Repeating a call with the same key and
//!   input yields the same resource, never a second one.
//! - Every call is bounded in time by the caller (per-step timeout).
//! - Each capability exposes a verification query, used to resolve ambiguous outcomes
//!   before a status is written, and an idempotent teardown used when deprovisioning.

pub mod simulated;

use crate::models::{ContainerSpec, IdempotencyKey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Why an adapter refused an operation for good
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermanentKind {
    /// Invalid input (unknown template, malformed domain)
    Validation,
    /// Capacity or account quota exhausted
    Quota,
    /// Credentials rejected
    Auth,
}

impl fmt::Display for PermanentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Validation => "validation",
            Self::Quota => "quota",
            Self::Auth => "auth",
        })
    }
}

/// Adapter failure taxonomy. Never escapes the step executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    /// Network errors, 5xx responses, rate limiting
    #[error("transient failure: {message}")]
    Transient {
        message: String,
        /// Server-requested delay before the next attempt
        retry_after: Option<Duration>,
    },

    /// Invalid plan, quota, auth
    #[error("permanent {kind} failure: {message}")]
    Permanent { kind: PermanentKind, message: String },

    /// Outcome unknown: the request may or may not have taken effect
    #[error("ambiguous outcome: {message}")]
    Ambiguous { message: String },
}

impl AdapterError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(kind: PermanentKind, message: impl Into<String>) -> Self {
        Self::Permanent {
            kind,
            message: message.into(),
        }
    }

    pub fn ambiguous(message: impl Into<String>) -> Self {
        Self::Ambiguous {
            message: message.into(),
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Ambiguous { .. })
    }
}

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Handle returned by the compute adapter for a started container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub container_ref: String,
    pub ip_address: String,
}

/// Hypervisor: clone a template into a container and manage its lifecycle
#[async_trait]
pub trait ComputeAdapter: Send + Sync {
    /// Clone the template and start the container. Returns the existing container when one
    /// was already created under `key`.
    async fn clone_and_start(
        &self,
        key: IdempotencyKey,
        spec: &ContainerSpec,
    ) -> AdapterResult<ContainerHandle>;

    /// Look up the container created under `key`, if any
    async fn find_container(&self, key: IdempotencyKey) -> AdapterResult<Option<ContainerHandle>>;

    /// Make sure the container is started and reachable
    async fn ensure_running(&self, key: IdempotencyKey, container_ref: &str) -> AdapterResult<()>;

    /// Stop and delete the container. Succeeds when it is already gone.
    async fn destroy_container(
        &self,
        key: IdempotencyKey,
        container_ref: &str,
    ) -> AdapterResult<()>;
}

/// Authoritative DNS
#[async_trait]
pub trait DnsAdapter: Send + Sync {
    /// Create the zone if missing and point its records at `ip_address`
    async fn ensure_zone_and_records(
        &self,
        key: IdempotencyKey,
        domain: &str,
        ip_address: &str,
    ) -> AdapterResult<()>;

    async fn records_present(&self, domain: &str, ip_address: &str) -> AdapterResult<bool>;

    async fn remove_zone(&self, key: IdempotencyKey, domain: &str) -> AdapterResult<()>;
}

/// Mail hosting
#[async_trait]
pub trait MailAdapter: Send + Sync {
    async fn ensure_mailbox(&self, key: IdempotencyKey, domain: &str) -> AdapterResult<()>;

    async fn mailbox_present(&self, domain: &str) -> AdapterResult<bool>;

    async fn remove_mailbox(&self, key: IdempotencyKey, domain: &str) -> AdapterResult<()>;
}

/// Backup storage
#[async_trait]
pub trait BackupAdapter: Send + Sync {
    async fn ensure_backup_schedule(
        &self,
        key: IdempotencyKey,
        container_ref: &str,
        tier: &str,
    ) -> AdapterResult<()>;

    async fn schedule_present(&self, container_ref: &str) -> AdapterResult<bool>;

    async fn remove_backup_schedule(
        &self,
        key: IdempotencyKey,
        container_ref: &str,
    ) -> AdapterResult<()>;
}

/// The full adapter set a step executor drives
#[derive(Clone)]
pub struct Adapters {
    pub compute: Arc<dyn ComputeAdapter>,
    pub dns: Arc<dyn DnsAdapter>,
    pub mail: Arc<dyn MailAdapter>,
    pub backup: Arc<dyn BackupAdapter>,
}

impl fmt::Debug for Adapters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapters").finish_non_exhaustive()
    }
}
