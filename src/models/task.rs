//! # Provisioning Task Model
//!
//! One row of the `provisioning_tasks` table: a single atomic step of a pod's provisioning
//! workflow, together with its claim/lease bookkeeping and retry state.
//!
//! ## Database Schema
//!
//! Maps to `provisioning_tasks`:
//! - `id`: Primary key (UUID)
//! - `subscription_id`: Owning subscription (UUID, FK)
//! - `task_type` / `scope` / `generation`: what the task does and which logical step it belongs to
//! - `idempotency_key`: UUID v5 over `(subscription_id, scope, generation)`, unique
//! - `payload` / `result`: JSONB tagged unions
//! - `worker_id`, `lease_expires_at`, `last_heartbeat_at`: current claim
//! - `attempts`, `max_attempts`, `next_retry_at`, `last_error`: retry state
//!
//! ## Scopes and Generations
//!
//! A scope names one logical step of a subscription (`setup_backup`, or
//! `remediate:setup_backup` for a remediation). The first task for a scope is generation 1;
//! an admin retry enqueues generation + 1 with a fresh idempotency key. The latest generation
//! of a scope is the one that counts when deriving subscription status.

use crate::state_machine::TaskState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The fixed set of provisioning steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    CreateContainer,
    ConfigureDns,
    SetupEmail,
    SetupBackup,
    Activate,
    Deprovision,
    Remediate,
}

impl TaskType {
    pub const ALL: [TaskType; 7] = [
        TaskType::CreateContainer,
        TaskType::ConfigureDns,
        TaskType::SetupEmail,
        TaskType::SetupBackup,
        TaskType::Activate,
        TaskType::Deprovision,
        TaskType::Remediate,
    ];

    /// Steps that follow container creation. A permanent failure of one of these degrades
    /// the subscription instead of failing it.
    pub const SECONDARY: [TaskType; 4] = [
        TaskType::ConfigureDns,
        TaskType::SetupEmail,
        TaskType::SetupBackup,
        TaskType::Activate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateContainer => "create_container",
            Self::ConfigureDns => "configure_dns",
            Self::SetupEmail => "setup_email",
            Self::SetupBackup => "setup_backup",
            Self::Activate => "activate",
            Self::Deprovision => "deprovision",
            Self::Remediate => "remediate",
        }
    }

    pub fn is_secondary(&self) -> bool {
        Self::SECONDARY.contains(self)
    }

    /// Types a default worker executes. Remediation is opt-in per worker.
    pub fn default_capabilities() -> Vec<TaskType> {
        Self::ALL
            .iter()
            .copied()
            .filter(|t| *t != TaskType::Remediate)
            .collect()
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Invalid task type: {s}"))
    }
}

/// Compute resources requested for a pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub template_id: String,
    pub cpu_cores: u32,
    pub ram_mb: u32,
    pub disk_gb: u32,
    pub network: String,
}

/// Per-type task input. Each step executor only ever handles its own variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    CreateContainer {
        plan_code: String,
        container: ContainerSpec,
        /// Customer domain; `None` means DNS configuration is skipped
        domain: Option<String>,
        mail_domain: String,
        backup_tier: String,
    },
    ConfigureDns {
        domain: String,
        ip_address: String,
    },
    SetupEmail {
        domain: String,
    },
    SetupBackup {
        container_ref: String,
        tier: String,
    },
    Activate {
        container_ref: String,
    },
    Deprovision {
        reason: String,
    },
    Remediate {
        target: Box<TaskPayload>,
    },
}

impl TaskPayload {
    pub fn task_type(&self) -> TaskType {
        match self {
            Self::CreateContainer { .. } => TaskType::CreateContainer,
            Self::ConfigureDns { .. } => TaskType::ConfigureDns,
            Self::SetupEmail { .. } => TaskType::SetupEmail,
            Self::SetupBackup { .. } => TaskType::SetupBackup,
            Self::Activate { .. } => TaskType::Activate,
            Self::Deprovision { .. } => TaskType::Deprovision,
            Self::Remediate { .. } => TaskType::Remediate,
        }
    }

    /// Scope string grouping all generations of one logical step.
    pub fn scope(&self) -> String {
        match self {
            Self::Remediate { target } => format!("remediate:{}", target.task_type()),
            other => other.task_type().as_str().to_string(),
        }
    }

    /// Build a remediation payload for a failed secondary step.
    ///
    /// Returns `None` for targets that cannot be remediated: container creation
    /// (its failure fails the subscription), deprovisioning and remediations themselves.
    pub fn remediation_for(target: &TaskPayload) -> Option<TaskPayload> {
        if target.task_type().is_secondary() {
            Some(Self::Remediate {
                target: Box::new(target.clone()),
            })
        } else {
            None
        }
    }

    pub fn remediation_target(&self) -> Option<&TaskPayload> {
        match self {
            Self::Remediate { target } => Some(target),
            _ => None,
        }
    }
}

/// Structured outcome recorded on a completed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepResult {
    ContainerReady {
        container_ref: String,
        ip_address: String,
    },
    DnsConfigured {
        domain: String,
        ip_address: String,
    },
    MailboxReady {
        domain: String,
    },
    BackupScheduled {
        container_ref: String,
        tier: String,
    },
    Activated {
        container_ref: String,
    },
    Deprovisioned {
        removed: Vec<String>,
    },
}

/// Deterministic key handed to adapters so a repeated call cannot create a second resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(Uuid);

impl IdempotencyKey {
    const NAMESPACE: Uuid = Uuid::from_u128(0x6f2a_91c4_5b7e_4d0a_9c3e_1f8b_27d6_a451);

    pub fn derive(subscription_id: Uuid, scope: &str, generation: i32) -> Self {
        let name = format!("{subscription_id}/{scope}/g{generation}");
        Self(Uuid::new_v5(&Self::NAMESPACE, name.as_bytes()))
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A persisted provisioning task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningTask {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub task_type: TaskType,
    pub scope: String,
    pub generation: i32,
    pub status: TaskState,
    pub payload: TaskPayload,
    pub result: Option<StepResult>,
    pub idempotency_key: IdempotencyKey,
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProvisioningTask {
    /// Whether a worker currently holds an unexpired claim on this task.
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.status.is_active() && self.lease_expires_at.is_some_and(|at| at > now)
    }

    /// Whether the lease on an active task has run out without a heartbeat.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status.is_active() && self.lease_expires_at.map_or(true, |at| at <= now)
    }

    /// Whether the claim engine may hand this task out right now.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskState::Pending => true,
            TaskState::Retrying => self.next_retry_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }

    pub fn remediation_target(&self) -> Option<TaskType> {
        self.payload.remediation_target().map(TaskPayload::task_type)
    }
}

/// A task to be inserted. Identity (scope, key) is derived, never supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProvisioningTask {
    pub subscription_id: Uuid,
    pub payload: TaskPayload,
    pub generation: i32,
    pub max_attempts: i32,
}

impl NewProvisioningTask {
    pub fn new(subscription_id: Uuid, payload: TaskPayload, max_attempts: i32) -> Self {
        Self {
            subscription_id,
            payload,
            generation: 1,
            max_attempts,
        }
    }

    pub fn with_generation(mut self, generation: i32) -> Self {
        self.generation = generation;
        self
    }

    pub fn task_type(&self) -> TaskType {
        self.payload.task_type()
    }

    pub fn scope(&self) -> String {
        self.payload.scope()
    }

    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::derive(self.subscription_id, &self.scope(), self.generation)
    }

    /// Materialize as a fresh `PENDING` task.
    pub fn into_task(self, now: DateTime<Utc>) -> ProvisioningTask {
        let task_type = self.task_type();
        let scope = self.scope();
        let idempotency_key = self.idempotency_key();
        ProvisioningTask {
            id: Uuid::new_v4(),
            subscription_id: self.subscription_id,
            task_type,
            scope,
            generation: self.generation,
            status: TaskState::Pending,
            payload: self.payload,
            result: None,
            idempotency_key,
            worker_id: None,
            lease_expires_at: None,
            last_heartbeat_at: None,
            attempts: 0,
            max_attempts: self.max_attempts,
            next_retry_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}
