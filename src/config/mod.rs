//! # Provisioner Configuration
//!
//! Layered, environment-aware configuration. Every section has working defaults so an empty
//! file (or no file) yields a runnable development setup; TOML files and `PODPROV__*`
//! environment variables override individual keys.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pod_provisioner::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let lease = manager.config().worker.lease_duration();
//! let workers = manager.config().worker.worker_count;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use crate::models::{ContainerSpec, TaskPayload, TaskType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring `config/pod-provisioner.toml`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Task store connection settings
    pub database: DatabaseConfig,

    /// Worker loop, claim and lease settings
    pub worker: WorkerConfig,

    /// Retry backoff curve
    pub backoff: BackoffConfig,

    /// Attempt budget and per-step adapter timeouts
    pub execution: ExecutionConfig,

    /// Plan catalog and platform naming
    pub provisioning: ProvisioningConfig,

    /// Log level and output format
    pub logging: LoggingConfig,
}

impl ProvisionerConfig {
    /// Validate cross-field constraints. Loading succeeds only for valid configurations.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "url",
                "database configuration",
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigurationError::invalid_value(
                "database.max_connections",
                self.database.max_connections,
                "must be greater than 0",
            ));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigurationError::invalid_value(
                "database.min_connections",
                self.database.min_connections,
                "cannot exceed database.max_connections",
            ));
        }

        let worker = &self.worker;
        if worker.worker_count == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker.worker_count",
                worker.worker_count,
                "must be greater than 0",
            ));
        }
        if worker.poll_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker.poll_interval_ms",
                worker.poll_interval_ms,
                "must be greater than 0",
            ));
        }
        if worker.heartbeat_interval_ms == 0
            || worker.heartbeat_interval_ms >= worker.lease_duration_ms
        {
            return Err(ConfigurationError::invalid_value(
                "worker.heartbeat_interval_ms",
                worker.heartbeat_interval_ms,
                format!(
                    "must be positive and shorter than worker.lease_duration_ms ({})",
                    worker.lease_duration_ms
                ),
            ));
        }
        if worker.capabilities.is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "capabilities",
                "worker configuration",
            ));
        }
        if worker.claim_retry_limit == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker.claim_retry_limit",
                worker.claim_retry_limit,
                "must be greater than 0",
            ));
        }

        let backoff = &self.backoff;
        if backoff.multiplier < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "backoff.multiplier",
                backoff.multiplier,
                "must be at least 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&backoff.max_jitter) {
            return Err(ConfigurationError::invalid_value(
                "backoff.max_jitter",
                backoff.max_jitter,
                "must be between 0.0 and 1.0",
            ));
        }
        if backoff.base_delay_ms > backoff.max_delay_ms {
            return Err(ConfigurationError::invalid_value(
                "backoff.base_delay_ms",
                backoff.base_delay_ms,
                "cannot exceed backoff.max_delay_ms",
            ));
        }

        if self.execution.default_max_attempts < 1 {
            return Err(ConfigurationError::invalid_value(
                "execution.default_max_attempts",
                self.execution.default_max_attempts,
                "must be at least 1",
            ));
        }

        if self.provisioning.plans.is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "plans",
                "provisioning configuration",
            ));
        }
        for (code, plan) in &self.provisioning.plans {
            if plan.cpu_cores == 0 || plan.ram_mb == 0 || plan.disk_gb == 0 {
                return Err(ConfigurationError::invalid_value(
                    format!("provisioning.plans.{code}"),
                    format!("{}cpu/{}MB/{}GB", plan.cpu_cores, plan.ram_mb, plan.disk_gb),
                    "plan resources must be non-zero",
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
    /// Apply pending migrations when a worker starts
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/pod_provisioner_development".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_seconds: 10,
            run_migrations: true,
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_count: usize,
    /// Sleep between polls when no task is claimable
    pub poll_interval_ms: u64,
    /// Lease granted on claim and on each heartbeat
    pub lease_duration_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Task types this process executes
    pub capabilities: Vec<TaskType>,
    /// Selection retries after losing a claim race
    pub claim_retry_limit: u32,
    /// Pause after a store error before polling again
    pub error_backoff_ms: u64,
    pub worker_id_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval_ms: 500,
            // 2x the longest default step timeout (create_container, 120s)
            lease_duration_ms: 240_000,
            heartbeat_interval_ms: 60_000,
            capabilities: TaskType::default_capabilities(),
            claim_retry_limit: 5,
            error_backoff_ms: 1_000,
            worker_id_prefix: "pod-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter_enabled: bool,
    /// Maximum jitter as a fraction of the delay (0.0 to 1.0)
    pub max_jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 300_000, // 5 minutes
            multiplier: 2.0,
            jitter_enabled: true,
            max_jitter: 0.1,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub default_max_attempts: i32,
    pub step_timeouts: StepTimeouts,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 5,
            step_timeouts: StepTimeouts::default(),
        }
    }
}

/// Maximum adapter-call duration per task type
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StepTimeouts {
    pub create_container_ms: u64,
    pub configure_dns_ms: u64,
    pub setup_email_ms: u64,
    pub setup_backup_ms: u64,
    pub activate_ms: u64,
    pub deprovision_ms: u64,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            create_container_ms: 120_000,
            configure_dns_ms: 30_000,
            setup_email_ms: 30_000,
            setup_backup_ms: 60_000,
            activate_ms: 30_000,
            deprovision_ms: 120_000,
        }
    }
}

impl StepTimeouts {
    pub fn for_type(&self, task_type: TaskType) -> Duration {
        let ms = match task_type {
            TaskType::CreateContainer => self.create_container_ms,
            TaskType::ConfigureDns => self.configure_dns_ms,
            TaskType::SetupEmail => self.setup_email_ms,
            TaskType::SetupBackup => self.setup_backup_ms,
            TaskType::Activate => self.activate_ms,
            TaskType::Deprovision => self.deprovision_ms,
            // Remediations are resolved through their target in `for_payload`
            TaskType::Remediate => self.longest_ms(),
        };
        Duration::from_millis(ms)
    }

    /// A remediation runs its target's operation and gets the target's timeout.
    pub fn for_payload(&self, payload: &TaskPayload) -> Duration {
        match payload.remediation_target() {
            Some(target) => self.for_type(target.task_type()),
            None => self.for_type(payload.task_type()),
        }
    }

    fn longest_ms(&self) -> u64 {
        [
            self.create_container_ms,
            self.configure_dns_ms,
            self.setup_email_ms,
            self.setup_backup_ms,
            self.activate_ms,
            self.deprovision_ms,
        ]
        .into_iter()
        .max()
        .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Network the compute adapter attaches new containers to
    pub network: String,
    /// Parent domain for platform mailboxes of pods ordered without a domain
    pub mail_domain_suffix: String,
    pub plans: HashMap<String, PlanSpec>,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        let plans = HashMap::from([
            (
                "pod-small".to_string(),
                PlanSpec {
                    template_id: "tmpl-debian-12".to_string(),
                    cpu_cores: 1,
                    ram_mb: 2_048,
                    disk_gb: 20,
                    backup_tier: "daily-7".to_string(),
                },
            ),
            (
                "pod-medium".to_string(),
                PlanSpec {
                    template_id: "tmpl-debian-12".to_string(),
                    cpu_cores: 2,
                    ram_mb: 4_096,
                    disk_gb: 60,
                    backup_tier: "daily-14".to_string(),
                },
            ),
            (
                "pod-large".to_string(),
                PlanSpec {
                    template_id: "tmpl-debian-12".to_string(),
                    cpu_cores: 4,
                    ram_mb: 8_192,
                    disk_gb: 160,
                    backup_tier: "hourly-30".to_string(),
                },
            ),
        ]);

        Self {
            network: "pods-vlan".to_string(),
            mail_domain_suffix: "mail.pods.local".to_string(),
            plans,
        }
    }
}

/// Resources and backup policy for a plan code
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PlanSpec {
    pub template_id: String,
    pub cpu_cores: u32,
    pub ram_mb: u32,
    pub disk_gb: u32,
    pub backup_tier: String,
}

impl PlanSpec {
    pub fn container_spec(&self, network: &str) -> ContainerSpec {
        ContainerSpec {
            template_id: self.template_id.clone(),
            cpu_cores: self.cpu_cores,
            ram_mb: self.ram_mb,
            disk_gb: self.disk_gb,
            network: network.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}
