//! # Simulated Infrastructure
//!
//! In-process adapters backed by concurrent maps, used by the test suite and by the local
//! worker binary. They honour the idempotency contract exactly like a real backend would
//! and accept scripted faults per operation, so failure paths can be exercised
//! deterministically.
//!
//! ```rust
//! use pod_provisioner::adapters::simulated::{ops, Fault, SimulatedInfrastructure};
//! use pod_provisioner::adapters::PermanentKind;
//!
//! let infra = SimulatedInfrastructure::new();
//! infra.faults.fail_always(ops::ENSURE_BACKUP_SCHEDULE, Fault::Permanent(PermanentKind::Quota));
//! let adapters = infra.adapters();
//! ```

use super::{
    AdapterError, AdapterResult, Adapters, BackupAdapter, ComputeAdapter, ContainerHandle,
    DnsAdapter, MailAdapter, PermanentKind,
};
use crate::models::{ContainerSpec, IdempotencyKey};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Operation names faults can be scripted against
pub mod ops {
    pub const CLONE_AND_START: &str = "clone_and_start";
    pub const FIND_CONTAINER: &str = "find_container";
    pub const ENSURE_RUNNING: &str = "ensure_running";
    pub const DESTROY_CONTAINER: &str = "destroy_container";
    pub const ENSURE_ZONE_AND_RECORDS: &str = "ensure_zone_and_records";
    pub const RECORDS_PRESENT: &str = "records_present";
    pub const REMOVE_ZONE: &str = "remove_zone";
    pub const ENSURE_MAILBOX: &str = "ensure_mailbox";
    pub const MAILBOX_PRESENT: &str = "mailbox_present";
    pub const REMOVE_MAILBOX: &str = "remove_mailbox";
    pub const ENSURE_BACKUP_SCHEDULE: &str = "ensure_backup_schedule";
    pub const SCHEDULE_PRESENT: &str = "schedule_present";
    pub const REMOVE_BACKUP_SCHEDULE: &str = "remove_backup_schedule";
}

/// A scripted misbehaviour for one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Transient,
    Permanent(PermanentKind),
    /// Fail without applying the change and report an unknown outcome
    Ambiguous,
    /// Apply the change, then report an unknown outcome (lost response)
    ApplyThenAmbiguous,
    /// Apply the change after a delay
    Delay(Duration),
}

enum Gate {
    Apply,
    ApplyThenAmbiguous,
}

/// Per-operation fault queue plus call counters, shared by all simulated adapters
#[derive(Debug, Default)]
pub struct FaultScript {
    queued: DashMap<&'static str, VecDeque<Fault>>,
    persistent: DashMap<&'static str, Fault>,
    calls: DashMap<&'static str, usize>,
}

impl FaultScript {
    /// Inject `fault` into the next call of `op`. Queued faults are consumed in order.
    pub fn push(&self, op: &'static str, fault: Fault) {
        self.queued.entry(op).or_default().push_back(fault);
    }

    /// Inject `fault` into the next `times` calls of `op`
    pub fn push_times(&self, op: &'static str, fault: Fault, times: usize) {
        for _ in 0..times {
            self.push(op, fault.clone());
        }
    }

    /// Inject `fault` into every call of `op` once queued faults run out
    pub fn fail_always(&self, op: &'static str, fault: Fault) {
        self.persistent.insert(op, fault);
    }

    pub fn clear(&self, op: &'static str) {
        self.queued.remove(op);
        self.persistent.remove(op);
    }

    pub fn calls(&self, op: &str) -> usize {
        self.calls.get(op).map(|c| *c).unwrap_or(0)
    }

    fn next_fault(&self, op: &'static str) -> Option<Fault> {
        *self.calls.entry(op).or_insert(0) += 1;
        let queued = self
            .queued
            .get_mut(op)
            .and_then(|mut queue| queue.pop_front());
        queued.or_else(|| self.persistent.get(op).map(|f| f.clone()))
    }

    async fn gate(&self, op: &'static str) -> AdapterResult<Gate> {
        match self.next_fault(op) {
            None => Ok(Gate::Apply),
            Some(fault) => {
                debug!(op = op, fault = ?fault, "Simulated fault injected");
                match fault {
                    Fault::Transient => Err(AdapterError::transient(format!(
                        "{op}: 503 service unavailable"
                    ))),
                    Fault::Permanent(kind) => Err(AdapterError::permanent(
                        kind,
                        format!("{op} rejected"),
                    )),
                    Fault::Ambiguous => Err(AdapterError::ambiguous(format!(
                        "{op}: connection reset"
                    ))),
                    Fault::ApplyThenAmbiguous => Ok(Gate::ApplyThenAmbiguous),
                    Fault::Delay(delay) => {
                        tokio::time::sleep(delay).await;
                        Ok(Gate::Apply)
                    }
                }
            }
        }
    }

    fn finish(op: &'static str, gate: Gate) -> AdapterResult<()> {
        match gate {
            Gate::Apply => Ok(()),
            Gate::ApplyThenAmbiguous => Err(AdapterError::ambiguous(format!(
                "{op}: response lost after request was accepted"
            ))),
        }
    }
}

#[derive(Debug)]
pub struct SimulatedCompute {
    faults: Arc<FaultScript>,
    containers: DashMap<IdempotencyKey, ContainerHandle>,
    running: DashMap<String, bool>,
    created: AtomicUsize,
    next_id: AtomicU64,
}

impl SimulatedCompute {
    pub fn new(faults: Arc<FaultScript>) -> Self {
        Self {
            faults,
            containers: DashMap::new(),
            running: DashMap::new(),
            created: AtomicUsize::new(0),
            next_id: AtomicU64::new(100),
        }
    }

    /// Containers ever created, regardless of later teardown
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Containers currently present
    pub fn container_count(&self) -> usize {
        self.running.len()
    }

    pub fn is_running(&self, container_ref: &str) -> bool {
        self.running.get(container_ref).map(|r| *r).unwrap_or(false)
    }
}

#[async_trait]
impl ComputeAdapter for SimulatedCompute {
    async fn clone_and_start(
        &self,
        key: IdempotencyKey,
        spec: &ContainerSpec,
    ) -> AdapterResult<ContainerHandle> {
        let gate = self.faults.gate(ops::CLONE_AND_START).await?;
        if spec.template_id.is_empty() {
            return Err(AdapterError::permanent(
                PermanentKind::Validation,
                "template id is required",
            ));
        }

        let handle = self
            .containers
            .entry(key)
            .or_insert_with(|| {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                self.created.fetch_add(1, Ordering::SeqCst);
                ContainerHandle {
                    container_ref: format!("ct-{id}"),
                    ip_address: format!("10.20.{}.{}", (id / 250) % 250, id % 250 + 2),
                }
            })
            .clone();
        self.running.insert(handle.container_ref.clone(), true);

        FaultScript::finish(ops::CLONE_AND_START, gate)?;
        Ok(handle)
    }

    async fn find_container(&self, key: IdempotencyKey) -> AdapterResult<Option<ContainerHandle>> {
        self.faults.gate(ops::FIND_CONTAINER).await?;
        Ok(self
            .containers
            .get(&key)
            .map(|h| h.clone())
            .filter(|h| self.running.contains_key(&h.container_ref)))
    }

    async fn ensure_running(&self, _key: IdempotencyKey, container_ref: &str) -> AdapterResult<()> {
        let gate = self.faults.gate(ops::ENSURE_RUNNING).await?;
        match self.running.get_mut(container_ref) {
            Some(mut running) => *running = true,
            None => {
                return Err(AdapterError::permanent(
                    PermanentKind::Validation,
                    format!("unknown container {container_ref}"),
                ))
            }
        }
        FaultScript::finish(ops::ENSURE_RUNNING, gate)
    }

    async fn destroy_container(
        &self,
        _key: IdempotencyKey,
        container_ref: &str,
    ) -> AdapterResult<()> {
        let gate = self.faults.gate(ops::DESTROY_CONTAINER).await?;
        self.running.remove(container_ref);
        FaultScript::finish(ops::DESTROY_CONTAINER, gate)
    }
}

#[derive(Debug)]
pub struct SimulatedDns {
    faults: Arc<FaultScript>,
    zones: DashMap<String, String>,
    created: AtomicUsize,
}

impl SimulatedDns {
    pub fn new(faults: Arc<FaultScript>) -> Self {
        Self {
            faults,
            zones: DashMap::new(),
            created: AtomicUsize::new(0),
        }
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Address the zone's records point at
    pub fn record_for(&self, domain: &str) -> Option<String> {
        self.zones.get(domain).map(|ip| ip.clone())
    }
}

#[async_trait]
impl DnsAdapter for SimulatedDns {
    async fn ensure_zone_and_records(
        &self,
        _key: IdempotencyKey,
        domain: &str,
        ip_address: &str,
    ) -> AdapterResult<()> {
        let gate = self.faults.gate(ops::ENSURE_ZONE_AND_RECORDS).await?;
        if self
            .zones
            .insert(domain.to_string(), ip_address.to_string())
            .is_none()
        {
            self.created.fetch_add(1, Ordering::SeqCst);
        }
        FaultScript::finish(ops::ENSURE_ZONE_AND_RECORDS, gate)
    }

    async fn records_present(&self, domain: &str, ip_address: &str) -> AdapterResult<bool> {
        self.faults.gate(ops::RECORDS_PRESENT).await?;
        Ok(self
            .zones
            .get(domain)
            .is_some_and(|ip| ip.as_str() == ip_address))
    }

    async fn remove_zone(&self, _key: IdempotencyKey, domain: &str) -> AdapterResult<()> {
        let gate = self.faults.gate(ops::REMOVE_ZONE).await?;
        self.zones.remove(domain);
        FaultScript::finish(ops::REMOVE_ZONE, gate)
    }
}

#[derive(Debug)]
pub struct SimulatedMail {
    faults: Arc<FaultScript>,
    mailboxes: DashMap<String, IdempotencyKey>,
    created: AtomicUsize,
}

impl SimulatedMail {
    pub fn new(faults: Arc<FaultScript>) -> Self {
        Self {
            faults,
            mailboxes: DashMap::new(),
            created: AtomicUsize::new(0),
        }
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn has_mailbox(&self, domain: &str) -> bool {
        self.mailboxes.contains_key(domain)
    }
}

#[async_trait]
impl MailAdapter for SimulatedMail {
    async fn ensure_mailbox(&self, key: IdempotencyKey, domain: &str) -> AdapterResult<()> {
        let gate = self.faults.gate(ops::ENSURE_MAILBOX).await?;
        if self.mailboxes.insert(domain.to_string(), key).is_none() {
            self.created.fetch_add(1, Ordering::SeqCst);
        }
        FaultScript::finish(ops::ENSURE_MAILBOX, gate)
    }

    async fn mailbox_present(&self, domain: &str) -> AdapterResult<bool> {
        self.faults.gate(ops::MAILBOX_PRESENT).await?;
        Ok(self.mailboxes.contains_key(domain))
    }

    async fn remove_mailbox(&self, _key: IdempotencyKey, domain: &str) -> AdapterResult<()> {
        let gate = self.faults.gate(ops::REMOVE_MAILBOX).await?;
        self.mailboxes.remove(domain);
        FaultScript::finish(ops::REMOVE_MAILBOX, gate)
    }
}

#[derive(Debug)]
pub struct SimulatedBackup {
    faults: Arc<FaultScript>,
    schedules: DashMap<String, String>,
    created: AtomicUsize,
}

impl SimulatedBackup {
    pub fn new(faults: Arc<FaultScript>) -> Self {
        Self {
            faults,
            schedules: DashMap::new(),
            created: AtomicUsize::new(0),
        }
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn tier_for(&self, container_ref: &str) -> Option<String> {
        self.schedules.get(container_ref).map(|t| t.clone())
    }
}

#[async_trait]
impl BackupAdapter for SimulatedBackup {
    async fn ensure_backup_schedule(
        &self,
        _key: IdempotencyKey,
        container_ref: &str,
        tier: &str,
    ) -> AdapterResult<()> {
        let gate = self.faults.gate(ops::ENSURE_BACKUP_SCHEDULE).await?;
        if self
            .schedules
            .insert(container_ref.to_string(), tier.to_string())
            .is_none()
        {
            self.created.fetch_add(1, Ordering::SeqCst);
        }
        FaultScript::finish(ops::ENSURE_BACKUP_SCHEDULE, gate)
    }

    async fn schedule_present(&self, container_ref: &str) -> AdapterResult<bool> {
        self.faults.gate(ops::SCHEDULE_PRESENT).await?;
        Ok(self.schedules.contains_key(container_ref))
    }

    async fn remove_backup_schedule(
        &self,
        _key: IdempotencyKey,
        container_ref: &str,
    ) -> AdapterResult<()> {
        let gate = self.faults.gate(ops::REMOVE_BACKUP_SCHEDULE).await?;
        self.schedules.remove(container_ref);
        FaultScript::finish(ops::REMOVE_BACKUP_SCHEDULE, gate)
    }
}

/// All four simulated backends sharing one fault script
#[derive(Debug, Clone)]
pub struct SimulatedInfrastructure {
    pub faults: Arc<FaultScript>,
    pub compute: Arc<SimulatedCompute>,
    pub dns: Arc<SimulatedDns>,
    pub mail: Arc<SimulatedMail>,
    pub backup: Arc<SimulatedBackup>,
}

impl Default for SimulatedInfrastructure {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedInfrastructure {
    pub fn new() -> Self {
        let faults = Arc::new(FaultScript::default());
        Self {
            compute: Arc::new(SimulatedCompute::new(faults.clone())),
            dns: Arc::new(SimulatedDns::new(faults.clone())),
            mail: Arc::new(SimulatedMail::new(faults.clone())),
            backup: Arc::new(SimulatedBackup::new(faults.clone())),
            faults,
        }
    }

    pub fn adapters(&self) -> Adapters {
        Adapters {
            compute: self.compute.clone(),
            dns: self.dns.clone(),
            mail: self.mail.clone(),
            backup: self.backup.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            template_id: "tmpl-debian-12".into(),
            cpu_cores: 1,
            ram_mb: 1024,
            disk_gb: 10,
            network: "pods".into(),
        }
    }

    #[tokio::test]
    async fn test_clone_and_start_is_idempotent_by_key() {
        let infra = SimulatedInfrastructure::new();
        let key = IdempotencyKey::derive(Uuid::new_v4(), "create_container", 1);

        let first = infra.compute.clone_and_start(key, &spec()).await.unwrap();
        let second = infra.compute.clone_and_start(key, &spec()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(infra.compute.created_count(), 1);
        assert_eq!(infra.faults.calls(ops::CLONE_AND_START), 2);
    }

    #[tokio::test]
    async fn test_apply_then_ambiguous_leaves_resource() {
        let infra = SimulatedInfrastructure::new();
        infra
            .faults
            .push(ops::CLONE_AND_START, Fault::ApplyThenAmbiguous);
        let key = IdempotencyKey::derive(Uuid::new_v4(), "create_container", 1);

        let err = infra.compute.clone_and_start(key, &spec()).await.unwrap_err();
        assert!(err.is_ambiguous());

        let found = infra.compute.find_container(key).await.unwrap();
        assert!(found.is_some());
        assert_eq!(infra.compute.created_count(), 1);
    }

    #[tokio::test]
    async fn test_queued_faults_consumed_before_persistent() {
        let infra = SimulatedInfrastructure::new();
        infra.faults.push(ops::ENSURE_MAILBOX, Fault::Transient);
        let key = IdempotencyKey::derive(Uuid::new_v4(), "setup_email", 1);

        assert!(matches!(
            infra.mail.ensure_mailbox(key, "example.test").await,
            Err(AdapterError::Transient { .. })
        ));
        infra.mail.ensure_mailbox(key, "example.test").await.unwrap();
        assert!(infra.mail.has_mailbox("example.test"));

        infra.faults.fail_always(
            ops::ENSURE_MAILBOX,
            Fault::Permanent(PermanentKind::Auth),
        );
        for _ in 0..3 {
            assert!(matches!(
                infra.mail.ensure_mailbox(key, "example.test").await,
                Err(AdapterError::Permanent {
                    kind: PermanentKind::Auth,
                    ..
                })
            ));
        }
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let infra = SimulatedInfrastructure::new();
        let key = IdempotencyKey::derive(Uuid::new_v4(), "deprovision", 1);

        infra.dns.remove_zone(key, "missing.test").await.unwrap();
        infra.compute.destroy_container(key, "ct-404").await.unwrap();
        infra
            .backup
            .remove_backup_schedule(key, "ct-404")
            .await
            .unwrap();
    }
}
