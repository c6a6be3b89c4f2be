//! End-to-end provisioning scenarios against the in-memory store and simulated adapters.

mod common;

use common::TestHarness;
use pod_provisioner::adapters::simulated::{ops, Fault};
use pod_provisioner::adapters::PermanentKind;
use pod_provisioner::orchestration::TaskClaimer;
use pod_provisioner::store::ClaimAttempt;
use pod_provisioner::{
    ProvisioningStore, StepResult, SubscriptionStatus, TaskPayload, TaskState, TaskType,
};
use std::time::Duration;
use uuid::Uuid;

const LEASE: Duration = Duration::from_secs(60);

#[tokio::test]
async fn test_happy_path_with_domain_activates() {
    let h = TestHarness::new();
    let id = h.order(Some("example.test")).await;

    h.drain().await;

    let tasks = h.tasks(id).await;
    assert_eq!(tasks.len(), 5);
    assert!(tasks.iter().all(|t| t.status == TaskState::Completed));
    for task_type in [
        TaskType::CreateContainer,
        TaskType::ConfigureDns,
        TaskType::SetupEmail,
        TaskType::SetupBackup,
        TaskType::Activate,
    ] {
        assert_eq!(h.count_of(id, task_type).await, 1, "{task_type}");
    }

    let sub = h.subscription(id).await;
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert!(sub.activated_at.is_some());
    let container_ref = sub.container_ref.expect("container recorded");
    let ip = sub.ip_address.expect("ip recorded");

    assert_eq!(h.infra.dns.record_for("example.test"), Some(ip));
    assert!(h.infra.mail.has_mailbox("example.test"));
    assert_eq!(
        h.infra.backup.tier_for(&container_ref).as_deref(),
        Some("daily-7")
    );
    assert!(h.infra.compute.is_running(&container_ref));
    assert_eq!(h.infra.compute.created_count(), 1);
}

#[tokio::test]
async fn test_no_domain_skips_dns_and_still_activates() {
    let h = TestHarness::new();
    let id = h.order(None).await;

    h.drain().await;

    assert_eq!(h.count_of(id, TaskType::ConfigureDns).await, 0);
    assert_eq!(
        h.task_of(id, TaskType::Activate).await.unwrap().status,
        TaskState::Completed
    );
    let sub = h.subscription(id).await;
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert!(h
        .infra
        .mail
        .has_mailbox(&format!("{}.mail.pods.local", sub.short_id())));
    assert_eq!(h.infra.dns.created_count(), 0);
}

#[tokio::test]
async fn test_backup_failure_degrades_with_pending_remediation() {
    let h = TestHarness::new();
    h.infra.faults.fail_always(
        ops::ENSURE_BACKUP_SCHEDULE,
        Fault::Permanent(PermanentKind::Quota),
    );
    let id = h.order(Some("example.test")).await;

    h.drain().await;

    let sub = h.subscription(id).await;
    assert_eq!(sub.status, SubscriptionStatus::Degraded);
    assert_eq!(
        h.task_of(id, TaskType::SetupBackup).await.unwrap().status,
        TaskState::Failed
    );
    let remediation = h.task_of(id, TaskType::Remediate).await.unwrap();
    assert_eq!(remediation.status, TaskState::Pending);
    assert_eq!(remediation.scope, "remediate:setup_backup");
    assert_eq!(h.count_of(id, TaskType::Activate).await, 0);

    // A remediation-capable worker finishes the job once the backend recovers
    h.infra.faults.clear(ops::ENSURE_BACKUP_SCHEDULE);
    let remediators = h.pool_with(|c| c.worker.capabilities = TaskType::ALL.to_vec());
    remediators.run_until_idle().await.unwrap();

    assert_eq!(
        h.task_of(id, TaskType::Remediate).await.unwrap().status,
        TaskState::Completed
    );
    assert_eq!(h.subscription(id).await.status, SubscriptionStatus::Active);
    assert_eq!(h.count_of(id, TaskType::Remediate).await, 1);
}

#[tokio::test]
async fn test_compute_failure_fails_subscription_without_children() {
    let h = TestHarness::new();
    h.infra
        .faults
        .fail_always(ops::CLONE_AND_START, Fault::Permanent(PermanentKind::Quota));
    let id = h.order(Some("example.test")).await;

    h.drain().await;

    assert_eq!(h.subscription(id).await.status, SubscriptionStatus::Failed);
    let tasks = h.tasks(id).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskState::Failed);
    assert_eq!(tasks[0].attempts, 1);
    assert_eq!(h.notifier.count_for(id), 1);

    // Re-running aggregation does not notify again
    h.aggregator.reconcile(id).await.unwrap();
    assert_eq!(h.notifier.count_for(id), 1);
}

#[tokio::test]
async fn test_transient_exhaustion_escalates_to_failed() {
    let h = TestHarness::new();
    h.infra
        .faults
        .fail_always(ops::CLONE_AND_START, Fault::Transient);
    let id = h.order(None).await;

    h.drain().await;

    let create = h.task_of(id, TaskType::CreateContainer).await.unwrap();
    assert_eq!(create.status, TaskState::Failed);
    assert_eq!(create.attempts, h.config.execution.default_max_attempts);
    assert_eq!(
        h.infra.faults.calls(ops::CLONE_AND_START),
        h.config.execution.default_max_attempts as usize
    );
    assert!(create.last_error.unwrap().contains("transient"));
    assert_eq!(h.subscription(id).await.status, SubscriptionStatus::Failed);
}

#[tokio::test]
async fn test_transient_failures_recover_within_budget() {
    let h = TestHarness::new();
    h.infra
        .faults
        .push_times(ops::ENSURE_MAILBOX, Fault::Transient, 2);
    let id = h.order(None).await;

    h.drain().await;

    let email = h.task_of(id, TaskType::SetupEmail).await.unwrap();
    assert_eq!(email.status, TaskState::Completed);
    assert_eq!(email.attempts, 2);
    assert_eq!(h.infra.mail.created_count(), 1);
    assert_eq!(h.subscription(id).await.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn test_lost_response_retried_creates_one_resource() {
    let h = TestHarness::new();
    // First call creates the container but the response is lost, and the re-query fails
    h.infra
        .faults
        .push(ops::CLONE_AND_START, Fault::ApplyThenAmbiguous);
    h.infra.faults.push(ops::FIND_CONTAINER, Fault::Transient);
    let id = h.order(None).await;

    h.drain().await;

    let create = h.task_of(id, TaskType::CreateContainer).await.unwrap();
    assert_eq!(create.status, TaskState::Completed);
    assert_eq!(create.attempts, 1);
    assert_eq!(h.infra.faults.calls(ops::CLONE_AND_START), 2);
    assert_eq!(h.infra.compute.created_count(), 1);
    assert_eq!(h.subscription(id).await.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn test_ambiguous_outcome_resolved_by_requery() {
    let h = TestHarness::new();
    h.infra
        .faults
        .push(ops::ENSURE_MAILBOX, Fault::ApplyThenAmbiguous);
    let id = h.order(None).await;

    h.drain().await;

    let email = h.task_of(id, TaskType::SetupEmail).await.unwrap();
    assert_eq!(email.status, TaskState::Completed);
    assert_eq!(email.attempts, 0);
    assert_eq!(h.infra.faults.calls(ops::ENSURE_MAILBOX), 1);
    assert_eq!(h.infra.faults.calls(ops::MAILBOX_PRESENT), 1);
}

#[tokio::test]
async fn test_step_timeout_is_retried() {
    let mut config = common::test_config();
    config.execution.step_timeouts.setup_backup_ms = 20;
    let h = TestHarness::with_config(config);
    h.infra.faults.push(
        ops::ENSURE_BACKUP_SCHEDULE,
        Fault::Delay(Duration::from_millis(500)),
    );
    let id = h.order(None).await;

    h.drain().await;

    let backup = h.task_of(id, TaskType::SetupBackup).await.unwrap();
    assert_eq!(backup.status, TaskState::Completed);
    assert_eq!(backup.attempts, 1);
    assert_eq!(h.infra.faults.calls(ops::SCHEDULE_PRESENT), 1);
    assert_eq!(h.infra.backup.created_count(), 1);
}

#[tokio::test]
async fn test_configure_dns_not_claimable_while_container_running() {
    let h = TestHarness::new();
    let id = h.order(Some("example.test")).await;
    let dns_only = [TaskType::ConfigureDns];

    let ClaimAttempt::Claimed(create) = h
        .store
        .try_claim("create-w", &[TaskType::CreateContainer], LEASE)
        .await
        .unwrap()
    else {
        panic!("container task should be claimable");
    };
    h.store.mark_running(create.id, "create-w", LEASE).await.unwrap();
    assert_eq!(
        h.store.try_claim("dns-w", &dns_only, LEASE).await.unwrap(),
        ClaimAttempt::Empty
    );
    assert_eq!(h.count_of(id, TaskType::ConfigureDns).await, 0);

    let completion = h
        .store
        .complete(
            create.id,
            "create-w",
            StepResult::ContainerReady {
                container_ref: "ct-manual".into(),
                ip_address: "10.20.0.9".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(completion.enqueued.len(), 3);

    let ClaimAttempt::Claimed(dns) = h.store.try_claim("dns-w", &dns_only, LEASE).await.unwrap()
    else {
        panic!("dns task should be claimable after the container completed");
    };
    assert_eq!(
        dns.payload,
        TaskPayload::ConfigureDns {
            domain: "example.test".into(),
            ip_address: "10.20.0.9".into(),
        }
    );
}

#[tokio::test]
async fn test_configure_dns_claimable_only_after_create_completes() {
    let h = TestHarness::new();
    let id = h.order(Some("example.test")).await;
    let dns_only = [TaskType::ConfigureDns];

    let creators = h.pool_with(|c| c.worker.capabilities = vec![TaskType::CreateContainer]);
    assert_eq!(
        h.store.try_claim("dns-w", &dns_only, LEASE).await.unwrap(),
        ClaimAttempt::Empty
    );
    creators.run_until_idle().await.unwrap();

    assert_eq!(
        h.task_of(id, TaskType::CreateContainer).await.unwrap().status,
        TaskState::Completed
    );
    assert!(matches!(
        h.store.try_claim("dns-w", &dns_only, LEASE).await.unwrap(),
        ClaimAttempt::Claimed(_)
    ));
}

#[tokio::test]
async fn test_lease_expiry_lets_another_worker_finish() {
    let h = TestHarness::new();
    let id = h.order(None).await;

    let ClaimAttempt::Claimed(task) = h
        .store
        .try_claim("crashed", &TaskType::default_capabilities(), LEASE)
        .await
        .unwrap()
    else {
        panic!("seed task should be claimable");
    };
    h.store.mark_running(task.id, "crashed", LEASE).await.unwrap();
    assert_eq!(h.drain().await, 0, "live lease blocks other workers");

    h.store
        .force_lease_expiry(task.id, chrono::Utc::now() - chrono::Duration::seconds(1))
        .unwrap();
    h.drain().await;

    let create = h.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(create.status, TaskState::Completed);
    assert_eq!(create.attempts, 1, "expiry from running consumes an attempt");
    assert_ne!(create.worker_id.as_deref(), Some("crashed"));
    assert_eq!(h.subscription(id).await.status, SubscriptionStatus::Active);

    // The crashed worker's late write is refused
    let err = h
        .store
        .fail(
            task.id,
            "crashed",
            "late",
            pod_provisioner::store::FailureDisposition::Permanent,
        )
        .await
        .unwrap_err();
    assert!(err.is_lease_lost());
}

/// Claim `task_type`, start it, then let the lease lapse as if the worker died mid-call
async fn crash_while_running(h: &TestHarness, task_type: TaskType, worker: &str) -> Uuid {
    let ClaimAttempt::Claimed(task) =
        h.store.try_claim(worker, &[task_type], LEASE).await.unwrap()
    else {
        panic!("{task_type} should be claimable");
    };
    h.store.mark_running(task.id, worker, LEASE).await.unwrap();
    h.store
        .force_lease_expiry(task.id, chrono::Utc::now() - chrono::Duration::seconds(1))
        .unwrap();
    task.id
}

#[tokio::test]
async fn test_create_exhausted_by_lease_expiry_fails_subscription() {
    let h = TestHarness::new();
    let id = h.order(Some("example.test")).await;
    let sweeper =
        TaskClaimer::new(h.store.clone(), "sweeper").with_aggregator(h.aggregator.clone());

    for round in 1..h.config.execution.default_max_attempts {
        crash_while_running(&h, TaskType::CreateContainer, &format!("crashed-{round}")).await;
        let released = sweeper.release_expired().await.unwrap();
        assert_eq!(released[0].status, TaskState::Pending);
        assert_eq!(h.subscription(id).await.status, SubscriptionStatus::Provisioning);
    }
    let create_id = crash_while_running(&h, TaskType::CreateContainer, "crashed-last").await;

    // The worker's own sweep finalizes the last attempt
    assert_eq!(h.drain().await, 0);

    let create = h.store.get_task(create_id).await.unwrap().unwrap();
    assert_eq!(create.status, TaskState::Failed);
    assert_eq!(create.attempts, h.config.execution.default_max_attempts);
    assert_eq!(h.subscription(id).await.status, SubscriptionStatus::Failed);
    assert_eq!(h.notifier.count_for(id), 1);
    assert_eq!(h.tasks(id).await.len(), 1, "no secondary step enqueued");
    assert_eq!(h.infra.compute.created_count(), 0);
}

#[tokio::test]
async fn test_backup_exhausted_by_lease_expiry_degrades_subscription() {
    let h = TestHarness::new();
    let id = h.order(None).await;
    let creators = h.pool_with(|c| c.worker.capabilities = vec![TaskType::CreateContainer]);
    creators.run_until_idle().await.unwrap();

    for round in 0..h.config.execution.default_max_attempts {
        crash_while_running(&h, TaskType::SetupBackup, &format!("crashed-{round}")).await;
        if round + 1 < h.config.execution.default_max_attempts {
            let sweeper = TaskClaimer::new(h.store.clone(), "sweeper");
            sweeper.release_expired().await.unwrap();
        }
    }
    h.drain().await;

    let backup = h.task_of(id, TaskType::SetupBackup).await.unwrap();
    assert_eq!(backup.status, TaskState::Failed);
    assert_eq!(
        h.task_of(id, TaskType::SetupEmail).await.unwrap().status,
        TaskState::Completed
    );

    let sub = h.subscription(id).await;
    assert_eq!(sub.status, SubscriptionStatus::Degraded);
    let remediation = h.task_of(id, TaskType::Remediate).await.unwrap();
    assert_eq!(remediation.scope, "remediate:setup_backup");
    assert_eq!(remediation.status, TaskState::Pending);
    assert_eq!(h.count_of(id, TaskType::Activate).await, 0);
    assert_eq!(h.notifier.count_for(id), 0);
}

#[tokio::test]
async fn test_deprovision_mid_provision_cancels_and_tears_down() {
    let h = TestHarness::new();
    let id = h.order(Some("example.test")).await;
    let creators = h.pool_with(|c| c.worker.capabilities = vec![TaskType::CreateContainer]);
    creators.run_until_idle().await.unwrap();

    // One child is in flight when the customer cancels
    let ClaimAttempt::Claimed(in_flight) = h
        .store
        .try_claim("slow", &[TaskType::SetupEmail], LEASE)
        .await
        .unwrap()
    else {
        panic!("email task should be claimable");
    };

    let outcome = h
        .admin
        .request_deprovision(id, "customer cancelled")
        .await
        .unwrap();
    assert_eq!(outcome.subscription.status, SubscriptionStatus::Deprovisioning);
    assert_eq!(outcome.cancelled.len(), 2, "dns and backup were still queued");

    // Teardown waits for the in-flight claim
    assert_eq!(
        h.store
            .try_claim("w", &[TaskType::Deprovision], LEASE)
            .await
            .unwrap(),
        ClaimAttempt::Empty
    );
    let cancelled = h.executor.execute(in_flight, "slow").await.unwrap();
    assert_eq!(cancelled, pod_provisioner::orchestration::ExecutionOutcome::Cancelled);

    h.drain().await;

    let sub = h.subscription(id).await;
    assert_eq!(sub.status, SubscriptionStatus::Deprovisioned);
    let container_ref = sub.container_ref.unwrap();
    assert!(!h.infra.compute.is_running(&container_ref));
    assert!(h.infra.dns.record_for("example.test").is_none());
    assert!(!h.infra.mail.has_mailbox("example.test"));
    assert!(h.infra.backup.tier_for(&container_ref).is_none());
    assert_eq!(h.count_of(id, TaskType::Activate).await, 0);
    assert_eq!(h.infra.mail.created_count(), 0);

    let teardown = h.task_of(id, TaskType::Deprovision).await.unwrap();
    assert!(matches!(teardown.payload, TaskPayload::Deprovision { .. }));
    assert_eq!(teardown.status, TaskState::Completed);

    // Repeating the request is a no-op
    let again = h.admin.request_deprovision(id, "again").await.unwrap();
    assert_eq!(again.deprovision_task.id, teardown.id);
}

#[tokio::test]
async fn test_admin_retry_creates_new_generation() {
    let h = TestHarness::new();
    h.infra.faults.fail_always(
        ops::ENSURE_BACKUP_SCHEDULE,
        Fault::Permanent(PermanentKind::Auth),
    );
    let id = h.order(None).await;
    h.drain().await;
    assert_eq!(h.subscription(id).await.status, SubscriptionStatus::Degraded);

    let failed = h.task_of(id, TaskType::SetupBackup).await.unwrap();
    h.infra.faults.clear(ops::ENSURE_BACKUP_SCHEDULE);
    let retried = h.admin.retry_failed(failed.id).await.unwrap();
    assert_eq!(retried.generation, 2);
    assert_eq!(retried.scope, failed.scope);
    assert_ne!(retried.idempotency_key, failed.idempotency_key);
    assert_eq!(retried.status, TaskState::Pending);

    // The old generation cannot be retried again
    assert!(h.admin.retry_failed(failed.id).await.is_err());

    h.drain().await;
    assert_eq!(
        h.task_of(id, TaskType::SetupBackup).await.unwrap().status,
        TaskState::Completed
    );
    assert_eq!(h.subscription(id).await.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn test_admin_retry_reopens_failed_subscription() {
    let h = TestHarness::new();
    h.infra
        .faults
        .push(ops::CLONE_AND_START, Fault::Permanent(PermanentKind::Quota));
    let id = h.order(None).await;
    h.drain().await;
    assert_eq!(h.subscription(id).await.status, SubscriptionStatus::Failed);

    let failed = h.task_of(id, TaskType::CreateContainer).await.unwrap();
    h.admin.retry_failed(failed.id).await.unwrap();
    assert_eq!(
        h.subscription(id).await.status,
        SubscriptionStatus::Provisioning
    );

    h.drain().await;
    assert_eq!(h.subscription(id).await.status, SubscriptionStatus::Active);
    assert_eq!(h.infra.compute.created_count(), 1);
}

#[tokio::test]
async fn test_admin_cancel_skips_failed_step() {
    let h = TestHarness::new();
    h.infra.faults.fail_always(
        ops::ENSURE_MAILBOX,
        Fault::Permanent(PermanentKind::Validation),
    );
    let id = h.order(None).await;
    h.drain().await;
    assert_eq!(h.subscription(id).await.status, SubscriptionStatus::Degraded);

    let email = h.task_of(id, TaskType::SetupEmail).await.unwrap();
    let dismissed = h
        .admin
        .cancel_failed(email.id, "customer uses external mail")
        .await
        .unwrap();
    assert_eq!(dismissed.status, TaskState::Cancelled);

    h.drain().await;
    assert_eq!(h.subscription(id).await.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn test_suspended_status_is_held() {
    let h = TestHarness::new();
    let id = h.order(None).await;
    h.admin.suspend(id).await.unwrap();

    h.drain().await;
    assert_eq!(h.subscription(id).await.status, SubscriptionStatus::Suspended);

    let resumed = h.admin.resume(id).await.unwrap();
    assert_eq!(resumed.status, SubscriptionStatus::Active);
}
