//! # Dependency Graph
//!
//! The fixed per-subscription DAG:
//!
//! ```text
//!                    ┌──▶ CONFIGURE_DNS (only with a domain) ──┐
//! CREATE_CONTAINER ──┼──▶ SETUP_EMAIL ─────────────────────────┼──▶ ACTIVATE
//!                    └──▶ SETUP_BACKUP ────────────────────────┘
//! ```
//!
//! Planning is a pure function of the subscription and its tasks, so the completion
//! transaction and the aggregator's backstop make the same decisions. Only scopes that do
//! not exist yet are planned, which keeps sibling completions from enqueueing a second
//! ACTIVATE.

use crate::models::{
    CloudPodSubscription, NewProvisioningTask, ProvisioningTask, StepResult, TaskPayload,
    TaskType,
};
use crate::state_machine::TaskState;

/// Latest generation of a scope
pub fn latest_in_scope<'a>(
    tasks: &'a [ProvisioningTask],
    scope: &str,
) -> Option<&'a ProvisioningTask> {
    tasks
        .iter()
        .filter(|t| t.scope == scope)
        .max_by_key(|t| t.generation)
}

/// Latest generation of a non-remediation step
pub fn latest_of_type(
    tasks: &[ProvisioningTask],
    task_type: TaskType,
) -> Option<&ProvisioningTask> {
    latest_in_scope(tasks, task_type.as_str())
}

pub fn has_scope(tasks: &[ProvisioningTask], scope: &str) -> bool {
    tasks.iter().any(|t| t.scope == scope)
}

pub fn remediation_scope(target: TaskType) -> String {
    format!("{}:{}", TaskType::Remediate, target)
}

/// Whether any generation of the remediation for `target` completed
pub fn remediation_completed(tasks: &[ProvisioningTask], target: TaskType) -> bool {
    let scope = remediation_scope(target);
    tasks
        .iter()
        .any(|t| t.scope == scope && t.status == TaskState::Completed)
}

/// A step counts as done for its dependents when its latest generation completed, a
/// remediation of it completed, or an operator dismissed it.
pub fn is_satisfied(tasks: &[ProvisioningTask], task_type: TaskType) -> bool {
    let latest_ok = latest_of_type(tasks, task_type)
        .is_some_and(|t| matches!(t.status, TaskState::Completed | TaskState::Cancelled));
    latest_ok || remediation_completed(tasks, task_type)
}

/// Steps ACTIVATE waits for, given the container creation payload
pub fn required_before_activation(create_payload: &TaskPayload) -> Vec<TaskType> {
    let mut required = Vec::with_capacity(3);
    if let TaskPayload::CreateContainer {
        domain: Some(_), ..
    } = create_payload
    {
        required.push(TaskType::ConfigureDns);
    }
    required.push(TaskType::SetupEmail);
    required.push(TaskType::SetupBackup);
    required
}

/// Dependent tasks that are ready and not yet enqueued
pub fn plan_followups(
    subscription: &CloudPodSubscription,
    tasks: &[ProvisioningTask],
) -> Vec<NewProvisioningTask> {
    if subscription.status.is_tearing_down() {
        return Vec::new();
    }

    let Some(create) = latest_of_type(tasks, TaskType::CreateContainer) else {
        return Vec::new();
    };
    if create.status != TaskState::Completed {
        return Vec::new();
    }
    let (
        TaskPayload::CreateContainer {
            domain,
            mail_domain,
            backup_tier,
            ..
        },
        Some(StepResult::ContainerReady {
            container_ref,
            ip_address,
        }),
    ) = (&create.payload, &create.result)
    else {
        tracing::warn!(
            task_id = %create.id,
            "Completed container creation has no container result; nothing to plan"
        );
        return Vec::new();
    };

    let mut children = Vec::with_capacity(4);
    if let Some(domain) = domain {
        children.push(TaskPayload::ConfigureDns {
            domain: domain.clone(),
            ip_address: ip_address.clone(),
        });
    }
    children.push(TaskPayload::SetupEmail {
        domain: mail_domain.clone(),
    });
    children.push(TaskPayload::SetupBackup {
        container_ref: container_ref.clone(),
        tier: backup_tier.clone(),
    });

    let mut planned: Vec<NewProvisioningTask> = children
        .into_iter()
        .filter(|payload| !has_scope(tasks, &payload.scope()))
        .map(|payload| NewProvisioningTask::new(subscription.id, payload, create.max_attempts))
        .collect();

    let ready_to_activate = required_before_activation(&create.payload)
        .into_iter()
        .all(|step| is_satisfied(tasks, step));
    if ready_to_activate && !has_scope(tasks, TaskType::Activate.as_str()) {
        planned.push(NewProvisioningTask::new(
            subscription.id,
            TaskPayload::Activate {
                container_ref: container_ref.clone(),
            },
            create.max_attempts,
        ));
    }

    planned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerSpec, NewSubscription};
    use chrono::Utc;
    use uuid::Uuid;

    fn subscription(domain: Option<&str>) -> CloudPodSubscription {
        NewSubscription {
            customer_id: "cust".into(),
            plan_code: "pod-small".into(),
            domain: domain.map(str::to_string),
        }
        .into_subscription(Uuid::new_v4(), Utc::now())
    }

    fn create_task(sub: &CloudPodSubscription, status: TaskState) -> ProvisioningTask {
        let mut task = NewProvisioningTask::new(
            sub.id,
            TaskPayload::CreateContainer {
                plan_code: "pod-small".into(),
                container: ContainerSpec {
                    template_id: "tmpl".into(),
                    cpu_cores: 1,
                    ram_mb: 1024,
                    disk_gb: 10,
                    network: "pods".into(),
                },
                domain: sub.domain.clone(),
                mail_domain: sub.domain.clone().unwrap_or_else(|| "x.mail.test".into()),
                backup_tier: "daily-7".into(),
            },
            4,
        )
        .into_task(Utc::now());
        task.status = status;
        if status == TaskState::Completed {
            task.result = Some(StepResult::ContainerReady {
                container_ref: "ct-1".into(),
                ip_address: "10.0.0.2".into(),
            });
        }
        task
    }

    fn materialize(planned: Vec<NewProvisioningTask>, status: TaskState) -> Vec<ProvisioningTask> {
        planned
            .into_iter()
            .map(|p| {
                let mut t = p.into_task(Utc::now());
                t.status = status;
                t
            })
            .collect()
    }

    #[test]
    fn test_nothing_planned_before_container_exists() {
        let sub = subscription(Some("example.test"));
        for status in [TaskState::Pending, TaskState::Running, TaskState::Failed] {
            let tasks = vec![create_task(&sub, status)];
            assert!(plan_followups(&sub, &tasks).is_empty(), "{status}");
        }
    }

    #[test]
    fn test_children_planned_once() {
        let sub = subscription(Some("example.test"));
        let mut tasks = vec![create_task(&sub, TaskState::Completed)];

        let planned = plan_followups(&sub, &tasks);
        let types: Vec<TaskType> = planned.iter().map(|p| p.task_type()).collect();
        assert_eq!(
            types,
            vec![
                TaskType::ConfigureDns,
                TaskType::SetupEmail,
                TaskType::SetupBackup
            ]
        );
        assert!(planned.iter().all(|p| p.max_attempts == 4));

        tasks.extend(materialize(planned, TaskState::Pending));
        assert!(plan_followups(&sub, &tasks).is_empty());
    }

    #[test]
    fn test_no_domain_skips_dns_and_still_activates() {
        let sub = subscription(None);
        let mut tasks = vec![create_task(&sub, TaskState::Completed)];
        let planned = plan_followups(&sub, &tasks);
        assert!(planned
            .iter()
            .all(|p| p.task_type() != TaskType::ConfigureDns));

        tasks.extend(materialize(planned, TaskState::Completed));
        let planned = plan_followups(&sub, &tasks);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].task_type(), TaskType::Activate);
        assert_eq!(
            planned[0].payload,
            TaskPayload::Activate {
                container_ref: "ct-1".into()
            }
        );
    }

    #[test]
    fn test_activation_waits_for_failed_step_until_remediated() {
        let sub = subscription(None);
        let mut tasks = vec![create_task(&sub, TaskState::Completed)];
        let mut children = materialize(plan_followups(&sub, &tasks), TaskState::Completed);
        let backup = children
            .iter_mut()
            .find(|t| t.task_type == TaskType::SetupBackup)
            .unwrap();
        backup.status = TaskState::Failed;
        let remediation_payload = TaskPayload::remediation_for(&backup.payload).unwrap();
        tasks.extend(children);

        assert!(plan_followups(&sub, &tasks).is_empty());

        let mut remediation =
            NewProvisioningTask::new(sub.id, remediation_payload, 4).into_task(Utc::now());
        remediation.status = TaskState::Completed;
        tasks.push(remediation);

        let planned = plan_followups(&sub, &tasks);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].task_type(), TaskType::Activate);
    }

    #[test]
    fn test_operator_dismissal_counts_as_skip() {
        let sub = subscription(None);
        let mut tasks = vec![create_task(&sub, TaskState::Completed)];
        let mut children = materialize(plan_followups(&sub, &tasks), TaskState::Completed);
        children[0].status = TaskState::Cancelled;
        tasks.extend(children);

        assert!(is_satisfied(&tasks, TaskType::SetupEmail));
        assert_eq!(plan_followups(&sub, &tasks).len(), 1);
    }

    #[test]
    fn test_latest_generation_wins() {
        let sub = subscription(None);
        let mut first = create_task(&sub, TaskState::Failed);
        first.generation = 1;
        let mut second = create_task(&sub, TaskState::Completed);
        second.generation = 2;
        let tasks = vec![first, second];

        assert_eq!(
            latest_of_type(&tasks, TaskType::CreateContainer).map(|t| t.generation),
            Some(2)
        );
        assert_eq!(plan_followups(&sub, &tasks).len(), 2);
    }

    #[test]
    fn test_tearing_down_plans_nothing() {
        let mut sub = subscription(Some("example.test"));
        sub.status = crate::models::SubscriptionStatus::Deprovisioning;
        let tasks = vec![create_task(&sub, TaskState::Completed)];
        assert!(plan_followups(&sub, &tasks).is_empty());
    }
}
