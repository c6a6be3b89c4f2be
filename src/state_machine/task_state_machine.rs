use super::{
    errors::{StateMachineError, StateMachineResult},
    events::TaskEvent,
    states::TaskState,
};
use crate::models::ProvisioningTask;
use chrono::{DateTime, Utc};

const LEASE_EXPIRED_ERROR: &str = "lease expired without heartbeat";

/// Transition rules for provisioning tasks.
///
/// Stateless: stores load a task, call [`TaskStateMachine::apply`], and persist the result
/// with a conditional write.
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Determine the target state for an event, given the attempt budget.
    ///
    /// `attempts` is the count *before* this event is applied.
    pub fn determine_target_state(
        current_state: TaskState,
        event: &TaskEvent,
        attempts: i32,
        max_attempts: i32,
    ) -> StateMachineResult<TaskState> {
        let exhausted = attempts + 1 >= max_attempts;

        let target = match (current_state, event) {
            // Claim engine
            (TaskState::Pending | TaskState::Retrying, TaskEvent::Claim { .. }) => {
                TaskState::Claimed
            }

            // Executor start
            (TaskState::Claimed, TaskEvent::Start { .. }) => TaskState::Running,

            // Outcomes
            (TaskState::Running, TaskEvent::Complete { .. }) => TaskState::Completed,
            (TaskState::Running, TaskEvent::Retry { .. }) if exhausted => TaskState::Failed,
            (TaskState::Running, TaskEvent::Retry { .. }) => TaskState::Retrying,
            (TaskState::Running, TaskEvent::Fail { .. }) => TaskState::Failed,

            // Crash recovery
            (TaskState::Claimed, TaskEvent::LeaseExpired) => TaskState::Pending,
            (TaskState::Running, TaskEvent::LeaseExpired) if exhausted => TaskState::Failed,
            (TaskState::Running, TaskEvent::LeaseExpired) => TaskState::Pending,

            // Subscription teardown
            (
                TaskState::Pending | TaskState::Retrying | TaskState::Claimed | TaskState::Running,
                TaskEvent::Cancel { .. },
            ) => TaskState::Cancelled,

            // Operator dismissal
            (
                TaskState::Pending | TaskState::Retrying | TaskState::Failed,
                TaskEvent::AdminCancel { .. },
            ) => TaskState::Cancelled,

            (from, event) => {
                return Err(StateMachineError::InvalidTransition {
                    from,
                    event: event.event_type(),
                })
            }
        };

        Ok(target)
    }

    /// Apply an event to a task in place, updating state and all bookkeeping columns.
    pub fn apply(
        task: &mut ProvisioningTask,
        event: TaskEvent,
        now: DateTime<Utc>,
    ) -> StateMachineResult<TaskState> {
        let from = task.status;
        let target =
            Self::determine_target_state(from, &event, task.attempts, task.max_attempts)?;

        match event {
            TaskEvent::Claim {
                worker_id,
                lease_expires_at,
            } => {
                task.worker_id = Some(worker_id);
                task.lease_expires_at = Some(lease_expires_at);
                task.next_retry_at = None;
            }
            TaskEvent::Start { lease_expires_at } => {
                task.lease_expires_at = Some(lease_expires_at);
                task.last_heartbeat_at = Some(now);
            }
            TaskEvent::Complete { result } => {
                task.result = Some(result);
                task.lease_expires_at = None;
                task.last_error = None;
            }
            TaskEvent::Retry {
                error,
                next_retry_at,
            } => {
                task.attempts += 1;
                task.last_error = Some(error);
                task.next_retry_at = (target == TaskState::Retrying).then_some(next_retry_at);
                task.worker_id = None;
                task.lease_expires_at = None;
            }
            TaskEvent::Fail { error } => {
                task.attempts += 1;
                task.last_error = Some(error);
                task.lease_expires_at = None;
            }
            TaskEvent::LeaseExpired => {
                if from == TaskState::Running {
                    task.attempts += 1;
                    task.last_error = Some(LEASE_EXPIRED_ERROR.to_string());
                }
                task.worker_id = None;
                task.lease_expires_at = None;
            }
            TaskEvent::Cancel { reason } | TaskEvent::AdminCancel { reason } => {
                task.last_error = Some(format!("cancelled: {reason}"));
                task.lease_expires_at = None;
                task.next_retry_at = None;
            }
        }

        if target.is_terminal() {
            task.completed_at = Some(now);
        }
        task.status = target;
        task.updated_at = now;

        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewProvisioningTask, StepResult, TaskPayload};
    use proptest::prelude::*;
    use uuid::Uuid;

    fn task_with(status: TaskState, attempts: i32, max_attempts: i32) -> ProvisioningTask {
        let mut task = NewProvisioningTask::new(
            Uuid::new_v4(),
            TaskPayload::SetupEmail {
                domain: "example.test".to_string(),
            },
            max_attempts,
        )
        .into_task(Utc::now());
        task.status = status;
        task.attempts = attempts;
        task
    }

    fn all_events() -> Vec<TaskEvent> {
        let now = Utc::now();
        vec![
            TaskEvent::Claim {
                worker_id: "w".into(),
                lease_expires_at: now,
            },
            TaskEvent::Start {
                lease_expires_at: now,
            },
            TaskEvent::Complete {
                result: StepResult::MailboxReady {
                    domain: "example.test".into(),
                },
            },
            TaskEvent::Retry {
                error: "503".into(),
                next_retry_at: now,
            },
            TaskEvent::Fail {
                error: "quota".into(),
            },
            TaskEvent::LeaseExpired,
            TaskEvent::Cancel {
                reason: "deprovision".into(),
            },
            TaskEvent::AdminCancel {
                reason: "operator".into(),
            },
        ]
    }

    #[test]
    fn test_happy_path_transitions() {
        let now = Utc::now();
        let mut task = task_with(TaskState::Pending, 0, 5);

        TaskStateMachine::apply(
            &mut task,
            TaskEvent::Claim {
                worker_id: "worker-a".into(),
                lease_expires_at: now,
            },
            now,
        )
        .unwrap();
        assert_eq!(task.status, TaskState::Claimed);
        assert_eq!(task.worker_id.as_deref(), Some("worker-a"));

        TaskStateMachine::apply(
            &mut task,
            TaskEvent::Start {
                lease_expires_at: now,
            },
            now,
        )
        .unwrap();
        assert_eq!(task.status, TaskState::Running);
        assert_eq!(task.last_heartbeat_at, Some(now));

        let result = StepResult::MailboxReady {
            domain: "example.test".into(),
        };
        TaskStateMachine::apply(
            &mut task,
            TaskEvent::Complete {
                result: result.clone(),
            },
            now,
        )
        .unwrap();
        assert_eq!(task.status, TaskState::Completed);
        assert_eq!(task.result, Some(result));
        assert_eq!(task.completed_at, Some(now));
        assert!(task.lease_expires_at.is_none());
    }

    #[test]
    fn test_retry_escalates_when_attempts_exhausted() {
        let now = Utc::now();
        let retry = TaskEvent::Retry {
            error: "timeout".into(),
            next_retry_at: now,
        };

        let mut task = task_with(TaskState::Running, 0, 3);
        TaskStateMachine::apply(&mut task, retry.clone(), now).unwrap();
        assert_eq!(task.status, TaskState::Retrying);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.next_retry_at, Some(now));
        assert!(task.worker_id.is_none());

        let mut last = task_with(TaskState::Running, 2, 3);
        TaskStateMachine::apply(&mut last, retry, now).unwrap();
        assert_eq!(last.status, TaskState::Failed);
        assert_eq!(last.attempts, 3);
        assert!(last.next_retry_at.is_none());
        assert_eq!(last.completed_at, Some(now));
    }

    #[test]
    fn test_lease_expiry_counts_only_started_attempts() {
        let now = Utc::now();

        let mut claimed = task_with(TaskState::Claimed, 0, 3);
        TaskStateMachine::apply(&mut claimed, TaskEvent::LeaseExpired, now).unwrap();
        assert_eq!(claimed.status, TaskState::Pending);
        assert_eq!(claimed.attempts, 0);

        let mut running = task_with(TaskState::Running, 0, 3);
        TaskStateMachine::apply(&mut running, TaskEvent::LeaseExpired, now).unwrap();
        assert_eq!(running.status, TaskState::Pending);
        assert_eq!(running.attempts, 1);
        assert_eq!(running.last_error.as_deref(), Some(LEASE_EXPIRED_ERROR));

        let mut poisoned = task_with(TaskState::Running, 2, 3);
        TaskStateMachine::apply(&mut poisoned, TaskEvent::LeaseExpired, now).unwrap();
        assert_eq!(poisoned.status, TaskState::Failed);
    }

    #[test]
    fn test_admin_cancel_only_from_failed_or_queued() {
        let event = TaskEvent::AdminCancel {
            reason: "skip".into(),
        };
        for (state, allowed) in [
            (TaskState::Failed, true),
            (TaskState::Pending, true),
            (TaskState::Retrying, true),
            (TaskState::Running, false),
            (TaskState::Completed, false),
        ] {
            assert_eq!(
                TaskStateMachine::determine_target_state(state, &event, 0, 5).is_ok(),
                allowed,
                "{state}"
            );
        }
    }

    #[test]
    fn test_invalid_transitions() {
        let err = TaskStateMachine::determine_target_state(
            TaskState::Pending,
            &TaskEvent::Start {
                lease_expires_at: Utc::now(),
            },
            0,
            5,
        )
        .unwrap_err();
        assert_eq!(
            err,
            StateMachineError::InvalidTransition {
                from: TaskState::Pending,
                event: "start"
            }
        );
    }

    proptest! {
        #[test]
        fn prop_completed_never_leaves(idx in 0usize..8, attempts in 0i32..10, max in 1i32..10) {
            let event = &all_events()[idx];
            prop_assert!(
                TaskStateMachine::determine_target_state(TaskState::Completed, event, attempts, max).is_err()
            );
        }

        #[test]
        fn prop_failed_only_leaves_via_admin(idx in 0usize..8, attempts in 0i32..10, max in 1i32..10) {
            let event = &all_events()[idx];
            let outcome = TaskStateMachine::determine_target_state(TaskState::Failed, event, attempts, max);
            match event {
                TaskEvent::AdminCancel { .. } => prop_assert_eq!(outcome, Ok(TaskState::Cancelled)),
                _ => prop_assert!(outcome.is_err()),
            }
        }

        #[test]
        fn prop_attempts_never_exceed_budget(start in 0i32..5, max in 1i32..6, retries in 1usize..12) {
            prop_assume!(start < max);
            let now = Utc::now();
            let mut task = task_with(TaskState::Running, start, max);
            for _ in 0..retries {
                if task.status != TaskState::Running {
                    break;
                }
                TaskStateMachine::apply(&mut task, TaskEvent::Retry { error: "x".into(), next_retry_at: now }, now).unwrap();
                if task.status == TaskState::Retrying {
                    task.status = TaskState::Running;
                }
            }
            prop_assert!(task.attempts <= max);
        }
    }
}
