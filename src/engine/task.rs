use anyhow::anyhow;
use log::{trace, warn};

use commissioner_api::error::{
    CommissionError, ErrorKind, ReportError, TimeoutError, TransportError,
};

use crate::{
    platform::{Fault, PlatformClient, PropertyFilter, TaskHandle, TaskInfo, TaskResult, TaskState},
    retry::{self, RetryOutcome, RetryPolicy},
};

/// Terminal state of a platform task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success(TaskResult),
    Fault(Fault),
}

/// Destroys the filter when dropped, so every exit path of a wait releases it.
struct FilterGuard<'a> {
    platform: &'a dyn PlatformClient,
    filter: PropertyFilter,
}

impl Drop for FilterGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.platform.destroy_filter(&self.filter) {
            warn!("Failed to destroy property filter '{}': {e:?}", self.filter.0);
        }
    }
}

/// Waits for platform tasks through the change-notification primitive.
pub struct TaskPoller<'a> {
    platform: &'a dyn PlatformClient,
    policy: &'a RetryPolicy,
}

impl<'a> TaskPoller<'a> {
    pub fn new(platform: &'a dyn PlatformClient, policy: &'a RetryPolicy) -> Self {
        Self { platform, policy }
    }

    /// Blocks until the task reaches a terminal state.
    ///
    /// A platform-reported failure is an `Ok(TaskOutcome::Fault)`; errors are reserved for
    /// communication failures and for running out of update rounds.
    #[tracing::instrument(skip_all, fields(task = %task))]
    pub fn await_completion(&self, task: &TaskHandle) -> Result<TaskOutcome, CommissionError> {
        let filter = self
            .platform
            .create_task_filter(task)
            .structured(TransportError::CreateFilter {
                object: task.to_string(),
            })?;
        let guard = FilterGuard {
            platform: self.platform,
            filter,
        };

        let mut version: Option<String> = None;
        let outcome = retry::retry_until(
            self.policy,
            "await-task",
            |_| {
                let updates = self
                    .platform
                    .wait_for_updates(&guard.filter, version.as_deref())
                    .structured(TransportError::WaitForUpdates)?;
                trace!("Task '{task}' update version {}", updates.version);
                version = Some(updates.version);
                Ok::<_, CommissionError>(
                    updates
                        .tasks
                        .into_iter()
                        .find(|t| &t.handle == task && t.state.is_terminal()),
                )
            },
            Option::is_some,
        )?;

        match outcome {
            RetryOutcome::Satisfied {
                value: Some(info), ..
            } => Ok(Self::outcome(info)),
            other => Err(CommissionError::new(TimeoutError::TaskWait {
                task: task.to_string(),
                attempts: other.attempts(),
            })),
        }
    }

    fn outcome(info: TaskInfo) -> TaskOutcome {
        match info.state {
            TaskState::Success => TaskOutcome::Success(info.result.unwrap_or(TaskResult::None)),
            _ => TaskOutcome::Fault(info.fault.unwrap_or_else(|| Fault {
                kind: "UnknownFault".into(),
                message: "task failed without reporting a fault".into(),
                object: info.entity_name,
            })),
        }
    }

    /// Waits for the task and turns a platform fault into an error of the given kind, with the
    /// fault as its cause.
    #[track_caller]
    pub fn await_success(
        &self,
        task: &TaskHandle,
        on_fault: impl Into<ErrorKind>,
    ) -> Result<TaskResult, CommissionError> {
        match self.await_completion(task)? {
            TaskOutcome::Success(result) => Ok(result),
            TaskOutcome::Fault(fault) => Err(anyhow!("{fault}")).structured(on_fault),
        }
    }

    /// Like `await_success`, for tasks that create an object. Returns the new object's ID.
    #[track_caller]
    pub fn await_object(
        &self,
        task: &TaskHandle,
        on_fault: impl Into<ErrorKind>,
    ) -> Result<String, CommissionError> {
        match self.await_success(task, on_fault)? {
            TaskResult::Object(id) => Ok(id),
            TaskResult::None => Err(CommissionError::internal(
                "Creation task did not report the created object",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use commissioner_api::error::PlatformFault;

    use super::*;
    use crate::platform::{
        simulator::{fixtures, Operation, SimulatedPlatform},
        ClusterOps,
    };

    const WAIT: RetryPolicy = RetryPolicy::new(10, retry::Backoff::None);

    #[test]
    fn test_success_releases_filter() {
        let platform = SimulatedPlatform::new(fixtures::cluster(1));
        let poller = TaskPoller::new(&platform, &WAIT);

        let task = platform.enter_maintenance_mode("host-1").unwrap();
        assert_eq!(
            poller.await_completion(&task).unwrap(),
            TaskOutcome::Success(TaskResult::None)
        );
        assert_eq!(platform.filters_created(), 1);
        assert_eq!(platform.open_filters(), 0);
    }

    #[test]
    fn test_fault_is_outcome_not_error() {
        let platform = SimulatedPlatform::new(fixtures::cluster(1));
        platform.inject_fault(Operation::EnterMaintenanceMode, "esx1");
        let poller = TaskPoller::new(&platform, &WAIT);

        let task = platform.enter_maintenance_mode("host-1").unwrap();
        match poller.await_completion(&task).unwrap() {
            TaskOutcome::Fault(fault) => assert_eq!(fault.object, "esx1.example.com"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(platform.open_filters(), 0);

        let task = platform.enter_maintenance_mode("host-1").unwrap();
        let err = poller
            .await_success(
                &task,
                PlatformFault::MaintenanceMode {
                    host: "esx1.example.com".into(),
                },
            )
            .unwrap_err();
        assert_eq!(err.category(), "platform");
        assert!(err.to_string().contains("injected fault"));
    }

    #[test]
    fn test_transport_error_releases_filter() {
        let platform = SimulatedPlatform::new(fixtures::cluster(1));
        let poller = TaskPoller::new(&platform, &WAIT);
        let task = platform.exit_maintenance_mode("host-1").unwrap();
        platform.with_inventory(|inv| inv.behaviors.broken_session = true);

        let err = poller.await_completion(&task).unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::Transport(TransportError::WaitForUpdates)
        );
        assert_eq!(platform.open_filters(), 0);
    }

    #[test]
    fn test_stalled_task_times_out() {
        let platform = SimulatedPlatform::new(fixtures::cluster(1));
        platform.stall(Operation::ExitMaintenanceMode, "esx1");
        let poller = TaskPoller::new(&platform, &WAIT);

        let task = platform.exit_maintenance_mode("host-1").unwrap();
        let err = poller.await_completion(&task).unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::Timeout(TimeoutError::TaskWait {
                task: task.to_string(),
                attempts: 10,
            })
        );
        assert_eq!(platform.open_filters(), 0);
    }

    #[test]
    fn test_unknown_task_fails_to_subscribe() {
        let platform = SimulatedPlatform::new(fixtures::cluster(1));
        let poller = TaskPoller::new(&platform, &WAIT);
        let err = poller
            .await_completion(&TaskHandle("task-missing".into()))
            .unwrap_err();
        assert_eq!(err.category(), "transport");
        assert_eq!(platform.open_filters(), 0);
    }
}
