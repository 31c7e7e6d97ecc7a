// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

//! The steps of a process.
//!
//! Task entry points never return errors. Every failure is recorded on the
//! task, process, and experiment, and the task reports a terminal status.

pub mod archive;
pub mod env_setup;
pub mod staging;
pub mod streaming;
pub mod submission;

use crate::context::{ProcessContext, TaskContext};
use crate::model::{JobStatus, TaskStatus, TaskType};
use crate::settings::EngineSettings;
use crate::Error;

pub use archive::ArchiveTask;
pub use env_setup::EnvironmentSetupTask;
pub use staging::DataStagingTask;
pub use streaming::DataStreamer;
pub use submission::DefaultJobSubmissionTask;

/// One step of a process.
pub trait Task: Send {
    /// Configure the task before it runs.
    fn init(&mut self, settings: &EngineSettings) {
        let _ = settings;
    }

    /// Run the task.
    fn execute(&mut self, context: &mut TaskContext) -> TaskStatus;

    /// Re-enter the task after an engine restart.
    ///
    /// A task that already reached a terminal status returns that status
    /// without touching any remote resource.
    fn recover(&mut self, context: &mut TaskContext) -> TaskStatus;

    fn task_type(&self) -> TaskType;
}

/// Tasks that can cancel the job they submitted.
pub trait JobSubmissionTask: Task {
    /// Cancel the process's job.
    ///
    /// # Errors
    /// Returns `Err(gantry::Error)` when the job cannot be confirmed canceled.
    ///
    fn cancel(&mut self, context: &mut ProcessContext) -> Result<JobStatus, Error>;
}

/// Create the task implementation for `task_type`.
pub fn for_type(task_type: TaskType) -> Box<dyn Task> {
    match task_type {
        TaskType::EnvSetup => Box::new(EnvironmentSetupTask),
        TaskType::DataStaging => Box::new(DataStagingTask::default()),
        TaskType::JobSubmission => Box::new(DefaultJobSubmissionTask::default()),
        TaskType::Archive => Box::new(ArchiveTask),
    }
}

/// The persisted terminal status of the task, if it has one.
pub(crate) fn terminal_status(context: &TaskContext) -> Option<TaskStatus> {
    context
        .task
        .status()
        .filter(|status| status.state.is_terminal())
        .cloned()
}

/// Run `body` unless the task was dispatched to the wrong implementation,
/// converting any error into a recorded failure.
pub(crate) fn run_task<F>(expected: TaskType, context: &mut TaskContext, body: F) -> TaskStatus
where
    F: FnOnce(&mut TaskContext) -> Result<TaskStatus, Error>,
{
    if context.task.task_type != expected {
        let error = Error::UnexpectedTaskType(
            context.task_id().into(),
            context.task.task_type.to_string(),
            expected.to_string(),
        );
        return context.fail(&error);
    }

    match body(context) {
        Ok(status) => status,
        Err(error) => context.fail(&error),
    }
}
