// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use log::debug;

use crate::context::TaskContext;
use crate::model::{TaskDetail, TaskStatus, TaskType};
use crate::task::{run_task, terminal_status, Task};
use crate::Error;

/// Create the working directory on the compute resource.
pub struct EnvironmentSetupTask;

impl EnvironmentSetupTask {
    fn run(context: &mut TaskContext) -> Result<TaskStatus, Error> {
        context.begin()?;

        let location = match &context.task.detail {
            TaskDetail::EnvSetup { location } if !location.is_empty() => location.clone(),
            _ => context.process.process.working_directory.clone(),
        };

        debug!("{}: creating '{location}'.", context.describe());
        context.process.remote_cluster()?.make_directory(&location)?;
        context.complete(None)
    }
}

impl Task for EnvironmentSetupTask {
    fn execute(&mut self, context: &mut TaskContext) -> TaskStatus {
        run_task(TaskType::EnvSetup, context, Self::run)
    }

    fn recover(&mut self, context: &mut TaskContext) -> TaskStatus {
        // Directory creation is idempotent, so anything unfinished runs again.
        terminal_status(context).unwrap_or_else(|| self.execute(context))
    }

    fn task_type(&self) -> TaskType {
        TaskType::EnvSetup
    }
}
