// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use chrono::Utc;
use log::debug;

use crate::context::TaskContext;
use crate::model::{DataStagingTaskModel, ProcessState, TaskStatus, TaskType};
use crate::session::quote;
use crate::task::staging::{
    check_phase, join, make_parent_directory, resolve_destination, split_path, staging_model,
    store, transfer, Location,
};
use crate::task::{run_task, terminal_status, Task};
use crate::{Error, TransferSide};

pub(crate) const ARCHIVE_NAME: &str = "archive.tar.gz";

/// Pack the working directory, move it to storage, and unpack it there.
pub struct ArchiveTask;

/// Archive the working directory to the staging destination.
///
/// The tarball is deleted on the compute resource once it has been
/// transferred and on storage once it has been extracted.
pub(crate) fn stage_archive(
    context: &mut TaskContext,
    mut staging: DataStagingTaskModel,
) -> Result<TaskStatus, Error> {
    check_phase(context, ProcessState::OutputDataStaging)?;

    let working_directory = context.process.process.working_directory.clone();
    let source = Location {
        host: context.process.compute.host_name.clone(),
        user: Some(context.process.compute.login_user()),
        path: join(&working_directory, ARCHIVE_NAME),
    };

    let pack = format!(
        "cd {} && tar -czf {ARCHIVE_NAME} --exclude=./{ARCHIVE_NAME} .",
        quote(&working_directory)
    );
    debug!("{}: packing '{working_directory}'.", context.describe());
    context
        .process
        .remote_cluster()
        .and_then(|mut cluster| cluster.session().run(&pack))
        .map_err(|e| e.on_side(TransferSide::Source))?;

    let destination = resolve_destination(context, &mut staging, ARCHIVE_NAME)?;
    let directory = make_parent_directory(context.process, &destination)?;

    staging.transfer_start_time = Some(Utc::now());
    transfer(context.process, &source, &destination, true)?;
    staging.transfer_end_time = Some(Utc::now());

    let (_, name) = split_path(&destination.path);
    let unpack = format!(
        "cd {directory} && tar -xzf {name} && rm -f {name} && chmod -R 755 {directory}",
        directory = quote(&directory),
        name = quote(&name)
    );
    debug!("{}: unpacking into '{directory}'.", context.describe());
    context
        .process
        .key_for_host(&destination.host)
        .and_then(|key| context.process.session(&key))
        .and_then(|mut session| session.run(&unpack))
        .map_err(|e| e.on_side(TransferSide::Destination))?;

    store(context, staging)?;
    context.complete(None)
}

impl ArchiveTask {
    fn run(context: &mut TaskContext) -> Result<TaskStatus, Error> {
        context.begin()?;
        let staging = staging_model(context)?;
        stage_archive(context, staging)
    }
}

impl Task for ArchiveTask {
    fn execute(&mut self, context: &mut TaskContext) -> TaskStatus {
        run_task(TaskType::Archive, context, Self::run)
    }

    fn recover(&mut self, context: &mut TaskContext) -> TaskStatus {
        terminal_status(context).unwrap_or_else(|| self.execute(context))
    }

    fn task_type(&self) -> TaskType {
        TaskType::Archive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{context, task};
    use crate::model::{StagingKind, TaskDetail, TaskState};
    use crate::resource::JobManagerType;
    use crate::session::mock::fail;
    use serial_test::parallel;

    fn archive_task(process: &mut crate::context::ProcessContext) -> crate::model::TaskModel {
        task(
            process,
            TaskType::Archive,
            TaskDetail::DataStaging(DataStagingTaskModel::new(
                StagingKind::ArchiveOutput,
                "scp://alice@login.cluster.edu/scratch/p1",
                "dummy://dummy/",
            )),
        )
    }

    #[test]
    #[parallel]
    fn archive_round_trip() {
        let (mut process, state) = context(JobManagerType::Slurm);
        process.set_state(ProcessState::OutputDataStaging).unwrap();
        let mut model = archive_task(&mut process);
        let mut context = TaskContext::new(&mut model, &mut process);

        let status = ArchiveTask.execute(&mut context);
        assert_eq!(status.state, TaskState::Completed);
        assert_eq!(
            context.task.staging().unwrap().destination,
            "scp://gateway@storage.gateway.org/data/gateway/p1/archive.tar.gz"
        );

        let state = state.lock().unwrap();
        let commands: Vec<&str> = state.commands.iter().map(|(_, c)| c.as_str()).collect();
        assert_eq!(
            commands,
            vec![
                "cd /scratch/p1 && tar -czf archive.tar.gz --exclude=./archive.tar.gz .",
                "mkdir -p /data/gateway/p1",
                "rm -f /scratch/p1/archive.tar.gz",
                "cd /data/gateway/p1 && tar -xzf archive.tar.gz && rm -f archive.tar.gz && chmod -R 755 /data/gateway/p1",
            ]
        );
        assert_eq!(
            state.transfers,
            vec![(
                "login.cluster.edu".to_string(),
                "/scratch/p1/archive.tar.gz".to_string(),
                "storage.gateway.org".to_string(),
                "/data/gateway/p1/archive.tar.gz".to_string()
            )]
        );
    }

    #[test]
    #[parallel]
    fn pack_failure_stops_the_archive() {
        let (mut process, state) = context(JobManagerType::Slurm);
        process.set_state(ProcessState::OutputDataStaging).unwrap();
        state
            .lock()
            .unwrap()
            .respond("tar -czf", fail(2, "tar: write error"));
        let mut model = archive_task(&mut process);
        let mut context = TaskContext::new(&mut model, &mut process);

        let status = ArchiveTask.execute(&mut context);
        assert_eq!(status.state, TaskState::Failed);
        assert_eq!(
            context.task.errors[0].user_friendly_message,
            "Could not reach the source host while staging data."
        );
        assert!(state.lock().unwrap().transfers.is_empty());
    }

    #[test]
    #[parallel]
    fn requires_output_phase() {
        let (mut process, state) = context(JobManagerType::Slurm);
        let mut model = archive_task(&mut process);
        let mut context = TaskContext::new(&mut model, &mut process);

        let status = ArchiveTask.execute(&mut context);
        assert_eq!(status.state, TaskState::Failed);
        assert!(state.lock().unwrap().commands.is_empty());
    }
}
