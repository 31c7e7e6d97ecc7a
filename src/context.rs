// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use log::{debug, error, warn};
use std::sync::Arc;

use crate::model::{
    ErrorModel, JobModel, JobState, JobStatus, ProcessModel, ProcessState, TaskModel, TaskState,
    TaskStatus,
};
use crate::registry::{ErrorTarget, Registry};
use crate::remote_cluster::RemoteCluster;
use crate::resource::{current_user, ComputeResource, Protocol, StorageResource};
use crate::session::{PooledSession, SessionKey, SessionPool};
use crate::settings::EngineSettings;
use crate::Error;

/// Build the pool key for a resource.
///
/// Local sessions ignore port and credential, so every local resource run
/// by the same user shares one key.
pub(crate) fn session_key(
    protocol: Protocol,
    host: &str,
    port: u16,
    user: String,
    credential_token: Option<String>,
) -> SessionKey {
    match protocol {
        Protocol::Local => SessionKey {
            protocol,
            host: host.into(),
            port: 0,
            user,
            credential_token: None,
        },
        Protocol::Ssh => SessionKey {
            protocol,
            host: host.into(),
            port,
            user,
            credential_token,
        },
    }
}

/// Key of the engine host itself.
pub(crate) fn engine_key() -> SessionKey {
    session_key(Protocol::Local, "localhost", 0, current_user(), None)
}

/// Shared state of one process execution.
pub struct ProcessContext {
    pub process: ProcessModel,
    pub job: Option<JobModel>,
    pub compute: ComputeResource,
    pub storage: StorageResource,
    pub registry: Arc<dyn Registry>,
    pub sessions: Arc<SessionPool>,
    pub settings: EngineSettings,
}

impl ProcessContext {
    /// Resolve the resources of `process` and load its job, if any.
    ///
    /// # Errors
    /// Returns `Err(gantry::Error)` when a resource is not configured.
    ///
    pub fn new(
        process: ProcessModel,
        registry: Arc<dyn Registry>,
        sessions: Arc<SessionPool>,
        settings: EngineSettings,
    ) -> Result<Self, Error> {
        let compute = registry.compute_resource(&process.compute_resource_id)?;
        let storage = registry.storage_resource(&process.storage_resource_id)?;
        let job = registry.job(&process.process_id)?;

        Ok(ProcessContext {
            process,
            job,
            compute,
            storage,
            registry,
            sessions,
            settings,
        })
    }

    pub fn process_id(&self) -> &str {
        &self.process.process_id
    }

    /// Identify the process in log messages.
    pub fn describe(&self) -> String {
        format!(
            "experiment '{}', process '{}'",
            self.process.experiment_id, self.process.process_id
        )
    }

    pub fn compute_key(&self) -> SessionKey {
        session_key(
            self.compute.protocol,
            &self.compute.host_name,
            self.compute.port(),
            self.compute.login_user(),
            self.compute.credential_token.clone(),
        )
    }

    pub fn storage_key(&self) -> SessionKey {
        session_key(
            self.storage.protocol,
            &self.storage.host_name,
            self.storage.port(),
            self.storage.login_user(),
            self.storage.credential_token.clone(),
        )
    }

    /// Map a host named in a URI to the session that reaches it.
    ///
    /// An empty host is the engine host.
    ///
    /// # Errors
    /// `gantry::Error::UnknownHost` when the host is not one of this
    /// process's resources.
    ///
    pub fn key_for_host(&self, host: &str) -> Result<SessionKey, Error> {
        if host == self.compute.host_name {
            Ok(self.compute_key())
        } else if host == self.storage.host_name {
            Ok(self.storage_key())
        } else if host.is_empty() || host == "localhost" {
            Ok(engine_key())
        } else {
            Err(Error::UnknownHost(host.into(), self.process_id().into()))
        }
    }

    pub fn session(&self, key: &SessionKey) -> Result<PooledSession, Error> {
        self.sessions.acquire(key)
    }

    /// Lease a session to the compute resource wrapped in a `RemoteCluster`.
    pub fn remote_cluster(&self) -> Result<RemoteCluster, Error> {
        let session = self.sessions.acquire(&self.compute_key())?;
        Ok(RemoteCluster::new(session, &self.compute))
    }

    /// Record a new process state.
    ///
    /// # Errors
    /// `gantry::Error::ProcessFinished` when the process already ended,
    /// possibly in another engine instance.
    ///
    pub fn set_state(&mut self, state: ProcessState) -> Result<(), Error> {
        if self.process.state != state {
            debug!("{} is now {state}.", self.describe());
        }
        self.registry.save_process_state(self.process_id(), state)?;
        self.process.state = state;
        Ok(())
    }

    /// Persist the job model and keep it as the in-flight job.
    pub fn save_job(&mut self, job: &JobModel) -> Result<(), Error> {
        self.registry.save_job_model(job)?;
        self.job = Some(job.clone());
        Ok(())
    }

    /// Persist a job status and reload the in-flight job.
    ///
    /// Returns the latest recorded state, which differs from `status` when
    /// the job had already ended.
    pub fn save_job_status(&mut self, status: &JobStatus) -> Result<JobState, Error> {
        self.registry.save_job_status(self.process_id(), status)?;
        self.job = self.registry.job(self.process_id())?;
        Ok(self.job.as_ref().map_or(status.state, JobModel::state))
    }
}

/// One task and the process it belongs to.
pub struct TaskContext<'a> {
    pub task: &'a mut TaskModel,
    pub process: &'a mut ProcessContext,
}

impl<'a> TaskContext<'a> {
    pub fn new(task: &'a mut TaskModel, process: &'a mut ProcessContext) -> Self {
        TaskContext { task, process }
    }

    pub fn task_id(&self) -> &str {
        &self.task.task_id
    }

    /// Identify the task in log messages.
    pub fn describe(&self) -> String {
        format!("{}, task '{}'", self.process.describe(), self.task.task_id)
    }

    pub fn save_task(&self) -> Result<(), Error> {
        self.process.registry.save_task(self.task)
    }

    fn push_status(&mut self, status: TaskStatus) -> Result<TaskStatus, Error> {
        self.task.statuses.push(status.clone());
        self.save_task()?;
        Ok(status)
    }

    /// Mark the task as executing.
    pub fn begin(&mut self) -> Result<(), Error> {
        self.push_status(TaskStatus::new(TaskState::Executing))
            .map(|_| ())
    }

    /// Mark the task as completed.
    pub fn complete(&mut self, reason: Option<&str>) -> Result<TaskStatus, Error> {
        let mut status = TaskStatus::new(TaskState::Completed);
        status.reason = reason.map(String::from);
        self.push_status(status)
    }

    /// Record `error` and mark the task as failed.
    pub fn fail(&mut self, error: &Error) -> TaskStatus {
        error!("{}: {error}", self.describe());
        self.fail_with(ErrorModel::from(error))
    }

    /// Record `error` on the experiment, process, and task, then mark the
    /// task as failed.
    ///
    /// Never fails: a record that cannot be persisted is logged.
    ///
    pub fn fail_with(&mut self, error: ErrorModel) -> TaskStatus {
        let registry = Arc::clone(&self.process.registry);
        let targets = [
            ErrorTarget::Experiment(self.process.process.experiment_id.clone()),
            ErrorTarget::Process(self.process.process.process_id.clone()),
        ];
        for target in targets {
            if let Err(persist_error) = registry.add_error(target, &error) {
                warn!("{}: unable to record error: {persist_error}", self.describe());
            }
        }
        self.process.process.errors.push(error.clone());

        let status =
            TaskStatus::new(TaskState::Failed).with_reason(error.user_friendly_message.clone());
        self.task.errors.push(error);
        self.task.statuses.push(status.clone());
        if let Err(persist_error) = self.save_task() {
            error!(
                "{}: unable to record task failure: {persist_error}",
                self.describe()
            );
        }
        status
    }
}
