// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use chrono::Utc;
use log::{debug, info, trace, warn};
use std::fs;
use std::path::Path;
use std::thread;

use crate::context::{ProcessContext, TaskContext};
use crate::model::{JobModel, JobState, JobStatus, ProcessState, TaskStatus, TaskType};
use crate::remote_cluster::RemoteCluster;
use crate::script::{generate_job_name, JobScriptBuilder};
use crate::session::quote;
use crate::settings::EngineSettings;
use crate::task::{run_task, terminal_status, JobSubmissionTask, Task};
use crate::{Error, DEFAULT_JOB_ID};

const VERIFIED: &str = "verification succeeded";

/// Generate a job script, submit it, and confirm that the scheduler knows
/// the job.
///
/// The job status is always persisted before the task status, so a crash
/// between the two never hides a job that was created.
#[derive(Default)]
pub struct DefaultJobSubmissionTask {
    settings: EngineSettings,
}

impl DefaultJobSubmissionTask {
    /// Write the job script to the local data location.
    fn write_job_file(&self, process_id: &str, job_name: &str, script: &str) -> Result<std::path::PathBuf, Error> {
        let directory = self.settings.local_data_location.join(process_id);
        fs::create_dir_all(&directory).map_err(|e| Error::DirectoryCreate(directory.clone(), e))?;
        let path = directory.join(format!("{job_name}.sh"));
        fs::write(&path, script).map_err(|e| Error::FileWrite(path.clone(), e))?;
        Ok(path)
    }

    fn submit(&self, context: &mut TaskContext) -> Result<TaskStatus, Error> {
        context.begin()?;

        let job_name = generate_job_name();
        let process = &context.process.process;
        let script =
            JobScriptBuilder::new(context.process.compute.job_manager, process, &job_name)
                .build()?;
        let local_file = self.write_job_file(&process.process_id, &job_name, &script)?;
        let working_directory = process.working_directory.clone();
        let remote_file = Path::new(&working_directory)
            .join(format!("{job_name}.sh"))
            .to_string_lossy()
            .into_owned();

        let mut job = JobModel {
            job_id: None,
            job_name: job_name.clone(),
            process_id: process.process_id.clone(),
            task_id: context.task.task_id.clone(),
            compute_resource_id: context.process.compute.id.clone(),
            job_description: script,
            working_directory: working_directory.clone(),
            statuses: Vec::new(),
            std_out: None,
            std_err: None,
            exit_code: None,
            submitted_time: None,
        };
        context.process.save_job(&job)?;

        let mut cluster = context.process.remote_cluster()?;
        cluster.copy_to(&local_file, &remote_file)?;
        let output = cluster.submit_batch_job(&remote_file, &working_directory)?;

        job.submitted_time = Some(Utc::now());
        job.std_out = Some(output.std_out.clone());
        job.std_err = Some(output.std_err.clone());
        job.exit_code = Some(output.exit_code);

        if output.is_rejected() {
            let reason = output
                .failure_reason
                .clone()
                .unwrap_or_else(|| format!("exited with code {}", output.exit_code));
            job.job_id = output.job_id.clone();
            context.process.save_job(&job)?;
            context
                .process
                .save_job_status(&JobStatus::new(JobState::Failed).with_reason(reason.clone()))?;
            return Err(Error::SubmissionRejected(reason));
        }

        if let Some(job_id) = output.job_id.clone() {
            job.job_id = Some(job_id.clone());
            context.process.save_job(&job)?;
            context
                .process
                .save_job_status(&JobStatus::new(JobState::Submitted))?;
            info!("{}: submitted job '{job_id}'.", context.describe());

            self.verify_by_id(context, &mut cluster, &job_id)?;
            return context.complete(None);
        }

        context.process.save_job(&job)?;
        debug!(
            "{}: the scheduler printed no job id, looking up '{job_name}'.",
            context.describe()
        );
        if let Some(job_id) = self.verify_by_name(context, &mut cluster, &job_name)? {
            job.job_id = Some(job_id.clone());
            context.process.save_job(&job)?;
            context
                .process
                .save_job_status(&JobStatus::new(JobState::Submitted))?;
            context
                .process
                .save_job_status(&JobStatus::new(JobState::Queued).with_reason(VERIFIED))?;
            info!("{}: found job '{job_id}' by name.", context.describe());
            report_gateway_usage(context.process, &mut cluster, &job_id);
            return context.complete(None);
        }

        job.job_id = Some(DEFAULT_JOB_ID.into());
        context.process.save_job(&job)?;
        context.process.save_job_status(
            &JobStatus::new(JobState::Failed)
                .with_reason("neither submit nor verify returned a job id"),
        )?;
        Err(Error::JobIdNotFound(job_name))
    }

    /// Confirm a parsed job id with one status query.
    fn verify_by_id(
        &self,
        context: &mut TaskContext,
        cluster: &mut RemoteCluster,
        job_id: &str,
    ) -> Result<(), Error> {
        let user = context.process.compute.login_user();
        match cluster.job_status(job_id, &user) {
            Ok(status) if status.state != JobState::Unknown => {
                context
                    .process
                    .save_job_status(&JobStatus::new(JobState::Queued).with_reason(VERIFIED))?;
                report_gateway_usage(context.process, cluster, job_id);
            }
            Ok(_) => warn!(
                "{}: job '{job_id}' is not yet visible to the scheduler.",
                context.describe()
            ),
            Err(error) => warn!(
                "{}: unable to verify job '{job_id}': {error}",
                context.describe()
            ),
        }
        Ok(())
    }

    /// Look the job up by name, backing off linearly between attempts.
    fn verify_by_name(
        &self,
        context: &TaskContext,
        cluster: &mut RemoteCluster,
        job_name: &str,
    ) -> Result<Option<String>, Error> {
        let user = context.process.compute.login_user();
        for attempt in 1..=self.settings.verification_attempts {
            thread::sleep(self.settings.verification_backoff * attempt);
            trace!(
                "{}: verification attempt {attempt} for '{job_name}'.",
                context.describe()
            );
            match cluster.job_id_by_name(job_name, &user) {
                Ok(Some(job_id)) => return Ok(Some(job_id)),
                Ok(None) => (),
                Err(error) => warn!(
                    "{}: verification attempt {attempt} failed: {error}",
                    context.describe()
                ),
            }
        }
        Ok(None)
    }

    /// Wait for a job id to appear in the registry.
    fn wait_for_job_id(&self, context: &ProcessContext) -> Result<(String, JobModel), Error> {
        let process_id = context.process_id();
        let mut polls = 0;
        loop {
            context.registry.refresh()?;
            let job = context.registry.job(process_id)?;
            if let Some(job) = job {
                if let Some(job_id) = job.known_job_id() {
                    return Ok((job_id.to_string(), job));
                }
                if job.job_id.as_deref() == Some(DEFAULT_JOB_ID) {
                    return Err(Error::JobNotSubmitted(job.job_name, process_id.into()));
                }
            }

            let state = context.registry.process_state(process_id)?;
            let submitting = matches!(
                state,
                ProcessState::Created
                    | ProcessState::Validated
                    | ProcessState::Started
                    | ProcessState::PreProcessing
                    | ProcessState::ConfiguringWorkspace
                    | ProcessState::InputDataStaging
                    | ProcessState::Executing
            );
            if !submitting {
                return Err(Error::JobModelMissing(process_id.into()));
            }

            polls += 1;
            if polls >= self.settings.cancel_job_id_attempts {
                return Err(Error::CancelTimeout(process_id.into(), polls));
            }
            debug!("Waiting for the job id of process '{process_id}'.");
            thread::sleep(self.settings.cancel_job_id_poll);
        }
    }
}

/// Run the gateway usage reporting command, if the resource has one.
///
/// Failures are logged and otherwise ignored.
fn report_gateway_usage(context: &ProcessContext, cluster: &mut RemoteCluster, job_id: &str) {
    let Some(usage) = &context.compute.gateway_usage else {
        return;
    };

    let mut command = String::new();
    if let Some(module_load) = usage.module_load_command.as_deref().filter(|m| !m.is_empty()) {
        command.push_str(module_load);
        command.push_str(" && ");
    }
    let submit_time = Utc::now().format("%Y-%m-%d %H:%M:%S%.3f %z").to_string();
    command.push_str(&format!(
        "{} -gateway_user {} -submit_time {} -jobid {}",
        usage.executable,
        quote(&format!(
            "{}@{}",
            context.process.user_name, context.process.gateway_id
        )),
        quote(&submit_time),
        quote(job_id)
    ));

    match cluster.execute(&command) {
        Ok(output) if output.success() => trace!("Reported gateway usage for job '{job_id}'."),
        Ok(output) => warn!(
            "{}: gateway usage reporting failed: {}",
            context.describe(),
            output.message()
        ),
        Err(error) => warn!(
            "{}: gateway usage reporting failed: {error}",
            context.describe()
        ),
    }
}

impl Task for DefaultJobSubmissionTask {
    fn init(&mut self, settings: &EngineSettings) {
        self.settings = settings.clone();
    }

    fn execute(&mut self, context: &mut TaskContext) -> TaskStatus {
        run_task(TaskType::JobSubmission, context, |context| self.submit(context))
    }

    fn recover(&mut self, context: &mut TaskContext) -> TaskStatus {
        if let Some(status) = terminal_status(context) {
            return status;
        }

        // A durably known job id means the job exists: never submit twice.
        let known = match context.process.registry.job(context.process.process_id()) {
            Ok(job) => job.as_ref().and_then(JobModel::known_job_id).map(String::from),
            Err(error) => return context.fail(&error),
        };
        match known {
            Some(job_id) => {
                debug!(
                    "{}: job '{job_id}' was already submitted.",
                    context.describe()
                );
                context
                    .complete(Some("job already submitted"))
                    .unwrap_or_else(|error| context.fail(&error))
            }
            None => self.execute(context),
        }
    }

    fn task_type(&self) -> TaskType {
        TaskType::JobSubmission
    }
}

impl JobSubmissionTask for DefaultJobSubmissionTask {
    fn cancel(&mut self, context: &mut ProcessContext) -> Result<JobStatus, Error> {
        let (job_id, job) = self.wait_for_job_id(context)?;
        context.job = Some(job);
        let user = context.compute.login_user();

        // Retry only when the query itself fails, an unknown state is still
        // a job that can be canceled.
        let attempts = self.settings.cancel_status_attempts.max(1);
        let mut current = None;
        for attempt in 1..=attempts {
            match context.remote_cluster()?.job_status(&job_id, &user) {
                Ok(status) => {
                    current = Some(status);
                    break;
                }
                Err(error) => {
                    warn!(
                        "{}: status query {attempt} for job '{job_id}' failed: {error}",
                        context.describe()
                    );
                    if attempt < attempts {
                        thread::sleep(self.settings.cancel_status_backoff * attempt);
                    }
                }
            }
        }
        let current = current.ok_or_else(|| Error::JobStatusUnavailable(job_id.clone(), attempts))?;
        trace!(
            "{}: job '{job_id}' is {} before canceling.",
            context.describe(),
            current.state
        );

        // Jobs in an error state (UGE `Eqw`) stay queued until deleted, so the
        // cancel command is sent whatever the state.
        match context.remote_cluster()?.cancel_job(&job_id) {
            Ok(_) => (),
            Err(error) if current.state.is_terminal() => {
                info!(
                    "{}: job '{job_id}' already finished as {}: {error}",
                    context.describe(),
                    current.state
                );
                context.save_job_status(&current)?;
                return Ok(recorded_status(context, current));
            }
            Err(error) => return Err(error),
        }

        let canceled = JobStatus::new(JobState::Canceled).with_reason("canceled by user");
        let recorded = context.save_job_status(&canceled)?;
        if recorded == JobState::Canceled {
            info!("{}: canceled job '{job_id}'.", context.describe());
        } else {
            info!(
                "{}: job '{job_id}' had already finished as {recorded}.",
                context.describe()
            );
        }
        Ok(recorded_status(context, canceled))
    }
}

/// The latest persisted status of the in-flight job, or `fallback`.
fn recorded_status(context: &ProcessContext, fallback: JobStatus) -> JobStatus {
    context
        .job
        .as_ref()
        .and_then(JobModel::status)
        .cloned()
        .unwrap_or(fallback)
}
