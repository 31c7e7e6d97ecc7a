// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use log::{debug, trace};
use std::collections::HashMap;
use std::path::Path;

use crate::model::JobStatus;
use crate::parser::{self, OutputParser};
use crate::resource::{ComputeResource, JobManagerConfiguration, JobManagerType};
use crate::session::{CommandOutput, Direction, PooledSession, RemoteSession};
use crate::Error;

/// Everything the submission command reported.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobSubmissionOutput {
    pub command: String,
    pub exit_code: i32,
    pub std_out: String,
    pub std_err: String,
    pub job_id: Option<String>,
    pub submission_failed: bool,
    pub failure_reason: Option<String>,
}

impl JobSubmissionOutput {
    /// True when the scheduler refused the job.
    pub fn is_rejected(&self) -> bool {
        self.exit_code != 0 || self.submission_failed
    }
}

/// `RemoteCluster` runs job manager commands on one compute resource.
///
/// It owns a leased session for the duration of one logical operation
/// sequence and returns it to the pool when dropped.
pub struct RemoteCluster {
    session: PooledSession,
    parser: Box<dyn OutputParser>,
    configuration: JobManagerConfiguration,
}

impl RemoteCluster {
    pub fn new(session: PooledSession, resource: &ComputeResource) -> Self {
        RemoteCluster {
            session,
            parser: parser::for_job_manager(resource.job_manager),
            configuration: JobManagerConfiguration::new(resource),
        }
    }

    pub fn host(&self) -> &str {
        self.session.host()
    }

    pub fn job_manager(&self) -> JobManagerType {
        self.configuration.job_manager()
    }

    pub fn session(&mut self) -> &mut dyn RemoteSession {
        &mut *self.session
    }

    /// Submit `job_file` from `working_directory`.
    ///
    /// A rejected submission is reported in the output, not as an error.
    ///
    /// # Errors
    /// Returns `Err(gantry::Error)` when the command cannot be built or run.
    ///
    pub fn submit_batch_job(
        &mut self,
        job_file: &str,
        working_directory: &str,
    ) -> Result<JobSubmissionOutput, Error> {
        let command = self
            .configuration
            .submit_command(working_directory, job_file)?;
        debug!("Submitting '{job_file}' on '{}'.", self.host());
        let output = self.session.execute(&command)?;

        let combined = format!("{}\n{}", output.stdout, output.stderr);
        let submission_failed = self.parser.is_job_submission_failed(&combined);
        let job_id = self.parser.parse_job_submission(&output.stdout);

        let failure_reason = if output.exit_code != 0 || submission_failed {
            let stderr = output.stderr.trim();
            let stdout = output.stdout.trim();
            Some(if !stderr.is_empty() {
                stderr.to_string()
            } else if !stdout.is_empty() {
                stdout.to_string()
            } else {
                format!("'{command}' exited with code {}", output.exit_code)
            })
        } else {
            None
        };

        trace!(
            "Submission on '{}' exited with {} (job id {:?}).",
            self.host(),
            output.exit_code,
            job_id
        );
        Ok(JobSubmissionOutput {
            command,
            exit_code: output.exit_code,
            std_out: output.stdout,
            std_err: output.stderr,
            job_id,
            submission_failed,
            failure_reason,
        })
    }

    /// Query the status of one job.
    ///
    /// Schedulers exit non-zero for ids they no longer know, so the output is
    /// parsed regardless of the exit code.
    ///
    /// # Errors
    /// Returns `Err(gantry::Error)` only when the query cannot be run.
    ///
    pub fn job_status(&mut self, job_id: &str, user_name: &str) -> Result<JobStatus, Error> {
        let command = self.configuration.status_command(job_id, user_name)?;
        let output = self.session.execute(&command)?;
        let status = self.parser.parse_job_status(job_id, &output.stdout);
        trace!("Job '{job_id}' on '{}' is {}.", self.host(), status.state);
        Ok(status)
    }

    /// Look up a job id by job name.
    pub fn job_id_by_name(&mut self, job_name: &str, user_name: &str) -> Result<Option<String>, Error> {
        let command = self
            .configuration
            .job_id_by_name_command(job_name, user_name)?;
        let output = self.session.execute(&command)?;
        Ok(self.parser.parse_job_id(job_name, &output.stdout))
    }

    /// Update many job statuses from one listing of the user's jobs.
    pub fn job_statuses(
        &mut self,
        user_name: &str,
        statuses: &mut HashMap<String, JobStatus>,
    ) -> Result<(), Error> {
        let command = self.configuration.user_status_command(user_name)?;
        let output = self.session.execute(&command)?;
        self.parser
            .parse_job_statuses(user_name, statuses, &output.stdout);
        Ok(())
    }

    /// Cancel a job.
    ///
    /// # Errors
    /// `gantry::Error::RemoteCommand` when the scheduler refuses.
    ///
    pub fn cancel_job(&mut self, job_id: &str) -> Result<CommandOutput, Error> {
        let command = self.configuration.cancel_command(job_id)?;
        debug!("Canceling job '{job_id}' on '{}'.", self.host());
        self.session.run(&command)
    }

    pub fn execute(&mut self, command: &str) -> Result<CommandOutput, Error> {
        self.session.execute(command)
    }

    pub fn make_directory(&mut self, path: &str) -> Result<(), Error> {
        self.session.make_directory(path)
    }

    pub fn copy_to(&mut self, local: &Path, remote: &str) -> Result<(), Error> {
        self.session.copy_to(local, remote)
    }

    pub fn copy_from(&mut self, remote: &str, local: &Path) -> Result<(), Error> {
        self.session.copy_from(remote, local)
    }

    pub fn list_files_matching(&mut self, pattern: &str, directory: &str) -> Result<Vec<String>, Error> {
        self.session.list_files_matching(pattern, directory)
    }

    pub fn file_exists(&mut self, path: &str) -> Result<bool, Error> {
        self.session.file_exists(path)
    }

    /// Copy a file between the compute resource and `peer` without staging
    /// it on the engine host.
    ///
    /// `Direction::To` moves `peer_path` to `compute_path`. `Direction::From`
    /// moves `compute_path` to `peer_path`. When `delete_source_after` is set,
    /// the source file is removed once both ends confirm the copy.
    ///
    pub fn third_party_transfer(
        &mut self,
        compute_path: &str,
        peer: &mut dyn RemoteSession,
        peer_path: &str,
        direction: Direction,
        delete_source_after: bool,
    ) -> Result<(), Error> {
        match direction {
            Direction::To => {
                peer.send_to(peer_path, &mut *self.session, compute_path)?;
                if delete_source_after {
                    peer.remove_file(peer_path)?;
                }
            }
            Direction::From => {
                self.session.send_to(compute_path, peer, peer_path)?;
                if delete_source_after {
                    self.session.remove_file(compute_path)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobState;
    use crate::resource::{JobManagerCommands, Protocol};
    use crate::session::mock::{fail, ok, MockSession, MockState};
    use serial_test::parallel;
    use std::sync::{Arc, Mutex};

    fn resource(job_manager: JobManagerType) -> ComputeResource {
        ComputeResource {
            id: "cluster".into(),
            host_name: "cluster".into(),
            port: None,
            protocol: Protocol::Ssh,
            login_user: Some("alice".into()),
            credential_token: None,
            job_manager,
            commands: JobManagerCommands::default(),
            command_prefix: None,
            gateway_usage: None,
        }
    }

    fn cluster(job_manager: JobManagerType) -> (RemoteCluster, Arc<Mutex<MockState>>) {
        let state = Arc::new(Mutex::new(MockState::default()));
        let session = MockSession::new("cluster", "alice", Arc::clone(&state));
        (
            RemoteCluster::new(
                PooledSession::detached(Box::new(session)),
                &resource(job_manager),
            ),
            state,
        )
    }

    #[test]
    #[parallel]
    fn accepted_submission() {
        let (mut cluster, state) = cluster(JobManagerType::Slurm);
        state
            .lock()
            .unwrap()
            .respond("sbatch", ok("Submitted batch job 4242\n"));

        let output = cluster.submit_batch_job("/w/job.sh", "/w").unwrap();
        assert!(!output.is_rejected());
        assert_eq!(output.job_id.as_deref(), Some("4242"));
        assert_eq!(output.failure_reason, None);
        assert_eq!(state.lock().unwrap().commands[0].1, "cd /w && sbatch /w/job.sh");
    }

    #[test]
    #[parallel]
    fn rejected_submission() {
        let (mut cluster, state) = cluster(JobManagerType::Slurm);
        state.lock().unwrap().respond(
            "sbatch",
            fail(1, "sbatch: error: Batch job submission failed: Invalid account\n"),
        );

        let output = cluster.submit_batch_job("/w/job.sh", "/w").unwrap();
        assert!(output.is_rejected());
        assert_eq!(
            output.failure_reason.as_deref(),
            Some("sbatch: error: Batch job submission failed: Invalid account")
        );
    }

    #[test]
    #[parallel]
    fn failure_text_with_zero_exit() {
        let (mut cluster, state) = cluster(JobManagerType::Uge);
        state.lock().unwrap().respond(
            "qsub",
            ok("Unable to run job: Rejecting job because of invalid queue.\n"),
        );

        let output = cluster.submit_batch_job("/w/job.sh", "/w").unwrap();
        assert_eq!(output.exit_code, 0);
        assert!(output.is_rejected());
    }

    #[test]
    #[parallel]
    fn status_ignores_exit_code() {
        let (mut cluster, state) = cluster(JobManagerType::Slurm);
        state.lock().unwrap().respond(
            "squeue -j",
            fail(1, "slurm_load_jobs error: Invalid job id specified\n"),
        );
        let status = cluster.job_status("99", "alice").unwrap();
        assert_eq!(status.state, JobState::Unknown);
    }

    #[test]
    #[parallel]
    fn cancel_reports_refusal() {
        let (mut cluster, state) = cluster(JobManagerType::Pbs);
        state
            .lock()
            .unwrap()
            .respond("qdel", fail(170, "qdel: Unknown Job Id 12.host\n"));
        assert!(matches!(
            cluster.cancel_job("12.host"),
            Err(Error::RemoteCommand(..))
        ));
    }

    #[test]
    #[parallel]
    fn third_party_directions() {
        let (mut cluster, state) = cluster(JobManagerType::Fork);
        let mut storage = MockSession::new("storage", "bob", Arc::clone(&state));

        cluster
            .third_party_transfer("/w/in.dat", &mut storage, "/data/in.dat", Direction::To, false)
            .unwrap();
        cluster
            .third_party_transfer("/w/out.tar", &mut storage, "/data/out.tar", Direction::From, true)
            .unwrap();

        let state = state.lock().unwrap();
        assert_eq!(
            state.transfers,
            vec![
                (
                    "storage".to_string(),
                    "/data/in.dat".to_string(),
                    "cluster".to_string(),
                    "/w/in.dat".to_string()
                ),
                (
                    "cluster".to_string(),
                    "/w/out.tar".to_string(),
                    "storage".to_string(),
                    "/data/out.tar".to_string()
                ),
            ]
        );
        assert_eq!(state.count("rm -f /w/out.tar"), 1);
        assert_eq!(state.count("rm -f /data/in.dat"), 0);
    }
}
