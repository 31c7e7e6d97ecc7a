// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

//! Run processes: tasks in order within a process, processes in parallel.

use indicatif::ProgressBar;
use log::{debug, error, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::context::{ProcessContext, TaskContext};
use crate::model::{
    ErrorModel, ExperimentModel, JobModel, JobState, JobStatus, ProcessState, StagingKind,
    TaskModel, TaskState, TaskType,
};
use crate::process::ProcessPlan;
use crate::registry::{ErrorTarget, Registry};
use crate::session::SessionPool;
use crate::settings::EngineSettings;
use crate::task::streaming::{stream_targets, streaming_interval};
use crate::task::{self, DataStreamer, DefaultJobSubmissionTask, JobSubmissionTask, Task};
use crate::{progress_styles, Error, MultiProgressContainer};

/// Longest uninterrupted sleep while waiting on a job.
const TERMINATION_CHECK: Duration = Duration::from_millis(200);

/// Whether tasks run from scratch or re-enter after a restart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    Execute,
    Recover,
}

/// The process phase a task runs in.
fn phase_for(task: &TaskModel) -> ProcessState {
    match task.task_type {
        TaskType::EnvSetup => ProcessState::ConfiguringWorkspace,
        TaskType::JobSubmission => ProcessState::Executing,
        TaskType::Archive => ProcessState::OutputDataStaging,
        TaskType::DataStaging => match task.staging().map(|s| s.kind) {
            Some(StagingKind::Input) => ProcessState::InputDataStaging,
            _ => ProcessState::OutputDataStaging,
        },
    }
}

/// Execute the tasks of one process in order.
pub struct ProcessRunner {
    context: ProcessContext,
    tasks: Vec<TaskModel>,
    should_terminate: Arc<AtomicBool>,
    progress: Option<ProgressBar>,
}

impl ProcessRunner {
    pub fn new(context: ProcessContext, tasks: Vec<TaskModel>, should_terminate: Arc<AtomicBool>) -> Self {
        ProcessRunner {
            context,
            tasks,
            should_terminate,
            progress: None,
        }
    }

    /// Report the current phase on `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn context(&self) -> &ProcessContext {
        &self.context
    }

    fn set_state(&mut self, state: ProcessState) -> Result<(), Error> {
        if let Some(progress) = &self.progress {
            progress.set_message(state.to_string());
        }
        self.context.set_state(state)
    }

    fn terminating(&self) -> bool {
        self.should_terminate.load(Ordering::Relaxed)
    }

    /// Sleep for `duration`, waking early when termination is requested.
    fn pause(&self, duration: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + duration;
        loop {
            if self.terminating() {
                return Err(Error::Interrupted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(TERMINATION_CHECK));
        }
    }

    /// Record a failure that belongs to the process rather than one task.
    fn record_error(&mut self, error: &ErrorModel) {
        let targets = [
            ErrorTarget::Experiment(self.context.process.experiment_id.clone()),
            ErrorTarget::Process(self.context.process.process_id.clone()),
        ];
        for target in targets {
            if let Err(persist_error) = self.context.registry.add_error(target, error) {
                warn!(
                    "{}: unable to record error: {persist_error}",
                    self.context.describe()
                );
            }
        }
        self.context.process.errors.push(error.clone());
    }

    /// The persisted job of this process, reloaded from the registry.
    fn recorded_job(&mut self) -> Result<JobModel, Error> {
        self.context.registry.refresh()?;
        let process_id = self.context.process_id();
        let job = self
            .context
            .registry
            .job(process_id)?
            .ok_or_else(|| Error::JobModelMissing(process_id.into()))?;
        self.context.job = Some(job.clone());
        Ok(job)
    }

    /// Poll the job until it reaches a terminal state or leaves the queue.
    ///
    /// A terminal state recorded by someone else, such as `gantry cancel`,
    /// ends the wait.
    fn wait_for_job(&mut self) -> Result<JobState, Error> {
        self.set_state(ProcessState::Monitoring)?;
        let job = self.recorded_job()?;
        let job_id = job
            .known_job_id()
            .ok_or_else(|| {
                Error::JobNotSubmitted(job.job_name.clone(), self.context.process_id().into())
            })?
            .to_string();

        let user = self.context.compute.login_user();
        let attempts = self.context.settings.cancel_status_attempts.max(1);
        let mut failures = 0;
        loop {
            let recorded = self.recorded_job()?.state();
            if recorded.is_terminal() {
                debug!(
                    "{}: job '{job_id}' was recorded as {recorded}.",
                    self.context.describe()
                );
                return Ok(recorded);
            }

            match self
                .context
                .remote_cluster()
                .and_then(|mut cluster| cluster.job_status(&job_id, &user))
            {
                Ok(status) if status.state == JobState::Unknown => {
                    debug!("{}: job '{job_id}' left the queue.", self.context.describe());
                    return self.context.save_job_status(
                        &JobStatus::new(JobState::Complete).with_reason("job left the queue"),
                    );
                }
                Ok(status) => {
                    failures = 0;
                    trace!(
                        "{}: job '{job_id}' is {}.",
                        self.context.describe(),
                        status.state
                    );
                    let recorded = self.context.save_job_status(&status)?;
                    if recorded.is_terminal() {
                        return Ok(recorded);
                    }
                }
                Err(error) => {
                    failures += 1;
                    warn!(
                        "{}: unable to query job '{job_id}' ({failures}/{attempts}): {error}",
                        self.context.describe()
                    );
                    if failures >= attempts {
                        return Err(Error::JobStatusUnavailable(job_id, failures));
                    }
                }
            }

            self.pause(self.context.settings.monitor_interval)?;
        }
    }

    fn start_streamer(&self) -> Option<DataStreamer> {
        if !self.context.process.stream_output {
            return None;
        }
        Some(DataStreamer::start(
            Arc::clone(&self.context.sessions),
            self.context.compute_key(),
            self.context.storage_key(),
            stream_targets(&self.context),
            streaming_interval(self.context.process.scheduling.wall_time()),
        ))
    }

    /// Run every task of the process.
    ///
    /// Stops at the first failed task. In `Recover` mode, tasks that already
    /// finished report their recorded status without touching any host.
    ///
    /// # Errors
    /// Returns `Err(gantry::Error)` when a process level step fails or the
    /// engine is interrupted. Task failures are not errors: they are recorded
    /// on the task and the process ends `FAILED`.
    ///
    pub fn run(&mut self, mode: RunMode) -> Result<ProcessState, Error> {
        let state = self.context.process.state;
        if state.is_terminal() {
            debug!("{} is already {state}.", self.context.describe());
            return Ok(state);
        }
        if state == ProcessState::Created {
            self.set_state(ProcessState::Started)?;
        }

        let mut tasks = std::mem::take(&mut self.tasks);
        let result = self.run_tasks(&mut tasks, mode);
        self.tasks = tasks;
        result
    }

    fn run_tasks(&mut self, tasks: &mut [TaskModel], mode: RunMode) -> Result<ProcessState, Error> {
        for model in tasks.iter_mut() {
            if self.terminating() {
                return Err(Error::Interrupted);
            }

            if !model.state().is_terminal() {
                self.set_state(phase_for(model))?;
            }

            let mut implementation = task::for_type(model.task_type);
            implementation.init(&self.context.settings);
            let status = {
                let mut context = TaskContext::new(model, &mut self.context);
                match mode {
                    RunMode::Execute => implementation.execute(&mut context),
                    RunMode::Recover => implementation.recover(&mut context),
                }
            };

            if status.state == TaskState::Failed {
                info!(
                    "{}: task '{}' failed: {}",
                    self.context.describe(),
                    model.task_id,
                    status.reason.as_deref().unwrap_or("no reason given")
                );
                self.set_state(ProcessState::Failed)?;
                return Ok(ProcessState::Failed);
            }

            if model.task_type == TaskType::JobSubmission {
                let streamer = self.start_streamer();
                let job_state = self.wait_for_job();
                drop(streamer);

                match job_state? {
                    JobState::Canceled => {
                        self.set_state(ProcessState::Canceled)?;
                        return Ok(ProcessState::Canceled);
                    }
                    JobState::Failed => {
                        self.record_error(&ErrorModel::new(
                            format!("The job of process '{}' failed.", self.context.process_id()),
                            "The job failed on the compute resource.",
                        ));
                        self.set_state(ProcessState::Failed)?;
                        return Ok(ProcessState::Failed);
                    }
                    _ => (),
                }
            }
        }

        self.set_state(ProcessState::Completed)?;
        Ok(ProcessState::Completed)
    }
}

/// Owns the shared registry and session pool.
pub struct Engine {
    registry: Arc<dyn Registry>,
    sessions: Arc<SessionPool>,
    settings: EngineSettings,
    should_terminate: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(
        registry: Arc<dyn Registry>,
        sessions: Arc<SessionPool>,
        settings: EngineSettings,
        should_terminate: Arc<AtomicBool>,
    ) -> Self {
        Engine {
            registry,
            sessions,
            settings,
            should_terminate,
        }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Record a planned process and its tasks.
    ///
    /// # Errors
    /// Returns `Err(gantry::Error)` when the registry cannot be written.
    ///
    pub fn submit(&self, plan: &ProcessPlan) -> Result<(), Error> {
        let process = &plan.process;
        match self.registry.experiment(&process.experiment_id) {
            Ok(_) => (),
            Err(Error::RecordNotFound(..)) => {
                self.registry.save_experiment(&ExperimentModel::new(
                    &process.experiment_id,
                    &process.user_name,
                    &process.gateway_id,
                ))?;
            }
            Err(error) => return Err(error),
        }

        self.registry.save_process(process)?;
        for task in &plan.tasks {
            self.registry.save_task(task)?;
        }
        debug!(
            "Recorded process '{}' with {} tasks.",
            process.process_id,
            plan.tasks.len()
        );
        Ok(())
    }

    /// Load a persisted process and its tasks.
    ///
    /// # Errors
    /// Returns `Err(gantry::Error)` when the process or its resources are missing.
    ///
    pub fn runner(&self, process_id: &str) -> Result<ProcessRunner, Error> {
        let process = self.registry.process(process_id)?;
        let tasks = self.registry.tasks(process_id)?;
        let context = ProcessContext::new(
            process,
            Arc::clone(&self.registry),
            Arc::clone(&self.sessions),
            self.settings.clone(),
        )?;
        Ok(ProcessRunner::new(
            context,
            tasks,
            Arc::clone(&self.should_terminate),
        ))
    }

    /// Run one process to completion.
    ///
    /// A process level failure is recorded on the process and experiment
    /// before it is returned. An interrupted process keeps its state so that
    /// it can be recovered.
    ///
    /// # Errors
    /// Returns `Err(gantry::Error)` when the process cannot be loaded or a
    /// process level step fails.
    ///
    pub fn run_one(
        &self,
        process_id: &str,
        mode: RunMode,
        progress: Option<ProgressBar>,
    ) -> Result<ProcessState, Error> {
        let mut runner = self.runner(process_id)?;
        if let Some(progress) = progress {
            runner = runner.with_progress(progress);
        }

        match runner.run(mode) {
            Ok(state) => Ok(state),
            Err(Error::ProcessFinished(_, state)) => {
                info!("{} already finished as {state}.", runner.context().describe());
                Ok(state)
            }
            Err(Error::Interrupted) => {
                warn!(
                    "{} was interrupted, run 'gantry recover {process_id}' to resume.",
                    runner.context().describe()
                );
                Err(Error::Interrupted)
            }
            Err(error) => {
                error!("{}: {error}", runner.context().describe());
                runner.record_error(&ErrorModel::from(&error));
                if let Err(persist_error) = runner.set_state(ProcessState::Failed) {
                    warn!("Unable to record the failure of '{process_id}': {persist_error}");
                }
                Err(error)
            }
        }
    }

    /// Run many processes, each on its own thread.
    ///
    /// Returns the outcome of every process in the order given.
    pub fn run_all(
        &self,
        process_ids: &[String],
        mode: RunMode,
        multi_progress: &mut MultiProgressContainer,
    ) -> Vec<(String, Result<ProcessState, Error>)> {
        let bars: Vec<ProgressBar> = process_ids
            .iter()
            .map(|process_id| {
                let progress =
                    multi_progress.add(ProgressBar::new_spinner().with_prefix(process_id.clone()));
                progress.set_style(progress_styles::process_spinner());
                progress.enable_steady_tick(Duration::from_millis(progress_styles::STEADY_TICK));
                progress
            })
            .collect();

        thread::scope(|scope| {
            let handles: Vec<_> = process_ids
                .iter()
                .zip(bars)
                .map(|(process_id, progress)| {
                    scope.spawn(move || {
                        let result = self.run_one(process_id, mode, Some(progress.clone()));
                        match &result {
                            Ok(state) => progress.finish_with_message(state.to_string()),
                            Err(_) => progress.abandon(),
                        }
                        result
                    })
                })
                .collect();

            process_ids
                .iter()
                .zip(handles)
                .map(|(process_id, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(Error::RemoteCommand(
                            "localhost".into(),
                            format!("run process '{process_id}'"),
                            "the runner thread panicked".into(),
                        ))
                    });
                    (process_id.clone(), result)
                })
                .collect()
        })
    }

    /// Cancel the job of a process.
    ///
    /// # Errors
    /// Returns `Err(gantry::Error)` when the job cannot be confirmed canceled.
    ///
    pub fn cancel(&self, process_id: &str) -> Result<JobStatus, Error> {
        let process = self.registry.process(process_id)?;
        let mut context = ProcessContext::new(
            process,
            Arc::clone(&self.registry),
            Arc::clone(&self.sessions),
            self.settings.clone(),
        )?;

        let mut submission = DefaultJobSubmissionTask::default();
        submission.init(&self.settings);
        let status = submission.cancel(&mut context)?;
        if status.state == JobState::Canceled {
            match context.set_state(ProcessState::Canceled) {
                Err(Error::ProcessFinished(_, state)) => {
                    debug!("{} already finished as {state}.", context.describe());
                }
                result => result?,
            }
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{fast_settings, resources};
    use crate::model::{DataStagingTaskModel, OutputDataObject, DataType, TaskDetail};
    use crate::registry::LocalRegistry;
    use crate::resource::JobManagerType;
    use crate::script;
    use crate::session::mock::{ok, MockFactory, MockState};
    use serial_test::parallel;
    use std::sync::Mutex;

    fn setup() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::max())
            .is_test(true)
            .try_init();
    }

    fn plan() -> ProcessPlan {
        let mut process = script::tests::process();
        process.inputs.clear();
        let env = TaskModel::new(
            "p1",
            TaskType::EnvSetup,
            TaskDetail::EnvSetup {
                location: "/scratch/p1".into(),
            },
        );
        let input = TaskModel::new(
            "p1",
            TaskType::DataStaging,
            TaskDetail::DataStaging(DataStagingTaskModel::new(
                StagingKind::Input,
                "scp://gateway@storage.gateway.org/data/gateway/in.pdb",
                "scp://alice@login.cluster.edu/scratch/p1/in.pdb",
            )),
        );
        let submission = TaskModel::new(
            "p1",
            TaskType::JobSubmission,
            TaskDetail::JobSubmission { monitor_mode: None },
        );
        let mut staging = DataStagingTaskModel::new(
            StagingKind::Output,
            "scp://alice@login.cluster.edu/scratch/p1/result.dat",
            "dummy://dummy/",
        );
        staging.process_output = Some(OutputDataObject {
            name: "result".into(),
            value: Some("result.dat".into()),
            data_type: DataType::Uri,
            is_required: true,
        });
        let output = TaskModel::new("p1", TaskType::DataStaging, TaskDetail::DataStaging(staging));

        let tasks = vec![env, input, submission, output];
        process.task_order = tasks.iter().map(|t| t.task_id.clone()).collect();
        ProcessPlan { process, tasks }
    }

    fn engine(job_manager: JobManagerType) -> (Engine, Arc<Mutex<MockState>>, Arc<AtomicBool>) {
        let state = Arc::new(Mutex::new(MockState::default()));
        let sessions = Arc::new(SessionPool::new(
            Box::new(MockFactory {
                state: Arc::clone(&state),
            }),
            4,
        ));
        let registry: Arc<dyn Registry> =
            Arc::new(LocalRegistry::in_memory(resources(job_manager)));
        let terminate = Arc::new(AtomicBool::new(false));
        let mut settings = fast_settings();
        settings.local_data_location = std::env::temp_dir().join("gantry-engine-tests");
        (
            Engine::new(registry, sessions, settings, Arc::clone(&terminate)),
            state,
            terminate,
        )
    }

    #[test]
    #[parallel]
    fn phases() {
        let plan = plan();
        let phases: Vec<ProcessState> = plan.tasks.iter().map(phase_for).collect();
        assert_eq!(
            phases,
            vec![
                ProcessState::ConfiguringWorkspace,
                ProcessState::InputDataStaging,
                ProcessState::Executing,
                ProcessState::OutputDataStaging
            ]
        );
    }

    #[test]
    #[parallel]
    fn end_to_end() {
        setup();
        let (engine, state, _) = engine(JobManagerType::Slurm);
        state
            .lock()
            .unwrap()
            .respond("sbatch", ok("Submitted batch job 7\n"));
        let running = "JOBID PARTITION NAME USER ST TIME NODES NODELIST(REASON)\n7 shared A0 alice R 0:01 2 node[1-2]\n";
        // Verification sees the first listing, monitoring the second.
        state.lock().unwrap().respond("squeue -j", ok(running));
        state.lock().unwrap().respond("squeue -j", ok(running));
        state.lock().unwrap().respond("squeue -j", ok(""));

        engine.submit(&plan()).unwrap();
        let result = engine.run_one("p1", RunMode::Execute, None).unwrap();
        assert_eq!(result, ProcessState::Completed);

        let registry = engine.registry();
        assert_eq!(registry.process_state("p1").unwrap(), ProcessState::Completed);
        let job = registry.job("p1").unwrap().unwrap();
        assert_eq!(job.state(), JobState::Complete);
        assert!(job.statuses.iter().any(|s| s.state == JobState::Active));
        assert!(registry
            .tasks("p1")
            .unwrap()
            .iter()
            .all(|t| t.state() == TaskState::Completed));

        let state = state.lock().unwrap();
        assert_eq!(state.transfers.len(), 2);
        assert_eq!(state.count("sbatch"), 1);
    }

    #[test]
    #[parallel]
    fn failed_task_stops_the_process() {
        setup();
        let (engine, state, _) = engine(JobManagerType::Slurm);
        state.lock().unwrap().respond("stat -c %s", ok("0\n"));

        engine.submit(&plan()).unwrap();
        let result = engine.run_one("p1", RunMode::Execute, None).unwrap();
        assert_eq!(result, ProcessState::Failed);

        let state = state.lock().unwrap();
        assert_eq!(state.count("sbatch"), 0);
        assert_eq!(engine.registry().process("p1").unwrap().errors.len(), 1);
    }

    #[test]
    #[parallel]
    fn recover_resumes_monitoring() {
        setup();
        let (engine, state, _) = engine(JobManagerType::Slurm);
        state
            .lock()
            .unwrap()
            .respond("sbatch", ok("Submitted batch job 12\n"));
        engine.submit(&plan()).unwrap();
        engine.run_one("p1", RunMode::Execute, None).unwrap();

        // Forget the last two steps, as if the engine stopped while monitoring.
        let registry = engine.registry();
        let mut tasks = registry.tasks("p1").unwrap();
        let output = tasks.pop().unwrap();
        let mut output = registry.task(&output.task_id).unwrap();
        output.statuses.truncate(1);
        registry.save_task(&output).unwrap();
        let mut process = registry.process("p1").unwrap();
        process.state = ProcessState::Monitoring;
        registry.save_process(&process).unwrap();
        let mut job = registry.job("p1").unwrap().unwrap();
        job.statuses.truncate(1);
        registry.save_job_model(&job).unwrap();

        let result = engine.run_one("p1", RunMode::Recover, None).unwrap();
        assert_eq!(result, ProcessState::Completed);

        let state = state.lock().unwrap();
        assert_eq!(state.count("sbatch"), 1);
        assert_eq!(state.count("mkdir -p /scratch/p1"), 1);
        assert_eq!(state.transfers.len(), 3);
    }

    #[test]
    #[parallel]
    fn canceled_job_cancels_the_process() {
        setup();
        let (engine, state, _) = engine(JobManagerType::Slurm);
        state
            .lock()
            .unwrap()
            .respond("sbatch", ok("Submitted batch job 3\n"));
        state.lock().unwrap().respond(
            "squeue -j",
            ok("JOBID PARTITION NAME USER ST TIME NODES NODELIST(REASON)\n3 shared A0 alice CA 0:01 2 node[1-2]\n"),
        );

        engine.submit(&plan()).unwrap();
        let result = engine.run_one("p1", RunMode::Execute, None).unwrap();
        assert_eq!(result, ProcessState::Canceled);
        assert_eq!(state.lock().unwrap().transfers.len(), 1);
    }

    #[test]
    #[parallel]
    fn cancel_during_monitoring() {
        setup();
        let (mut engine, state, _) = engine(JobManagerType::Slurm);
        engine.settings.monitor_interval = Duration::from_millis(10);
        state
            .lock()
            .unwrap()
            .respond("sbatch", ok("Submitted batch job 13\n"));
        state.lock().unwrap().respond(
            "squeue -j",
            ok("JOBID PARTITION NAME USER ST TIME NODES NODELIST(REASON)\n13 shared A0 alice R 0:01 2 node[1-2]\n"),
        );
        engine.submit(&plan()).unwrap();

        let engine = &engine;
        let result = thread::scope(|scope| {
            let runner = scope.spawn(|| engine.run_one("p1", RunMode::Execute, None));

            let mut active = false;
            for _ in 0..2000 {
                let job = engine.registry().job("p1").unwrap();
                if job.is_some_and(|job| job.state() == JobState::Active) {
                    active = true;
                    break;
                }
                thread::sleep(Duration::from_millis(5));
            }
            assert!(active, "the runner never reached monitoring");

            let status = engine.cancel("p1").unwrap();
            assert_eq!(status.state, JobState::Canceled);

            // The deleted job leaves the queue, which alone would read as complete.
            {
                let mut state = state.lock().unwrap();
                state.responses.retain(|(pattern, _)| pattern != "squeue -j");
                state.respond("squeue -j", ok(""));
            }
            runner.join().unwrap()
        });
        assert_eq!(result.unwrap(), ProcessState::Canceled);

        let registry = engine.registry();
        assert_eq!(registry.process_state("p1").unwrap(), ProcessState::Canceled);
        let job = registry.job("p1").unwrap().unwrap();
        assert_eq!(job.state(), JobState::Canceled);
        assert!(job.statuses.iter().all(|s| s.state != JobState::Complete));

        let state = state.lock().unwrap();
        assert_eq!(state.count("scancel 13"), 1);
        assert_eq!(state.transfers.len(), 1);
    }

    #[test]
    #[parallel]
    fn interrupted_keeps_state() {
        setup();
        let (engine, state, terminate) = engine(JobManagerType::Slurm);
        state
            .lock()
            .unwrap()
            .respond("sbatch", ok("Submitted batch job 5\n"));
        state.lock().unwrap().respond(
            "squeue -j",
            ok("JOBID PARTITION NAME USER ST TIME NODES NODELIST(REASON)\n5 shared A0 alice PD 0:00 2 (Priority)\n"),
        );
        engine.submit(&plan()).unwrap();

        let mut runner = engine.runner("p1").unwrap();
        runner.context.settings.monitor_interval = Duration::from_secs(60);
        let flag = Arc::clone(&terminate);
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            flag.store(true, Ordering::Relaxed);
        });

        assert!(matches!(runner.run(RunMode::Execute), Err(Error::Interrupted)));
        stopper.join().unwrap();
        assert_eq!(
            engine.registry().process_state("p1").unwrap(),
            ProcessState::Monitoring
        );
    }

    #[test]
    #[parallel]
    fn run_all_in_parallel() {
        setup();
        let (engine, state, _) = engine(JobManagerType::Slurm);
        state
            .lock()
            .unwrap()
            .respond("sbatch", ok("Submitted batch job 9\n"));

        let mut ids = Vec::new();
        for index in 0..3 {
            let mut plan = plan();
            plan.process.process_id = format!("p{index}");
            for task in &mut plan.tasks {
                task.parent_process_id = plan.process.process_id.clone();
            }
            ids.push(plan.process.process_id.clone());
            engine.submit(&plan).unwrap();
        }

        let mut container = MultiProgressContainer::new(indicatif::MultiProgress::with_draw_target(
            indicatif::ProgressDrawTarget::hidden(),
        ));
        let results = engine.run_all(&ids, RunMode::Execute, &mut container);
        assert_eq!(results.len(), 3);
        for (id, result) in results {
            assert_eq!(result.unwrap(), ProcessState::Completed, "{id}");
        }
    }

    #[test]
    #[parallel]
    fn cancel_through_engine() {
        setup();
        let (engine, state, _) = engine(JobManagerType::Slurm);
        state
            .lock()
            .unwrap()
            .respond("sbatch", ok("Submitted batch job 21\n"));
        let plan = plan();
        engine.submit(&plan).unwrap();

        // Submit only, then cancel from the outside.
        let mut runner = engine.runner("p1").unwrap();
        let mut tasks = std::mem::take(&mut runner.tasks);
        tasks.truncate(3);
        for model in &mut tasks {
            runner.context.set_state(phase_for(model)).unwrap();
            let mut implementation = task::for_type(model.task_type);
            implementation.init(&runner.context.settings);
            let mut context = TaskContext::new(model, &mut runner.context);
            implementation.execute(&mut context);
        }

        let status = engine.cancel("p1").unwrap();
        assert_eq!(status.state, JobState::Canceled);
        assert_eq!(state.lock().unwrap().count("scancel 21"), 1);
        assert_eq!(
            engine.registry().process_state("p1").unwrap(),
            ProcessState::Canceled
        );
    }

    #[test]
    #[parallel]
    fn cancel_keeps_a_finished_process() {
        setup();
        let (engine, state, _) = engine(JobManagerType::Slurm);
        state
            .lock()
            .unwrap()
            .respond("sbatch", ok("Submitted batch job 22\n"));
        engine.submit(&plan()).unwrap();

        // Monitoring gave up on an unreachable scheduler, the job is still queued.
        let mut runner = engine.runner("p1").unwrap();
        let mut tasks = std::mem::take(&mut runner.tasks);
        tasks.truncate(3);
        for model in &mut tasks {
            runner.context.set_state(phase_for(model)).unwrap();
            let mut implementation = task::for_type(model.task_type);
            implementation.init(&runner.context.settings);
            let mut context = TaskContext::new(model, &mut runner.context);
            implementation.execute(&mut context);
        }
        runner.context.set_state(ProcessState::Failed).unwrap();

        let status = engine.cancel("p1").unwrap();
        assert_eq!(status.state, JobState::Canceled);
        assert_eq!(state.lock().unwrap().count("scancel 22"), 1);
        assert_eq!(
            engine.registry().process_state("p1").unwrap(),
            ProcessState::Failed
        );
    }
}
