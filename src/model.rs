// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

//! Persisted models of processes, tasks, and jobs.
//!
//! Every model here is stored in the registry. Status histories are
//! append-only: a terminal status is never rewritten, a new observation is
//! pushed instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Phases of one process execution.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    Created,
    Validated,
    Started,
    PreProcessing,
    ConfiguringWorkspace,
    InputDataStaging,
    Executing,
    Monitoring,
    OutputDataStaging,
    PostProcessing,
    Completed,
    Failed,
    Canceling,
    Canceled,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessState::Completed | ProcessState::Failed | ProcessState::Canceled
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Created => "CREATED",
            ProcessState::Validated => "VALIDATED",
            ProcessState::Started => "STARTED",
            ProcessState::PreProcessing => "PRE_PROCESSING",
            ProcessState::ConfiguringWorkspace => "CONFIGURING_WORKSPACE",
            ProcessState::InputDataStaging => "INPUT_DATA_STAGING",
            ProcessState::Executing => "EXECUTING",
            ProcessState::Monitoring => "MONITORING",
            ProcessState::OutputDataStaging => "OUTPUT_DATA_STAGING",
            ProcessState::PostProcessing => "POST_PROCESSING",
            ProcessState::Completed => "COMPLETED",
            ProcessState::Failed => "FAILED",
            ProcessState::Canceling => "CANCELING",
            ProcessState::Canceled => "CANCELED",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    EnvSetup,
    DataStaging,
    JobSubmission,
    Archive,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskType::EnvSetup => "ENV_SETUP",
            TaskType::DataStaging => "DATA_STAGING",
            TaskType::JobSubmission => "JOB_SUBMISSION",
            TaskType::Archive => "ARCHIVE",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Created,
    Executing,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Created => "CREATED",
            TaskState::Executing => "EXECUTING",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TaskStatus {
    pub state: TaskState,
    pub reason: Option<String>,
    pub time_of_state_change: DateTime<Utc>,
}

impl TaskStatus {
    pub fn new(state: TaskState) -> Self {
        TaskStatus {
            state,
            reason: None,
            time_of_state_change: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_reason<S: Into<String>>(mut self, reason: S) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Failure record attached to a task, process, or experiment.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ErrorModel {
    pub actual_error_message: String,
    pub user_friendly_message: String,
    pub creation_time: DateTime<Utc>,
}

impl ErrorModel {
    pub fn new<A: Into<String>, U: Into<String>>(actual: A, user: U) -> Self {
        ErrorModel {
            actual_error_message: actual.into(),
            user_friendly_message: user.into(),
            creation_time: Utc::now(),
        }
    }
}

impl From<&crate::Error> for ErrorModel {
    fn from(error: &crate::Error) -> Self {
        ErrorModel::new(error.to_string(), error.user_message())
    }
}

/// Which way a staging task moves data.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingKind {
    Input,
    Output,
    ArchiveOutput,
}

/// Sub-model of a data staging or archive task.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DataStagingTaskModel {
    pub source: String,
    pub destination: String,
    pub kind: StagingKind,
    pub process_input: Option<InputDataObject>,
    pub process_output: Option<OutputDataObject>,
    pub transfer_start_time: Option<DateTime<Utc>>,
    pub transfer_end_time: Option<DateTime<Utc>>,
}

impl DataStagingTaskModel {
    pub fn new<S: Into<String>, D: Into<String>>(kind: StagingKind, source: S, destination: D) -> Self {
        DataStagingTaskModel {
            source: source.into(),
            destination: destination.into(),
            kind,
            process_input: None,
            process_output: None,
            transfer_start_time: None,
            transfer_end_time: None,
        }
    }
}

/// Type-specific part of a task.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum TaskDetail {
    EnvSetup { location: String },
    DataStaging(DataStagingTaskModel),
    JobSubmission { monitor_mode: Option<String> },
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TaskModel {
    pub task_id: String,
    pub parent_process_id: String,
    pub task_type: TaskType,
    pub detail: TaskDetail,
    pub statuses: Vec<TaskStatus>,
    pub errors: Vec<ErrorModel>,
    pub creation_time: DateTime<Utc>,
}

impl TaskModel {
    pub fn new(parent_process_id: &str, task_type: TaskType, detail: TaskDetail) -> Self {
        TaskModel {
            task_id: format!("{}-{}", task_type.to_string().to_lowercase(), uuid::Uuid::new_v4()),
            parent_process_id: parent_process_id.into(),
            task_type,
            detail,
            statuses: vec![TaskStatus::new(TaskState::Created)],
            errors: Vec::new(),
            creation_time: Utc::now(),
        }
    }

    /// The most recent status.
    pub fn status(&self) -> Option<&TaskStatus> {
        self.statuses.last()
    }

    pub fn state(&self) -> TaskState {
        self.status().map_or(TaskState::Created, |s| s.state)
    }

    pub fn staging(&self) -> Option<&DataStagingTaskModel> {
        match &self.detail {
            TaskDetail::DataStaging(staging) => Some(staging),
            _ => None,
        }
    }

    pub fn staging_mut(&mut self) -> Option<&mut DataStagingTaskModel> {
        match &mut self.detail {
            TaskDetail::DataStaging(staging) => Some(staging),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    String,
    Integer,
    Float,
    Uri,
    UriCollection,
    Stdout,
    Stderr,
}

impl DataType {
    /// True for types whose values name files to move.
    pub fn is_file(self) -> bool {
        matches!(
            self,
            DataType::Uri | DataType::UriCollection | DataType::Stdout | DataType::Stderr
        )
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InputDataObject {
    pub name: String,
    pub value: Option<String>,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub add_to_command_line: bool,
    pub argument_prefix: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OutputDataObject {
    pub name: String,
    pub value: Option<String>,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default)]
    pub is_required: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Submitted,
    Queued,
    Active,
    Complete,
    Failed,
    Canceled,
    Suspended,
    Unknown,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed | JobState::Canceled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Submitted => "SUBMITTED",
            JobState::Queued => "QUEUED",
            JobState::Active => "ACTIVE",
            JobState::Complete => "COMPLETE",
            JobState::Failed => "FAILED",
            JobState::Canceled => "CANCELED",
            JobState::Suspended => "SUSPENDED",
            JobState::Unknown => "UNKNOWN",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct JobStatus {
    pub state: JobState,
    pub reason: Option<String>,
    pub time_of_state_change: DateTime<Utc>,
}

impl JobStatus {
    pub fn new(state: JobState) -> Self {
        JobStatus {
            state,
            reason: None,
            time_of_state_change: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_reason<S: Into<String>>(mut self, reason: S) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Two statuses describe the same observation when state and reason match.
    pub fn same_as(&self, other: &JobStatus) -> bool {
        self.state == other.state && self.reason == other.reason
    }
}

/// The job as known to the remote scheduler.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct JobModel {
    pub job_id: Option<String>,
    pub job_name: String,
    pub process_id: String,
    pub task_id: String,
    pub compute_resource_id: String,
    pub job_description: String,
    pub working_directory: String,
    pub statuses: Vec<JobStatus>,
    pub std_out: Option<String>,
    pub std_err: Option<String>,
    pub exit_code: Option<i32>,
    pub submitted_time: Option<DateTime<Utc>>,
}

impl JobModel {
    pub fn status(&self) -> Option<&JobStatus> {
        self.statuses.last()
    }

    pub fn state(&self) -> JobState {
        self.status().map_or(JobState::Unknown, |s| s.state)
    }

    /// The scheduler id, unless it is absent or the placeholder.
    pub fn known_job_id(&self) -> Option<&str> {
        self.job_id
            .as_deref()
            .filter(|id| !id.is_empty() && *id != crate::DEFAULT_JOB_ID)
    }
}

/// Resource requests for the job.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Scheduling {
    /// Wall time limit in minutes.
    pub wall_time_limit: Option<u64>,
    pub node_count: Option<u32>,
    pub total_cpu_count: Option<u32>,
    pub queue_name: Option<String>,
    pub account: Option<String>,
    pub total_physical_memory: Option<u64>,
}

impl Scheduling {
    pub fn wall_time(&self) -> Option<Duration> {
        self.wall_time_limit.map(|m| Duration::from_secs(m * 60))
    }
}

/// What the job runs.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Application {
    pub name: String,
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub module_loads: Vec<String>,
    #[serde(default)]
    pub environment: Vec<(String, String)>,
    #[serde(default)]
    pub pre_job_commands: Vec<String>,
    #[serde(default)]
    pub post_job_commands: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ProcessModel {
    pub process_id: String,
    pub experiment_id: String,
    pub task_order: Vec<String>,
    pub state: ProcessState,
    pub scheduling: Scheduling,
    pub working_directory: String,
    pub compute_resource_id: String,
    pub storage_resource_id: String,
    pub experiment_data_dir: Option<String>,
    pub inputs: Vec<InputDataObject>,
    pub outputs: Vec<OutputDataObject>,
    pub application: Application,
    pub user_name: String,
    pub gateway_id: String,
    pub clean_after_staged: bool,
    pub stream_output: bool,
    pub errors: Vec<ErrorModel>,
    pub creation_time: DateTime<Utc>,
}

impl ProcessModel {
    fn job_output_path(&self, extension: &str) -> String {
        let name = if self.application.name.is_empty() {
            &self.process_id
        } else {
            &self.application.name
        };
        Path::new(&self.working_directory)
            .join(format!("{name}.{extension}"))
            .to_string_lossy()
            .into_owned()
    }

    /// Where the job writes its standard output.
    pub fn std_out_path(&self) -> String {
        self.job_output_path("stdout")
    }

    /// Where the job writes its standard error.
    pub fn std_err_path(&self) -> String {
        self.job_output_path("stderr")
    }

    /// Directory under the storage root that receives this process's outputs.
    pub fn output_directory(&self) -> PathBuf {
        match &self.experiment_data_dir {
            Some(directory) if !directory.is_empty() => PathBuf::from(directory),
            _ => PathBuf::from(&self.process_id),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ExperimentModel {
    pub experiment_id: String,
    pub user_name: String,
    pub gateway_id: String,
    pub outputs: Vec<OutputDataObject>,
    pub errors: Vec<ErrorModel>,
}

impl ExperimentModel {
    pub fn new(experiment_id: &str, user_name: &str, gateway_id: &str) -> Self {
        ExperimentModel {
            experiment_id: experiment_id.into(),
            user_name: user_name.into(),
            gateway_id: gateway_id.into(),
            outputs: Vec::new(),
            errors: Vec::new(),
        }
    }
}
