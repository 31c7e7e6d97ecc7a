// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use chrono::Utc;
use log::{debug, trace};
use path_absolutize::Absolutize;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::model::{
    Application, DataStagingTaskModel, DataType, InputDataObject, OutputDataObject, ProcessModel,
    ProcessState, Scheduling, StagingKind, TaskDetail, TaskModel, TaskType,
};
use crate::resource::{self, ComputeResource};
use crate::settings::parse_duration;
use crate::task::staging::{join, location_uri};
use crate::{Error, DUMMY_HOST};

fn default_process_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_gateway_id() -> String {
    "default".into()
}

/// Resource requests as written in a process file.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SchedulingDescription {
    /// Wall time such as `01:30:00`.
    pub wall_time: Option<String>,
    pub node_count: Option<u32>,
    pub total_cpu_count: Option<u32>,
    pub queue_name: Option<String>,
    pub account: Option<String>,
    /// Memory in megabytes.
    pub total_physical_memory: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ApplicationDescription {
    pub name: String,
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub module_loads: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub pre_job_commands: Vec<String>,
    #[serde(default)]
    pub post_job_commands: Vec<String>,
}

/// A process file: one application run on one compute resource.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProcessDescription {
    #[serde(default = "default_process_id")]
    pub process_id: String,

    pub experiment_id: String,

    #[serde(default = "resource::current_user")]
    pub user_name: String,

    #[serde(default = "default_gateway_id")]
    pub gateway_id: String,

    pub compute_resource: String,

    pub storage_resource: String,

    /// Absolute path to the job's directory on the compute resource.
    pub working_directory: String,

    /// Directory under the storage root that receives outputs.
    pub experiment_data_dir: Option<String>,

    #[serde(default)]
    pub clean_after_staged: bool,

    #[serde(default)]
    pub stream_output: bool,

    /// Tar the working directory to storage after the outputs are staged.
    #[serde(default)]
    pub archive: bool,

    #[serde(default)]
    pub scheduling: SchedulingDescription,

    pub application: ApplicationDescription,

    #[serde(default, rename = "input")]
    pub inputs: Vec<InputDataObject>,

    #[serde(default, rename = "output")]
    pub outputs: Vec<OutputDataObject>,

    #[serde(skip)]
    path: PathBuf,
}

/// A process model and the ordered tasks that execute it.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessPlan {
    pub process: ProcessModel,
    pub tasks: Vec<TaskModel>,
}

impl ProcessDescription {
    /// Read a process description from a TOML file.
    ///
    /// # Errors
    /// `gantry::Error` when the file cannot be read or parsed.
    ///
    pub fn open(path: &Path) -> Result<Self, Error> {
        let path = path
            .absolutize()
            .map_err(|e| Error::FileRead(path.into(), e))?;
        trace!("Reading process file '{}'.", path.display());
        let contents = fs::read_to_string(&path).map_err(|e| Error::FileRead(path.to_path_buf(), e))?;
        Self::parse_str(&path, &contents)
    }

    pub(crate) fn parse_str(path: &Path, toml: &str) -> Result<Self, Error> {
        let mut description: ProcessDescription =
            toml::from_str(toml).map_err(|e| Error::TOMLParse(path.into(), e))?;
        description.path = path.into();
        Ok(description)
    }

    /// Wall time limit in whole minutes, rounded up.
    fn wall_time_limit(&self) -> Result<Option<u64>, Error> {
        let Some(wall_time) = &self.scheduling.wall_time else {
            return Ok(None);
        };
        let duration = parse_duration(wall_time).map_err(|_| {
            Error::InvalidDuration(wall_time.clone(), self.path.display().to_string())
        })?;
        Ok(Some(duration.as_secs().div_ceil(60)))
    }

    /// Build the process model described by this file.
    ///
    /// # Errors
    /// `gantry::Error::InvalidDuration` when the wall time cannot be parsed.
    ///
    pub fn process(&self) -> Result<ProcessModel, Error> {
        let application = &self.application;
        let scheduling = &self.scheduling;
        Ok(ProcessModel {
            process_id: self.process_id.clone(),
            experiment_id: self.experiment_id.clone(),
            task_order: Vec::new(),
            state: ProcessState::Created,
            scheduling: Scheduling {
                wall_time_limit: self.wall_time_limit()?,
                node_count: scheduling.node_count,
                total_cpu_count: scheduling.total_cpu_count,
                queue_name: scheduling.queue_name.clone(),
                account: scheduling.account.clone(),
                total_physical_memory: scheduling.total_physical_memory,
            },
            working_directory: self.working_directory.clone(),
            compute_resource_id: self.compute_resource.clone(),
            storage_resource_id: self.storage_resource.clone(),
            experiment_data_dir: self.experiment_data_dir.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            application: Application {
                name: application.name.clone(),
                executable: application.executable.clone(),
                arguments: application.arguments.clone(),
                module_loads: application.module_loads.clone(),
                environment: application
                    .environment
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                pre_job_commands: application.pre_job_commands.clone(),
                post_job_commands: application.post_job_commands.clone(),
            },
            user_name: self.user_name.clone(),
            gateway_id: self.gateway_id.clone(),
            clean_after_staged: self.clean_after_staged,
            stream_output: self.stream_output,
            errors: Vec::new(),
            creation_time: Utc::now(),
        })
    }

    /// Build the process model and its ordered task list.
    ///
    /// # Errors
    /// `gantry::Error` when a referenced resource does not exist, the wall
    /// time is invalid, or a location cannot be expressed as a URI.
    ///
    pub fn plan(&self, resources: &resource::Configuration) -> Result<ProcessPlan, Error> {
        let compute = resources.compute_resource(&self.compute_resource)?;
        resources.storage_resource(&self.storage_resource)?;

        let mut process = self.process()?;
        let pid = process.process_id.clone();
        let mut tasks = vec![TaskModel::new(
            &pid,
            TaskType::EnvSetup,
            TaskDetail::EnvSetup {
                location: process.working_directory.clone(),
            },
        )];

        for input in process.inputs.iter().filter(|i| i.data_type.is_file()) {
            tasks.extend(input_tasks(&process, compute, input)?);
        }

        tasks.push(TaskModel::new(
            &pid,
            TaskType::JobSubmission,
            TaskDetail::JobSubmission { monitor_mode: None },
        ));

        for output in process.outputs.iter().filter(|o| o.data_type.is_file()) {
            if let Some(task) = output_task(&process, compute, output)? {
                tasks.push(task);
            }
        }

        if self.archive {
            tasks.push(TaskModel::new(
                &pid,
                TaskType::Archive,
                TaskDetail::DataStaging(DataStagingTaskModel::new(
                    StagingKind::ArchiveOutput,
                    compute_uri(compute, &process.working_directory)?,
                    placeholder(),
                )),
            ));
        }

        process.task_order = tasks.iter().map(|t| t.task_id.clone()).collect();
        debug!(
            "Planned {} task(s) for process '{}' from '{}'.",
            tasks.len(),
            pid,
            self.path.display()
        );
        Ok(ProcessPlan { process, tasks })
    }
}

fn placeholder() -> String {
    format!("{DUMMY_HOST}://{DUMMY_HOST}/")
}

fn compute_uri(compute: &ComputeResource, path: &str) -> Result<String, Error> {
    location_uri(Some(&compute.login_user()), &compute.host_name, path)
}

fn file_name(value: &str) -> String {
    Path::new(value)
        .file_name()
        .map_or_else(|| value.to_string(), |n| n.to_string_lossy().into_owned())
}

/// One staging task per file named by the input.
///
/// A missing optional value needs no task. A missing required value still
/// gets one so that the failure is recorded against the task.
fn input_tasks(
    process: &ProcessModel,
    compute: &ComputeResource,
    input: &InputDataObject,
) -> Result<Vec<TaskModel>, Error> {
    let value = input.value.as_deref().unwrap_or_default().trim();
    if value.is_empty() && !input.is_required {
        trace!("Skipping optional input '{}' with no value.", input.name);
        return Ok(Vec::new());
    }

    let sources: Vec<&str> = if input.data_type == DataType::UriCollection {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    } else {
        vec![value]
    };

    sources
        .into_iter()
        .map(|source| {
            let destination = if source.is_empty() {
                String::new()
            } else {
                compute_uri(compute, &join(&process.working_directory, &file_name(source)))?
            };
            let mut staging = DataStagingTaskModel::new(StagingKind::Input, source, destination);
            staging.process_input = Some(input.clone());
            Ok(TaskModel::new(
                &process.process_id,
                TaskType::DataStaging,
                TaskDetail::DataStaging(staging),
            ))
        })
        .collect()
}

/// The staging task for one output, or `None` for an optional output with
/// no value.
fn output_task(
    process: &ProcessModel,
    compute: &ComputeResource,
    output: &OutputDataObject,
) -> Result<Option<TaskModel>, Error> {
    let value = match output.data_type {
        DataType::Stdout => Some(process.std_out_path()),
        DataType::Stderr => Some(process.std_err_path()),
        _ => output
            .value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from),
    };

    let source = match &value {
        None if !output.is_required => {
            trace!("Skipping optional output '{}' with no value.", output.name);
            return Ok(None);
        }
        None => String::new(),
        Some(value) if value.contains("://") => value.clone(),
        Some(value) if value.starts_with('/') => compute_uri(compute, value)?,
        Some(value) => compute_uri(compute, &join(&process.working_directory, value))?,
    };

    let mut staging = DataStagingTaskModel::new(StagingKind::Output, source, placeholder());
    staging.process_output = Some(OutputDataObject {
        value,
        ..output.clone()
    });
    Ok(Some(TaskModel::new(
        &process.process_id,
        TaskType::DataStaging,
        TaskDetail::DataStaging(staging),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::resources;
    use crate::resource::JobManagerType;
    use serial_test::parallel;

    const PROCESS: &str = r#"
process_id = "p1"
experiment_id = "e1"
user_name = "alice"
gateway_id = "gateway"
compute_resource = "cluster"
storage_resource = "storage"
working_directory = "/scratch/p1"
archive = true

[scheduling]
wall_time = "01:30:20"
node_count = 2
total_cpu_count = 8
queue_name = "shared"

[application]
name = "simulate"
executable = "/opt/sim/bin/simulate"
arguments = ["--steps", "1000"]
environment = { OMP_NUM_THREADS = "4" }

[[input]]
name = "structure"
value = "scp://gateway@storage.gateway.org/data/gateway/in.pdb"
type = "URI"
is_required = true
add_to_command_line = true
argument_prefix = "-i"

[[input]]
name = "steps"
value = "1000"
type = "INTEGER"

[[input]]
name = "restart"
type = "URI"

[[output]]
name = "result"
value = "result.dat"
type = "URI"
is_required = true

[[output]]
name = "log"
type = "STDOUT"

[[output]]
name = "energy"
value = "2.5"
type = "FLOAT"
"#;

    fn setup() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::max())
            .is_test(true)
            .try_init();
    }

    fn parse(toml: &str) -> ProcessDescription {
        ProcessDescription::parse_str(Path::new("process.toml"), toml).unwrap()
    }

    fn sources(plan: &ProcessPlan) -> Vec<(TaskType, String, String)> {
        plan.tasks
            .iter()
            .map(|task| match &task.detail {
                TaskDetail::EnvSetup { location } => {
                    (task.task_type, location.clone(), String::new())
                }
                TaskDetail::DataStaging(staging) => (
                    task.task_type,
                    staging.source.clone(),
                    staging.destination.clone(),
                ),
                TaskDetail::JobSubmission { .. } => {
                    (task.task_type, String::new(), String::new())
                }
            })
            .collect()
    }

    #[test]
    #[parallel]
    fn parse_process() {
        setup();
        let description = parse(PROCESS);
        let process = description.process().unwrap();

        assert_eq!(process.process_id, "p1");
        assert_eq!(process.state, ProcessState::Created);
        assert_eq!(process.scheduling.wall_time_limit, Some(91));
        assert_eq!(process.scheduling.node_count, Some(2));
        assert_eq!(process.scheduling.queue_name.as_deref(), Some("shared"));
        assert_eq!(
            process.application.environment,
            vec![("OMP_NUM_THREADS".to_string(), "4".to_string())]
        );
        assert_eq!(process.inputs.len(), 3);
        assert_eq!(process.outputs.len(), 3);
        assert!(!process.clean_after_staged);
    }

    #[test]
    #[parallel]
    fn defaults() {
        let description = parse(
            r#"
experiment_id = "e1"
compute_resource = "localhost"
storage_resource = "localhost"
working_directory = "/tmp/work"

[application]
name = "hello"
executable = "echo"
"#,
        );
        assert_eq!(description.gateway_id, "default");
        assert!(Uuid::parse_str(&description.process_id).is_ok());
        assert_eq!(description.process().unwrap().scheduling.wall_time_limit, None);
    }

    #[test]
    #[parallel]
    fn invalid_files() {
        let result = ProcessDescription::parse_str(Path::new("p.toml"), "experiment_id = 3");
        assert!(matches!(result, Err(Error::TOMLParse(..))));

        let result = ProcessDescription::parse_str(
            Path::new("p.toml"),
            r#"
experiment_id = "e1"
compute_resource = "localhost"
storage_resource = "localhost"
working_directory = "/tmp/work"
unexpected = true

[application]
name = "hello"
executable = "echo"
"#,
        );
        assert!(matches!(result, Err(Error::TOMLParse(..))));

        let mut description = parse(PROCESS);
        description.scheduling.wall_time = Some("soon".into());
        assert!(matches!(
            description.process(),
            Err(Error::InvalidDuration(..))
        ));
    }

    #[test]
    #[parallel]
    fn task_order() {
        setup();
        let plan = parse(PROCESS)
            .plan(&resources(JobManagerType::Slurm))
            .unwrap();

        assert_eq!(
            sources(&plan),
            vec![
                (TaskType::EnvSetup, "/scratch/p1".into(), String::new()),
                (
                    TaskType::DataStaging,
                    "scp://gateway@storage.gateway.org/data/gateway/in.pdb".into(),
                    "scp://alice@login.cluster.edu/scratch/p1/in.pdb".into()
                ),
                (TaskType::JobSubmission, String::new(), String::new()),
                (
                    TaskType::DataStaging,
                    "scp://alice@login.cluster.edu/scratch/p1/result.dat".into(),
                    "dummy://dummy/".into()
                ),
                (
                    TaskType::DataStaging,
                    "scp://alice@login.cluster.edu/scratch/p1/simulate.stdout".into(),
                    "dummy://dummy/".into()
                ),
                (
                    TaskType::Archive,
                    "scp://alice@login.cluster.edu/scratch/p1".into(),
                    "dummy://dummy/".into()
                ),
            ]
        );

        let ids: Vec<&str> = plan.tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(plan.process.task_order, ids);
        assert!(plan.tasks.iter().all(|t| t.parent_process_id == "p1"));

        let stdout = plan.tasks[4].staging().unwrap();
        assert_eq!(
            stdout.process_output.as_ref().unwrap().value.as_deref(),
            Some("/scratch/p1/simulate.stdout")
        );
        assert_eq!(
            plan.tasks[1].staging().unwrap().process_input.as_ref().unwrap().name,
            "structure"
        );
    }

    #[test]
    #[parallel]
    fn collections_and_required_values() {
        let mut description = parse(PROCESS);
        description.archive = false;
        description.outputs.clear();
        description.inputs = vec![
            InputDataObject {
                name: "frames".into(),
                value: Some("/data/a.xyz, /data/b.xyz".into()),
                data_type: DataType::UriCollection,
                is_required: true,
                add_to_command_line: false,
                argument_prefix: None,
            },
            InputDataObject {
                name: "missing".into(),
                value: None,
                data_type: DataType::Uri,
                is_required: true,
                add_to_command_line: false,
                argument_prefix: None,
            },
        ];
        description.outputs = vec![OutputDataObject {
            name: "trajectory".into(),
            value: None,
            data_type: DataType::Uri,
            is_required: true,
        }];

        let plan = description
            .plan(&resources(JobManagerType::Slurm))
            .unwrap();
        let staged = sources(&plan);
        assert_eq!(staged.len(), 6);
        assert_eq!(staged[1].1, "/data/a.xyz");
        assert_eq!(
            staged[1].2,
            "scp://alice@login.cluster.edu/scratch/p1/a.xyz"
        );
        assert_eq!(staged[2].1, "/data/b.xyz");
        assert_eq!(staged[3], (TaskType::DataStaging, String::new(), String::new()));
        assert_eq!(staged[4].0, TaskType::JobSubmission);
        assert_eq!(staged[5], (TaskType::DataStaging, String::new(), "dummy://dummy/".into()));
    }

    #[test]
    #[parallel]
    fn unknown_resources() {
        let mut description = parse(PROCESS);
        description.compute_resource = "elsewhere".into();
        assert!(matches!(
            description.plan(&resources(JobManagerType::Slurm)),
            Err(Error::ComputeResourceNotFound(_))
        ));

        let mut description = parse(PROCESS);
        description.storage_resource = "elsewhere".into();
        assert!(matches!(
            description.plan(&resources(JobManagerType::Slurm)),
            Err(Error::StorageResourceNotFound(_))
        ));
    }
}
