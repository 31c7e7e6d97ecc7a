// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use log::trace;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs::File;
use std::io::prelude::*;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use crate::builtin::BuiltIn;
use crate::session::quote;
use crate::settings;
use crate::Error;

/// Resource configuration
///
/// `Configuration` stores every compute and storage resource the engine may
/// use. It is read from `resources.toml` and merged with the built-in
/// resources.
///
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    /// The compute resources.
    #[serde(default)]
    pub(crate) compute_resource: Vec<ComputeResource>,

    /// The storage resources.
    #[serde(default)]
    pub(crate) storage_resource: Vec<StorageResource>,
}

/// How the engine reaches a host.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Run commands on the engine host.
    #[default]
    Local,
    /// Run commands through the OpenSSH client.
    Ssh,
}

/// Types of job managers.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobManagerType {
    /// Run jobs immediately in the background with bash.
    Fork,
    /// PBS and Torque.
    Pbs,
    /// Slurm.
    Slurm,
    /// Univa and Sun Grid Engine.
    Uge,
    /// IBM Spectrum LSF.
    Lsf,
}

impl fmt::Display for JobManagerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobManagerType::Fork => "fork",
            JobManagerType::Pbs => "pbs",
            JobManagerType::Slurm => "slurm",
            JobManagerType::Uge => "uge",
            JobManagerType::Lsf => "lsf",
        };
        write!(f, "{name}")
    }
}

/// Logical job manager commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobManagerCommand {
    Submission,
    JobMonitoring,
    Deletion,
}

impl fmt::Display for JobManagerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobManagerCommand::Submission => "submission",
            JobManagerCommand::JobMonitoring => "job_monitoring",
            JobManagerCommand::Deletion => "deletion",
        };
        write!(f, "{name}")
    }
}

/// Executables that implement the logical commands.
///
/// Unset entries fall back to the job manager's defaults.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct JobManagerCommands {
    pub submission: Option<String>,
    pub job_monitoring: Option<String>,
    pub deletion: Option<String>,
}

impl JobManagerCommands {
    pub fn get(&self, command: JobManagerCommand) -> Option<&str> {
        match command {
            JobManagerCommand::Submission => self.submission.as_deref(),
            JobManagerCommand::JobMonitoring => self.job_monitoring.as_deref(),
            JobManagerCommand::Deletion => self.deletion.as_deref(),
        }
    }
}

/// Report gateway usage after each confirmed submission.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayUsageReporting {
    /// Command that makes the executable available, such as `module load`.
    pub module_load_command: Option<String>,

    /// The reporting executable.
    pub executable: String,
}

/// Compute resource
///
/// `ComputeResource` stores everything needed to submit jobs to one host.
///
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ComputeResource {
    /// The resource's id.
    pub id: String,

    /// The host to connect to.
    pub host_name: String,

    /// The port to connect to.
    pub port: Option<u16>,

    /// How to connect.
    #[serde(default)]
    pub protocol: Protocol,

    /// The login user (defaults to `$USER`).
    pub login_user: Option<String>,

    /// Token to resolve in the credential store.
    pub credential_token: Option<String>,

    /// The job manager on the host.
    pub job_manager: JobManagerType,

    /// Overrides of the job manager's executables.
    #[serde(default)]
    pub commands: JobManagerCommands,

    /// Shell code to run before every job manager command.
    pub command_prefix: Option<String>,

    /// Gateway usage reporting.
    pub gateway_usage: Option<GatewayUsageReporting>,
}

/// Storage resource
///
/// `StorageResource` is a host that keeps job outputs after the job ends.
///
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StorageResource {
    /// The resource's id.
    pub id: String,

    /// The host to connect to.
    pub host_name: String,

    /// The port to connect to.
    pub port: Option<u16>,

    /// How to connect.
    #[serde(default)]
    pub protocol: Protocol,

    /// The login user (defaults to `$USER`).
    pub login_user: Option<String>,

    /// Token to resolve in the credential store.
    pub credential_token: Option<String>,

    /// Directory that relative output locations are placed under.
    pub file_system_root: String,
}

/// The user running the engine.
pub(crate) fn current_user() -> String {
    env::var("USER").unwrap_or_default()
}

impl ComputeResource {
    pub fn login_user(&self) -> String {
        self.login_user.clone().unwrap_or_else(current_user)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(22)
    }
}

impl StorageResource {
    pub fn login_user(&self) -> String {
        self.login_user.clone().unwrap_or_else(current_user)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(22)
    }
}

impl Configuration {
    /// Open the resource configuration
    ///
    /// Open `$HOME/.config/gantry/resources.toml` if it exists and merge it
    /// with the built-in configuration.
    ///
    /// # Errors
    /// Returns `Err(gantry::Error)` when the file cannot be read or if there is
    /// as parse error.
    ///
    pub fn open() -> Result<Self, Error> {
        let resources_toml_path = settings::config_directory()?.join("resources.toml");
        Self::open_from_path(resources_toml_path)
    }

    pub(crate) fn open_from_path(resources_toml_path: PathBuf) -> Result<Self, Error> {
        let mut resources = Self::built_in();

        let resources_file = match File::open(&resources_toml_path) {
            Ok(file) => file,
            Err(error) => match error.kind() {
                io::ErrorKind::NotFound => {
                    trace!(
                        "'{}' does not exist, using built-in resources.",
                        &resources_toml_path.display()
                    );
                    return Ok(resources);
                }
                _ => return Err(Error::FileRead(resources_toml_path, error)),
            },
        };

        let mut buffer = BufReader::new(resources_file);
        let mut resources_string = String::new();
        buffer
            .read_to_string(&mut resources_string)
            .map_err(|e| Error::FileRead(resources_toml_path.clone(), e))?;

        trace!("Parsing '{}'.", &resources_toml_path.display());
        let user_config = Self::parse_str(&resources_toml_path, &resources_string)?;
        resources.merge(&user_config);
        Ok(resources)
    }

    /// Parse a `Configuration` from a TOML string
    ///
    /// Does *NOT* merge with the built-in configuration.
    ///
    pub(crate) fn parse_str(path: &Path, toml: &str) -> Result<Self, Error> {
        let resources: Configuration =
            toml::from_str(toml).map_err(|e| Error::TOMLParse(path.into(), e))?;
        Ok(resources)
    }

    /// Merge keys from another configuration into this one.
    ///
    /// Resources in `b` come first, so they take precedence over resources
    /// with the same id in `self`.
    ///
    fn merge(&mut self, b: &Self) {
        let mut new_compute = b.compute_resource.clone();
        new_compute.extend(self.compute_resource.clone());
        self.compute_resource = new_compute;

        let mut new_storage = b.storage_resource.clone();
        new_storage.extend(self.storage_resource.clone());
        self.storage_resource = new_storage;
    }

    /// Find a compute resource by id.
    ///
    /// # Errors
    /// `gantry::Error::ComputeResourceNotFound` when there is no such resource.
    ///
    pub fn compute_resource(&self, id: &str) -> Result<&ComputeResource, Error> {
        self.compute_resource
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::ComputeResourceNotFound(id.into()))
    }

    /// Find a storage resource by id.
    ///
    /// # Errors
    /// `gantry::Error::StorageResourceNotFound` when there is no such resource.
    ///
    pub fn storage_resource(&self, id: &str) -> Result<&StorageResource, Error> {
        self.storage_resource
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::StorageResourceNotFound(id.into()))
    }

    /// The compute and storage resources named `id`.
    ///
    /// # Errors
    /// `gantry::Error::ComputeResourceNotFound` when neither kind of resource
    /// has that id.
    ///
    pub fn select(&self, id: &str) -> Result<Self, Error> {
        let selected = Configuration {
            compute_resource: self.compute_resource(id).into_iter().cloned().collect(),
            storage_resource: self.storage_resource(id).into_iter().cloned().collect(),
        };
        if selected.compute_resource.is_empty() && selected.storage_resource.is_empty() {
            return Err(Error::ComputeResourceNotFound(id.into()));
        }
        Ok(selected)
    }
}

/// Literal command lines for one compute resource's job manager.
#[derive(Clone, Debug)]
pub struct JobManagerConfiguration {
    job_manager: JobManagerType,
    commands: JobManagerCommands,
    prefix: Option<String>,
}

impl JobManagerConfiguration {
    /// Combine the resource's overrides with the built-in executables.
    pub fn new(resource: &ComputeResource) -> Self {
        let defaults = JobManagerCommands::built_in(resource.job_manager);
        let pick = |command: JobManagerCommand| {
            resource
                .commands
                .get(command)
                .or_else(|| defaults.get(command))
                .map(String::from)
        };

        JobManagerConfiguration {
            job_manager: resource.job_manager,
            commands: JobManagerCommands {
                submission: pick(JobManagerCommand::Submission),
                job_monitoring: pick(JobManagerCommand::JobMonitoring),
                deletion: pick(JobManagerCommand::Deletion),
            },
            prefix: resource.command_prefix.clone().filter(|p| !p.is_empty()),
        }
    }

    pub fn job_manager(&self) -> JobManagerType {
        self.job_manager
    }

    /// The executable for a logical command.
    ///
    /// # Errors
    /// `gantry::Error::MissingJobManagerCommand` when none is configured.
    ///
    pub fn executable(&self, command: JobManagerCommand) -> Result<&str, Error> {
        self.commands
            .get(command)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                Error::MissingJobManagerCommand(self.job_manager.to_string(), command.to_string())
            })
    }

    fn prefixed(&self, command: String) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix} && {command}"),
            None => command,
        }
    }

    /// Submit `job_file` from `working_directory`.
    pub fn submit_command(&self, working_directory: &str, job_file: &str) -> Result<String, Error> {
        let executable = self.executable(JobManagerCommand::Submission)?;
        let job_file = quote(job_file);
        let submit = match self.job_manager {
            JobManagerType::Lsf => format!("{executable} < {job_file}"),
            _ => format!("{executable} {job_file}"),
        };
        Ok(format!(
            "cd {} && {}",
            quote(working_directory),
            self.prefixed(submit)
        ))
    }

    /// Query the status of one job.
    pub fn status_command(&self, job_id: &str, user_name: &str) -> Result<String, Error> {
        let executable = self.executable(JobManagerCommand::JobMonitoring)?;
        let job_id = quote(job_id);
        let command = match self.job_manager {
            JobManagerType::Fork => format!("{executable} -o pid=,stat= -p {job_id}"),
            JobManagerType::Pbs => format!("{executable} -f {job_id}"),
            JobManagerType::Slurm => format!("{executable} -j {job_id}"),
            JobManagerType::Uge => format!("{executable} -u {}", quote(user_name)),
            JobManagerType::Lsf => format!("{executable} -w {job_id}"),
        };
        Ok(self.prefixed(command))
    }

    /// List every job of the user.
    pub fn user_status_command(&self, user_name: &str) -> Result<String, Error> {
        let executable = self.executable(JobManagerCommand::JobMonitoring)?;
        let user_name = quote(user_name);
        let command = match self.job_manager {
            JobManagerType::Fork => format!("{executable} -o pid=,stat= -u {user_name}"),
            JobManagerType::Lsf => format!("{executable} -w -u {user_name}"),
            JobManagerType::Pbs | JobManagerType::Slurm | JobManagerType::Uge => {
                format!("{executable} -u {user_name}")
            }
        };
        Ok(self.prefixed(command))
    }

    /// List the user's jobs in a form the parser can search by name.
    pub fn job_id_by_name_command(&self, job_name: &str, user_name: &str) -> Result<String, Error> {
        match self.job_manager {
            JobManagerType::Slurm => {
                let executable = self.executable(JobManagerCommand::JobMonitoring)?;
                Ok(self.prefixed(format!(
                    "{executable} -n {} -u {}",
                    quote(job_name),
                    quote(user_name)
                )))
            }
            _ => self.user_status_command(user_name),
        }
    }

    /// Cancel one job.
    pub fn cancel_command(&self, job_id: &str) -> Result<String, Error> {
        let executable = self.executable(JobManagerCommand::Deletion)?;
        Ok(self.prefixed(format!("{executable} {}", quote(job_id))))
    }
}

#[cfg(test)]
mod tests {
    use assert_fs::prelude::*;
    use assert_fs::TempDir;
    use serial_test::parallel;

    use super::*;

    fn setup() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::max())
            .is_test(true)
            .try_init();
    }

    fn slurm_resource() -> ComputeResource {
        ComputeResource {
            id: "cluster".into(),
            host_name: "login.cluster.edu".into(),
            port: None,
            protocol: Protocol::Ssh,
            login_user: Some("alice".into()),
            credential_token: Some("token".into()),
            job_manager: JobManagerType::Slurm,
            commands: JobManagerCommands::default(),
            command_prefix: None,
            gateway_usage: None,
        }
    }

    #[test]
    #[parallel]
    fn open_no_file() {
        setup();
        let temp = TempDir::new().unwrap().child("resources.toml");
        let resources = Configuration::open_from_path(temp.path().into()).expect("valid resources");
        assert_eq!(resources, Configuration::built_in());
    }

    #[test]
    #[parallel]
    fn open_empty_file() {
        setup();
        let temp = TempDir::new().unwrap().child("resources.toml");
        temp.write_str("").unwrap();
        let resources = Configuration::open_from_path(temp.path().into()).expect("valid resources");
        assert_eq!(resources, Configuration::built_in());
    }

    #[test]
    #[parallel]
    fn minimal_resources() {
        setup();
        let temp = TempDir::new().unwrap().child("resources.toml");
        temp.write_str(
            r#"
[[compute_resource]]
id = "a"
host_name = "a.edu"
job_manager = "pbs"

[[storage_resource]]
id = "b"
host_name = "b.edu"
file_system_root = "/data"
"#,
        )
        .unwrap();
        let resources = Configuration::open_from_path(temp.path().into()).unwrap();
        let built_in = Configuration::built_in();
        assert_eq!(
            resources.compute_resource.len(),
            1 + built_in.compute_resource.len()
        );

        let compute = resources.compute_resource("a").unwrap();
        assert_eq!(compute.job_manager, JobManagerType::Pbs);
        assert_eq!(compute.protocol, Protocol::Local);
        assert_eq!(compute.port(), 22);

        let storage = resources.storage_resource("b").unwrap();
        assert_eq!(storage.file_system_root, "/data");

        assert!(matches!(
            resources.compute_resource("c"),
            Err(Error::ComputeResourceNotFound(_))
        ));

        let selected = resources.select("a").unwrap();
        assert_eq!(selected.compute_resource.len(), 1);
        assert!(selected.storage_resource.is_empty());
        assert_eq!(resources.select("localhost").unwrap().storage_resource.len(), 1);
        assert!(resources.select("c").is_err());
    }

    #[test]
    #[parallel]
    fn maximal_compute_resource() {
        setup();
        let temp = TempDir::new().unwrap().child("resources.toml");
        temp.write_str(
            r#"
[[compute_resource]]
id = "localhost"
host_name = "login.cluster.edu"
port = 2222
protocol = "ssh"
login_user = "alice"
credential_token = "token"
job_manager = "slurm"
command_prefix = "module load slurm"
commands.submission = "/opt/slurm/bin/sbatch"

[compute_resource.gateway_usage]
module_load_command = "module load usage"
executable = "gateway_submit_attributes"
"#,
        )
        .unwrap();
        let resources = Configuration::open_from_path(temp.path().into()).unwrap();

        // User resources take precedence over built-in resources with the same id.
        let compute = resources.compute_resource("localhost").unwrap();
        assert_eq!(compute.host_name, "login.cluster.edu");
        assert_eq!(compute.port(), 2222);
        assert_eq!(compute.protocol, Protocol::Ssh);
        assert_eq!(compute.login_user(), "alice");
        assert_eq!(
            compute.commands.submission.as_deref(),
            Some("/opt/slurm/bin/sbatch")
        );
        assert_eq!(
            compute.gateway_usage.as_ref().map(|g| g.executable.as_str()),
            Some("gateway_submit_attributes")
        );
    }

    #[test]
    #[parallel]
    fn unknown_field() {
        setup();
        let result = Configuration::parse_str(
            Path::new("resources.toml"),
            "[[compute_resource]]\nid = \"a\"\nhost_name = \"a\"\njob_manager = \"fork\"\nqueue = \"x\"\n",
        );
        assert!(matches!(result, Err(Error::TOMLParse(..))));
    }

    #[test]
    #[parallel]
    fn slurm_commands() {
        let configuration = JobManagerConfiguration::new(&slurm_resource());
        assert_eq!(
            configuration.submit_command("/scratch/p1", "/scratch/p1/job.sh").unwrap(),
            "cd /scratch/p1 && sbatch /scratch/p1/job.sh"
        );
        assert_eq!(
            configuration.status_command("42", "alice").unwrap(),
            "squeue -j 42"
        );
        assert_eq!(
            configuration.job_id_by_name_command("A0a1", "alice").unwrap(),
            "squeue -n A0a1 -u alice"
        );
        assert_eq!(configuration.cancel_command("42").unwrap(), "scancel 42");
    }

    #[test]
    #[parallel]
    fn prefix_and_override() {
        let mut resource = slurm_resource();
        resource.job_manager = JobManagerType::Lsf;
        resource.command_prefix = Some("module load lsf".into());
        resource.commands.deletion = Some("my-bkill".into());
        let configuration = JobManagerConfiguration::new(&resource);

        assert_eq!(
            configuration.submit_command("/w", "/w/job.sh").unwrap(),
            "cd /w && module load lsf && bsub < /w/job.sh"
        );
        assert_eq!(
            configuration.cancel_command("7").unwrap(),
            "module load lsf && my-bkill 7"
        );
    }

    #[test]
    #[parallel]
    fn missing_command() {
        let mut resource = slurm_resource();
        resource.commands.job_monitoring = Some(String::new());
        let mut configuration = JobManagerConfiguration::new(&resource);
        configuration.commands.job_monitoring = None;

        assert!(matches!(
            configuration.status_command("42", "alice"),
            Err(Error::MissingJobManagerCommand(..))
        ));
    }
}
