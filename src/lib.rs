// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

pub(crate) mod builtin;
pub mod context;
pub mod credential;
pub mod engine;
pub mod format;
pub mod model;
pub mod parser;
pub mod process;
pub mod progress_styles;
pub mod registry;
pub mod remote_cluster;
pub mod resource;
pub mod script;
pub mod session;
pub mod settings;
pub mod task;

use indicatif::{MultiProgress, ProgressBar};
use std::fmt;
use std::io;
use std::path::PathBuf;

use model::ProcessState;

pub const DATA_DIRECTORY_NAME: &str = ".gantry";
pub const REGISTRY_FILE_NAME: &str = "registry.postcard";

/// Job id recorded when neither submission nor verification produced one.
pub const DEFAULT_JOB_ID: &str = "DEFAULT_JOB_ID";

/// Destination host that marks an output location still to be resolved.
pub const DUMMY_HOST: &str = "dummy";

/// Hold a MultiProgress and all of its progress bars.
///
/// This is necessary because a dropped ProgressBar will be automatically
/// removed from MultiProgress (https://github.com/console-rs/indicatif/issues/614)
///
pub struct MultiProgressContainer {
    pub progress_bars: Vec<ProgressBar>,
    pub multi_progress: MultiProgress,
}

impl MultiProgressContainer {
    pub fn new(multi_progress: MultiProgress) -> Self {
        Self {
            progress_bars: Vec::new(),
            multi_progress,
        }
    }

    /// Add a progress bar and keep it alive until the container is dropped.
    pub fn add(&mut self, progress_bar: ProgressBar) -> ProgressBar {
        let progress_bar = self.multi_progress.add(progress_bar);
        self.progress_bars.push(progress_bar.clone());
        progress_bar
    }
}

/// Which end of a file transfer an error was raised on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferSide {
    Source,
    Destination,
}

impl fmt::Display for TransferSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferSide::Source => write!(f, "source"),
            TransferSide::Destination => write!(f, "destination"),
        }
    }
}

/// Broad categories of failure.
///
/// Tasks record the category alongside every error so that operators can
/// tell bad configuration apart from a bad network or a bad invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Job file generation or resource configuration is wrong. Never retried.
    Configuration,
    /// The scheduler refused the job.
    SubmissionRejected,
    /// The job could not be confirmed on the scheduler after every attempt.
    Verification,
    /// Remote command, transfer or local I/O failure.
    Transport,
    /// Authentication material is missing or was refused.
    Credential,
    /// A path or URI is malformed or points at nothing.
    Location,
    /// A task was run in the wrong phase or with the wrong type.
    Invocation,
    /// The registry could not read or write a record.
    Persistence,
    /// The user interrupted the engine.
    Interrupted,
}

/// Errors that may be encountered when using the gantry crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    // OS errors
    #[error("OS error")]
    OS(#[from] nix::errno::Errno),

    #[error("No home directory")]
    NoHome(),

    // IO errors
    #[error("I/O error: {0}")]
    IO(#[from] io::Error),

    #[error("Unable to read '{0}': {1}")]
    FileRead(PathBuf, #[source] io::Error),

    #[error("Unable to write '{0}': {1}")]
    FileWrite(PathBuf, #[source] io::Error),

    #[error("Unable to create directory '{0}': {1}")]
    DirectoryCreate(PathBuf, #[source] io::Error),

    #[error("Non-UTF-8 path '{0}'")]
    NonUTF8Path(PathBuf),

    #[error("Unable to spawn '{0}': {1}.")]
    SpawnProcess(String, #[source] io::Error),

    // serialization errors
    #[error("Unable to parse '{0}'.\n{1}")]
    TOMLParse(PathBuf, #[source] toml::de::Error),

    #[error("Unable to parse '{0}': {1}")]
    PostcardParse(PathBuf, #[source] postcard::Error),

    #[error("Unable to serialize '{0}': {1}")]
    PostcardSerialize(PathBuf, #[source] postcard::Error),

    #[error("Invalid duration '{0}' in '{1}'.")]
    InvalidDuration(String, String),

    // configuration errors
    #[error(
        "Compute resource '{0}' not found: execute 'gantry show resources --all' to see available resources."
    )]
    ComputeResourceNotFound(String),

    #[error(
        "Storage resource '{0}' not found: execute 'gantry show resources --all' to see available resources."
    )]
    StorageResourceNotFound(String),

    #[error("No '{1}' command is configured for the {0} job manager.")]
    MissingJobManagerCommand(String, String),

    #[error("Unable to generate the job script for process '{0}': {1}.")]
    JobScript(String, String),

    // credential errors
    #[error("No credential '{0}' for {1}@{2}.")]
    CredentialNotFound(String, String, String),

    #[error("Authentication failed for {1}@{0}: {2}")]
    Authentication(String, String, String),

    // transport errors
    #[error("Command '{1}' failed on '{0}': {2}")]
    RemoteCommand(String, String, String),

    #[error("Transfer of '{0}' to '{1}' failed: {2}")]
    Transfer(String, String, String),

    #[error("The {side} side of the transfer failed: {source}")]
    Staging {
        side: TransferSide,
        #[source]
        source: Box<Error>,
    },

    // location errors
    #[error("Invalid URI '{0}': {1}.")]
    InvalidUri(String, String),

    #[error("Host '{0}' is neither the compute nor the storage resource of process '{1}'.")]
    UnknownHost(String, String),

    #[error("Input file '{0}' is empty.")]
    EmptyInput(String),

    #[error("Output file '{0}' was not produced by the job.")]
    OutputMissing(String),

    // submission errors
    #[error("Job submission was rejected: {0}")]
    SubmissionRejected(String),

    #[error("Neither submit nor verify returned a job id for job '{0}'.")]
    JobIdNotFound(String),

    // cancellation errors
    #[error("Unable to get the status of job '{0}' after {1} attempts.")]
    JobStatusUnavailable(String, u32),

    #[error("Process '{0}' has no job to cancel.")]
    JobModelMissing(String),

    #[error("Job id for process '{0}' did not appear after {1} polls.")]
    CancelTimeout(String, u32),

    #[error("Job '{0}' of process '{1}' was never accepted by the scheduler.")]
    JobNotSubmitted(String, String),

    // invocation errors
    #[error("Invalid process state {1} for task '{0}'.")]
    InvalidProcessState(String, String),

    #[error("Task '{0}' has type {1}, expected {2}.")]
    UnexpectedTaskType(String, String, String),

    #[error("Wildcards are only supported for output staging: '{0}'.")]
    WildcardNotSupported(String),

    #[error("Required value for {0} '{1}' is not set.")]
    RequiredValueMissing(String, String),

    #[error("Optional value for {0} '{1}' is not set.")]
    OptionalValueMissing(String, String),

    // registry errors
    #[error("{0} '{1}' not found in the registry.")]
    RecordNotFound(&'static str, String),

    #[error("Unable to lock '{0}': {1}")]
    RegistryLock(PathBuf, #[source] nix::errno::Errno),

    #[error("Process '{0}' already finished as {1}.")]
    ProcessFinished(String, ProcessState),

    #[error("Interrupted")]
    Interrupted,
}

impl Error {
    /// The failure category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::OS(_)
            | Error::IO(_)
            | Error::SpawnProcess(..)
            | Error::RemoteCommand(..)
            | Error::Transfer(..)
            | Error::JobStatusUnavailable(..)
            | Error::CancelTimeout(..) => ErrorKind::Transport,

            Error::NoHome()
            | Error::TOMLParse(..)
            | Error::InvalidDuration(..)
            | Error::ComputeResourceNotFound(_)
            | Error::StorageResourceNotFound(_)
            | Error::MissingJobManagerCommand(..)
            | Error::JobScript(..) => ErrorKind::Configuration,

            Error::CredentialNotFound(..) | Error::Authentication(..) => ErrorKind::Credential,

            Error::Staging { source, .. } => source.kind(),

            Error::NonUTF8Path(_)
            | Error::InvalidUri(..)
            | Error::UnknownHost(..)
            | Error::EmptyInput(_)
            | Error::OutputMissing(_)
            | Error::RequiredValueMissing(..)
            | Error::OptionalValueMissing(..) => ErrorKind::Location,

            Error::SubmissionRejected(_) => ErrorKind::SubmissionRejected,
            Error::JobIdNotFound(_) => ErrorKind::Verification,

            Error::JobModelMissing(_)
            | Error::JobNotSubmitted(..)
            | Error::InvalidProcessState(..)
            | Error::ProcessFinished(..)
            | Error::UnexpectedTaskType(..)
            | Error::WildcardNotSupported(_) => ErrorKind::Invocation,

            Error::FileRead(..)
            | Error::FileWrite(..)
            | Error::DirectoryCreate(..)
            | Error::PostcardParse(..)
            | Error::PostcardSerialize(..)
            | Error::RecordNotFound(..)
            | Error::RegistryLock(..) => ErrorKind::Persistence,

            Error::Interrupted => ErrorKind::Interrupted,
        }
    }

    /// A message suitable for the gateway user.
    ///
    /// Rejected submissions report the scheduler's own text. Staging failures
    /// name the side of the transfer that failed.
    pub fn user_message(&self) -> String {
        match self {
            Error::SubmissionRejected(reason) => reason.clone(),
            Error::Staging { side, source } => match source.kind() {
                ErrorKind::Credential => {
                    format!("Credentials for the {side} host were refused or are missing.")
                }
                ErrorKind::Location => format!("The {side} location is invalid: {source}"),
                _ => format!("Could not reach the {side} host while staging data."),
            },
            Error::RequiredValueMissing(what, name) => {
                format!("Required {what} '{name}' has no value. Please provide one and retry.")
            }
            Error::OptionalValueMissing(what, name) => {
                format!("Optional {what} '{name}' has no value and was not staged.")
            }
            _ => match self.kind() {
                ErrorKind::Configuration => {
                    "The compute resource or application is misconfigured.".into()
                }
                ErrorKind::SubmissionRejected => "The scheduler rejected the job.".into(),
                ErrorKind::Verification => {
                    "The job could not be found on the scheduler after submission.".into()
                }
                ErrorKind::Transport => "A remote command or file transfer failed.".into(),
                ErrorKind::Credential => "Authentication to the remote host failed.".into(),
                ErrorKind::Location => format!("Invalid file location: {self}"),
                ErrorKind::Invocation => "Internal error: the task was invoked incorrectly.".into(),
                ErrorKind::Persistence => "Unable to record the job state.".into(),
                ErrorKind::Interrupted => "The engine was stopped.".into(),
            },
        }
    }

    /// Attach the side of a transfer to a transport or credential error.
    pub(crate) fn on_side(self, side: TransferSide) -> Self {
        match self {
            Error::Staging { .. } => self,
            other => Error::Staging {
                side,
                source: Box::new(other),
            },
        }
    }
}
