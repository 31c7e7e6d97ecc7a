// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

pub mod cancel;
pub mod jobs;
pub mod process;
pub mod recover;
pub mod resources;
pub mod run;
pub mod script;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use log::trace;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use std::error::Error;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use gantry::credential::{CredentialConfiguration, CredentialStore};
use gantry::engine::Engine;
use gantry::registry::{LocalRegistry, Registry};
use gantry::resource;
use gantry::session::{CliSessionFactory, SessionPool};
use gantry::settings::EngineSettings;
use gantry::DATA_DIRECTORY_NAME;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None, subcommand_required = true)]
pub struct Options {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalOptions {
    /// When to print colored output.
    #[arg(long, value_name="WHEN", value_enum, default_value_t=ColorMode::Auto, global=true, env="GANTRY_COLOR", display_order=2)]
    pub color: ColorMode,

    /// Disable progress bars.
    #[arg(long, global = true, env = "GANTRY_NO_PROGRESS", display_order = 2)]
    pub no_progress: bool,

    /// Clear progress bars on exit.
    #[arg(long, global = true, env = "GANTRY_CLEAR_PROGRESS", display_order = 2)]
    pub clear_progress: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum ColorMode {
    /// Automatically detect when to print colored output.
    Auto,

    /// Always print colored output.
    Always,

    /// Never print colored output.
    Never,
}

#[derive(Subcommand, Debug)]
pub enum ShowCommands {
    /// Show the resource configuration.
    ///
    /// Print compute and storage resources in TOML format. This includes the
    /// user-provided resources in `resources.toml` and the built-in
    /// `localhost` resources (or the user-provided overrides).
    ///
    /// EXAMPLES
    ///
    /// * Show the `localhost` resources:
    ///
    ///   gantry show resources
    ///
    /// * Show the resources with a specific id:
    ///
    ///   gantry show resources --resource=cluster
    ///
    /// * Show all resources:
    ///
    ///   gantry show resources --all
    ///
    Resources(resources::Arguments),

    /// List the jobs in the registry.
    ///
    /// `gantry show jobs` prints one row per process that has a job: the
    /// process id, the scheduler job id, the compute resource, and the
    /// latest job state.
    ///
    /// EXAMPLES
    ///
    /// * Show all jobs:
    ///
    ///   gantry show jobs
    ///
    /// * Show jobs of processes that match a wildcard pattern:
    ///
    ///   gantry show jobs --process='e1-*'
    ///
    Jobs(jobs::Arguments),

    /// Show the job script of a process file.
    ///
    /// `gantry show script` prints the script that `gantry run` would
    /// submit for the given process file. Nothing is submitted.
    ///
    /// EXAMPLES
    ///
    /// * Show the script:
    ///
    ///   gantry show script process.toml
    ///
    Script(script::Arguments),

    /// Show the state of processes and their tasks.
    ///
    /// EXAMPLES
    ///
    /// * Show every process:
    ///
    ///   gantry show process
    ///
    /// * Show the tasks of one process:
    ///
    ///   gantry show process 6a1f2c
    ///
    Process(process::Arguments),
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute processes.
    ///
    /// `gantry run` reads each process file, records the process in the
    /// registry, and runs its tasks: workspace setup, input staging, job
    /// submission, and output staging. Processes run in parallel.
    ///
    /// Press Ctrl-C to stop between tasks. Resume with `gantry recover`.
    ///
    /// EXAMPLES
    ///
    /// * Run one process:
    ///
    ///   gantry run process.toml
    ///
    /// * Run several processes at once:
    ///
    ///   gantry run a.toml b.toml c.toml
    ///
    Run(run::Arguments),

    /// Resume processes after an interruption.
    ///
    /// `gantry recover` re-enters the given processes. Tasks that already
    /// finished are skipped and a job that was already submitted is not
    /// submitted again.
    ///
    /// EXAMPLES
    ///
    /// * Recover a process:
    ///
    ///   gantry recover 6a1f2c
    ///
    Recover(recover::Arguments),

    /// Cancel the job of a process.
    ///
    /// `gantry cancel` waits for the job id when the submission is still in
    /// flight, then asks the scheduler to cancel the job.
    ///
    /// EXAMPLES
    ///
    /// * Cancel a process:
    ///
    ///   gantry cancel 6a1f2c
    ///
    Cancel(cancel::Arguments),

    /// Show properties of resources, processes, and jobs.
    #[command(subcommand)]
    Show(ShowCommands),
}

/// Register SIGINT and SIGTERM so that runners stop between tasks.
///
/// A second signal exits immediately.
pub fn install_signal_handlers() -> Result<Arc<AtomicBool>, Box<dyn Error>> {
    let should_terminate = Arc::new(AtomicBool::new(false));
    flag::register_conditional_shutdown(SIGINT, 10, Arc::clone(&should_terminate))?;
    flag::register(SIGINT, Arc::clone(&should_terminate))?;
    flag::register_conditional_shutdown(SIGTERM, 10, Arc::clone(&should_terminate))?;
    flag::register(SIGTERM, Arc::clone(&should_terminate))?;
    Ok(should_terminate)
}

/// Open the registry in the current directory.
pub fn open_registry(
    resources: resource::Configuration,
) -> Result<Arc<dyn Registry>, gantry::Error> {
    trace!("Opening the registry in '{DATA_DIRECTORY_NAME}'.");
    Ok(Arc::new(LocalRegistry::open(
        Path::new(DATA_DIRECTORY_NAME),
        resources,
    )?))
}

/// Build an engine on the registry in the current directory.
pub fn open_engine(
    resources: resource::Configuration,
    should_terminate: Arc<AtomicBool>,
) -> Result<Engine, gantry::Error> {
    let settings = EngineSettings::open()?;
    let credentials: Arc<dyn CredentialStore> = Arc::new(CredentialConfiguration::open()?);
    let sessions = Arc::new(SessionPool::new(
        Box::new(CliSessionFactory::new(credentials)),
        settings.max_sessions_per_host,
    ));
    Ok(Engine::new(
        open_registry(resources)?,
        sessions,
        settings,
        should_terminate,
    ))
}
