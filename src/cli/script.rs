// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use clap::Args;
use log::{debug, info};
use std::error::Error;
use std::io::Write;
use std::path::PathBuf;

use gantry::process::ProcessDescription;
use gantry::resource;
use gantry::script::{generate_job_name, JobScriptBuilder};

#[derive(Args, Debug)]
pub struct Arguments {
    /// The process file.
    file: PathBuf,

    /// Use this job name instead of a generated one.
    #[arg(long, display_order = 0)]
    job_name: Option<String>,
}

/// Print the job script that `gantry run` would submit.
pub fn script<W: Write>(args: &Arguments, output: &mut W) -> Result<(), Box<dyn Error>> {
    debug!("Showing the job script for '{}'.", args.file.display());

    let resources = resource::Configuration::open()?;
    let description = ProcessDescription::open(&args.file)?;
    let compute = resources.compute_resource(&description.compute_resource)?;
    let process = description.process()?;

    let job_name = args.job_name.clone().unwrap_or_else(generate_job_name);
    let script = JobScriptBuilder::new(compute.job_manager, &process, &job_name).build()?;

    info!(
        "{} job script for process '{}' on '{}':",
        compute.job_manager, process.process_id, compute.id
    );
    write!(output, "{script}")?;
    output.flush()?;
    Ok(())
}
