// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use clap::Args;
use console::style;
use log::debug;
use std::error::Error;
use std::io::Write;

use crate::cli;
use gantry::resource;

#[derive(Args, Debug)]
pub struct Arguments {
    /// Id of the process whose job to cancel.
    process_id: String,
}

/// Cancel the job of a process.
pub fn cancel<W: Write>(args: &Arguments, output: &mut W) -> Result<(), Box<dyn Error>> {
    debug!("Canceling the job of process '{}'.", args.process_id);

    let should_terminate = cli::install_signal_handlers()?;
    let engine = cli::open_engine(resource::Configuration::open()?, should_terminate)?;
    let status = engine.cancel(&args.process_id)?;

    write!(output, "Job of process {} is ", style(&args.process_id).bold())?;
    write!(output, "{}", style(status.state).yellow().bold())?;
    match &status.reason {
        Some(reason) => writeln!(output, " ({reason}).")?,
        None => writeln!(output, ".")?,
    }
    output.flush()?;
    Ok(())
}
