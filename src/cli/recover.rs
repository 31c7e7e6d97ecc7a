// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use clap::Args;
use log::debug;
use std::error::Error;
use std::io::Write;

use crate::cli::{self, run};
use gantry::engine::RunMode;
use gantry::resource;
use gantry::MultiProgressContainer;

#[derive(Args, Debug)]
pub struct Arguments {
    /// Ids of the processes to resume.
    #[arg(required = true)]
    process_ids: Vec<String>,

    /// Hide the table header.
    #[arg(long, display_order = 0)]
    no_header: bool,
}

/// Resume processes from their persisted state.
pub fn recover<W: Write>(
    args: Arguments,
    multi_progress: &mut MultiProgressContainer,
    output: &mut W,
) -> Result<(), Box<dyn Error>> {
    debug!("Recovering {} process(es).", args.process_ids.len());

    let should_terminate = cli::install_signal_handlers()?;
    let engine = cli::open_engine(resource::Configuration::open()?, should_terminate)?;

    // Fail before starting any runner when an id is unknown.
    for process_id in &args.process_ids {
        engine.registry().process(process_id)?;
    }

    let results = engine.run_all(&args.process_ids, RunMode::Recover, multi_progress);
    run::report(engine.registry().as_ref(), results, args.no_header, output)
}
