// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use clap::Args;
use console::Style;
use log::{debug, info, warn};
use std::error::Error;
use std::io::Write;
use std::path::PathBuf;

use crate::cli;
use crate::ui::{Cell, Table};
use gantry::engine::RunMode;
use gantry::model::ProcessState;
use gantry::process::ProcessDescription;
use gantry::registry::Registry;
use gantry::resource;
use gantry::MultiProgressContainer;

#[derive(Args, Debug)]
pub struct Arguments {
    /// Process files to run.
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Hide the table header.
    #[arg(long, display_order = 0)]
    no_header: bool,
}

fn state_style(state: ProcessState) -> Style {
    match state {
        ProcessState::Completed => Style::new().green().bold(),
        ProcessState::Failed => Style::new().red().bold(),
        ProcessState::Canceled => Style::new().yellow().bold(),
        _ => Style::new().cyan(),
    }
}

/// The message of the most recent error recorded on a process.
fn last_error(registry: &dyn Registry, process_id: &str) -> String {
    registry
        .process(process_id)
        .ok()
        .and_then(|p| p.errors.last().map(|e| e.user_friendly_message.clone()))
        .unwrap_or_default()
}

/// Print one row per process and fail when any process did not complete.
pub fn report<W: Write>(
    registry: &dyn Registry,
    results: Vec<(String, Result<ProcessState, gantry::Error>)>,
    no_header: bool,
    output: &mut W,
) -> Result<(), Box<dyn Error>> {
    let mut table = Table::titled(&["Process", "State", "Message"], no_header);

    let total = results.len();
    let mut incomplete = 0;
    for (process_id, result) in results {
        let (state, style, message) = match result {
            Ok(ProcessState::Completed) => (
                ProcessState::Completed.to_string(),
                state_style(ProcessState::Completed),
                String::new(),
            ),
            Ok(state) => (state.to_string(), state_style(state), last_error(registry, &process_id)),
            Err(gantry::Error::Interrupted) => (
                "INTERRUPTED".to_string(),
                Style::new().yellow(),
                format!("run 'gantry recover {process_id}' to resume"),
            ),
            Err(error) => (
                ProcessState::Failed.to_string(),
                state_style(ProcessState::Failed),
                error.user_message(),
            ),
        };
        if state != ProcessState::Completed.to_string() {
            incomplete += 1;
        }

        table.push(vec![
            Cell::new(process_id, Style::new().bold()),
            Cell::new(state, style),
            Cell::new(message, Style::new().italic()),
        ]);
    }

    table.write(output)?;
    output.flush()?;

    if incomplete > 0 {
        return Err(format!("{incomplete} of {total} process(es) did not complete.").into());
    }
    Ok(())
}

/// Execute processes described by process files.
pub fn run<W: Write>(
    args: Arguments,
    multi_progress: &mut MultiProgressContainer,
    output: &mut W,
) -> Result<(), Box<dyn Error>> {
    debug!("Running {} process file(s).", args.files.len());

    let resources = resource::Configuration::open()?;
    let mut plans = Vec::with_capacity(args.files.len());
    for file in &args.files {
        let plan = ProcessDescription::open(file)?.plan(&resources)?;
        info!(
            "Process '{}' from '{}' has {} task(s).",
            plan.process.process_id,
            file.display(),
            plan.tasks.len()
        );
        plans.push(plan);
    }

    let should_terminate = cli::install_signal_handlers()?;
    let engine = cli::open_engine(resources, should_terminate)?;

    let mut process_ids = Vec::with_capacity(plans.len());
    for plan in &plans {
        if engine.registry().process(&plan.process.process_id).is_ok() {
            warn!(
                "Process '{}' already exists, use 'gantry recover' to resume it.",
                plan.process.process_id
            );
            continue;
        }
        engine.submit(plan)?;
        process_ids.push(plan.process.process_id.clone());
    }

    if process_ids.is_empty() {
        warn!("There are no new processes to run.");
        return Ok(());
    }

    let results = engine.run_all(&process_ids, RunMode::Execute, multi_progress);
    report(engine.registry().as_ref(), results, args.no_header, output)
}
