// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use clap::Args;
use console::Style;
use log::{debug, trace};
use std::error::Error;
use std::io::Write;
use wildmatch::WildMatch;

use crate::cli;
use crate::ui::{Cell, Table};
use gantry::model::JobState;
use gantry::resource;

#[derive(Args, Debug)]
pub struct Arguments {
    /// Select the processes to show with a wildcard pattern.
    #[arg(short, long, value_name = "pattern", default_value_t=String::from("*"), display_order=0)]
    process: String,

    /// Hide the table header.
    #[arg(long, display_order = 0)]
    no_header: bool,
}

fn state_style(state: JobState) -> Style {
    match state {
        JobState::Complete => Style::new().green().bold(),
        JobState::Failed => Style::new().red().bold(),
        JobState::Canceled => Style::new().yellow().bold(),
        JobState::Active => Style::new().cyan().bold(),
        JobState::Unknown => Style::new().dim(),
        _ => Style::new().cyan(),
    }
}

/// List the persisted jobs and their latest state.
pub fn jobs<W: Write>(args: &Arguments, output: &mut W) -> Result<(), Box<dyn Error>> {
    debug!("Showing jobs.");
    let matcher = WildMatch::new(&args.process);

    let registry = cli::open_registry(resource::Configuration::open()?)?;

    let mut table = Table::titled(
        &["Process", "Job ID", "Name", "Resource", "State", "Submitted"],
        args.no_header,
    )
    .align_right(1);

    for job in registry.jobs()? {
        if !matcher.matches(&job.process_id) {
            trace!(
                "Skipping process '{}'. It does not match the pattern '{}'.",
                job.process_id,
                args.process
            );
            continue;
        }

        let state = job.state();
        table.push(vec![
            Cell::new(job.process_id.clone(), Style::new().bold()),
            Cell::new(job.job_id.clone().unwrap_or_default(), Style::new().yellow()),
            Cell::new(job.job_name.clone(), Style::new()),
            Cell::new(job.compute_resource_id.clone(), Style::new().blue()),
            Cell::new(state.to_string(), state_style(state)),
            Cell::new(
                job.submitted_time
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default(),
                Style::new().dim(),
            ),
        ]);
    }

    table.write(output)?;
    output.flush()?;
    Ok(())
}
