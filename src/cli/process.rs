// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use clap::Args;
use console::Style;
use log::debug;
use serde::Serialize;
use std::error::Error;
use std::io::Write;

use crate::cli;
use crate::ui::{Cell, Table};
use gantry::model::{JobModel, ProcessModel, ProcessState, TaskDetail, TaskModel, TaskState};
use gantry::resource;

#[derive(Args, Debug)]
pub struct Arguments {
    /// Show the tasks of this process (defaults to a summary of all processes).
    process_id: Option<String>,

    /// Hide the table header.
    #[arg(long, display_order = 0)]
    no_header: bool,

    /// Print the full records of the process as JSON.
    #[arg(long, requires = "process_id", display_order = 0)]
    json: bool,
}

/// Everything the registry holds about one process.
#[derive(Serialize)]
struct ProcessRecord {
    process: ProcessModel,
    tasks: Vec<TaskModel>,
    job: Option<JobModel>,
}

fn process_style(state: ProcessState) -> Style {
    match state {
        ProcessState::Completed => Style::new().green().bold(),
        ProcessState::Failed => Style::new().red().bold(),
        ProcessState::Canceled => Style::new().yellow().bold(),
        _ => Style::new().cyan(),
    }
}

fn task_style(state: TaskState) -> Style {
    match state {
        TaskState::Completed => Style::new().green().bold(),
        TaskState::Failed => Style::new().red().bold(),
        TaskState::Executing => Style::new().cyan().bold(),
        TaskState::Created => Style::new().dim(),
    }
}

/// What a task acts on.
fn target(task: &TaskModel) -> String {
    match &task.detail {
        TaskDetail::EnvSetup { location } => location.clone(),
        TaskDetail::DataStaging(staging) => {
            format!("{} -> {}", staging.source, staging.destination)
        }
        TaskDetail::JobSubmission { .. } => String::new(),
    }
}

/// Show the state of processes, or the tasks of one process.
pub fn process<W: Write>(args: &Arguments, output: &mut W) -> Result<(), Box<dyn Error>> {
    let registry = cli::open_registry(resource::Configuration::open()?)?;

    if let (Some(process_id), true) = (&args.process_id, args.json) {
        debug!("Showing the records of process '{process_id}' as JSON.");
        let record = ProcessRecord {
            process: registry.process(process_id)?,
            tasks: registry.tasks(process_id)?,
            job: registry.job(process_id)?,
        };
        writeln!(output, "{}", serde_json::to_string_pretty(&record)?)?;
        output.flush()?;
        return Ok(());
    }

    let table = if let Some(process_id) = &args.process_id {
        debug!("Showing the tasks of process '{process_id}'.");
        let mut table = Table::titled(&["Task", "Type", "State", "Target", "Reason"], args.no_header);

        for task in registry.tasks(process_id)? {
            let state = task.state();
            let reason = task
                .status()
                .and_then(|s| s.reason.clone())
                .or_else(|| task.errors.last().map(|e| e.user_friendly_message.clone()))
                .unwrap_or_default();
            table.push(vec![
                Cell::new(task.task_id.clone(), Style::new().bold()),
                Cell::new(task.task_type.to_string(), Style::new().blue()),
                Cell::new(state.to_string(), task_style(state)),
                Cell::new(target(&task), Style::new()),
                Cell::new(reason, Style::new().italic()),
            ]);
        }
        table
    } else {
        debug!("Showing all processes.");
        let mut table = Table::titled(
            &["Process", "Experiment", "Resource", "State", "Error"],
            args.no_header,
        );

        for process in registry.processes()? {
            table.push(vec![
                Cell::new(process.process_id.clone(), Style::new().bold()),
                Cell::new(process.experiment_id.clone(), Style::new()),
                Cell::new(process.compute_resource_id.clone(), Style::new().blue()),
                Cell::new(process.state.to_string(), process_style(process.state)),
                Cell::new(
                    process
                        .errors
                        .last()
                        .map(|e| e.user_friendly_message.clone())
                        .unwrap_or_default(),
                    Style::new().italic(),
                ),
            ]);
        }
        table
    };

    table.write(output)?;
    output.flush()?;
    Ok(())
}
