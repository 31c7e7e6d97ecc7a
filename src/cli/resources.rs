// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use clap::Args;
use log::{debug, info};
use std::error::Error;
use std::io::Write;

use gantry::resource;

#[derive(Args, Debug)]
pub struct Arguments {
    /// Show all resources.
    #[arg(long, group = "select", display_order = 0)]
    all: bool,

    /// Show the resources with this id.
    #[arg(long, group = "select", default_value = "localhost", display_order = 0)]
    resource: String,
}

/// Show the resources.
///
/// Print the resources to stdout in toml format.
///
pub fn resources<W: Write>(args: &Arguments, output: &mut W) -> Result<(), Box<dyn Error>> {
    debug!("Showing resources.");

    let resources = resource::Configuration::open()?;

    if args.all {
        info!("All resource configurations:");
        write!(output, "{}", &toml::to_string_pretty(&resources)?)?;
    } else {
        info!("Resource configurations for '{}':", args.resource);
        let selected = resources.select(&args.resource)?;
        write!(output, "{}", &toml::to_string_pretty(&selected)?)?;
    }

    Ok(())
}
