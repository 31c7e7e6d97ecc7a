// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use indicatif::{ProgressState, ProgressStyle};
use std::fmt::Write;

use crate::format::Elapsed;

pub(crate) const STEADY_TICK: u64 = 110;

/// The `{elapsed}` key, precise below one second.
fn elapsed(state: &ProgressState, w: &mut dyn Write) {
    let _ = write!(w, "{:#}", Elapsed(state.elapsed()));
}

/// A spinner that shows the phase of one process.
///
/// # Panics
/// When the progress style is invalid.
///
pub fn process_spinner() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.green.bold} {prefix:.bold}: {msg} ({elapsed:.dim})")
        .expect("Valid template")
        .with_key("elapsed", elapsed)
        .tick_strings(&["◐", "◓", "◑", "◒", "⊙"])
}
