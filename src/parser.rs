// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

pub mod fork;
pub mod lsf;
pub mod pbs;
pub mod slurm;
pub mod uge;

use std::collections::HashMap;

use crate::model::{JobState, JobStatus};
use crate::resource::JobManagerType;

/// An `OutputParser` turns scheduler free text into structured results.
///
/// Parsers never fail. Output they cannot interpret yields `None` or
/// `JobState::Unknown`, which callers treat as "try again later".
pub trait OutputParser: Send + Sync {
    /// Extract the scheduler-assigned job id from the submission output.
    fn parse_job_submission(&self, raw_output: &str) -> Option<String>;

    /// Check the submission output for known failure markers.
    ///
    /// Some schedulers exit with 0 and report the failure only in text.
    fn is_job_submission_failed(&self, raw_output: &str) -> bool;

    /// Parse the status of one job from a status query response.
    fn parse_job_status(&self, job_id: &str, raw_output: &str) -> JobStatus;

    /// Update `statuses` in place from a multi-line listing of the user's jobs.
    ///
    /// Keys of `statuses` are `"job_id,job_name"`. Keys with no matching line
    /// are left unchanged.
    fn parse_job_statuses(
        &self,
        user_name: &str,
        statuses: &mut HashMap<String, JobStatus>,
        raw_output: &str,
    );

    /// Find the id of the job with the given name in a listing.
    fn parse_job_id(&self, job_name: &str, raw_output: &str) -> Option<String>;

    /// Number of characters of a job name the scheduler displays.
    fn job_name_width(&self) -> Option<usize> {
        None
    }
}

/// Create the parser for the given job manager.
pub fn for_job_manager(job_manager: JobManagerType) -> Box<dyn OutputParser> {
    match job_manager {
        JobManagerType::Fork => Box::new(fork::Fork),
        JobManagerType::Pbs => Box::new(pbs::Pbs),
        JobManagerType::Slurm => Box::new(slurm::Slurm),
        JobManagerType::Uge => Box::new(uge::Uge),
        JobManagerType::Lsf => Box::new(lsf::Lsf),
    }
}

/// Map a scheduler status code to a `JobState`.
///
/// The codes of every supported scheduler share one table. PBS uses `E` for
/// a job that is exiting after a normal run, so `E` maps to `Complete`. UGE
/// uses `E` for an error state, and its parser rewrites that to `Er` first.
pub(crate) fn job_state_from_code(code: &str) -> JobState {
    match code {
        "C" | "CD" | "E" | "CG" | "DONE" => JobState::Complete,
        "Q" | "qw" | "PEND" | "W" | "PD" | "I" | "H" | "T" => JobState::Queued,
        "R" | "CF" | "r" | "RUN" => JobState::Active,
        "S" | "PSUSP" | "USUSP" | "SSUSP" => JobState::Suspended,
        "CA" => JobState::Canceled,
        "F" | "NF" | "TO" | "EXIT" | "PR" | "Er" | "OOM" | "BF" | "DL" => JobState::Failed,
        _ => JobState::Unknown,
    }
}

/// Truncate a job name to the width a scheduler displays.
pub(crate) fn truncate_name(job_name: &str, width: Option<usize>) -> &str {
    match width {
        Some(width) => match job_name.char_indices().nth(width) {
            Some((index, _)) => &job_name[..index],
            None => job_name,
        },
        None => job_name,
    }
}

/// Split a `"job_id,job_name"` status key.
pub(crate) fn split_key(key: &str) -> (&str, &str) {
    key.split_once(',').unwrap_or((key, ""))
}

/// Find the whitespace-separated columns of the first line whose column
/// `index` equals `value`.
pub(crate) fn find_row<'a>(raw_output: &'a str, index: usize, value: &str) -> Option<Vec<&'a str>> {
    raw_output
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .find(|columns| columns.get(index).is_some_and(|c| *c == value))
}
