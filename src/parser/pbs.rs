// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use log::trace;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::model::{JobState, JobStatus};
use crate::parser::{job_state_from_code, split_key, truncate_name, OutputParser};

/// `qstat -u` shows at most 10 characters of the job name.
const NAME_WIDTH: usize = 10;

const NAME_COLUMN: usize = 3;

/// Parse the output of `qsub`, `qstat`, and `qdel` from PBS and Torque.
pub struct Pbs;

/// The numeric part of a PBS job id: `1234.server` -> `1234`.
fn numeric_id(job_id: &str) -> &str {
    job_id.split('.').next().unwrap_or(job_id)
}

/// Columns of the `qstat -u` line for the given job.
fn listing_row<'a>(raw_output: &'a str, job_id: &str) -> Option<Vec<&'a str>> {
    let wanted = numeric_id(job_id);
    raw_output
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .find(|columns| {
            columns
                .first()
                .is_some_and(|id| numeric_id(id) == wanted && id.starts_with(|c: char| c.is_ascii_digit()))
        })
}

/// The state column is the second to last in `qstat -u`.
fn listing_state(columns: &[&str]) -> Option<JobState> {
    columns
        .len()
        .checked_sub(2)
        .and_then(|index| columns.get(index))
        .map(|code| job_state_from_code(code))
}

/// A job id alone on a line, as `qsub` prints it: `1234.server` or `1234[]`.
fn submitted_id() -> &'static Regex {
    static SUBMITTED_ID: OnceLock<Regex> = OnceLock::new();
    SUBMITTED_ID.get_or_init(|| {
        Regex::new(r"^(\d+(?:\[\d*\])?(?:\.[\w.\-]+)?)$").expect("valid regular expression")
    })
}

/// `qstat -f` prints one `attribute = value` per line.
fn full_state() -> &'static Regex {
    static FULL_STATE: OnceLock<Regex> = OnceLock::new();
    FULL_STATE.get_or_init(|| Regex::new(r"job_state\s*=\s*(\S+)").expect("valid regular expression"))
}

impl OutputParser for Pbs {
    fn parse_job_submission(&self, raw_output: &str) -> Option<String> {
        raw_output
            .lines()
            .find_map(|line| submitted_id().captures(line.trim()))
            .map(|captures| captures[1].to_string())
    }

    fn is_job_submission_failed(&self, raw_output: &str) -> bool {
        raw_output.contains("FAILED")
            || raw_output
                .lines()
                .any(|line| line.trim_start().starts_with("qsub:"))
    }

    fn parse_job_status(&self, job_id: &str, raw_output: &str) -> JobStatus {
        if let Some(captures) = full_state().captures(raw_output) {
            return JobStatus::new(job_state_from_code(&captures[1]));
        }

        // Fall back to the tabular format.
        match listing_row(raw_output, job_id).and_then(|columns| listing_state(&columns)) {
            Some(state) => JobStatus::new(state),
            None => {
                trace!("Job '{job_id}' not present in qstat output.");
                JobStatus::new(JobState::Unknown)
            }
        }
    }

    fn parse_job_statuses(
        &self,
        user_name: &str,
        statuses: &mut HashMap<String, JobStatus>,
        raw_output: &str,
    ) {
        trace!("Parsing qstat listing for '{user_name}'.");
        for (key, status) in statuses.iter_mut() {
            let (job_id, _) = split_key(key);
            if let Some(state) = listing_row(raw_output, job_id).and_then(|c| listing_state(&c)) {
                *status = JobStatus::new(state);
            }
        }
    }

    fn parse_job_id(&self, job_name: &str, raw_output: &str) -> Option<String> {
        let name = truncate_name(job_name, self.job_name_width());
        raw_output
            .lines()
            .map(|line| line.split_whitespace().collect::<Vec<_>>())
            .find(|columns| {
                columns.get(NAME_COLUMN).is_some_and(|c| *c == name)
                    && columns
                        .first()
                        .is_some_and(|id| id.starts_with(|c: char| c.is_ascii_digit()))
            })
            .and_then(|columns| columns.first().map(|id| numeric_id(id).to_string()))
    }

    fn job_name_width(&self) -> Option<usize> {
        Some(NAME_WIDTH)
    }
}
