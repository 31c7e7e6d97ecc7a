// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use log::trace;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::model::{JobState, JobStatus};
use crate::parser::{find_row, job_state_from_code, split_key, OutputParser};

const JOB_ID_COLUMN: usize = 0;
const STATE_COLUMN: usize = 2;

/// Parse the output of `bsub`, `bjobs`, and `bkill` from IBM Spectrum LSF.
///
/// Status commands pass `-w` so that job names are never truncated.
pub struct Lsf;

/// True when the listing says there is nothing to report.
fn is_empty_listing(raw_output: &str) -> bool {
    raw_output.contains("No unfinished job found") || raw_output.contains("is not found")
}

fn submitted() -> &'static Regex {
    static SUBMITTED: OnceLock<Regex> = OnceLock::new();
    SUBMITTED.get_or_init(|| Regex::new(r"Job <(\d+)> is submitted").expect("valid regular expression"))
}

impl OutputParser for Lsf {
    fn parse_job_submission(&self, raw_output: &str) -> Option<String> {
        submitted()
            .captures(raw_output)
            .map(|captures| captures[1].to_string())
    }

    fn is_job_submission_failed(&self, raw_output: &str) -> bool {
        raw_output.contains("FAILED")
            || raw_output.contains("Job not submitted")
            || raw_output.contains("Request aborted")
    }

    fn parse_job_status(&self, job_id: &str, raw_output: &str) -> JobStatus {
        if is_empty_listing(raw_output) {
            return JobStatus::new(JobState::Unknown);
        }

        match find_row(raw_output, JOB_ID_COLUMN, job_id)
            .and_then(|columns| columns.get(STATE_COLUMN).map(|s| job_state_from_code(s)))
        {
            Some(state) => JobStatus::new(state),
            None => {
                trace!("Job '{job_id}' not present in bjobs output.");
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
        if is_empty_listing(raw_output) {
            trace!("No jobs listed for '{user_name}'.");
            return;
        }

        for (key, status) in statuses.iter_mut() {
            let (job_id, _) = split_key(key);
            if let Some(state) = find_row(raw_output, JOB_ID_COLUMN, job_id)
                .and_then(|columns| columns.get(STATE_COLUMN).map(|s| job_state_from_code(s)))
            {
                *status = JobStatus::new(state);
            }
        }
    }

    fn parse_job_id(&self, job_name: &str, raw_output: &str) -> Option<String> {
        if is_empty_listing(raw_output) {
            return None;
        }
        // EXEC_HOST is blank for pending jobs, so JOB_NAME has no fixed column.
        raw_output
            .lines()
            .map(|line| line.split_whitespace().collect::<Vec<_>>())
            .find(|columns| {
                columns
                    .first()
                    .is_some_and(|id| id.chars().all(|c| c.is_ascii_digit()))
                    && columns.iter().skip(STATE_COLUMN + 1).any(|c| *c == job_name)
            })
            .and_then(|columns| columns.get(JOB_ID_COLUMN).map(|s| (*s).to_string()))
    }
}
