// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use log::trace;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::model::{JobState, JobStatus};
use crate::parser::{find_row, job_state_from_code, split_key, truncate_name, OutputParser};

/// `qstat` shows at most 10 characters of the job name.
const NAME_WIDTH: usize = 10;

const JOB_ID_COLUMN: usize = 0;
const NAME_COLUMN: usize = 2;
const STATE_COLUMN: usize = 4;

/// Parse the output of `qsub`, `qstat`, and `qdel` from Univa / Sun Grid Engine.
pub struct Uge;

/// Map one job's UGE state field to a `JobState`.
///
/// UGE combines letters in the state field (`qw`, `hqw`, `Eqw`, `dr`, `Rr`).
/// Its `E` marks a job in error, unlike PBS where `E` is a job exiting
/// normally, so it is rewritten to `Er` before the shared table lookup. The
/// rewrite applies to this job's field only.
fn state_from_field(field: &str) -> JobState {
    let code = if field.contains('E') {
        "Er"
    } else if field.contains('d') {
        "CA"
    } else if field.contains('s') || field.contains('S') || field.contains('T') {
        "S"
    } else if field.contains('r') || field.contains('t') || field.contains('R') {
        "r"
    } else if field.contains("qw") || field.contains('h') {
        "qw"
    } else {
        field
    };
    job_state_from_code(code)
}

/// Matches both `Your job 1` and `Your job-array 1.1-10:1`.
fn submitted() -> &'static Regex {
    static SUBMITTED: OnceLock<Regex> = OnceLock::new();
    SUBMITTED.get_or_init(|| {
        Regex::new(r"Your job(?:-array)? (\d+)").expect("valid regular expression")
    })
}

impl OutputParser for Uge {
    fn parse_job_submission(&self, raw_output: &str) -> Option<String> {
        submitted()
            .captures(raw_output)
            .map(|captures| captures[1].to_string())
    }

    fn is_job_submission_failed(&self, raw_output: &str) -> bool {
        raw_output.contains("FAILED")
            || raw_output.contains("Rejecting")
            || raw_output.contains("Unable to run job")
    }

    fn parse_job_status(&self, job_id: &str, raw_output: &str) -> JobStatus {
        if raw_output.contains("Following jobs do not exist") {
            return JobStatus::new(JobState::Unknown);
        }

        match find_row(raw_output, JOB_ID_COLUMN, job_id)
            .and_then(|columns| columns.get(STATE_COLUMN).map(|s| state_from_field(s)))
        {
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
            if let Some(state) = find_row(raw_output, JOB_ID_COLUMN, job_id)
                .and_then(|columns| columns.get(STATE_COLUMN).map(|s| state_from_field(s)))
            {
                *status = JobStatus::new(state);
            }
        }
    }

    fn parse_job_id(&self, job_name: &str, raw_output: &str) -> Option<String> {
        let name = truncate_name(job_name, self.job_name_width());
        find_row(raw_output, NAME_COLUMN, name)
            .and_then(|columns| columns.get(JOB_ID_COLUMN).map(|s| (*s).to_string()))
    }

    fn job_name_width(&self) -> Option<usize> {
        Some(NAME_WIDTH)
    }
}
