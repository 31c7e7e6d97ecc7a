// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use log::trace;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::model::{JobState, JobStatus};
use crate::parser::{find_row, job_state_from_code, split_key, truncate_name, OutputParser};

/// `squeue` truncates job names to 8 characters in its default format.
const NAME_WIDTH: usize = 8;

const JOB_ID_COLUMN: usize = 0;
const NAME_COLUMN: usize = 2;
const STATE_COLUMN: usize = 4;

/// Parse the output of `sbatch`, `squeue`, and `scancel`.
pub struct Slurm;

fn submitted() -> &'static Regex {
    static SUBMITTED: OnceLock<Regex> = OnceLock::new();
    SUBMITTED.get_or_init(|| {
        Regex::new(r"Submitted batch job (\d+)").expect("valid regular expression")
    })
}

/// `sbatch --parsable` prints "id" or "id;cluster".
fn parsable() -> &'static Regex {
    static PARSABLE: OnceLock<Regex> = OnceLock::new();
    PARSABLE.get_or_init(|| Regex::new(r"^(\d+)(;\S+)?$").expect("valid regular expression"))
}

impl OutputParser for Slurm {
    fn parse_job_submission(&self, raw_output: &str) -> Option<String> {
        if let Some(captures) = submitted().captures(raw_output) {
            return Some(captures[1].to_string());
        }

        raw_output
            .lines()
            .find_map(|line| parsable().captures(line.trim()))
            .map(|captures| captures[1].to_string())
    }

    fn is_job_submission_failed(&self, raw_output: &str) -> bool {
        raw_output.contains("FAILED") || raw_output.contains("sbatch: error:")
    }

    fn parse_job_status(&self, job_id: &str, raw_output: &str) -> JobStatus {
        match find_row(raw_output, JOB_ID_COLUMN, job_id)
            .and_then(|columns| columns.get(STATE_COLUMN).map(|s| job_state_from_code(s)))
        {
            Some(state) => JobStatus::new(state),
            None => {
                trace!("Job '{job_id}' not present in squeue output.");
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
        trace!("Parsing squeue listing for '{user_name}'.");
        for (key, status) in statuses.iter_mut() {
            let (job_id, _) = split_key(key);
            if let Some(code) = find_row(raw_output, JOB_ID_COLUMN, job_id)
                .and_then(|columns| columns.get(STATE_COLUMN).map(|s| (*s).to_string()))
            {
                *status = JobStatus::new(job_state_from_code(&code));
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
