// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use std::collections::HashMap;

use crate::model::{JobState, JobStatus};
use crate::parser::{split_key, OutputParser};

/// Parse the output of fork job scripts and `ps`.
///
/// A fork job script backgrounds its payload and prints the PID, which
/// becomes the job id. When no PID is printed, a placeholder id is generated
/// so that the job is still recorded. Status queries use
/// `ps -o pid=,stat=`: a listed PID is running and an absent one has exited.
pub struct Fork;

fn is_pid(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_digit())
}

/// The state of `job_id` in `ps -o pid=,stat=` output.
fn process_state(job_id: &str, raw_output: &str) -> JobState {
    let line = raw_output.lines().find(|line| {
        line.split_whitespace()
            .next()
            .is_some_and(|pid| pid == job_id)
    });

    match line.and_then(|line| line.split_whitespace().nth(1)) {
        Some(stat) if stat.starts_with('Z') => JobState::Complete,
        Some(stat) if stat.starts_with('T') => JobState::Suspended,
        Some(_) => JobState::Active,
        None if line.is_some() => JobState::Active,
        None => JobState::Complete,
    }
}

impl OutputParser for Fork {
    fn parse_job_submission(&self, raw_output: &str) -> Option<String> {
        let pid = raw_output
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty());

        match pid {
            Some(pid) if is_pid(pid) => Some(pid.to_string()),
            _ => Some(format!("JOB_ID_{}", uuid::Uuid::new_v4().simple())),
        }
    }

    fn is_job_submission_failed(&self, raw_output: &str) -> bool {
        raw_output.contains("FAILED")
    }

    fn parse_job_status(&self, job_id: &str, raw_output: &str) -> JobStatus {
        if !is_pid(job_id) {
            return JobStatus::new(JobState::Unknown);
        }
        JobStatus::new(process_state(job_id, raw_output))
    }

    fn parse_job_statuses(
        &self,
        _user_name: &str,
        statuses: &mut HashMap<String, JobStatus>,
        raw_output: &str,
    ) {
        for (key, status) in statuses.iter_mut() {
            let (job_id, _) = split_key(key);
            if is_pid(job_id) {
                *status = JobStatus::new(process_state(job_id, raw_output));
            }
        }
    }

    /// Processes have no names to search by.
    fn parse_job_id(&self, _job_name: &str, _raw_output: &str) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::parallel;

    #[test]
    #[parallel]
    fn submission_prints_pid() {
        let parser = Fork;
        assert_eq!(parser.parse_job_submission("31337\n"), Some("31337".into()));
        assert!(!parser.is_job_submission_failed("31337\n"));
    }

    #[test]
    #[parallel]
    fn submission_without_pid_gets_placeholder() {
        let parser = Fork;
        let id = parser.parse_job_submission("").expect("placeholder id");
        assert!(id.starts_with("JOB_ID_"));
        assert_eq!(parser.parse_job_status(&id, "").state, JobState::Unknown);
    }

    #[test]
    #[parallel]
    fn status() {
        let parser = Fork;
        assert_eq!(parser.parse_job_status("42", "   42 S\n").state, JobState::Active);
        assert_eq!(parser.parse_job_status("42", "   42 Z\n").state, JobState::Complete);
        assert_eq!(parser.parse_job_status("42", "").state, JobState::Complete);
    }

    #[test]
    #[parallel]
    fn statuses() {
        let parser = Fork;
        let mut statuses = HashMap::new();
        statuses.insert("42,a".to_string(), JobStatus::new(JobState::Queued));
        statuses.insert("43,b".to_string(), JobStatus::new(JobState::Queued));
        parser.parse_job_statuses("alice", &mut statuses, "42 R+\n");
        assert_eq!(statuses["42,a"].state, JobState::Active);
        assert_eq!(statuses["43,b"].state, JobState::Complete);
        assert_eq!(parser.parse_job_id("a", "42 R+\n"), None);
    }
}
