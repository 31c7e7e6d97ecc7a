// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use log::trace;
use shell_quote::QuoteExt;
use std::fmt::Write as _;
use std::path::Path;
use uuid::Uuid;

use crate::model::{DataType, ProcessModel};
use crate::resource::JobManagerType;
use crate::session::quote;
use crate::Error;

/// Generate a job name that every scheduler displays in full or truncates predictably.
///
/// Names start with a letter because PBS rejects names that start with a digit.
pub fn generate_job_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("A{}", &id[..9])
}

/// `JobScriptBuilder` renders scheduler-native batch scripts for a process.
pub struct JobScriptBuilder<'a> {
    job_manager: JobManagerType,
    process: &'a ProcessModel,
    job_name: &'a str,
}

impl<'a> JobScriptBuilder<'a> {
    pub fn new(job_manager: JobManagerType, process: &'a ProcessModel, job_name: &'a str) -> Self {
        JobScriptBuilder {
            job_manager,
            process,
            job_name,
        }
    }

    /// Write the scheduler directives.
    fn directives(&self) -> String {
        let scheduling = &self.process.scheduling;
        let working_directory = quote(&self.process.working_directory);
        let std_out = quote(&self.process.std_out_path());
        let std_err = quote(&self.process.std_err_path());
        let mut result = String::with_capacity(512);

        match self.job_manager {
            JobManagerType::Fork => (),
            JobManagerType::Slurm => {
                let _ = writeln!(result, "#SBATCH --job-name={}", self.job_name);
                let _ = writeln!(result, "#SBATCH --chdir={working_directory}");
                let _ = writeln!(result, "#SBATCH --output={std_out}");
                let _ = writeln!(result, "#SBATCH --error={std_err}");
                if let Some(queue) = &scheduling.queue_name {
                    let _ = writeln!(result, "#SBATCH --partition={}", quote(queue));
                }
                if let Some(account) = &scheduling.account {
                    let _ = writeln!(result, "#SBATCH --account={}", quote(account));
                }
                if let Some(nodes) = scheduling.node_count {
                    let _ = writeln!(result, "#SBATCH --nodes={nodes}");
                }
                if let Some(cpus) = scheduling.total_cpu_count {
                    let _ = writeln!(result, "#SBATCH --ntasks={cpus}");
                }
                if let Some(minutes) = scheduling.wall_time_limit {
                    let _ = writeln!(result, "#SBATCH --time={minutes}");
                }
                if let Some(memory) = scheduling.total_physical_memory {
                    let _ = writeln!(result, "#SBATCH --mem={memory}M");
                }
            }
            JobManagerType::Pbs => {
                let _ = writeln!(result, "#PBS -N {}", self.job_name);
                let _ = writeln!(result, "#PBS -d {working_directory}");
                let _ = writeln!(result, "#PBS -o {std_out}");
                let _ = writeln!(result, "#PBS -e {std_err}");
                if let Some(queue) = &scheduling.queue_name {
                    let _ = writeln!(result, "#PBS -q {}", quote(queue));
                }
                if let Some(account) = &scheduling.account {
                    let _ = writeln!(result, "#PBS -A {}", quote(account));
                }
                match (scheduling.node_count, scheduling.total_cpu_count) {
                    (Some(nodes), Some(cpus)) => {
                        let per_node = cpus.div_ceil(nodes.max(1));
                        let _ = writeln!(result, "#PBS -l nodes={nodes}:ppn={per_node}");
                    }
                    (Some(nodes), None) => {
                        let _ = writeln!(result, "#PBS -l nodes={nodes}");
                    }
                    (None, Some(cpus)) => {
                        let _ = writeln!(result, "#PBS -l nodes=1:ppn={cpus}");
                    }
                    (None, None) => (),
                }
                if let Some(minutes) = scheduling.wall_time_limit {
                    let _ = writeln!(result, "#PBS -l walltime={}", hours_minutes(minutes));
                }
                if let Some(memory) = scheduling.total_physical_memory {
                    let _ = writeln!(result, "#PBS -l mem={memory}mb");
                }
            }
            JobManagerType::Uge => {
                let _ = writeln!(result, "#$ -N {}", self.job_name);
                let _ = writeln!(result, "#$ -S /bin/bash");
                let _ = writeln!(result, "#$ -wd {working_directory}");
                let _ = writeln!(result, "#$ -o {std_out}");
                let _ = writeln!(result, "#$ -e {std_err}");
                if let Some(queue) = &scheduling.queue_name {
                    let _ = writeln!(result, "#$ -q {}", quote(queue));
                }
                if let Some(account) = &scheduling.account {
                    let _ = writeln!(result, "#$ -A {}", quote(account));
                }
                if let Some(cpus) = scheduling.total_cpu_count {
                    let _ = writeln!(result, "#$ -pe smp {cpus}");
                }
                if let Some(minutes) = scheduling.wall_time_limit {
                    let _ = writeln!(result, "#$ -l h_rt={}", hours_minutes(minutes));
                }
                if let Some(memory) = scheduling.total_physical_memory {
                    let _ = writeln!(result, "#$ -l h_vmem={memory}M");
                }
            }
            JobManagerType::Lsf => {
                let _ = writeln!(result, "#BSUB -J {}", self.job_name);
                let _ = writeln!(result, "#BSUB -cwd {working_directory}");
                let _ = writeln!(result, "#BSUB -o {std_out}");
                let _ = writeln!(result, "#BSUB -e {std_err}");
                if let Some(queue) = &scheduling.queue_name {
                    let _ = writeln!(result, "#BSUB -q {}", quote(queue));
                }
                if let Some(account) = &scheduling.account {
                    let _ = writeln!(result, "#BSUB -P {}", quote(account));
                }
                if let Some(cpus) = scheduling.total_cpu_count {
                    let _ = writeln!(result, "#BSUB -n {cpus}");
                }
                if let Some(minutes) = scheduling.wall_time_limit {
                    let _ = writeln!(result, "#BSUB -W {minutes}");
                }
                if let Some(memory) = scheduling.total_physical_memory {
                    let _ = writeln!(result, "#BSUB -M {memory}");
                }
            }
        }

        result
    }

    /// The command line arguments contributed by the process inputs.
    fn input_arguments(&self) -> Vec<String> {
        let mut arguments = Vec::new();
        for input in &self.process.inputs {
            let Some(value) = input.value.as_deref().filter(|v| !v.is_empty()) else {
                continue;
            };
            if !input.add_to_command_line {
                continue;
            }

            if let Some(prefix) = input.argument_prefix.as_deref().filter(|p| !p.is_empty()) {
                arguments.push(prefix.to_string());
            }

            // Staged files land in the working directory under their own name.
            let argument = match input.data_type {
                DataType::Uri | DataType::UriCollection => Path::new(value)
                    .file_name()
                    .map_or_else(|| value.to_string(), |n| n.to_string_lossy().into_owned()),
                _ => value.to_string(),
            };
            arguments.push(argument);
        }
        arguments
    }

    /// Write the commands that run the application.
    fn payload(&self) -> String {
        let application = &self.process.application;
        let mut result = String::with_capacity(512);

        for module in &application.module_loads {
            let _ = writeln!(result, "module load {}", quote(module));
        }
        for (name, value) in &application.environment {
            let _ = writeln!(result, "export {name}={}", quote(value));
        }
        let _ = writeln!(result, "cd {}", quote(&self.process.working_directory));
        for command in &application.pre_job_commands {
            let _ = writeln!(result, "{command}");
        }

        result.push_quoted(shell_quote::Bash, &application.executable);
        for argument in application
            .arguments
            .iter()
            .cloned()
            .chain(self.input_arguments())
        {
            result.push(' ');
            result.push_quoted(shell_quote::Bash, &argument);
        }
        result.push('\n');

        for command in &application.post_job_commands {
            let _ = writeln!(result, "{command}");
        }
        result
    }

    /// Build the job script.
    ///
    /// # Errors
    /// `gantry::Error::JobScript` when the application has no executable or
    /// the job name is empty.
    ///
    pub fn build(&self) -> Result<String, Error> {
        if self.job_name.is_empty() {
            return Err(Error::JobScript(
                self.process.process_id.clone(),
                "the job name is empty".into(),
            ));
        }
        if self.process.application.executable.trim().is_empty() {
            return Err(Error::JobScript(
                self.process.process_id.clone(),
                "the application has no executable".into(),
            ));
        }

        let mut script = "#!/bin/bash\n".to_string();
        script.push_str(&self.directives());
        script.push('\n');

        if self.job_manager == JobManagerType::Fork {
            // Detach the payload and print its PID, which is the fork job id.
            let _ = writeln!(
                script,
                "(\n{}) > {} 2> {} < /dev/null &\necho $!",
                self.payload(),
                quote(&self.process.std_out_path()),
                quote(&self.process.std_err_path())
            );
        } else {
            script.push_str(&self.payload());
        }

        trace!(
            "Generated {} job script for process '{}'.",
            self.job_manager,
            self.process.process_id
        );
        Ok(script)
    }
}

/// Format minutes as `HH:MM:00`.
fn hours_minutes(minutes: u64) -> String {
    format!("{:02}:{:02}:00", minutes / 60, minutes % 60)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{Application, InputDataObject, ProcessState, Scheduling};
    use chrono::Utc;
    use serial_test::parallel;

    pub(crate) fn process() -> ProcessModel {
        ProcessModel {
            process_id: "p1".into(),
            experiment_id: "e1".into(),
            task_order: Vec::new(),
            state: ProcessState::Created,
            scheduling: Scheduling {
                wall_time_limit: Some(90),
                node_count: Some(2),
                total_cpu_count: Some(8),
                queue_name: Some("shared".into()),
                account: Some("abc123".into()),
                total_physical_memory: None,
            },
            working_directory: "/scratch/p1".into(),
            compute_resource_id: "cluster".into(),
            storage_resource_id: "storage".into(),
            experiment_data_dir: None,
            inputs: vec![InputDataObject {
                name: "structure".into(),
                value: Some("scp://storage/data/in.pdb".into()),
                data_type: DataType::Uri,
                is_required: true,
                add_to_command_line: true,
                argument_prefix: Some("-i".into()),
            }],
            outputs: Vec::new(),
            application: Application {
                name: "simulate".into(),
                executable: "/opt/sim/bin/simulate".into(),
                arguments: vec!["--steps".into(), "1000".into()],
                module_loads: vec!["sim/2.1".into()],
                environment: vec![("OMP_NUM_THREADS".into(), "4".into())],
                pre_job_commands: Vec::new(),
                post_job_commands: Vec::new(),
            },
            user_name: "alice".into(),
            gateway_id: "gateway".into(),
            clean_after_staged: false,
            stream_output: false,
            errors: Vec::new(),
            creation_time: Utc::now(),
        }
    }

    #[test]
    #[parallel]
    fn job_name() {
        let name = generate_job_name();
        assert_eq!(name.len(), 10);
        assert!(name.starts_with('A'));
        assert_ne!(name, generate_job_name());
    }

    #[test]
    #[parallel]
    fn slurm() {
        let process = process();
        let script = JobScriptBuilder::new(JobManagerType::Slurm, &process, "A012345678")
            .build()
            .unwrap();
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#SBATCH --job-name=A012345678\n"));
        assert!(script.contains("#SBATCH --partition=shared\n"));
        assert!(script.contains("#SBATCH --account=abc123\n"));
        assert!(script.contains("#SBATCH --nodes=2\n"));
        assert!(script.contains("#SBATCH --ntasks=8\n"));
        assert!(script.contains("#SBATCH --time=90\n"));
        assert!(script.contains("#SBATCH --output=/scratch/p1/simulate.stdout\n"));
        assert!(script.contains("module load sim/2.1\n"));
        assert!(script.contains("export OMP_NUM_THREADS=4\n"));
        assert!(script.contains("/opt/sim/bin/simulate --steps 1000 -i in.pdb\n"));
        assert!(!script.contains("echo $!"));
    }

    #[test]
    #[parallel]
    fn pbs() {
        let process = process();
        let script = JobScriptBuilder::new(JobManagerType::Pbs, &process, "A012345678")
            .build()
            .unwrap();
        assert!(script.contains("#PBS -N A012345678\n"));
        assert!(script.contains("#PBS -l nodes=2:ppn=4\n"));
        assert!(script.contains("#PBS -l walltime=01:30:00\n"));
    }

    #[test]
    #[parallel]
    fn uge_and_lsf() {
        let process = process();
        let uge = JobScriptBuilder::new(JobManagerType::Uge, &process, "A012345678")
            .build()
            .unwrap();
        assert!(uge.contains("#$ -N A012345678\n"));
        assert!(uge.contains("#$ -l h_rt=01:30:00\n"));

        let lsf = JobScriptBuilder::new(JobManagerType::Lsf, &process, "A012345678")
            .build()
            .unwrap();
        assert!(lsf.contains("#BSUB -J A012345678\n"));
        assert!(lsf.contains("#BSUB -W 90\n"));
        assert!(lsf.contains("#BSUB -n 8\n"));
    }

    #[test]
    #[parallel]
    fn fork() {
        let process = process();
        let script = JobScriptBuilder::new(JobManagerType::Fork, &process, "A012345678")
            .build()
            .unwrap();
        assert!(!script.contains("#SBATCH"));
        assert!(script.contains(
            ") > /scratch/p1/simulate.stdout 2> /scratch/p1/simulate.stderr < /dev/null &\necho $!\n"
        ));
    }

    #[test]
    #[parallel]
    fn quoting() {
        let mut process = process();
        process.application.arguments = vec!["two words".into()];
        let script = JobScriptBuilder::new(JobManagerType::Slurm, &process, "A012345678")
            .build()
            .unwrap();
        assert!(script.contains("/opt/sim/bin/simulate $'two words' -i in.pdb\n"));
    }

    #[test]
    #[parallel]
    fn generation_errors() {
        let mut process = process();
        assert!(matches!(
            JobScriptBuilder::new(JobManagerType::Slurm, &process, "").build(),
            Err(Error::JobScript(..))
        ));

        process.application.executable = String::new();
        let error = JobScriptBuilder::new(JobManagerType::Slurm, &process, "A0")
            .build()
            .unwrap_err();
        assert_eq!(error.kind(), crate::ErrorKind::Configuration);
    }
}
