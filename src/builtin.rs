// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use std::env;

use crate::resource::{
    self, ComputeResource, JobManagerCommands, JobManagerType, Protocol, StorageResource,
};

pub(crate) trait BuiltIn {
    fn built_in() -> Self;
}

impl JobManagerCommands {
    /// The executables each job manager ships with.
    pub(crate) fn built_in(job_manager: JobManagerType) -> Self {
        let (submission, job_monitoring, deletion) = match job_manager {
            JobManagerType::Fork => ("bash", "ps", "kill"),
            JobManagerType::Pbs | JobManagerType::Uge => ("qsub", "qstat", "qdel"),
            JobManagerType::Slurm => ("sbatch", "squeue", "scancel"),
            JobManagerType::Lsf => ("bsub", "bjobs", "bkill"),
        };

        JobManagerCommands {
            submission: Some(submission.into()),
            job_monitoring: Some(job_monitoring.into()),
            deletion: Some(deletion.into()),
        }
    }
}

fn localhost_compute() -> ComputeResource {
    ComputeResource {
        id: "localhost".into(),
        host_name: "localhost".into(),
        port: None,
        protocol: Protocol::Local,
        login_user: None,
        credential_token: None,
        job_manager: JobManagerType::Fork,
        commands: JobManagerCommands::default(),
        command_prefix: None,
        gateway_usage: None,
    }
}

fn localhost_storage() -> StorageResource {
    let root = home::home_dir()
        .unwrap_or_else(env::temp_dir)
        .join("gantry-storage");

    StorageResource {
        id: "localhost".into(),
        host_name: "localhost".into(),
        port: None,
        protocol: Protocol::Local,
        login_user: None,
        credential_token: None,
        file_system_root: root.to_string_lossy().into_owned(),
    }
}

impl BuiltIn for resource::Configuration {
    fn built_in() -> Self {
        Self {
            compute_resource: vec![localhost_compute()],
            storage_resource: vec![localhost_storage()],
        }
    }
}
