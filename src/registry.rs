// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

//! Durable records of experiments, processes, tasks, and jobs.

use log::{debug, trace};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::model::{
    ErrorModel, ExperimentModel, JobModel, JobStatus, OutputDataObject, ProcessModel,
    ProcessState, TaskModel,
};
use crate::resource::{self, ComputeResource, StorageResource};
use crate::{Error, REGISTRY_FILE_NAME};

/// The record an error is attached to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorTarget {
    Experiment(String),
    Process(String),
    Task(String),
}

/// The registry contract.
///
/// Every write is safe to repeat with the same value. A write returns only
/// after the record is durable.
pub trait Registry: Send + Sync {
    /// Reload records written by other engine instances.
    fn refresh(&self) -> Result<(), Error> {
        Ok(())
    }

    fn compute_resource(&self, id: &str) -> Result<ComputeResource, Error>;

    fn storage_resource(&self, id: &str) -> Result<StorageResource, Error>;

    fn experiment(&self, experiment_id: &str) -> Result<ExperimentModel, Error>;

    fn process(&self, process_id: &str) -> Result<ProcessModel, Error>;

    /// Every process, oldest first.
    fn processes(&self) -> Result<Vec<ProcessModel>, Error>;

    fn process_state(&self, process_id: &str) -> Result<ProcessState, Error>;

    /// The tasks of a process in execution order.
    fn tasks(&self, process_id: &str) -> Result<Vec<TaskModel>, Error>;

    fn task(&self, task_id: &str) -> Result<TaskModel, Error>;

    /// The job of a process, if one was ever created.
    fn job(&self, process_id: &str) -> Result<Option<JobModel>, Error>;

    fn jobs(&self) -> Result<Vec<JobModel>, Error>;

    fn save_experiment(&self, experiment: &ExperimentModel) -> Result<(), Error>;

    fn save_process(&self, process: &ProcessModel) -> Result<(), Error>;

    /// Move a process to `state`.
    ///
    /// # Errors
    /// `gantry::Error::ProcessFinished` when the stored process is already in
    /// a different terminal state.
    ///
    fn save_process_state(&self, process_id: &str, state: ProcessState) -> Result<(), Error>;

    fn save_task(&self, task: &TaskModel) -> Result<(), Error>;

    fn save_job_model(&self, job: &JobModel) -> Result<(), Error>;

    /// Append a status to the job of `process_id`.
    ///
    /// Writing the latest status again does not append a duplicate. Nothing
    /// is appended once the job has reached a terminal state.
    fn save_job_status(&self, process_id: &str, status: &JobStatus) -> Result<(), Error>;

    fn add_error(&self, target: ErrorTarget, error: &ErrorModel) -> Result<(), Error>;

    fn save_experiment_output(
        &self,
        experiment_id: &str,
        output: &OutputDataObject,
    ) -> Result<(), Error>;

    fn save_process_output(&self, process_id: &str, output: &OutputDataObject) -> Result<(), Error>;
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
struct Records {
    experiments: HashMap<String, ExperimentModel>,
    processes: HashMap<String, ProcessModel>,
    tasks: HashMap<String, TaskModel>,
    /// Jobs keyed by process id.
    jobs: HashMap<String, JobModel>,
}

fn push_output(outputs: &mut Vec<OutputDataObject>, output: &OutputDataObject) {
    if !outputs
        .iter()
        .any(|o| o.name == output.name && o.value == output.value)
    {
        outputs.push(output.clone());
    }
}

/// A registry kept in memory and optionally mirrored to a postcard file.
///
/// Several engine instances may share one file. Every write holds an
/// exclusive lock on `registry.lock` and applies to the records on disk.
pub struct LocalRegistry {
    resources: resource::Configuration,
    records: Mutex<Records>,
    path: Option<PathBuf>,
}

impl LocalRegistry {
    /// A registry that is never written to disk.
    pub fn in_memory(resources: resource::Configuration) -> Self {
        LocalRegistry {
            resources,
            records: Mutex::new(Records::default()),
            path: None,
        }
    }

    /// Open the registry in `data_directory`, creating it when needed.
    ///
    /// # Errors
    /// Returns `Err(gantry::Error)` when the registry file cannot be read or parsed.
    ///
    pub fn open(data_directory: &Path, resources: resource::Configuration) -> Result<Self, Error> {
        let path = data_directory.join(REGISTRY_FILE_NAME);
        let records = Self::read_records(&path)?;

        Ok(LocalRegistry {
            resources,
            records: Mutex::new(records),
            path: Some(path),
        })
    }

    fn read_records(path: &Path) -> Result<Records, Error> {
        match fs::read(path) {
            Ok(bytes) => {
                debug!("Reading registry '{}'.", path.display());
                postcard::from_bytes(&bytes).map_err(|e| Error::PostcardParse(path.into(), e))
            }
            Err(error) => match error.kind() {
                io::ErrorKind::NotFound => {
                    trace!("'{}' not found, starting an empty registry.", path.display());
                    Ok(Records::default())
                }
                _ => Err(Error::FileRead(path.into(), error)),
            },
        }
    }

    fn read<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&Records) -> T,
    {
        let records = self.records.lock().expect("Registry lock is not poisoned");
        f(&records)
    }

    /// Take the exclusive lock that guards writes to `path`.
    fn lock_file(path: &Path) -> Result<Flock<File>, Error> {
        let lock_path = path.with_extension("lock");
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::DirectoryCreate(parent.into(), e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| Error::FileWrite(lock_path.clone(), e))?;

        trace!("Locking '{}'.", lock_path.display());
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| Error::RegistryLock(lock_path, errno))
    }

    /// Apply `f` to the latest records and persist the result before returning.
    ///
    /// The in-memory records change only after the write succeeds.
    fn update<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Records) -> Result<(), Error>,
    {
        let mut records = self.records.lock().expect("Registry lock is not poisoned");
        let _lock = self.path.as_deref().map(Self::lock_file).transpose()?;

        let mut updated = match &self.path {
            Some(path) => Self::read_records(path)?,
            None => records.clone(),
        };
        f(&mut updated)?;
        self.persist(&updated)?;

        *records = updated;
        Ok(())
    }

    fn persist(&self, records: &Records) -> Result<(), Error> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let out_bytes: Vec<u8> =
            postcard::to_stdvec(records).map_err(|e| Error::PostcardSerialize(path.clone(), e))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::DirectoryCreate(parent.into(), e))?;
        }

        // Write a sibling file and rename it so a crash never leaves a torn registry.
        let temporary = path.with_extension("postcard.partial");
        let mut file =
            File::create(&temporary).map_err(|e| Error::FileWrite(temporary.clone(), e))?;
        file.write_all(&out_bytes)
            .map_err(|e| Error::FileWrite(temporary.clone(), e))?;
        file.sync_all()
            .map_err(|e| Error::FileWrite(temporary.clone(), e))?;
        drop(file);

        fs::rename(&temporary, path).map_err(|e| Error::FileWrite(path.clone(), e))?;
        Ok(())
    }
}

impl Registry for LocalRegistry {
    fn refresh(&self) -> Result<(), Error> {
        if let Some(path) = &self.path {
            let records = Self::read_records(path)?;
            *self.records.lock().expect("Registry lock is not poisoned") = records;
        }
        Ok(())
    }

    fn compute_resource(&self, id: &str) -> Result<ComputeResource, Error> {
        self.resources.compute_resource(id).cloned()
    }

    fn storage_resource(&self, id: &str) -> Result<StorageResource, Error> {
        self.resources.storage_resource(id).cloned()
    }

    fn experiment(&self, experiment_id: &str) -> Result<ExperimentModel, Error> {
        self.read(|r| r.experiments.get(experiment_id).cloned())
            .ok_or_else(|| Error::RecordNotFound("Experiment", experiment_id.into()))
    }

    fn process(&self, process_id: &str) -> Result<ProcessModel, Error> {
        self.read(|r| r.processes.get(process_id).cloned())
            .ok_or_else(|| Error::RecordNotFound("Process", process_id.into()))
    }

    fn processes(&self) -> Result<Vec<ProcessModel>, Error> {
        let mut processes: Vec<ProcessModel> =
            self.read(|r| r.processes.values().cloned().collect());
        processes.sort_by(|a, b| {
            a.creation_time
                .cmp(&b.creation_time)
                .then_with(|| a.process_id.cmp(&b.process_id))
        });
        Ok(processes)
    }

    fn process_state(&self, process_id: &str) -> Result<ProcessState, Error> {
        self.read(|r| r.processes.get(process_id).map(|p| p.state))
            .ok_or_else(|| Error::RecordNotFound("Process", process_id.into()))
    }

    fn tasks(&self, process_id: &str) -> Result<Vec<TaskModel>, Error> {
        self.read(|r| {
            let process = r
                .processes
                .get(process_id)
                .ok_or_else(|| Error::RecordNotFound("Process", process_id.into()))?;
            process
                .task_order
                .iter()
                .map(|id| {
                    r.tasks
                        .get(id)
                        .cloned()
                        .ok_or_else(|| Error::RecordNotFound("Task", id.clone()))
                })
                .collect()
        })
    }

    fn task(&self, task_id: &str) -> Result<TaskModel, Error> {
        self.read(|r| r.tasks.get(task_id).cloned())
            .ok_or_else(|| Error::RecordNotFound("Task", task_id.into()))
    }

    fn job(&self, process_id: &str) -> Result<Option<JobModel>, Error> {
        Ok(self.read(|r| r.jobs.get(process_id).cloned()))
    }

    fn jobs(&self) -> Result<Vec<JobModel>, Error> {
        let mut jobs: Vec<JobModel> = self.read(|r| r.jobs.values().cloned().collect());
        jobs.sort_by(|a, b| {
            a.submitted_time
                .cmp(&b.submitted_time)
                .then_with(|| a.process_id.cmp(&b.process_id))
        });
        Ok(jobs)
    }

    fn save_experiment(&self, experiment: &ExperimentModel) -> Result<(), Error> {
        self.update(|r| {
            r.experiments
                .insert(experiment.experiment_id.clone(), experiment.clone());
            Ok(())
        })
    }

    fn save_process(&self, process: &ProcessModel) -> Result<(), Error> {
        self.update(|r| {
            r.processes
                .insert(process.process_id.clone(), process.clone());
            Ok(())
        })
    }

    fn save_process_state(&self, process_id: &str, state: ProcessState) -> Result<(), Error> {
        trace!("Process '{process_id}' is now {state}.");
        self.update(|r| {
            let process = r
                .processes
                .get_mut(process_id)
                .ok_or_else(|| Error::RecordNotFound("Process", process_id.into()))?;
            if process.state.is_terminal() && process.state != state {
                return Err(Error::ProcessFinished(process_id.into(), process.state));
            }
            process.state = state;
            Ok(())
        })
    }

    fn save_task(&self, task: &TaskModel) -> Result<(), Error> {
        self.update(|r| {
            r.tasks.insert(task.task_id.clone(), task.clone());
            Ok(())
        })
    }

    fn save_job_model(&self, job: &JobModel) -> Result<(), Error> {
        self.update(|r| {
            r.jobs.insert(job.process_id.clone(), job.clone());
            Ok(())
        })
    }

    fn save_job_status(&self, process_id: &str, status: &JobStatus) -> Result<(), Error> {
        self.update(|r| {
            let job = r
                .jobs
                .get_mut(process_id)
                .ok_or_else(|| Error::RecordNotFound("Job of process", process_id.into()))?;
            let latest = job.state();
            if latest.is_terminal() {
                if latest != status.state {
                    debug!(
                        "Job of process '{process_id}' is already {latest}, not recording {}.",
                        status.state
                    );
                }
            } else if !job.status().is_some_and(|last| last.same_as(status)) {
                job.statuses.push(status.clone());
            }
            Ok(())
        })
    }

    fn add_error(&self, target: ErrorTarget, error: &ErrorModel) -> Result<(), Error> {
        self.update(|r| {
            let errors = match &target {
                ErrorTarget::Experiment(id) => {
                    &mut r
                        .experiments
                        .get_mut(id)
                        .ok_or_else(|| Error::RecordNotFound("Experiment", id.clone()))?
                        .errors
                }
                ErrorTarget::Process(id) => {
                    &mut r
                        .processes
                        .get_mut(id)
                        .ok_or_else(|| Error::RecordNotFound("Process", id.clone()))?
                        .errors
                }
                ErrorTarget::Task(id) => {
                    &mut r
                        .tasks
                        .get_mut(id)
                        .ok_or_else(|| Error::RecordNotFound("Task", id.clone()))?
                        .errors
                }
            };
            if errors.last() != Some(error) {
                errors.push(error.clone());
            }
            Ok(())
        })
    }

    fn save_experiment_output(
        &self,
        experiment_id: &str,
        output: &OutputDataObject,
    ) -> Result<(), Error> {
        self.update(|r| {
            let experiment = r
                .experiments
                .get_mut(experiment_id)
                .ok_or_else(|| Error::RecordNotFound("Experiment", experiment_id.into()))?;
            push_output(&mut experiment.outputs, output);
            Ok(())
        })
    }

    fn save_process_output(&self, process_id: &str, output: &OutputDataObject) -> Result<(), Error> {
        self.update(|r| {
            let process = r
                .processes
                .get_mut(process_id)
                .ok_or_else(|| Error::RecordNotFound("Process", process_id.into()))?;
            push_output(&mut process.outputs, output);
            Ok(())
        })
    }
}
