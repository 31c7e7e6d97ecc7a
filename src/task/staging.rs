// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use chrono::Utc;
use log::{debug, trace, warn};
use std::path::Path;
use std::thread;
use url::Url;

use crate::context::{ProcessContext, TaskContext};
use crate::model::{
    DataStagingTaskModel, DataType, OutputDataObject, ProcessState, StagingKind, TaskDetail,
    TaskStatus, TaskType,
};
use crate::session::{quote, Direction};
use crate::settings::EngineSettings;
use crate::task::{archive, run_task, terminal_status, Task};
use crate::{Error, TransferSide, DUMMY_HOST};

/// A file named by a URI or an absolute path on the engine host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Location {
    pub host: String,
    pub user: Option<String>,
    pub path: String,
}

impl Location {
    /// Parse `scp://user@host/path`, `dummy://dummy/`, or `/path`.
    ///
    /// # Errors
    /// `gantry::Error::InvalidUri` when the location cannot be parsed.
    ///
    pub(crate) fn parse(uri: &str) -> Result<Self, Error> {
        if uri.starts_with('/') {
            return Ok(Location {
                host: String::new(),
                user: None,
                path: uri.into(),
            });
        }

        let invalid = |message: String| Error::InvalidUri(uri.into(), message);
        let url = Url::parse(uri).map_err(|e| invalid(e.to_string()))?;
        let host = url.host_str().unwrap_or_default().to_string();

        // A '?' in a file name pattern parses as the start of a query.
        let mut path = urlencoding::decode(url.path())
            .map_err(|e| invalid(e.to_string()))?
            .into_owned();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        if host != DUMMY_HOST && !path.starts_with('/') {
            return Err(invalid("expected an absolute path".into()));
        }

        let user = match url.username() {
            "" => None,
            name => Some(
                urlencoding::decode(name)
                    .map_err(|e| invalid(e.to_string()))?
                    .into_owned(),
            ),
        };

        Ok(Location { host, user, path })
    }

    pub(crate) fn is_placeholder(&self) -> bool {
        self.host == DUMMY_HOST
    }

    /// The same host with another path.
    pub(crate) fn with_path(&self, path: String) -> Self {
        Location {
            path,
            ..self.clone()
        }
    }

    /// Render as a URI, or as a bare path on the engine host.
    pub(crate) fn to_uri(&self) -> Result<String, Error> {
        if self.host.is_empty() {
            return Ok(self.path.clone());
        }
        location_uri(self.user.as_deref(), &self.host, &self.path)
    }
}

/// Build `scp://user@host/path` with the path percent-encoded.
pub(crate) fn location_uri(user: Option<&str>, host: &str, path: &str) -> Result<String, Error> {
    let invalid = |message: &str| Error::InvalidUri(format!("{host}:{path}"), message.into());
    let mut url = Url::parse(&format!("scp://{host}")).map_err(|e| invalid(&e.to_string()))?;
    if let Some(user) = user {
        url.set_username(user)
            .map_err(|()| invalid("cannot hold a user name"))?;
    }
    url.set_path(path);
    Ok(url.to_string())
}

pub(crate) fn has_wildcard(path: &str) -> bool {
    path.contains(|c| c == '*' || c == '?')
}

/// Split a path into its directory and file name.
pub(crate) fn split_path(path: &str) -> (String, String) {
    let path = Path::new(path);
    let directory = path
        .parent()
        .map_or_else(|| "/".into(), |p| p.to_string_lossy().into_owned());
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    (directory, name)
}

pub(crate) fn join(directory: &str, name: &str) -> String {
    Path::new(directory).join(name).to_string_lossy().into_owned()
}

/// Fail unless the process is in `expected`.
pub(crate) fn check_phase(context: &TaskContext, expected: ProcessState) -> Result<(), Error> {
    let state = context.process.process.state;
    if state == expected {
        Ok(())
    } else {
        Err(Error::InvalidProcessState(
            context.task_id().into(),
            state.to_string(),
        ))
    }
}

/// A copy of the staging sub-model of the task.
pub(crate) fn staging_model(context: &TaskContext) -> Result<DataStagingTaskModel, Error> {
    context.task.staging().cloned().ok_or_else(|| {
        Error::UnexpectedTaskType(
            context.task_id().into(),
            context.task.task_type.to_string(),
            TaskType::DataStaging.to_string(),
        )
    })
}

/// Replace the staging sub-model of the task and persist the task.
pub(crate) fn store(context: &mut TaskContext, staging: DataStagingTaskModel) -> Result<(), Error> {
    context.task.detail = TaskDetail::DataStaging(staging);
    context.save_task()
}

/// Resolve a placeholder destination to `file_name` in the process's output
/// directory on the storage resource, and persist the result.
pub(crate) fn resolve_destination(
    context: &mut TaskContext,
    staging: &mut DataStagingTaskModel,
    file_name: &str,
) -> Result<Location, Error> {
    let destination =
        Location::parse(&staging.destination).map_err(|e| e.on_side(TransferSide::Destination))?;
    if !destination.is_placeholder() {
        return Ok(destination);
    }

    let storage = &context.process.storage;
    let path = Path::new(&storage.file_system_root)
        .join(context.process.process.output_directory())
        .join(file_name)
        .to_string_lossy()
        .into_owned();
    let resolved = Location {
        host: storage.host_name.clone(),
        user: Some(storage.login_user()),
        path,
    };
    staging.destination = resolved.to_uri()?;
    debug!(
        "{}: resolved the destination to '{}'.",
        context.describe(),
        staging.destination
    );
    store(context, staging.clone())?;
    Ok(resolved)
}

/// Create the parent directory of `destination` on its host.
pub(crate) fn make_parent_directory(
    process: &ProcessContext,
    destination: &Location,
) -> Result<String, Error> {
    let (directory, _) = split_path(&destination.path);
    process
        .key_for_host(&destination.host)
        .and_then(|key| process.session(&key))
        .and_then(|mut session| session.make_directory(&directory))
        .map_err(|e| e.on_side(TransferSide::Destination))?;
    Ok(directory)
}

/// Copy one file between any two hosts the process can reach.
///
/// Files on the same host under the same identity are copied with a single
/// command on that host. Otherwise the file streams directly between the two
/// hosts, never through the engine's disk unless the engine is one of them.
pub(crate) fn transfer(
    process: &ProcessContext,
    source: &Location,
    destination: &Location,
    delete_source_after: bool,
) -> Result<(), Error> {
    let source_key = process
        .key_for_host(&source.host)
        .map_err(|e| e.on_side(TransferSide::Source))?;
    let destination_key = process
        .key_for_host(&destination.host)
        .map_err(|e| e.on_side(TransferSide::Destination))?;

    if source_key == destination_key {
        if source.path == destination.path {
            trace!("'{}' is already in place.", source.path);
            return Ok(());
        }

        let (directory, _) = split_path(&destination.path);
        let (from, to) = (quote(&source.path), quote(&destination.path));
        let mut command = format!(
            "mkdir -p {} && (rsync -a {from} {to} || cp -p {from} {to})",
            quote(&directory)
        );
        if delete_source_after {
            command.push_str(&format!(" && rm -f {from}"));
        }
        debug!("Copying '{}' to '{}' on '{}'.", source.path, destination.path, source_key.host);
        process
            .session(&source_key)?
            .run(&command)
            .map_err(|e| e.on_side(TransferSide::Destination))?;
        return Ok(());
    }

    let compute_key = process.compute_key();
    if destination_key == compute_key {
        let mut peer = process
            .session(&source_key)
            .map_err(|e| e.on_side(TransferSide::Source))?;
        let mut cluster = process
            .remote_cluster()
            .map_err(|e| e.on_side(TransferSide::Destination))?;
        cluster.third_party_transfer(
            &destination.path,
            &mut *peer,
            &source.path,
            Direction::To,
            delete_source_after,
        )
    } else if source_key == compute_key {
        let mut peer = process
            .session(&destination_key)
            .map_err(|e| e.on_side(TransferSide::Destination))?;
        let mut cluster = process
            .remote_cluster()
            .map_err(|e| e.on_side(TransferSide::Source))?;
        cluster.third_party_transfer(
            &source.path,
            &mut *peer,
            &destination.path,
            Direction::From,
            delete_source_after,
        )
    } else {
        let mut from = process
            .session(&source_key)
            .map_err(|e| e.on_side(TransferSide::Source))?;
        let mut to = process
            .session(&destination_key)
            .map_err(|e| e.on_side(TransferSide::Destination))?;
        from.send_to(&source.path, &mut *to, &destination.path)?;
        if delete_source_after {
            from.remove_file(&source.path)
                .map_err(|e| e.on_side(TransferSide::Source))?;
        }
        Ok(())
    }
}

fn missing_value(what: &str, name: &str, required: bool) -> Error {
    if required {
        Error::RequiredValueMissing(what.into(), name.into())
    } else {
        Error::OptionalValueMissing(what.into(), name.into())
    }
}

/// Move input files to the compute resource before the job runs, and
/// output files to storage after it finishes.
///
/// The process state selects the direction.
#[derive(Default)]
pub struct DataStagingTask {
    settings: EngineSettings,
}

impl DataStagingTask {
    fn run(&self, context: &mut TaskContext) -> Result<TaskStatus, Error> {
        context.begin()?;
        let staging = staging_model(context)?;
        match staging.kind {
            StagingKind::Input => self.stage_input(context, staging),
            StagingKind::Output => self.stage_output(context, staging),
            StagingKind::ArchiveOutput => archive::stage_archive(context, staging),
        }
    }

    fn stage_input(
        &self,
        context: &mut TaskContext,
        mut staging: DataStagingTaskModel,
    ) -> Result<TaskStatus, Error> {
        check_phase(context, ProcessState::InputDataStaging)?;
        if let Some(input) = &staging.process_input {
            if input.value.as_deref().map_or(true, str::is_empty) {
                return Err(missing_value("input", &input.name, input.is_required));
            }
        }
        if has_wildcard(&staging.source) {
            return Err(Error::WildcardNotSupported(staging.source));
        }

        let source =
            Location::parse(&staging.source).map_err(|e| e.on_side(TransferSide::Source))?;
        let destination = Location::parse(&staging.destination)
            .map_err(|e| e.on_side(TransferSide::Destination))?;

        let size = context
            .process
            .key_for_host(&source.host)
            .and_then(|key| context.process.session(&key))
            .and_then(|mut session| session.file_size(&source.path))
            .map_err(|e| e.on_side(TransferSide::Source))?;
        if size == 0 {
            return Err(Error::EmptyInput(staging.source).on_side(TransferSide::Source));
        }

        debug!(
            "{}: staging '{}' to '{}'.",
            context.describe(),
            staging.source,
            staging.destination
        );
        staging.transfer_start_time = Some(Utc::now());
        transfer(context.process, &source, &destination, false)?;
        staging.transfer_end_time = Some(Utc::now());

        store(context, staging)?;
        context.complete(None)
    }

    /// Names in `directory` that the job produced, checking again with a
    /// linear backoff while there are none.
    fn wait_for_source(
        &self,
        context: &TaskContext,
        source: &Location,
        directory: &str,
        pattern: &str,
    ) -> Result<Vec<String>, Error> {
        let key = context.process.key_for_host(&source.host)?;
        let attempts = self.settings.output_wait_attempts.max(1);
        for attempt in 1..=attempts {
            let mut session = context.process.session(&key)?;
            let found = if has_wildcard(pattern) {
                session.list_files_matching(pattern, directory)?
            } else if session.file_exists(&source.path)? {
                vec![pattern.to_string()]
            } else {
                Vec::new()
            };
            drop(session);

            if !found.is_empty() {
                return Ok(found);
            }
            if attempt < attempts {
                debug!(
                    "{}: '{}' is not there yet (check {attempt}/{attempts}).",
                    context.describe(),
                    source.path
                );
                thread::sleep(self.settings.output_wait_backoff * attempt);
            }
        }
        Ok(Vec::new())
    }

    fn stage_output(
        &self,
        context: &mut TaskContext,
        mut staging: DataStagingTaskModel,
    ) -> Result<TaskStatus, Error> {
        check_phase(context, ProcessState::OutputDataStaging)?;
        let output = staging.process_output.clone();
        if let Some(output) = &output {
            if output.value.as_deref().map_or(true, str::is_empty) {
                return Err(missing_value("output", &output.name, output.is_required));
            }
        }

        let source =
            Location::parse(&staging.source).map_err(|e| e.on_side(TransferSide::Source))?;
        let (directory, pattern) = split_path(&source.path);
        let wildcard = has_wildcard(&pattern);
        let destination = resolve_destination(context, &mut staging, &pattern)?;

        let mut names = self
            .wait_for_source(context, &source, &directory, &pattern)
            .map_err(|e| e.on_side(TransferSide::Source))?;
        if names.is_empty() {
            if output.as_ref().map_or(true, |o| o.is_required) {
                return Err(Error::OutputMissing(staging.source).on_side(TransferSide::Source));
            }
            warn!(
                "{}: optional output '{}' was not produced.",
                context.describe(),
                staging.source
            );
            return context.complete(Some("optional output was not produced"));
        }

        let data_type = output.as_ref().map_or(DataType::Uri, |o| o.data_type);
        if wildcard && data_type != DataType::UriCollection && names.len() > 1 {
            warn!(
                "{}: '{pattern}' matches {} files, staging only '{}'.",
                context.describe(),
                names.len(),
                names[0]
            );
            names.truncate(1);
        }

        let destination_directory = make_parent_directory(context.process, &destination)?;

        staging.transfer_start_time = Some(Utc::now());
        for name in &names {
            let from = source.with_path(join(&directory, name));
            let to = if wildcard {
                destination.with_path(join(&destination_directory, name))
            } else {
                destination.clone()
            };
            debug!("{}: staging '{}' to '{}'.", context.describe(), from.path, to.path);
            transfer(context.process, &from, &to, false)?;

            if let Some(output) = &output {
                let record = OutputDataObject {
                    value: Some(to.to_uri()?),
                    ..output.clone()
                };
                self.record_output(context, &record)?;
                staging.process_output = Some(record);
            }
        }
        staging.transfer_end_time = Some(Utc::now());
        store(context, staging)?;

        if context.process.process.clean_after_staged {
            clean(context, &source, &directory, &names);
        }
        context.complete(None)
    }

    /// Persist the staged location on the process and on the experiment.
    fn record_output(&self, context: &mut TaskContext, record: &OutputDataObject) -> Result<(), Error> {
        let process = &mut context.process.process;
        process
            .outputs
            .retain(|o| !(o.name == record.name && o.value == record.value));
        process.outputs.push(record.clone());

        let registry = &context.process.registry;
        registry.save_process_output(&context.process.process.process_id, record)?;
        registry.save_experiment_output(&context.process.process.experiment_id, record)
    }
}

/// Delete staged sources and their directory once it is empty.
///
/// Failures are logged and otherwise ignored.
fn clean(context: &TaskContext, source: &Location, directory: &str, names: &[String]) {
    let result = context
        .process
        .key_for_host(&source.host)
        .and_then(|key| context.process.session(&key))
        .and_then(|mut session| {
            for name in names {
                session.remove_file(&join(directory, name))?;
            }
            session.execute(&format!("rmdir {}", quote(directory)))
        });
    match result {
        Ok(output) if !output.success() => {
            trace!("'{directory}' is not empty: {}", output.message());
        }
        Ok(_) => debug!("{}: removed '{directory}'.", context.describe()),
        Err(error) => warn!("{}: unable to clean up: {error}", context.describe()),
    }
}

impl Task for DataStagingTask {
    fn init(&mut self, settings: &EngineSettings) {
        self.settings = settings.clone();
    }

    fn execute(&mut self, context: &mut TaskContext) -> TaskStatus {
        run_task(TaskType::DataStaging, context, |context| self.run(context))
    }

    fn recover(&mut self, context: &mut TaskContext) -> TaskStatus {
        // Transfers overwrite their destination, so unfinished staging reruns.
        terminal_status(context).unwrap_or_else(|| self.execute(context))
    }

    fn task_type(&self) -> TaskType {
        TaskType::DataStaging
    }
}
