// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

//! Remote execution sessions.
//!
//! A session runs shell commands and copies files on one host. Sessions are
//! not safe for concurrent use: callers lease one from the `SessionPool` for
//! each logical sequence of operations and return it by dropping the lease.

use log::{debug, trace, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use shell_quote::Quote;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::io;
use std::ops::{Deref, DerefMut};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use wildmatch::WildMatch;

use crate::credential::{Credential, CredentialStore};
use crate::resource::Protocol;
use crate::{Error, TransferSide};

/// Quote a value for bash.
pub(crate) fn quote(value: &str) -> String {
    <shell_quote::Bash as Quote<String>>::quote(value)
}

/// Describe a failed exit status.
fn status_message(status: ExitStatus) -> String {
    match status.code() {
        None => match status.signal() {
            None => "terminated by a unknown signal".to_string(),
            Some(signal) => format!("terminated by signal {signal}"),
        },
        Some(code) => format!("exited with code {code}"),
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// The result of one remote command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Standard error when there is any, the exit code otherwise.
    pub fn message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("exited with code {}", self.exit_code)
        } else {
            stderr.to_string()
        }
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        CommandOutput {
            exit_code: exit_code(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Direction of a third-party transfer, relative to the compute resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// From the peer host to the compute resource.
    To,
    /// From the compute resource to the peer host.
    From,
}

/// A connection to one host that can run commands and copy files.
pub trait RemoteSession: Send {
    fn host(&self) -> &str;

    fn user(&self) -> &str;

    /// Run a shell command and capture its output.
    ///
    /// A non-zero exit code is reported in the output, not as an error.
    ///
    /// # Errors
    /// Returns `Err(gantry::Error)` when the command cannot be run at all.
    fn execute(&mut self, command: &str) -> Result<CommandOutput, Error>;

    /// Start a shell command with stdin, stdout, and stderr piped.
    fn spawn(&mut self, command: &str) -> Result<Child, Error>;

    /// Copy a file from the engine host to this host.
    fn copy_to(&mut self, local: &Path, remote: &str) -> Result<(), Error>;

    /// Copy a file from this host to the engine host.
    fn copy_from(&mut self, remote: &str, local: &Path) -> Result<(), Error>;

    /// Run a command that must succeed.
    fn run(&mut self, command: &str) -> Result<CommandOutput, Error> {
        let output = self.execute(command)?;
        if output.success() {
            Ok(output)
        } else {
            Err(Error::RemoteCommand(
                self.host().into(),
                command.into(),
                output.message(),
            ))
        }
    }

    fn make_directory(&mut self, path: &str) -> Result<(), Error> {
        self.run(&format!("mkdir -p {}", quote(path))).map(|_| ())
    }

    fn remove_file(&mut self, path: &str) -> Result<(), Error> {
        self.run(&format!("rm -f {}", quote(path))).map(|_| ())
    }

    /// Names of the entries in `directory` that match the wildcard `pattern`.
    ///
    /// Matching happens here, not in a remote shell glob.
    fn list_files_matching(&mut self, pattern: &str, directory: &str) -> Result<Vec<String>, Error> {
        let output = self.run(&format!("ls -1A {}", quote(directory)))?;
        let matcher = WildMatch::new(pattern);
        let mut names: Vec<String> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty() && matcher.matches(name))
            .map(String::from)
            .collect();
        names.sort();
        trace!(
            "{} entries in '{}' match '{}' on '{}'.",
            names.len(),
            directory,
            pattern,
            self.host()
        );
        Ok(names)
    }

    fn file_exists(&mut self, path: &str) -> Result<bool, Error> {
        let command = format!("test -e {}", quote(path));
        let output = self.execute(&command)?;
        match output.exit_code {
            0 => Ok(true),
            1 => Ok(false),
            _ => Err(Error::RemoteCommand(
                self.host().into(),
                command,
                output.message(),
            )),
        }
    }

    fn file_size(&mut self, path: &str) -> Result<u64, Error> {
        let command = format!("stat -c %s {}", quote(path));
        let output = self.run(&command)?;
        output.stdout.trim().parse::<u64>().map_err(|_| {
            Error::RemoteCommand(
                self.host().into(),
                command,
                format!("unexpected output '{}'", output.stdout.trim()),
            )
        })
    }

    /// Stream a file from this host directly to `peer`.
    ///
    /// The source is read by `cat` on this host and written by `cat` on the
    /// peer. Succeeds only when both ends exit successfully. Errors name the
    /// side of the transfer that failed.
    fn send_to(&mut self, path: &str, peer: &mut dyn RemoteSession, peer_path: &str) -> Result<(), Error> {
        let source_name = format!("{}:{path}", self.host());
        let destination_name = format!("{}:{peer_path}", peer.host());
        debug!("Streaming {source_name} to {destination_name}.");
        let transfer_error = |side: TransferSide, message: String| {
            Error::Transfer(source_name.clone(), destination_name.clone(), message).on_side(side)
        };

        let mut reader = self
            .spawn(&format!("cat {}", quote(path)))
            .map_err(|e| e.on_side(TransferSide::Source))?;
        let mut writer = match peer.spawn(&format!("cat > {}", quote(peer_path))) {
            Ok(writer) => writer,
            Err(error) => {
                terminate(&reader)?;
                let _ = reader.wait();
                return Err(error.on_side(TransferSide::Destination));
            }
        };
        drop(reader.stdin.take());

        let mut source = reader.stdout.take().expect("Piped stdout");
        let mut sink = writer.stdin.take().expect("Piped stdin");
        let copied = io::copy(&mut source, &mut sink);
        drop(sink);
        drop(source);

        if copied.is_err() {
            // The writer went away, stop the reader instead of leaving it blocked.
            terminate(&reader)?;
        }

        let read = reader
            .wait_with_output()
            .map_err(|e| Error::SpawnProcess("cat".into(), e).on_side(TransferSide::Source))?;
        let written = writer
            .wait_with_output()
            .map_err(|e| Error::SpawnProcess("cat".into(), e).on_side(TransferSide::Destination))?;

        if !written.status.success() {
            let message = format!(
                "{}: {}",
                status_message(written.status),
                String::from_utf8_lossy(&written.stderr).trim()
            );
            return Err(transfer_error(TransferSide::Destination, message));
        }
        if !read.status.success() {
            let message = format!(
                "{}: {}",
                status_message(read.status),
                String::from_utf8_lossy(&read.stderr).trim()
            );
            return Err(transfer_error(TransferSide::Source, message));
        }
        if let Err(error) = copied {
            return Err(transfer_error(TransferSide::Destination, error.to_string()));
        }

        Ok(())
    }
}

/// Send SIGTERM to a child that may have already exited.
fn terminate(child: &Child) -> Result<(), Error> {
    #[allow(clippy::cast_possible_wrap)]
    match signal::kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(error) => Err(error.into()),
    }
}

/// Run commands on the engine host with `bash -c`.
pub struct LocalSession {
    host: String,
    user: String,
}

impl LocalSession {
    pub fn new(host: &str, user: &str) -> Self {
        LocalSession {
            host: host.into(),
            user: user.into(),
        }
    }
}

impl RemoteSession for LocalSession {
    fn host(&self) -> &str {
        &self.host
    }

    fn user(&self) -> &str {
        &self.user
    }

    fn execute(&mut self, command: &str) -> Result<CommandOutput, Error> {
        trace!("Executing '{command}' locally.");
        let output = Command::new("bash")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::SpawnProcess("bash".into(), e))?;
        Ok(output.into())
    }

    fn spawn(&mut self, command: &str) -> Result<Child, Error> {
        Command::new("bash")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::SpawnProcess("bash".into(), e))
    }

    fn copy_to(&mut self, local: &Path, remote: &str) -> Result<(), Error> {
        fs::copy(local, remote)
            .map(|_| ())
            .map_err(|e| Error::Transfer(local.display().to_string(), remote.into(), e.to_string()))
    }

    fn copy_from(&mut self, remote: &str, local: &Path) -> Result<(), Error> {
        fs::copy(remote, local)
            .map(|_| ())
            .map_err(|e| Error::Transfer(remote.into(), local.display().to_string(), e.to_string()))
    }
}

/// Run commands through the OpenSSH client.
///
/// Connections are multiplexed with `ControlMaster`, so a session that is
/// reused from the pool does not authenticate again.
pub struct SshSession {
    host: String,
    port: u16,
    user: String,
    credential: Option<Credential>,
}

impl SshSession {
    pub fn new(host: &str, port: u16, user: &str, credential: Option<Credential>) -> Self {
        SshSession {
            host: host.into(),
            port,
            user: user.into(),
            credential,
        }
    }

    fn destination(&self) -> String {
        if self.user.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.user, self.host)
        }
    }

    /// Build an `ssh` or `scp` command with authentication options.
    fn command(&self, program: &str, port_flag: &str) -> Command {
        let mut command = match &self.credential {
            Some(Credential::Password { password }) => {
                let mut command = Command::new("sshpass");
                command.arg("-e").arg(program).env("SSHPASS", password);
                command
            }
            Some(Credential::KeyPair {
                passphrase: Some(passphrase),
                ..
            }) => {
                let mut command = Command::new("sshpass");
                command
                    .args(["-P", "passphrase", "-e"])
                    .arg(program)
                    .env("SSHPASS", passphrase);
                command
            }
            _ => {
                let mut command = Command::new(program);
                command.args(["-o", "BatchMode=yes"]);
                command
            }
        };

        let control_path = env::temp_dir().join("gantry-ssh-%C");
        command
            .args(["-o", "ControlMaster=auto"])
            .arg("-o")
            .arg(format!("ControlPath={}", control_path.display()))
            .args(["-o", "ControlPersist=60"])
            .args(["-o", "StrictHostKeyChecking=accept-new"])
            .arg(port_flag)
            .arg(self.port.to_string());

        if let Some(Credential::KeyPair { private_key, .. }) = &self.credential {
            command.arg("-i").arg(private_key);
        }
        command
    }

    /// Classify a failed ssh or scp invocation.
    fn failure(&self, what: &str, output: &CommandOutput) -> Error {
        let stderr = output.stderr.trim();
        if output.exit_code == 255
            && (stderr.contains("Permission denied") || stderr.contains("Authentication failed"))
        {
            Error::Authentication(self.host.clone(), self.user.clone(), stderr.into())
        } else {
            Error::RemoteCommand(self.host.clone(), what.into(), output.message())
        }
    }
}

impl RemoteSession for SshSession {
    fn host(&self) -> &str {
        &self.host
    }

    fn user(&self) -> &str {
        &self.user
    }

    fn execute(&mut self, command: &str) -> Result<CommandOutput, Error> {
        trace!("Executing '{command}' on '{}'.", self.host);
        let output: CommandOutput = self
            .command("ssh", "-p")
            .arg(self.destination())
            .arg("--")
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::SpawnProcess("ssh".into(), e))?
            .into();

        // ssh exits with 255 only when the connection itself failed.
        if output.exit_code == 255 {
            return Err(self.failure(command, &output));
        }
        Ok(output)
    }

    fn spawn(&mut self, command: &str) -> Result<Child, Error> {
        self.command("ssh", "-p")
            .arg(self.destination())
            .arg("--")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::SpawnProcess("ssh".into(), e))
    }

    fn copy_to(&mut self, local: &Path, remote: &str) -> Result<(), Error> {
        let output: CommandOutput = self
            .command("scp", "-P")
            .arg(local)
            .arg(format!("{}:{}", self.destination(), remote))
            .output()
            .map_err(|e| Error::SpawnProcess("scp".into(), e))?
            .into();
        if output.success() {
            Ok(())
        } else {
            Err(self.failure(&format!("scp {} {remote}", local.display()), &output))
        }
    }

    fn copy_from(&mut self, remote: &str, local: &Path) -> Result<(), Error> {
        let output: CommandOutput = self
            .command("scp", "-P")
            .arg(format!("{}:{}", self.destination(), remote))
            .arg(local)
            .output()
            .map_err(|e| Error::SpawnProcess("scp".into(), e))?
            .into();
        if output.success() {
            Ok(())
        } else {
            Err(self.failure(&format!("scp {remote} {}", local.display()), &output))
        }
    }
}

/// Identifies sessions that may be reused for one another.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub credential_token: Option<String>,
}

/// Open new sessions.
pub trait SessionFactory: Send + Sync {
    fn open(&self, key: &SessionKey) -> Result<Box<dyn RemoteSession>, Error>;
}

/// Open `LocalSession` and `SshSession` instances.
///
/// Credentials are resolved when the session is opened.
pub struct CliSessionFactory {
    credentials: Arc<dyn CredentialStore>,
}

impl CliSessionFactory {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        CliSessionFactory { credentials }
    }
}

impl SessionFactory for CliSessionFactory {
    fn open(&self, key: &SessionKey) -> Result<Box<dyn RemoteSession>, Error> {
        match key.protocol {
            Protocol::Local => Ok(Box::new(LocalSession::new(&key.host, &key.user))),
            Protocol::Ssh => {
                let credential = match &key.credential_token {
                    Some(token) => Some(self.credentials.credential(token, &key.host, &key.user)?),
                    None => None,
                };
                debug!("Opening ssh session to {}@{}:{}.", key.user, key.host, key.port);
                Ok(Box::new(SshSession::new(
                    &key.host, key.port, &key.user, credential,
                )))
            }
        }
    }
}

#[derive(Default)]
struct Slot {
    idle: Vec<Box<dyn RemoteSession>>,
    leased: usize,
}

/// Reuse sessions per (host, credential) pair.
///
/// At most `max_sessions_per_key` sessions are leased for one key at a time.
/// `acquire` blocks until one is returned when the limit is reached.
pub struct SessionPool {
    factory: Box<dyn SessionFactory>,
    max_sessions_per_key: usize,
    slots: Mutex<HashMap<SessionKey, Slot>>,
    returned: Condvar,
}

impl SessionPool {
    pub fn new(factory: Box<dyn SessionFactory>, max_sessions_per_key: usize) -> Self {
        SessionPool {
            factory,
            max_sessions_per_key: max_sessions_per_key.max(1),
            slots: Mutex::new(HashMap::new()),
            returned: Condvar::new(),
        }
    }

    /// Lease a session for `key`.
    ///
    /// # Errors
    /// Returns `Err(gantry::Error)` when a new session cannot be opened.
    ///
    pub fn acquire(self: &Arc<Self>, key: &SessionKey) -> Result<PooledSession, Error> {
        let mut slots = self.slots.lock().expect("Session pool lock is not poisoned");
        loop {
            let slot = slots.entry(key.clone()).or_default();
            if let Some(session) = slot.idle.pop() {
                slot.leased += 1;
                trace!("Reusing session to '{}'.", key.host);
                return Ok(PooledSession {
                    session: Some(session),
                    pool: Some(Arc::clone(self)),
                    key: key.clone(),
                });
            }
            if slot.leased < self.max_sessions_per_key {
                slot.leased += 1;
                break;
            }
            trace!("Waiting for a session to '{}'.", key.host);
            slots = self
                .returned
                .wait(slots)
                .expect("Session pool lock is not poisoned");
        }
        drop(slots);

        match self.factory.open(key) {
            Ok(session) => Ok(PooledSession {
                session: Some(session),
                pool: Some(Arc::clone(self)),
                key: key.clone(),
            }),
            Err(error) => {
                self.release(key, None);
                Err(error)
            }
        }
    }

    fn release(&self, key: &SessionKey, session: Option<Box<dyn RemoteSession>>) {
        let mut slots = self.slots.lock().expect("Session pool lock is not poisoned");
        if let Some(slot) = slots.get_mut(key) {
            slot.leased = slot.leased.saturating_sub(1);
            if let Some(session) = session {
                slot.idle.push(session);
            }
        } else {
            warn!("Returned a session to '{}' that the pool never leased.", key.host);
        }
        drop(slots);
        self.returned.notify_one();
    }

    /// Number of idle sessions kept for `key`.
    pub fn idle_count(&self, key: &SessionKey) -> usize {
        self.slots
            .lock()
            .expect("Session pool lock is not poisoned")
            .get(key)
            .map_or(0, |slot| slot.idle.len())
    }
}

/// A leased session. Returned to its pool on drop.
pub struct PooledSession {
    session: Option<Box<dyn RemoteSession>>,
    pool: Option<Arc<SessionPool>>,
    key: SessionKey,
}

impl PooledSession {
    /// Wrap a session that belongs to no pool.
    pub fn detached(session: Box<dyn RemoteSession>) -> Self {
        let key = SessionKey {
            protocol: Protocol::Local,
            host: session.host().into(),
            port: 0,
            user: session.user().into(),
            credential_token: None,
        };
        PooledSession {
            session: Some(session),
            pool: None,
            key,
        }
    }
}

impl Deref for PooledSession {
    type Target = dyn RemoteSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_deref().expect("Session is present until drop")
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
            .as_deref_mut()
            .expect("Session is present until drop")
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let (Some(pool), Some(session)) = (self.pool.take(), self.session.take()) {
            pool.release(&self.key, Some(session));
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! A scripted session that records what it is asked to do.

    use super::*;
    use std::collections::{HashSet, VecDeque};

    #[derive(Default)]
    pub(crate) struct MockState {
        /// `(host, command)` for every executed command.
        pub commands: Vec<(String, String)>,
        /// Responses by command substring. The last response repeats.
        pub responses: Vec<(String, VecDeque<CommandOutput>)>,
        /// `(source host, source path, destination host, destination path)`.
        pub transfers: Vec<(String, String, String, String)>,
        /// `(host, local path, remote path)` for `copy_to`.
        pub copies: Vec<(String, String, String)>,
        /// Paths that `test -e` reports missing.
        pub missing: HashSet<String>,
        /// Fail every transfer with this message.
        pub transfer_failure: Option<String>,
        /// Sessions opened by the factory.
        pub opened: usize,
    }

    impl MockState {
        pub fn respond(&mut self, pattern: &str, output: CommandOutput) {
            if let Some((_, queue)) = self.responses.iter_mut().find(|(p, _)| p == pattern) {
                queue.push_back(output);
            } else {
                self.responses
                    .push((pattern.into(), VecDeque::from([output])));
            }
        }

        pub fn count(&self, pattern: &str) -> usize {
            self.commands
                .iter()
                .filter(|(_, command)| command.contains(pattern))
                .count()
        }

        fn output_for(&mut self, command: &str) -> CommandOutput {
            if let Some(path) = command.strip_prefix("test -e ") {
                let missing = self.missing.contains(path);
                return CommandOutput {
                    exit_code: i32::from(missing),
                    ..CommandOutput::default()
                };
            }

            for (pattern, queue) in &mut self.responses {
                if command.contains(pattern.as_str()) {
                    return if queue.len() > 1 {
                        queue.pop_front().unwrap_or_default()
                    } else {
                        queue.front().cloned().unwrap_or_default()
                    };
                }
            }

            if command.starts_with("stat -c %s") {
                return ok("1024\n");
            }
            CommandOutput::default()
        }
    }

    pub(crate) fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub(crate) fn fail(exit_code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub(crate) struct MockSession {
        host: String,
        user: String,
        state: Arc<Mutex<MockState>>,
    }

    impl MockSession {
        pub fn new(host: &str, user: &str, state: Arc<Mutex<MockState>>) -> Self {
            MockSession {
                host: host.into(),
                user: user.into(),
                state,
            }
        }
    }

    impl RemoteSession for MockSession {
        fn host(&self) -> &str {
            &self.host
        }

        fn user(&self) -> &str {
            &self.user
        }

        fn execute(&mut self, command: &str) -> Result<CommandOutput, Error> {
            let mut state = self.state.lock().unwrap();
            state.commands.push((self.host.clone(), command.into()));
            Ok(state.output_for(command))
        }

        fn spawn(&mut self, command: &str) -> Result<Child, Error> {
            Err(Error::SpawnProcess(
                command.into(),
                io::Error::new(io::ErrorKind::Unsupported, "mock session"),
            ))
        }

        fn copy_to(&mut self, local: &Path, remote: &str) -> Result<(), Error> {
            self.state.lock().unwrap().copies.push((
                self.host.clone(),
                local.display().to_string(),
                remote.into(),
            ));
            Ok(())
        }

        fn copy_from(&mut self, _remote: &str, _local: &Path) -> Result<(), Error> {
            Ok(())
        }

        fn send_to(
            &mut self,
            path: &str,
            peer: &mut dyn RemoteSession,
            peer_path: &str,
        ) -> Result<(), Error> {
            let mut state = self.state.lock().unwrap();
            if let Some(message) = &state.transfer_failure {
                return Err(Error::Transfer(path.into(), peer_path.into(), message.clone())
                    .on_side(TransferSide::Destination));
            }
            state.transfers.push((
                self.host.clone(),
                path.into(),
                peer.host().into(),
                peer_path.into(),
            ));
            Ok(())
        }
    }

    pub(crate) struct MockFactory {
        pub state: Arc<Mutex<MockState>>,
    }

    impl SessionFactory for MockFactory {
        fn open(&self, key: &SessionKey) -> Result<Box<dyn RemoteSession>, Error> {
            self.state.lock().unwrap().opened += 1;
            Ok(Box::new(MockSession::new(
                &key.host,
                &key.user,
                Arc::clone(&self.state),
            )))
        }
    }
}
