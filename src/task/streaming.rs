// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use log::{debug, trace, warn};
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::context::ProcessContext;
use crate::session::{quote, SessionKey, SessionPool};
use crate::Error;

const MINIMUM_INTERVAL: Duration = Duration::from_secs(60);

/// Pause between copies of partial output: a tenth of the wall time, and at
/// least one minute.
pub fn streaming_interval(wall_time: Option<Duration>) -> Duration {
    wall_time.map_or(MINIMUM_INTERVAL, |wall_time| {
        (wall_time / 10).max(MINIMUM_INTERVAL)
    })
}

/// The job's standard output and error paired with their storage paths.
pub fn stream_targets(context: &ProcessContext) -> Vec<(String, String)> {
    let directory = Path::new(&context.storage.file_system_root)
        .join(context.process.output_directory());
    [context.process.std_out_path(), context.process.std_err_path()]
        .into_iter()
        .filter_map(|source| {
            let name = Path::new(&source).file_name()?.to_owned();
            let destination = directory.join(name).to_string_lossy().into_owned();
            Some((source, destination))
        })
        .collect()
}

/// Copy every target once.
fn stream_once(
    sessions: &Arc<SessionPool>,
    compute: &SessionKey,
    storage: &SessionKey,
    targets: &[(String, String)],
) -> Result<(), Error> {
    let mut source = sessions.acquire(compute)?;
    if compute == storage {
        for (from, to) in targets {
            let directory = Path::new(to)
                .parent()
                .map_or_else(|| "/".into(), |p| p.to_string_lossy().into_owned());
            source.run(&format!(
                "mkdir -p {} && cp -p {} {}",
                quote(&directory),
                quote(from),
                quote(to)
            ))?;
        }
        return Ok(());
    }

    let mut destination = sessions.acquire(storage)?;
    for (from, to) in targets {
        source.send_to(from, &mut *destination, to)?;
    }
    Ok(())
}

/// Periodically copy partial job output to storage while the job runs.
///
/// The copy runs on a background thread until `stop` is called or the
/// streamer is dropped.
pub struct DataStreamer {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl DataStreamer {
    pub fn start(
        sessions: Arc<SessionPool>,
        compute: SessionKey,
        storage: SessionKey,
        targets: Vec<(String, String)>,
        interval: Duration,
    ) -> Self {
        let (stop, stopped) = mpsc::channel::<()>();
        debug!(
            "Streaming {} file(s) from '{}' every {:?}.",
            targets.len(),
            compute.host,
            interval
        );

        let handle = thread::spawn(move || loop {
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    trace!("Streaming partial output from '{}'.", compute.host);
                    if let Err(error) = stream_once(&sessions, &compute, &storage, &targets) {
                        warn!("Unable to stream partial output: {error}");
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });

        DataStreamer {
            stop: Some(stop),
            handle: Some(handle),
        }
    }

    /// Stop streaming and wait for the background thread to exit.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("The streaming thread panicked.");
            }
        }
    }
}

impl Drop for DataStreamer {
    fn drop(&mut self) {
        self.stop();
    }
}
