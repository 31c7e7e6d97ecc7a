// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use log::trace;
use serde::{Deserialize, Deserializer};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, DATA_DIRECTORY_NAME};

/// Directory that holds `resources.toml`, `credentials.toml`, and `engine.toml`.
///
/// `$GANTRY_HOME/.config/gantry` when `GANTRY_HOME` is set, otherwise
/// `$HOME/.config/gantry`.
///
/// # Errors
/// `gantry::Error::NoHome` when neither is available.
///
pub fn config_directory() -> Result<PathBuf, Error> {
    let home = match env::var("GANTRY_HOME") {
        Ok(gantry_home) => PathBuf::from(gantry_home),
        Err(_) => home::home_dir().ok_or_else(Error::NoHome)?,
    };
    Ok(home.join(".config").join("gantry"))
}

/// Parse a duration such as `00:00:10`, `1:30:00`, or `PT10S`.
pub(crate) fn parse_duration(value: &str) -> Result<Duration, String> {
    let duration = speedate::Duration::from_str(value).map_err(|e| e.to_string())?;
    if !duration.positive {
        return Err(format!("negative duration '{value}'"));
    }
    let seconds = u64::try_from(duration.signed_total_seconds()).unwrap_or(0);
    Ok(Duration::from_secs(seconds) + Duration::from_micros(u64::from(duration.microsecond)))
}

pub(crate) fn deserialize_duration_from_str<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Tunable engine constants, read from `engine.toml`.
///
/// Every value has a default tuned to the latency of real schedulers.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSettings {
    /// Verify-by-name attempts when submission printed no job id.
    pub verification_attempts: u32,

    /// Attempt `n` waits `n * verification_backoff` before querying.
    #[serde(deserialize_with = "deserialize_duration_from_str")]
    pub verification_backoff: Duration,

    /// Status queries before a cancel gives up.
    pub cancel_status_attempts: u32,

    /// Attempt `n` waits `n * cancel_status_backoff` before querying.
    #[serde(deserialize_with = "deserialize_duration_from_str")]
    pub cancel_status_backoff: Duration,

    /// Pause between checks for a job id while canceling.
    #[serde(deserialize_with = "deserialize_duration_from_str")]
    pub cancel_job_id_poll: Duration,

    /// Checks for a job id before a cancel gives up.
    pub cancel_job_id_attempts: u32,

    /// Checks for a missing output file before it is declared missing.
    pub output_wait_attempts: u32,

    /// Check `n` waits `n * output_wait_backoff`.
    #[serde(deserialize_with = "deserialize_duration_from_str")]
    pub output_wait_backoff: Duration,

    /// Pause between job status polls while waiting for a job.
    #[serde(deserialize_with = "deserialize_duration_from_str")]
    pub monitor_interval: Duration,

    /// Leased sessions per (host, credential) pair.
    pub max_sessions_per_host: usize,

    /// Where job scripts are written before they are copied to the compute resource.
    pub local_data_location: PathBuf,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            verification_attempts: 3,
            verification_backoff: Duration::from_secs(10),
            cancel_status_attempts: 5,
            cancel_status_backoff: Duration::from_secs(1),
            cancel_job_id_poll: Duration::from_secs(5),
            cancel_job_id_attempts: 120,
            output_wait_attempts: 3,
            output_wait_backoff: Duration::from_secs(10),
            monitor_interval: Duration::from_secs(30),
            max_sessions_per_host: 8,
            local_data_location: PathBuf::from(DATA_DIRECTORY_NAME).join("job-scripts"),
        }
    }
}

impl EngineSettings {
    /// Open `engine.toml` in the configuration directory, if present.
    ///
    /// # Errors
    /// Returns `Err(gantry::Error)` when the file cannot be read or parsed.
    ///
    pub fn open() -> Result<Self, Error> {
        Self::open_from_path(&config_directory()?.join("engine.toml"))
    }

    pub(crate) fn open_from_path(path: &Path) -> Result<Self, Error> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                trace!("'{}' does not exist, using default settings.", path.display());
                return Ok(Self::default());
            }
            Err(error) => return Err(Error::FileRead(path.into(), error)),
        };

        trace!("Parsing '{}'.", path.display());
        toml::from_str(&contents).map_err(|e| Error::TOMLParse(path.into(), e))
    }
}

#[cfg(test)]
mod tests {
    use assert_fs::prelude::*;
    use assert_fs::TempDir;
    use serial_test::parallel;

    use super::*;

    #[test]
    #[parallel]
    fn defaults() {
        let temp = TempDir::new().unwrap();
        let settings = EngineSettings::open_from_path(&temp.path().join("engine.toml")).unwrap();
        assert_eq!(settings, EngineSettings::default());
        assert_eq!(settings.verification_attempts, 3);
        assert_eq!(settings.verification_backoff, Duration::from_secs(10));
        assert_eq!(settings.cancel_status_backoff, Duration::from_secs(1));
    }

    #[test]
    #[parallel]
    fn partial_file() {
        let temp = TempDir::new().unwrap().child("engine.toml");
        temp.write_str(
            r#"
verification_attempts = 5
verification_backoff = "00:00:02"
monitor_interval = "PT1S"
"#,
        )
        .unwrap();
        let settings = EngineSettings::open_from_path(temp.path()).unwrap();
        assert_eq!(settings.verification_attempts, 5);
        assert_eq!(settings.verification_backoff, Duration::from_secs(2));
        assert_eq!(settings.monitor_interval, Duration::from_secs(1));
        assert_eq!(settings.cancel_status_attempts, 5);
    }

    #[test]
    #[parallel]
    fn invalid_duration() {
        let temp = TempDir::new().unwrap().child("engine.toml");
        temp.write_str("monitor_interval = \"soon\"\n").unwrap();
        assert!(matches!(
            EngineSettings::open_from_path(temp.path()),
            Err(Error::TOMLParse(..))
        ));
    }

    #[test]
    #[parallel]
    fn durations() {
        assert_eq!(parse_duration("01:30:00"), Ok(Duration::from_secs(5400)));
        assert_eq!(parse_duration("PT90S"), Ok(Duration::from_secs(90)));
        assert!(parse_duration("later").is_err());
    }
}
