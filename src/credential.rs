// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use log::trace;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::settings;
use crate::Error;

/// Authentication material for one remote account.
#[derive(Clone, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Credential {
    KeyPair {
        private_key: PathBuf,
        passphrase: Option<String>,
    },
    Password {
        password: String,
    },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::KeyPair {
                private_key,
                passphrase,
            } => f
                .debug_struct("KeyPair")
                .field("private_key", private_key)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
            Credential::Password { .. } => f
                .debug_struct("Password")
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Resolve authentication material at call time.
pub trait CredentialStore: Send + Sync {
    /// Find the credential named `token` for `user` on `host`.
    ///
    /// # Errors
    /// `gantry::Error::CredentialNotFound` when there is no such credential.
    ///
    fn credential(&self, token: &str, host: &str, user: &str) -> Result<Credential, Error>;
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
struct CredentialEntry {
    token: String,
    #[serde(flatten)]
    credential: Credential,
}

/// Credentials read from `credentials.toml`.
///
/// ```toml
/// [[credential]]
/// token = "cluster"
/// key_pair.private_key = "~/.ssh/id_ed25519"
/// ```
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CredentialConfiguration {
    #[serde(default)]
    credential: Vec<CredentialEntry>,
}

/// Expand a leading `~/` to the home directory.
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), home::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

impl CredentialConfiguration {
    /// Open `credentials.toml` in the configuration directory, if present.
    ///
    /// # Errors
    /// Returns `Err(gantry::Error)` when the file cannot be read or parsed.
    ///
    pub fn open() -> Result<Self, Error> {
        Self::open_from_path(&settings::config_directory()?.join("credentials.toml"))
    }

    pub(crate) fn open_from_path(path: &Path) -> Result<Self, Error> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                trace!("'{}' does not exist, using no credentials.", path.display());
                return Ok(Self::default());
            }
            Err(error) => return Err(Error::FileRead(path.into(), error)),
        };

        let mut configuration: CredentialConfiguration =
            toml::from_str(&contents).map_err(|e| Error::TOMLParse(path.into(), e))?;
        for entry in &mut configuration.credential {
            if let Credential::KeyPair { private_key, .. } = &mut entry.credential {
                *private_key = expand_home(private_key);
            }
        }
        Ok(configuration)
    }
}

impl CredentialStore for CredentialConfiguration {
    fn credential(&self, token: &str, host: &str, user: &str) -> Result<Credential, Error> {
        trace!("Resolving credential '{token}' for {user}@{host}.");
        self.credential
            .iter()
            .find(|entry| entry.token == token)
            .map(|entry| entry.credential.clone())
            .ok_or_else(|| Error::CredentialNotFound(token.into(), user.into(), host.into()))
    }
}

#[cfg(test)]
mod tests {
    use assert_fs::prelude::*;
    use assert_fs::TempDir;
    use serial_test::parallel;

    use super::*;
    use crate::ErrorKind;

    #[test]
    #[parallel]
    fn resolve() {
        let temp = TempDir::new().unwrap().child("credentials.toml");
        temp.write_str(
            r#"
[[credential]]
token = "key"
key_pair.private_key = "/keys/id_ed25519"

[[credential]]
token = "pw"
password.password = "hunter2"
"#,
        )
        .unwrap();
        let store = CredentialConfiguration::open_from_path(temp.path()).unwrap();

        assert_eq!(
            store.credential("key", "h", "u").unwrap(),
            Credential::KeyPair {
                private_key: "/keys/id_ed25519".into(),
                passphrase: None
            }
        );

        let password = store.credential("pw", "h", "u").unwrap();
        assert!(!format!("{password:?}").contains("hunter2"));

        let missing = store.credential("other", "h", "u").unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::Credential);
    }

    #[test]
    #[parallel]
    fn no_file() {
        let temp = TempDir::new().unwrap();
        let store =
            CredentialConfiguration::open_from_path(&temp.path().join("credentials.toml")).unwrap();
        assert_eq!(store, CredentialConfiguration::default());
    }
}
