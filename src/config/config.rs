//! Config module.
//!
//! This module contains the root configuration shared by the
//! replication and training pipelines.

use dirs::data_dir;
use serde::Deserialize;
use std::{env, path::PathBuf, result};
use thiserror::Error;

use super::{folder::FoldersConfig, imap::ImapEndpointConfig};

pub const DEFAULT_USER_PREFIX: &str = "user";
pub const DEFAULT_TRAIN_BATCH_SIZE: usize = 8;
pub const DEFAULT_CLASSIFIER_COMMAND: &str = "dspam";
pub const DEFAULT_SIEVE_PORT: u16 = 2000;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot expand state directory {1}")]
    ExpandStateDirError(#[source] shellexpand::LookupError<env::VarError>, String),
    #[error("cannot get state directory")]
    GetStateDirError,
}

pub type Result<T> = result::Result<T, Error>;

/// Represents the root configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct Config {
    /// Represents the source IMAP endpoint.
    #[serde(default)]
    pub src: ImapEndpointConfig,
    /// Represents the destination IMAP endpoint.
    #[serde(default)]
    pub dst: ImapEndpointConfig,
    /// Represents the folder patterns and flag policies.
    #[serde(default)]
    pub folders: FoldersConfig,
    /// Represents the processing limits.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Represents the sieve replication options.
    #[serde(default)]
    pub sieve: SieveConfig,
    /// Represents the external classifier options.
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// Represents the directory holding per-folder checkpoints.
    pub state_dir: Option<String>,
    /// Represents the mailbox namespace prefix under which user
    /// mailboxes live on the scanned server.
    pub user_prefix: Option<String>,
}

impl Config {
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => {
                let dir = shellexpand::full(dir)
                    .map_err(|err| Error::ExpandStateDirError(err, dir.clone()))?;
                Ok(PathBuf::from(dir.as_ref()))
            }
            None => data_dir()
                .map(|dir| dir.join("replimap"))
                .ok_or(Error::GetStateDirError),
        }
    }

    pub fn user_prefix(&self) -> &str {
        self.user_prefix.as_deref().unwrap_or(DEFAULT_USER_PREFIX)
    }
}

/// Represents the processing limits of the training pipeline.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Represents the maximum number of messages classified per run,
    /// across all folders of a user. Unset means no limit.
    pub msgs_per_run: Option<usize>,
    /// Represents the number of messages fetched at once while
    /// scanning. Large values mean higher memory usage, lower values
    /// more protocol overhead.
    pub batchsize: Option<usize>,
}

impl LimitsConfig {
    pub fn batchsize(&self) -> usize {
        self.batchsize.unwrap_or(DEFAULT_TRAIN_BATCH_SIZE)
    }
}

/// Represents the sieve replication options.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SieveConfig {
    /// Enables sieve script replication.
    pub replicate: Option<bool>,
    /// Represents the managesieve port.
    pub port: Option<u16>,
}

impl SieveConfig {
    pub fn replicate(&self) -> bool {
        self.replicate.unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SIEVE_PORT)
    }
}

/// Represents the external classifier options.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ClassifierConfig {
    /// Represents the classifier binary.
    pub command: Option<String>,
    /// Represents the directory of per-user opt-in marker files. Unset
    /// means every user is trained.
    pub opt_in: Option<String>,
}

impl ClassifierConfig {
    pub fn command(&self) -> &str {
        self.command.as_deref().unwrap_or(DEFAULT_CLASSIFIER_COMMAND)
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn state_dir_expands_configured_path() {
        let config = Config {
            state_dir: Some("/var/lib/replimap".into()),
            ..Config::default()
        };
        assert_eq!(
            std::path::PathBuf::from("/var/lib/replimap"),
            config.state_dir().unwrap()
        );
    }

    #[test]
    fn user_prefix_defaults() {
        assert_eq!("user", Config::default().user_prefix());
    }
}
