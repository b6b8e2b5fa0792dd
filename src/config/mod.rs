//! Configuration module.
//!
//! This module contains the representation of the replication and
//! training configuration. Loading it from a file (YAML or otherwise)
//! is left to the outer layer; everything here is plain deserializable
//! data plus accessors with sane defaults.

pub mod config;
pub use config::{ClassifierConfig, Config, LimitsConfig, SieveConfig};

pub mod folder;
pub use folder::{matches_any, FolderPattern, FoldersConfig};

pub mod imap;
pub use self::imap::{AuthMechanism, ImapEndpointConfig};
