//! State module.
//!
//! This module contains the per-folder checkpoint persistence used to
//! make repeated runs resumable without re-scanning unchanged folders.

pub mod checkpoint;
pub use checkpoint::{Checkpoint, CheckpointFile, Error, Result};
