//! Classification sink module.
//!
//! The processor reports what it found; what happens then (usually a
//! call into the external spam filter) is behind this trait.

use std::result;
use thiserror::Error;

use super::data::MessageData;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    ProcessError(#[from] crate::process::Error),
}

pub type Result<T> = result::Result<T, Error>;

/// Receives the classification transitions discovered while scanning
/// a user's folders. A failing callback aborts the current folder;
/// the message's flags are only updated once the callback succeeded.
pub trait ClassificationSink {
    /// Filters the users worth scanning at all.
    fn accepts_user(&self, _user: &str) -> bool {
        true
    }

    /// A message whose recorded classification still matches the
    /// folder it lives in.
    fn kept(&self, _user: &str, _msg: &MessageData) -> Result<()> {
        Ok(())
    }

    /// A message the filter called innocent that the user moved into
    /// a junk folder.
    fn missed_junk(&self, user: &str, msg: &MessageData) -> Result<()>;

    /// A message the filter called junk that the user moved into a
    /// regular folder.
    fn missed_innocent(&self, user: &str, msg: &MessageData) -> Result<()>;

    /// A never-classified message found in a junk corpus folder.
    fn corpus_junk(&self, user: &str, msg: &MessageData) -> Result<()>;

    /// A never-classified message found in an innocent corpus folder.
    fn corpus_innocent(&self, user: &str, msg: &MessageData) -> Result<()>;
}
