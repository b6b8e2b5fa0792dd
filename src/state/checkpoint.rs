//! Checkpoint module.
//!
//! One checkpoint file per (user, folder) records how far incremental
//! processing got: the folder's UIDVALIDITY, UIDNEXT and
//! HIGHESTMODSEQ at the end of the last successful run. The file is
//! held under an exclusive cross-process lock for the whole folder
//! operation, so two concurrent runs on the same folder fail fast
//! instead of corrupting each other's cursors.

use log::warn;
use proc_lock::{try_lock, LockGuard, LockPath};
use std::{
    fs, io,
    path::{Path, PathBuf},
    result,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot lock checkpoint {1}: concurrent run in progress")]
    LockCheckpointError(io::Error, String),
    #[error("cannot create state directory {1}")]
    CreateStateDirError(#[source] io::Error, PathBuf),
    #[error("cannot read checkpoint file {1}")]
    ReadCheckpointError(#[source] io::Error, PathBuf),
    #[error("cannot write checkpoint file {1}")]
    WriteCheckpointError(#[source] io::Error, PathBuf),
}

pub type Result<T> = result::Result<T, Error>;

/// Represents the persistent cursor of one folder.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub uidvalidity: u64,
    pub uidnext: u64,
    pub highest_modseq: u64,
}

impl Checkpoint {
    /// Checks whether the folder is exactly where the last run left
    /// it, in which case it can be skipped without opening it.
    pub fn matches(&self, uidvalidity: u64, uidnext: u64, highest_modseq: u64) -> bool {
        self.uidvalidity == uidvalidity
            && self.uidnext == uidnext
            && self.highest_modseq == highest_modseq
    }

    /// Forgets everything tracked under the previous UIDVALIDITY. The
    /// server renumbered its UIDs, so uidnext and highest_modseq are
    /// meaningless now.
    pub fn reset(&mut self, uidvalidity: u64) {
        self.uidvalidity = uidvalidity;
        self.uidnext = 0;
        self.highest_modseq = 0;
    }
}

/// Represents an open, exclusively locked checkpoint file.
pub struct CheckpointFile {
    path: PathBuf,
    checkpoint: Checkpoint,
    _guard: LockGuard,
}

impl CheckpointFile {
    /// Opens the checkpoint for the given tag, locking it. A file that
    /// does not parse is treated as a fresh zero checkpoint rather
    /// than an error: the worst that can happen is a full rescan.
    pub fn open(state_dir: &Path, tag: &str) -> Result<Self> {
        let tag = sanitize_tag(tag);

        fs::create_dir_all(state_dir)
            .map_err(|err| Error::CreateStateDirError(err, state_dir.to_owned()))?;
        let path = state_dir.join(&tag);

        let lock_path = LockPath::Tmp(format!("replimap-{}.lock", tag));
        let guard =
            try_lock(&lock_path).map_err(|err| Error::LockCheckpointError(err, tag.clone()))?;

        let checkpoint = match fs::read_to_string(&path) {
            Ok(content) => match parse_checkpoint(&content) {
                Ok(checkpoint) => checkpoint,
                Err(line) => {
                    warn!(
                        "invalid checkpoint file {} ({}), starting from zero",
                        path.display(),
                        line
                    );
                    Checkpoint::default()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Checkpoint::default(),
            Err(err) => return Err(Error::ReadCheckpointError(err, path)),
        };

        Ok(Self {
            path,
            checkpoint,
            _guard: guard,
        })
    }

    pub fn checkpoint(&self) -> Checkpoint {
        self.checkpoint
    }

    pub fn checkpoint_mut(&mut self) -> &mut Checkpoint {
        &mut self.checkpoint
    }

    /// Persists the checkpoint durably: the whole file is rewritten to
    /// the side and atomically renamed into place, still under the
    /// exclusive lock.
    pub fn save(&self) -> Result<()> {
        let content = format!(
            "uidvalidity: {}\nuidnext: {}\nhighestmodseq: {}\n",
            self.checkpoint.uidvalidity, self.checkpoint.uidnext, self.checkpoint.highest_modseq,
        );

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, content)
            .map_err(|err| Error::WriteCheckpointError(err, tmp_path.clone()))?;
        fs::rename(&tmp_path, &self.path)
            .map_err(|err| Error::WriteCheckpointError(err, self.path.clone()))?;

        Ok(())
    }
}

/// Folder names may carry path separators; the tag must stay inside
/// the state directory.
fn sanitize_tag(tag: &str) -> String {
    tag.chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect()
}

fn parse_checkpoint(content: &str) -> result::Result<Checkpoint, String> {
    let mut uidvalidity = None;
    let mut uidnext = None;
    let mut highest_modseq = None;

    for line in content.lines() {
        let (key, value) = line.split_once(':').ok_or_else(|| line.to_owned())?;
        let value: u64 = value
            .trim()
            .parse()
            .map_err(|_| line.to_owned())?;
        let slot = match key {
            "uidvalidity" => &mut uidvalidity,
            "uidnext" => &mut uidnext,
            "highestmodseq" => &mut highest_modseq,
            _ => return Err(line.to_owned()),
        };
        if slot.replace(value).is_some() {
            return Err(line.to_owned());
        }
    }

    match (uidvalidity, uidnext, highest_modseq) {
        (Some(uidvalidity), Some(uidnext), Some(highest_modseq)) => Ok(Checkpoint {
            uidvalidity,
            uidnext,
            highest_modseq,
        }),
        _ => Err(String::from("missing attributes")),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{Checkpoint, CheckpointFile, Error};

    #[test]
    fn checkpoint_roundtrip() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut file = CheckpointFile::open(dir.path(), "alice.INBOX").unwrap();
            assert_eq!(Checkpoint::default(), file.checkpoint());
            *file.checkpoint_mut() = Checkpoint {
                uidvalidity: 5,
                uidnext: 100,
                highest_modseq: 42,
            };
            file.save().unwrap();
        }

        let file = CheckpointFile::open(dir.path(), "alice.INBOX").unwrap();
        assert_eq!(
            Checkpoint {
                uidvalidity: 5,
                uidnext: 100,
                highest_modseq: 42,
            },
            file.checkpoint()
        );
    }

    #[test]
    fn missing_field_resets_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bob.INBOX"), "uidvalidity: 5\n").unwrap();

        let file = CheckpointFile::open(dir.path(), "bob.INBOX").unwrap();
        assert_eq!(Checkpoint::default(), file.checkpoint());
    }

    #[test]
    fn malformed_file_resets_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bob.Sent"), "uidvalidity: oops\ngarbage").unwrap();

        let file = CheckpointFile::open(dir.path(), "bob.Sent").unwrap();
        assert_eq!(Checkpoint::default(), file.checkpoint());
    }

    #[test]
    fn duplicate_key_resets_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("bob.Drafts"),
            "uidvalidity: 1\nuidvalidity: 2\nuidnext: 3\nhighestmodseq: 4\n",
        )
        .unwrap();

        let file = CheckpointFile::open(dir.path(), "bob.Drafts").unwrap();
        assert_eq!(Checkpoint::default(), file.checkpoint());
    }

    #[test]
    fn concurrent_open_fails_fast() {
        let dir = tempfile::tempdir().unwrap();

        let _held = CheckpointFile::open(dir.path(), "carol.INBOX").unwrap();
        match CheckpointFile::open(dir.path(), "carol.INBOX") {
            Err(Error::LockCheckpointError(..)) => (),
            other => panic!("expected lock contention, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn tag_is_sanitized() {
        let dir = tempfile::tempdir().unwrap();

        let mut file = CheckpointFile::open(dir.path(), "dave.Archive/2006").unwrap();
        file.checkpoint_mut().uidvalidity = 1;
        file.save().unwrap();

        assert!(dir.path().join("dave.Archive_2006").is_file());
    }

    #[test]
    fn unchanged_detection() {
        let checkpoint = Checkpoint {
            uidvalidity: 1,
            uidnext: 10,
            highest_modseq: 20,
        };
        assert!(checkpoint.matches(1, 10, 20));
        assert!(!checkpoint.matches(1, 11, 20));
        assert!(!checkpoint.matches(2, 10, 20));
    }

    #[test]
    fn reset_clears_cursors() {
        let mut checkpoint = Checkpoint {
            uidvalidity: 1,
            uidnext: 10,
            highest_modseq: 20,
        };
        checkpoint.reset(2);
        assert_eq!(
            Checkpoint {
                uidvalidity: 2,
                uidnext: 0,
                highest_modseq: 0,
            },
            checkpoint
        );
    }
}
