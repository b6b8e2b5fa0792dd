//! Incremental scan processor module.
//!
//! Walks the folders of every provisioned user and feeds changed
//! messages to a classification sink. A per-folder checkpoint plus
//! MODSEQ-based search keeps the cost of a quiescent folder down to a
//! single STATUS round trip, which is what makes scanning mailboxes
//! with thousands of folders feasible.

use imap_proto::NameAttribute;
use log::{debug, error, info, warn};
use std::{
    collections::{BTreeMap, HashMap},
    result,
};
use thiserror::Error;
use utf7_imap::decode_utf7_imap as decode_utf7;

use crate::{
    config::{folder as folder_config, matches_any, Config},
    email::Flags,
    imap::{connect, SessionHandle},
    state::{self, CheckpointFile},
};

use super::{
    data::{MessageData, CLASSIFIED_INNOCENT, CLASSIFIED_JUNK},
    sink::{self, ClassificationSink},
};

/// Cyrus annotation switching CONDSTORE on for a folder.
const CONDSTORE_ANNOTATION: &str = "/vendor/cmu/cyrus-imapd/condstore";

#[derive(Debug, Error)]
pub enum Error {
    #[error("mod-sequence tracking unavailable for folder {0} and could not be enabled")]
    CondstoreUnavailableError(String),

    #[error(transparent)]
    SessionError(#[from] crate::imap::Error),
    #[error(transparent)]
    StateError(#[from] state::Error),
    #[error(transparent)]
    ConfigError(#[from] crate::config::config::Error),
    #[error(transparent)]
    EndpointConfigError(#[from] crate::config::imap::Error),
    #[error(transparent)]
    PatternError(#[from] folder_config::Error),
    #[error(transparent)]
    SinkError(#[from] sink::Error),
}

pub type Result<T> = result::Result<T, Error>;

/// Represents the outcome of a multi-user scan run.
#[derive(Debug, Default)]
pub struct ProcessReport {
    pub processed: usize,
    pub failed: usize,
}

impl ProcessReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FolderRole {
    Innocent,
    Junk,
}

/// Outcome of opening a folder for incremental processing.
enum FolderOpen {
    /// Server cursors match the checkpoint exactly; nothing to do.
    Unchanged,
    /// Folder is selected read-only and has pending changes.
    Opened {
        checkpoint: CheckpointFile,
        uidnext: u64,
        highest_modseq: u64,
    },
}

/// Enumerates provisioned users and runs a [`UserProcessor`] on each.
/// A failing user is logged and does not stop the others.
pub struct ImapProcessor<'a> {
    config: &'a Config,
}

impl<'a> ImapProcessor<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    pub fn process_users(&self, sink: &dyn ClassificationSink) -> Result<ProcessReport> {
        let endpoint = &self.config.src;
        let admin = endpoint.proxy_user()?.to_owned();
        let passwd = endpoint.proxy_passwd()?;

        let users = {
            let session = connect(endpoint, &admin, &passwd)?;
            let prefix = format!("{}{}", self.config.user_prefix(), session.delimiter());
            let pattern = format!("{}%", prefix);

            let mut users = Vec::new();
            for name in session.session()?.list("", &pattern)?.iter() {
                if name.attributes().contains(&NameAttribute::NoSelect) {
                    continue;
                }
                let decoded = decode_utf7(name.name().into());
                if let Some(user) = decoded.strip_prefix(&prefix) {
                    users.push(user.to_owned());
                }
            }
            users
        };

        let mut report = ProcessReport::default();
        for user in users {
            if !sink.accepts_user(&user) {
                debug!("skipping user {}", user);
                continue;
            }
            match UserProcessor::new(self.config, &user)
                .and_then(|mut processor| processor.process_folders(sink))
            {
                Ok(()) => report.processed += 1,
                Err(err) => {
                    error!("error processing user {}, skipping them", user);
                    error!("{}", err);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

/// Scans the folders of one user, junk or innocent depending on the
/// configured patterns, within the per-run message budget.
pub struct UserProcessor<'a> {
    config: &'a Config,
    user: String,
    session: SessionHandle,
    remaining: Option<usize>,
    batchsize: usize,
}

impl<'a> UserProcessor<'a> {
    pub fn new(config: &'a Config, user: &str) -> Result<Self> {
        let endpoint = &config.src;
        let passwd = endpoint.proxy_passwd()?;
        let session = connect(endpoint, user, &passwd)?;

        Ok(Self {
            config,
            user: user.to_owned(),
            session,
            remaining: config.limits.msgs_per_run,
            batchsize: config.limits.batchsize(),
        })
    }

    pub fn process_folders(&mut self, sink: &dyn ClassificationSink) -> Result<()> {
        info!(
            "processing user {} (max msgs: {}, batchsize: {})",
            self.user,
            self.remaining
                .map(|n| n.to_string())
                .unwrap_or_else(|| String::from("unlimited")),
            self.batchsize
        );

        let delim = self.session.delimiter().to_owned();
        let ignore = self.config.folders.ignore_patterns(&delim)?;
        let junk = self.config.folders.junk_patterns(&delim)?;
        let corpus = self.config.folders.corpus_patterns(&delim)?;

        let folders: Vec<String> = {
            let mut session = self.session.session()?;
            let names = session.list("", "*")?;
            names
                .iter()
                .filter(|name| !name.attributes().contains(&NameAttribute::NoSelect))
                .map(|name| decode_utf7(name.name().into()))
                .collect()
        };

        for folder in folders {
            if self.remaining == Some(0) {
                debug!("message budget exhausted, stopping");
                break;
            }
            if matches_any(&ignore, &folder) {
                continue;
            }

            let role = if matches_any(&junk, &folder) {
                FolderRole::Junk
            } else {
                FolderRole::Innocent
            };
            let is_corpus = matches_any(&corpus, &folder);

            // One folder that cannot be scanned (no CONDSTORE, lock
            // contention, ...) is skipped, not fatal for the user.
            if let Err(err) = self.process_folder(&folder, role, is_corpus, sink) {
                warn!("error processing folder {}, skipping it", folder);
                warn!("{}", err);
            }
        }

        Ok(())
    }

    fn process_folder(
        &mut self,
        folder: &str,
        role: FolderRole,
        corpus: bool,
        sink: &dyn ClassificationSink,
    ) -> Result<()> {
        let (mut checkpoint, uidnext, highest_modseq) = match self.open_folder(folder)? {
            FolderOpen::Unchanged => {
                debug!("folder {} unchanged, skipping", folder);
                return Ok(());
            }
            FolderOpen::Opened {
                checkpoint,
                uidnext,
                highest_modseq,
            } => (checkpoint, uidnext, highest_modseq),
        };

        info!("processing {} ({})", folder, role_label(role, corpus));
        let query = format!("NOT DELETED {}", search_condition(role, corpus));
        let result = self.process_messages(
            &mut checkpoint,
            uidnext,
            highest_modseq,
            &query,
            role,
            corpus,
            sink,
        );

        // Unselect via the bogus EXAMINE, then persist whatever
        // progress was made, error or not: the checkpoint only ever
        // advanced past fully processed messages.
        if let Ok(mut session) = self.session.session() {
            session.unselect();
        }
        checkpoint.save()?;

        match result {
            Ok(()) => {
                info!("finished processing {}", folder);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Opens a folder for processing, or reports it unchanged. Tries
    /// to enable mod-sequence tracking via the folder annotation when
    /// the server keeps it off.
    fn open_folder(&mut self, folder: &str) -> Result<FolderOpen> {
        info!("checking {}", folder);

        let state_dir = self.config.state_dir()?;
        let tag = format!("{}.{}", self.user, folder);
        let mut checkpoint = CheckpointFile::open(&state_dir, &tag)?;

        let mut status = self.session.session()?.status_condstore(folder)?;
        if status.highest_modseq.is_none() {
            info!("mod-sequence tracking not available, trying to enable it");
            self.session
                .session()?
                .set_annotation(folder, CONDSTORE_ANNOTATION, "true")?;
            status = self.session.session()?.status_condstore(folder)?;
            match status.highest_modseq {
                Some(_) => info!("enabled mod-sequence tracking for {}", folder),
                None => return Err(Error::CondstoreUnavailableError(folder.to_owned())),
            }
        }

        // If no message was stored (uidnext) and none was modified
        // (highestmodseq), the folder needs no work at all.
        if let Some(highest_modseq) = status.highest_modseq {
            if checkpoint
                .checkpoint()
                .matches(status.uidvalidity, status.uidnext, highest_modseq)
            {
                return Ok(FolderOpen::Unchanged);
            }
        }

        let opened = self.session.session()?.examine_condstore(folder)?;
        let highest_modseq = opened
            .highest_modseq
            .ok_or_else(|| Error::CondstoreUnavailableError(folder.to_owned()))?;

        // A different UIDVALIDITY voids every remembered cursor.
        if checkpoint.checkpoint().uidvalidity != opened.uidvalidity {
            info!("uidvalidity changed for {}, forgetting local state", folder);
            checkpoint.checkpoint_mut().reset(opened.uidvalidity);
        }

        Ok(FolderOpen::Opened {
            checkpoint,
            uidnext: opened.uidnext,
            highest_modseq,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn process_messages(
        &mut self,
        checkpoint: &mut CheckpointFile,
        uidnext: u64,
        highest_modseq: u64,
        query: &str,
        role: FolderRole,
        corpus: bool,
        sink: &dyn ClassificationSink,
    ) -> Result<()> {
        // Everything that changed since the checkpoint, in ascending
        // MODSEQ order. The order is essential: the checkpoint
        // advances per processed message, and processing out of order
        // would make a skipped higher-modseq message look already
        // seen on the next run.
        let pending = {
            let stored = checkpoint.checkpoint().highest_modseq;
            self.session
                .session()?
                .sort_modseq(&format!("MODSEQ {} {}", stored + 1, query))?
        };

        // Clamp to the remaining per-run message budget.
        let ids = match self.remaining {
            Some(remaining) => &pending[..pending.len().min(remaining)],
            None => &pending[..],
        };

        if !pending.is_empty() {
            info!(
                "will process {} messages out of {} matching in batches of {}",
                ids.len(),
                pending.len(),
                self.batchsize
            );

            for batch in ids.chunks(self.batchsize) {
                debug!("processing batch of {} messages", batch.len());
                self.process_batch(batch, checkpoint, role, corpus, sink)?;
            }
        }

        // Let the checkpoint match the server's own highestmodseq,
        // but only when every pending message was processed: the
        // message carrying the highest modseq is not necessarily part
        // of the search result, so the per-message advance alone
        // would never converge to the skip fast-path.
        if pending.len() == ids.len() {
            checkpoint.checkpoint_mut().highest_modseq = highest_modseq;
            checkpoint.checkpoint_mut().uidnext = uidnext;
        }

        Ok(())
    }

    fn process_batch(
        &mut self,
        batch: &[u32],
        checkpoint: &mut CheckpointFile,
        role: FolderRole,
        corpus: bool,
        sink: &dyn ClassificationSink,
    ) -> Result<()> {
        let set = batch
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let mut by_seq = {
            let mut session = self.session.session()?;
            let modseqs = session.fetch_modseqs(&set)?;
            let fetches = session.fetch(&set, "(UID FLAGS BODY.PEEK[])")?;

            let mut by_seq = HashMap::new();
            for fetch in fetches.iter() {
                match MessageData::from_fetch(fetch, &modseqs) {
                    Some(data) => {
                        by_seq.insert(data.seq, data);
                    }
                    None => warn!("skipping broken message {}", fetch.message),
                }
            }
            by_seq
        };

        let mut flags_add: BTreeMap<Flags, Vec<u32>> = BTreeMap::new();
        let mut flags_remove: BTreeMap<Flags, Vec<u32>> = BTreeMap::new();

        // Fetch responses come back in mailbox order; iterate the
        // batch instead, which is in modseq order.
        for seq in batch {
            let mut data = match by_seq.remove(seq) {
                Some(data) => data,
                None => continue,
            };
            let original = data.clone();

            classify(role, corpus, sink, &self.user, &mut data)?;

            let (added, removed) = MessageData::diff_flags(&original, &data);
            if !added.is_empty() {
                flags_add.entry(added).or_default().push(data.seq);
            }
            if !removed.is_empty() {
                flags_remove.entry(removed).or_default().push(data.seq);
            }

            checkpoint.checkpoint_mut().highest_modseq = data.modseq;
            if let Some(remaining) = self.remaining.as_mut() {
                *remaining -= 1;
            }
        }

        // Push the classification keywords back, batched per flag
        // set, removals first.
        let mut session = self.session.session()?;
        for (flags, seqs) in flags_remove {
            session.store(
                &seq_set(&seqs),
                &format!("-FLAGS.SILENT ({})", flags.to_imap_query()),
            )?;
        }
        for (flags, seqs) in flags_add {
            session.store(
                &seq_set(&seqs),
                &format!("+FLAGS.SILENT ({})", flags.to_imap_query()),
            )?;
        }

        Ok(())
    }
}

fn seq_set(seqs: &[u32]) -> String {
    seqs.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn role_label(role: FolderRole, corpus: bool) -> &'static str {
    match (role, corpus) {
        (FolderRole::Innocent, false) => "innocent",
        (FolderRole::Innocent, true) => "innocent,corpus",
        (FolderRole::Junk, false) => "junk",
        (FolderRole::Junk, true) => "junk,corpus",
    }
}

/// Builds the search condition for a folder: corpus folders look for
/// never-classified messages, the others for messages whose recorded
/// classification contradicts where they live now.
fn search_condition(role: FolderRole, corpus: bool) -> String {
    match (role, corpus) {
        (FolderRole::Innocent, true) => format!(
            "NOT KEYWORD {} NOT KEYWORD {}",
            CLASSIFIED_INNOCENT, CLASSIFIED_JUNK
        ),
        (FolderRole::Innocent, false) => format!("KEYWORD {}", CLASSIFIED_JUNK),
        (FolderRole::Junk, true) => format!("NOT KEYWORD {}", CLASSIFIED_JUNK),
        (FolderRole::Junk, false) => format!("KEYWORD {}", CLASSIFIED_INNOCENT),
    }
}

/// Applies the classification matrix to one message and fires the
/// matching sink callback. The keyword booleans are updated so the
/// caller can diff them against the fetched state.
fn classify(
    role: FolderRole,
    corpus: bool,
    sink: &dyn ClassificationSink,
    user: &str,
    data: &mut MessageData,
) -> Result<()> {
    match role {
        FolderRole::Innocent => {
            if data.classified_junk {
                sink.missed_innocent(user, data)?;
                data.classified_junk = false;
                data.classified_innocent = true;
                // Also drop the Junk keyword so mail clients stop
                // showing the junk marker on a rescued message.
                data.junk = false;
            } else if !data.classified_innocent && !data.classified_junk && corpus {
                sink.corpus_innocent(user, data)?;
                data.classified_junk = false;
                data.classified_innocent = true;
            } else {
                sink.kept(user, data)?;
            }
        }
        FolderRole::Junk => {
            if data.classified_innocent {
                sink.missed_junk(user, data)?;
                data.classified_junk = true;
                data.classified_innocent = false;
            } else if !data.classified_innocent && !data.classified_junk && corpus {
                sink.corpus_junk(user, data)?;
                data.classified_junk = true;
                data.classified_innocent = false;
            } else {
                sink.kept(user, data)?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use crate::train::{
        data::MessageData,
        sink::{ClassificationSink, Result},
    };

    use super::{classify, search_condition, FolderRole};

    #[derive(Default)]
    struct RecordingSink {
        events: RefCell<Vec<&'static str>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<&'static str> {
            self.events.borrow().clone()
        }
    }

    impl ClassificationSink for RecordingSink {
        fn kept(&self, _user: &str, _msg: &MessageData) -> Result<()> {
            self.events.borrow_mut().push("kept");
            Ok(())
        }

        fn missed_junk(&self, _user: &str, _msg: &MessageData) -> Result<()> {
            self.events.borrow_mut().push("missed_junk");
            Ok(())
        }

        fn missed_innocent(&self, _user: &str, _msg: &MessageData) -> Result<()> {
            self.events.borrow_mut().push("missed_innocent");
            Ok(())
        }

        fn corpus_junk(&self, _user: &str, _msg: &MessageData) -> Result<()> {
            self.events.borrow_mut().push("corpus_junk");
            Ok(())
        }

        fn corpus_innocent(&self, _user: &str, _msg: &MessageData) -> Result<()> {
            self.events.borrow_mut().push("corpus_innocent");
            Ok(())
        }
    }

    #[test]
    fn junk_found_in_innocent_folder_is_a_missed_innocent() {
        let sink = RecordingSink::default();
        let mut data = MessageData {
            classified_junk: true,
            junk: true,
            ..MessageData::default()
        };

        classify(FolderRole::Innocent, false, &sink, "alice", &mut data).unwrap();

        assert_eq!(vec!["missed_innocent"], sink.events());
        assert!(data.classified_innocent);
        assert!(!data.classified_junk);
        assert!(!data.junk);
    }

    #[test]
    fn innocent_found_in_junk_folder_is_a_missed_junk() {
        let sink = RecordingSink::default();
        let mut data = MessageData {
            classified_innocent: true,
            ..MessageData::default()
        };

        classify(FolderRole::Junk, false, &sink, "alice", &mut data).unwrap();

        assert_eq!(vec!["missed_junk"], sink.events());
        assert!(data.classified_junk);
        assert!(!data.classified_innocent);
    }

    #[test]
    fn unclassified_message_in_corpus_folder_is_fed_as_corpus() {
        let sink = RecordingSink::default();
        let mut data = MessageData::default();

        classify(FolderRole::Innocent, true, &sink, "alice", &mut data).unwrap();

        assert_eq!(vec!["corpus_innocent"], sink.events());
        assert!(data.classified_innocent);
    }

    #[test]
    fn unclassified_message_outside_corpus_folders_is_kept() {
        let sink = RecordingSink::default();
        let mut data = MessageData::default();

        classify(FolderRole::Innocent, false, &sink, "alice", &mut data).unwrap();

        assert_eq!(vec!["kept"], sink.events());
        assert!(!data.classified_innocent);
        assert!(!data.classified_junk);
    }

    #[test]
    fn already_classified_junk_in_junk_corpus_folder_is_kept() {
        let sink = RecordingSink::default();
        let mut data = MessageData {
            classified_junk: true,
            ..MessageData::default()
        };

        classify(FolderRole::Junk, true, &sink, "alice", &mut data).unwrap();

        assert_eq!(vec!["kept"], sink.events());
    }

    #[test]
    fn search_conditions_match_folder_roles() {
        assert_eq!(
            "KEYWORD $ClassifiedJunk",
            search_condition(FolderRole::Innocent, false)
        );
        assert_eq!(
            "NOT KEYWORD $ClassifiedInnocent NOT KEYWORD $ClassifiedJunk",
            search_condition(FolderRole::Innocent, true)
        );
        assert_eq!(
            "KEYWORD $ClassifiedInnocent",
            search_condition(FolderRole::Junk, false)
        );
        assert_eq!(
            "NOT KEYWORD $ClassifiedJunk",
            search_condition(FolderRole::Junk, true)
        );
    }
}
