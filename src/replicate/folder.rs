//! Folder replication module.
//!
//! Drives one folder through its lifecycle: open (creating the
//! destination folder if missing), subscription sync, query of both
//! sides, diff, and the batched apply phases. Deletions go first to
//! free identity collisions, then flag updates, then appends.

use chrono::{DateTime, FixedOffset};
use log::{debug, info, warn};
use std::{collections::BTreeMap, result};
use thiserror::Error;

use crate::{
    email::Flags,
    imap::{self, SessionHandle},
};

use super::{
    diff::{apply_flag_policy, diff, MessageRecord, ReplicationPlan},
    identity::identity_of,
};

/// Number of messages queried, updated or deleted per round trip.
pub const SCAN_BATCH_SIZE: usize = 1024;

/// Number of messages appended per round trip. Smaller than the scan
/// batch since appends carry full bodies.
pub const ADD_BATCH_SIZE: usize = 64;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    SessionError(#[from] imap::Error),
}

pub type Result<T> = result::Result<T, Error>;

/// Represents the per-folder outcome counters reported to the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct FolderReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    /// Source messages skipped because no envelope could be fetched.
    pub skipped: usize,
    /// Source messages skipped because their identity duplicated
    /// another message's.
    pub duplicates: usize,
    /// Messages whose append failed.
    pub append_failures: usize,
}

type MsgBody = (Vec<u8>, Flags, Option<DateTime<FixedOffset>>);

pub struct FolderReplicator<'a> {
    src: &'a SessionHandle,
    dst: &'a SessionHandle,
    folder_src: String,
    folder_dst: String,
    add_flags: Flags,
    remove_flags: Flags,
    dont_delete: bool,
}

impl<'a> FolderReplicator<'a> {
    pub fn new(
        src: &'a SessionHandle,
        dst: &'a SessionHandle,
        folder_src: impl Into<String>,
        folder_dst: impl Into<String>,
        add_flags: Flags,
        remove_flags: Flags,
        dont_delete: bool,
    ) -> Self {
        Self {
            src,
            dst,
            folder_src: folder_src.into(),
            folder_dst: folder_dst.into(),
            add_flags,
            remove_flags,
            dont_delete,
        }
    }

    pub fn replicate(&self) -> Result<FolderReport> {
        self.src.session()?.examine(&self.folder_src)?;
        self.open_destination()?;
        self.sync_subscription()?;

        // The two scans are read-only and run on separate
        // connections, so they can proceed in parallel.
        let (msgs_src, msgs_dst) = rayon::join(
            || query_msgs(self.src, "source"),
            || query_msgs(self.dst, "destination"),
        );
        let (msgs_src, skipped) = msgs_src?;
        let (msgs_dst, _) = msgs_dst?;

        let plan = diff(msgs_src, msgs_dst, &self.add_flags, &self.remove_flags);

        let mut report = FolderReport {
            skipped,
            duplicates: plan.duplicates,
            ..FolderReport::default()
        };
        self.apply(&plan, &mut report)?;

        self.src.session()?.unselect();
        self.dst.session()?.unselect();

        Ok(report)
    }

    fn open_destination(&self) -> Result<()> {
        let mut dst = self.dst.session()?;
        if dst.select(&self.folder_dst).is_err() {
            info!("creating folder {} on destination", self.folder_dst);
            dst.create(&self.folder_dst)?;
            dst.select(&self.folder_dst)?;
        }
        Ok(())
    }

    fn sync_subscription(&self) -> Result<()> {
        let sub_src = self.src.session()?.is_subscribed(&self.folder_src)?;
        let sub_dst = self.dst.session()?.is_subscribed(&self.folder_dst)?;

        if sub_src && !sub_dst {
            info!(
                "subscription state differs, subscribing {} on destination",
                self.folder_dst
            );
            self.dst.session()?.subscribe(&self.folder_dst)?;
        } else if !sub_src && sub_dst {
            info!(
                "subscription state differs, unsubscribing {} on destination",
                self.folder_dst
            );
            self.dst.session()?.unsubscribe(&self.folder_dst)?;
        }

        Ok(())
    }

    /// Fixed apply order: deleting first frees identity collisions
    /// before re-adding, updating before adding avoids touching
    /// messages that are about to be appended anyway.
    fn apply(&self, plan: &ReplicationPlan, report: &mut FolderReport) -> Result<()> {
        if self.dont_delete {
            if !plan.removed.is_empty() {
                info!(
                    "dont-delete set, keeping {} destination-only messages",
                    plan.removed.len()
                );
            }
        } else {
            self.delete_msgs(&plan.removed)?;
            report.removed = plan.removed.len();
        }

        self.update_msgs(&plan.updated)?;
        report.updated = plan.updated.values().map(Vec::len).sum();

        let (added, failed) = self.add_msgs(&plan.added)?;
        report.added = added;
        report.append_failures = failed;

        Ok(())
    }

    fn delete_msgs(&self, msgs: &[MessageRecord]) -> Result<()> {
        if msgs.is_empty() {
            return Ok(());
        }

        info!(
            "destination: will delete {} messages in batches of {}",
            msgs.len(),
            SCAN_BATCH_SIZE
        );

        for batch in msgs.chunks(SCAN_BATCH_SIZE) {
            let uid_set = uid_set(batch);
            let mut dst = self.dst.session()?;
            dst.uid_store(&uid_set, "+FLAGS.SILENT (\\Deleted)")?;
            dst.uid_expunge(&uid_set)?;
        }

        Ok(())
    }

    fn update_msgs(&self, updated: &BTreeMap<Flags, Vec<MessageRecord>>) -> Result<()> {
        if updated.is_empty() {
            return Ok(());
        }

        info!(
            "destination: will update {} messages to {} different states",
            updated.values().map(Vec::len).sum::<usize>(),
            updated.len()
        );

        for (flags, msgs) in updated {
            debug!(
                "updating {} messages to state [{}] in batches of {}",
                msgs.len(),
                flags,
                SCAN_BATCH_SIZE
            );
            for batch in msgs.chunks(SCAN_BATCH_SIZE) {
                self.dst.session()?.uid_store(
                    &uid_set(batch),
                    &format!("FLAGS.SILENT ({})", flags.to_imap_query()),
                )?;
            }
        }

        Ok(())
    }

    /// Appends the planned messages message by message. The protocol
    /// library has no atomic MULTIAPPEND, and retrying a partially
    /// applied chunk would duplicate the messages that already made
    /// it, so every message gets exactly one append attempt; failures
    /// are logged and counted, not retried. Every planned message
    /// ends up in exactly one of the two counters.
    fn add_msgs(&self, msgs: &[MessageRecord]) -> Result<(usize, usize)> {
        if msgs.is_empty() {
            return Ok((0, 0));
        }

        info!(
            "destination: will add {} messages in batches of {}",
            msgs.len(),
            ADD_BATCH_SIZE
        );

        let mut added = 0;
        let mut failed = 0;

        for batch in msgs.chunks(ADD_BATCH_SIZE) {
            let (bodies, unfetchable) = self.fetch_bodies(batch)?;
            failed += unfetchable;

            for msg in &bodies {
                match self.append_one(msg) {
                    Ok(()) => added += 1,
                    Err(err) => {
                        warn!("cannot append message: {}", err);
                        failed += 1;
                    }
                }
            }
        }

        if failed > 0 {
            warn!("{} messages couldn't be added", failed);
        }

        Ok((added, failed))
    }

    /// Fetches the bodies of one batch, also returning how many
    /// messages had to be dropped for lacking a body.
    fn fetch_bodies(&self, batch: &[MessageRecord]) -> Result<(Vec<MsgBody>, usize)> {
        let mut src = self.src.session()?;
        let fetches = src.uid_fetch(&uid_set(batch), "(BODY.PEEK[] INTERNALDATE FLAGS)")?;

        let mut bodies = Vec::with_capacity(batch.len());
        let mut unfetchable = 0;
        for fetch in fetches.iter() {
            // An empty body means the message could not really be
            // fetched; appending a fabricated empty message would be
            // worse than skipping it.
            let body = match fetch.body() {
                Some(body) if !body.is_empty() => body.to_vec(),
                _ => {
                    warn!("skipping message with unfetchable body");
                    unfetchable += 1;
                    continue;
                }
            };
            let flags = apply_flag_policy(
                &Flags::from(fetch.flags()).without_recent(),
                &self.add_flags,
                &self.remove_flags,
            );
            bodies.push((body, flags, fetch.internal_date()));
        }

        // The server may silently return fewer fetch responses than
        // UIDs asked for; those messages cannot be appended either.
        let missing = batch.len().saturating_sub(bodies.len() + unfetchable);
        unfetchable += missing;

        Ok((bodies, unfetchable))
    }

    fn append_one(&self, (body, flags, internal_date): &MsgBody) -> Result<()> {
        self.dst
            .session()?
            .append(&self.folder_dst, body, flags.clone(), *internal_date)?;
        Ok(())
    }
}

fn uid_set(msgs: &[MessageRecord]) -> String {
    msgs.iter()
        .map(|msg| msg.uid.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Queries every message of the currently open folder: a bulk SEARCH
/// for the sequence numbers, then batched fetches of UID, FLAGS and
/// ENVELOPE. Messages without a usable envelope are counted and
/// skipped rather than failing the folder.
fn query_msgs(handle: &SessionHandle, tag: &str) -> Result<(Vec<MessageRecord>, usize)> {
    let mut session = handle.session()?;

    let seqs = session.search("ALL")?;
    if seqs.is_empty() {
        return Ok((Vec::new(), 0));
    }

    info!(
        "{}: will query {} messages in batches of {}",
        tag,
        seqs.len(),
        SCAN_BATCH_SIZE
    );

    let mut msgs = Vec::with_capacity(seqs.len());
    let mut broken = 0;

    for batch in seqs.chunks(SCAN_BATCH_SIZE) {
        let set = batch
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let fetches = session.fetch(&set, "(UID FLAGS ENVELOPE)")?;

        for fetch in fetches.iter() {
            let envelope = match fetch.envelope() {
                Some(envelope) => envelope,
                None => {
                    broken += 1;
                    continue;
                }
            };
            let uid = match fetch.uid {
                Some(uid) => uid,
                None => {
                    broken += 1;
                    continue;
                }
            };
            msgs.push(MessageRecord {
                uid,
                identity: identity_of(envelope),
                flags: Flags::from(fetch.flags()).without_recent(),
            });
        }
    }

    if broken > 0 {
        warn!(
            "{}: ignored {} messages because no unique id could be generated",
            tag, broken
        );
    }

    Ok((msgs, broken))
}
