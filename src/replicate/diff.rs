//! Message diff module.
//!
//! The core of the replication engine: a merge-join over the two
//! sides of a folder, sorted by message identity, classifying every
//! message as added, updated or removed. Sorting costs O(n log n) and
//! the join O(n); mailboxes routinely hold six-figure message counts,
//! so a pairwise comparison is not an option.

use log::{debug, warn};
use std::{cmp::Ordering, collections::BTreeMap};

use crate::email::Flags;

use super::identity::MessageIdentity;

/// Represents one message of a folder as needed for diffing: its UID
/// on the server it was queried from, its identity and its flags.
/// Rebuilt on every run, never persisted.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub uid: u32,
    pub identity: MessageIdentity,
    pub flags: Flags,
}

/// Represents the work needed to bring the destination folder in line
/// with the source.
///
/// The UID retention is asymmetric on purpose: added messages carry
/// their *source* UID (their bodies still have to be fetched from
/// there), updated and removed messages carry their *destination* UID
/// (that is where the mutation happens).
#[derive(Debug, Default)]
pub struct ReplicationPlan {
    /// Messages missing on the destination, in identity order.
    pub added: Vec<MessageRecord>,
    /// Messages whose destination flags differ, grouped by the flag
    /// set they should end up with.
    pub updated: BTreeMap<Flags, Vec<MessageRecord>>,
    /// Messages no longer present on the source.
    pub removed: Vec<MessageRecord>,
    /// Number of duplicate-identity source messages that were skipped.
    pub duplicates: usize,
}

impl ReplicationPlan {
    pub fn updated_count(&self) -> usize {
        self.updated.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Applies the folder flag policy: the source flags plus the forced
/// additions, minus the forced removals. This effective set is what
/// gets compared against the destination and what an added message is
/// stored with.
pub fn apply_flag_policy(flags: &Flags, add_flags: &Flags, remove_flags: &Flags) -> Flags {
    let mut flags = flags.clone();
    for flag in add_flags.iter() {
        flags.insert(flag.clone());
    }
    for flag in remove_flags.iter() {
        flags.remove(flag);
    }
    flags
}

/// Merge-joins the source and destination records into a replication
/// plan. Source records sharing the identity of their predecessor are
/// skipped with a warning; only the first occurrence takes part in
/// the join.
pub fn diff(
    mut src: Vec<MessageRecord>,
    mut dst: Vec<MessageRecord>,
    add_flags: &Flags,
    remove_flags: &Flags,
) -> ReplicationPlan {
    debug!("computing differences between source and destination");

    src.sort_by(|a, b| a.identity.cmp(&b.identity));
    dst.sort_by(|a, b| a.identity.cmp(&b.identity));

    let mut plan = ReplicationPlan::default();
    let mut i_src = 0;
    let mut i_dst = 0;

    while i_src < src.len() {
        if i_src > 0 && src[i_src - 1].identity == src[i_src].identity {
            warn!("duplicate message identity {}", src[i_src].identity);
            plan.duplicates += 1;
            i_src += 1;
            continue;
        }

        let effective_flags = apply_flag_policy(&src[i_src].flags, add_flags, remove_flags);

        let order = match dst.get(i_dst) {
            Some(dst) => src[i_src].identity.cmp(&dst.identity),
            // Source tail: everything left is missing on the
            // destination.
            None => Ordering::Less,
        };

        match order {
            Ordering::Equal => {
                if effective_flags != dst[i_dst].flags {
                    plan.updated
                        .entry(effective_flags)
                        .or_default()
                        .push(dst[i_dst].clone());
                }
                i_src += 1;
                i_dst += 1;
            }
            Ordering::Less => {
                let mut record = src[i_src].clone();
                record.flags = effective_flags;
                plan.added.push(record);
                i_src += 1;
            }
            Ordering::Greater => {
                plan.removed.push(dst[i_dst].clone());
                i_dst += 1;
            }
        }
    }

    // Destination tail: removed on the source.
    plan.removed.extend(dst[i_dst..].iter().cloned());

    debug!(
        "{} messages added, {} updated and {} removed",
        plan.added.len(),
        plan.updated_count(),
        plan.removed.len(),
    );

    plan
}

#[cfg(test)]
mod tests {
    use crate::{
        email::{Flag, Flags},
        replicate::identity::MessageIdentity,
    };

    use super::{apply_flag_policy, diff, MessageRecord};

    fn record(uid: u32, id: &str, flags: &str) -> MessageRecord {
        MessageRecord {
            uid,
            identity: MessageIdentity::new(id, id),
            flags: Flags::from(flags),
        }
    }

    #[test]
    fn identical_sides_produce_an_empty_plan() {
        let src = vec![record(1, "a", "\\Seen"), record(2, "b", "")];
        let dst = vec![record(10, "b", ""), record(11, "a", "\\Seen")];

        let plan = diff(src, dst, &Flags::default(), &Flags::default());
        assert!(plan.is_empty());
        assert_eq!(0, plan.duplicates);
    }

    #[test]
    fn source_extra_is_added_with_source_uid() {
        let src = vec![record(1, "a", ""), record(2, "b", "")];
        let dst = vec![record(10, "a", "")];

        let plan = diff(src, dst, &Flags::default(), &Flags::default());
        assert_eq!(1, plan.added.len());
        assert_eq!(2, plan.added[0].uid);
        assert!(plan.removed.is_empty());
        assert!(plan.updated.is_empty());
    }

    #[test]
    fn destination_extra_is_removed_with_destination_uid() {
        let src = vec![record(1, "a", "")];
        let dst = vec![record(10, "a", ""), record(11, "b", "")];

        let plan = diff(src, dst, &Flags::default(), &Flags::default());
        assert_eq!(1, plan.removed.len());
        assert_eq!(11, plan.removed[0].uid);
        assert!(plan.added.is_empty());
    }

    #[test]
    fn differing_flags_produce_an_update_keyed_by_target_state() {
        let src = vec![record(1, "a", "\\Seen \\Flagged")];
        let dst = vec![record(10, "a", "\\Seen")];

        let plan = diff(src, dst, &Flags::default(), &Flags::default());
        let expected = Flags::from("\\Seen \\Flagged");
        assert_eq!(1, plan.updated[&expected].len());
        assert_eq!(10, plan.updated[&expected][0].uid);
    }

    #[test]
    fn flag_policy_can_suppress_spurious_updates() {
        // The source lacks \Seen but the policy forces it on; the
        // destination already has it, so nothing to do.
        let src = vec![record(1, "a", "")];
        let dst = vec![record(10, "a", "\\Seen")];

        let plan = diff(
            src,
            dst,
            &Flags::from_iter([Flag::Seen]),
            &Flags::default(),
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn flag_policy_applies_to_added_messages() {
        let src = vec![record(1, "a", "Junk")];
        let dst = vec![];

        let plan = diff(
            src,
            dst,
            &Flags::from_iter([Flag::Seen]),
            &Flags::from_iter([Flag::Custom("Junk".into())]),
        );
        assert_eq!(Flags::from("\\Seen"), plan.added[0].flags);
    }

    #[test]
    fn duplicate_source_identities_are_skipped_with_a_warning() {
        let src = vec![record(1, "a", ""), record(2, "a", ""), record(3, "b", "")];
        let dst = vec![record(10, "a", "")];

        let plan = diff(src, dst, &Flags::default(), &Flags::default());
        assert_eq!(1, plan.duplicates);
        assert_eq!(1, plan.added.len());
        assert_eq!(3, plan.added[0].uid);
    }

    #[test]
    fn duplicate_in_source_tail_is_also_skipped() {
        let src = vec![record(1, "a", ""), record(2, "b", ""), record(3, "b", "")];
        let dst = vec![record(10, "a", "")];

        let plan = diff(src, dst, &Flags::default(), &Flags::default());
        assert_eq!(1, plan.duplicates);
        assert_eq!(1, plan.added.len());
    }

    #[test]
    fn running_the_plan_twice_is_idempotent() {
        // Applying the first plan makes both sides identical; the
        // second diff must come back empty.
        let src = vec![record(1, "a", "\\Seen"), record(2, "b", "")];
        let dst = vec![record(10, "a", "")];

        let plan = diff(
            src.clone(),
            dst,
            &Flags::default(),
            &Flags::default(),
        );
        assert_eq!(1, plan.added.len());
        assert_eq!(1, plan.updated_count());

        let new_dst = vec![record(10, "a", "\\Seen"), record(11, "b", "")];
        let plan = diff(src, new_dst, &Flags::default(), &Flags::default());
        assert!(plan.is_empty());
    }

    #[test]
    fn effective_flags_union_minus_removals() {
        let flags = apply_flag_policy(
            &Flags::from("\\Seen Junk"),
            &Flags::from("\\Flagged"),
            &Flags::from("Junk"),
        );
        assert_eq!(Flags::from("\\Seen \\Flagged"), flags);
    }
}
