use replimap::{
    diff,
    email::{Flag, Flags},
    state::{Checkpoint, CheckpointFile},
    MessageIdentity, MessageRecord,
};

fn record(uid: u32, id: &str, flags: &str) -> MessageRecord {
    MessageRecord {
        uid,
        identity: MessageIdentity::new(id, id),
        flags: Flags::from(flags),
    }
}

// A full replication round: the plan brings the destination in line,
// and a second diff over the converged state is empty.
#[test]
fn test_plan_converges() {
    let src: Vec<MessageRecord> = (0..100)
        .map(|n| record(n, &format!("msg-{}", n), "\\Seen"))
        .collect();

    // Destination: the first 40 messages already there (10 of them
    // with stale flags), plus 5 messages that no longer exist on the
    // source.
    let mut dst: Vec<MessageRecord> = (0..40)
        .map(|n| {
            let flags = if n < 10 { "" } else { "\\Seen" };
            record(1000 + n, &format!("msg-{}", n), flags)
        })
        .collect();
    dst.extend((0..5).map(|n| record(2000 + n, &format!("gone-{}", n), "\\Seen")));

    let plan = diff(src.clone(), dst, &Flags::default(), &Flags::default());

    assert_eq!(60, plan.added.len());
    assert_eq!(10, plan.updated_count());
    assert_eq!(5, plan.removed.len());
    assert_eq!(0, plan.duplicates);

    // All removed records carry destination uids, all added records
    // source uids.
    assert!(plan.removed.iter().all(|msg| msg.uid >= 2000));
    assert!(plan.added.iter().all(|msg| msg.uid < 100));

    // Pretend the plan was applied: destination now mirrors source.
    let dst: Vec<MessageRecord> = (0..100)
        .map(|n| record(3000 + n, &format!("msg-{}", n), "\\Seen"))
        .collect();
    let plan = diff(src, dst, &Flags::default(), &Flags::default());
    assert!(plan.is_empty());
}

// 2500 messages to add with an add batch size of 64 end up in exactly
// ceil(2500 / 64) = 40 append batches.
#[test]
fn test_add_batch_count() {
    let src: Vec<MessageRecord> = (0..2500)
        .map(|n| record(n, &format!("msg-{:04}", n), ""))
        .collect();

    let plan = diff(src, vec![], &Flags::default(), &Flags::default());
    assert_eq!(2500, plan.added.len());
    assert_eq!(
        40,
        plan.added.chunks(replimap::replicate::folder::ADD_BATCH_SIZE).count()
    );
}

// The flag policy makes replicated junk mail land unflagged and seen,
// and suppresses updates for messages already in that state.
#[test]
fn test_flag_policy_applied_to_plan() {
    let add = Flags::from_iter([Flag::Seen]);
    let remove = Flags::from_iter([Flag::Custom("Junk".into())]);

    let src = vec![record(1, "a", "Junk"), record(2, "b", "Junk \\Seen")];
    let dst = vec![record(10, "b", "\\Seen")];

    let plan = diff(src, dst, &add, &remove);

    assert_eq!(1, plan.added.len());
    assert_eq!(Flags::from("\\Seen"), plan.added[0].flags);
    // "b" already matches its effective flags on the destination.
    assert!(plan.updated.is_empty());
}

// A replication checkpoint survives a round trip and a lock prevents
// a concurrent run on the same folder.
#[test]
fn test_checkpoint_cycle() {
    let state_dir = tempfile::tempdir().unwrap();

    let mut checkpoint = CheckpointFile::open(state_dir.path(), "alice.INBOX").unwrap();
    assert_eq!(Checkpoint::default(), checkpoint.checkpoint());

    checkpoint.checkpoint_mut().uidvalidity = 1146048818;
    checkpoint.checkpoint_mut().uidnext = 9741;
    checkpoint.checkpoint_mut().highest_modseq = 65422;
    checkpoint.save().unwrap();

    assert!(CheckpointFile::open(state_dir.path(), "alice.INBOX").is_err());
    drop(checkpoint);

    let checkpoint = CheckpointFile::open(state_dir.path(), "alice.INBOX").unwrap();
    assert!(checkpoint
        .checkpoint()
        .matches(1146048818, 9741, 65422));
}
