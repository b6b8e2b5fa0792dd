pub mod config;
pub use config::{AuthMechanism, Config, FoldersConfig, ImapEndpointConfig, LimitsConfig};

pub mod email;
pub use email::{Flag, Flags};

pub mod imap;
pub use crate::imap::{FolderStatus, MailSession, SessionHandle};

pub mod process;

pub mod replicate;
pub use replicate::{
    diff, identity_of, FolderReplicator, ImapReplicator, MessageIdentity, MessageRecord,
    ReplicationPlan,
};

pub mod sieve;
pub use sieve::{SieveReplicator, SieveSession};

pub mod state;
pub use state::{Checkpoint, CheckpointFile};

pub mod train;
pub use train::{ClassificationSink, ImapProcessor, MessageData, SpamClassifier, UserProcessor};
