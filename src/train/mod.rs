//! Training module.
//!
//! This module contains the incremental scan processor feeding the
//! spam filter: checkpointed, MODSEQ-driven folder scans that find
//! changed messages and route them to a classification sink.

pub mod classifier;
pub use classifier::SpamClassifier;

pub mod data;
pub use data::MessageData;

pub mod processor;
pub use processor::{ImapProcessor, ProcessReport, UserProcessor};

pub mod sink;
pub use sink::ClassificationSink;
