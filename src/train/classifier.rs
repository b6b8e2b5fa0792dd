//! Spam classifier module.
//!
//! Drives the external classifier binary through its client CLI:
//! signature-based corrections for misclassified messages, raw
//! message bytes on stdin for corpus training. A non-zero exit status
//! of the binary is a hard error for that invocation.

use log::{debug, info};
use std::path::PathBuf;

use crate::{config::ClassifierConfig, process};

use super::{
    data::MessageData,
    sink::{ClassificationSink, Result},
};

#[derive(Debug, Clone)]
pub struct SpamClassifier {
    command: String,
    opt_in_dir: Option<PathBuf>,
}

impl SpamClassifier {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            opt_in_dir: None,
        }
    }

    /// Only users with a `<user>.dspam` marker file in this directory
    /// get trained.
    pub fn with_opt_in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.opt_in_dir = Some(dir.into());
        self
    }

    pub fn from_config(config: &ClassifierConfig) -> Self {
        let classifier = Self::new(config.command());
        match &config.opt_in {
            Some(dir) => classifier.with_opt_in_dir(dir),
            None => classifier,
        }
    }

    /// Relearns a previously classified message by its signature.
    fn retrain(&self, user: &str, signature: &str, class: &str) -> Result<()> {
        process::run(
            &self.command,
            &[
                "--client",
                "--user",
                user,
                &format!("--signature={}", signature),
                "--source=error",
                &format!("--class={}", class),
            ],
            None,
        )?;
        Ok(())
    }

    /// Feeds a raw message as corpus material.
    fn corpus(&self, user: &str, raw: &[u8], class: &str) -> Result<()> {
        process::run(
            &self.command,
            &[
                "--client",
                "--user",
                user,
                "--source=corpus",
                &format!("--class={}", class),
            ],
            Some(raw),
        )?;
        Ok(())
    }
}

impl ClassificationSink for SpamClassifier {
    fn accepts_user(&self, user: &str) -> bool {
        match &self.opt_in_dir {
            Some(dir) => dir.join(format!("{}.dspam", user)).is_file(),
            None => true,
        }
    }

    fn missed_junk(&self, user: &str, msg: &MessageData) -> Result<()> {
        let signature = match &msg.signature {
            Some(signature) => signature,
            None => {
                debug!("message {} has no signature, cannot retrain", msg.uid);
                return Ok(());
            }
        };
        info!("miss junk: {} ({}: {})", signature, msg.uid, msg.subject());
        self.retrain(user, signature, "spam")
    }

    fn missed_innocent(&self, user: &str, msg: &MessageData) -> Result<()> {
        let signature = match &msg.signature {
            Some(signature) => signature,
            None => {
                debug!("message {} has no signature, cannot retrain", msg.uid);
                return Ok(());
            }
        };
        info!(
            "miss innocent: {} ({}: {})",
            signature,
            msg.uid,
            msg.subject()
        );
        self.retrain(user, signature, "innocent")
    }

    fn corpus_junk(&self, user: &str, msg: &MessageData) -> Result<()> {
        if msg.raw.is_empty() {
            return Ok(());
        }
        info!("corpus junk: {}: {}", msg.uid, msg.subject());
        self.corpus(user, &msg.raw, "spam")
    }

    fn corpus_innocent(&self, user: &str, msg: &MessageData) -> Result<()> {
        if msg.raw.is_empty() {
            return Ok(());
        }
        info!("corpus innocent: {}: {}", msg.uid, msg.subject());
        self.corpus(user, &msg.raw, "innocent")
    }
}
