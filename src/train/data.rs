//! Message data module.
//!
//! Per-message state for the training pipeline: the classification
//! keywords tracked on the server, the classifier signature extracted
//! from the headers, and the raw bytes for corpus feeding.

use log::warn;
use mailparse::MailHeaderMap;
use std::collections::HashMap;

use crate::email::{Flag, Flags};

/// Keyword recording that the filter classified a message innocent.
pub const CLASSIFIED_INNOCENT: &str = "$ClassifiedInnocent";
/// Keyword recording that the filter classified a message junk.
pub const CLASSIFIED_JUNK: &str = "$ClassifiedJunk";
/// Keyword mail clients set on junk messages.
pub const JUNK: &str = "Junk";

/// Header carrying the classifier's per-message signature.
pub const SIGNATURE_HEADER: &str = "X-DSPAM-Signature";

/// Represents one message during a training scan. The three keyword
/// booleans mirror server flags; the processor diffs them before and
/// after classification and stores the changes back.
#[derive(Debug, Default, Clone)]
pub struct MessageData {
    pub seq: u32,
    pub uid: u32,
    pub modseq: u64,
    pub classified_innocent: bool,
    pub classified_junk: bool,
    pub junk: bool,
    pub signature: Option<String>,
    pub subject: Option<String>,
    pub raw: Vec<u8>,
}

impl MessageData {
    /// Builds the message data from a fetch response and the modseq
    /// map of its batch. Returns None when UID, MODSEQ or body are
    /// missing, which counts as a broken message.
    pub fn from_fetch(
        fetch: &imap::types::Fetch,
        modseqs: &HashMap<u32, u64>,
    ) -> Option<Self> {
        let seq = fetch.message;
        let uid = fetch.uid?;
        let modseq = *modseqs.get(&seq)?;
        let raw = fetch.body()?.to_vec();

        let mut data = Self {
            seq,
            uid,
            modseq,
            raw,
            ..Self::default()
        };

        for flag in fetch.flags() {
            match Flag::from(flag) {
                Flag::Custom(flag) if flag == CLASSIFIED_INNOCENT => {
                    data.classified_innocent = true
                }
                Flag::Custom(flag) if flag == CLASSIFIED_JUNK => data.classified_junk = true,
                Flag::Custom(flag) if flag == JUNK => data.junk = true,
                _ => (),
            }
        }

        match mailparse::parse_headers(&data.raw) {
            Ok((headers, _)) => {
                data.signature = headers
                    .get_first_value(SIGNATURE_HEADER)
                    .map(|sig| sig.trim().to_owned())
                    .filter(|sig| !sig.is_empty() && sig.chars().all(char::is_alphanumeric));
                data.subject = headers.get_first_value("Subject");
            }
            Err(err) => warn!("cannot parse headers of message {}: {}", uid, err),
        }

        Some(data)
    }

    pub fn subject(&self) -> &str {
        self.subject.as_deref().unwrap_or_default()
    }

    /// Computes the keyword changes between the originally fetched
    /// state and the state after classification, as flag sets to add
    /// and to remove.
    pub fn diff_flags(old: &Self, new: &Self) -> (Flags, Flags) {
        let tracked: [(&str, fn(&Self) -> bool); 3] = [
            (CLASSIFIED_INNOCENT, |data| data.classified_innocent),
            (CLASSIFIED_JUNK, |data| data.classified_junk),
            (JUNK, |data| data.junk),
        ];

        let mut added = Flags::default();
        let mut removed = Flags::default();
        for (flag, get) in tracked {
            if get(new) && !get(old) {
                added.insert(Flag::Custom(flag.to_owned()));
            }
            if !get(new) && get(old) {
                removed.insert(Flag::Custom(flag.to_owned()));
            }
        }

        (added, removed)
    }
}

#[cfg(test)]
mod tests {
    use crate::email::Flags;

    use super::MessageData;

    #[test]
    fn diff_flags_reports_transitions() {
        let old = MessageData {
            classified_junk: true,
            junk: true,
            ..MessageData::default()
        };
        let new = MessageData {
            classified_innocent: true,
            ..MessageData::default()
        };

        let (added, removed) = MessageData::diff_flags(&old, &new);
        assert_eq!(Flags::from("$ClassifiedInnocent"), added);
        assert_eq!(Flags::from("$ClassifiedJunk Junk"), removed);
    }

    #[test]
    fn diff_flags_of_identical_states_is_empty() {
        let data = MessageData {
            classified_innocent: true,
            ..MessageData::default()
        };

        let (added, removed) = MessageData::diff_flags(&data, &data.clone());
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }
}
