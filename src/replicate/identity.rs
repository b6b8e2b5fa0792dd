//! Message identity module.
//!
//! Two servers replicating the same mailbox share no UIDs, so
//! messages are matched by an identity derived from envelope
//! metadata: the Message-ID when there is one, otherwise a composite
//! of date, subject and address lists. The identity is deterministic
//! and independent of the order the server reports addresses in.

use imap_proto::types::{Address, Envelope};
use std::{cmp::Ordering, fmt};

/// Joins the identity components; cannot appear inside any of them.
const SEP: char = '\0';

/// Represents the stable identity of a message. The hash is the
/// primary comparison key, the full identity string the tie-break.
#[derive(Debug, Clone)]
pub struct MessageIdentity {
    hash: u64,
    id: String,
    descr: String,
}

impl MessageIdentity {
    /// Builds an identity from a raw identity string.
    pub fn new(id: impl Into<String>, descr: impl Into<String>) -> Self {
        let id = id.into();

        let digest = md5::compute(id.as_bytes());
        let mut bytes = [0; 8];
        bytes.copy_from_slice(&digest.0[..8]);

        Self {
            hash: u64::from_be_bytes(bytes),
            id,
            descr: descr.into(),
        }
    }

    /// A short human-readable description (sender and subject), only
    /// meant for warnings.
    pub fn descr(&self) -> &str {
        &self.descr
    }
}

impl PartialEq for MessageIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.id == other.id
    }
}

impl Eq for MessageIdentity {}

impl PartialOrd for MessageIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MessageIdentity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.hash
            .cmp(&other.hash)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl fmt::Display for MessageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.descr)
    }
}

/// Computes the identity of a message from its envelope.
pub fn identity_of(envelope: &Envelope<'_>) -> MessageIdentity {
    let date = normalize_date(&text(envelope.date.as_deref()));
    let subject = text(envelope.subject.as_deref());
    let message_id = text(envelope.message_id.as_deref());
    let message_id = message_id.trim();

    let id = if !message_id.is_empty() {
        format!("{}{}{}", date, SEP, message_id)
    } else {
        format!(
            "{}{}{}{}{}{}{}{}{}{}{}",
            date,
            SEP,
            subject,
            SEP,
            addrlist(&envelope.from),
            SEP,
            addrlist(&envelope.to),
            SEP,
            addrlist(&envelope.cc),
            SEP,
            addrlist(&envelope.bcc),
        )
    };

    let descr = format!("{}:{}", addrlist(&envelope.from), decode_subject(envelope));

    MessageIdentity::new(id, descr)
}

fn text(bytes: Option<&[u8]>) -> String {
    bytes
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        .unwrap_or_default()
}

/// Normalizes an RFC2822 date to its epoch timestamp so that two
/// servers spelling the same date differently still agree. A date
/// that does not parse is compared literally.
fn normalize_date(date: &str) -> String {
    if date.is_empty() {
        return String::new();
    }
    match mailparse::dateparse(date) {
        Ok(timestamp) => timestamp.to_string(),
        Err(_) => date.to_owned(),
    }
}

/// Renders an address list as sorted, deduplicated `mailbox@host`
/// entries joined by commas. Entries lacking either part are dropped.
/// Sorting makes the result independent of server-side ordering.
fn addrlist(addrs: &Option<Vec<Address<'_>>>) -> String {
    let addrs = match addrs {
        Some(addrs) => addrs,
        None => return String::new(),
    };

    let mut rendered: Vec<String> = addrs
        .iter()
        .filter_map(|addr| {
            let mailbox = addr.mailbox.as_deref()?;
            let host = addr.host.as_deref()?;
            Some(format!("{}@{}", text(Some(mailbox)), text(Some(host))))
        })
        .collect();
    rendered.sort();
    rendered.dedup();
    rendered.join(",")
}

fn decode_subject(envelope: &Envelope<'_>) -> String {
    match envelope.subject.as_deref() {
        None => String::new(),
        Some(subject) => rfc2047_decoder::decode(subject)
            .unwrap_or_else(|_| String::from_utf8_lossy(subject).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use imap_proto::types::{Address, Envelope};
    use std::borrow::Cow;

    use super::identity_of;

    fn addr(mailbox: &'static str, host: &'static str) -> Address<'static> {
        Address {
            name: None,
            adl: None,
            mailbox: Some(Cow::Borrowed(mailbox.as_bytes())),
            host: Some(Cow::Borrowed(host.as_bytes())),
        }
    }

    fn envelope(
        date: Option<&'static str>,
        subject: Option<&'static str>,
        message_id: Option<&'static str>,
        from: Vec<Address<'static>>,
        to: Vec<Address<'static>>,
    ) -> Envelope<'static> {
        Envelope {
            date: date.map(|date| Cow::Borrowed(date.as_bytes())),
            subject: subject.map(|subject| Cow::Borrowed(subject.as_bytes())),
            from: Some(from),
            sender: None,
            reply_to: None,
            to: Some(to),
            cc: None,
            bcc: None,
            in_reply_to: None,
            message_id: message_id.map(|id| Cow::Borrowed(id.as_bytes())),
        }
    }

    #[test]
    fn message_id_wins_over_address_order() {
        let a = envelope(
            Some("Thu, 13 Apr 2006 12:00:00 +0200"),
            Some("hello"),
            Some("<id@example.org>"),
            vec![addr("alice", "example.org"), addr("bob", "example.org")],
            vec![],
        );
        let b = envelope(
            Some("Thu, 13 Apr 2006 12:00:00 +0200"),
            Some("different subject"),
            Some("<id@example.org>"),
            vec![addr("bob", "example.org"), addr("alice", "example.org")],
            vec![],
        );
        assert_eq!(identity_of(&a), identity_of(&b));
    }

    #[test]
    fn fallback_identity_ignores_address_order() {
        let a = envelope(
            Some("Thu, 13 Apr 2006 12:00:00 +0200"),
            Some("hello"),
            None,
            vec![addr("alice", "example.org")],
            vec![addr("bob", "example.org"), addr("carol", "example.org")],
        );
        let b = envelope(
            Some("Thu, 13 Apr 2006 12:00:00 +0200"),
            Some("hello"),
            None,
            vec![addr("alice", "example.org")],
            vec![addr("carol", "example.org"), addr("bob", "example.org")],
        );
        assert_eq!(identity_of(&a), identity_of(&b));
    }

    #[test]
    fn fallback_identity_distinguishes_subjects() {
        let a = envelope(None, Some("hello"), None, vec![], vec![]);
        let b = envelope(None, Some("goodbye"), None, vec![], vec![]);
        assert_ne!(identity_of(&a), identity_of(&b));
    }

    #[test]
    fn empty_message_id_falls_back_to_composite() {
        let with_empty = envelope(None, Some("hello"), Some("  "), vec![], vec![]);
        let without = envelope(None, Some("hello"), None, vec![], vec![]);
        assert_eq!(identity_of(&with_empty), identity_of(&without));
    }

    #[test]
    fn equivalent_date_spellings_agree() {
        let a = envelope(
            Some("Thu, 13 Apr 2006 12:00:00 +0200"),
            None,
            Some("<id@example.org>"),
            vec![],
            vec![],
        );
        let b = envelope(
            Some("Thu, 13 Apr 2006 10:00:00 +0000"),
            None,
            Some("<id@example.org>"),
            vec![],
            vec![],
        );
        assert_eq!(identity_of(&a), identity_of(&b));
    }

    #[test]
    fn addresses_without_host_are_dropped() {
        let incomplete = Address {
            name: None,
            adl: None,
            mailbox: Some(Cow::Borrowed(b"undisclosed-recipients".as_slice())),
            host: None,
        };
        let a = envelope(None, Some("hello"), None, vec![], vec![incomplete]);
        let b = envelope(None, Some("hello"), None, vec![], vec![]);
        assert_eq!(identity_of(&a), identity_of(&b));
    }
}
