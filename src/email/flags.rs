use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt, ops};

use super::Flag;

/// Represents the set of flags attached to a message. Backed by an
/// ordered set so that two flag sets compare equal regardless of the
/// order the server reported them in.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Flags(pub BTreeSet<Flag>);

impl Flags {
    /// Builds the parenthesized flag list used by STORE and APPEND.
    pub fn to_imap_query(&self) -> String {
        self.iter()
            .map(|flag| flag.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn into_imap_flags_vec(self) -> Vec<imap::types::Flag<'static>> {
        self.iter().map(Flag::to_imap_flag).collect()
    }

    /// Drops the Recent flag, which is transient and meaningless for
    /// comparison or replication.
    pub fn without_recent(mut self) -> Self {
        self.0.remove(&Flag::Recent);
        self
    }
}

impl ops::Deref for Flags {
    type Target = BTreeSet<Flag>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl ops::DerefMut for Flags {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut glue = "";

        for flag in &self.0 {
            write!(f, "{}{}", glue, flag)?;
            glue = " ";
        }

        Ok(())
    }
}

impl From<&str> for Flags {
    fn from(flags: &str) -> Self {
        Flags(
            flags
                .split_whitespace()
                .map(|flag| flag.trim().into())
                .collect(),
        )
    }
}

impl From<&[imap::types::Flag<'_>]> for Flags {
    fn from(imap_flags: &[imap::types::Flag<'_>]) -> Self {
        imap_flags.iter().map(Flag::from).collect()
    }
}

impl FromIterator<Flag> for Flags {
    fn from_iter<T: IntoIterator<Item = Flag>>(iter: T) -> Self {
        let mut flags = Flags::default();
        for flag in iter {
            flags.insert(flag);
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::{Flag, Flags};

    #[test]
    fn flags_compare_as_sets() {
        let a = Flags::from("\\Seen \\Flagged Junk");
        let b = Flags::from("Junk \\Flagged \\Seen");
        assert_eq!(a, b);
    }

    #[test]
    fn flags_without_recent() {
        let flags = Flags::from("\\Seen \\Recent").without_recent();
        assert_eq!(flags, Flags::from_iter([Flag::Seen]));
    }

    #[test]
    fn flags_to_imap_query() {
        let flags = Flags::from_iter([Flag::Seen, Flag::Custom("Junk".into())]);
        assert_eq!("\\Seen Junk", flags.to_imap_query());
    }
}
