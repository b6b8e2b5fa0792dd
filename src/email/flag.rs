use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents the flag variants.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Flag {
    Seen,
    Answered,
    Flagged,
    Deleted,
    Draft,
    Recent,
    Custom(String),
}

impl Flag {
    pub fn to_imap_flag(&self) -> imap::types::Flag<'static> {
        match self {
            Flag::Seen => imap::types::Flag::Seen,
            Flag::Answered => imap::types::Flag::Answered,
            Flag::Flagged => imap::types::Flag::Flagged,
            Flag::Deleted => imap::types::Flag::Deleted,
            Flag::Draft => imap::types::Flag::Draft,
            Flag::Recent => imap::types::Flag::Recent,
            Flag::Custom(flag) => imap::types::Flag::Custom(flag.clone().into()),
        }
    }
}

impl From<&imap::types::Flag<'_>> for Flag {
    fn from(imap_flag: &imap::types::Flag<'_>) -> Self {
        match imap_flag {
            imap::types::Flag::Seen => Flag::Seen,
            imap::types::Flag::Answered => Flag::Answered,
            imap::types::Flag::Flagged => Flag::Flagged,
            imap::types::Flag::Deleted => Flag::Deleted,
            imap::types::Flag::Draft => Flag::Draft,
            imap::types::Flag::Recent => Flag::Recent,
            imap::types::Flag::MayCreate => Flag::Custom(String::from("MayCreate")),
            imap::types::Flag::Custom(flag) => Flag::Custom(flag.to_string()),
            flag => Flag::Custom(flag.to_string()),
        }
    }
}

impl From<&str> for Flag {
    fn from(flag_str: &str) -> Self {
        match flag_str.trim().trim_start_matches('\\') {
            flag if flag.eq_ignore_ascii_case("seen") => Flag::Seen,
            flag if flag.eq_ignore_ascii_case("answered") => Flag::Answered,
            flag if flag.eq_ignore_ascii_case("flagged") => Flag::Flagged,
            flag if flag.eq_ignore_ascii_case("deleted") => Flag::Deleted,
            flag if flag.eq_ignore_ascii_case("draft") => Flag::Draft,
            flag if flag.eq_ignore_ascii_case("recent") => Flag::Recent,
            flag => Flag::Custom(flag.into()),
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flag::Seen => write!(f, "\\Seen"),
            Flag::Answered => write!(f, "\\Answered"),
            Flag::Flagged => write!(f, "\\Flagged"),
            Flag::Deleted => write!(f, "\\Deleted"),
            Flag::Draft => write!(f, "\\Draft"),
            Flag::Recent => write!(f, "\\Recent"),
            Flag::Custom(flag) => write!(f, "{}", flag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Flag;

    #[test]
    fn flag_from_str() {
        assert_eq!(Flag::Seen, Flag::from("\\Seen"));
        assert_eq!(Flag::Seen, Flag::from("seen"));
        assert_eq!(Flag::Deleted, Flag::from("Deleted"));
        assert_eq!(Flag::Custom("Junk".into()), Flag::from("Junk"));
        assert_eq!(
            Flag::Custom("$ClassifiedJunk".into()),
            Flag::from("$ClassifiedJunk")
        );
    }
}
