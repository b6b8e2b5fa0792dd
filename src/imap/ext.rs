//! IMAP extensions module.
//!
//! CONDSTORE and annotation support is missing from the client
//! library, so the handful of commands the incremental scanner needs
//! go over the wire as raw commands and come back through small
//! response parsers.

use log::trace;
use regex::Regex;
use std::collections::HashMap;
use utf7_imap::encode_utf7_imap as encode_utf7;

use super::session::{Error, MailSession, OpenMode, Result};

/// Represents the change-tracking cursors of a folder as reported by
/// STATUS or EXAMINE. A missing or zero HIGHESTMODSEQ means the
/// server does not track mod-sequences for this folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FolderStatus {
    pub uidvalidity: u64,
    pub uidnext: u64,
    pub highest_modseq: Option<u64>,
}

impl MailSession {
    /// Queries UIDVALIDITY, UIDNEXT and HIGHESTMODSEQ without opening
    /// the folder. This is the cheap probe that lets unchanged folders
    /// be skipped entirely.
    pub fn status_condstore(&mut self, folder: &str) -> Result<FolderStatus> {
        let encoded = encode_utf7(folder.to_owned());
        let response = self.run(&format!(
            "STATUS {} (UIDVALIDITY UIDNEXT HIGHESTMODSEQ)",
            quote(&encoded)
        ))?;
        parse_folder_status(&String::from_utf8_lossy(&response), folder)
    }

    /// Opens the folder read-only with CONDSTORE enabled and returns
    /// the cursors reported by the untagged EXAMINE responses.
    pub fn examine_condstore(&mut self, folder: &str) -> Result<FolderStatus> {
        let encoded = encode_utf7(folder.to_owned());
        self.opened = None;
        let response = self.run(&format!("EXAMINE {} (CONDSTORE)", quote(&encoded)))?;
        let status = parse_examine_status(&String::from_utf8_lossy(&response), folder)?;
        self.opened = Some((folder.to_owned(), OpenMode::ReadOnly));
        Ok(status)
    }

    /// Sets a folder annotation. Used to switch CONDSTORE on for
    /// servers that keep it off by default.
    pub fn set_annotation(&mut self, folder: &str, entry: &str, value: &str) -> Result<()> {
        let encoded = encode_utf7(folder.to_owned());
        self.run(&format!(
            "SETANNOTATION {} {} ({} {})",
            quote(&encoded),
            quote(entry),
            quote("value.shared"),
            quote(value)
        ))?;
        Ok(())
    }

    /// Sorts the messages matching the query by MODSEQ, ascending.
    /// The ordering matters: the caller advances its checkpoint per
    /// processed message.
    pub fn sort_modseq(&mut self, query: &str) -> Result<Vec<u32>> {
        let response = self.run(&format!("SORT (MODSEQ) UTF-8 {}", query))?;
        Ok(parse_sort(&String::from_utf8_lossy(&response)))
    }

    /// Fetches the MODSEQ of each message in the given sequence set.
    pub fn fetch_modseqs(&mut self, set: &str) -> Result<HashMap<u32, u64>> {
        let response = self.run(&format!("FETCH {} (MODSEQ)", set))?;
        Ok(parse_modseqs(&String::from_utf8_lossy(&response)))
    }
}

fn quote(value: &str) -> String {
    format!(
        "\"{}\"",
        value.replace('\\', "\\\\").replace('"', "\\\"")
    )
}

fn capture_u64(response: &str, pattern: &str) -> Option<u64> {
    let re = Regex::new(pattern).ok()?;
    re.captures(response)?.get(1)?.as_str().parse().ok()
}

fn parse_folder_status(response: &str, folder: &str) -> Result<FolderStatus> {
    trace!("status response: {:?}", response);

    let uidvalidity = capture_u64(response, r"UIDVALIDITY (\d+)")
        .ok_or_else(|| Error::ParseResponseError("UIDVALIDITY", folder.to_owned()))?;
    let uidnext = capture_u64(response, r"UIDNEXT (\d+)")
        .ok_or_else(|| Error::ParseResponseError("UIDNEXT", folder.to_owned()))?;
    let highest_modseq = capture_u64(response, r"HIGHESTMODSEQ (\d+)").filter(|&n| n > 0);

    Ok(FolderStatus {
        uidvalidity,
        uidnext,
        highest_modseq,
    })
}

fn parse_examine_status(response: &str, folder: &str) -> Result<FolderStatus> {
    trace!("examine response: {:?}", response);

    let uidvalidity = capture_u64(response, r"\[UIDVALIDITY (\d+)\]")
        .ok_or_else(|| Error::ParseResponseError("UIDVALIDITY", folder.to_owned()))?;
    let uidnext = capture_u64(response, r"\[UIDNEXT (\d+)\]")
        .ok_or_else(|| Error::ParseResponseError("UIDNEXT", folder.to_owned()))?;
    let highest_modseq = capture_u64(response, r"\[HIGHESTMODSEQ (\d+)\]").filter(|&n| n > 0);

    Ok(FolderStatus {
        uidvalidity,
        uidnext,
        highest_modseq,
    })
}

fn parse_sort(response: &str) -> Vec<u32> {
    let mut seqs = Vec::new();
    for line in response.lines() {
        if let Some(rest) = line.strip_prefix("* SORT") {
            seqs.extend(
                rest.split_whitespace()
                    .filter_map(|seq| seq.parse::<u32>().ok()),
            );
        }
    }
    seqs
}

fn parse_modseqs(response: &str) -> HashMap<u32, u64> {
    let mut modseqs = HashMap::new();
    let re = match Regex::new(r"\* (\d+) FETCH \(MODSEQ \((\d+)\)\)") {
        Ok(re) => re,
        Err(_) => return modseqs,
    };
    for caps in re.captures_iter(response) {
        if let (Ok(seq), Ok(modseq)) = (caps[1].parse(), caps[2].parse()) {
            modseqs.insert(seq, modseq);
        }
    }
    modseqs
}

#[cfg(test)]
mod tests {
    use super::{parse_examine_status, parse_folder_status, parse_modseqs, parse_sort, quote};

    #[test]
    fn parse_status_response() {
        let response =
            "* STATUS \"INBOX\" (UIDVALIDITY 1146048818 UIDNEXT 9741 HIGHESTMODSEQ 65422)\r\n";
        let status = parse_folder_status(response, "INBOX").unwrap();
        assert_eq!(1146048818, status.uidvalidity);
        assert_eq!(9741, status.uidnext);
        assert_eq!(Some(65422), status.highest_modseq);
    }

    #[test]
    fn parse_status_without_modseq() {
        let response = "* STATUS \"INBOX\" (UIDVALIDITY 3 UIDNEXT 5 HIGHESTMODSEQ 0)\r\n";
        let status = parse_folder_status(response, "INBOX").unwrap();
        assert_eq!(None, status.highest_modseq);
    }

    #[test]
    fn parse_status_missing_uidvalidity_is_an_error() {
        assert!(parse_folder_status("* STATUS \"INBOX\" (UIDNEXT 5)\r\n", "INBOX").is_err());
    }

    #[test]
    fn parse_examine_response() {
        let response = "\
            * 172 EXISTS\r\n\
            * OK [UIDVALIDITY 3857529045] UIDs valid\r\n\
            * OK [UIDNEXT 4392] Predicted next UID\r\n\
            * OK [HIGHESTMODSEQ 715194045007] Highest\r\n";
        let status = parse_examine_status(response, "INBOX").unwrap();
        assert_eq!(3857529045, status.uidvalidity);
        assert_eq!(4392, status.uidnext);
        assert_eq!(Some(715194045007), status.highest_modseq);
    }

    #[test]
    fn parse_sort_response() {
        assert_eq!(vec![5, 3, 8], parse_sort("* SORT 5 3 8\r\n"));
        assert_eq!(Vec::<u32>::new(), parse_sort("* SORT\r\n"));
    }

    #[test]
    fn parse_modseqs_response() {
        let response = "\
            * 4 FETCH (MODSEQ (65402))\r\n\
            * 5 FETCH (MODSEQ (65403))\r\n";
        let modseqs = parse_modseqs(response);
        assert_eq!(Some(&65402), modseqs.get(&4));
        assert_eq!(Some(&65403), modseqs.get(&5));
    }

    #[test]
    fn quote_escapes() {
        assert_eq!("\"INBOX\"", quote("INBOX"));
        assert_eq!("\"a\\\"b\"", quote("a\"b"));
    }
}
