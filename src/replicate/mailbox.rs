//! Mailbox replication module.
//!
//! Orchestrates the replication of one user's mailbox onto another
//! account: opens the two sessions, enumerates and maps folders
//! between the namespaces, and runs the folder replicator on each,
//! isolating per-folder failures so one broken folder does not abort
//! the whole migration.

use log::{debug, error, info, warn};
use std::result;
use thiserror::Error;
use utf7_imap::decode_utf7_imap as decode_utf7;

use crate::{
    config::{folder, matches_any, Config},
    imap::{self, connect},
    sieve::{self, SieveReplicator, SieveSession},
};

use super::folder::{self as folder_replicator, FolderReplicator, FolderReport};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    SessionError(#[from] imap::Error),
    #[error(transparent)]
    ConfigError(#[from] crate::config::imap::Error),
    #[error(transparent)]
    PatternError(#[from] folder::Error),
    #[error(transparent)]
    FolderError(#[from] folder_replicator::Error),
    #[error(transparent)]
    SieveError(#[from] sieve::Error),
}

pub type Result<T> = result::Result<T, Error>;

/// Represents the outcome of one mailbox replication. The caller
/// decides the process exit status from `is_success`.
#[derive(Debug, Default)]
pub struct MailboxReport {
    /// Successfully replicated folders with their counters.
    pub folders: Vec<(String, FolderReport)>,
    /// Folders that failed and were skipped.
    pub failed: Vec<String>,
}

impl MailboxReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct ImapReplicator<'a> {
    config: &'a Config,
    user_src: String,
    user_dst: String,
    passwd_src: String,
    passwd_dst: String,
}

impl<'a> ImapReplicator<'a> {
    /// Proxy-admin mode: both passwords come from the configured
    /// proxy credentials.
    pub fn new(
        config: &'a Config,
        user_src: impl Into<String>,
        user_dst: impl Into<String>,
    ) -> Result<Self> {
        let passwd_src = config.src.proxy_passwd()?;
        let passwd_dst = config.dst.proxy_passwd()?;
        Ok(Self {
            config,
            user_src: user_src.into(),
            user_dst: user_dst.into(),
            passwd_src,
            passwd_dst,
        })
    }

    /// Single-user mode with explicit passwords.
    pub fn with_passwords(
        config: &'a Config,
        user_src: impl Into<String>,
        user_dst: impl Into<String>,
        passwd_src: impl Into<String>,
        passwd_dst: impl Into<String>,
    ) -> Self {
        Self {
            config,
            user_src: user_src.into(),
            user_dst: user_dst.into(),
            passwd_src: passwd_src.into(),
            passwd_dst: passwd_dst.into(),
        }
    }

    pub fn replicate_mailbox(&self) -> Result<MailboxReport> {
        info!("processing mailbox {} -> {}", self.user_src, self.user_dst);

        let src = connect(&self.config.src, &self.user_src, &self.passwd_src)?;
        let dst = connect(&self.config.dst, &self.user_dst, &self.passwd_dst)?;

        let ignore = self
            .config
            .folders
            .ignore_patterns(src.delimiter())?;

        let folders: Vec<String> = src
            .session()?
            .list("", "*")?
            .iter()
            .map(|name| decode_utf7(name.name().into()))
            .collect();

        let mut report = MailboxReport::default();
        for folder_src in folders {
            if matches_any(&ignore, &folder_src) {
                debug!("ignoring folder {}", folder_src);
                continue;
            }

            let folder_dst = map_folder_name(
                &folder_src,
                self.config.src.prefix(),
                src.delimiter(),
                self.config.dst.prefix(),
                dst.delimiter(),
            );

            info!("processing folder {} -> {}", folder_src, folder_dst);
            let replicator = FolderReplicator::new(
                &src,
                &dst,
                &folder_src,
                &folder_dst,
                self.config.folders.flags_add(&folder_dst),
                self.config.folders.flags_remove(&folder_dst),
                self.config.dst.dont_delete(),
            );
            match replicator.replicate() {
                Ok(folder_report) => {
                    info!(
                        "finished processing folder {} -> {}",
                        folder_src, folder_dst
                    );
                    report.folders.push((folder_src, folder_report));
                }
                Err(err) => {
                    error!("error processing folder {}, skipping it", folder_src);
                    error!("{}", err);
                    report.failed.push(folder_src);
                }
            }
        }

        if let Err(err) = src.close() {
            warn!("error while disconnecting source: {}", err);
        }
        if let Err(err) = dst.close() {
            warn!("error while disconnecting destination: {}", err);
        }

        info!("finished processing mailbox");
        Ok(report)
    }

    /// Replicates sieve scripts over the given managesieve sessions.
    pub fn replicate_sieve(
        &self,
        src: &mut dyn SieveSession,
        dst: &mut dyn SieveSession,
    ) -> Result<()> {
        info!("processing sieve scripts");
        SieveReplicator::new(self.config.dst.dont_delete()).replicate(src, dst)?;
        info!("finished processing sieve scripts");
        Ok(())
    }
}

/// Maps a source folder name into the destination namespace: INBOX
/// stays pinned, the source prefix is stripped, the hierarchy
/// delimiter translated and the destination prefix prepended.
pub fn map_folder_name(
    folder: &str,
    src_prefix: &str,
    src_delim: &str,
    dst_prefix: &str,
    dst_delim: &str,
) -> String {
    if folder.eq_ignore_ascii_case("INBOX") {
        return String::from("INBOX");
    }

    let stripped = if src_prefix.is_empty() {
        folder
    } else {
        let full_prefix = format!("{}{}", src_prefix, src_delim);
        match folder.strip_prefix(&full_prefix) {
            Some(rest) if !rest.is_empty() && !rest.starts_with(src_delim) => rest,
            _ => folder,
        }
    };

    let translated = stripped
        .split(src_delim)
        .collect::<Vec<_>>()
        .join(dst_delim);

    if dst_prefix.is_empty() {
        translated
    } else {
        format!("{}{}{}", dst_prefix, dst_delim, translated)
    }
}

#[cfg(test)]
mod tests {
    use super::map_folder_name;

    #[test]
    fn inbox_is_pinned_case_insensitively() {
        assert_eq!("INBOX", map_folder_name("INBOX", "", ".", "", "/"));
        assert_eq!("INBOX", map_folder_name("inbox", "", ".", "", "/"));
    }

    #[test]
    fn delimiter_is_translated() {
        assert_eq!(
            "Archive/2006/Work",
            map_folder_name("Archive.2006.Work", "", ".", "", "/")
        );
    }

    #[test]
    fn source_prefix_is_stripped() {
        assert_eq!(
            "Sent",
            map_folder_name("INBOX.Sent", "INBOX", ".", "", ".")
        );
    }

    #[test]
    fn destination_prefix_is_added() {
        assert_eq!(
            "INBOX.Sent",
            map_folder_name("Sent", "", "/", "INBOX", ".")
        );
    }

    #[test]
    fn prefix_translation_combined() {
        assert_eq!(
            "mail/Sub/Deep",
            map_folder_name("INBOX.Sub.Deep", "INBOX", ".", "mail", "/")
        );
    }

    #[test]
    fn unrelated_folder_keeps_its_name() {
        assert_eq!(
            "Shared.Stuff",
            map_folder_name("Shared.Stuff", "INBOX", ".", "", ".")
        );
    }
}
