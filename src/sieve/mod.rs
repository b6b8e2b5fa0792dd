//! Sieve module.
//!
//! This module contains the sieve filter script replication. The
//! managesieve wire client is an external collaborator plugged in
//! through the [`SieveSession`] trait; this module only decides what
//! to copy, activate and delete.

use log::info;
use std::result;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to authenticate to sieve server as {0}")]
    AuthenticateError(String),
    #[error("failed to authorize sieve access to {0} as {1}")]
    AuthorizeError(String, String),
    #[error("sieve command failed: {0}")]
    CommandError(String),
    #[error("cannot find sieve script {0}")]
    FindScriptError(String),
}

pub type Result<T> = result::Result<T, Error>;

/// Represents one script as listed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SieveScript {
    pub name: String,
    pub active: bool,
}

/// Represents an authenticated managesieve session. Implemented by
/// the wire-level client of the outer layer.
pub trait SieveSession {
    /// Lists the scripts stored on the server.
    fn scripts(&mut self) -> Result<Vec<SieveScript>>;

    /// Returns the content of the given script.
    fn get_script(&mut self, name: &str) -> Result<String>;

    /// Uploads a script, overwriting any previous version.
    fn put_script(&mut self, name: &str, body: &str) -> Result<()>;

    /// Marks the given script as the active one.
    fn set_active(&mut self, name: &str) -> Result<()>;

    /// Deletes the given script.
    fn delete_script(&mut self, name: &str) -> Result<()>;
}

/// Copies every source script to the destination (preserving which
/// one is active), then removes destination scripts that no longer
/// exist on the source unless dont-delete is set.
pub struct SieveReplicator {
    dont_delete: bool,
}

impl SieveReplicator {
    pub fn new(dont_delete: bool) -> Self {
        Self { dont_delete }
    }

    pub fn replicate(
        &self,
        src: &mut dyn SieveSession,
        dst: &mut dyn SieveSession,
    ) -> Result<()> {
        let mut src_names = Vec::new();

        for script in src.scripts()? {
            info!(
                "copying script {} ({})",
                script.name,
                if script.active { "active" } else { "inactive" }
            );
            let body = src.get_script(&script.name)?;
            dst.put_script(&script.name, &body)?;
            if script.active {
                dst.set_active(&script.name)?;
            }
            src_names.push(script.name);
        }

        for script in dst.scripts()? {
            if src_names.contains(&script.name) || self.dont_delete {
                continue;
            }
            info!("removing script {} from destination", script.name);
            dst.delete_script(&script.name)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{Error, Result, SieveReplicator, SieveScript, SieveSession};

    #[derive(Default)]
    struct FakeSieve {
        scripts: BTreeMap<String, String>,
        active: Option<String>,
    }

    impl SieveSession for FakeSieve {
        fn scripts(&mut self) -> Result<Vec<SieveScript>> {
            Ok(self
                .scripts
                .keys()
                .map(|name| SieveScript {
                    name: name.clone(),
                    active: self.active.as_deref() == Some(name.as_str()),
                })
                .collect())
        }

        fn get_script(&mut self, name: &str) -> Result<String> {
            self.scripts
                .get(name)
                .cloned()
                .ok_or_else(|| Error::FindScriptError(name.to_owned()))
        }

        fn put_script(&mut self, name: &str, body: &str) -> Result<()> {
            self.scripts.insert(name.to_owned(), body.to_owned());
            Ok(())
        }

        fn set_active(&mut self, name: &str) -> Result<()> {
            self.active = Some(name.to_owned());
            Ok(())
        }

        fn delete_script(&mut self, name: &str) -> Result<()> {
            self.scripts
                .remove(name)
                .ok_or_else(|| Error::FindScriptError(name.to_owned()))?;
            Ok(())
        }
    }

    #[test]
    fn scripts_are_copied_with_active_state() {
        let mut src = FakeSieve::default();
        src.scripts.insert("spam".into(), "require \"fileinto\";".into());
        src.scripts.insert("vacation".into(), "# away".into());
        src.active = Some("spam".into());

        let mut dst = FakeSieve::default();

        SieveReplicator::new(false).replicate(&mut src, &mut dst).unwrap();

        assert_eq!(src.scripts, dst.scripts);
        assert_eq!(Some("spam".into()), dst.active);
    }

    #[test]
    fn stale_destination_scripts_are_deleted() {
        let mut src = FakeSieve::default();
        src.scripts.insert("spam".into(), "keep;".into());

        let mut dst = FakeSieve::default();
        dst.scripts.insert("spam".into(), "old;".into());
        dst.scripts.insert("stale".into(), "discard;".into());

        SieveReplicator::new(false).replicate(&mut src, &mut dst).unwrap();

        assert_eq!(Some("keep;"), dst.scripts.get("spam").map(String::as_str));
        assert!(!dst.scripts.contains_key("stale"));
    }

    #[test]
    fn dont_delete_keeps_stale_scripts() {
        let mut src = FakeSieve::default();
        let mut dst = FakeSieve::default();
        dst.scripts.insert("stale".into(), "discard;".into());

        SieveReplicator::new(true).replicate(&mut src, &mut dst).unwrap();

        assert!(dst.scripts.contains_key("stale"));
    }

    #[test]
    fn inactive_scripts_do_not_steal_activation() {
        let mut src = FakeSieve::default();
        src.scripts.insert("a".into(), "a;".into());
        src.scripts.insert("b".into(), "b;".into());
        src.active = Some("b".into());

        let mut dst = FakeSieve::default();

        SieveReplicator::new(false).replicate(&mut src, &mut dst).unwrap();

        assert_eq!(Some("b".into()), dst.active);
    }
}
