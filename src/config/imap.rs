//! IMAP endpoint config module.
//!
//! This module contains the representation of one IMAP server role
//! (source or destination) and its credentials.

use serde::Deserialize;
use std::{env, fmt, fs, io, result, str::FromStr};
use thiserror::Error;

pub const DEFAULT_IMAP_PORT: u16 = 143;

/// Marks a password value as a file reference: the rest of the value
/// is the path of a file holding the actual password.
pub const PASSWD_FILE_MARKER: char = '<';

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot expand password file path {1}")]
    ExpandPasswdFileError(#[source] shellexpand::LookupError<env::VarError>, String),
    #[error("cannot read password file {1}")]
    ReadPasswdFileError(#[source] io::Error, String),
    #[error("cannot get password: password is empty")]
    GetPasswdEmptyError,
    #[error("cannot get proxy password: not configured")]
    GetProxyPasswdMissingError,
    #[error("cannot get proxy user: not configured")]
    GetProxyUserMissingError,
    #[error("cannot parse auth mechanism {0}")]
    ParseAuthMechanismError(String),
}

pub type Result<T> = result::Result<T, Error>;

/// Represents the supported authentication mechanisms. All but LOGIN
/// go through AUTHENTICATE; PLAIN and DIGEST-MD5 support a separate
/// authorization identity for admin-proxy access.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum AuthMechanism {
    #[default]
    Login,
    Plain,
    CramMd5,
    DigestMd5,
}

impl FromStr for AuthMechanism {
    type Err = Error;

    fn from_str(mech: &str) -> Result<Self> {
        match mech.to_uppercase().as_str() {
            "LOGIN" => Ok(Self::Login),
            "PLAIN" => Ok(Self::Plain),
            "CRAM-MD5" => Ok(Self::CramMd5),
            "DIGEST-MD5" => Ok(Self::DigestMd5),
            mech => Err(Error::ParseAuthMechanismError(mech.to_owned())),
        }
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Login => write!(f, "LOGIN"),
            Self::Plain => write!(f, "PLAIN"),
            Self::CramMd5 => write!(f, "CRAM-MD5"),
            Self::DigestMd5 => write!(f, "DIGEST-MD5"),
        }
    }
}

/// Represents one IMAP server role.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ImapEndpointConfig {
    /// Represents the IMAP server host.
    pub server: String,
    /// Represents the IMAP server port.
    pub port: Option<u16>,
    /// Enables SSL.
    pub ssl: Option<bool>,
    /// Enables StartTLS.
    pub starttls: Option<bool>,
    /// Trusts any certificate.
    pub insecure: Option<bool>,
    /// Represents the authentication mechanism.
    pub mech: Option<String>,
    /// Represents the admin user authenticating on behalf of the
    /// replicated mailbox owners.
    pub proxyusr: Option<String>,
    /// Represents the admin password, or a password file reference
    /// when prefixed with [`PASSWD_FILE_MARKER`].
    pub proxypwd: Option<String>,
    /// Represents the folder namespace prefix.
    pub prefix: Option<String>,
    /// Keeps destination messages that no longer exist on the source.
    pub dont_delete: Option<bool>,
}

impl ImapEndpointConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_IMAP_PORT)
    }

    pub fn ssl(&self) -> bool {
        self.ssl.unwrap_or_default()
    }

    pub fn starttls(&self) -> bool {
        self.starttls.unwrap_or_default()
    }

    pub fn insecure(&self) -> bool {
        self.insecure.unwrap_or_default()
    }

    pub fn mech(&self) -> Result<AuthMechanism> {
        match &self.mech {
            Some(mech) => mech.parse(),
            None => Ok(AuthMechanism::default()),
        }
    }

    pub fn prefix(&self) -> &str {
        self.prefix.as_deref().unwrap_or_default()
    }

    pub fn dont_delete(&self) -> bool {
        self.dont_delete.unwrap_or_default()
    }

    pub fn proxy_user(&self) -> Result<&str> {
        self.proxyusr.as_deref().ok_or(Error::GetProxyUserMissingError)
    }

    /// Resolves the configured proxy password, following a password
    /// file reference if present.
    pub fn proxy_passwd(&self) -> Result<String> {
        let passwd = self
            .proxypwd
            .as_deref()
            .ok_or(Error::GetProxyPasswdMissingError)?;
        resolve_passwd(passwd)
    }
}

/// Resolves a password value: a leading [`PASSWD_FILE_MARKER`] means
/// the rest is a file path whose first line is the password, anything
/// else is the password itself.
pub fn resolve_passwd(value: &str) -> Result<String> {
    match value.strip_prefix(PASSWD_FILE_MARKER) {
        None => Ok(value.to_owned()),
        Some(path) => {
            let path = shellexpand::full(path)
                .map_err(|err| Error::ExpandPasswdFileError(err, path.to_owned()))?;
            let passwd = fs::read_to_string(path.as_ref())
                .map_err(|err| Error::ReadPasswdFileError(err, path.to_string()))?;
            let passwd = passwd.lines().next().ok_or(Error::GetPasswdEmptyError)?;
            Ok(passwd.to_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{resolve_passwd, AuthMechanism};

    #[test]
    fn parse_auth_mechanism() {
        assert_eq!(AuthMechanism::Login, "login".parse().unwrap());
        assert_eq!(AuthMechanism::Plain, "PLAIN".parse().unwrap());
        assert_eq!(AuthMechanism::CramMd5, "cram-md5".parse().unwrap());
        assert_eq!(AuthMechanism::DigestMd5, "DIGEST-MD5".parse().unwrap());
        assert!("KERBEROS_V4".parse::<AuthMechanism>().is_err());
    }

    #[test]
    fn resolve_literal_passwd() {
        assert_eq!("secret", resolve_passwd("secret").unwrap());
    }

    #[test]
    fn resolve_passwd_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "secret").unwrap();
        let value = format!("<{}", file.path().display());
        assert_eq!("secret", resolve_passwd(&value).unwrap());
    }
}
