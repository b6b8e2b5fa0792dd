//! SASL authenticators module.
//!
//! This module contains the authenticators driving the AUTHENTICATE
//! command: PLAIN, CRAM-MD5 and DIGEST-MD5. PLAIN and DIGEST-MD5
//! carry an optional authorization identity distinct from the
//! authentication identity, which is how an admin account opens
//! arbitrary mailboxes.

use log::warn;
use std::{
    collections::HashMap,
    result,
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("cannot parse digest-md5 challenge: missing {0}")]
    MissingChallengeFieldError(&'static str),
    #[error("cannot use digest-md5 algorithm {0:?}: only md5-sess is supported")]
    UnsupportedAlgorithmError(String),
    #[error("cannot use digest-md5 qop {0:?}: only auth is supported")]
    UnsupportedQopError(String),
}

pub type Result<T> = result::Result<T, Error>;

/// Authenticator for the PLAIN mechanism.
pub struct PlainAuthenticator {
    authz_user: Option<String>,
    auth_user: String,
    passwd: String,
}

impl PlainAuthenticator {
    pub fn new(authz_user: Option<String>, auth_user: String, passwd: String) -> Self {
        Self {
            authz_user,
            auth_user,
            passwd,
        }
    }
}

impl imap::Authenticator for PlainAuthenticator {
    type Response = String;

    fn process(&self, _challenge: &[u8]) -> Self::Response {
        format!(
            "{}\0{}\0{}",
            self.authz_user.as_deref().unwrap_or_default(),
            self.auth_user,
            self.passwd
        )
    }
}

/// Authenticator for the CRAM-MD5 mechanism. No authorization
/// identity: the mechanism has no slot for one.
pub struct CramMd5Authenticator {
    user: String,
    passwd: String,
}

impl CramMd5Authenticator {
    pub fn new(user: String, passwd: String) -> Self {
        Self { user, passwd }
    }
}

impl imap::Authenticator for CramMd5Authenticator {
    type Response = String;

    fn process(&self, challenge: &[u8]) -> Self::Response {
        format!(
            "{} {}",
            self.user,
            hmac_md5(challenge, self.passwd.as_bytes())
        )
    }
}

fn hmac_md5(text: &[u8], key: &[u8]) -> String {
    let mut key = if key.len() > 64 {
        md5::compute(key).0.to_vec()
    } else {
        key.to_vec()
    };
    key.resize(64, 0);

    let ipad: Vec<u8> = key.iter().map(|b| b ^ 0x36).collect();
    let opad: Vec<u8> = key.iter().map(|b| b ^ 0x5c).collect();

    let inner = md5::compute([ipad.as_slice(), text].concat());
    format!(
        "{:x}",
        md5::compute([opad.as_slice(), inner.0.as_slice()].concat())
    )
}

/// Authenticator for the DIGEST-MD5 mechanism (RFC 2831), md5-sess
/// with qop=auth only. Integrity and encryption qops are rejected as
/// unsupported.
pub struct DigestMd5Authenticator {
    service: String,
    host: String,
    authz_user: Option<String>,
    auth_user: String,
    passwd: String,
    cnonce: String,
}

impl DigestMd5Authenticator {
    pub fn new(
        service: impl Into<String>,
        host: impl Into<String>,
        authz_user: Option<String>,
        auth_user: String,
        passwd: String,
    ) -> Self {
        // The cnonce only has to be unique per session; the current
        // time is enough for that.
        let cnonce = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => format!("{:x}", elapsed.as_nanos()),
            Err(_) => String::from("0"),
        };

        Self {
            service: service.into(),
            host: host.into(),
            authz_user,
            auth_user,
            passwd,
            cnonce,
        }
    }

    fn respond(&self, challenge: &str) -> Result<String> {
        let challenge = validate_challenge(&parse_challenge(challenge))?;
        let nc = "00000001";
        let digest_uri = format!("{}/{}", self.service, self.host);

        let response = compute_response(
            &challenge,
            &digest_uri,
            self.authz_user.as_deref(),
            &self.auth_user,
            &self.passwd,
            &self.cnonce,
            nc,
        );

        let mut reply = format!(
            "username=\"{}\",realm=\"{}\",nonce=\"{}\",cnonce=\"{}\",nc={},qop=auth,digest-uri=\"{}\",response={},charset=utf-8",
            self.auth_user, challenge.realm, challenge.nonce, self.cnonce, nc, digest_uri, response,
        );
        if let Some(authz_user) = &self.authz_user {
            reply.push_str(&format!(",authzid=\"{}\"", authz_user));
        }

        Ok(reply)
    }
}

impl imap::Authenticator for DigestMd5Authenticator {
    type Response = String;

    fn process(&self, challenge: &[u8]) -> Self::Response {
        let challenge = String::from_utf8_lossy(challenge);

        // The second round trip only carries the server's rspauth,
        // which expects an empty response.
        if challenge.contains("rspauth") {
            return String::new();
        }

        match self.respond(&challenge) {
            Ok(reply) => reply,
            Err(err) => {
                // The trait cannot fail, so answer with an empty
                // response and let the server turn it into a NO.
                warn!("rejecting digest-md5 challenge: {}", err);
                String::new()
            }
        }
    }
}

struct DigestChallenge {
    realm: String,
    nonce: String,
}

/// Splits a `key=value,key="quoted value"` challenge, honoring commas
/// inside quotes (qop lists come quoted).
fn parse_challenge(challenge: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut quoted = false;

    for c in challenge.chars() {
        if !in_value {
            match c {
                '=' => in_value = true,
                ',' => key.clear(),
                c => key.push(c),
            }
        } else if quoted {
            match c {
                '"' => quoted = false,
                c => value.push(c),
            }
        } else {
            match c {
                '"' => quoted = true,
                ',' => {
                    fields.insert(key.trim().to_owned(), value.clone());
                    key.clear();
                    value.clear();
                    in_value = false;
                }
                c => value.push(c),
            }
        }
    }
    if in_value {
        fields.insert(key.trim().to_owned(), value);
    }

    fields
}

fn validate_challenge(fields: &HashMap<String, String>) -> Result<DigestChallenge> {
    let nonce = fields
        .get("nonce")
        .ok_or(Error::MissingChallengeFieldError("nonce"))?;

    let qop = fields
        .get("qop")
        .ok_or(Error::MissingChallengeFieldError("qop"))?;
    if !qop.split(',').any(|qop| qop.trim() == "auth") {
        return Err(Error::UnsupportedQopError(qop.clone()));
    }

    let algorithm = fields
        .get("algorithm")
        .ok_or(Error::MissingChallengeFieldError("algorithm"))?;
    if algorithm != "md5-sess" {
        return Err(Error::UnsupportedAlgorithmError(algorithm.clone()));
    }

    Ok(DigestChallenge {
        realm: fields.get("realm").cloned().unwrap_or_default(),
        nonce: nonce.clone(),
    })
}

fn compute_response(
    challenge: &DigestChallenge,
    digest_uri: &str,
    authz_user: Option<&str>,
    auth_user: &str,
    passwd: &str,
    cnonce: &str,
    nc: &str,
) -> String {
    let urp = md5::compute(format!("{}:{}:{}", auth_user, challenge.realm, passwd));

    let mut a1 = urp.0.to_vec();
    a1.extend_from_slice(format!(":{}:{}", challenge.nonce, cnonce).as_bytes());
    if let Some(authz_user) = authz_user {
        a1.extend_from_slice(format!(":{}", authz_user).as_bytes());
    }
    let ha1 = format!("{:x}", md5::compute(a1));

    let ha2 = format!(
        "{:x}",
        md5::compute(format!("AUTHENTICATE:{}", digest_uri))
    );

    format!(
        "{:x}",
        md5::compute(format!(
            "{}:{}:{}:{}:auth:{}",
            ha1, challenge.nonce, nc, cnonce, ha2
        ))
    )
}
