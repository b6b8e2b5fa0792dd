//! IMAP session module.
//!
//! This module contains the connection establishment and the session
//! wrapper shared by the replication and training pipelines. Every
//! open session carries a background heartbeat so long batch
//! operations on one side do not let the other side's server drop the
//! connection for idleness.

use chrono::{DateTime, FixedOffset};
use log::{debug, log_enabled, trace, warn, Level};
use native_tls::{TlsConnector, TlsStream};
use std::{
    io::{self, Read, Write},
    net::TcpStream,
    result,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;
use utf7_imap::encode_utf7_imap as encode_utf7;

use crate::{
    config::imap::{AuthMechanism, ImapEndpointConfig},
    email::Flags,
};

use super::auth::{CramMd5Authenticator, DigestMd5Authenticator, PlainAuthenticator};

const HEARTBEAT_TICK: Duration = Duration::from_secs(1);
const HEARTBEAT_PERIOD: u32 = 10;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot create tls connector")]
    CreateTlsConnectorError(#[source] native_tls::Error),
    #[error("cannot connect to imap server {1}:{2}")]
    ConnectImapServerError(#[source] imap::Error, String, u16),
    #[error("failed to authenticate as {1} via {2}")]
    AuthenticateError(#[source] imap::Error, String, String),
    #[error("failed to authorize as {1} by authenticating as {2} via {3}")]
    AuthorizeError(#[source] imap::Error, String, String, String),
    #[error("cannot determine hierarchy delimiter of {0}")]
    GetDelimiterError(String),
    #[error("cannot list folders")]
    ListFoldersError(#[source] imap::Error),
    #[error("cannot list subscription of folder {1}")]
    LsubFolderError(#[source] imap::Error, String),
    #[error("cannot lock imap session: {0}")]
    LockSessionError(String),
    #[error("cannot select folder {1}")]
    SelectFolderError(#[source] imap::Error, String),
    #[error("cannot examine folder {1}")]
    ExamineFolderError(#[source] imap::Error, String),
    #[error("cannot create folder {1}")]
    CreateFolderError(#[source] imap::Error, String),
    #[error("cannot subscribe folder {1}")]
    SubscribeFolderError(#[source] imap::Error, String),
    #[error("cannot unsubscribe folder {1}")]
    UnsubscribeFolderError(#[source] imap::Error, String),
    #[error("cannot search messages with query {1}")]
    SearchError(#[source] imap::Error, String),
    #[error("cannot fetch messages {1}")]
    FetchError(#[source] imap::Error, String),
    #[error("cannot fetch messages by uid {1}")]
    UidFetchError(#[source] imap::Error, String),
    #[error("cannot store flags {1} on message(s) {2}")]
    StoreError(#[source] imap::Error, String, String),
    #[error("cannot expunge message(s) {1}")]
    UidExpungeError(#[source] imap::Error, String),
    #[error("cannot append message to folder {1}")]
    AppendMsgError(#[source] imap::Error, String),
    #[error("cannot ping imap session")]
    NoopError(#[source] imap::Error),
    #[error("cannot logout from imap session")]
    LogoutError(#[source] imap::Error),
    #[error("cannot run command {1}")]
    RunCommandError(#[source] imap::Error, String),
    #[error("cannot parse {0} from response for folder {1}")]
    ParseResponseError(&'static str, String),

    #[error(transparent)]
    ConfigError(#[from] crate::config::imap::Error),
}

pub type Result<T> = result::Result<T, Error>;

pub enum ImapSessionStream {
    Tls(TlsStream<TcpStream>),
    Tcp(TcpStream),
}

impl Read for ImapSessionStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tls(stream) => stream.read(buf),
            Self::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for ImapSessionStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tls(stream) => stream.write(buf),
            Self::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tls(stream) => stream.flush(),
            Self::Tcp(stream) => stream.flush(),
        }
    }
}

pub type ImapSession = imap::Session<ImapSessionStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// Wraps an IMAP session and remembers how the current folder was
/// opened. STORE on a folder that was only examined transparently
/// re-selects it first, since examined folders are read-only.
pub struct MailSession {
    pub(crate) session: ImapSession,
    pub(crate) opened: Option<(String, OpenMode)>,
}

impl MailSession {
    fn new(session: ImapSession) -> Self {
        Self {
            session,
            opened: None,
        }
    }

    pub fn select(&mut self, folder: &str) -> Result<imap::types::Mailbox> {
        let encoded = encode_utf7(folder.to_owned());
        self.opened = None;
        let mailbox = self
            .session
            .select(encoded)
            .map_err(|err| Error::SelectFolderError(err, folder.to_owned()))?;
        self.opened = Some((folder.to_owned(), OpenMode::ReadWrite));
        Ok(mailbox)
    }

    pub fn examine(&mut self, folder: &str) -> Result<imap::types::Mailbox> {
        let encoded = encode_utf7(folder.to_owned());
        self.opened = None;
        let mailbox = self
            .session
            .examine(encoded)
            .map_err(|err| Error::ExamineFolderError(err, folder.to_owned()))?;
        self.opened = Some((folder.to_owned(), OpenMode::ReadOnly));
        Ok(mailbox)
    }

    /// Unselects the current folder without the implicit expunge that
    /// CLOSE performs: a bogus EXAMINE of an empty mailbox name, which
    /// the server answers with NO while still dropping the selection.
    pub fn unselect(&mut self) {
        self.opened = None;
        if let Err(err) = self.session.examine("") {
            trace!("unselect examine: {}", err);
        }
    }

    pub fn create(&mut self, folder: &str) -> Result<()> {
        let encoded = encode_utf7(folder.to_owned());
        self.session
            .create(encoded)
            .map_err(|err| Error::CreateFolderError(err, folder.to_owned()))?;
        Ok(())
    }

    pub fn subscribe(&mut self, folder: &str) -> Result<()> {
        let encoded = encode_utf7(folder.to_owned());
        self.session
            .subscribe(encoded)
            .map_err(|err| Error::SubscribeFolderError(err, folder.to_owned()))?;
        Ok(())
    }

    pub fn unsubscribe(&mut self, folder: &str) -> Result<()> {
        let encoded = encode_utf7(folder.to_owned());
        self.session
            .unsubscribe(encoded)
            .map_err(|err| Error::UnsubscribeFolderError(err, folder.to_owned()))?;
        Ok(())
    }

    pub fn list(&mut self, reference: &str, pattern: &str) -> Result<imap::types::Names> {
        self.session
            .list(Some(reference), Some(pattern))
            .map_err(Error::ListFoldersError)
    }

    /// Checks whether the given folder is subscribed.
    pub fn is_subscribed(&mut self, folder: &str) -> Result<bool> {
        let encoded = encode_utf7(folder.to_owned());
        let names = self
            .session
            .lsub(Some(""), Some(encoded.as_str()))
            .map_err(|err| Error::LsubFolderError(err, folder.to_owned()))?;
        Ok(!names.is_empty())
    }

    /// Searches the selected folder, returning sequence numbers in
    /// ascending order.
    pub fn search(&mut self, query: &str) -> Result<Vec<u32>> {
        let mut seqs: Vec<u32> = self
            .session
            .search(query)
            .map_err(|err| Error::SearchError(err, query.to_owned()))?
            .into_iter()
            .collect();
        seqs.sort_unstable();
        Ok(seqs)
    }

    pub fn fetch(&mut self, set: &str, items: &str) -> Result<imap::types::Fetches> {
        self.session
            .fetch(set, items)
            .map_err(|err| Error::FetchError(err, set.to_owned()))
    }

    pub fn uid_fetch(&mut self, uid_set: &str, items: &str) -> Result<imap::types::Fetches> {
        self.session
            .uid_fetch(uid_set, items)
            .map_err(|err| Error::UidFetchError(err, uid_set.to_owned()))
    }

    pub fn store(&mut self, set: &str, query: &str) -> Result<()> {
        self.promote_to_writable()?;
        self.session
            .store(set, query)
            .map_err(|err| Error::StoreError(err, query.to_owned(), set.to_owned()))?;
        Ok(())
    }

    pub fn uid_store(&mut self, uid_set: &str, query: &str) -> Result<()> {
        self.promote_to_writable()?;
        self.session
            .uid_store(uid_set, query)
            .map_err(|err| Error::StoreError(err, query.to_owned(), uid_set.to_owned()))?;
        Ok(())
    }

    /// Expunges exactly the given UIDs. Never a blanket expunge, which
    /// could take out unrelated messages flagged deleted by another
    /// client.
    pub fn uid_expunge(&mut self, uid_set: &str) -> Result<()> {
        self.promote_to_writable()?;
        self.session
            .uid_expunge(uid_set)
            .map_err(|err| Error::UidExpungeError(err, uid_set.to_owned()))?;
        Ok(())
    }

    pub fn append(
        &mut self,
        folder: &str,
        body: &[u8],
        flags: Flags,
        internal_date: Option<DateTime<FixedOffset>>,
    ) -> Result<()> {
        let encoded = encode_utf7(folder.to_owned());
        let mut cmd = self.session.append(&encoded, body);
        let mut cmd = cmd.flags(flags.into_imap_flags_vec());
        if let Some(date) = internal_date {
            cmd = cmd.internal_date(date);
        }
        cmd.finish()
            .map_err(|err| Error::AppendMsgError(err, folder.to_owned()))?;
        Ok(())
    }

    pub fn noop(&mut self) -> Result<()> {
        self.session.noop().map_err(Error::NoopError)
    }

    pub fn logout(&mut self) -> Result<()> {
        self.session.logout().map_err(Error::LogoutError)
    }

    pub(crate) fn run(&mut self, command: &str) -> Result<Vec<u8>> {
        self.session
            .run_command_and_read_response(command)
            .map_err(|err| Error::RunCommandError(err, command.to_owned()))
    }

    fn promote_to_writable(&mut self) -> Result<()> {
        if let Some((folder, OpenMode::ReadOnly)) = self.opened.clone() {
            debug!("promoting examined folder {} to selected", folder);
            self.select(&folder)?;
        }
        Ok(())
    }
}

/// Represents one authenticated connection plus its keepalive thread.
/// The heartbeat and the main work never overlap on the wire: the
/// heartbeat only fires when it can grab the session mutex.
pub struct SessionHandle {
    session: Arc<Mutex<MailSession>>,
    delimiter: String,
    keepalive: Arc<AtomicBool>,
    heartbeat: Option<JoinHandle<()>>,
}

impl SessionHandle {
    fn start(session: MailSession, delimiter: String) -> Self {
        let session = Arc::new(Mutex::new(session));
        let keepalive = Arc::new(AtomicBool::new(true));

        let heartbeat = thread::spawn({
            let session = Arc::clone(&session);
            let keepalive = Arc::clone(&keepalive);
            move || {
                let mut tick = 0;
                while keepalive.load(Ordering::Relaxed) {
                    if tick == 0 {
                        if let Ok(mut session) = session.try_lock() {
                            if let Err(err) = session.noop() {
                                warn!("keepalive noop failed: {}", err);
                            }
                        }
                    }
                    tick = (tick + 1) % HEARTBEAT_PERIOD;
                    thread::sleep(HEARTBEAT_TICK);
                }
            }
        });

        Self {
            session,
            delimiter,
            keepalive,
            heartbeat: Some(heartbeat),
        }
    }

    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    pub fn session(&self) -> Result<MutexGuard<'_, MailSession>> {
        self.session
            .lock()
            .map_err(|err| Error::LockSessionError(err.to_string()))
    }

    /// Stops the heartbeat and logs out. Also runs on drop, so an
    /// early return still tears the connection down; calling it
    /// explicitly just surfaces the errors.
    pub fn close(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        let heartbeat = match self.heartbeat.take() {
            Some(heartbeat) => heartbeat,
            None => return Ok(()),
        };

        self.keepalive.store(false, Ordering::Relaxed);
        if heartbeat.join().is_err() {
            warn!("keepalive thread panicked");
        }

        debug!("logging out");
        self.session()?.logout()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            warn!("error while closing imap session: {}", err);
        }
    }
}

/// Connects and authenticates to the given endpoint, opening the
/// mailbox of `user`. When a proxy user is configured, it is the one
/// authenticating, with `user` as the authorization identity.
pub fn connect(config: &ImapEndpointConfig, user: &str, passwd: &str) -> Result<SessionHandle> {
    let builder = TlsConnector::builder()
        .danger_accept_invalid_certs(config.insecure())
        .danger_accept_invalid_hostnames(config.insecure())
        .build()
        .map_err(Error::CreateTlsConnectorError)?;

    let mut client_builder = imap::ClientBuilder::new(&config.server, config.port());
    if config.starttls() {
        client_builder.starttls();
    }

    let client = if config.ssl() {
        client_builder.connect(|domain, tcp| {
            let connector = TlsConnector::connect(&builder, domain, tcp)?;
            Ok(ImapSessionStream::Tls(connector))
        })
    } else {
        client_builder.connect(|_, tcp| Ok(ImapSessionStream::Tcp(tcp)))
    }
    .map_err(|err| Error::ConnectImapServerError(err, config.server.clone(), config.port()))?;

    let mech = config.mech()?;
    let (authz_user, auth_user) = match config.proxyusr.as_deref() {
        Some(proxy_user) => (Some(user.to_owned()), proxy_user.to_owned()),
        None => (None, user.to_owned()),
    };

    let auth_error = |err: imap::Error| match &authz_user {
        Some(authz_user) => Error::AuthorizeError(
            err,
            authz_user.clone(),
            auth_user.clone(),
            mech.to_string(),
        ),
        None => Error::AuthenticateError(err, auth_user.clone(), mech.to_string()),
    };

    let mut session = match mech {
        // LOGIN has no authorization identity: log in directly as the
        // mailbox owner.
        AuthMechanism::Login => client
            .login(user, passwd)
            .map_err(|(err, _)| Error::AuthenticateError(err, user.to_owned(), mech.to_string()))?,
        AuthMechanism::Plain => {
            let authenticator = PlainAuthenticator::new(
                authz_user.clone(),
                auth_user.clone(),
                passwd.to_owned(),
            );
            client
                .authenticate("PLAIN", &authenticator)
                .map_err(|(err, _)| auth_error(err))?
        }
        AuthMechanism::CramMd5 => {
            let authenticator =
                CramMd5Authenticator::new(auth_user.clone(), passwd.to_owned());
            client
                .authenticate("CRAM-MD5", &authenticator)
                .map_err(|(err, _)| auth_error(err))?
        }
        AuthMechanism::DigestMd5 => {
            let authenticator = DigestMd5Authenticator::new(
                "imap",
                config.server.clone(),
                authz_user.clone(),
                auth_user.clone(),
                passwd.to_owned(),
            );
            client
                .authenticate("DIGEST-MD5", &authenticator)
                .map_err(|(err, _)| auth_error(err))?
        }
    };
    session.debug = log_enabled!(Level::Trace);

    let names = session
        .list(Some(""), Some(""))
        .map_err(Error::ListFoldersError)?;
    let delimiter = names
        .iter()
        .next()
        .and_then(|name| name.delimiter())
        .map(String::from)
        .ok_or_else(|| Error::GetDelimiterError(config.server.clone()))?;
    debug!("hierarchy delimiter of {}: {:?}", config.server, delimiter);

    Ok(SessionHandle::start(
        MailSession::new(session),
        delimiter,
    ))
}
