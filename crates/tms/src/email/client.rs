//! IMAP access to the complaint mailbox.
//!
//! The pipeline only sees the `MailboxConnector` / `MailboxSession` traits so
//! tests can script a mailbox; `ImapConnector` is the real implementation.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use async_imap::Session;
use async_native_tls::TlsConnector;
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info, warn};
use secrecy::ExposeSecret;

use crate::config::MailboxConfig;

use super::cursor::SearchFilter;
use super::error::{MailboxError, Result};

/// Type alias for the underlying async stream (using async-std compatible TcpStream).
type AsyncTcpStream = async_io::Async<TcpStream>;

/// Type alias for the TLS stream used by the IMAP session.
type TlsStream = async_native_tls::TlsStream<AsyncTcpStream>;

/// Upper bound for a single SEARCH or FETCH round trip.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// One message as fetched from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub uid: u32,
    pub bytes: Vec<u8>,
}

/// Opens authenticated sessions on the configured folder.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>>;
}

/// An open, read-only view of one folder.
#[async_trait]
pub trait MailboxSession: Send {
    /// UIDVALIDITY reported when the folder was opened.
    fn uid_validity(&self) -> Option<u32>;

    /// UIDs matching the filter, ascending. May include UIDs the filter's
    /// range does not admit; callers re-check.
    async fn search(&mut self, filter: &SearchFilter) -> Result<Vec<u32>>;

    /// Full RFC 822 bytes of one message, without setting `\Seen`.
    async fn fetch(&mut self, uid: u32) -> Result<RawMessage>;

    /// Logs out. Never fails; safe to call more than once.
    async fn close(&mut self);
}

/// Connector for a real IMAP server over TLS.
pub struct ImapConnector {
    config: MailboxConfig,
}

impl ImapConnector {
    pub fn new(config: MailboxConfig) -> Self {
        Self { config }
    }

    async fn open_session(&self) -> Result<ImapSession> {
        let password = self
            .config
            .auth
            .resolve_password()
            .map_err(|e| MailboxError::CredentialsNotFound(e.to_string()))?;

        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("Connecting to IMAP server at {}", addr);

        let timeout = Duration::from_secs(self.config.connect_timeout);
        let std_stream = tokio::task::spawn_blocking(move || connect_tcp(&addr, timeout))
            .await
            .map_err(|e| MailboxError::ConnectionFailed(e.to_string()))??;
        std_stream
            .set_nonblocking(true)
            .map_err(|e| MailboxError::ConnectionFailed(e.to_string()))?;
        let tcp_stream = async_io::Async::new(std_stream)
            .map_err(|e| MailboxError::ConnectionFailed(e.to_string()))?;

        let tls_stream = TlsConnector::new()
            .connect(&self.config.host, tcp_stream)
            .await?;

        let client = async_imap::Client::new(tls_stream);
        let mut session = client
            .login(&self.config.username, password.expose_secret())
            .await
            .map_err(|(e, _)| MailboxError::AuthenticationFailed(e.to_string()))?;
        info!("Successfully authenticated to IMAP server");

        let folder = &self.config.folder;
        let mailbox = match session.examine(folder).await {
            Ok(mailbox) => mailbox,
            Err(e) => {
                let message = e.to_string();
                if let Err(logout_err) = session.logout().await {
                    debug!("Logout after failed EXAMINE failed: {}", logout_err);
                }
                return Err(
                    if message.contains("Mailbox doesn't exist") || message.contains("NO") {
                        MailboxError::FolderNotFound(folder.clone())
                    } else {
                        MailboxError::ProtocolError(message)
                    },
                );
            }
        };

        debug!(
            "Folder '{}' opened read-only with UIDVALIDITY={:?}, {} messages",
            folder, mailbox.uid_validity, mailbox.exists
        );

        Ok(ImapSession {
            session: Some(session),
            uid_validity: mailbox.uid_validity,
        })
    }
}

/// Blocking TCP connect trying every resolved address in turn.
fn connect_tcp(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|e| MailboxError::ConnectionFailed(format!("{}: {}", addr, e)))?
        .collect();

    let mut last_error = None;
    for socket_addr in addrs {
        match TcpStream::connect_timeout(&socket_addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }

    Err(match last_error {
        Some(e) if e.kind() == std::io::ErrorKind::TimedOut => {
            MailboxError::Timeout(format!("connecting to {}", addr))
        }
        Some(e) => MailboxError::ConnectionFailed(format!("{}: {}", addr, e)),
        None => MailboxError::ConnectionFailed(format!("{}: no addresses resolved", addr)),
    })
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>> {
        if !self.config.use_tls {
            return Err(MailboxError::ConfigError(
                "TLS is required for secure email connections".to_string(),
            ));
        }

        let limit = Duration::from_secs(self.config.connect_timeout);
        match tokio::time::timeout(limit, self.open_session()).await {
            Ok(session) => Ok(Box::new(session?)),
            Err(_) => Err(MailboxError::Timeout(format!(
                "connecting to {}:{} after {}s",
                self.config.host, self.config.port, self.config.connect_timeout
            ))),
        }
    }
}

/// Live IMAP session with the folder EXAMINEd.
pub struct ImapSession {
    session: Option<Session<TlsStream>>,
    uid_validity: Option<u32>,
}

impl ImapSession {
    fn session_mut(&mut self) -> Result<&mut Session<TlsStream>> {
        self.session
            .as_mut()
            .ok_or_else(|| MailboxError::ConnectionFailed("Session already closed".to_string()))
    }
}

#[async_trait]
impl MailboxSession for ImapSession {
    fn uid_validity(&self) -> Option<u32> {
        self.uid_validity
    }

    async fn search(&mut self, filter: &SearchFilter) -> Result<Vec<u32>> {
        let query = filter.to_imap_query();
        debug!("Searching with query: {}", query);

        let session = self.session_mut()?;
        let uids = tokio::time::timeout(COMMAND_TIMEOUT, session.uid_search(&query))
            .await
            .map_err(|_| MailboxError::Timeout("UID SEARCH".to_string()))?
            .map_err(|e| MailboxError::ProtocolError(e.to_string()))?;

        let mut uid_list: Vec<u32> = uids.into_iter().collect();
        uid_list.sort_unstable();
        debug!("Found {} messages matching search", uid_list.len());
        Ok(uid_list)
    }

    async fn fetch(&mut self, uid: u32) -> Result<RawMessage> {
        debug!("Fetching email with UID {}", uid);
        let session = self.session_mut()?;

        let fetched = tokio::time::timeout(COMMAND_TIMEOUT, async {
            // Use BODY.PEEK[] to fetch without marking as read
            let mut messages = session
                .uid_fetch(uid.to_string(), "BODY.PEEK[]")
                .await
                .map_err(|e| MailboxError::FetchFailed {
                    uid,
                    reason: e.to_string(),
                })?;

            // Drain the whole response so the next command starts clean.
            let mut body = None;
            let mut failure = None;
            while let Some(item) = messages.next().await {
                match item {
                    Ok(message) => {
                        let matches_uid = message.uid.map_or(true, |u| u == uid);
                        if body.is_none() && matches_uid {
                            body = message.body().map(|b| b.to_vec());
                        }
                    }
                    Err(e) => failure = Some(e.to_string()),
                }
            }

            match (body, failure) {
                (Some(bytes), _) => Ok(bytes),
                (None, Some(reason)) => Err(MailboxError::FetchFailed { uid, reason }),
                (None, None) => Err(MailboxError::MessageNotFound { uid }),
            }
        })
        .await
        .map_err(|_| MailboxError::Timeout(format!("UID FETCH {}", uid)))??;

        Ok(RawMessage { uid, bytes: fetched })
    }

    async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            info!("Disconnecting from IMAP server");
            if let Err(e) = session.logout().await {
                warn!("IMAP logout failed: {}", e);
            }
        }
    }
}

impl Drop for ImapSession {
    fn drop(&mut self) {
        if self.session.is_some() {
            warn!("ImapSession dropped without explicit close - connection will be reset");
        }
    }
}
