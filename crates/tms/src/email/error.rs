//! Mailbox error types.

use thiserror::Error;

/// Errors raised while talking to the complaint mailbox.
#[derive(Error, Debug)]
pub enum MailboxError {
    /// Failed to reach the IMAP server.
    #[error("IMAP connection failed: {0}")]
    ConnectionFailed(String),

    /// TLS handshake or certificate error.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// LOGIN was rejected.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The configured folder does not exist or cannot be examined.
    #[error("IMAP folder '{0}' not found")]
    FolderNotFound(String),

    /// Unexpected server response.
    #[error("IMAP protocol error: {0}")]
    ProtocolError(String),

    /// Fetching a single message failed.
    #[error("Failed to fetch UID {uid}: {reason}")]
    FetchFailed { uid: u32, reason: String },

    /// The server returned no body for a UID.
    #[error("Message UID {uid} not found")]
    MessageNotFound { uid: u32 },

    /// Operation timed out.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Invalid mailbox configuration.
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// No password could be resolved.
    #[error("Credentials not found: {0}")]
    CredentialsNotFound(String),
}

impl MailboxError {
    /// True for failures that invalidate the whole session rather than a
    /// single message.
    pub fn is_connection_level(&self) -> bool {
        !matches!(
            self,
            MailboxError::FetchFailed { .. } | MailboxError::MessageNotFound { .. }
        )
    }
}

impl From<async_native_tls::Error> for MailboxError {
    fn from(err: async_native_tls::Error) -> Self {
        MailboxError::TlsError(err.to_string())
    }
}

/// Result type for mailbox operations.
pub type Result<T> = std::result::Result<T, MailboxError>;
