//! Complaint mailbox access.
//!
//! This module polls a single IMAP folder read-only: a UID cursor selects
//! new messages, the client fetches them with `BODY.PEEK[]`, and the parser
//! reduces each one to the fields a ticket needs.

pub mod client;
pub mod cursor;
pub mod error;
pub mod parser;

pub use client::{ImapConnector, ImapSession, MailboxConnector, MailboxSession, RawMessage};
pub use cursor::{build_filter, SearchFilter, UidCursor};
pub use error::MailboxError;
pub use parser::{decode_header_value, parse_email, ParsedEmail};
