//! Tickets: the persisted record of one ingested abuse complaint.
//!
//! This module owns the ticket types, the ID generator, the keyword
//! priority classifier and the `TicketStore` seam the ingestion pipeline
//! writes through.

pub mod id;
pub mod priority;
pub mod store;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::AiAnalysis;
use crate::db::DatabaseError;

pub use id::{generate_ticket_id, parse_mail_date};
pub use priority::classify;
pub use store::SqliteTicketStore;

/// Triage level assigned at ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Workflow state of a ticket. The ingestion pipeline only creates `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Open,
    Closed,
    Pending,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Open => "open",
            TicketStatus::Closed => "closed",
            TicketStatus::Pending => "pending",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(TicketStatus::Open),
            "closed" => Ok(TicketStatus::Closed),
            "pending" => Ok(TicketStatus::Pending),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

/// Fields for a ticket about to be created.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTicket {
    pub ticket_id: String,
    pub subject: String,
    pub body: String,
    pub sender: String,
    pub recipient: String,
    pub priority: Priority,
    pub source_uid: Option<u32>,
    pub received_at: DateTime<Utc>,
}

/// A persisted ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub ticket_id: String,
    pub subject: String,
    pub body: String,
    pub sender: String,
    pub recipient: String,
    pub priority: Priority,
    pub status: TicketStatus,
    pub ai_analysis: Option<AiAnalysis>,
    pub source_uid: Option<u32>,
    pub received_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of an insert-if-absent.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// A new row was written.
    Created(Ticket),
    /// A ticket with this ID was already stored; nothing changed.
    AlreadyExists,
}

/// Errors from ticket persistence.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Ticket '{0}' not found")]
    NotFound(String),

    #[error("Failed to encode analysis: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Persistence seam for tickets.
///
/// `create` is insert-if-absent: the store's uniqueness on `ticket_id` is
/// the linearization point for deduplication, so concurrent callers racing
/// on the same ID see exactly one `Created`.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Checks whether a ticket with this external ID exists.
    async fn exists(&self, ticket_id: &str) -> Result<bool, StoreError>;

    /// Creates the ticket unless its ID is already taken.
    async fn create(&self, ticket: NewTicket) -> Result<CreateOutcome, StoreError>;

    /// Attaches an analysis payload to an existing ticket.
    async fn update_analysis(&self, ticket_id: &str, analysis: &AiAnalysis)
        -> Result<(), StoreError>;

    /// Loads a ticket by external ID.
    async fn get(&self, ticket_id: &str) -> Result<Option<Ticket>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_round_trips_through_str() {
        for p in [Priority::High, Priority::Medium, Priority::Low] {
            assert_eq!(p.as_str().parse::<Priority>().unwrap(), p);
        }
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("open".parse::<TicketStatus>().unwrap(), TicketStatus::Open);
        assert_eq!("Pending".parse::<TicketStatus>().unwrap(), TicketStatus::Pending);
        assert!("resolved".parse::<TicketStatus>().is_err());
    }

    #[test]
    fn test_priority_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Priority::Medium).unwrap(), "\"medium\"");
        assert_eq!(TicketStatus::Closed.to_string(), "closed");
    }
}
