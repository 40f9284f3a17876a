//! SQLite-backed `TicketStore`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{CreateOutcome, NewTicket, StoreError, Ticket, TicketStatus, TicketStore};
use crate::analysis::AiAnalysis;
use crate::db::ticket_repo::{self, TicketRow};
use crate::db::{Database, DatabaseError};

/// Ticket store over the shared `Database` handle.
#[derive(Clone)]
pub struct SqliteTicketStore {
    db: Database,
}

impl SqliteTicketStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Lists the most recently received tickets first.
    pub fn list_recent(&self, limit: u64) -> Result<Vec<Ticket>, StoreError> {
        ticket_repo::list_recent(&self.db, limit)?
            .into_iter()
            .map(|row| row_to_ticket(row).map_err(StoreError::from))
            .collect()
    }

    /// Moves a ticket to another workflow state.
    pub fn update_status(&self, ticket_id: &str, status: TicketStatus) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let updated = ticket_repo::update_status(&self.db, ticket_id, status.as_str(), &now)?;
        if updated == 0 {
            return Err(StoreError::NotFound(ticket_id.to_string()));
        }
        Ok(())
    }

    /// Number of stored tickets.
    pub fn count(&self) -> Result<u64, StoreError> {
        Ok(ticket_repo::count(&self.db)?)
    }
}

#[async_trait]
impl TicketStore for SqliteTicketStore {
    async fn exists(&self, ticket_id: &str) -> Result<bool, StoreError> {
        Ok(ticket_repo::exists(&self.db, ticket_id)?)
    }

    async fn create(&self, ticket: NewTicket) -> Result<CreateOutcome, StoreError> {
        let now = Utc::now().to_rfc3339();
        let row = TicketRow {
            ticket_id: ticket.ticket_id.clone(),
            subject: ticket.subject,
            body: ticket.body,
            sender: ticket.sender,
            recipient: ticket.recipient,
            priority: ticket.priority.as_str().to_string(),
            status: TicketStatus::Open.as_str().to_string(),
            ai_analysis: None,
            source_uid: ticket.source_uid,
            received_at: ticket.received_at.to_rfc3339(),
            created_at: now.clone(),
            updated_at: now,
        };

        if !ticket_repo::insert_if_absent(&self.db, &row)? {
            log::debug!("Ticket {} already stored", ticket.ticket_id);
            return Ok(CreateOutcome::AlreadyExists);
        }

        Ok(CreateOutcome::Created(row_to_ticket(row)?))
    }

    async fn update_analysis(
        &self,
        ticket_id: &str,
        analysis: &AiAnalysis,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(analysis)?;
        let now = Utc::now().to_rfc3339();
        let updated = ticket_repo::update_analysis(&self.db, ticket_id, &json, &now)?;
        if updated == 0 {
            return Err(StoreError::NotFound(ticket_id.to_string()));
        }
        Ok(())
    }

    async fn get(&self, ticket_id: &str) -> Result<Option<Ticket>, StoreError> {
        match ticket_repo::find_by_ticket_id(&self.db, ticket_id)? {
            Some(row) => Ok(Some(row_to_ticket(row)?)),
            None => Ok(None),
        }
    }
}

fn row_to_ticket(row: TicketRow) -> Result<Ticket, DatabaseError> {
    let priority = row
        .priority
        .parse()
        .map_err(|_| DatabaseError::InvalidColumn {
            column: "priority",
            value: row.priority.clone(),
        })?;
    let status = row.status.parse().map_err(|_| DatabaseError::InvalidColumn {
        column: "status",
        value: row.status.clone(),
    })?;
    let ai_analysis = match row.ai_analysis.as_deref() {
        Some(json) => Some(serde_json::from_str::<AiAnalysis>(json).map_err(|_| {
            DatabaseError::InvalidColumn {
                column: "ai_analysis",
                value: json.to_string(),
            }
        })?),
        None => None,
    };

    Ok(Ticket {
        ticket_id: row.ticket_id,
        subject: row.subject,
        body: row.body,
        sender: row.sender,
        recipient: row.recipient,
        priority,
        status,
        ai_analysis,
        source_uid: row.source_uid,
        received_at: parse_timestamp("received_at", &row.received_at)?,
        created_at: parse_timestamp("created_at", &row.created_at)?,
        updated_at: parse_timestamp("updated_at", &row.updated_at)?,
    })
}

fn parse_timestamp(column: &'static str, value: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| DatabaseError::InvalidColumn {
            column,
            value: value.to_string(),
        })
}
