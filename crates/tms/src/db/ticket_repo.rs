//! Ticket repository: CRUD operations for the `tickets` table.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A raw ticket row from the database.
#[derive(Debug, Clone)]
pub struct TicketRow {
    pub ticket_id: String,
    pub subject: String,
    pub body: String,
    pub sender: String,
    pub recipient: String,
    pub priority: String,
    pub status: String,
    pub ai_analysis: Option<String>,
    pub source_uid: Option<u32>,
    pub received_at: String,
    pub created_at: String,
    pub updated_at: String,
}

impl TicketRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            ticket_id: row.get("ticket_id")?,
            subject: row.get("subject")?,
            body: row.get("body")?,
            sender: row.get("sender")?,
            recipient: row.get("recipient")?,
            priority: row.get("priority")?,
            status: row.get("status")?,
            ai_analysis: row.get("ai_analysis")?,
            source_uid: row.get("source_uid")?,
            received_at: row.get("received_at")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

const SELECT_COLUMNS: &str = "ticket_id, subject, body, sender, recipient, priority, status,
     ai_analysis, source_uid, received_at, created_at, updated_at";

/// Inserts a ticket unless one with the same `ticket_id` exists.
///
/// Returns `true` when a row was written, `false` when the UNIQUE
/// constraint on `ticket_id` turned the insert into a no-op.
pub fn insert_if_absent(db: &Database, ticket: &TicketRow) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "INSERT INTO tickets (ticket_id, subject, body, sender, recipient, priority, status,
             ai_analysis, source_uid, received_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(ticket_id) DO NOTHING",
            params![
                ticket.ticket_id,
                ticket.subject,
                ticket.body,
                ticket.sender,
                ticket.recipient,
                ticket.priority,
                ticket.status,
                ticket.ai_analysis,
                ticket.source_uid,
                ticket.received_at,
                ticket.created_at,
                ticket.updated_at,
            ],
        )?;
        Ok(changed == 1)
    })
}

/// Checks whether a ticket with the given external ID exists.
pub fn exists(db: &Database, ticket_id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM tickets WHERE ticket_id = ?1",
                params![ticket_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    })
}

/// Finds a ticket by its external ID.
pub fn find_by_ticket_id(
    db: &Database,
    ticket_id: &str,
) -> Result<Option<TicketRow>, DatabaseError> {
    db.with_conn(|conn| {
        let sql = format!("SELECT {} FROM tickets WHERE ticket_id = ?1", SELECT_COLUMNS);
        let row = conn
            .query_row(&sql, params![ticket_id], TicketRow::from_row)
            .optional()?;
        Ok(row)
    })
}

/// Lists the most recently received tickets first.
pub fn list_recent(db: &Database, limit: u64) -> Result<Vec<TicketRow>, DatabaseError> {
    db.with_conn(|conn| {
        let sql = format!(
            "SELECT {} FROM tickets ORDER BY received_at DESC, id DESC LIMIT ?1",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit], TicketRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Stores a serialized analysis payload. Returns the number of rows updated.
pub fn update_analysis(
    db: &Database,
    ticket_id: &str,
    analysis_json: &str,
    updated_at: &str,
) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let count = conn.execute(
            "UPDATE tickets SET ai_analysis = ?2, updated_at = ?3 WHERE ticket_id = ?1",
            params![ticket_id, analysis_json, updated_at],
        )?;
        Ok(count)
    })
}

/// Changes the status of a ticket. Returns the number of rows updated.
pub fn update_status(
    db: &Database,
    ticket_id: &str,
    status: &str,
    updated_at: &str,
) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let count = conn.execute(
            "UPDATE tickets SET status = ?2, updated_at = ?3 WHERE ticket_id = ?1",
            params![ticket_id, status, updated_at],
        )?;
        Ok(count)
    })
}

/// Counts all tickets.
pub fn count(db: &Database) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM tickets", [], |r| r.get(0))?;
        Ok(count)
    })
}
