//! Notification log: the `notifications` table.

use rusqlite::params;

use super::{Database, DatabaseError};

/// A delivered (or attempted) notification for a ticket.
#[derive(Debug, Clone)]
pub struct NotificationRow {
    pub ticket_id: String,
    pub channel: String,
    pub status: String,
    pub sent_at: String,
}

/// Records a notification.
pub fn insert(db: &Database, row: &NotificationRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO notifications (ticket_id, channel, status, sent_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![row.ticket_id, row.channel, row.status, row.sent_at],
        )?;
        Ok(())
    })
}

/// Lists notifications recorded for a ticket, oldest first.
pub fn find_by_ticket(db: &Database, ticket_id: &str) -> Result<Vec<NotificationRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT ticket_id, channel, status, sent_at FROM notifications
             WHERE ticket_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![ticket_id], |row| {
                Ok(NotificationRow {
                    ticket_id: row.get(0)?,
                    channel: row.get(1)?,
                    status: row.get(2)?,
                    sent_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
