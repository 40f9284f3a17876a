//! Mailbox cursor repository: the `mailbox_cursors` table.
//!
//! One row per folder holds the highest ingested UID together with the
//! UIDVALIDITY it belongs to.

use rusqlite::{params, OptionalExtension};

use super::{Database, DatabaseError};

/// A persisted cursor row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorRow {
    pub folder: String,
    pub uidvalidity: u32,
    pub uid_max: u32,
    pub updated_at: String,
}

/// Finds the stored cursor for a folder.
pub fn find(db: &Database, folder: &str) -> Result<Option<CursorRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT folder, uidvalidity, uid_max, updated_at FROM mailbox_cursors
                 WHERE folder = ?1",
                params![folder],
                |row| {
                    Ok(CursorRow {
                        folder: row.get(0)?,
                        uidvalidity: row.get(1)?,
                        uid_max: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    })
}

/// Inserts or replaces the cursor for a folder.
pub fn upsert(db: &Database, row: &CursorRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO mailbox_cursors (folder, uidvalidity, uid_max, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(folder) DO UPDATE SET
                uidvalidity = excluded.uidvalidity,
                uid_max = excluded.uid_max,
                updated_at = excluded.updated_at",
            params![row.folder, row.uidvalidity, row.uid_max, row.updated_at],
        )?;
        Ok(())
    })
}

/// Deletes the cursor for a folder. Returns the number of rows deleted.
pub fn delete(db: &Database, folder: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count = conn.execute(
            "DELETE FROM mailbox_cursors WHERE folder = ?1",
            params![folder],
        )?;
        Ok(count as u64)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(folder: &str, uidvalidity: u32, uid_max: u32) -> CursorRow {
        CursorRow {
            folder: folder.to_string(),
            uidvalidity,
            uid_max,
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn test_upsert_and_find() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(find(&db, "INBOX").unwrap(), None);

        upsert(&db, &row("INBOX", 100, 5)).unwrap();
        upsert(&db, &row("INBOX", 100, 9)).unwrap();
        upsert(&db, &row("Archive", 7, 1)).unwrap();

        assert_eq!(find(&db, "INBOX").unwrap(), Some(row("INBOX", 100, 9)));
        assert_eq!(find(&db, "Archive").unwrap().unwrap().uid_max, 1);
    }

    #[test]
    fn test_delete() {
        let db = Database::open_in_memory().unwrap();
        upsert(&db, &row("INBOX", 100, 5)).unwrap();

        assert_eq!(delete(&db, "INBOX").unwrap(), 1);
        assert_eq!(delete(&db, "INBOX").unwrap(), 0);
        assert!(find(&db, "INBOX").unwrap().is_none());
    }
}
