//! SQLite persistence for tickets, notification history and mailbox
//! cursors.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;

pub mod cursor_repo;
pub mod error;
pub mod migrations;
pub mod notification_repo;
pub mod ticket_repo;

pub use error::DatabaseError;

/// How long a statement waits on a lock held by another process (e.g. a
/// second daemon pointed at the same file) before failing with SQLITE_BUSY.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle to the ticket database.
///
/// Clones share one connection. The ingestion worker, the notifier and the
/// analysis tasks all write through it, one closure at a time.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens the database file, creating it and its directory when missing,
    /// and brings the schema up to date.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| DatabaseError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        // WAL lets a reader (sqlite3 shell, a dashboard) look at tickets
        // while the daemon writes.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let db = Self::prepare(conn)?;

        log::info!("Ticket database ready at {}", path.display());
        Ok(db)
    }

    /// A private database that disappears with the handle.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self, DatabaseError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let before = migrations::applied_version(&conn).unwrap_or(0);
        migrations::run_all(&conn)?;
        let after = migrations::applied_version(&conn)?;
        if after != before {
            log::info!("Schema migrated from v{} to v{}", before, after);
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` with the connection locked.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let guard = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        f(&guard)
    }

    pub fn schema_version(&self) -> Result<u32, DatabaseError> {
        self.with_conn(migrations::applied_version)
    }
}

/// `~/.tms/data/tms.db`, used when the config names no database path.
pub fn default_database_path() -> Option<PathBuf> {
    let mut path = dirs::home_dir()?;
    path.extend([".tms", "data", "tms.db"]);
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_db_is_fully_migrated() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.schema_version().unwrap(), migrations::latest_version());
        assert!(migrations::latest_version() >= 3);
    }

    #[test]
    fn test_open_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tms.db");

        let db = Database::open(&path).unwrap();
        let tickets: u32 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM tickets", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(tickets, 0);
        assert!(path.exists());
    }

    #[test]
    fn test_reopen_keeps_schema_and_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tms.db");

        let db = Database::open(&path).unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO mailbox_cursors (folder, uidvalidity, uid_max, updated_at)
                 VALUES ('INBOX', 1, 42, '2026-01-01T00:00:00Z')",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        drop(db);

        let reopened = Database::open(&path).unwrap();
        assert_eq!(reopened.schema_version().unwrap(), migrations::latest_version());
        let journal: String = reopened
            .with_conn(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(journal.to_lowercase(), "wal");
        let uid_max: u32 = reopened
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT uid_max FROM mailbox_cursors WHERE folder = 'INBOX'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(uid_max, 42);
    }

    #[test]
    fn test_clones_share_the_connection() {
        let db = Database::open_in_memory().unwrap();
        let other = db.clone();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO mailbox_cursors (folder, uidvalidity, uid_max, updated_at)
                 VALUES ('Abuse', 7, 3, '2026-01-01T00:00:00Z')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let found: u32 = other
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT uidvalidity FROM mailbox_cursors WHERE folder = 'Abuse'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(found, 7);
    }

    #[test]
    fn test_default_database_path() {
        let path = default_database_path().unwrap();
        assert!(path.ends_with(".tms/data/tms.db"));
    }
}
