//! Embedded SQLite store shared by the operator and routing record tables
//!
//! A single connection sits behind a mutex. Every store operation takes the
//! lock for exactly one statement (or one short transaction) and never across
//! an `.await`, so dispatch workers and control API handlers interleave freely.

use anyhow::{Context, Result};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use std::path::Path;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // WAL keeps readers from blocking on the writer
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;

        info!(path = %path.display(), "Database opened");
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Acquire the connection. Callers must drop the guard before awaiting.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                migrate_v1(&conn)?;
            }
        }

        Ok(())
    }
}

/// Migration v1: operators and routing records
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Applying migration v1: initial schema");

    conn.execute_batch(
        r#"
        BEGIN;

        CREATE TABLE IF NOT EXISTS operators (
            id TEXT PRIMARY KEY,
            identifier TEXT NOT NULL UNIQUE,
            secret_hash TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS routing_records (
            id TEXT PRIMARY KEY,
            routing_key TEXT NOT NULL,
            listener_class TEXT NOT NULL,
            target TEXT NOT NULL,
            mode TEXT NOT NULL,
            certificate TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            created_by TEXT,
            updated_by TEXT
        );

        -- One enabled route per key and listener class. The engine enforces
        -- this atomically, concurrent creates cannot both commit.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_records_enabled_key
            ON routing_records(listener_class, routing_key) WHERE enabled = 1;

        CREATE INDEX IF NOT EXISTS idx_records_key ON routing_records(routing_key);

        INSERT INTO schema_migrations (version) VALUES (1);

        COMMIT;
        "#,
    )?;

    Ok(())
}

/// Whether an error is a UNIQUE / PRIMARY KEY constraint violation
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}

/// Current time as stored in timestamp columns
pub(crate) fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_create_tables() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert!(tables.contains(&"operators".to_string()));
        assert!(tables.contains(&"routing_records".to_string()));
        assert!(tables.contains(&"schema_migrations".to_string()));
    }

    #[test]
    fn test_reopen_does_not_rerun_migrations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");

        drop(Database::open(&path).unwrap());
        let db = Database::open(&path).unwrap();

        let versions: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(versions, 1);
    }

    #[test]
    fn test_unique_violation_detection() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn();
        let insert = "INSERT INTO operators (id, identifier, secret_hash, created_at)
                      VALUES (?1, 'a@b', 'h', 'now')";

        conn.execute(insert, ["1"]).unwrap();
        let err = conn.execute(insert, ["2"]).unwrap_err();
        assert!(is_unique_violation(&err));

        let err = conn.execute("SELECT * FROM missing_table", []).unwrap_err();
        assert!(!is_unique_violation(&err));
    }
}
