//! SQLite connection handle.
//!
//! One connection per process, shared behind a mutex. Appends take a
//! per-session lock first (see `events.rs`), so the connection mutex is only
//! a serialization point for the short statement bursts themselves.

use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;

use strand_domain::error::{Error, Result};

use crate::schema;

/// Cloneable database handle.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database at `path` and initialize the schema.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("opening {}: {e}", path.display())))?;
        Self::from_connection(conn)
    }

    /// In-memory database for tests and short-lived child processes.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("opening in-memory db: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| Error::Storage(format!("setting WAL: {e}")))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| Error::Storage(format!("enabling foreign keys: {e}")))?;
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Borrow the connection for a burst of statements.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

/// Map a rusqlite error into the shared storage error.
pub(crate) fn storage_err(context: &str, e: rusqlite::Error) -> Error {
    Error::Storage(format!("{context}: {e}"))
}
