//! Content-addressed blob side-table.
//!
//! Blob ids are the sha256 of the content, so re-storing identical bytes is
//! idempotent. Retention follows the events that reference a blob.

use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};

use strand_domain::error::Result;

use crate::db::{storage_err, Database};

/// A stored blob.
#[derive(Debug, Clone)]
pub struct Blob {
    pub id: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Store content; returns the content-addressed blob id.
pub(crate) fn store_blob(db: &Database, data: &[u8], content_type: &str) -> Result<String> {
    let id = blob_id(data);
    db.conn()
        .execute(
            "INSERT OR IGNORE INTO blobs (id, content_type, data) VALUES (?1, ?2, ?3)",
            params![id, content_type, data],
        )
        .map_err(|e| storage_err("storing blob", e))?;
    Ok(id)
}

pub(crate) fn get_blob(db: &Database, id: &str) -> Result<Option<Blob>> {
    db.conn()
        .query_row(
            "SELECT id, content_type, data FROM blobs WHERE id = ?1",
            params![id],
            |row| {
                Ok(Blob {
                    id: row.get(0)?,
                    content_type: row.get(1)?,
                    data: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(|e| storage_err("reading blob", e))
}

pub(crate) fn blob_id(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
