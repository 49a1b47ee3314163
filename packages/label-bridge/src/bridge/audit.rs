//! Audit log of authenticated bot calls.
//!
//! The same table answers replay lookups. An accepted request claims its
//! signature by inserting an in-flight row (`status_code = 0`) and completes
//! that row once the response status is known. Within the replay window a
//! signature is taken while it has an in-flight or a successful row; a
//! request that completed with a failure status frees it for a retry.

use rusqlite::{params, Connection, Row};
use serde::Serialize;

use crate::error::Result;
use crate::storage::Database;

/// A stored audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: i64,
    pub request_id: String,
    pub endpoint: String,
    pub method: String,
    pub discord_user_id: Option<String>,
    pub guild_id: Option<String>,
    pub success: bool,
    pub status_code: u16,
    pub signature: String,
    pub created_at: i64,
}

impl AuditRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            request_id: row.get(1)?,
            endpoint: row.get(2)?,
            method: row.get(3)?,
            discord_user_id: row.get(4)?,
            guild_id: row.get(5)?,
            success: row.get(6)?,
            status_code: row.get(7)?,
            signature: row.get(8)?,
            created_at: row.get(9)?,
        })
    }
}

/// `status_code` of a claimed row whose response is still being produced.
pub const STATUS_IN_FLIGHT: u16 = 0;

/// A record about to be written.
#[derive(Debug, Clone)]
pub struct NewAuditRecord {
    pub request_id: String,
    pub endpoint: String,
    pub method: String,
    pub discord_user_id: Option<String>,
    pub guild_id: Option<String>,
    pub success: bool,
    pub status_code: u16,
    /// Empty when the request was rejected before a signature was read.
    pub signature: String,
    pub created_at: i64,
}

#[derive(Clone)]
pub struct AuditLog {
    db: Database,
}

impl AuditLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn append(&self, record: &NewAuditRecord) -> Result<i64> {
        self.db.with_conn(|conn| insert(conn, record))
    }

    /// Claim `record.signature` for a request accepted at `record.created_at`.
    ///
    /// Inserts an in-flight row and returns its id, or `None` when the
    /// signature already has an in-flight or successful row at or after
    /// `since_ms`. Check and insert share one write transaction, so of two
    /// concurrent requests with the same signature exactly one gets an id.
    pub fn claim(&self, record: &NewAuditRecord, since_ms: i64) -> Result<Option<i64>> {
        if record.signature.is_empty() {
            return Ok(None);
        }
        self.db.with_tx(|conn| {
            if signature_taken(conn, &record.signature, since_ms)? {
                return Ok(None);
            }
            let in_flight = NewAuditRecord {
                success: false,
                status_code: STATUS_IN_FLIGHT,
                ..record.clone()
            };
            Ok(Some(insert(conn, &in_flight)?))
        })
    }

    /// Record the final outcome of a claimed row.
    pub fn complete(&self, id: i64, success: bool, status_code: u16) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE bridge_audit_log SET success = ?2, status_code = ?3 WHERE id = ?1",
                params![id, success, status_code],
            )?;
            Ok(())
        })
    }

    /// Newest records first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let limit = limit.clamp(1, 500) as i64;
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, request_id, endpoint, method, discord_user_id, guild_id,
                        success, status_code, signature, created_at
                 FROM bridge_audit_log
                 ORDER BY id DESC
                 LIMIT ?1",
            )?;
            let records = stmt
                .query_map(params![limit], AuditRecord::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
    }

    pub fn count(&self) -> Result<i64> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM bridge_audit_log", [], |r| r.get(0))?)
        })
    }
}

fn insert(conn: &Connection, record: &NewAuditRecord) -> Result<i64> {
    conn.execute(
        "INSERT INTO bridge_audit_log
            (request_id, endpoint, method, discord_user_id, guild_id,
             success, status_code, signature, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.request_id,
            record.endpoint,
            record.method,
            record.discord_user_id,
            record.guild_id,
            record.success,
            record.status_code,
            record.signature,
            record.created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn signature_taken(conn: &Connection, signature: &str, since_ms: i64) -> Result<bool> {
    let taken: bool = conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM bridge_audit_log
            WHERE signature = ?1
              AND created_at >= ?2
              AND (success = 1 OR status_code = ?3)
         )",
        params![signature, since_ms, STATUS_IN_FLIGHT],
        |row| row.get(0),
    )?;
    Ok(taken)
}
