//! Shared delivery machinery for the outbox and the role-sync queue.
//!
//! Both queues have the same lifecycle:
//!
//! ```text
//! pending ──claim──► processing ──ack ok──────────► sent
//!    ▲                   │
//!    └──ack retry────────┤
//!                        └──ack permanent / max──► failed
//! ```

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest batch a single pull may claim.
pub const MAX_BATCH_SIZE: u32 = 50;

/// Batch size used when the bot does not send one.
pub const DEFAULT_BATCH_SIZE: u32 = 20;

const BACKOFF_BASE_MS: i64 = 20_000;
const BACKOFF_CEILING_MS: i64 = 3_600_000;

/// Stored error text is truncated to this many characters.
const MAX_ERROR_LEN: usize = 1000;

/// Delivery status of a queued row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Processing => "processing",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "processing" => Some(DeliveryStatus::Processing),
            "sent" => Some(DeliveryStatus::Sent),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

/// Read a status column.
pub(crate) fn status_column(idx: usize, raw: String) -> rusqlite::Result<DeliveryStatus> {
    DeliveryStatus::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown delivery status: {raw}").into(),
        )
    })
}

/// One entry of an ack request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckResult {
    pub id: i64,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// The bot asserts retrying cannot help.
    #[serde(default)]
    pub permanent: bool,
}

/// Outcome of an ack batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AckSummary {
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    /// Ids that were unknown or not in `processing`.
    pub skipped: Vec<i64>,
}

/// Per-status row counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub sent: i64,
    pub failed: i64,
}

/// Retry delay after `attempts` delivery attempts.
///
/// `20s · 2^(attempts-1)`, never below 20 s nor above one hour.
pub fn backoff_ms(attempts: u32) -> i64 {
    let exp = attempts.saturating_sub(1).min(20);
    BACKOFF_BASE_MS
        .saturating_mul(1_i64 << exp)
        .clamp(BACKOFF_BASE_MS, BACKOFF_CEILING_MS)
}

/// Clamp a requested batch size into `1..=MAX_BATCH_SIZE`.
pub fn clamp_batch_size(requested: Option<u32>) -> u32 {
    requested
        .unwrap_or(DEFAULT_BATCH_SIZE)
        .clamp(1, MAX_BATCH_SIZE)
}

fn truncate_error(error: Option<&str>) -> Option<String> {
    error.map(|e| e.chars().take(MAX_ERROR_LEN).collect())
}

/// Queue tables sharing the delivery lifecycle.
#[derive(Debug, Clone, Copy)]
pub(crate) enum QueueTable {
    Outbox,
    RoleSync,
}

impl QueueTable {
    pub(crate) fn name(self) -> &'static str {
        match self {
            QueueTable::Outbox => "bridge_outbox_events",
            QueueTable::RoleSync => "bridge_role_sync_jobs",
        }
    }
}

/// Apply ack results to rows currently in `processing`.
///
/// Must run inside a transaction. With `max_attempts` set, a retryable
/// failure on a row that has used up its attempts becomes `failed`.
pub(crate) fn apply_ack(
    tx: &Connection,
    table: QueueTable,
    results: &[AckResult],
    now: i64,
    max_attempts: Option<u32>,
) -> Result<AckSummary> {
    let table = table.name();
    let mut summary = AckSummary::default();

    for result in results {
        let attempts: Option<u32> = tx
            .prepare_cached(&format!(
                "SELECT attempts FROM {table} WHERE id = ?1 AND status = 'processing'"
            ))?
            .query_row(params![result.id], |row| row.get(0))
            .optional()?;
        let Some(attempts) = attempts else {
            summary.skipped.push(result.id);
            continue;
        };

        let error = truncate_error(result.error.as_deref());
        if result.success {
            tx.execute(
                &format!(
                    "UPDATE {table} SET status = 'sent', last_error = NULL, updated_at = ?2
                     WHERE id = ?1 AND status = 'processing'"
                ),
                params![result.id, now],
            )?;
            summary.sent += 1;
            continue;
        }

        let exhausted = max_attempts.is_some_and(|max| attempts >= max);
        if result.permanent || exhausted {
            tx.execute(
                &format!(
                    "UPDATE {table} SET status = 'failed', last_error = ?2, updated_at = ?3
                     WHERE id = ?1 AND status = 'processing'"
                ),
                params![result.id, error, now],
            )?;
            summary.failed += 1;
        } else {
            tx.execute(
                &format!(
                    "UPDATE {table}
                     SET status = 'pending', last_error = ?2, next_attempt_at = ?3, updated_at = ?4
                     WHERE id = ?1 AND status = 'processing'"
                ),
                params![result.id, error, now + backoff_ms(attempts), now],
            )?;
            summary.retried += 1;
        }
    }

    Ok(summary)
}

/// Count rows per status.
pub(crate) fn queue_stats(conn: &Connection, table: QueueTable) -> Result<QueueStats> {
    let mut stmt = conn.prepare(&format!(
        "SELECT status, COUNT(*) FROM {} GROUP BY status",
        table.name()
    ))?;
    let counts = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stats = QueueStats::default();
    for (status, count) in counts {
        match DeliveryStatus::parse(&status) {
            Some(DeliveryStatus::Pending) => stats.pending = count,
            Some(DeliveryStatus::Processing) => stats.processing = count,
            Some(DeliveryStatus::Sent) => stats.sent = count,
            Some(DeliveryStatus::Failed) => stats.failed = count,
            None => {
                return Err(Error::Database(format!(
                    "unknown delivery status: {status}"
                )))
            }
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_ms(0), 20_000);
        assert_eq!(backoff_ms(1), 20_000);
        assert_eq!(backoff_ms(2), 40_000);
        assert_eq!(backoff_ms(3), 80_000);
        assert_eq!(backoff_ms(8), 2_560_000);
        assert_eq!(backoff_ms(9), 3_600_000);
        assert_eq!(backoff_ms(u32::MAX), 3_600_000);
    }

    #[test]
    fn test_backoff_is_monotonic_up_to_ceiling() {
        let mut previous = 0;
        for attempts in 1..40 {
            let delay = backoff_ms(attempts);
            assert!(delay >= previous);
            assert!(delay <= 3_600_000);
            previous = delay;
        }
        assert_eq!(previous, 3_600_000);
    }

    #[test]
    fn test_clamp_batch_size() {
        assert_eq!(clamp_batch_size(None), DEFAULT_BATCH_SIZE);
        assert_eq!(clamp_batch_size(Some(0)), 1);
        assert_eq!(clamp_batch_size(Some(7)), 7);
        assert_eq!(clamp_batch_size(Some(500)), MAX_BATCH_SIZE);
    }

    #[test]
    fn test_status_strings() {
        for status in [
            DeliveryStatus::Pending,
            DeliveryStatus::Processing,
            DeliveryStatus::Sent,
            DeliveryStatus::Failed,
        ] {
            assert_eq!(DeliveryStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DeliveryStatus::parse("done"), None);
    }

    #[test]
    fn test_ack_result_defaults() {
        let result: AckResult = serde_json::from_str(r#"{"id":3,"success":false}"#).unwrap();
        assert!(!result.permanent);
        assert!(result.error.is_none());
    }

    #[test]
    fn test_error_is_truncated() {
        let long = "x".repeat(MAX_ERROR_LEN + 50);
        assert_eq!(truncate_error(Some(&long)).unwrap().len(), MAX_ERROR_LEN);
        assert_eq!(truncate_error(None), None);
    }
}
