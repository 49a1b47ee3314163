//! Transactional outbox for app → bot events.
//!
//! Domain actions record an event here as a side effect; the bot pulls
//! batches, delivers them, and acks each one. Delivery is at-least-once and
//! ordering by `created_at` is a preference, not a guarantee.

use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;

use super::config::BridgeConfig;
use super::delivery::{
    apply_ack, clamp_batch_size, queue_stats, status_column, AckResult, AckSummary,
    DeliveryStatus, QueueStats, QueueTable,
};
use crate::error::Result;
use crate::storage::{json_column_error, Database};

// ── Event Types ──────────────────────────────────────────────────────────────

pub const EVENT_DEMO_SUBMITTED: &str = "demo.submitted";
pub const EVENT_TICKET_OPENED: &str = "support_ticket.opened";
pub const EVENT_DISCORD_LINKED: &str = "discord.linked";
pub const EVENT_DISCORD_UNLINKED: &str = "discord.unlinked";

/// A queued event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEvent {
    pub id: i64,
    pub event_type: String,
    pub aggregate_id: Option<String>,
    pub payload: Value,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

const EVENT_COLUMNS: &str = "id, event_type, aggregate_id, payload, status, attempts, \
                             next_attempt_at, last_error, created_at, updated_at";

impl OutboxEvent {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let payload: String = row.get(3)?;
        Ok(Self {
            id: row.get(0)?,
            event_type: row.get(1)?,
            aggregate_id: row.get(2)?,
            payload: serde_json::from_str(&payload).map_err(|e| json_column_error(3, e))?,
            status: status_column(4, row.get(4)?)?,
            attempts: row.get(5)?,
            next_attempt_at: row.get(6)?,
            last_error: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }
}

// ── Outbox ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Outbox {
    db: Database,
}

impl Outbox {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record an event. Returns `None` when the bridge or outbox is off.
    pub fn enqueue(
        &self,
        config: &BridgeConfig,
        event_type: &str,
        payload: &Value,
        aggregate_id: Option<&str>,
        now: i64,
    ) -> Result<Option<i64>> {
        if !config.outbox_active() {
            tracing::debug!(event_type, "[Outbox] Skipped: outbox inactive");
            return Ok(None);
        }

        let payload = serde_json::to_string(payload)?;
        let id = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO bridge_outbox_events
                    (event_type, aggregate_id, payload, status, attempts,
                     next_attempt_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4, ?4)",
                params![event_type, aggregate_id, payload, now],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        tracing::info!(id, event_type, aggregate_id, "[Outbox] Event enqueued");
        Ok(Some(id))
    }

    /// [`Outbox::enqueue`] for callers whose primary action must not fail
    /// because of the outbox. Errors are logged and dropped.
    pub fn enqueue_best_effort(
        &self,
        config: &BridgeConfig,
        event_type: &str,
        payload: &Value,
        aggregate_id: Option<&str>,
        now: i64,
    ) -> Option<i64> {
        match self.enqueue(config, event_type, payload, aggregate_id, now) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(event_type, error = %e, "[Outbox] Failed to enqueue event");
                None
            }
        }
    }

    /// Claim up to `batch_size` due events, oldest first.
    ///
    /// Claimed rows move to `processing` with `attempts + 1`. Concurrent
    /// callers never receive the same row.
    pub fn claim(&self, batch_size: Option<u32>, now: i64) -> Result<Vec<OutboxEvent>> {
        let limit = clamp_batch_size(batch_size);
        let mut events = self.db.with_tx(|tx| {
            let mut stmt = tx.prepare(&format!(
                "UPDATE bridge_outbox_events
                 SET status = 'processing', attempts = attempts + 1, updated_at = ?1
                 WHERE id IN (
                     SELECT id FROM bridge_outbox_events
                     WHERE status = 'pending' AND next_attempt_at <= ?1
                     ORDER BY created_at, id
                     LIMIT ?2
                 )
                 RETURNING {EVENT_COLUMNS}"
            ))?;
            let rows = stmt
                .query_map(params![now, limit], OutboxEvent::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        events.sort_by_key(|e| (e.created_at, e.id));

        if !events.is_empty() {
            tracing::debug!(count = events.len(), "[Outbox] Claimed events");
        }
        Ok(events)
    }

    /// Apply delivery results. Only rows in `processing` are touched.
    pub fn ack(&self, results: &[AckResult], now: i64) -> Result<AckSummary> {
        let summary = self
            .db
            .with_tx(|tx| apply_ack(tx, QueueTable::Outbox, results, now, None))?;
        tracing::info!(
            sent = summary.sent,
            retried = summary.retried,
            failed = summary.failed,
            skipped = summary.skipped.len(),
            "[Outbox] Ack applied"
        );
        Ok(summary)
    }

    pub fn get(&self, id: i64) -> Result<Option<OutboxEvent>> {
        self.db.with_conn(|conn| {
            let event = conn
                .query_row(
                    &format!("SELECT {EVENT_COLUMNS} FROM bridge_outbox_events WHERE id = ?1"),
                    params![id],
                    OutboxEvent::from_row,
                )
                .optional()?;
            Ok(event)
        })
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.db
            .with_conn(|conn| queue_stats(conn, QueueTable::Outbox))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::delivery::backoff_ms;
    use crate::test_support::enabled_config;
    use serde_json::json;

    const NOW: i64 = 1_730_000_000_000;

    fn outbox() -> Outbox {
        Outbox::new(Database::open(None).unwrap())
    }

    fn ok(id: i64) -> AckResult {
        AckResult {
            id,
            success: true,
            error: None,
            permanent: false,
        }
    }

    fn fail(id: i64, permanent: bool) -> AckResult {
        AckResult {
            id,
            success: false,
            error: Some("discord 503".into()),
            permanent,
        }
    }

    #[test]
    fn test_disabled_outbox_enqueues_nothing() {
        let outbox = outbox();
        let mut config = enabled_config();
        config.outbox_enabled = false;
        let id = outbox
            .enqueue(&config, EVENT_DEMO_SUBMITTED, &json!({}), None, NOW)
            .unwrap();
        assert_eq!(id, None);

        config.outbox_enabled = true;
        config.enabled = false;
        assert_eq!(
            outbox.enqueue_best_effort(&config, EVENT_DEMO_SUBMITTED, &json!({}), None, NOW),
            None
        );
        assert_eq!(outbox.stats().unwrap(), QueueStats::default());
    }

    #[test]
    fn test_pull_ack_cycle() {
        let outbox = outbox();
        let config = enabled_config();
        for i in 0..3 {
            outbox
                .enqueue(&config, EVENT_DEMO_SUBMITTED, &json!({ "n": i }), Some("demo-1"), NOW + i)
                .unwrap()
                .unwrap();
        }

        let events = outbox.claim(Some(5), NOW + 10).unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        assert!(events.iter().all(|e| e.status == DeliveryStatus::Processing));
        assert!(events.iter().all(|e| e.attempts == 1));
        assert_eq!(events[0].payload, json!({ "n": 0 }));

        let results: Vec<_> = events.iter().map(|e| ok(e.id)).collect();
        let summary = outbox.ack(&results, NOW + 20).unwrap();
        assert_eq!(summary.sent, 3);
        assert!(summary.skipped.is_empty());

        assert!(outbox.claim(Some(5), NOW + 30).unwrap().is_empty());
        assert_eq!(outbox.stats().unwrap().sent, 3);
    }

    #[test]
    fn test_claim_respects_batch_size_and_due_time() {
        let outbox = outbox();
        let config = enabled_config();
        for i in 0..4 {
            outbox
                .enqueue(&config, EVENT_TICKET_OPENED, &json!({}), None, NOW + i)
                .unwrap();
        }
        // Not yet due
        assert!(outbox.claim(Some(10), NOW - 1).unwrap().is_empty());

        let first = outbox.claim(Some(3), NOW + 10).unwrap();
        assert_eq!(first.len(), 3);
        let second = outbox.claim(Some(3), NOW + 10).unwrap();
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn test_retry_schedules_backoff() {
        let outbox = outbox();
        let config = enabled_config();
        let id = outbox
            .enqueue(&config, EVENT_DEMO_SUBMITTED, &json!({}), None, NOW)
            .unwrap()
            .unwrap();

        outbox.claim(None, NOW).unwrap();
        let summary = outbox.ack(&[fail(id, false)], NOW).unwrap();
        assert_eq!(summary.retried, 1);

        let event = outbox.get(id).unwrap().unwrap();
        assert_eq!(event.status, DeliveryStatus::Pending);
        assert_eq!(event.next_attempt_at, NOW + backoff_ms(1));
        assert_eq!(event.last_error.as_deref(), Some("discord 503"));

        // Not due before the backoff elapses
        assert!(outbox.claim(None, NOW + backoff_ms(1) - 1).unwrap().is_empty());
        let again = outbox.claim(None, NOW + backoff_ms(1)).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempts, 2);
    }

    #[test]
    fn test_permanent_failure_is_terminal() {
        let outbox = outbox();
        let config = enabled_config();
        let id = outbox
            .enqueue(&config, EVENT_DEMO_SUBMITTED, &json!({}), None, NOW)
            .unwrap()
            .unwrap();
        outbox.claim(None, NOW).unwrap();
        let summary = outbox.ack(&[fail(id, true)], NOW).unwrap();
        assert_eq!(summary.failed, 1);

        let event = outbox.get(id).unwrap().unwrap();
        assert_eq!(event.status, DeliveryStatus::Failed);
        assert!(outbox.claim(None, NOW + 10_000_000).unwrap().is_empty());
    }

    #[test]
    fn test_ack_ignores_rows_not_processing() {
        let outbox = outbox();
        let config = enabled_config();
        let id = outbox
            .enqueue(&config, EVENT_DEMO_SUBMITTED, &json!({}), None, NOW)
            .unwrap()
            .unwrap();

        // Still pending: ack must not move it
        let summary = outbox.ack(&[ok(id), ok(9_999)], NOW).unwrap();
        assert_eq!(summary.sent, 0);
        assert_eq!(summary.skipped, vec![id, 9_999]);
        assert_eq!(outbox.get(id).unwrap().unwrap().status, DeliveryStatus::Pending);

        // Second ack of an already sent row is skipped as well
        outbox.claim(None, NOW).unwrap();
        outbox.ack(&[ok(id)], NOW).unwrap();
        let summary = outbox.ack(&[fail(id, true)], NOW).unwrap();
        assert_eq!(summary.skipped, vec![id]);
        assert_eq!(outbox.get(id).unwrap().unwrap().status, DeliveryStatus::Sent);
    }

    #[test]
    fn test_concurrent_claims_partition_rows() {
        let outbox = outbox();
        let config = enabled_config();
        for i in 0..40 {
            outbox
                .enqueue(&config, EVENT_DEMO_SUBMITTED, &json!({ "n": i }), None, NOW + i)
                .unwrap();
        }

        let (a, b) = std::thread::scope(|s| {
            let worker = || {
                let mut ids = Vec::new();
                loop {
                    let batch = outbox.claim(Some(3), NOW + 100).unwrap();
                    if batch.is_empty() {
                        break ids;
                    }
                    ids.extend(batch.into_iter().map(|e| e.id));
                }
            };
            let left = s.spawn(worker);
            let right = s.spawn(worker);
            (left.join().unwrap(), right.join().unwrap())
        });

        assert_eq!(a.len() + b.len(), 40);
        let mut all: Vec<i64> = a.iter().chain(b.iter()).copied().collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 40);
        assert_eq!(outbox.stats().unwrap().processing, 40);
    }
}
