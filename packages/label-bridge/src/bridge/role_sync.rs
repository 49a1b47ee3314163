//! Role reconciliation queue.
//!
//! Jobs ask the bot to give a linked Discord member the guild role that
//! matches their portal role. At most one job per `(user, role)` is active
//! (pending or processing) at a time; asking again while one is outstanding
//! returns the existing job.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::config::{normalize_role, BridgeConfig};
use super::delivery::{
    apply_ack, clamp_batch_size, queue_stats, status_column, AckResult, AckSummary,
    DeliveryStatus, QueueStats, QueueTable,
};
use crate::error::{Error, Result};
use crate::portal::Portal;
use crate::storage::Database;

/// Portal role granted to credited release artists.
pub const ARTIST_ROLE: &str = "artist";

/// A queued role-sync job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleSyncJob {
    pub id: i64,
    pub user_id: String,
    pub discord_user_id: Option<String>,
    pub target_role: String,
    /// Discord role id resolved from the role map when the job was queued.
    pub target_role_id: Option<String>,
    pub guild_id: Option<String>,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

const JOB_COLUMNS: &str = "id, user_id, discord_user_id, target_role, target_role_id, guild_id, \
                           status, attempts, next_attempt_at, last_error, created_at, updated_at";

impl RoleSyncJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            discord_user_id: row.get(2)?,
            target_role: row.get(3)?,
            target_role_id: row.get(4)?,
            guild_id: row.get(5)?,
            status: status_column(6, row.get(6)?)?,
            attempts: row.get(7)?,
            next_attempt_at: row.get(8)?,
            last_error: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}

/// Parameters for [`RoleSyncQueue::enqueue`].
#[derive(Debug, Clone)]
pub struct RoleSyncRequest<'a> {
    pub user_id: &'a str,
    pub discord_user_id: Option<&'a str>,
    pub role: &'a str,
    /// Falls back to the config's default guild.
    pub guild_id: Option<&'a str>,
}

#[derive(Clone)]
pub struct RoleSyncQueue {
    db: Database,
    max_attempts: u32,
}

impl RoleSyncQueue {
    pub fn new(db: Database, max_attempts: u32) -> Self {
        Self {
            db,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Queue a role sync, or return the job already outstanding for the
    /// same user and role. The flag is `true` when a job was created.
    pub fn enqueue(
        &self,
        config: &BridgeConfig,
        req: RoleSyncRequest<'_>,
        now: i64,
    ) -> Result<(RoleSyncJob, bool)> {
        let role = normalize_role(req.role);
        if role.is_empty() {
            return Err(Error::InvalidRequest("role must not be empty".into()));
        }
        let role_id = config.role_id_for(&role);
        let guild_id = req
            .guild_id
            .map(str::to_string)
            .or_else(|| config.default_guild_id.clone());

        let (job, created) = self.db.with_tx(|tx| {
            if let Some(existing) = find_active(tx, req.user_id, &role)? {
                return Ok((existing, false));
            }

            tx.execute(
                "INSERT INTO bridge_role_sync_jobs
                    (user_id, discord_user_id, target_role, target_role_id, guild_id,
                     status, attempts, next_attempt_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?6, ?6)",
                params![req.user_id, req.discord_user_id, role, role_id, guild_id, now],
            )?;
            let id = tx.last_insert_rowid();
            let job = tx.query_row(
                &format!("SELECT {JOB_COLUMNS} FROM bridge_role_sync_jobs WHERE id = ?1"),
                params![id],
                RoleSyncJob::from_row,
            )?;
            Ok((job, true))
        })?;

        if created {
            tracing::info!(
                job_id = job.id,
                user_id = %job.user_id,
                role = %job.target_role,
                role_id = ?job.target_role_id,
                "[RoleSync] Job enqueued"
            );
        } else {
            tracing::debug!(job_id = job.id, "[RoleSync] Active job already queued");
        }
        Ok((job, created))
    }

    /// Claim up to `batch_size` due jobs, oldest first.
    pub fn claim(&self, batch_size: Option<u32>, now: i64) -> Result<Vec<RoleSyncJob>> {
        let limit = clamp_batch_size(batch_size);
        let mut jobs = self.db.with_tx(|tx| {
            let mut stmt = tx.prepare(&format!(
                "UPDATE bridge_role_sync_jobs
                 SET status = 'processing', attempts = attempts + 1, updated_at = ?1
                 WHERE id IN (
                     SELECT id FROM bridge_role_sync_jobs
                     WHERE status = 'pending' AND next_attempt_at <= ?1
                     ORDER BY created_at, id
                     LIMIT ?2
                 )
                 RETURNING {JOB_COLUMNS}"
            ))?;
            let rows = stmt
                .query_map(params![now, limit], RoleSyncJob::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    /// Apply results; transient failures past `max_attempts` become terminal.
    pub fn ack(&self, results: &[AckResult], now: i64) -> Result<AckSummary> {
        let max = self.max_attempts;
        let summary = self
            .db
            .with_tx(|tx| apply_ack(tx, QueueTable::RoleSync, results, now, Some(max)))?;
        tracing::info!(
            sent = summary.sent,
            retried = summary.retried,
            failed = summary.failed,
            skipped = summary.skipped.len(),
            "[RoleSync] Ack applied"
        );
        Ok(summary)
    }

    /// Queue the artist role for every approved, linked artist credited on
    /// a release.
    pub fn sync_release_artists(
        &self,
        config: &BridgeConfig,
        portal: &Portal,
        release_id: &str,
        now: i64,
    ) -> Result<Vec<RoleSyncJob>> {
        let credited = portal
            .release_credited_users(release_id)?
            .ok_or_else(|| Error::NotFound(format!("Release {release_id}")))?;

        let mut jobs = Vec::with_capacity(credited.len());
        for artist in &credited {
            let (job, _) = self.enqueue(
                config,
                RoleSyncRequest {
                    user_id: &artist.user_id,
                    discord_user_id: Some(&artist.discord_user_id),
                    role: ARTIST_ROLE,
                    guild_id: None,
                },
                now,
            )?;
            jobs.push(job);
        }

        tracing::info!(release_id, jobs = jobs.len(), "[RoleSync] Release artists queued");
        Ok(jobs)
    }

    pub fn get(&self, id: i64) -> Result<Option<RoleSyncJob>> {
        self.db.with_conn(|conn| {
            let job = conn
                .query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM bridge_role_sync_jobs WHERE id = ?1"),
                    params![id],
                    RoleSyncJob::from_row,
                )
                .optional()?;
            Ok(job)
        })
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.db
            .with_conn(|conn| queue_stats(conn, QueueTable::RoleSync))
    }
}

fn find_active(conn: &Connection, user_id: &str, role: &str) -> Result<Option<RoleSyncJob>> {
    let job = conn
        .query_row(
            &format!(
                "SELECT {JOB_COLUMNS} FROM bridge_role_sync_jobs
                 WHERE user_id = ?1 AND target_role = ?2
                   AND status IN ('pending', 'processing')
                 ORDER BY id LIMIT 1"
            ),
            params![user_id, role],
            RoleSyncJob::from_row,
        )
        .optional()?;
    Ok(job)
}
