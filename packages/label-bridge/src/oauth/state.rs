//! Short-lived OAuth link states.
//!
//! A state correlates a Discord authorization back to the portal user it is
//! for. Either side may create it: the portal (user known, Discord identity
//! not yet) or the bot (Discord identity known, user attached when the
//! browser arrives with a portal session).
//!
//! ```text
//! created ──attach──► attached ──consume──► consumed
//!    │                    │
//!    └────── expires_at ──┴──► expired
//! ```
//!
//! Consumed and expired states are inert.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use crate::error::Result;
use crate::storage::Database;

/// How long a state stays usable (15 minutes).
pub const STATE_TTL_MS: i64 = 15 * 60 * 1000;

/// Expired states are kept this long before being purged (1 day).
const PURGE_GRACE_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthState {
    pub token: String,
    pub user_id: Option<String>,
    pub discord_user_id: Option<String>,
    pub discord_username: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
    pub consumed_at: Option<i64>,
}

const STATE_COLUMNS: &str =
    "token, user_id, discord_user_id, discord_username, created_at, expires_at, consumed_at";

impl OAuthState {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            token: row.get(0)?,
            user_id: row.get(1)?,
            discord_user_id: row.get(2)?,
            discord_username: row.get(3)?,
            created_at: row.get(4)?,
            expires_at: row.get(5)?,
            consumed_at: row.get(6)?,
        })
    }
}

/// Whichever half of the link is known when the state is created.
#[derive(Debug, Clone, Default)]
pub struct NewOAuthState {
    pub user_id: Option<String>,
    pub discord_user_id: Option<String>,
    pub discord_username: Option<String>,
}

/// 32 random bytes, URL-safe base64 without padding.
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Clone)]
pub struct OAuthStateStore {
    db: Database,
}

impl OAuthStateStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create(&self, new: NewOAuthState, now: i64) -> Result<OAuthState> {
        let state = OAuthState {
            token: generate_token(),
            user_id: new.user_id,
            discord_user_id: new.discord_user_id,
            discord_username: new.discord_username,
            created_at: now,
            expires_at: now + STATE_TTL_MS,
            consumed_at: None,
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO discord_oauth_states
                    (token, user_id, discord_user_id, discord_username, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    state.token,
                    state.user_id,
                    state.discord_user_id,
                    state.discord_username,
                    state.created_at,
                    state.expires_at,
                ],
            )?;
            Ok(())
        })?;

        tracing::debug!(
            user_initiated = state.user_id.is_some(),
            bot_initiated = state.discord_user_id.is_some(),
            "[OAuth] State created"
        );
        Ok(state)
    }

    /// Fill in the portal user on a usable state. A state already bound to
    /// another user is left alone. Returns whether the row changed.
    pub fn attach(&self, token: &str, user_id: &str, now: i64) -> Result<bool> {
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE discord_oauth_states SET user_id = ?2
                 WHERE token = ?1
                   AND consumed_at IS NULL
                   AND expires_at > ?3
                   AND (user_id IS NULL OR user_id = ?2)",
                params![token, user_id, now],
            )?)
        })?;
        Ok(changed > 0)
    }

    /// Mark the state consumed. Only one caller ever gets `Some`.
    pub fn consume(&self, token: &str, now: i64) -> Result<Option<OAuthState>> {
        self.db.with_conn(|conn| {
            let state = conn
                .query_row(
                    &format!(
                        "UPDATE discord_oauth_states SET consumed_at = ?2
                         WHERE token = ?1 AND consumed_at IS NULL AND expires_at > ?2
                         RETURNING {STATE_COLUMNS}"
                    ),
                    params![token, now],
                    OAuthState::from_row,
                )
                .optional()?;
            Ok(state)
        })
    }

    /// The state if it is neither consumed nor expired.
    pub fn get_valid(&self, token: &str, now: i64) -> Result<Option<OAuthState>> {
        self.db.with_conn(|conn| {
            let state = conn
                .query_row(
                    &format!(
                        "SELECT {STATE_COLUMNS} FROM discord_oauth_states
                         WHERE token = ?1 AND consumed_at IS NULL AND expires_at > ?2"
                    ),
                    params![token, now],
                    OAuthState::from_row,
                )
                .optional()?;
            Ok(state)
        })
    }

    /// Delete states that expired more than a day ago.
    pub fn purge_expired(&self, now: i64) -> Result<usize> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM discord_oauth_states WHERE expires_at <= ?1",
                params![now - PURGE_GRACE_MS],
            )?)
        })
    }

    /// Usable states.
    pub fn pending_count(&self, now: i64) -> Result<i64> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM discord_oauth_states
                 WHERE consumed_at IS NULL AND expires_at > ?1",
                params![now],
                |r| r.get(0),
            )?)
        })
    }
}
