//! Account links between portal users and Discord identities.
//!
//! One portal user maps to at most one Discord account and vice versa. The
//! `users.discord_user_id` column mirrors the link for the portal's own
//! queries and is kept in step inside the same transaction.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::portal::{load_user, PortalUser};
use crate::storage::Database;

/// A stored link.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountLink {
    pub user_id: String,
    pub discord_user_id: String,
    pub discord_username: String,
    pub discord_avatar_url: Option<String>,
    pub guild_id: Option<String>,
    pub linked_at: i64,
    pub updated_at: i64,
}

const LINK_COLUMNS: &str = "user_id, discord_user_id, discord_username, discord_avatar_url, \
                            guild_id, linked_at, updated_at";

impl AccountLink {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            discord_user_id: row.get(1)?,
            discord_username: row.get(2)?,
            discord_avatar_url: row.get(3)?,
            guild_id: row.get(4)?,
            linked_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }
}

/// Link to create or refresh.
#[derive(Debug, Clone)]
pub struct NewLink {
    pub user_id: String,
    pub discord_user_id: String,
    pub discord_username: String,
    pub discord_avatar_url: Option<String>,
    pub guild_id: Option<String>,
}

/// Result of looking up a Discord identity.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkLookup {
    Linked { link: AccountLink, user: PortalUser },
    NotLinked,
}

#[derive(Clone)]
pub struct LinkStore {
    db: Database,
}

impl LinkStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create the link, or refresh profile fields of an identical one.
    ///
    /// Fails with [`Error::AccountAlreadyLinked`] if either side is already
    /// bound to someone else.
    pub fn link(&self, new: &NewLink, now: i64) -> Result<AccountLink> {
        let link = self.db.with_tx(|tx| {
            if load_user(tx, &new.user_id)?.is_none() {
                return Err(Error::NotFound(format!("User {}", new.user_id)));
            }

            if let Some(existing) = by_discord_id(tx, &new.discord_user_id)? {
                if existing.user_id != new.user_id {
                    return Err(Error::AccountAlreadyLinked);
                }
            }
            if let Some(existing) = by_user(tx, &new.user_id)? {
                if existing.discord_user_id != new.discord_user_id {
                    return Err(Error::AccountAlreadyLinked);
                }
            }

            tx.execute(
                "INSERT INTO discord_links
                    (user_id, discord_user_id, discord_username, discord_avatar_url,
                     guild_id, linked_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(user_id) DO UPDATE SET
                    discord_username = excluded.discord_username,
                    discord_avatar_url = excluded.discord_avatar_url,
                    guild_id = COALESCE(excluded.guild_id, discord_links.guild_id),
                    updated_at = excluded.updated_at",
                params![
                    new.user_id,
                    new.discord_user_id,
                    new.discord_username,
                    new.discord_avatar_url,
                    new.guild_id,
                    now,
                ],
            )?;
            tx.execute(
                "UPDATE users SET discord_user_id = ?2 WHERE id = ?1",
                params![new.user_id, new.discord_user_id],
            )?;

            by_user(tx, &new.user_id)?
                .ok_or_else(|| Error::Internal("link vanished after upsert".into()))
        })?;

        tracing::info!(
            user_id = %link.user_id,
            discord_user_id = %link.discord_user_id,
            "[Links] Account linked"
        );
        Ok(link)
    }

    /// Remove the user's link. Returns the removed link, `None` if there was
    /// nothing to remove.
    pub fn unlink(&self, user_id: &str) -> Result<Option<AccountLink>> {
        let removed = self.db.with_tx(|tx| {
            let existing = by_user(tx, user_id)?;
            if existing.is_some() {
                tx.execute("DELETE FROM discord_links WHERE user_id = ?1", params![user_id])?;
            }
            tx.execute(
                "UPDATE users SET discord_user_id = NULL WHERE id = ?1",
                params![user_id],
            )?;
            Ok(existing)
        })?;

        if let Some(link) = &removed {
            tracing::info!(
                user_id,
                discord_user_id = %link.discord_user_id,
                "[Links] Account unlinked"
            );
        }
        Ok(removed)
    }

    /// Resolve a Discord identity to its portal user.
    ///
    /// A link whose portal user no longer exists reads as not linked.
    pub fn lookup_by_external_id(&self, discord_user_id: &str) -> Result<LinkLookup> {
        self.db.with_conn(|conn| {
            let Some(link) = by_discord_id(conn, discord_user_id)? else {
                return Ok(LinkLookup::NotLinked);
            };
            match load_user(conn, &link.user_id)? {
                Some(user) => Ok(LinkLookup::Linked { link, user }),
                None => {
                    tracing::warn!(
                        user_id = %link.user_id,
                        discord_user_id,
                        "[Links] Link points at a missing portal user"
                    );
                    Ok(LinkLookup::NotLinked)
                }
            }
        })
    }

    pub fn lookup_by_user(&self, user_id: &str) -> Result<Option<AccountLink>> {
        self.db.with_conn(|conn| by_user(conn, user_id))
    }

    pub fn count(&self) -> Result<i64> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM discord_links", [], |r| r.get(0))?)
        })
    }
}

fn by_user(conn: &Connection, user_id: &str) -> Result<Option<AccountLink>> {
    let link = conn
        .query_row(
            &format!("SELECT {LINK_COLUMNS} FROM discord_links WHERE user_id = ?1"),
            params![user_id],
            AccountLink::from_row,
        )
        .optional()?;
    Ok(link)
}

fn by_discord_id(conn: &Connection, discord_user_id: &str) -> Result<Option<AccountLink>> {
    let link = conn
        .query_row(
            &format!("SELECT {LINK_COLUMNS} FROM discord_links WHERE discord_user_id = ?1"),
            params![discord_user_id],
            AccountLink::from_row,
        )
        .optional()?;
    Ok(link)
}
