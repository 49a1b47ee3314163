//! Portal boundary.
//!
//! The narrow slice of portal data the bot endpoints read and write: users
//! and their sessions, demos, contracts, earnings, support tickets and
//! release credits. Business rules for these records belong to the portal;
//! this module only validates what the bot sends and records where it came
//! from.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::bridge::config::BridgeConfig;
use crate::bridge::outbox::{Outbox, EVENT_DEMO_SUBMITTED, EVENT_TICKET_OPENED};
use crate::error::{Error, Result};
use crate::storage::Database;

/// Where a record was created from.
pub const SOURCE_DISCORD: &str = "discord";

const MAX_TITLE_LEN: usize = 200;
const MAX_TEXT_LEN: usize = 4000;
const DEFAULT_LIST_LIMIT: i64 = 25;

// ── Records ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalUser {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub role: String,
    pub approved: bool,
    pub discord_user_id: Option<String>,
    pub created_at: i64,
}

impl PortalUser {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            email: row.get(1)?,
            display_name: row.get(2)?,
            role: row.get(3)?,
            approved: row.get(4)?,
            discord_user_id: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Demo {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub artist_name: Option<String>,
    pub track_url: String,
    pub notes: Option<String>,
    pub status: String,
    pub source: String,
    pub created_at: i64,
}

impl Demo {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            artist_name: row.get(3)?,
            track_url: row.get(4)?,
            notes: row.get(5)?,
            status: row.get(6)?,
            source: row.get(7)?,
            created_at: row.get(8)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub id: String,
    pub title: String,
    pub status: String,
    pub royalty_rate: Option<f64>,
    pub signed_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Earning {
    pub id: String,
    pub release_id: Option<String>,
    pub period: String,
    pub amount_cents: i64,
    pub currency: String,
    pub created_at: i64,
}

/// Earnings with per-currency totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EarningsSummary {
    pub totals: BTreeMap<String, i64>,
    pub entries: Vec<Earning>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportTicket {
    pub id: String,
    pub user_id: String,
    pub subject: String,
    pub message: String,
    pub status: String,
    pub source: String,
    pub created_at: i64,
}

/// A credited, approved and linked release artist.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditedArtist {
    pub user_id: String,
    pub discord_user_id: String,
    pub credit: String,
}

// ── Inputs ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDemo {
    pub title: String,
    #[serde(default)]
    pub artist_name: Option<String>,
    pub track_url: String,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewDemo {
    fn validate(&self) -> Result<()> {
        require_text("title", &self.title, MAX_TITLE_LEN)?;
        let url = self.track_url.trim();
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(Error::InvalidRequest(
                "trackUrl must be an http(s) URL".into(),
            ));
        }
        if let Some(notes) = &self.notes {
            if notes.chars().count() > MAX_TEXT_LEN {
                return Err(Error::InvalidRequest("notes is too long".into()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTicket {
    pub subject: String,
    pub message: String,
}

impl NewTicket {
    fn validate(&self) -> Result<()> {
        require_text("subject", &self.subject, MAX_TITLE_LEN)?;
        require_text("message", &self.message, MAX_TEXT_LEN)
    }
}

fn require_text(field: &str, value: &str, max: usize) -> Result<()> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::InvalidRequest(format!("{field} is required")));
    }
    if value.chars().count() > max {
        return Err(Error::InvalidRequest(format!("{field} is too long")));
    }
    Ok(())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ── Portal ───────────────────────────────────────────────────────────────────

/// Load a user on an already-held connection.
pub(crate) fn load_user(conn: &Connection, user_id: &str) -> Result<Option<PortalUser>> {
    let user = conn
        .query_row(
            "SELECT id, email, display_name, role, approved, discord_user_id, created_at
             FROM users WHERE id = ?1",
            params![user_id],
            PortalUser::from_row,
        )
        .optional()?;
    Ok(user)
}

#[derive(Clone)]
pub struct Portal {
    db: Database,
    outbox: Outbox,
}

impl Portal {
    pub fn new(db: Database) -> Self {
        Self {
            outbox: Outbox::new(db.clone()),
            db,
        }
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<PortalUser>> {
        self.db.with_conn(|conn| load_user(conn, user_id))
    }

    /// User behind an unexpired `portal_session` token.
    pub fn session_user(&self, token: &str, now: i64) -> Result<Option<PortalUser>> {
        self.db.with_conn(|conn| {
            let user_id: Option<String> = conn
                .query_row(
                    "SELECT user_id FROM portal_sessions WHERE token = ?1 AND expires_at > ?2",
                    params![token, now],
                    |r| r.get(0),
                )
                .optional()?;
            match user_id {
                Some(id) => load_user(conn, &id),
                None => Ok(None),
            }
        })
    }

    /// Most recent demos first.
    pub fn demos_for_user(&self, user_id: &str, limit: Option<i64>) -> Result<Vec<Demo>> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, 100);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, title, artist_name, track_url, notes, status, source, created_at
                 FROM demos WHERE user_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2",
            )?;
            let demos = stmt
                .query_map(params![user_id, limit], Demo::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(demos)
        })
    }

    pub fn contracts_for_user(&self, user_id: &str) -> Result<Vec<Contract>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, status, royalty_rate, signed_at, created_at
                 FROM contracts WHERE user_id = ?1
                 ORDER BY created_at DESC",
            )?;
            let contracts = stmt
                .query_map(params![user_id], |row| {
                    Ok(Contract {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        status: row.get(2)?,
                        royalty_rate: row.get(3)?,
                        signed_at: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(contracts)
        })
    }

    pub fn earnings_for_user(&self, user_id: &str) -> Result<EarningsSummary> {
        let entries = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, release_id, period, amount_cents, currency, created_at
                 FROM earnings WHERE user_id = ?1
                 ORDER BY period DESC, created_at DESC",
            )?;
            let entries = stmt
                .query_map(params![user_id], |row| {
                    Ok(Earning {
                        id: row.get(0)?,
                        release_id: row.get(1)?,
                        period: row.get(2)?,
                        amount_cents: row.get(3)?,
                        currency: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })?;

        let mut totals = BTreeMap::new();
        for entry in &entries {
            *totals.entry(entry.currency.clone()).or_insert(0) += entry.amount_cents;
        }
        Ok(EarningsSummary { totals, entries })
    }

    /// Store a demo and emit `demo.submitted`.
    pub fn create_demo(
        &self,
        config: &BridgeConfig,
        user_id: &str,
        demo: NewDemo,
        source: &str,
        now: i64,
    ) -> Result<Demo> {
        demo.validate()?;
        let demo = Demo {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: demo.title.trim().to_string(),
            artist_name: non_blank(demo.artist_name),
            track_url: demo.track_url.trim().to_string(),
            notes: non_blank(demo.notes),
            status: "pending".to_string(),
            source: source.to_string(),
            created_at: now,
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO demos
                    (id, user_id, title, artist_name, track_url, notes, status, source, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    demo.id,
                    demo.user_id,
                    demo.title,
                    demo.artist_name,
                    demo.track_url,
                    demo.notes,
                    demo.status,
                    demo.source,
                    demo.created_at,
                ],
            )?;
            Ok(())
        })?;

        tracing::info!(demo_id = %demo.id, user_id, source, "[Portal] Demo submitted");
        self.outbox.enqueue_best_effort(
            config,
            EVENT_DEMO_SUBMITTED,
            &json!({
                "demoId": demo.id,
                "userId": demo.user_id,
                "title": demo.title,
                "artistName": demo.artist_name,
                "trackUrl": demo.track_url,
                "source": demo.source,
            }),
            Some(&demo.id),
            now,
        );
        Ok(demo)
    }

    /// Store a support ticket and emit `support_ticket.opened`.
    pub fn create_ticket(
        &self,
        config: &BridgeConfig,
        user_id: &str,
        ticket: NewTicket,
        source: &str,
        now: i64,
    ) -> Result<SupportTicket> {
        ticket.validate()?;
        let ticket = SupportTicket {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            subject: ticket.subject.trim().to_string(),
            message: ticket.message.trim().to_string(),
            status: "open".to_string(),
            source: source.to_string(),
            created_at: now,
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO support_tickets
                    (id, user_id, subject, message, status, source, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    ticket.id,
                    ticket.user_id,
                    ticket.subject,
                    ticket.message,
                    ticket.status,
                    ticket.source,
                    ticket.created_at,
                ],
            )?;
            Ok(())
        })?;

        tracing::info!(ticket_id = %ticket.id, user_id, source, "[Portal] Support ticket opened");
        self.outbox.enqueue_best_effort(
            config,
            EVENT_TICKET_OPENED,
            &json!({
                "ticketId": ticket.id,
                "userId": ticket.user_id,
                "subject": ticket.subject,
                "source": ticket.source,
            }),
            Some(&ticket.id),
            now,
        );
        Ok(ticket)
    }

    /// Approved, linked artists credited on a release.
    ///
    /// `None` when the release does not exist.
    pub fn release_credited_users(&self, release_id: &str) -> Result<Option<Vec<CreditedArtist>>> {
        self.db.with_conn(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM releases WHERE id = ?1)",
                params![release_id],
                |r| r.get(0),
            )?;
            if !exists {
                return Ok(None);
            }

            let mut stmt = conn.prepare(
                "SELECT ra.user_id, l.discord_user_id, ra.credit
                 FROM release_artists ra
                 JOIN users u ON u.id = ra.user_id
                 JOIN discord_links l ON l.user_id = ra.user_id
                 WHERE ra.release_id = ?1 AND u.approved = 1
                 ORDER BY ra.user_id",
            )?;
            let artists = stmt
                .query_map(params![release_id], |row| {
                    Ok(CreditedArtist {
                        user_id: row.get(0)?,
                        discord_user_id: row.get(1)?,
                        credit: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(Some(artists))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::delivery::QueueStats;
    use crate::test_support::{enabled_config, seed_session, seed_user};

    const NOW: i64 = 1_730_000_000_000;

    fn portal() -> (Portal, Database) {
        let db = Database::open(None).unwrap();
        (Portal::new(db.clone()), db)
    }

    fn demo(title: &str, url: &str) -> NewDemo {
        NewDemo {
            title: title.into(),
            artist_name: Some("  ".into()),
            track_url: url.into(),
            notes: None,
        }
    }

    #[test]
    fn test_session_user_respects_expiry() {
        let (portal, db) = portal();
        seed_user(&db, "u1", "artist", true, None);
        seed_session(&db, "sess-1", "u1", NOW + 1_000);

        let user = portal.session_user("sess-1", NOW).unwrap().unwrap();
        assert_eq!(user.id, "u1");
        assert!(user.approved);
        assert!(portal.session_user("sess-1", NOW + 1_000).unwrap().is_none());
        assert!(portal.session_user("nope", NOW).unwrap().is_none());
    }

    #[test]
    fn test_create_demo_emits_event() {
        let (portal, db) = portal();
        seed_user(&db, "u1", "artist", true, None);
        let config = enabled_config();

        let created = portal
            .create_demo(&config, "u1", demo(" Night Drive ", "https://example.com/t.mp3"), SOURCE_DISCORD, NOW)
            .unwrap();
        assert_eq!(created.title, "Night Drive");
        assert_eq!(created.artist_name, None);
        assert_eq!(created.source, "discord");

        let demos = portal.demos_for_user("u1", None).unwrap();
        assert_eq!(demos, vec![created.clone()]);

        let events = Outbox::new(db).claim(None, NOW).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EVENT_DEMO_SUBMITTED);
        assert_eq!(events[0].aggregate_id.as_deref(), Some(created.id.as_str()));
        assert_eq!(events[0].payload["title"], "Night Drive");
    }

    #[test]
    fn test_demo_validation() {
        let (portal, _) = portal();
        let config = enabled_config();
        assert!(matches!(
            portal.create_demo(&config, "u1", demo("", "https://x.test"), SOURCE_DISCORD, NOW),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            portal.create_demo(&config, "u1", demo("Song", "ftp://x.test"), SOURCE_DISCORD, NOW),
            Err(Error::InvalidRequest(_))
        ));
        assert!(portal.demos_for_user("u1", None).unwrap().is_empty());
    }

    #[test]
    fn test_ticket_without_outbox_still_saved() {
        let (portal, db) = portal();
        let mut config = enabled_config();
        config.outbox_enabled = false;

        let ticket = portal
            .create_ticket(
                &config,
                "u1",
                NewTicket {
                    subject: "Payment".into(),
                    message: "Where is my March statement?".into(),
                },
                SOURCE_DISCORD,
                NOW,
            )
            .unwrap();
        assert_eq!(ticket.status, "open");
        assert_eq!(Outbox::new(db).stats().unwrap(), QueueStats::default());
    }

    #[test]
    fn test_earnings_totals_per_currency() {
        let (portal, db) = portal();
        db.with_conn(|conn| {
            conn.execute_batch(
                "INSERT INTO earnings (id, user_id, period, amount_cents, currency, created_at)
                     VALUES ('e1', 'u1', '2024-01', 1500, 'USD', 1);
                 INSERT INTO earnings (id, user_id, period, amount_cents, currency, created_at)
                     VALUES ('e2', 'u1', '2024-02', 2500, 'USD', 2);
                 INSERT INTO earnings (id, user_id, period, amount_cents, currency, created_at)
                     VALUES ('e3', 'u1', '2024-02', 900, 'EUR', 3);
                 INSERT INTO earnings (id, user_id, period, amount_cents, currency, created_at)
                     VALUES ('e4', 'u2', '2024-02', 100, 'USD', 4);",
            )?;
            Ok(())
        })
        .unwrap();

        let summary = portal.earnings_for_user("u1").unwrap();
        assert_eq!(summary.entries.len(), 3);
        assert_eq!(summary.totals.get("USD"), Some(&4000));
        assert_eq!(summary.totals.get("EUR"), Some(&900));
        assert_eq!(summary.entries[0].period, "2024-02");
    }

    #[test]
    fn test_contracts_for_user() {
        let (portal, db) = portal();
        db.with_conn(|conn| {
            conn.execute_batch(
                "INSERT INTO contracts (id, user_id, title, status, royalty_rate, created_at)
                     VALUES ('c1', 'u1', 'Single deal', 'active', 0.2, 5);",
            )?;
            Ok(())
        })
        .unwrap();
        let contracts = portal.contracts_for_user("u1").unwrap();
        assert_eq!(contracts.len(), 1);
        assert_eq!(contracts[0].royalty_rate, Some(0.2));
        assert!(portal.contracts_for_user("u2").unwrap().is_empty());
    }
}
