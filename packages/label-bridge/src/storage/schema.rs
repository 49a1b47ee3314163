//! # Database Schema
//!
//! SQL schema for the bridge tables plus the slice of portal tables the bot
//! endpoints read and write through.
//!
//! ## Schema Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         BRIDGE TABLES                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────────┐   ┌──────────────────────┐  ┌──────────────────┐  │
//! │  │  bridge_config   │   │ discord_oauth_states │  │  discord_links   │  │
//! │  ├──────────────────┤   ├──────────────────────┤  ├──────────────────┤  │
//! │  │ id (=1)          │   │ token                │  │ user_id          │  │
//! │  │ version          │   │ user_id?             │  │ discord_user_id  │  │
//! │  │ data (JSON)      │   │ discord_user_id?     │  │ discord_username │  │
//! │  │ updated_at       │   │ expires_at           │  │ guild_id?        │  │
//! │  └──────────────────┘   │ consumed_at?         │  └──────────────────┘  │
//! │                         └──────────────────────┘                        │
//! │  ┌──────────────────────┐  ┌──────────────────────┐  ┌───────────────┐  │
//! │  │ bridge_outbox_events │  │ bridge_role_sync_jobs│  │ audit_log     │  │
//! │  ├──────────────────────┤  ├──────────────────────┤  ├───────────────┤  │
//! │  │ id                   │  │ id                   │  │ request_id    │  │
//! │  │ event_type           │  │ user_id              │  │ endpoint      │  │
//! │  │ payload (JSON)       │  │ target_role          │  │ signature     │  │
//! │  │ status / attempts    │  │ status / attempts    │  │ success       │  │
//! │  │ next_attempt_at      │  │ next_attempt_at      │  │ status_code   │  │
//! │  └──────────────────────┘  └──────────────────────┘  └───────────────┘  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All timestamps are Unix epoch milliseconds.

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL to create all tables
pub const CREATE_TABLES: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

-- ----------------------------------------------------------------------------
-- Portal tables (owned by the portal, mirrored here at their boundary)
-- ----------------------------------------------------------------------------

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    -- Portal role (artist, label_manager, admin, ...)
    role TEXT NOT NULL DEFAULT 'artist',
    approved INTEGER NOT NULL DEFAULT 0,
    -- Denormalized pointer to discord_links for fast lookup
    discord_user_id TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS portal_sessions (
    token TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS demos (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    title TEXT NOT NULL,
    artist_name TEXT,
    track_url TEXT NOT NULL,
    notes TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    -- Where the submission came from (portal, discord)
    source TEXT NOT NULL DEFAULT 'portal',
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_demos_user ON demos(user_id, created_at);

CREATE TABLE IF NOT EXISTS contracts (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    title TEXT NOT NULL,
    status TEXT NOT NULL,
    royalty_rate REAL,
    signed_at INTEGER,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_contracts_user ON contracts(user_id);

CREATE TABLE IF NOT EXISTS earnings (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    release_id TEXT,
    period TEXT NOT NULL,
    amount_cents INTEGER NOT NULL,
    currency TEXT NOT NULL DEFAULT 'USD',
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_earnings_user ON earnings(user_id);

CREATE TABLE IF NOT EXISTS support_tickets (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    subject TEXT NOT NULL,
    message TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    source TEXT NOT NULL DEFAULT 'portal',
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS releases (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    release_date TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS release_artists (
    release_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    credit TEXT NOT NULL DEFAULT 'primary',
    PRIMARY KEY (release_id, user_id)
);

-- ----------------------------------------------------------------------------
-- Bridge tables
-- ----------------------------------------------------------------------------

-- Singleton config row
CREATE TABLE IF NOT EXISTS bridge_config (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    data TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

-- One row per portal user; no FK so user deletion never cascades here
CREATE TABLE IF NOT EXISTS discord_links (
    user_id TEXT PRIMARY KEY,
    discord_user_id TEXT NOT NULL UNIQUE,
    discord_username TEXT NOT NULL,
    discord_avatar_url TEXT,
    guild_id TEXT,
    linked_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS discord_oauth_states (
    token TEXT PRIMARY KEY,
    user_id TEXT,
    discord_user_id TEXT,
    discord_username TEXT,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    consumed_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_oauth_states_expiry ON discord_oauth_states(expires_at);

CREATE TABLE IF NOT EXISTS bridge_outbox_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    aggregate_id TEXT,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'processing', 'sent', 'failed')),
    attempts INTEGER NOT NULL DEFAULT 0,
    next_attempt_at INTEGER NOT NULL,
    last_error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_outbox_due
    ON bridge_outbox_events(status, next_attempt_at, created_at);

CREATE TABLE IF NOT EXISTS bridge_role_sync_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    discord_user_id TEXT,
    target_role TEXT NOT NULL,
    target_role_id TEXT,
    guild_id TEXT,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'processing', 'sent', 'failed')),
    attempts INTEGER NOT NULL DEFAULT 0,
    next_attempt_at INTEGER NOT NULL,
    last_error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_role_sync_due
    ON bridge_role_sync_jobs(status, next_attempt_at, created_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_role_sync_active
    ON bridge_role_sync_jobs(user_id, target_role)
    WHERE status IN ('pending', 'processing');

-- Append-only; doubles as the replay index
CREATE TABLE IF NOT EXISTS bridge_audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    method TEXT NOT NULL,
    discord_user_id TEXT,
    guild_id TEXT,
    success INTEGER NOT NULL,
    status_code INTEGER NOT NULL,
    signature TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_signature
    ON bridge_audit_log(signature, success, created_at);
"#;

/// Migration from v1 to v2: role-sync retry scheduling and the active-job
/// uniqueness guard.
pub const MIGRATE_V1_TO_V2: &str = r#"
ALTER TABLE bridge_role_sync_jobs ADD COLUMN next_attempt_at INTEGER NOT NULL DEFAULT 0;
CREATE INDEX IF NOT EXISTS idx_role_sync_due
    ON bridge_role_sync_jobs(status, next_attempt_at, created_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_role_sync_active
    ON bridge_role_sync_jobs(user_id, target_role)
    WHERE status IN ('pending', 'processing');
"#;
