//! Shared fixtures for unit tests.

use axum::body::Body;
use axum::http::Request;
use rusqlite::params;

use crate::bridge::auth::{
    BridgeHeaders, HEADER_BOT_TOKEN, HEADER_DISCORD_USER_ID, HEADER_SIGNATURE, HEADER_TIMESTAMP,
};
use crate::bridge::signing;
use crate::bridge::BridgeConfig;
use crate::config::ServerConfig;
use crate::state::AppState;
use crate::storage::Database;

pub const BOT_TOKEN: &str = "bot-token";
pub const SIGNING_SECRET: &str = "signing-secret";
pub const ADMIN_TOKEN: &str = "admin-token";

/// Enabled config with both secrets and OAuth credentials set.
pub fn enabled_config() -> BridgeConfig {
    BridgeConfig {
        enabled: true,
        internal_token: BOT_TOKEN.to_string(),
        internal_signing_secret: SIGNING_SECRET.to_string(),
        oauth_client_id: "client-id".to_string(),
        oauth_client_secret: "client-secret".to_string(),
        outbox_enabled: true,
        ..BridgeConfig::default()
    }
}

/// In-memory app state with [`enabled_config`] saved and an admin token.
pub fn test_state() -> AppState {
    test_state_with(ServerConfig::default())
}

/// Like [`test_state`] but over the given server settings.
pub fn test_state_with(server: ServerConfig) -> AppState {
    let server = ServerConfig {
        admin_token: Some(ADMIN_TOKEN.to_string()),
        ..server
    };
    let db = Database::open(None).unwrap();
    let state = AppState::new(server, db).unwrap();
    state.configs.save(&enabled_config(), None, 0).unwrap();
    state
}

/// Insert a portal user, optionally already linked to `discord_user_id`.
pub fn seed_user(
    db: &Database,
    id: &str,
    role: &str,
    approved: bool,
    discord_user_id: Option<&str>,
) {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO users (id, email, display_name, role, approved, discord_user_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![
                id,
                format!("{id}@example.com"),
                format!("User {id}"),
                role,
                approved,
                discord_user_id
            ],
        )?;
        if let Some(discord_user_id) = discord_user_id {
            conn.execute(
                "INSERT INTO discord_links
                    (user_id, discord_user_id, discord_username, guild_id, linked_at, updated_at)
                 VALUES (?1, ?2, ?3, NULL, 0, 0)",
                params![id, discord_user_id, format!("name-{discord_user_id}")],
            )?;
        }
        Ok(())
    })
    .unwrap();
}

pub fn seed_session(db: &Database, token: &str, user_id: &str, expires_at: i64) {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO portal_sessions (token, user_id, expires_at) VALUES (?1, ?2, ?3)",
            params![token, user_id, expires_at],
        )?;
        Ok(())
    })
    .unwrap();
}

/// Correctly signed bridge headers for a request made at `now`.
pub fn bridge_headers(
    method: &str,
    path: &str,
    body: &[u8],
    now: i64,
    discord_user_id: Option<&str>,
) -> BridgeHeaders {
    let timestamp = now.to_string();
    let signature = signing::sign(SIGNING_SECRET, &timestamp, method, path, body).unwrap();
    BridgeHeaders {
        bot_token: Some(BOT_TOKEN.to_string()),
        signature: Some(signature),
        timestamp: Some(timestamp),
        request_id: None,
        discord_user_id: discord_user_id.map(str::to_string),
        guild_id: None,
    }
}

/// Signed HTTP request stamped with the current time.
pub fn signed_request(
    method: &str,
    path: &str,
    body: &str,
    discord_user_id: Option<&str>,
) -> Request<Body> {
    let now = chrono::Utc::now().timestamp_millis();
    signed_request_at(method, path, body, discord_user_id, now)
}

/// Signed HTTP request stamped with `signed_at`.
pub fn signed_request_at(
    method: &str,
    path: &str,
    body: &str,
    discord_user_id: Option<&str>,
    signed_at: i64,
) -> Request<Body> {
    let headers = bridge_headers(method, path, body.as_bytes(), signed_at, discord_user_id);
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header(HEADER_BOT_TOKEN, BOT_TOKEN)
        .header(HEADER_TIMESTAMP, headers.timestamp.unwrap())
        .header(HEADER_SIGNATURE, headers.signature.unwrap());
    if let Some(id) = discord_user_id {
        builder = builder.header(HEADER_DISCORD_USER_ID, id);
    }
    if !body.is_empty() {
        builder = builder.header("content-type", "application/json");
    }
    builder.body(Body::from(body.to_string())).unwrap()
}
