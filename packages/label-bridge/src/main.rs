//! Label Bridge Server
//!
//! Connects the label portal to its Discord bot:
//!
//! 1. **Signed bot API**: token + HMAC signature + timestamp window + replay
//!    check on every `/api/bridge/*` call, each one written to an audit log.
//!
//! 2. **Event outbox and role-sync queue**: portal actions record events and
//!    role grants; the bot pulls them in exclusive batches and acks each item.
//!
//! 3. **Account linking**: Discord OAuth2 flow, started from either the bot or
//!    the portal, ending in a 1:1 portal user ↔ Discord identity link.
//!
//! Bridge settings live in the database and are edited through the admin API;
//! process settings come from the command line or environment.

mod api;
mod bridge;
mod config;
mod error;
mod oauth;
mod portal;
mod state;
mod storage;

#[cfg(test)]
mod test_support;

use std::time::Duration;

use axum::http::Method;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use bridge::BridgeConfig;
use config::ServerConfig;
use state::AppState;
use storage::Database;

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "label-bridge", version, about = "Label portal ↔ Discord bridge")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "BRIDGE_PORT")]
    port: u16,

    /// SQLite database file. In-memory when unset.
    #[arg(long, env = "DATABASE_PATH")]
    database_path: Option<String>,

    /// Public URL of this service (link URLs, default OAuth redirect URI)
    #[arg(long, default_value = "http://localhost:8080", env = "PUBLIC_BASE_URL")]
    public_base_url: String,

    /// Portal web UI base URL (login and settings pages)
    #[arg(long, default_value = "http://localhost:3000", env = "PORTAL_BASE_URL")]
    portal_base_url: String,

    /// Bearer token for `/admin/bridge/*`. Admin API is closed when unset.
    #[arg(long, env = "ADMIN_TOKEN")]
    admin_token: Option<String>,

    /// Requests allowed per caller and endpoint within one window
    #[arg(long, default_value_t = 160, env = "RATE_LIMIT_MAX")]
    rate_limit_max: usize,

    /// Rate-limit window in seconds
    #[arg(long, default_value_t = 60, env = "RATE_LIMIT_WINDOW_SECS")]
    rate_limit_window_secs: u64,

    /// Attempts before a failing role-sync job is marked failed
    #[arg(long, default_value_t = 7, env = "ROLE_SYNC_MAX_ATTEMPTS")]
    role_sync_max_attempts: u32,

    /// Cleanup interval in seconds
    #[arg(long, default_value_t = 300, env = "CLEANUP_INTERVAL_SECS")]
    cleanup_interval_secs: u64,

    /// Timeout for outbound Discord requests in seconds
    #[arg(long, default_value_t = 30, env = "HTTP_TIMEOUT_SECS")]
    http_timeout_secs: u64,

    /// Discord OAuth2 authorization page
    #[arg(long, default_value = config::DISCORD_AUTH_URL, env = "DISCORD_AUTH_URL")]
    discord_auth_url: String,

    /// Discord OAuth2 token endpoint
    #[arg(long, default_value = config::DISCORD_TOKEN_URL, env = "DISCORD_TOKEN_URL")]
    discord_token_url: String,

    /// Discord REST API base URL
    #[arg(long, default_value = config::DISCORD_API_URL, env = "DISCORD_API_URL")]
    discord_api_url: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            port: self.port,
            public_base_url: self.public_base_url.clone(),
            portal_base_url: self.portal_base_url.clone(),
            admin_token: self.admin_token.clone().filter(|t| !t.trim().is_empty()),
            rate_limit_max: self.rate_limit_max,
            rate_limit_window_secs: self.rate_limit_window_secs,
            role_sync_max_attempts: self.role_sync_max_attempts.max(1),
            cleanup_interval_secs: self.cleanup_interval_secs.max(1),
            http_timeout_secs: self.http_timeout_secs,
            discord_auth_url: self.discord_auth_url.clone(),
            discord_token_url: self.discord_token_url.clone(),
            discord_api_url: self.discord_api_url.clone(),
        }
    }
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "label_bridge=info,tower_http=info".into());
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = args.server_config();

    if args.database_path.is_none() {
        tracing::warn!("No DATABASE_PATH set, using an in-memory database");
    }
    let db = Database::open(args.database_path.as_deref())?;
    let state = AppState::new(config, db)?;

    let now = chrono::Utc::now().timestamp_millis();
    if state.configs.seed_if_missing(&BridgeConfig::from_env(), now)? {
        tracing::info!("[Bridge] Seeded config from environment");
    }
    let bridge_config = state.configs.load()?;
    tracing::info!(
        enabled = bridge_config.enabled,
        secrets_configured = bridge_config.secrets_configured(),
        oauth_configured = bridge_config.oauth_configured(),
        outbox_enabled = bridge_config.outbox_enabled,
        admin_api = state.config.admin_token.is_some(),
        "[Bridge] Loaded config"
    );

    // Spawn periodic cleanup task
    let cleanup_state = state.clone();
    let cleanup_interval = state.config.cleanup_interval_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(cleanup_interval));
        loop {
            interval.tick().await;
            let state = cleanup_state.clone();
            let now = chrono::Utc::now().timestamp_millis();
            if let Err(e) = tokio::task::spawn_blocking(move || state.cleanup_expired(now)).await {
                tracing::error!(error = %e, "Cleanup task failed");
            }
        }
    });

    // Build router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    let app = api::router(state.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", state.config.port);
    tracing::info!("Label bridge starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
