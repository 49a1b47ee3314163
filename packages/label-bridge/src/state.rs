//! Shared server state.
//!
//! Every store is a cheap clone over the same [`Database`] handle, so the
//! whole state is `Clone` and handed to axum as router state.

use std::sync::Arc;
use std::time::Instant;

use crate::bridge::{AuditLog, Authenticator, ConfigStore, LinkStore, Outbox, RateLimiter, RoleSyncQueue};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::oauth::discord::DiscordClient;
use crate::oauth::OAuthStateStore;
use crate::portal::Portal;
use crate::storage::Database;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub db: Database,
    pub configs: ConfigStore,
    pub audit: AuditLog,
    pub authenticator: Authenticator,
    pub links: LinkStore,
    pub oauth_states: OAuthStateStore,
    pub outbox: Outbox,
    pub role_sync: RoleSyncQueue,
    pub portal: Portal,
    pub limiter: RateLimiter,
    pub discord: DiscordClient,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig, db: Database) -> Result<Self> {
        let limiter = RateLimiter::new(
            config.rate_limit_max,
            (config.rate_limit_window_secs as i64).saturating_mul(1000),
        );
        let configs = ConfigStore::new(db.clone());
        let audit = AuditLog::new(db.clone());
        let authenticator = Authenticator::new(configs.clone(), audit.clone(), limiter.clone());
        let discord = DiscordClient::new(&config)?;

        Ok(Self {
            links: LinkStore::new(db.clone()),
            oauth_states: OAuthStateStore::new(db.clone()),
            outbox: Outbox::new(db.clone()),
            role_sync: RoleSyncQueue::new(db.clone(), config.role_sync_max_attempts),
            portal: Portal::new(db.clone()),
            config: Arc::new(config),
            db,
            configs,
            audit,
            authenticator,
            limiter,
            discord,
            started_at: Instant::now(),
        })
    }

    /// Periodic housekeeping: purge old OAuth states and idle rate-limit
    /// windows.
    pub fn cleanup_expired(&self, now: i64) {
        match self.oauth_states.purge_expired(now) {
            Ok(0) => {}
            Ok(purged) => tracing::info!(purged, "Purged expired OAuth states"),
            Err(e) => tracing::error!(error = %e, "Failed to purge OAuth states"),
        }

        let pruned = self.limiter.prune(now);
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned idle rate-limit windows");
        }
    }
}
