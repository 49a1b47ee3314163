//! Process-level server configuration.
//!
//! Settings that belong to the running process (listen port, public URLs,
//! admin token, limits). Bridge settings that an administrator edits at
//! runtime live in the `bridge_config` row instead, see
//! [`crate::bridge::config`].

/// Default sliding-window budget per `discordUserId:endpoint`.
const DEFAULT_RATE_LIMIT_MAX: usize = 160;

/// Default sliding-window length (1 minute).
const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Transient role-sync failures after this many attempts become terminal.
const DEFAULT_ROLE_SYNC_MAX_ATTEMPTS: u32 = 7;

/// Default housekeeping interval (5 minutes).
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300;

pub const DISCORD_AUTH_URL: &str = "https://discord.com/oauth2/authorize";
pub const DISCORD_TOKEN_URL: &str = "https://discord.com/api/oauth2/token";
pub const DISCORD_API_URL: &str = "https://discord.com/api/v10";

/// Discord OAuth2 scopes required for account linking.
pub const DISCORD_SCOPES: &[&str] = &["identify"];

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Base URL this service is reachable at (used for link URLs and the
    /// default OAuth redirect URI).
    pub public_base_url: String,
    /// Base URL of the portal web UI (login page, settings page).
    pub portal_base_url: String,
    /// Bearer token for the admin endpoints. Admin API is closed when unset.
    pub admin_token: Option<String>,
    pub rate_limit_max: usize,
    pub rate_limit_window_secs: u64,
    pub role_sync_max_attempts: u32,
    pub cleanup_interval_secs: u64,
    /// Timeout for outbound Discord requests.
    pub http_timeout_secs: u64,
    /// Discord OAuth2 authorization page.
    pub discord_auth_url: String,
    /// Discord OAuth2 code exchange endpoint.
    pub discord_token_url: String,
    /// Discord REST API base (`/users/@me` is appended).
    pub discord_api_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            public_base_url: "http://localhost:8080".to_string(),
            portal_base_url: "http://localhost:3000".to_string(),
            admin_token: None,
            rate_limit_max: DEFAULT_RATE_LIMIT_MAX,
            rate_limit_window_secs: DEFAULT_RATE_LIMIT_WINDOW_SECS,
            role_sync_max_attempts: DEFAULT_ROLE_SYNC_MAX_ATTEMPTS,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            http_timeout_secs: 30,
            discord_auth_url: DISCORD_AUTH_URL.to_string(),
            discord_token_url: DISCORD_TOKEN_URL.to_string(),
            discord_api_url: DISCORD_API_URL.to_string(),
        }
    }
}

impl ServerConfig {
    /// Redirect URI registered with Discord when the config row has none.
    pub fn default_redirect_uri(&self) -> String {
        format!(
            "{}/auth/discord/callback",
            self.public_base_url.trim_end_matches('/')
        )
    }

    /// URL the bot hands to a Discord user to start linking.
    pub fn link_start_url(&self, state: &str) -> String {
        format!(
            "{}/auth/discord/start?state={}",
            self.public_base_url.trim_end_matches('/'),
            urlencoding::encode(state)
        )
    }

    /// Portal settings page the OAuth callback lands on.
    pub fn portal_result_url(&self, status: &str) -> String {
        format!(
            "{}/settings/discord?status={}",
            self.portal_base_url.trim_end_matches('/'),
            status
        )
    }

    /// Portal login page, returning to `next` afterwards.
    pub fn portal_login_url(&self, next: &str) -> String {
        format!(
            "{}/login?next={}",
            self.portal_base_url.trim_end_matches('/'),
            urlencoding::encode(next)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.rate_limit_max, 160);
        assert_eq!(config.rate_limit_window_secs, 60);
        assert_eq!(config.role_sync_max_attempts, 7);
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn test_urls_trim_trailing_slash() {
        let config = ServerConfig {
            public_base_url: "https://bridge.example.com/".into(),
            portal_base_url: "https://portal.example.com/".into(),
            ..ServerConfig::default()
        };
        assert_eq!(
            config.default_redirect_uri(),
            "https://bridge.example.com/auth/discord/callback"
        );
        assert_eq!(
            config.portal_result_url("linked"),
            "https://portal.example.com/settings/discord?status=linked"
        );
        assert_eq!(
            config.portal_login_url("/auth/discord/start?state=a b"),
            "https://portal.example.com/login?next=%2Fauth%2Fdiscord%2Fstart%3Fstate%3Da%20b"
        );
    }

    #[test]
    fn test_discord_urls_default_to_discord() {
        let config = ServerConfig::default();
        assert_eq!(config.discord_auth_url, "https://discord.com/oauth2/authorize");
        assert_eq!(config.discord_token_url, "https://discord.com/api/oauth2/token");
        assert_eq!(config.discord_api_url, "https://discord.com/api/v10");
    }
}
