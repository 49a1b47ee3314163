//! Bridge configuration row.
//!
//! A single versioned row (`bridge_config`, id = 1) holding the enable flag,
//! shared secrets, OAuth client settings, the portal-role → Discord-role map
//! and the knobs the bot reads at runtime. Each operation loads an owned
//! snapshot via [`ConfigStore::load`] and passes it down explicitly.

use std::collections::BTreeMap;
use std::env;

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::{json_column_error, Database};

// ── Config Types ─────────────────────────────────────────────────────────────

/// Personality and helper settings forwarded to the bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BotRuntime {
    pub personality: String,
    pub smart_helper_enabled: bool,
    /// Reply automatically when a keyword matches, instead of suggesting.
    pub smart_helper_auto_reply: bool,
    pub help_keywords: Vec<String>,
    pub demo_keywords: Vec<String>,
    pub support_keywords: Vec<String>,
}

impl Default for BotRuntime {
    fn default() -> Self {
        Self {
            personality: "friendly".to_string(),
            smart_helper_enabled: true,
            smart_helper_auto_reply: false,
            help_keywords: vec!["help".into(), "how do i".into()],
            demo_keywords: vec!["demo".into(), "submit".into()],
            support_keywords: vec!["support".into(), "ticket".into(), "payment".into()],
        }
    }
}

/// Full bridge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    pub enabled: bool,
    /// Shared token the bot sends in `x-bot-token`.
    pub internal_token: String,
    /// HMAC key for request signatures.
    pub internal_signing_secret: String,
    pub oauth_client_id: String,
    pub oauth_client_secret: String,
    /// Empty means "use the server's default callback URL".
    pub oauth_redirect_uri: String,
    pub default_guild_id: Option<String>,
    /// Portal role (lowercase) → Discord role id.
    pub role_map: BTreeMap<String, String>,
    pub outbox_enabled: bool,
    pub bot_runtime: BotRuntime,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            internal_token: String::new(),
            internal_signing_secret: String::new(),
            oauth_client_id: String::new(),
            oauth_client_secret: String::new(),
            oauth_redirect_uri: String::new(),
            default_guild_id: None,
            role_map: BTreeMap::new(),
            outbox_enabled: true,
            bot_runtime: BotRuntime::default(),
        }
    }
}

impl BridgeConfig {
    /// Seed configuration from environment variables.
    ///
    /// Only used when the database has no config row yet; afterwards the
    /// row is the source of truth.
    pub fn from_env() -> Self {
        let flag = |key: &str, default: bool| {
            env::var(key)
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(default)
        };
        let text = |key: &str| env::var(key).unwrap_or_default();

        Self {
            enabled: flag("BRIDGE_ENABLED", false),
            internal_token: text("BRIDGE_INTERNAL_TOKEN"),
            internal_signing_secret: text("BRIDGE_SIGNING_SECRET"),
            oauth_client_id: text("DISCORD_CLIENT_ID"),
            oauth_client_secret: text("DISCORD_CLIENT_SECRET"),
            oauth_redirect_uri: text("DISCORD_REDIRECT_URI"),
            default_guild_id: env::var("DISCORD_GUILD_ID").ok().filter(|v| !v.is_empty()),
            role_map: parse_role_map(&text("BRIDGE_ROLE_MAP")),
            outbox_enabled: flag("BRIDGE_OUTBOX_ENABLED", true),
            bot_runtime: BotRuntime::default(),
        }
    }

    /// Token and signing secret are both set.
    pub fn secrets_configured(&self) -> bool {
        !self.internal_token.trim().is_empty() && !self.internal_signing_secret.trim().is_empty()
    }

    /// OAuth client id and secret are both set.
    pub fn oauth_configured(&self) -> bool {
        !self.oauth_client_id.trim().is_empty() && !self.oauth_client_secret.trim().is_empty()
    }

    /// Discord role id mapped to a portal role, if any.
    pub fn role_id_for(&self, role: &str) -> Option<String> {
        self.role_map.get(&normalize_role(role)).cloned()
    }

    /// Outbox writes are accepted.
    pub fn outbox_active(&self) -> bool {
        self.enabled && self.outbox_enabled
    }
}

/// Lowercased, trimmed role name used as the map key and dedup key.
pub fn normalize_role(role: &str) -> String {
    role.trim().to_ascii_lowercase()
}

/// Parse `artist=123,label_manager=456` into a role map.
pub fn parse_role_map(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (role, id) = pair.split_once('=')?;
            let role = normalize_role(role);
            let id = id.trim();
            if role.is_empty() || id.is_empty() {
                None
            } else {
                Some((role, id.to_string()))
            }
        })
        .collect()
}

/// A config snapshot with its row version.
#[derive(Debug, Clone)]
pub struct StoredBridgeConfig {
    pub version: i64,
    pub updated_at: i64,
    pub config: BridgeConfig,
}

/// Admin view with secrets replaced by presence flags.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfigView {
    pub version: i64,
    pub updated_at: i64,
    pub enabled: bool,
    pub internal_token_configured: bool,
    pub signing_secret_configured: bool,
    pub oauth_client_id: String,
    pub oauth_client_secret_configured: bool,
    pub oauth_redirect_uri: String,
    pub default_guild_id: Option<String>,
    pub role_map: BTreeMap<String, String>,
    pub outbox_enabled: bool,
    pub bot_runtime: BotRuntime,
}

impl From<&StoredBridgeConfig> for BridgeConfigView {
    fn from(stored: &StoredBridgeConfig) -> Self {
        let c = &stored.config;
        Self {
            version: stored.version,
            updated_at: stored.updated_at,
            enabled: c.enabled,
            internal_token_configured: !c.internal_token.is_empty(),
            signing_secret_configured: !c.internal_signing_secret.is_empty(),
            oauth_client_id: c.oauth_client_id.clone(),
            oauth_client_secret_configured: !c.oauth_client_secret.is_empty(),
            oauth_redirect_uri: c.oauth_redirect_uri.clone(),
            default_guild_id: c.default_guild_id.clone(),
            role_map: c.role_map.clone(),
            outbox_enabled: c.outbox_enabled,
            bot_runtime: c.bot_runtime.clone(),
        }
    }
}

/// Partial update sent by an administrator.
///
/// Absent fields keep their current value. Secrets are only replaced when a
/// non-empty value is supplied.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfigUpdate {
    /// Optimistic concurrency guard; rejected if the row moved on.
    pub expected_version: Option<i64>,
    pub enabled: Option<bool>,
    pub internal_token: Option<String>,
    pub internal_signing_secret: Option<String>,
    pub oauth_client_id: Option<String>,
    pub oauth_client_secret: Option<String>,
    pub oauth_redirect_uri: Option<String>,
    pub default_guild_id: Option<Option<String>>,
    pub role_map: Option<BTreeMap<String, String>>,
    pub outbox_enabled: Option<bool>,
    pub bot_runtime: Option<BotRuntime>,
}

impl BridgeConfigUpdate {
    /// Apply this update on top of `config`.
    pub fn apply(self, mut config: BridgeConfig) -> BridgeConfig {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(token) = non_empty(self.internal_token) {
            config.internal_token = token;
        }
        if let Some(secret) = non_empty(self.internal_signing_secret) {
            config.internal_signing_secret = secret;
        }
        if let Some(id) = self.oauth_client_id {
            config.oauth_client_id = id;
        }
        if let Some(secret) = non_empty(self.oauth_client_secret) {
            config.oauth_client_secret = secret;
        }
        if let Some(uri) = self.oauth_redirect_uri {
            config.oauth_redirect_uri = uri;
        }
        if let Some(guild) = self.default_guild_id {
            config.default_guild_id = guild.filter(|g| !g.is_empty());
        }
        if let Some(map) = self.role_map {
            config.role_map = map
                .into_iter()
                .map(|(role, id)| (normalize_role(&role), id))
                .collect();
        }
        if let Some(outbox) = self.outbox_enabled {
            config.outbox_enabled = outbox;
        }
        if let Some(runtime) = self.bot_runtime {
            config.bot_runtime = runtime;
        }
        config
    }
}

// ── Store ────────────────────────────────────────────────────────────────────

/// Reads and writes the config row.
#[derive(Clone)]
pub struct ConfigStore {
    db: Database,
}

impl ConfigStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Current config snapshot. A missing row reads as the (disabled) default.
    pub fn load(&self) -> Result<BridgeConfig> {
        Ok(self
            .load_versioned()?
            .map(|stored| stored.config)
            .unwrap_or_default())
    }

    /// Current config with its version, if a row exists.
    pub fn load_versioned(&self) -> Result<Option<StoredBridgeConfig>> {
        self.db.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT version, updated_at, data FROM bridge_config WHERE id = 1",
                    [],
                    |row| {
                        let data: String = row.get(2)?;
                        Ok(StoredBridgeConfig {
                            version: row.get(0)?,
                            updated_at: row.get(1)?,
                            config: serde_json::from_str(&data)
                                .map_err(|e| json_column_error(2, e))?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Write the config row, bumping its version.
    ///
    /// With `expected_version` set, the write only succeeds if the row is
    /// still at that version.
    pub fn save(
        &self,
        config: &BridgeConfig,
        expected_version: Option<i64>,
        now: i64,
    ) -> Result<StoredBridgeConfig> {
        let data = serde_json::to_string(config)?;

        let version = self.db.with_tx(|tx| {
            let current: Option<i64> = tx
                .query_row("SELECT version FROM bridge_config WHERE id = 1", [], |r| {
                    r.get(0)
                })
                .optional()?;
            let current = current.unwrap_or(0);

            if let Some(expected) = expected_version {
                if expected != current {
                    return Err(Error::VersionConflict { current });
                }
            }

            let next = current + 1;
            tx.execute(
                "INSERT INTO bridge_config (id, version, data, updated_at) VALUES (1, ?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET version = ?1, data = ?2, updated_at = ?3",
                params![next, data, now],
            )?;
            Ok(next)
        })?;

        tracing::info!(
            version = version,
            enabled = config.enabled,
            outbox_enabled = config.outbox_enabled,
            roles = config.role_map.len(),
            "[Bridge] Config saved"
        );

        Ok(StoredBridgeConfig {
            version,
            updated_at: now,
            config: config.clone(),
        })
    }

    /// Insert `config` only if no row exists yet. Returns true if seeded.
    pub fn seed_if_missing(&self, config: &BridgeConfig, now: i64) -> Result<bool> {
        let data = serde_json::to_string(config)?;
        let inserted = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "INSERT OR IGNORE INTO bridge_config (id, version, data, updated_at) VALUES (1, 1, ?1, ?2)",
                params![data, now],
            )?)
        })?;
        Ok(inserted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::enabled_config;

    #[test]
    fn test_missing_row_reads_as_disabled_default() {
        let store = ConfigStore::new(Database::open(None).unwrap());
        let config = store.load().unwrap();
        assert!(!config.enabled);
        assert!(!config.secrets_configured());
        assert!(config.outbox_enabled);
    }

    #[test]
    fn test_save_bumps_version() {
        let store = ConfigStore::new(Database::open(None).unwrap());
        let first = store.save(&enabled_config(), None, 1_000).unwrap();
        assert_eq!(first.version, 1);

        let second = store.save(&enabled_config(), Some(1), 2_000).unwrap();
        assert_eq!(second.version, 2);

        let loaded = store.load_versioned().unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.updated_at, 2_000);
        assert_eq!(loaded.config, enabled_config());
    }

    #[test]
    fn test_stale_expected_version_is_rejected() {
        let store = ConfigStore::new(Database::open(None).unwrap());
        store.save(&enabled_config(), None, 1_000).unwrap();
        store.save(&enabled_config(), None, 2_000).unwrap();

        let err = store.save(&enabled_config(), Some(1), 3_000).unwrap_err();
        assert!(matches!(err, Error::VersionConflict { current: 2 }));
    }

    #[test]
    fn test_seed_only_once() {
        let store = ConfigStore::new(Database::open(None).unwrap());
        assert!(store.seed_if_missing(&enabled_config(), 1).unwrap());
        assert!(!store.seed_if_missing(&BridgeConfig::default(), 2).unwrap());
        assert!(store.load().unwrap().enabled);
    }

    #[test]
    fn test_parse_role_map() {
        let map = parse_role_map(" Artist=111 , label_manager=222,broken, =333,empty=");
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("artist").map(String::as_str), Some("111"));
        assert_eq!(map.get("label_manager").map(String::as_str), Some("222"));
    }

    #[test]
    fn test_role_lookup_is_case_insensitive() {
        let mut config = enabled_config();
        config.role_map = parse_role_map("artist=111");
        assert_eq!(config.role_id_for("  ARTIST "), Some("111".to_string()));
        assert_eq!(config.role_id_for("admin"), None);
    }

    #[test]
    fn test_update_keeps_secrets_when_blank() {
        let update = BridgeConfigUpdate {
            enabled: Some(false),
            internal_token: Some("   ".into()),
            internal_signing_secret: None,
            role_map: Some(BTreeMap::from([("Artist".to_string(), "9".to_string())])),
            ..BridgeConfigUpdate::default()
        };
        let config = update.apply(enabled_config());
        assert!(!config.enabled);
        assert_eq!(config.internal_token, "bot-token");
        assert_eq!(config.internal_signing_secret, "signing-secret");
        assert_eq!(config.role_id_for("artist"), Some("9".to_string()));
    }

    #[test]
    fn test_view_redacts_secrets() {
        let stored = StoredBridgeConfig {
            version: 3,
            updated_at: 10,
            config: enabled_config(),
        };
        let view = BridgeConfigView::from(&stored);
        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("bot-token"));
        assert!(!json.contains("signing-secret"));
        assert!(view.internal_token_configured);
        assert_eq!(view.version, 3);
    }
}
