//! Discord bridge core.
//!
//! Everything the bot talks to sits behind the [`auth::Authenticator`]:
//!
//! - Signed, replay-checked request authentication with an audit trail
//! - Account links between portal users and Discord identities
//! - An event outbox and a role-sync queue the bot polls
//! - A versioned config row edited by administrators
//!
//! ## Delivery
//!
//! Domain actions never call the bot. They write events or jobs here and
//! the bot pulls them in batches, then acks each item. Claims are exclusive
//! per attempt; delivery is at-least-once.

pub mod audit;
pub mod auth;
pub mod config;
pub mod delivery;
pub mod links;
pub mod outbox;
pub mod rate_limit;
pub mod role_sync;
pub mod signing;

pub use audit::AuditLog;
pub use auth::{Authenticator, BodyRequirement, BridgeContext};
pub use config::{BridgeConfig, ConfigStore};
pub use links::{LinkLookup, LinkStore};
pub use outbox::Outbox;
pub use rate_limit::RateLimiter;
pub use role_sync::RoleSyncQueue;
