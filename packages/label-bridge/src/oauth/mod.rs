//! Discord account linking over OAuth2.
//!
//! The browser enters at `/auth/discord/start?state=…`, bounces through
//! Discord, and comes back to `/auth/discord/callback`. Every outcome ends
//! with a redirect to the portal settings page carrying a [`LinkStatus`].

pub mod discord;
pub mod state;

use axum::response::Redirect;
use serde::Deserialize;

use crate::config::ServerConfig;

pub use state::{NewOAuthState, OAuthState, OAuthStateStore};

/// Outcome reported to the portal settings page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Linked,
    InvalidState,
    AlreadyLinked,
    TokenExchangeFailed,
    IdentityFailed,
    /// A bot-initiated state named a different Discord account than the one
    /// that authorized.
    IdentityMismatch,
    MissingUser,
    NotConfigured,
    Denied,
    Error,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Linked => "linked",
            LinkStatus::InvalidState => "invalid-state",
            LinkStatus::AlreadyLinked => "already-linked",
            LinkStatus::TokenExchangeFailed => "token-exchange-failed",
            LinkStatus::IdentityFailed => "identity-failed",
            LinkStatus::IdentityMismatch => "identity-mismatch",
            LinkStatus::MissingUser => "missing-user",
            LinkStatus::NotConfigured => "not-configured",
            LinkStatus::Denied => "denied",
            LinkStatus::Error => "error",
        }
    }
}

/// Redirect to the portal settings page with `status`.
pub fn finish_redirect(config: &ServerConfig, status: LinkStatus) -> Redirect {
    Redirect::to(&config.portal_result_url(status.as_str()))
}

/// Query parameters for the start endpoint.
#[derive(Debug, Deserialize)]
pub struct StartQuery {
    pub state: Option<String>,
}

/// Query parameters for the callback. Discord sends `error` instead of
/// `code` when the user declines.
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(LinkStatus::Linked.as_str(), "linked");
        assert_eq!(LinkStatus::InvalidState.as_str(), "invalid-state");
        assert_eq!(LinkStatus::AlreadyLinked.as_str(), "already-linked");
        assert_eq!(LinkStatus::IdentityMismatch.as_str(), "identity-mismatch");
    }

    #[test]
    fn test_finish_redirect_target() {
        let config = ServerConfig {
            portal_base_url: "https://portal.example.com".into(),
            ..ServerConfig::default()
        };
        let response = axum::response::IntoResponse::into_response(finish_redirect(
            &config,
            LinkStatus::AlreadyLinked,
        ));
        assert_eq!(
            response.headers()[axum::http::header::LOCATION],
            "https://portal.example.com/settings/discord?status=already-linked"
        );
    }
}
