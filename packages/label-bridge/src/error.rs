//! # Error Handling
//!
//! Error types for the label bridge.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error                                                                  │
//! │  │                                                                      │
//! │  ├── Configuration (503)    - bridge disabled / secrets unset           │
//! │  ├── Authentication (401)   - token, timestamp, signature               │
//! │  │   └── ReplayDetected     - 409                                       │
//! │  ├── Request (400/429)      - body problems, rate limiting              │
//! │  ├── Linking (404/409)      - not linked, already linked                │
//! │  ├── Delivery (502)         - Discord token exchange / identity fetch   │
//! │  └── Internal (500)         - database, serialization                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every variant maps to an HTTP status and a stable machine-readable code
//! (`INVALID_SIGNATURE`, `NOT_LINKED`, ...) that the bot switches on.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::api::ApiResponse;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the bridge
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors (100-199)
    // ========================================================================
    /// Bridge is switched off in the config row
    #[error("Discord bridge is disabled")]
    BridgeDisabled,

    /// Bridge is enabled but the token or signing secret is empty
    #[error("Discord bridge secrets are not configured")]
    BridgeMisconfigured,

    /// OAuth client id/secret are missing
    #[error("Discord OAuth is not configured")]
    OAuthNotConfigured,

    // ========================================================================
    // Authentication Errors (200-299)
    // ========================================================================
    #[error("Invalid bot token")]
    InvalidToken,

    #[error("Missing or invalid timestamp")]
    InvalidTimestamp,

    #[error("Timestamp outside the accepted window ({drift_ms}ms drift)")]
    StaleTimestamp { drift_ms: i64 },

    #[error("Invalid request signature")]
    InvalidSignature,

    #[error("Request signature has already been used")]
    ReplayDetected,

    /// Admin or portal session credentials missing/invalid
    #[error("Unauthorized")]
    Unauthorized,

    // ========================================================================
    // Request Errors (300-399)
    // ========================================================================
    #[error("Too many requests, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request body is not valid JSON: {0}")]
    InvalidJsonBody(String),

    #[error("Request body is required")]
    MissingBody,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // ========================================================================
    // Linking Errors (400-499)
    // ========================================================================
    /// The Discord identity has not connected a portal account
    #[error("Discord account is not linked to a portal account")]
    NotLinked,

    /// One side of the link is already bound to a different counterpart
    #[error("Account is already linked to a different user")]
    AccountAlreadyLinked,

    #[error("{0} not found")]
    NotFound(String),

    #[error("Config version conflict (current version {current})")]
    VersionConflict { current: i64 },

    // ========================================================================
    // Delivery Errors (500-599)
    // ========================================================================
    #[error("Discord token exchange failed: {0}")]
    TokenExchangeFailed(String),

    #[error("Failed to fetch Discord identity: {0}")]
    IdentityFetchFailed(String),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Numeric error code, grouped by category.
    pub fn code(&self) -> i32 {
        match self {
            // Configuration (100-199)
            Error::BridgeDisabled => 100,
            Error::BridgeMisconfigured => 101,
            Error::OAuthNotConfigured => 102,
            // Authentication (200-299)
            Error::InvalidToken => 200,
            Error::InvalidTimestamp => 201,
            Error::StaleTimestamp { .. } => 202,
            Error::InvalidSignature => 203,
            Error::ReplayDetected => 204,
            Error::Unauthorized => 205,
            // Request (300-399)
            Error::RateLimited { .. } => 300,
            Error::InvalidJsonBody(_) => 301,
            Error::MissingBody => 302,
            Error::InvalidRequest(_) => 303,
            // Linking (400-499)
            Error::NotLinked => 400,
            Error::AccountAlreadyLinked => 401,
            Error::NotFound(_) => 402,
            Error::VersionConflict { .. } => 403,
            // Delivery (500-599)
            Error::TokenExchangeFailed(_) => 500,
            Error::IdentityFetchFailed(_) => 501,
            // Internal (900-999)
            Error::Database(_) => 900,
            Error::Serialization(_) => 901,
            Error::Internal(_) => 902,
        }
    }

    /// Stable string code returned to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::BridgeDisabled => "BRIDGE_DISABLED",
            Error::BridgeMisconfigured => "BRIDGE_MISCONFIGURED",
            Error::OAuthNotConfigured => "OAUTH_NOT_CONFIGURED",
            Error::InvalidToken => "INVALID_TOKEN",
            Error::InvalidTimestamp => "INVALID_TIMESTAMP",
            Error::StaleTimestamp { .. } => "STALE_TIMESTAMP",
            Error::InvalidSignature => "INVALID_SIGNATURE",
            Error::ReplayDetected => "REPLAY_DETECTED",
            Error::Unauthorized => "UNAUTHORIZED",
            Error::RateLimited { .. } => "RATE_LIMITED",
            Error::InvalidJsonBody(_) => "INVALID_JSON_BODY",
            Error::MissingBody => "MISSING_BODY",
            Error::InvalidRequest(_) => "INVALID_REQUEST",
            Error::NotLinked => "NOT_LINKED",
            Error::AccountAlreadyLinked => "ACCOUNT_ALREADY_LINKED",
            Error::NotFound(_) => "NOT_FOUND",
            Error::VersionConflict { .. } => "CONFIG_VERSION_CONFLICT",
            Error::TokenExchangeFailed(_) => "TOKEN_EXCHANGE_FAILED",
            Error::IdentityFetchFailed(_) => "IDENTITY_FETCH_FAILED",
            Error::Database(_) | Error::Serialization(_) | Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::BridgeDisabled | Error::BridgeMisconfigured | Error::OAuthNotConfigured => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::InvalidToken
            | Error::InvalidTimestamp
            | Error::StaleTimestamp { .. }
            | Error::InvalidSignature
            | Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::ReplayDetected | Error::AccountAlreadyLinked | Error::VersionConflict { .. } => {
                StatusCode::CONFLICT
            }
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::InvalidJsonBody(_) | Error::MissingBody | Error::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::NotLinked | Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::TokenExchangeFailed(_) | Error::IdentityFetchFailed(_) => StatusCode::BAD_GATEWAY,
            Error::Database(_) | Error::Serialization(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Internal errors are logged server-side and masked in responses.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Error::Database(_) | Error::Serialization(_) | Error::Internal(_)
        )
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if self.is_internal() {
            tracing::error!(error = %self, "Internal error while handling request");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let mut response = (
            status,
            Json(ApiResponse::<()>::failure(self.kind(), message)),
        )
            .into_response();

        if let Error::RateLimited { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::BridgeDisabled.code(), 100);
        assert_eq!(Error::InvalidToken.code(), 200);
        assert_eq!(Error::RateLimited { retry_after_secs: 1 }.code(), 300);
        assert_eq!(Error::NotLinked.code(), 400);
        assert_eq!(Error::TokenExchangeFailed("x".into()).code(), 500);
        assert_eq!(Error::Database("x".into()).code(), 900);
    }

    #[test]
    fn test_auth_statuses() {
        assert_eq!(Error::InvalidToken.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            Error::StaleTimestamp { drift_ms: 400_000 }.status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(Error::ReplayDetected.status(), StatusCode::CONFLICT);
        assert_eq!(Error::BridgeMisconfigured.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            Error::RateLimited { retry_after_secs: 3 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(Error::MissingBody.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_not_linked_is_distinct_from_internal() {
        assert_eq!(Error::NotLinked.status(), StatusCode::NOT_FOUND);
        assert_eq!(Error::NotLinked.kind(), "NOT_LINKED");
        assert!(!Error::NotLinked.is_internal());
        assert!(Error::Database("locked".into()).is_internal());
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let response = Error::RateLimited { retry_after_secs: 12 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "12");
    }
}
