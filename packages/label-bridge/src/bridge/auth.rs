//! Inbound bot request authentication.
//!
//! ```text
//!  request ──► enabled? ──► rate limit ──► token ──► timestamp ──► signature
//!                                                                      │
//!        BridgeContext ◄── body parse ◄── claim signature ◄────────────┘
//!             │
//!             └── finish(status) ──► complete audit record
//! ```
//!
//! Rejections from the token check onwards write one failure record to the
//! audit log. Claiming the signature inserts the request's audit row before
//! any handler runs, which is what makes the replay check atomic. Finishing
//! the [`BridgeContext`] completes that row with the response status. A
//! context that is dropped without being finished records a 500.

use axum::http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::audit::{AuditLog, NewAuditRecord};
use super::config::{BridgeConfig, ConfigStore};
use super::rate_limit::RateLimiter;
use super::signing::{self, REPLAY_WINDOW_MS};
use crate::error::{Error, Result};

pub const HEADER_BOT_TOKEN: &str = "x-bot-token";
pub const HEADER_TIMESTAMP: &str = "x-timestamp";
pub const HEADER_SIGNATURE: &str = "x-signature";
pub const HEADER_REQUEST_ID: &str = "x-request-id";
pub const HEADER_DISCORD_USER_ID: &str = "x-discord-user-id";
pub const HEADER_DISCORD_GUILD_ID: &str = "x-discord-guild-id";

// ── Request Types ────────────────────────────────────────────────────────────

/// Bridge headers pulled off an inbound request.
#[derive(Debug, Clone, Default)]
pub struct BridgeHeaders {
    pub bot_token: Option<String>,
    pub timestamp: Option<String>,
    pub signature: Option<String>,
    pub request_id: Option<String>,
    pub discord_user_id: Option<String>,
    pub guild_id: Option<String>,
}

impl BridgeHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        Self {
            bot_token: get(HEADER_BOT_TOKEN),
            timestamp: get(HEADER_TIMESTAMP),
            signature: get(HEADER_SIGNATURE),
            request_id: get(HEADER_REQUEST_ID),
            discord_user_id: get(HEADER_DISCORD_USER_ID),
            guild_id: get(HEADER_DISCORD_GUILD_ID),
        }
    }
}

/// Everything the authenticator needs from a request.
#[derive(Debug, Clone)]
pub struct InboundRequest<'a> {
    pub method: &'a str,
    /// Path plus query string; this is what gets signed.
    pub path: &'a str,
    /// Path without query; used for rate limiting and audit.
    pub endpoint: &'a str,
    pub headers: BridgeHeaders,
    pub body: &'a [u8],
}

/// Whether an endpoint insists on a JSON body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyRequirement {
    Optional,
    Required,
}

// ── Authenticator ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Authenticator {
    configs: ConfigStore,
    audit: AuditLog,
    limiter: RateLimiter,
}

impl Authenticator {
    pub fn new(configs: ConfigStore, audit: AuditLog, limiter: RateLimiter) -> Self {
        Self {
            configs,
            audit,
            limiter,
        }
    }

    /// Authenticate a bot request at `now` (epoch ms).
    pub fn authenticate(
        &self,
        req: InboundRequest<'_>,
        requirement: BodyRequirement,
        now: i64,
    ) -> Result<BridgeContext> {
        let config = self.configs.load()?;
        if !config.enabled {
            tracing::warn!(endpoint = req.endpoint, "[Bridge] Rejected: bridge disabled");
            return Err(Error::BridgeDisabled);
        }
        if !config.secrets_configured() {
            tracing::warn!(endpoint = req.endpoint, "[Bridge] Rejected: secrets not configured");
            return Err(Error::BridgeMisconfigured);
        }

        let headers = req.headers.clone();
        let request_id = headers
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let key = RateLimiter::key(headers.discord_user_id.as_deref(), req.endpoint);
        if let Err(retry_after_secs) = self.limiter.check(&key, now) {
            tracing::warn!(
                request_id = %request_id,
                key = %key,
                retry_after_secs,
                "[Bridge] Rate limited"
            );
            return Err(Error::RateLimited { retry_after_secs });
        }

        let signature = headers
            .signature
            .as_deref()
            .and_then(signing::normalize_signature);
        let record = NewAuditRecord {
            request_id: request_id.clone(),
            endpoint: req.endpoint.to_string(),
            method: req.method.to_ascii_uppercase(),
            discord_user_id: headers.discord_user_id.clone(),
            guild_id: headers.guild_id.clone(),
            success: false,
            status_code: 0,
            signature: signature
                .clone()
                .or_else(|| headers.signature.clone())
                .unwrap_or_default(),
            created_at: now,
        };

        if let Err(err) = self.verify(&config, &req, signature.as_deref(), now) {
            return Err(self.reject(record, err));
        }

        let audit_id = match self.audit.claim(&record, now - REPLAY_WINDOW_MS)? {
            Some(id) => id,
            None => return Err(self.reject(record, Error::ReplayDetected)),
        };

        let body = match parse_body(req.body, requirement) {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(
                    request_id = %request_id,
                    endpoint = req.endpoint,
                    code = err.kind(),
                    "[Bridge] Request rejected"
                );
                complete_audit(&self.audit, audit_id, &request_id, err.status());
                return Err(err);
            }
        };

        Ok(BridgeContext {
            config,
            body,
            request_id,
            discord_user_id: headers.discord_user_id,
            guild_id: headers.guild_id,
            audit: self.audit.clone(),
            pending: Some(audit_id),
        })
    }

    /// Token, timestamp and signature checks, in that order.
    ///
    /// `signature` is the normalized `x-signature` header, `None` when the
    /// header was missing or malformed.
    fn verify(
        &self,
        config: &BridgeConfig,
        req: &InboundRequest<'_>,
        signature: Option<&str>,
        now: i64,
    ) -> Result<()> {
        let headers = &req.headers;

        let token = headers.bot_token.as_deref().unwrap_or_default();
        if !signing::token_matches(token, &config.internal_token) {
            return Err(Error::InvalidToken);
        }

        let timestamp_raw = headers.timestamp.as_deref();
        let timestamp_ms = signing::parse_timestamp(timestamp_raw)?;
        signing::check_timestamp(timestamp_ms, now)?;

        let signature = signature.ok_or(Error::InvalidSignature)?;
        let valid = signing::verify_signature(
            &config.internal_signing_secret,
            timestamp_raw.unwrap_or_default(),
            req.method,
            req.path,
            req.body,
            signature,
        )?;
        if !valid {
            return Err(Error::InvalidSignature);
        }
        Ok(())
    }

    /// Log a rejection, append its failure record and hand the error back.
    fn reject(&self, record: NewAuditRecord, err: Error) -> Error {
        tracing::warn!(
            request_id = %record.request_id,
            endpoint = %record.endpoint,
            code = err.kind(),
            "[Bridge] Request rejected"
        );
        let status_code = err.status().as_u16();
        if let Err(e) = self.audit.append(&NewAuditRecord {
            status_code,
            ..record
        }) {
            tracing::error!(error = %e, "[Bridge] Failed to write audit record");
        }
        err
    }
}

fn parse_body(body: &[u8], requirement: BodyRequirement) -> Result<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return match requirement {
            BodyRequirement::Required => Err(Error::MissingBody),
            BodyRequirement::Optional => Ok(Value::Null),
        };
    }
    serde_json::from_slice(body).map_err(|e| Error::InvalidJsonBody(e.to_string()))
}

fn complete_audit(audit: &AuditLog, id: i64, request_id: &str, status: StatusCode) {
    if let Err(e) = audit.complete(id, status.is_success(), status.as_u16()) {
        tracing::error!(
            request_id = %request_id,
            error = %e,
            "[Bridge] Failed to complete audit record"
        );
    }
}

// ── Context ──────────────────────────────────────────────────────────────────

/// An authenticated bot request.
pub struct BridgeContext {
    /// Config snapshot taken at authentication time.
    pub config: BridgeConfig,
    /// Parsed JSON body, `Null` when none was sent.
    pub body: Value,
    pub request_id: String,
    pub discord_user_id: Option<String>,
    pub guild_id: Option<String>,
    audit: AuditLog,
    /// Claimed audit row, completed exactly once.
    pending: Option<i64>,
}

impl BridgeContext {
    /// Deserialize the body. An absent body reads as `{}`.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T> {
        let value = match &self.body {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::from_value(value).map_err(|e| Error::InvalidRequest(e.to_string()))
    }

    /// The `x-discord-user-id` header, required by identity-scoped endpoints.
    pub fn require_discord_user(&self) -> Result<&str> {
        self.discord_user_id
            .as_deref()
            .ok_or_else(|| Error::InvalidRequest("x-discord-user-id header is required".into()))
    }

    /// Complete the audit record for this request and consume the context.
    pub fn finish(mut self, status: StatusCode) {
        if let Some(id) = self.pending.take() {
            complete_audit(&self.audit, id, &self.request_id, status);
        }
    }
}

impl Drop for BridgeContext {
    fn drop(&mut self) {
        if let Some(id) = self.pending.take() {
            tracing::error!(
                request_id = %self.request_id,
                "[Bridge] Request context dropped without finishing"
            );
            complete_audit(
                &self.audit,
                id,
                &self.request_id,
                StatusCode::INTERNAL_SERVER_ERROR,
            );
        }
    }
}
