//! HTTP surface.
//!
//! - `/api/bridge/*`: signed bot endpoints ([`bot`])
//! - `/auth/discord/*`: browser OAuth flow ([`crate::oauth::discord`])
//! - `/portal/discord/link`: portal session endpoints ([`portal`])
//! - `/admin/bridge/*`: admin bearer-token endpoints ([`admin`])
//! - `/health`, `/stats`

pub mod admin;
pub mod bot;
pub mod portal;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;

use crate::error::{Error, Result};
use crate::oauth;
use crate::state::AppState;

// ── Response Envelope ────────────────────────────────────────────────────────

/// Envelope for every JSON response.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable error code, e.g. `NOT_LINKED`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Json<Self> {
        Json(Self {
            ok: true,
            data: Some(data),
            error: None,
            code: None,
        })
    }

    pub fn failure(code: &str, message: String) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message),
            code: Some(code.to_string()),
        }
    }
}

/// Run store work on the blocking pool; every store call takes the SQLite
/// mutex and may wait on disk.
pub async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("Blocking task failed: {}", e)))?
}

// ── Router ───────────────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    Router::new()
        // Bot
        .route("/api/bridge/outbox/pull", post(bot::outbox_pull))
        .route("/api/bridge/outbox/ack", post(bot::outbox_ack))
        .route("/api/bridge/role-sync/pull", post(bot::role_sync_pull))
        .route("/api/bridge/role-sync/ack", post(bot::role_sync_ack))
        .route("/api/bridge/link-url", post(bot::link_url))
        .route("/api/bridge/linked-user", get(bot::linked_user))
        .route("/api/bridge/demos", get(bot::list_demos).post(bot::submit_demo))
        .route("/api/bridge/contracts", get(bot::list_contracts))
        .route("/api/bridge/earnings", get(bot::earnings))
        .route("/api/bridge/tickets", post(bot::open_ticket))
        .route("/api/bridge/runtime-config", get(bot::runtime_config))
        // OAuth
        .route("/auth/discord/start", get(oauth::discord::start))
        .route("/auth/discord/callback", get(oauth::discord::callback))
        // Portal
        .route(
            "/portal/discord/link",
            post(portal::start_link).delete(portal::unlink),
        )
        // Admin
        .route(
            "/admin/bridge/config",
            get(admin::get_config).put(admin::update_config),
        )
        .route("/admin/bridge/audit", get(admin::audit_log))
        .route(
            "/admin/bridge/releases/:id/role-sync",
            post(admin::sync_release),
        )
        // Ops
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(state)
}

/// Health check endpoint.
async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "label-bridge",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Queue depths and link counts.
async fn stats(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let data = blocking(move || {
        let now = chrono::Utc::now().timestamp_millis();
        let config = state.configs.load()?;
        Ok(json!({
            "bridge_enabled": config.enabled,
            "outbox": state.outbox.stats()?,
            "role_sync": state.role_sync.stats()?,
            "linked_accounts": state.links.count()?,
            "pending_oauth_states": state.oauth_states.pending_count(now)?,
            "rate_limit_keys": state.limiter.tracked_keys(),
            "uptime_secs": state.started_at.elapsed().as_secs(),
        }))
    })
    .await?;
    Ok(Json(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::test_support::test_state;

    #[test]
    fn test_envelope_shapes() {
        let ok = serde_json::to_value(ApiResponse::success(json!({"n": 1})).0).unwrap();
        assert_eq!(ok, json!({"ok": true, "data": {"n": 1}}));

        let err = serde_json::to_value(ApiResponse::<()>::failure(
            "NOT_LINKED",
            "not linked".into(),
        ))
        .unwrap();
        assert_eq!(
            err,
            json!({"ok": false, "error": "not linked", "code": "NOT_LINKED"})
        );
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["service"], "label-bridge");
    }

    #[tokio::test]
    async fn test_stats() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::get("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["bridge_enabled"], true);
        assert_eq!(json["outbox"]["pending"], 0);
        assert_eq!(json["linked_accounts"], 0);
    }

    #[tokio::test]
    async fn test_blocking_runs_on_another_thread() {
        let caller = std::thread::current().id();
        let worker = blocking(|| Ok(std::thread::current().id())).await.unwrap();
        assert_ne!(caller, worker);

        let err = blocking(|| -> Result<()> { Err(Error::NotLinked) }).await;
        assert!(matches!(err, Err(Error::NotLinked)));
    }
}
