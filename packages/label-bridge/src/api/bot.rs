//! Bot-facing endpoints under `/api/bridge/*`.
//!
//! Every handler goes through [`respond`], which authenticates the request,
//! runs the handler body, writes the audit record with the final status and
//! echoes `x-request-id`.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::ApiResponse;
use crate::bridge::auth::{BridgeHeaders, InboundRequest, HEADER_REQUEST_ID};
use crate::bridge::delivery::AckResult;
use crate::bridge::{BodyRequirement, BridgeContext, LinkLookup};
use crate::error::{Error, Result};
use crate::oauth::NewOAuthState;
use crate::portal::{NewDemo, NewTicket, PortalUser, SOURCE_DISCORD};
use crate::state::AppState;

// ── Request Types ────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PullRequest {
    batch_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct AckRequest {
    results: Vec<AckResult>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LinkUrlRequest {
    discord_user_id: Option<String>,
    discord_username: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LinkUrlResponse {
    url: String,
    expires_at: i64,
}

// ── Plumbing ─────────────────────────────────────────────────────────────────

/// Authenticate, run `handler`, audit, and build the response.
///
/// The whole exchange touches SQLite, so it runs on the blocking pool.
async fn respond<T, F>(
    state: AppState,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    requirement: BodyRequirement,
    handler: F,
) -> Response
where
    T: Serialize + 'static,
    F: FnOnce(&AppState, &BridgeContext, i64) -> Result<(StatusCode, T)> + Send + 'static,
{
    let outcome = tokio::task::spawn_blocking(move || {
        respond_blocking(&state, &method, &uri, &headers, &body, requirement, handler)
    })
    .await;

    match outcome {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, "[Bridge] Request task failed");
            Error::Internal(format!("Request task failed: {}", e)).into_response()
        }
    }
}

fn respond_blocking<T, F>(
    state: &AppState,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
    requirement: BodyRequirement,
    handler: F,
) -> Response
where
    T: Serialize,
    F: FnOnce(&AppState, &BridgeContext, i64) -> Result<(StatusCode, T)>,
{
    let now = chrono::Utc::now().timestamp_millis();
    let mut bridge_headers = BridgeHeaders::from_headers(headers);
    let request_id = bridge_headers
        .request_id
        .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
        .clone();

    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let request = InboundRequest {
        method: method.as_str(),
        path,
        endpoint: uri.path(),
        headers: bridge_headers,
        body,
    };

    let mut response = match state.authenticator.authenticate(request, requirement, now) {
        Ok(ctx) => {
            let response = match handler(state, &ctx, now) {
                Ok((status, data)) => (status, ApiResponse::success(data)).into_response(),
                Err(e) => e.into_response(),
            };
            ctx.finish(response.status());
            response
        }
        Err(e) => e.into_response(),
    };

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(HEADER_REQUEST_ID, value);
    }
    response
}

/// Portal user linked to the calling Discord identity.
fn caller(state: &AppState, ctx: &BridgeContext) -> Result<PortalUser> {
    let discord_user_id = ctx.require_discord_user()?;
    match state.links.lookup_by_external_id(discord_user_id)? {
        LinkLookup::Linked { user, .. } => Ok(user),
        LinkLookup::NotLinked => Err(Error::NotLinked),
    }
}

// ── Delivery ─────────────────────────────────────────────────────────────────

/// POST /api/bridge/outbox/pull: claim due events.
pub async fn outbox_pull(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    respond(state, method, uri, headers, body, BodyRequirement::Optional, |state, ctx, now| {
        let req: PullRequest = ctx.body_as()?;
        let events = state.outbox.claim(req.batch_size, now)?;
        Ok((StatusCode::OK, json!({ "events": events })))
    })
    .await
}

/// POST /api/bridge/outbox/ack: report delivery results.
pub async fn outbox_ack(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    respond(state, method, uri, headers, body, BodyRequirement::Required, |state, ctx, now| {
        let req: AckRequest = ctx.body_as()?;
        Ok((StatusCode::OK, state.outbox.ack(&req.results, now)?))
    })
    .await
}

/// POST /api/bridge/role-sync/pull: claim due role-sync jobs.
pub async fn role_sync_pull(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    respond(state, method, uri, headers, body, BodyRequirement::Optional, |state, ctx, now| {
        let req: PullRequest = ctx.body_as()?;
        let jobs = state.role_sync.claim(req.batch_size, now)?;
        Ok((StatusCode::OK, json!({ "jobs": jobs })))
    })
    .await
}

/// POST /api/bridge/role-sync/ack: report role-sync results.
pub async fn role_sync_ack(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    respond(state, method, uri, headers, body, BodyRequirement::Required, |state, ctx, now| {
        let req: AckRequest = ctx.body_as()?;
        Ok((StatusCode::OK, state.role_sync.ack(&req.results, now)?))
    })
    .await
}

// ── Linking ──────────────────────────────────────────────────────────────────

/// POST /api/bridge/link-url: start linking for a Discord user.
pub async fn link_url(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    respond(state, method, uri, headers, body, BodyRequirement::Optional, |state, ctx, now| {
        if !ctx.config.oauth_configured() {
            return Err(Error::OAuthNotConfigured);
        }
        let req: LinkUrlRequest = ctx.body_as()?;
        let discord_user_id = req
            .discord_user_id
            .filter(|id| !id.trim().is_empty())
            .or_else(|| ctx.discord_user_id.clone())
            .ok_or_else(|| Error::InvalidRequest("discordUserId is required".into()))?;

        if let LinkLookup::Linked { .. } = state.links.lookup_by_external_id(&discord_user_id)? {
            return Err(Error::AccountAlreadyLinked);
        }

        let link_state = state.oauth_states.create(
            NewOAuthState {
                user_id: None,
                discord_user_id: Some(discord_user_id),
                discord_username: req.discord_username,
            },
            now,
        )?;
        Ok((
            StatusCode::OK,
            LinkUrlResponse {
                url: state.config.link_start_url(&link_state.token),
                expires_at: link_state.expires_at,
            },
        ))
    })
    .await
}

/// GET /api/bridge/linked-user: portal account behind the Discord user.
pub async fn linked_user(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    respond(state, method, uri, headers, body, BodyRequirement::Optional, |state, ctx, _| {
        let discord_user_id = ctx.require_discord_user()?;
        match state.links.lookup_by_external_id(discord_user_id)? {
            LinkLookup::Linked { link, user } => Ok((
                StatusCode::OK,
                json!({
                    "user": {
                        "id": user.id,
                        "displayName": user.display_name,
                        "role": user.role,
                        "approved": user.approved,
                    },
                    "link": link,
                }),
            )),
            LinkLookup::NotLinked => Err(Error::NotLinked),
        }
    })
    .await
}

// ── Portal Data ──────────────────────────────────────────────────────────────

/// GET /api/bridge/demos: the caller's demos.
pub async fn list_demos(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    respond(state, method, uri, headers, body, BodyRequirement::Optional, |state, ctx, _| {
        let user = caller(state, ctx)?;
        let demos = state.portal.demos_for_user(&user.id, None)?;
        Ok((StatusCode::OK, json!({ "demos": demos })))
    })
    .await
}

/// POST /api/bridge/demos: submit a demo from Discord.
pub async fn submit_demo(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    respond(state, method, uri, headers, body, BodyRequirement::Required, |state, ctx, now| {
        let user = caller(state, ctx)?;
        let demo: NewDemo = ctx.body_as()?;
        let demo = state
            .portal
            .create_demo(&ctx.config, &user.id, demo, SOURCE_DISCORD, now)?;
        Ok((StatusCode::CREATED, demo))
    })
    .await
}

/// GET /api/bridge/contracts: the caller's contracts.
pub async fn list_contracts(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    respond(state, method, uri, headers, body, BodyRequirement::Optional, |state, ctx, _| {
        let user = caller(state, ctx)?;
        let contracts = state.portal.contracts_for_user(&user.id)?;
        Ok((StatusCode::OK, json!({ "contracts": contracts })))
    })
    .await
}

/// GET /api/bridge/earnings: the caller's earnings with totals.
pub async fn earnings(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    respond(state, method, uri, headers, body, BodyRequirement::Optional, |state, ctx, _| {
        let user = caller(state, ctx)?;
        Ok((StatusCode::OK, state.portal.earnings_for_user(&user.id)?))
    })
    .await
}

/// POST /api/bridge/tickets: open a support ticket from Discord.
pub async fn open_ticket(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    respond(state, method, uri, headers, body, BodyRequirement::Required, |state, ctx, now| {
        let user = caller(state, ctx)?;
        let ticket: NewTicket = ctx.body_as()?;
        let ticket = state
            .portal
            .create_ticket(&ctx.config, &user.id, ticket, SOURCE_DISCORD, now)?;
        Ok((StatusCode::CREATED, ticket))
    })
    .await
}

/// GET /api/bridge/runtime-config: settings the bot applies at runtime.
pub async fn runtime_config(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    respond(state, method, uri, headers, body, BodyRequirement::Optional, |_, ctx, _| {
        let config = &ctx.config;
        let data: Value = json!({
            "botRuntime": config.bot_runtime,
            "roleMap": config.role_map,
            "defaultGuildId": config.default_guild_id,
            "outboxEnabled": config.outbox_enabled,
        });
        Ok((StatusCode::OK, data))
    })
    .await
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::api::router;
    use crate::bridge::delivery::DeliveryStatus;
    use crate::bridge::outbox::EVENT_DEMO_SUBMITTED;
    use crate::state::AppState;
    use crate::test_support::{seed_user, signed_request, signed_request_at, test_state};

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value, Option<String>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json, request_id)
    }

    fn setup() -> (AppState, Router) {
        let state = test_state();
        seed_user(&state.db, "u1", "artist", true, Some("d-1"));
        let app = router(state.clone());
        (state, app)
    }

    #[tokio::test]
    async fn test_unsigned_request_is_rejected() {
        let (_, app) = setup();
        let request = Request::post("/api/bridge/outbox/pull")
            .header("x-bot-token", "bot-token")
            .body(Body::empty())
            .unwrap();
        let (status, json, request_id) = call(&app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["ok"], false);
        assert_eq!(json["code"], "INVALID_TIMESTAMP");
        assert!(request_id.is_some());
    }

    #[tokio::test]
    async fn test_outbox_end_to_end() {
        let (state, app) = setup();
        let config = state.configs.load().unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        for i in 0..3 {
            state
                .outbox
                .enqueue(&config, EVENT_DEMO_SUBMITTED, &json!({ "n": i }), None, now - 1_000 + i)
                .unwrap();
        }

        let pull = signed_request("POST", "/api/bridge/outbox/pull", r#"{"batchSize":5}"#, None);
        let (status, json, _) = call(&app, pull).await;
        assert_eq!(status, StatusCode::OK);
        let events = json["data"]["events"].as_array().unwrap().clone();
        assert_eq!(events.len(), 3);

        let results: Vec<Value> = events
            .iter()
            .map(|e| json!({ "id": e["id"], "success": true }))
            .collect();
        let body = json!({ "results": results }).to_string();
        let ack = signed_request("POST", "/api/bridge/outbox/ack", &body, None);
        let (status, json, _) = call(&app, ack).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["sent"], 3);

        let pull = signed_request("POST", "/api/bridge/outbox/pull", r#"{"batchSize":5}"#, None);
        let (_, json, _) = call(&app, pull).await;
        assert_eq!(json["data"]["events"].as_array().unwrap().len(), 0);
        assert_eq!(state.audit.count().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_byte_identical_replay_is_rejected() {
        let (_, app) = setup();
        let signed_at = chrono::Utc::now().timestamp_millis();
        let request = || {
            signed_request_at("POST", "/api/bridge/outbox/pull", "{}", None, signed_at)
        };

        let (status, _, _) = call(&app, request()).await;
        assert_eq!(status, StatusCode::OK);

        let (status, json, _) = call(&app, request()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["code"], "REPLAY_DETECTED");
    }

    #[tokio::test]
    async fn test_request_id_is_echoed() {
        let (_, app) = setup();
        let mut request = signed_request("GET", "/api/bridge/runtime-config", "", None);
        request
            .headers_mut()
            .insert("x-request-id", "req-123".parse().unwrap());
        let (status, json, request_id) = call(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(request_id.as_deref(), Some("req-123"));
        assert_eq!(json["data"]["outboxEnabled"], true);
    }

    #[tokio::test]
    async fn test_not_linked_is_404() {
        let (_, app) = setup();
        let request = signed_request("GET", "/api/bridge/linked-user", "", Some("stranger"));
        let (status, json, _) = call(&app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], "NOT_LINKED");
    }

    #[tokio::test]
    async fn test_linked_user() {
        let (_, app) = setup();
        let request = signed_request("GET", "/api/bridge/linked-user", "", Some("d-1"));
        let (status, json, _) = call(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["user"]["id"], "u1");
        assert_eq!(json["data"]["link"]["discordUserId"], "d-1");
    }

    #[tokio::test]
    async fn test_submit_demo_emits_event_and_audits() {
        let (state, app) = setup();
        let body = r#"{"title":"Night Drive","trackUrl":"https://example.com/nd.mp3"}"#;
        let request = signed_request("POST", "/api/bridge/demos", body, Some("d-1"));
        let (status, json, _) = call(&app, request).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["data"]["source"], "discord");

        let now = chrono::Utc::now().timestamp_millis();
        let events = state.outbox.claim(None, now + 1_000).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EVENT_DEMO_SUBMITTED);
        assert_eq!(events[0].status, DeliveryStatus::Processing);

        let records = state.audit.recent(1).unwrap();
        assert!(records[0].success);
        assert_eq!(records[0].status_code, 201);
    }

    #[tokio::test]
    async fn test_handler_error_is_audited_as_failure() {
        let (state, app) = setup();
        let body = r#"{"title":"","trackUrl":"https://example.com/nd.mp3"}"#;
        let request = signed_request("POST", "/api/bridge/demos", body, Some("d-1"));
        let (status, json, _) = call(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "INVALID_REQUEST");

        let records = state.audit.recent(10).unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert_eq!(records[0].status_code, 400);
    }

    #[tokio::test]
    async fn test_ack_requires_body() {
        let (_, app) = setup();
        let request = signed_request("POST", "/api/bridge/outbox/ack", "", None);
        let (status, json, _) = call(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "MISSING_BODY");
    }

    #[tokio::test]
    async fn test_link_url_for_unlinked_user() {
        let (state, app) = setup();
        let body = r#"{"discordUserId":"d-9","discordUsername":"nova"}"#;
        let request = signed_request("POST", "/api/bridge/link-url", body, Some("d-9"));
        let (status, json, _) = call(&app, request).await;
        assert_eq!(status, StatusCode::OK);

        let url = json["data"]["url"].as_str().unwrap();
        assert!(url.contains("/auth/discord/start?state="));
        let now = chrono::Utc::now().timestamp_millis();
        assert_eq!(state.oauth_states.pending_count(now).unwrap(), 1);

        // Already linked identities get a conflict instead
        let body = r#"{"discordUserId":"d-1"}"#;
        let request = signed_request("POST", "/api/bridge/link-url", body, Some("d-1"));
        let (status, json, _) = call(&app, request).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["code"], "ACCOUNT_ALREADY_LINKED");
    }

    #[tokio::test]
    async fn test_disabled_bridge_is_503() {
        let (state, app) = setup();
        let mut config = state.configs.load().unwrap();
        config.enabled = false;
        state.configs.save(&config, None, 0).unwrap();

        let request = signed_request("POST", "/api/bridge/outbox/pull", "{}", None);
        let (status, json, _) = call(&app, request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["code"], "BRIDGE_DISABLED");
        assert_eq!(state.audit.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_store_contention_does_not_stall_runtime() {
        use std::time::{Duration, Instant};

        let (state, app) = setup();
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let db = state.db.clone();
        let holder = std::thread::spawn(move || {
            db.with_conn(|_| {
                locked_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(600));
                Ok(())
            })
            .unwrap();
        });
        locked_rx.recv().unwrap();

        let pull = signed_request("POST", "/api/bridge/outbox/pull", "", None);
        let waiting = tokio::spawn(app.clone().oneshot(pull));
        tokio::task::yield_now().await;

        let started = Instant::now();
        let health = Request::get("/health").body(Body::empty()).unwrap();
        let (status, _, _) = call(&app, health).await;
        assert_eq!(status, StatusCode::OK);
        assert!(started.elapsed() < Duration::from_millis(300));

        let response = waiting.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        holder.join().unwrap();
    }
}
