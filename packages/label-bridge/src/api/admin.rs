//! Admin endpoints under `/admin/bridge/*`.
//!
//! Guarded by `Authorization: Bearer <ADMIN_TOKEN>`. With no admin token
//! configured every call is rejected.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap},
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

use super::{blocking, ApiResponse};
use crate::bridge::config::{BridgeConfigUpdate, BridgeConfigView, StoredBridgeConfig};
use crate::bridge::signing::token_matches;
use crate::error::{Error, Result};
use crate::state::AppState;

const DEFAULT_AUDIT_LIMIT: usize = 50;

#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<usize>,
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let expected = state.config.admin_token.as_deref().ok_or(Error::Unauthorized)?;
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(Error::Unauthorized)?;

    if token_matches(provided.trim(), expected) {
        Ok(())
    } else {
        tracing::warn!("[Bridge] Rejected admin request with bad token");
        Err(Error::Unauthorized)
    }
}

fn current_view(state: &AppState) -> Result<BridgeConfigView> {
    let stored = state.configs.load_versioned()?.unwrap_or(StoredBridgeConfig {
        version: 0,
        updated_at: 0,
        config: Default::default(),
    });
    Ok(BridgeConfigView::from(&stored))
}

/// GET /admin/bridge/config: redacted config.
pub async fn get_config(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let view = blocking(move || {
        require_admin(&state, &headers)?;
        current_view(&state)
    })
    .await?;
    Ok(ApiResponse::success(view))
}

/// PUT /admin/bridge/config: partial update with optional version check.
pub async fn update_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let view = blocking(move || {
        require_admin(&state, &headers)?;
        let update: BridgeConfigUpdate =
            serde_json::from_slice(&body).map_err(|e| Error::InvalidJsonBody(e.to_string()))?;

        let expected_version = update.expected_version;
        let updated = update.apply(state.configs.load()?);
        if updated.enabled && !updated.secrets_configured() {
            return Err(Error::InvalidRequest(
                "internalToken and internalSigningSecret must be set before enabling the bridge"
                    .into(),
            ));
        }

        let now = chrono::Utc::now().timestamp_millis();
        let stored = state.configs.save(&updated, expected_version, now)?;
        Ok(BridgeConfigView::from(&stored))
    })
    .await?;
    Ok(ApiResponse::success(view))
}

/// GET /admin/bridge/audit?limit=: most recent audit records.
pub async fn audit_log(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AuditQuery>,
) -> Result<impl IntoResponse> {
    let records = blocking(move || {
        require_admin(&state, &headers)?;
        state
            .audit
            .recent(query.limit.unwrap_or(DEFAULT_AUDIT_LIMIT))
    })
    .await?;
    Ok(ApiResponse::success(json!({ "records": records })))
}

/// POST /admin/bridge/releases/:id/role-sync: queue the artist role for a
/// release's credited artists.
pub async fn sync_release(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(release_id): Path<String>,
) -> Result<impl IntoResponse> {
    let jobs = blocking(move || {
        require_admin(&state, &headers)?;
        let now = chrono::Utc::now().timestamp_millis();
        let config = state.configs.load()?;
        state
            .role_sync
            .sync_release_artists(&config, &state.portal, &release_id, now)
    })
    .await?;
    Ok(ApiResponse::success(json!({ "jobs": jobs })))
}
