//! Portal-side linking endpoints, authenticated by the `portal_session`
//! cookie.

use axum::{
    extract::State,
    http::{header, HeaderMap},
    response::IntoResponse,
};
use serde_json::json;

use super::{blocking, ApiResponse};
use crate::bridge::outbox::EVENT_DISCORD_UNLINKED;
use crate::error::{Error, Result};
use crate::oauth::NewOAuthState;
use crate::portal::PortalUser;
use crate::state::AppState;

/// Name of the portal's session cookie.
pub const SESSION_COOKIE: &str = "portal_session";

/// Read the portal session token from the `Cookie` header(s).
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, token)| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

fn session_user(state: &AppState, headers: &HeaderMap, now: i64) -> Result<PortalUser> {
    let token = session_token(headers).ok_or(Error::Unauthorized)?;
    state
        .portal
        .session_user(&token, now)?
        .ok_or(Error::Unauthorized)
}

/// POST /portal/discord/link: start a user-initiated link.
pub async fn start_link(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let data = blocking(move || {
        let now = chrono::Utc::now().timestamp_millis();
        let user = session_user(&state, &headers, now)?;

        let config = state.configs.load()?;
        if !config.enabled || !config.oauth_configured() {
            return Err(Error::OAuthNotConfigured);
        }
        if state.links.lookup_by_user(&user.id)?.is_some() {
            return Err(Error::AccountAlreadyLinked);
        }

        let link_state = state.oauth_states.create(
            NewOAuthState {
                user_id: Some(user.id.clone()),
                ..NewOAuthState::default()
            },
            now,
        )?;
        tracing::info!(user_id = %user.id, "[Portal] Link flow started");

        Ok(json!({
            "url": state.config.link_start_url(&link_state.token),
            "expiresAt": link_state.expires_at,
        }))
    })
    .await?;
    Ok(ApiResponse::success(data))
}

/// DELETE /portal/discord/link: remove the user's link.
pub async fn unlink(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let unlinked = blocking(move || {
        let now = chrono::Utc::now().timestamp_millis();
        let user = session_user(&state, &headers, now)?;

        let removed = state.links.unlink(&user.id)?;
        if let Some(link) = &removed {
            let config = state.configs.load()?;
            state.outbox.enqueue_best_effort(
                &config,
                EVENT_DISCORD_UNLINKED,
                &json!({
                    "userId": link.user_id,
                    "discordUserId": link.discord_user_id,
                    "guildId": link.guild_id,
                }),
                Some(&link.user_id),
                now,
            );
        }
        Ok(removed.is_some())
    })
    .await?;
    Ok(ApiResponse::success(json!({ "unlinked": unlinked })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::api::router;
    use crate::test_support::{seed_session, seed_user, test_state};

    fn far_future() -> i64 {
        chrono::Utc::now().timestamp_millis() + 3_600_000
    }

    #[test]
    fn test_session_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(session_token(&headers), None);

        headers.insert(header::COOKIE, "theme=dark; portal_session=abc123".parse().unwrap());
        assert_eq!(session_token(&headers).as_deref(), Some("abc123"));

        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, "portal_session=".parse().unwrap());
        assert_eq!(session_token(&headers), None);
    }

    #[tokio::test]
    async fn test_start_link_requires_session() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::post("/portal/discord/link").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_start_link_returns_url() {
        let state = test_state();
        seed_user(&state.db, "u1", "artist", true, None);
        seed_session(&state.db, "sess-1", "u1", far_future());

        let response = router(state.clone())
            .oneshot(
                Request::post("/portal/discord/link")
                    .header(header::COOKIE, "portal_session=sess-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        let url = json["data"]["url"].as_str().unwrap();
        let token = url.split("state=").nth(1).unwrap();

        let now = chrono::Utc::now().timestamp_millis();
        let link_state = state.oauth_states.get_valid(token, now).unwrap().unwrap();
        assert_eq!(link_state.user_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_unlink_emits_event_once() {
        let state = test_state();
        seed_user(&state.db, "u1", "artist", true, Some("d-1"));
        seed_session(&state.db, "sess-1", "u1", far_future());
        let app = router(state.clone());

        for expected in [true, false] {
            let response = app
                .clone()
                .oneshot(
                    Request::delete("/portal/discord/link")
                        .header(header::COOKIE, "portal_session=sess-1")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let json: Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(json["data"]["unlinked"], expected);
        }

        assert!(state.links.lookup_by_user("u1").unwrap().is_none());
        assert_eq!(state.outbox.stats().unwrap().pending, 1);
    }
}
