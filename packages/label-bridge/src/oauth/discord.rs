//! Discord OAuth2 flow.
//!
//! `start` validates the link state and sends the browser to Discord;
//! `callback` consumes the state, exchanges the code, fetches the identity
//! and stores the link.

use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Redirect, Response},
};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::{finish_redirect, CallbackQuery, LinkStatus, OAuthState, StartQuery};
use crate::api::blocking;
use crate::api::portal::session_token;
use crate::bridge::config::BridgeConfig;
use crate::bridge::links::NewLink;
use crate::bridge::outbox::EVENT_DISCORD_LINKED;
use crate::bridge::role_sync::RoleSyncRequest;
use crate::config::{ServerConfig, DISCORD_SCOPES};
use crate::error::{Error, Result};
use crate::state::AppState;

/// Discord user response from API.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscordUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub discriminator: String,
    pub global_name: Option<String>,
    pub avatar: Option<String>,
}

impl DiscordUser {
    /// Get the display username (global_name or username#discriminator).
    pub fn display_name(&self) -> String {
        if let Some(ref name) = self.global_name {
            name.clone()
        } else if self.discriminator.is_empty() || self.discriminator == "0" {
            // New Discord usernames don't have discriminators
            self.username.clone()
        } else {
            format!("{}#{}", self.username, self.discriminator)
        }
    }

    /// CDN URL of the user's avatar, if they set one.
    pub fn avatar_url(&self) -> Option<String> {
        self.avatar.as_ref().map(|hash| {
            format!("https://cdn.discordapp.com/avatars/{}/{}.png", self.id, hash)
        })
    }
}

/// Discord token response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

// ── Client ───────────────────────────────────────────────────────────────────

/// HTTP client for the Discord OAuth and user endpoints.
#[derive(Clone)]
pub struct DiscordClient {
    http: Client,
    token_url: String,
    api_url: String,
}

impl DiscordClient {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            token_url: config.discord_token_url.clone(),
            api_url: config.discord_api_url.trim_end_matches('/').to_string(),
        })
    }

    /// Exchange an authorization code for an access token.
    pub async fn exchange_code(
        &self,
        config: &BridgeConfig,
        redirect_uri: &str,
        code: &str,
    ) -> Result<String> {
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", config.oauth_client_id.as_str()),
                ("client_secret", config.oauth_client_secret.as_str()),
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ])
            .send()
            .await
            .map_err(|e| Error::TokenExchangeFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!("Discord token exchange failed: {} - {}", status, body);
            return Err(Error::TokenExchangeFailed(format!("HTTP {}", status)));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::TokenExchangeFailed(e.to_string()))?;
        Ok(token.access_token)
    }

    /// Fetch `/users/@me` with a user access token.
    pub async fn fetch_user(&self, access_token: &str) -> Result<DiscordUser> {
        let response = self
            .http
            .get(format!("{}/users/@me", self.api_url))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| Error::IdentityFetchFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            tracing::error!("Discord user fetch failed: {}", status);
            return Err(Error::IdentityFetchFailed(format!("HTTP {}", status)));
        }

        response
            .json()
            .await
            .map_err(|e| Error::IdentityFetchFailed(e.to_string()))
    }
}

/// Redirect URI registered with Discord.
fn redirect_uri(server: &ServerConfig, config: &BridgeConfig) -> String {
    if config.oauth_redirect_uri.trim().is_empty() {
        server.default_redirect_uri()
    } else {
        config.oauth_redirect_uri.clone()
    }
}

/// Discord authorization URL for a state token.
pub fn authorize_url(server: &ServerConfig, config: &BridgeConfig, state: &str) -> String {
    format!(
        "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}&prompt=consent",
        server.discord_auth_url,
        urlencoding::encode(&config.oauth_client_id),
        urlencoding::encode(&redirect_uri(server, config)),
        DISCORD_SCOPES.join("%20"),
        urlencoding::encode(state)
    )
}

// ── Handlers ─────────────────────────────────────────────────────────────────

/// GET /auth/discord/start: validate the state and head to Discord.
///
/// A bot-initiated state has no portal user yet: the browser's portal
/// session supplies it, or the user is sent to log in first.
pub async fn start(
    State(state): State<AppState>,
    Query(query): Query<StartQuery>,
    headers: HeaderMap,
) -> Response {
    let server = state.config.clone();
    let outcome = blocking(move || {
        let now = chrono::Utc::now().timestamp_millis();
        start_flow(&state, query, &headers, now)
    })
    .await;
    match outcome {
        Ok(redirect) => redirect.into_response(),
        Err(e) => {
            tracing::error!(error = %e, "[OAuth] Start failed");
            finish_redirect(&server, LinkStatus::Error).into_response()
        }
    }
}

fn start_flow(
    state: &AppState,
    query: StartQuery,
    headers: &HeaderMap,
    now: i64,
) -> Result<Redirect> {
    let config = state.configs.load()?;
    if !config.enabled || !config.oauth_configured() {
        return Ok(finish_redirect(&state.config, LinkStatus::NotConfigured));
    }

    let Some(token) = query.state.filter(|t| !t.is_empty()) else {
        return Ok(finish_redirect(&state.config, LinkStatus::InvalidState));
    };
    let Some(link_state) = state.oauth_states.get_valid(&token, now)? else {
        return Ok(finish_redirect(&state.config, LinkStatus::InvalidState));
    };

    if link_state.user_id.is_none() {
        let session_user = match session_token(headers) {
            Some(session) => state.portal.session_user(&session, now)?,
            None => None,
        };
        let Some(user) = session_user else {
            let next = state.config.link_start_url(&token);
            return Ok(Redirect::to(&state.config.portal_login_url(&next)));
        };
        if !state.oauth_states.attach(&token, &user.id, now)? {
            return Ok(finish_redirect(&state.config, LinkStatus::InvalidState));
        }
        tracing::debug!(user_id = %user.id, "[OAuth] Session user attached to state");
    }

    Ok(Redirect::to(&authorize_url(&state.config, &config, &token)))
}

/// GET /auth/discord/callback: finish the link.
pub async fn callback(State(state): State<AppState>, Query(query): Query<CallbackQuery>) -> Response {
    let status = match callback_flow(&state, query).await {
        Ok(status) => status,
        Err(e) => {
            tracing::error!(error = %e, "[OAuth] Callback failed");
            LinkStatus::Error
        }
    };
    finish_redirect(&state.config, status).into_response()
}

/// A callback whose state checked out, ready for the Discord round trip.
struct PendingLink {
    config: BridgeConfig,
    link_state: OAuthState,
    user_id: String,
    code: String,
}

async fn callback_flow(state: &AppState, query: CallbackQuery) -> Result<LinkStatus> {
    let pending = {
        let state = state.clone();
        blocking(move || {
            let now = chrono::Utc::now().timestamp_millis();
            resolve_callback(&state, query, now)
        })
        .await?
    };
    let pending = match pending {
        Ok(pending) => pending,
        Err(status) => return Ok(status),
    };
    let PendingLink {
        config,
        link_state,
        user_id,
        code,
    } = pending;

    let access_token = match state
        .discord
        .exchange_code(&config, &redirect_uri(&state.config, &config), &code)
        .await
    {
        Ok(token) => token,
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "[OAuth] Token exchange failed");
            return Ok(LinkStatus::TokenExchangeFailed);
        }
    };
    let discord_user = match state.discord.fetch_user(&access_token).await {
        Ok(user) => user,
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "[OAuth] Identity fetch failed");
            return Ok(LinkStatus::IdentityFailed);
        }
    };

    if let Some(expected) = &link_state.discord_user_id {
        if expected != &discord_user.id {
            tracing::warn!(
                user_id = %user_id,
                expected = %expected,
                actual = %discord_user.id,
                "[OAuth] Authorized Discord account differs from the requesting one"
            );
            return Ok(LinkStatus::IdentityMismatch);
        }
    }

    let new_link = NewLink {
        user_id,
        discord_user_id: discord_user.id.clone(),
        discord_username: discord_user.display_name(),
        discord_avatar_url: discord_user.avatar_url(),
        guild_id: config.default_guild_id.clone(),
    };
    let state = state.clone();
    blocking(move || {
        let now = chrono::Utc::now().timestamp_millis();
        persist_link(&state, &config, &new_link, now)
    })
    .await
}

/// Consume the state and pull out what the Discord round trip needs, or the
/// status to finish with.
fn resolve_callback(
    state: &AppState,
    query: CallbackQuery,
    now: i64,
) -> Result<std::result::Result<PendingLink, LinkStatus>> {
    if let Some(error) = &query.error {
        tracing::info!(
            error = %error,
            description = ?query.error_description,
            "[OAuth] Authorization declined"
        );
        if let Some(token) = &query.state {
            state.oauth_states.consume(token, now)?;
        }
        return Ok(Err(LinkStatus::Denied));
    }

    let config = state.configs.load()?;
    if !config.enabled || !config.oauth_configured() {
        return Ok(Err(LinkStatus::NotConfigured));
    }

    let Some(token) = query.state.filter(|t| !t.is_empty()) else {
        return Ok(Err(LinkStatus::InvalidState));
    };
    let Some(link_state) = state.oauth_states.consume(&token, now)? else {
        tracing::warn!("[OAuth] Callback with unusable state");
        return Ok(Err(LinkStatus::InvalidState));
    };
    let Some(user_id) = link_state.user_id.clone() else {
        return Ok(Err(LinkStatus::MissingUser));
    };
    let Some(code) = query.code.filter(|c| !c.is_empty()) else {
        return Ok(Err(LinkStatus::Error));
    };

    Ok(Ok(PendingLink {
        config,
        link_state,
        user_id,
        code,
    }))
}

/// Store the link, then record the event and the role grant.
fn persist_link(
    state: &AppState,
    config: &BridgeConfig,
    new_link: &NewLink,
    now: i64,
) -> Result<LinkStatus> {
    let link = match state.links.link(new_link, now) {
        Ok(link) => link,
        Err(Error::AccountAlreadyLinked) => return Ok(LinkStatus::AlreadyLinked),
        Err(Error::NotFound(_)) => return Ok(LinkStatus::MissingUser),
        Err(e) => return Err(e),
    };

    state.outbox.enqueue_best_effort(
        config,
        EVENT_DISCORD_LINKED,
        &json!({
            "userId": link.user_id,
            "discordUserId": link.discord_user_id,
            "discordUsername": link.discord_username,
        }),
        Some(&link.user_id),
        now,
    );

    if let Some(user) = state.portal.get_user(&link.user_id)? {
        let request = RoleSyncRequest {
            user_id: &user.id,
            discord_user_id: Some(&link.discord_user_id),
            role: &user.role,
            guild_id: link.guild_id.as_deref(),
        };
        if let Err(e) = state.role_sync.enqueue(config, request, now) {
            tracing::error!(user_id = %user.id, error = %e, "[OAuth] Failed to queue role sync");
        }
    }

    Ok(LinkStatus::Linked)
}
