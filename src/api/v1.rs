//! Management API
//!
//! Token-authenticated JSON CRUD under `/api/v1/*`, backing the CLI and
//! admin frontend. Handlers are thin wrappers over the store plus their
//! side effects: banning a domain drops its inboxes, adding an instance
//! sends a Follow, answering a request sends Accept/Reject.

use std::sync::Arc;

use axum::http::request::Parts;
use axum::{
    extract::{FromRequestParts, State},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;

use crate::data::{RelayConfig, User, RELAY_SOFTWARE};
use crate::error::{AppError, Result};
use crate::federation::activity::builder;
use crate::federation::{url_domain, DeliveryJob, JobKind};
use crate::AppState;

/// Create the management API router
pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/token", post(login).delete(logout))
        .route("/relay", get(relay_summary))
        .route("/config", get(config_list).post(config_set).delete(config_reset))
        .route(
            "/instance",
            get(instance_list)
                .post(instance_add)
                .patch(instance_update)
                .delete(instance_remove),
        )
        .route(
            "/domain_ban",
            get(domain_ban_list)
                .post(domain_ban_add)
                .patch(domain_ban_update)
                .delete(domain_ban_remove),
        )
        .route(
            "/software_ban",
            get(software_ban_list)
                .post(software_ban_add)
                .patch(software_ban_update)
                .delete(software_ban_remove),
        )
        .route(
            "/whitelist",
            get(whitelist_list).post(whitelist_add).delete(whitelist_remove),
        )
        .route(
            "/user",
            get(user_list).post(user_add).patch(user_update).delete(user_remove),
        )
        .route("/request", get(request_list).post(request_respond))
}

// =============================================================================
// Authentication
// =============================================================================

/// An authenticated API caller: the user plus the token that proved it
pub struct ApiAuth {
    pub user: User,
    pub token_code: String,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for ApiAuth {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let token_code = bearer_token(parts)
            .or_else(|| cookie_token(parts))
            .ok_or_else(|| AppError::Auth("missing token".to_string()))?;

        let user = state
            .store
            .get_user_by_token(&token_code)
            .await?
            .ok_or_else(|| AppError::Auth("invalid token".to_string()))?;

        Ok(Self { user, token_code })
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    let header = parts.headers.get("authorization")?.to_str().ok()?;
    let (scheme, code) = header.split_once(' ')?;

    if scheme.eq_ignore_ascii_case("bearer") && !code.is_empty() {
        Some(code.to_string())
    } else {
        None
    }
}

fn cookie_token(parts: &Parts) -> Option<String> {
    let header = parts.headers.get("cookie")?.to_str().ok()?;

    header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == "user-token" && !value.is_empty()).then(|| value.to_string())
    })
}

// =============================================================================
// Tokens
// =============================================================================

#[derive(Debug, Deserialize)]
struct LoginBody {
    username: String,
    password: String,
}

/// POST /api/v1/token
///
/// Exchanges credentials for an API token; also sets the `user-token`
/// cookie used by the frontend.
async fn login(State(state): State<AppState>, Json(body): Json<LoginBody>) -> Result<Response> {
    let user = state.store.verify_user(&body.username, &body.password).await?;
    let token = state.store.put_token(&user.username).await?;

    let cookie = format!("user-token={}; Path=/; HttpOnly; SameSite=Strict", token.code);
    let response = (
        [("Set-Cookie", cookie)],
        Json(serde_json::json!({ "code": token.code })),
    );

    Ok(response.into_response())
}

/// DELETE /api/v1/token
///
/// Revokes the presented token.
async fn logout(State(state): State<AppState>, auth: ApiAuth) -> Result<Json<serde_json::Value>> {
    state.store.del_token(&auth.token_code).await?;
    Ok(Json(serde_json::json!({ "message": "Token revoked" })))
}

// =============================================================================
// Relay summary
// =============================================================================

/// GET /api/v1/relay
///
/// Unauthenticated instance summary.
async fn relay_summary(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let relay_config = state.store.get_relay_config().await?;
    let domains: Vec<String> = state
        .store
        .get_inboxes()
        .await?
        .into_iter()
        .map(|instance| instance.domain)
        .collect();

    Ok(Json(serde_json::json!({
        "domain": state.config.domain,
        "name": relay_config.name,
        "description": relay_config.note,
        "version": env!("CARGO_PKG_VERSION"),
        "whitelist_enabled": relay_config.whitelist_enabled,
        "instances": domains
    })))
}

// =============================================================================
// Config
// =============================================================================

#[derive(Debug, Deserialize)]
struct ConfigSetBody {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct ConfigKeyBody {
    key: String,
}

fn user_key(key: &str) -> Result<()> {
    if RelayConfig::USER_KEYS.contains(&key) {
        Ok(())
    } else {
        Err(AppError::Validation(format!("invalid config key: {key}")))
    }
}

/// GET /api/v1/config
async fn config_list(
    State(state): State<AppState>,
    _auth: ApiAuth,
) -> Result<Json<serde_json::Value>> {
    let relay_config = state.store.get_relay_config().await?;

    Ok(Json(serde_json::json!({
        "name": relay_config.name,
        "note": relay_config.note,
        "theme": relay_config.theme,
        "log-level": relay_config.log_level,
        "whitelist-enabled": relay_config.whitelist_enabled,
        "approval-required": relay_config.approval_required
    })))
}

/// POST /api/v1/config
async fn config_set(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Json(body): Json<ConfigSetBody>,
) -> Result<Json<serde_json::Value>> {
    user_key(&body.key)?;
    let value = state.store.put_config(&body.key, &body.value).await?;

    Ok(Json(serde_json::json!({ "key": body.key, "value": value })))
}

/// DELETE /api/v1/config
///
/// Removes the stored row; reads fall back to the built-in default.
async fn config_reset(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Json(body): Json<ConfigKeyBody>,
) -> Result<Json<serde_json::Value>> {
    user_key(&body.key)?;
    state.store.del_config(&body.key).await?;

    let default = RelayConfig::default_value(&body.key)?;
    Ok(Json(serde_json::json!({ "key": body.key, "value": default })))
}

// =============================================================================
// Instances
// =============================================================================

#[derive(Debug, Deserialize)]
struct InstanceAddBody {
    actor: String,
    inbox: Option<String>,
    software: Option<String>,
    followid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstanceUpdateBody {
    domain: String,
    actor: Option<String>,
    inbox: Option<String>,
    software: Option<String>,
    followid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DomainBody {
    domain: String,
}

/// GET /api/v1/instance
async fn instance_list(
    State(state): State<AppState>,
    _auth: ApiAuth,
) -> Result<Json<Vec<crate::data::Instance>>> {
    Ok(Json(state.store.get_inboxes().await?))
}

/// POST /api/v1/instance
///
/// Resolves the actor when inbox/software are not given, stores the row
/// and queues an outbound Follow so the remote starts relaying to us.
async fn instance_add(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Json(body): Json<InstanceAddBody>,
) -> Result<Json<crate::data::Instance>> {
    let actor_iri = state.client.resolve_actor_iri(&body.actor).await?;
    let domain = url_domain(&actor_iri)
        .ok_or_else(|| AppError::Validation(format!("invalid actor: {}", body.actor)))?;

    if state.store.get_inbox(&domain).await?.is_some() {
        return Err(AppError::Conflict(format!("{domain} is already subscribed")));
    }

    let inbox = match body.inbox {
        Some(inbox) => inbox,
        None => state
            .client
            .fetch_actor(&actor_iri)
            .await?
            .and_then(|actor| actor.shared_inbox().map(str::to_string))
            .ok_or_else(|| AppError::NotFound(format!("could not resolve inbox of {actor_iri}")))?,
    };

    let software = match body.software {
        Some(software) => Some(software),
        None => state
            .client
            .fetch_nodeinfo_software(&domain)
            .await
            .unwrap_or_default(),
    };

    // follow the remote; its Accept/Reject is matched via the stored id
    let follow = builder::follow(&state.config.domain, &actor_iri);
    let followid = body.followid.or_else(|| {
        follow
            .get("id")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
    });

    let instance = state
        .store
        .put_inbox(&crate::data::InstanceUpsert {
            domain,
            actor: actor_iri,
            inbox: inbox.clone(),
            followid,
            software,
            accepted: true,
        })
        .await?;

    state
        .delivery
        .enqueue(DeliveryJob {
            domain: instance.domain.clone(),
            inbox,
            activity: Arc::new(follow),
            attempt: 0,
            kind: JobKind::Response,
        })
        .await?;

    Ok(Json(instance))
}

/// PATCH /api/v1/instance
async fn instance_update(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Json(body): Json<InstanceUpdateBody>,
) -> Result<Json<crate::data::Instance>> {
    let existing = state
        .store
        .get_inbox(&body.domain)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("no instance for {}", body.domain)))?;

    let instance = state
        .store
        .put_inbox(&crate::data::InstanceUpsert {
            domain: existing.domain,
            actor: body.actor.unwrap_or(existing.actor),
            inbox: body.inbox.unwrap_or(existing.inbox),
            followid: body.followid.or(existing.followid),
            software: body.software.or(existing.software),
            accepted: existing.accepted,
        })
        .await?;

    Ok(Json(instance))
}

/// DELETE /api/v1/instance
async fn instance_remove(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Json(body): Json<DomainBody>,
) -> Result<Json<serde_json::Value>> {
    if !state.store.del_inbox(&body.domain).await? {
        return Err(AppError::NotFound(format!("no instance for {}", body.domain)));
    }

    Ok(Json(serde_json::json!({ "message": "Removed instance" })))
}

// =============================================================================
// Domain bans
// =============================================================================

#[derive(Debug, Deserialize)]
struct DomainBanBody {
    domain: String,
    reason: Option<String>,
    note: Option<String>,
}

/// GET /api/v1/domain_ban
async fn domain_ban_list(
    State(state): State<AppState>,
    _auth: ApiAuth,
) -> Result<Json<Vec<crate::data::DomainBan>>> {
    Ok(Json(state.store.get_domain_bans().await?))
}

/// POST /api/v1/domain_ban
async fn domain_ban_add(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Json(body): Json<DomainBanBody>,
) -> Result<Json<crate::data::DomainBan>> {
    let domain = body.domain.to_ascii_lowercase();

    if state.store.get_domain_ban(&domain).await?.is_some() {
        return Err(AppError::Conflict(format!("{domain} is already banned")));
    }

    let ban = state
        .store
        .put_domain_ban(&domain, body.reason.as_deref(), body.note.as_deref())
        .await?;

    tracing::info!(%domain, "Domain banned");
    Ok(Json(ban))
}

/// PATCH /api/v1/domain_ban
async fn domain_ban_update(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Json(body): Json<DomainBanBody>,
) -> Result<Json<crate::data::DomainBan>> {
    if body.reason.is_none() && body.note.is_none() {
        return Err(AppError::Validation(
            "must include note and/or reason".to_string(),
        ));
    }

    let domain = body.domain.to_ascii_lowercase();
    let ban = state
        .store
        .update_domain_ban(&domain, body.reason.as_deref(), body.note.as_deref())
        .await?
        .ok_or_else(|| AppError::NotFound(format!("{domain} is not banned")))?;

    Ok(Json(ban))
}

/// DELETE /api/v1/domain_ban
async fn domain_ban_remove(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Json(body): Json<DomainBody>,
) -> Result<Json<serde_json::Value>> {
    let domain = body.domain.to_ascii_lowercase();

    if !state.store.del_domain_ban(&domain).await? {
        return Err(AppError::NotFound(format!("{domain} is not banned")));
    }

    Ok(Json(serde_json::json!({ "message": "Unbanned domain" })))
}

// =============================================================================
// Software bans
// =============================================================================

#[derive(Debug, Deserialize)]
struct SoftwareBanBody {
    name: String,
    reason: Option<String>,
    note: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NameBody {
    name: String,
}

/// GET /api/v1/software_ban
async fn software_ban_list(
    State(state): State<AppState>,
    _auth: ApiAuth,
) -> Result<Json<Vec<crate::data::SoftwareBan>>> {
    Ok(Json(state.store.get_software_bans().await?))
}

/// POST /api/v1/software_ban
///
/// The magic name `RELAYS` expands to the well-known relay
/// implementations; the response always carries the created bans.
async fn software_ban_add(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Json(body): Json<SoftwareBanBody>,
) -> Result<Json<Vec<crate::data::SoftwareBan>>> {
    let names: Vec<String> = if body.name == "RELAYS" {
        RELAY_SOFTWARE.iter().map(|name| name.to_string()).collect()
    } else {
        vec![body.name.to_ascii_lowercase()]
    };

    let mut created = Vec::new();
    for name in names {
        if state.store.get_software_ban(&name).await?.is_some() {
            if body.name == "RELAYS" {
                continue;
            }
            return Err(AppError::Conflict(format!("{name} is already banned")));
        }

        created.push(
            state
                .store
                .put_software_ban(&name, body.reason.as_deref(), body.note.as_deref())
                .await?,
        );
        tracing::info!(%name, "Software banned");
    }

    Ok(Json(created))
}

/// PATCH /api/v1/software_ban
async fn software_ban_update(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Json(body): Json<SoftwareBanBody>,
) -> Result<Json<crate::data::SoftwareBan>> {
    if body.reason.is_none() && body.note.is_none() {
        return Err(AppError::Validation(
            "must include note and/or reason".to_string(),
        ));
    }

    let name = body.name.to_ascii_lowercase();
    let ban = state
        .store
        .update_software_ban(&name, body.reason.as_deref(), body.note.as_deref())
        .await?
        .ok_or_else(|| AppError::NotFound(format!("{name} is not banned")))?;

    Ok(Json(ban))
}

/// DELETE /api/v1/software_ban
async fn software_ban_remove(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Json(body): Json<NameBody>,
) -> Result<Json<serde_json::Value>> {
    let name = body.name.to_ascii_lowercase();

    if !state.store.del_software_ban(&name).await? {
        return Err(AppError::NotFound(format!("{name} is not banned")));
    }

    Ok(Json(serde_json::json!({ "message": "Unbanned software" })))
}

// =============================================================================
// Whitelist
// =============================================================================

/// GET /api/v1/whitelist
async fn whitelist_list(
    State(state): State<AppState>,
    _auth: ApiAuth,
) -> Result<Json<Vec<crate::data::WhitelistEntry>>> {
    Ok(Json(state.store.get_whitelist().await?))
}

/// POST /api/v1/whitelist
async fn whitelist_add(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Json(body): Json<DomainBody>,
) -> Result<Json<crate::data::WhitelistEntry>> {
    let domain = body.domain.to_ascii_lowercase();

    if state.store.get_whitelist_domain(&domain).await?.is_some() {
        return Err(AppError::Conflict(format!("{domain} is already whitelisted")));
    }

    Ok(Json(state.store.put_whitelist_domain(&domain).await?))
}

/// DELETE /api/v1/whitelist
async fn whitelist_remove(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Json(body): Json<DomainBody>,
) -> Result<Json<serde_json::Value>> {
    let domain = body.domain.to_ascii_lowercase();

    if !state.store.del_whitelist_domain(&domain).await? {
        return Err(AppError::NotFound(format!("{domain} is not whitelisted")));
    }

    Ok(Json(serde_json::json!({ "message": "Removed domain from whitelist" })))
}

// =============================================================================
// Users
// =============================================================================

#[derive(Debug, Deserialize)]
struct UserAddBody {
    username: String,
    password: String,
    handle: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserUpdateBody {
    username: String,
    password: Option<String>,
    handle: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsernameBody {
    username: String,
}

/// GET /api/v1/user
async fn user_list(
    State(state): State<AppState>,
    _auth: ApiAuth,
) -> Result<Json<Vec<User>>> {
    Ok(Json(state.store.get_users().await?))
}

/// POST /api/v1/user
async fn user_add(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Json(body): Json<UserAddBody>,
) -> Result<Json<User>> {
    if state.store.get_user(&body.username).await?.is_some() {
        return Err(AppError::Conflict(format!(
            "user {} already exists",
            body.username
        )));
    }

    let user = state
        .store
        .put_user(&body.username, &body.password, body.handle.as_deref())
        .await?;

    Ok(Json(user))
}

/// PATCH /api/v1/user
async fn user_update(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Json(body): Json<UserUpdateBody>,
) -> Result<Json<User>> {
    let existing = state
        .store
        .get_user(&body.username)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("no user {}", body.username)))?;

    let Some(password) = body.password else {
        return Err(AppError::Validation(
            "only the password can be updated".to_string(),
        ));
    };

    let user = state
        .store
        .put_user(
            &existing.username,
            &password,
            body.handle.as_deref().or(existing.handle.as_deref()),
        )
        .await?;

    Ok(Json(user))
}

/// DELETE /api/v1/user
async fn user_remove(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Json(body): Json<UsernameBody>,
) -> Result<Json<serde_json::Value>> {
    if !state.store.del_user(&body.username).await? {
        return Err(AppError::NotFound(format!("no user {}", body.username)));
    }

    Ok(Json(serde_json::json!({ "message": "Deleted user" })))
}

// =============================================================================
// Follow requests
// =============================================================================

#[derive(Debug, Deserialize)]
struct RequestResponseBody {
    domain: String,
    accept: bool,
}

/// GET /api/v1/request
async fn request_list(
    State(state): State<AppState>,
    _auth: ApiAuth,
) -> Result<Json<Vec<crate::data::Instance>>> {
    Ok(Json(state.store.get_requests().await?))
}

/// POST /api/v1/request
///
/// Answers a pending follow: acceptance activates the subscription and
/// sends Accept (+ follow-back to non-mastodon software); rejection
/// removes the row and sends Reject.
async fn request_respond(
    State(state): State<AppState>,
    _auth: ApiAuth,
    Json(body): Json<RequestResponseBody>,
) -> Result<Json<serde_json::Value>> {
    let domain = body.domain.to_ascii_lowercase();
    let pending = state
        .store
        .get_requests()
        .await?
        .into_iter()
        .find(|instance| instance.domain == domain)
        .ok_or_else(|| AppError::NotFound(format!("no pending request for {domain}")))?;

    let followid = pending
        .followid
        .clone()
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("pending request has no followid")))?;

    if body.accept {
        state.store.set_inbox_accepted(&domain).await?;
    } else {
        state.store.del_inbox(&domain).await?;
    }

    let response = builder::follow_response(
        &state.config.domain,
        &pending.actor,
        &followid,
        body.accept,
    );
    send_handshake(&state, &pending, response).await?;

    if body.accept && pending.software.as_deref() != Some("mastodon") {
        let follow = builder::follow(&state.config.domain, &pending.actor);
        send_handshake(&state, &pending, follow).await?;
    }

    let message = if body.accept {
        "Request accepted"
    } else {
        "Request denied"
    };
    Ok(Json(serde_json::json!({ "message": message })))
}

async fn send_handshake(
    state: &AppState,
    instance: &crate::data::Instance,
    activity: serde_json::Value,
) -> Result<()> {
    state
        .delivery
        .enqueue(DeliveryJob {
            domain: instance.domain.clone(),
            inbox: instance.inbox.clone(),
            activity: Arc::new(activity),
            attempt: 0,
            kind: JobKind::Response,
        })
        .await
}
