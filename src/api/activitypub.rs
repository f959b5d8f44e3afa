//! ActivityPub endpoints
//!
//! - Relay actor document
//! - Shared inbox (activity ingest)
//! - Outbox / followers / following collections

use axum::body::Bytes;
use axum::http::{StatusCode, Uri};
use axum::{extract::State, response::Json, routing::get, Router};
use http::HeaderMap;

use crate::error::{AppError, SignatureError};
use crate::federation::{key_id_matches_actor, parse_signature_header, verify_signature};
use crate::policy::PolicySnapshot;
use crate::AppState;

/// Create ActivityPub router
///
/// `/actor` and `/inbox` are aliases for both the document and ingest.
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/actor", get(actor).post(inbox))
        .route("/inbox", get(actor).post(inbox))
        .route("/outbox", get(outbox))
        .route("/followers", get(followers))
        .route("/following", get(following))
}

/// GET /actor
///
/// The relay's actor document, a `Service` with the signing key embedded.
async fn actor(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let relay_config = state.store.get_relay_config().await?;
    let public_key_pem = state.signer.public_key_pem()?;

    Ok(Json(crate::federation::activity::builder::actor_document(
        &state.config.domain,
        &public_key_pem,
        &relay_config.note,
    )))
}

/// POST /inbox
///
/// # Pipeline
/// 1. Body is capped at 1 MiB by the router layer
/// 2. Parse the Signature header, fetch the signer, verify
/// 3. Parse the activity; drop duplicates from the dedup ring with 202
/// 4. The keyId owner domain must match the actor domain
/// 5. Policy gate on (domain, software)
/// 6. Dispatch by activity type
async fn inbox(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    // 2. signature header and signer
    let signature_header = headers
        .get("signature")
        .ok_or(SignatureError::SignatureMissing)?
        .to_str()
        .map_err(|_| SignatureError::SignatureMalformed("non-ascii header".to_string()))?;
    let parsed_signature = parse_signature_header(signature_header)?;

    let signer_actor = state
        .client
        .fetch_actor(&parsed_signature.key_id)
        .await
        .map_err(|error| match error {
            AppError::Blocked => AppError::Blocked,
            other => {
                tracing::debug!(key_id = %parsed_signature.key_id, error = %other, "Actor fetch failed");
                AppError::Signature(SignatureError::KeyUnavailable(format!(
                    "could not fetch {}",
                    parsed_signature.key_id
                )))
            }
        })?
        .ok_or_else(|| {
            SignatureError::KeyUnavailable(format!("no actor at {}", parsed_signature.key_id))
        })?;

    let public_key_pem = signer_actor
        .public_key
        .as_ref()
        .map(|key| key.public_key_pem.clone())
        .ok_or_else(|| SignatureError::KeyUnavailable("actor has no public key".to_string()))?;

    verify_signature("POST", uri.path(), &headers, Some(&body), &public_key_pem)?;

    // 3. parse and de-duplicate
    let raw: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("invalid JSON: {e}")))?;
    let activity = crate::federation::Activity::parse(raw)?;

    if !state.dedup.insert(&activity.id) {
        tracing::debug!(id = %activity.id, "Duplicate activity ignored");
        return Ok(StatusCode::ACCEPTED);
    }

    // 4. the signing key must belong to the activity's actor
    if !key_id_matches_actor(&parsed_signature.key_id, &activity.actor) {
        return Err(AppError::Auth(
            "keyId does not belong to the activity actor".to_string(),
        ));
    }

    // 5. policy gate with the software known from the nodeinfo cache
    let actor_domain = signer_actor.domain()?;
    let software = state
        .client
        .fetch_nodeinfo_software(&actor_domain)
        .await
        .unwrap_or_else(|error| {
            tracing::debug!(domain = %actor_domain, %error, "Nodeinfo lookup failed");
            None
        });

    let snapshot = PolicySnapshot::load(&state.store).await?;
    if !snapshot
        .evaluate(&actor_domain, software.as_deref())
        .is_allowed()
    {
        tracing::info!(domain = %actor_domain, "Activity from blocked domain refused");
        return Err(AppError::Blocked);
    }

    // 6. dispatch
    state
        .processor
        .process(activity, &signer_actor, software.as_deref())
        .await?;

    Ok(StatusCode::ACCEPTED)
}

/// GET /outbox
///
/// The relay never publishes its own objects; the collection is empty.
async fn outbox(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "OrderedCollection",
        "id": format!("https://{}/outbox", state.config.domain),
        "totalItems": 0,
        "orderedItems": []
    }))
}

/// GET /followers
async fn followers(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    collection(state, "followers").await
}

/// GET /following
///
/// The relay follows back everyone it accepts, so both collections hold
/// the same actors.
async fn following(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    collection(state, "following").await
}

async fn collection(state: AppState, name: &str) -> Result<Json<serde_json::Value>, AppError> {
    let actors: Vec<String> = state
        .store
        .get_inboxes()
        .await?
        .into_iter()
        .map(|instance| instance.actor)
        .collect();

    Ok(Json(serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "Collection",
        "id": format!("https://{}/{}", state.config.domain, name),
        "totalItems": actors.len(),
        "items": actors
    })))
}
