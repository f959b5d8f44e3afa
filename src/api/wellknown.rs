//! Well-known endpoints
//!
//! - /.well-known/webfinger
//! - /.well-known/nodeinfo
//! - /nodeinfo/2.0.json

use axum::{
    extract::{Query, State},
    response::Json,
    routing::get,
    Router,
};
use serde::Deserialize;

use crate::error::AppError;
use crate::AppState;

/// Create well-known router
pub fn wellknown_router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/webfinger", get(webfinger))
        .route("/.well-known/nodeinfo", get(nodeinfo_links))
        .route("/nodeinfo/2.0.json", get(nodeinfo))
}

#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// GET /.well-known/webfinger
///
/// The relay has exactly one account: `acct:relay@{domain}`.
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let expected = format!("acct:relay@{}", state.config.domain);

    if query.resource != expected {
        return Err(AppError::NotFound("user not found".to_string()));
    }

    let actor_url = state.config.actor();

    Ok(Json(serde_json::json!({
        "subject": expected,
        "aliases": [actor_url],
        "links": [
            {
                "rel": "self",
                "type": "application/activity+json",
                "href": actor_url
            }
        ]
    })))
}

/// GET /.well-known/nodeinfo
async fn nodeinfo_links(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "links": [
            {
                "rel": "http://nodeinfo.diaspora.software/ns/schema/2.0",
                "href": format!("https://{}/nodeinfo/2.0.json", state.config.domain)
            }
        ]
    }))
}

/// GET /nodeinfo/2.0.json
///
/// Registrations are "open" whenever the whitelist gate is off; peers
/// lists the subscribed domains.
async fn nodeinfo(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let relay_config = state.store.get_relay_config().await?;
    let peers: Vec<String> = state
        .store
        .get_inboxes()
        .await?
        .into_iter()
        .map(|instance| instance.domain)
        .collect();

    Ok(Json(serde_json::json!({
        "version": "2.0",
        "software": {
            "name": "ap-relay",
            "version": env!("CARGO_PKG_VERSION")
        },
        "protocols": ["activitypub"],
        "services": {
            "inbound": [],
            "outbound": []
        },
        "openRegistrations": !relay_config.whitelist_enabled,
        "usage": {
            "users": {
                "total": 1
            },
            "localPosts": 0
        },
        "metadata": {
            "peers": peers
        }
    })))
}
