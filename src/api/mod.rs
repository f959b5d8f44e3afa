//! HTTP surface: ActivityPub endpoints, well-known discovery and the
//! management API

pub mod activitypub;
pub mod v1;
pub mod wellknown;

use axum::{routing::get, Router};

use crate::AppState;

pub use activitypub::activitypub_router;
pub use v1::v1_router;
pub use wellknown::wellknown_router;

/// GET /metrics
pub fn metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(|| async { crate::metrics::render() }))
}
