//! ActivityPub federation: signatures, client, dispatch, fan-out

pub mod activity;
pub mod client;
pub mod dedup;
pub mod delivery;
pub mod signature;

pub use activity::{Activity, ActivityProcessor, ActivityType};
pub use client::{Actor, Client, DeliveryOutcome};
pub use dedup::DedupRing;
pub use delivery::{backoff_delay, Delivery, DeliveryJob, JobKind};
pub use signature::{
    generate_digest, parse_signature_header, verify_signature, Signer,
};

/// The domain of a URL: host plus explicit port, lowercased
///
/// Follows the authority form used as the `inboxes` natural key, so
/// instances on non-default ports stay distinct.
pub fn url_domain(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();

    match parsed.port() {
        Some(port) => Some(format!("{host}:{port}")),
        None => Some(host),
    }
}

/// Whether the signature's keyId and the activity's actor live on the
/// same domain
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    match (url_domain(key_id), url_domain(actor_id)) {
        (Some(key_domain), Some(actor_domain)) => key_domain == actor_domain,
        _ => false,
    }
}
