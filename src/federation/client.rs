//! ActivityPub client
//!
//! Outbound GETs (actor, nodeinfo, webfinger) and signed POSTs for
//! fan-out. Every operation consults the policy engine before touching
//! the network, and GET responses land in the KV cache.

use std::sync::Arc;

use chrono::Duration;
use serde::Deserialize;
use serde_json::Value;

use super::signature::Signer;
use super::url_domain;
use crate::data::cache::{Cache, ACTOR_MAX_AGE_SECS, NODEINFO_MAX_AGE_SECS, NS_ACTOR, NS_NODEINFO};
use crate::data::{Store, ValueType};
use crate::error::{AppError, Result};
use crate::policy::PolicySnapshot;

const USER_AGENT: &str = concat!("ap-relay/", env!("CARGO_PKG_VERSION"));
const ACCEPT_ACTIVITY: &str = "application/activity+json, application/ld+json";
pub const CONTENT_TYPE_ACTIVITY: &str = "application/activity+json";

/// Result of one delivery POST, classified for the fan-out engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    /// 410: the endpoint is permanently gone
    Gone,
    /// 404: counts toward the consecutive-miss threshold
    NotFound,
    /// Timeout, connection reset, 5xx, 408, 429
    Transient(String),
    /// Any other 4xx; retrying will not help
    Permanent(String),
}

/// A remote actor document, as much of it as the relay needs
#[derive(Debug, Clone, Deserialize)]
pub struct Actor {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub inbox: Option<String>,
    #[serde(default)]
    pub endpoints: Option<ActorEndpoints>,
    #[serde(default, rename = "publicKey")]
    pub public_key: Option<ActorPublicKey>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActorEndpoints {
    #[serde(default, rename = "sharedInbox")]
    pub shared_inbox: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActorPublicKey {
    pub id: String,
    #[serde(rename = "publicKeyPem")]
    pub public_key_pem: String,
}

impl Actor {
    /// The shared inbox when advertised, the personal inbox otherwise
    pub fn shared_inbox(&self) -> Option<&str> {
        self.endpoints
            .as_ref()
            .and_then(|endpoints| endpoints.shared_inbox.as_deref())
            .or(self.inbox.as_deref())
    }

    /// The actor's domain (host, plus explicit port if any)
    pub fn domain(&self) -> Result<String> {
        url_domain(&self.id)
            .ok_or_else(|| AppError::Validation(format!("actor id is not a URL: {}", self.id)))
    }
}

/// Shared outbound HTTP client
pub struct Client {
    http: reqwest::Client,
    store: Arc<Store>,
    cache: Arc<dyn Cache>,
    signer: Arc<Signer>,
}

impl Client {
    /// Build the client with the fan-out timeouts (connect 10 s, total 30 s)
    pub fn new(store: Arc<Store>, cache: Arc<dyn Cache>, signer: Arc<Signer>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        Ok(Self {
            http,
            store,
            cache,
            signer,
        })
    }

    /// Fail with `Blocked` if the domain is not permitted right now
    async fn ensure_allowed(&self, domain: &str) -> Result<()> {
        let snapshot = PolicySnapshot::load(&self.store).await?;
        if !snapshot.evaluate(domain, None).is_allowed() {
            return Err(AppError::Blocked);
        }
        Ok(())
    }

    /// Signed GET returning JSON, without cache involvement
    ///
    /// Transient upstream failures are retried up to three times before
    /// surfacing.
    async fn get_json(&self, url: &str) -> Result<Option<Value>> {
        const GET_RETRIES: u32 = 3;

        let url = url.split('#').next().unwrap_or(url);

        let domain = url_domain(url)
            .ok_or_else(|| AppError::Validation(format!("invalid URL: {url}")))?;
        self.ensure_allowed(&domain).await?;

        let mut last_error = None;
        for attempt in 0..GET_RETRIES {
            match self.get_json_once(url).await {
                Err(AppError::Transient(reason)) => {
                    tracing::debug!(%url, attempt, %reason, "Transient fetch failure");
                    last_error = Some(AppError::Transient(reason));
                }
                other => return other,
            }
        }

        Err(last_error.unwrap_or_else(|| AppError::Transient(format!("fetch {url} failed"))))
    }

    async fn get_json_once(&self, url: &str) -> Result<Option<Value>> {
        let signed = self.signer.sign_request("GET", url, None, None)?;

        tracing::debug!(%url, "Fetching resource");

        let response = self
            .http
            .get(url)
            .header("Accept", ACCEPT_ACTIVITY)
            .header("Date", signed.date)
            .header("Signature", signed.signature)
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("fetch {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(%url, %status, "Resource fetch returned an error status");
            if status.is_server_error() || status.as_u16() == 408 || status.as_u16() == 429 {
                return Err(AppError::Transient(format!("{url} answered {status}")));
            }
            return Ok(None);
        }

        let body = response
            .json()
            .await
            .map_err(|e| AppError::Validation(format!("unparseable response from {url}: {e}")))?;

        Ok(Some(body))
    }

    /// Fetch an actor document, via the 6 h cache
    pub async fn fetch_actor(&self, actor_iri: &str) -> Result<Option<Actor>> {
        let key = actor_iri.split('#').next().unwrap_or(actor_iri);

        if let Some(item) = self.cache.get(NS_ACTOR, key).await? {
            if !item.older_than(Duration::seconds(ACTOR_MAX_AGE_SECS)) {
                let actor = serde_json::from_str(&item.value)
                    .map_err(|e| AppError::Validation(format!("cached actor unreadable: {e}")))?;
                return Ok(Some(actor));
            }
        }

        let Some(document) = self.get_json(key).await? else {
            return Ok(None);
        };

        let actor: Actor = serde_json::from_value(document.clone())
            .map_err(|e| AppError::Validation(format!("invalid actor document: {e}")))?;

        self.cache
            .set(NS_ACTOR, key, &document.to_string(), ValueType::Json)
            .await?;

        Ok(Some(actor))
    }

    /// Discover a domain's software name through nodeinfo, via the 1 h cache
    ///
    /// Returns `None` when the instance does not expose nodeinfo; that is
    /// common enough not to be an error.
    pub async fn fetch_nodeinfo_software(&self, domain: &str) -> Result<Option<String>> {
        if let Some(item) = self.cache.get(NS_NODEINFO, domain).await? {
            if !item.older_than(Duration::seconds(NODEINFO_MAX_AGE_SECS)) {
                return Ok((!item.value.is_empty()).then_some(item.value));
            }
        }

        let software = self.discover_nodeinfo_software(domain).await?;

        // negative results are cached as an empty string
        self.cache
            .set(
                NS_NODEINFO,
                domain,
                software.as_deref().unwrap_or_default(),
                ValueType::Str,
            )
            .await?;

        Ok(software)
    }

    async fn discover_nodeinfo_software(&self, domain: &str) -> Result<Option<String>> {
        let wellknown_url = format!("https://{domain}/.well-known/nodeinfo");
        let Some(wellknown) = self.get_json(&wellknown_url).await.unwrap_or_default() else {
            tracing::debug!(%domain, "No well-known nodeinfo document");
            return Ok(None);
        };

        let Some(links) = wellknown.get("links").and_then(Value::as_array) else {
            return Ok(None);
        };

        let nodeinfo_url = links.iter().find_map(|link| {
            let rel = link.get("rel").and_then(Value::as_str)?;
            if rel.ends_with("/schema/2.0") || rel.ends_with("/schema/2.1") {
                link.get("href").and_then(Value::as_str)
            } else {
                None
            }
        });

        let Some(nodeinfo_url) = nodeinfo_url else {
            tracing::debug!(%domain, "No usable nodeinfo link");
            return Ok(None);
        };

        let Some(nodeinfo) = self.get_json(nodeinfo_url).await.unwrap_or_default() else {
            return Ok(None);
        };

        Ok(nodeinfo
            .get("software")
            .and_then(|software| software.get("name"))
            .and_then(Value::as_str)
            .map(str::to_ascii_lowercase))
    }

    /// Resolve an actor reference that is either an IRI or a
    /// `user@domain` handle (looked up over webfinger)
    pub async fn resolve_actor_iri(&self, reference: &str) -> Result<String> {
        if reference.starts_with("https://") || reference.starts_with("http://") {
            return Ok(reference.to_string());
        }

        let handle = reference.trim_start_matches('@');
        let (_, domain) = handle
            .split_once('@')
            .ok_or_else(|| AppError::Validation(format!("not an actor reference: {reference}")))?;

        let webfinger_url =
            format!("https://{domain}/.well-known/webfinger?resource=acct:{handle}");
        let document = self
            .get_json(&webfinger_url)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no webfinger entry for {handle}")))?;

        document
            .get("links")
            .and_then(Value::as_array)
            .and_then(|links| {
                links.iter().find_map(|link| {
                    let rel = link.get("rel").and_then(Value::as_str)?;
                    let media_type = link.get("type").and_then(Value::as_str)?;
                    (rel == "self" && media_type.contains("activity+json"))
                        .then(|| link.get("href").and_then(Value::as_str))
                        .flatten()
                        .map(str::to_string)
                })
            })
            .ok_or_else(|| AppError::NotFound(format!("no actor link for {handle}")))
    }

    /// Signed POST of an activity to an inbox, classified for retry logic
    pub async fn post_signed(&self, inbox: &str, activity: &Value) -> DeliveryOutcome {
        let body = activity.to_string().into_bytes();

        let signed = match self
            .signer
            .sign_request("POST", inbox, Some(&body), Some(CONTENT_TYPE_ACTIVITY))
        {
            Ok(signed) => signed,
            Err(error) => return DeliveryOutcome::Permanent(format!("signing failed: {error}")),
        };

        let mut request = self
            .http
            .post(inbox)
            .header("Content-Type", CONTENT_TYPE_ACTIVITY)
            .header("Date", signed.date)
            .header("Signature", signed.signature);

        if let Some(digest) = signed.digest {
            request = request.header("Digest", digest);
        }

        let response = match request.body(body).send().await {
            Ok(response) => response,
            Err(error) => return DeliveryOutcome::Transient(error.to_string()),
        };

        classify_status(response.status())
    }
}

fn classify_status(status: reqwest::StatusCode) -> DeliveryOutcome {
    match status.as_u16() {
        200..=299 => DeliveryOutcome::Success,
        410 => DeliveryOutcome::Gone,
        404 => DeliveryOutcome::NotFound,
        408 | 429 => DeliveryOutcome::Transient(format!("HTTP {status}")),
        500..=599 => DeliveryOutcome::Transient(format!("HTTP {status}")),
        _ => DeliveryOutcome::Permanent(format!("HTTP {status}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_matches_retry_semantics() {
        use reqwest::StatusCode;

        assert_eq!(classify_status(StatusCode::ACCEPTED), DeliveryOutcome::Success);
        assert_eq!(classify_status(StatusCode::GONE), DeliveryOutcome::Gone);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), DeliveryOutcome::NotFound);

        for transient in [
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert!(matches!(
                classify_status(transient),
                DeliveryOutcome::Transient(_)
            ));
        }

        for permanent in [StatusCode::BAD_REQUEST, StatusCode::FORBIDDEN] {
            assert!(matches!(
                classify_status(permanent),
                DeliveryOutcome::Permanent(_)
            ));
        }
    }

    #[test]
    fn actor_prefers_shared_inbox() {
        let actor: Actor = serde_json::from_value(serde_json::json!({
            "id": "https://a.example/actor",
            "type": "Application",
            "inbox": "https://a.example/actor/inbox",
            "endpoints": {"sharedInbox": "https://a.example/inbox"}
        }))
        .unwrap();

        assert_eq!(actor.shared_inbox(), Some("https://a.example/inbox"));
        assert_eq!(actor.domain().unwrap(), "a.example");
    }

    #[test]
    fn actor_falls_back_to_personal_inbox() {
        let actor: Actor = serde_json::from_value(serde_json::json!({
            "id": "https://a.example:8443/users/relay",
            "type": "Service",
            "inbox": "https://a.example:8443/users/relay/inbox"
        }))
        .unwrap();

        assert_eq!(
            actor.shared_inbox(),
            Some("https://a.example:8443/users/relay/inbox")
        );
        assert_eq!(actor.domain().unwrap(), "a.example:8443");
    }
}
