//! Activity parsing, building and dispatch
//!
//! Inbound payloads are decoded into a typed [`Activity`] and routed by
//! kind: Follow/Undo drive the subscriber lifecycle, public
//! Create/Update/Delete/Announce/Move get rebroadcast to every other
//! subscriber.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use super::client::Actor;
use super::delivery::{Delivery, DeliveryJob, JobKind};
use super::url_domain;
use crate::data::{InstanceUpsert, Store};
use crate::error::{AppError, Result};
use crate::metrics::ACTIVITIES_TOTAL;
use crate::policy::PolicySnapshot;

/// The ActivityStreams public audience and its accepted shorthands
const PUBLIC_AUDIENCE: &[&str] = &[
    "https://www.w3.org/ns/activitystreams#Public",
    "as:Public",
    "Public",
];

/// Kinds of activities the relay distinguishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityType {
    Follow,
    Undo,
    Accept,
    Reject,
    Create,
    Update,
    Delete,
    Announce,
    Move,
    Unknown(String),
}

impl ActivityType {
    fn parse(raw: &str) -> Self {
        match raw {
            "Follow" => Self::Follow,
            "Undo" => Self::Undo,
            "Accept" => Self::Accept,
            "Reject" => Self::Reject,
            "Create" => Self::Create,
            "Update" => Self::Update,
            "Delete" => Self::Delete,
            "Announce" => Self::Announce,
            "Move" => Self::Move,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// A decoded inbound activity
#[derive(Debug, Clone)]
pub struct Activity {
    pub id: String,
    pub kind: ActivityType,
    pub actor: String,
    pub object: Option<Value>,
    raw: Value,
}

impl Activity {
    /// Decode the fields the relay cares about; everything else rides
    /// along in `raw` for forwarding.
    pub fn parse(raw: Value) -> Result<Self> {
        let kind = raw
            .get("type")
            .and_then(Value::as_str)
            .map(ActivityType::parse)
            .ok_or_else(|| AppError::Validation("activity has no type".to_string()))?;

        let id = raw
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("activity has no id".to_string()))?
            .to_string();

        let actor = raw
            .get("actor")
            .and_then(|actor| actor.as_str().or_else(|| actor.get("id")?.as_str()))
            .ok_or_else(|| AppError::Validation("activity has no actor".to_string()))?
            .to_string();

        Ok(Self {
            id,
            kind,
            actor,
            object: raw.get("object").cloned(),
            raw,
        })
    }

    /// The object IRI: either the object itself or its `id`
    pub fn object_id(&self) -> Option<&str> {
        let object = self.object.as_ref()?;
        object
            .as_str()
            .or_else(|| object.get("id").and_then(Value::as_str))
    }

    /// The `type` of an embedded object, if any
    pub fn object_type(&self) -> Option<&str> {
        self.object.as_ref()?.get("type").and_then(Value::as_str)
    }

    /// Whether the activity addresses the public audience
    pub fn is_public(&self) -> bool {
        ["to", "cc"].iter().any(|field| {
            match self.raw.get(field) {
                Some(Value::String(iri)) => PUBLIC_AUDIENCE.contains(&iri.as_str()),
                Some(Value::Array(entries)) => entries.iter().any(|entry| {
                    entry
                        .as_str()
                        .map(|iri| PUBLIC_AUDIENCE.contains(&iri))
                        .unwrap_or(false)
                }),
                _ => false,
            }
        })
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

/// Build the relay's own activities and documents
pub mod builder {
    use serde_json::Value;

    fn activity_id(domain: &str) -> String {
        format!("https://{domain}/activities/{}", uuid::Uuid::new_v4())
    }

    /// The relay's actor document
    pub fn actor_document(domain: &str, public_key_pem: &str, summary: &str) -> Value {
        serde_json::json!({
            "@context": [
                "https://www.w3.org/ns/activitystreams",
                "https://w3id.org/security/v1"
            ],
            "id": format!("https://{domain}/actor"),
            "type": "Service",
            "preferredUsername": "relay",
            "name": "ap-relay",
            "summary": summary,
            "followers": format!("https://{domain}/followers"),
            "following": format!("https://{domain}/following"),
            "inbox": format!("https://{domain}/inbox"),
            "outbox": format!("https://{domain}/outbox"),
            "url": format!("https://{domain}/"),
            "endpoints": {
                "sharedInbox": format!("https://{domain}/inbox")
            },
            "publicKey": {
                "id": format!("https://{domain}/actor#main-key"),
                "owner": format!("https://{domain}/actor"),
                "publicKeyPem": public_key_pem
            }
        })
    }

    /// An Announce wrapping an object IRI or a whole activity
    pub fn announce(domain: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": activity_id(domain),
            "type": "Announce",
            "to": [format!("https://{domain}/followers")],
            "actor": format!("https://{domain}/actor"),
            "object": object
        })
    }

    /// Accept or Reject of a subscriber's Follow
    pub fn follow_response(domain: &str, actor: &str, followid: &str, accept: bool) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": activity_id(domain),
            "type": if accept { "Accept" } else { "Reject" },
            "to": [actor],
            "actor": format!("https://{domain}/actor"),
            "object": {
                "id": followid,
                "type": "Follow",
                "object": format!("https://{domain}/actor"),
                "actor": actor
            }
        })
    }

    /// Accept of an inbound Undo
    pub fn undo_response(domain: &str, actor: &str, undo: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": activity_id(domain),
            "type": "Accept",
            "to": [actor],
            "actor": format!("https://{domain}/actor"),
            "object": undo
        })
    }

    /// The relay's reciprocal Follow of a subscriber
    pub fn follow(domain: &str, actor: &str) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": activity_id(domain),
            "type": "Follow",
            "to": [actor],
            "actor": format!("https://{domain}/actor"),
            "object": actor
        })
    }
}

/// Pick rebroadcast recipients: every subscribed inbox except the
/// source domains, minus anything the policy denies right now
pub fn distill_recipients(
    inboxes: Vec<crate::data::Instance>,
    exclude: &HashSet<String>,
    snapshot: &PolicySnapshot,
) -> Vec<crate::data::Instance> {
    inboxes
        .into_iter()
        .filter(|instance| !exclude.contains(&instance.domain))
        .filter(|instance| {
            snapshot
                .evaluate(&instance.domain, instance.software.as_deref())
                .is_allowed()
        })
        .collect()
}

/// Routes verified activities to their handlers
pub struct ActivityProcessor {
    domain: String,
    store: Arc<Store>,
    delivery: Delivery,
}

impl ActivityProcessor {
    pub fn new(domain: String, store: Arc<Store>, delivery: Delivery) -> Self {
        Self {
            domain,
            store,
            delivery,
        }
    }

    /// Dispatch one verified, policy-approved activity
    ///
    /// `software` is the sender's nodeinfo name, when known.
    pub async fn process(
        &self,
        activity: Activity,
        actor: &Actor,
        software: Option<&str>,
    ) -> Result<()> {
        let actor_domain = actor.domain()?;
        let instance = self.store.get_inbox(&actor_domain).await?;

        // anything but a Follow requires an existing subscription
        if activity.kind != ActivityType::Follow && instance.is_none() {
            tracing::debug!(actor = %actor.id, "Activity from non-subscriber rejected");
            return Err(AppError::Auth("access denied".to_string()));
        }

        // backfill the software column once nodeinfo answered
        if let (Some(row), Some(software)) = (&instance, software) {
            if row.software.is_none() {
                self.store
                    .set_inbox_software(&actor_domain, software)
                    .await?;
            }
        }

        if let ActivityType::Unknown(kind) = &activity.kind {
            tracing::debug!(%kind, actor = %actor.id, "Ignoring unhandled activity type");
            return Ok(());
        }

        ACTIVITIES_TOTAL
            .with_label_values(&[type_label(&activity.kind)])
            .inc();
        tracing::debug!(kind = ?activity.kind, actor = %actor.id, "Processing activity");

        match activity.kind.clone() {
            ActivityType::Follow => self.handle_follow(activity, actor, software).await,
            ActivityType::Undo => self.handle_undo(activity, actor, &actor_domain).await,
            ActivityType::Create | ActivityType::Announce => {
                self.handle_relay(activity, &actor_domain).await
            }
            ActivityType::Update | ActivityType::Delete | ActivityType::Move => {
                self.handle_forward(activity, &actor_domain).await
            }
            ActivityType::Accept => self.handle_follow_accepted(actor, &actor_domain).await,
            ActivityType::Reject => self.handle_follow_rejected(actor, &actor_domain).await,
            ActivityType::Unknown(_) => Ok(()),
        }
    }

    /// A new or refreshed subscription
    async fn handle_follow(
        &self,
        activity: Activity,
        actor: &Actor,
        software: Option<&str>,
    ) -> Result<()> {
        let actor_domain = actor.domain()?;
        let inbox = actor
            .shared_inbox()
            .ok_or_else(|| AppError::Validation("actor has no inbox".to_string()))?
            .to_string();

        // only instance-level actors may subscribe
        if !is_instance_actor(actor, software) {
            tracing::info!(actor = %actor.id, kind = %actor.kind, "Rejected follow from non-instance actor");
            self.send_response(
                &inbox,
                &actor_domain,
                builder::follow_response(&self.domain, &actor.id, &activity.id, false),
            )
            .await?;
            return Ok(());
        }

        let relay_config = self.store.get_relay_config().await?;
        let accepted = !relay_config.approval_required;

        self.store
            .put_inbox(&InstanceUpsert {
                domain: actor_domain.clone(),
                actor: actor.id.clone(),
                inbox: inbox.clone(),
                followid: Some(activity.id.clone()),
                software: software.map(str::to_string),
                accepted,
            })
            .await?;

        if !accepted {
            tracing::info!(domain = %actor_domain, "Follow stored, waiting for admin approval");
            return Ok(());
        }

        self.send_response(
            &inbox,
            &actor_domain,
            builder::follow_response(&self.domain, &actor.id, &activity.id, true),
        )
        .await?;

        // mastodon does not expect a follow-back
        if software != Some("mastodon") {
            self.send_response(&inbox, &actor_domain, builder::follow(&self.domain, &actor.id))
                .await?;
        }

        tracing::info!(domain = %actor_domain, "Subscribed");
        Ok(())
    }

    /// Undo of a Follow unsubscribes; any other Undo is forwarded
    async fn handle_undo(&self, activity: Activity, actor: &Actor, actor_domain: &str) -> Result<()> {
        if activity.object_type() != Some("Follow") {
            return self.handle_forward(activity, actor_domain).await;
        }

        let followid = activity
            .object_id()
            .ok_or_else(|| AppError::Validation("undo without object id".to_string()))?;

        let Some(removed) = self.store.del_inbox_by_followid(followid).await? else {
            tracing::debug!(%followid, "Undo for unknown follow");
            return Ok(());
        };

        tracing::info!(domain = %removed.domain, "Unsubscribed");

        self.send_response(
            &removed.inbox,
            actor_domain,
            builder::undo_response(&self.domain, &actor.id, activity.raw().clone()),
        )
        .await
    }

    /// Rebroadcast a public Create/Announce to the other subscribers
    ///
    /// A subscriber's own Announce passes through unwrapped so its
    /// attribution survives; everything else is wrapped in an Announce
    /// of the object by the relay actor.
    async fn handle_relay(&self, activity: Activity, actor_domain: &str) -> Result<()> {
        if !activity.is_public() {
            tracing::debug!(id = %activity.id, "Ignoring non-public activity");
            return Ok(());
        }

        let object_id = activity
            .object_id()
            .ok_or_else(|| AppError::Validation("activity without object".to_string()))?
            .to_string();

        let subscriber = if activity.kind == ActivityType::Announce {
            self.store.get_inbox(actor_domain).await?
        } else {
            None
        };
        if is_subscriber_announce(&activity, subscriber.as_ref().map(|row| row.actor.as_str())) {
            tracing::debug!(id = %activity.id, "Passing subscriber announce through");
            return self
                .rebroadcast(activity.raw().clone(), actor_domain, Some(&object_id))
                .await;
        }

        let announce = builder::announce(&self.domain, Value::String(object_id.clone()));
        self.rebroadcast(announce, actor_domain, Some(&object_id))
            .await
    }

    /// Forward a public activity wholesale, wrapped in an Announce
    async fn handle_forward(&self, activity: Activity, actor_domain: &str) -> Result<()> {
        if !activity.is_public() {
            tracing::debug!(id = %activity.id, "Ignoring non-public activity");
            return Ok(());
        }

        let object_id = activity.object_id().map(str::to_string);
        let announce = builder::announce(&self.domain, activity.raw().clone());
        self.rebroadcast(announce, actor_domain, object_id.as_deref())
            .await
    }

    /// The remote answered our reciprocal Follow
    async fn handle_follow_accepted(&self, actor: &Actor, actor_domain: &str) -> Result<()> {
        self.store.set_inbox_accepted(actor_domain).await?;
        tracing::debug!(domain = %actor_domain, actor = %actor.id, "Outbound follow accepted");
        Ok(())
    }

    /// The remote refused our reciprocal Follow; drop the subscription
    async fn handle_follow_rejected(&self, actor: &Actor, actor_domain: &str) -> Result<()> {
        self.store.del_inbox(actor_domain).await?;
        tracing::info!(domain = %actor_domain, actor = %actor.id, "Outbound follow rejected, instance removed");
        Ok(())
    }

    async fn rebroadcast(
        &self,
        announce: Value,
        actor_domain: &str,
        object_id: Option<&str>,
    ) -> Result<()> {
        let mut exclude: HashSet<String> = HashSet::new();
        exclude.insert(actor_domain.to_string());
        if let Some(object_domain) = object_id.and_then(url_domain) {
            exclude.insert(object_domain);
        }

        let snapshot = PolicySnapshot::load(&self.store).await?;
        let recipients =
            distill_recipients(self.store.get_inboxes().await?, &exclude, &snapshot);

        let queued = self.delivery.broadcast(announce, recipients).await?;
        tracing::debug!(queued, "Rebroadcast queued");
        Ok(())
    }

    /// Queue a handshake activity straight to one inbox
    async fn send_response(&self, inbox: &str, domain: &str, message: Value) -> Result<()> {
        self.delivery
            .enqueue(DeliveryJob {
                domain: domain.to_string(),
                inbox: inbox.to_string(),
                activity: Arc::new(message),
                attempt: 0,
                kind: JobKind::Response,
            })
            .await
    }
}

/// Whether the activity is an Announce made by the subscriber itself
///
/// Such activities pass through unwrapped; wrapping them again would
/// replace the subscriber's attribution with the relay's.
fn is_subscriber_announce(activity: &Activity, subscriber_actor: Option<&str>) -> bool {
    activity.kind == ActivityType::Announce && subscriber_actor == Some(activity.actor.as_str())
}

/// Whether the follower is an instance-level actor
///
/// Pleroma and Akkoma expose their relay actor as a Person; that shape
/// is allowed through.
fn is_instance_actor(actor: &Actor, software: Option<&str>) -> bool {
    if matches!(software, Some("pleroma" | "akkoma")) {
        if let Ok(domain) = actor.domain() {
            if actor.id == format!("https://{domain}/relay") {
                return true;
            }
        }
    }

    matches!(actor.kind.as_str(), "Application" | "Service")
}

fn type_label(kind: &ActivityType) -> &'static str {
    match kind {
        ActivityType::Follow => "Follow",
        ActivityType::Undo => "Undo",
        ActivityType::Accept => "Accept",
        ActivityType::Reject => "Reject",
        ActivityType::Create => "Create",
        ActivityType::Update => "Update",
        ActivityType::Delete => "Delete",
        ActivityType::Announce => "Announce",
        ActivityType::Move => "Move",
        ActivityType::Unknown(_) => "Unknown",
    }
}
