//! Common test utilities for the end-to-end tests
//!
//! Spawns a real relay on an ephemeral port plus stub remote instances
//! that serve actor documents and capture inbox deliveries.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use ap_relay::config::{
    CacheType, DatabaseType, FileConfig, PostgresConfig, RedisConfig,
};
use ap_relay::federation::Signer;
use ap_relay::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// A relay instance under test
pub struct TestRelay {
    pub state: AppState,
    pub addr: String,
    pub client: reqwest::Client,
    shutdown: watch::Sender<bool>,
    _temp_dir: TempDir,
}

impl TestRelay {
    /// Boot a relay with a scratch SQLite store and DB cache
    pub async fn spawn() -> Self {
        let temp_dir = TempDir::new().unwrap();

        let config = FileConfig {
            domain: "relay.example.com".to_string(),
            listen: "127.0.0.1".to_string(),
            port: 0,
            workers: 2,
            database_type: DatabaseType::Sqlite,
            sqlite_path: temp_dir.path().join("relay.sqlite3"),
            postgres: PostgresConfig::default(),
            cache_type: CacheType::Database,
            redis: RedisConfig::default(),
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (state, _delivery_handle) = AppState::new(config, shutdown_rx).await.unwrap();

        let app = ap_relay::build_router(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        Self {
            state,
            addr,
            client,
            shutdown,
            _temp_dir: temp_dir,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Create an admin user and mint a token for it
    pub async fn create_token(&self) -> String {
        self.state
            .store
            .put_user("admin", "test password", None)
            .await
            .unwrap();
        self.state.store.put_token("admin").await.unwrap().code
    }
}

struct RemoteState {
    actor_document: Value,
    received: Arc<Mutex<Vec<Value>>>,
    inbox_statuses: Arc<Mutex<VecDeque<u16>>>,
}

/// A stub follower instance: actor document plus a capturing inbox
pub struct RemoteInstance {
    pub domain: String,
    pub actor_iri: String,
    pub inbox_iri: String,
    pub signer: Signer,
    received: Arc<Mutex<Vec<Value>>>,
    inbox_statuses: Arc<Mutex<VecDeque<u16>>>,
}

impl RemoteInstance {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let domain = format!("127.0.0.1:{port}");
        let actor_iri = format!("http://{domain}/actor");
        let inbox_iri = format!("http://{domain}/inbox");

        let signer = Signer::generate(format!("{actor_iri}#main-key")).unwrap();
        let public_key_pem = signer.public_key_pem().unwrap();

        let actor_document = serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": actor_iri,
            "type": "Application",
            "preferredUsername": "relay",
            "inbox": inbox_iri,
            "endpoints": { "sharedInbox": inbox_iri },
            "publicKey": {
                "id": format!("{actor_iri}#main-key"),
                "owner": actor_iri,
                "publicKeyPem": public_key_pem
            }
        });

        let received = Arc::new(Mutex::new(Vec::new()));
        let inbox_statuses = Arc::new(Mutex::new(VecDeque::new()));

        let shared = Arc::new(RemoteState {
            actor_document,
            received: received.clone(),
            inbox_statuses: inbox_statuses.clone(),
        });

        let app = Router::new()
            .route("/actor", get(serve_actor))
            .route("/inbox", post(capture_inbox))
            .with_state(shared);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            domain,
            actor_iri,
            inbox_iri,
            signer,
            received,
            inbox_statuses,
        }
    }

    /// Everything the relay delivered to this instance so far
    pub fn deliveries(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    /// Script the next inbox response statuses (default is 202)
    pub fn script_inbox_statuses(&self, statuses: &[u16]) {
        let mut queue = self.inbox_statuses.lock().unwrap();
        queue.clear();
        queue.extend(statuses.iter().copied());
    }

    /// Wait until at least `count` deliveries arrived
    pub async fn wait_for_deliveries(&self, count: usize, timeout_ms: u64) -> Vec<Value> {
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);

        loop {
            let deliveries = self.deliveries();
            if deliveries.len() >= count {
                return deliveries;
            }
            if std::time::Instant::now() > deadline {
                return deliveries;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    /// POST a signed activity to the relay, as this instance's actor
    pub async fn post_activity(
        &self,
        client: &reqwest::Client,
        url: &str,
        activity: &Value,
    ) -> reqwest::Response {
        let body = activity.to_string().into_bytes();
        let signed = self
            .signer
            .sign_request("POST", url, Some(&body), Some("application/activity+json"))
            .unwrap();

        let mut request = client
            .post(url)
            .header("Content-Type", "application/activity+json")
            .header("Date", signed.date)
            .header("Signature", signed.signature);

        if let Some(digest) = signed.digest {
            request = request.header("Digest", digest);
        }

        request.body(body).send().await.unwrap()
    }

    /// A Follow of the relay actor from this instance
    pub fn follow_activity(&self, id: &str) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Follow",
            "id": id,
            "actor": self.actor_iri,
            "object": "https://relay.example.com/actor"
        })
    }

    /// A public Create from this instance
    pub fn create_activity(&self, id: &str) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Create",
            "id": id,
            "actor": self.actor_iri,
            "object": {
                "id": format!("{id}/object"),
                "type": "Note",
                "content": "hello fediverse"
            },
            "to": ["https://www.w3.org/ns/activitystreams#Public"]
        })
    }
}

async fn serve_actor(State(state): State<Arc<RemoteState>>) -> Json<Value> {
    Json(state.actor_document.clone())
}

async fn capture_inbox(
    State(state): State<Arc<RemoteState>>,
    body: Bytes,
) -> StatusCode {
    if let Ok(activity) = serde_json::from_slice::<Value>(&body) {
        state.received.lock().unwrap().push(activity);
    }

    let scripted = state.inbox_statuses.lock().unwrap().pop_front();
    match scripted {
        Some(status) => StatusCode::from_u16(status).unwrap_or(StatusCode::ACCEPTED),
        None => StatusCode::ACCEPTED,
    }
}

/// Subscribe a stub instance directly through the store
pub async fn subscribe(relay: &TestRelay, remote: &RemoteInstance, followid: &str) {
    relay
        .state
        .store
        .put_inbox(&ap_relay::data::InstanceUpsert {
            domain: remote.domain.clone(),
            actor: remote.actor_iri.clone(),
            inbox: remote.inbox_iri.clone(),
            followid: Some(followid.to_string()),
            software: None,
            accepted: true,
        })
        .await
        .unwrap();
}
