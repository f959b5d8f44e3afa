//! ap-relay - an ActivityPub federation relay
//!
//! Instances follow the relay actor; public activities from any follower
//! are rebroadcast to every other follower as signed `Announce`
//! deliveries with per-destination retries and policy enforcement.
//!
//! # Modules
//!
//! - `api`: HTTP handlers (ActivityPub, well-known, management API)
//! - `federation`: signatures, client, activity dispatch, fan-out engine
//! - `data`: SQL row store and KV cache
//! - `policy`: domain/software ban and whitelist evaluation
//! - `config`: file-level configuration
//! - `error`: error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod policy;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::FileConfig;
use crate::data::{build_cache, Cache, Store};
use crate::error::Result;
use crate::federation::{ActivityProcessor, Client, DedupRing, Delivery, Signer};

/// Inbound request bodies are rejected beyond this size
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// How often the cache sweep runs
const CACHE_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(900);

/// Application state shared across all handlers
///
/// Cloned per request; every field is a cheap handle.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<FileConfig>,
    pub store: Arc<Store>,
    pub cache: Arc<dyn Cache>,
    pub client: Arc<Client>,
    pub signer: Arc<Signer>,
    pub delivery: Delivery,
    pub processor: Arc<ActivityProcessor>,
    pub dedup: Arc<DedupRing>,
}

impl AppState {
    /// Initialize every component
    ///
    /// # Steps
    /// 1. Open the store and run migrations
    /// 2. Load or generate the relay keypair
    /// 3. Start the cache backend and its sweep task
    /// 4. Start the fan-out workers
    ///
    /// The returned join handle completes when the fan-out engine has
    /// drained after shutdown.
    pub async fn new(
        file_config: FileConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, JoinHandle<()>)> {
        let config = Arc::new(file_config);
        crate::metrics::init_metrics();

        // 1. store
        let store = Arc::new(Store::from_config(&config).await?);
        store.migrate().await?;
        tracing::info!("Store opened and migrated");

        // 2. signing key
        let relay_config = store.get_relay_config().await?;
        let signer = match &relay_config.private_key {
            Some(pem) => Arc::new(Signer::from_pem(pem, config.keyid())?),
            None => {
                tracing::info!("Generating relay keypair");
                let signer = Signer::generate(config.keyid())?;
                store
                    .put_config("private-key", &signer.private_key_pem()?)
                    .await?;
                Arc::new(signer)
            }
        };

        // 3. cache
        let cache = build_cache(&config, store.clone()).await?;
        spawn_cache_sweep(cache.clone(), shutdown.clone());
        tracing::info!("Cache started");

        // 4. outbound client and fan-out workers
        let client = Arc::new(Client::new(store.clone(), cache.clone(), signer.clone())?);
        let (delivery, delivery_handle) = Delivery::start(
            store.clone(),
            client.clone(),
            config.worker_count(),
            shutdown,
        );

        let processor = Arc::new(ActivityProcessor::new(
            config.domain.clone(),
            store.clone(),
            delivery.clone(),
        ));

        Ok((
            Self {
                config,
                store,
                cache,
                client,
                signer,
                delivery,
                processor,
                dedup: Arc::new(DedupRing::default()),
            },
            delivery_handle,
        ))
    }
}

fn spawn_cache_sweep(cache: Arc<dyn Cache>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CACHE_SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    if let Err(error) = cache.sweep().await {
                        tracing::warn!(%error, "Cache sweep failed");
                    }
                }
            }
        }
    });
}

/// Build the Axum router with all routes
///
/// Shared by the binary and the integration tests so route composition
/// stays consistent.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::extract::DefaultBodyLimit;
    use axum::Router;
    use tower_http::trace::TraceLayer;

    Router::new()
        .merge(api::activitypub_router())
        .merge(api::wellknown_router())
        .nest("/api/v1", api::v1_router())
        .merge(api::metrics_router())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
