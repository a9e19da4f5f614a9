//! Stegodon federation core
//!
//! # Modules
//!
//! - `api`: HTTP handlers for ActivityPub discovery/inbox/outbox and metrics
//! - `federation`: ActivityPub signature/resolver/inbox/outbox/delivery/relay
//! - `data`: the abstract object store (C3) and its SQLite implementation
//! - `clock`: the `Clock` collaborator the federation core is driven by
//! - `config`: configuration management
//! - `error`: error types

pub mod api;
pub mod clock;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::path::Path;
use std::sync::Arc;

use clock::{Clock, SystemClock};
use data::{SqliteStore, Store};
use error::AppError;
use federation::{ActorResolver, InboxProcessor, RateLimiter};

/// Application state shared across all handlers.
///
/// Cloned per request; every field is an `Arc`, matching the teacher's
/// `Arc<Database>`/`Arc<reqwest::Client>` sharing pattern.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::AppConfig>,
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub http_client: Arc<reqwest::Client>,
    pub resolver: Arc<ActorResolver>,
    pub inbox_processor: Arc<InboxProcessor>,
    /// Per-IP limiter applied to every request.
    pub rate_limiter_global: Arc<RateLimiter>,
    /// Tighter limiter applied additionally to ActivityPub endpoints
    /// (inbox, discovery), keyed by peer domain where derivable.
    pub rate_limiter_activitypub: Arc<RateLimiter>,
}

impl AppState {
    /// Initialize application state.
    ///
    /// # Steps
    /// 1. Connect to the SQLite store (runs migrations)
    /// 2. Build the shared HTTP client used for every outbound federation
    ///    request (fetches, WebFinger, delivery)
    /// 3. Construct the actor resolver and inbox pipeline
    /// 4. Construct the rate limiters
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, AppError> {
        tracing::info!("initializing application state");

        let store: Arc<dyn Store> = Arc::new(SqliteStore::connect(Path::new(&config.database.path)).await?);
        tracing::info!("federation store connected");

        let http_client = Arc::new(
            reqwest::Client::builder()
                .user_agent(concat!("Stegodon/", env!("CARGO_PKG_VERSION")))
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .map_err(|e| AppError::Internal(e.into()))?,
        );

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let resolver = Arc::new(ActorResolver::new(store.clone(), http_client.clone(), clock.clone()));
        let inbox_processor = Arc::new(InboxProcessor::new(
            store.clone(),
            resolver.clone(),
            clock.clone(),
            config.server.base_url(),
        ));

        let rate_limiter_global = Arc::new(RateLimiter::global());
        let rate_limiter_activitypub = Arc::new(RateLimiter::activitypub());

        tracing::info!("application state initialized");

        Ok(Self {
            config: Arc::new(config),
            store,
            clock,
            http_client,
            resolver,
            inbox_processor,
            rate_limiter_global,
            rate_limiter_activitypub,
        })
    }
}
