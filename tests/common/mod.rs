//! Common test utilities for E2E tests

use std::sync::Arc;

use chrono::Utc;
use stegodon_federation::clock::{Clock, SystemClock};
use stegodon_federation::config;
use stegodon_federation::data::{Account, RemoteActor, RemoteActorUpsert, SqliteStore, Store};
use stegodon_federation::federation::{ActorResolver, InboxProcessor, RateLimiter};
use stegodon_federation::AppState;
use tempfile::TempDir;
use tokio::net::TcpListener;
use uuid::Uuid;

pub const TEST_PRIVATE_KEY: &str = include_str!("../fixtures/test_private_key.pem");
pub const TEST_PUBLIC_KEY: &str = include_str!("../fixtures/test_public_key.pem");

/// Test server instance: a real Axum server bound to a random local port,
/// backed by an in-memory SQLite store.
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

fn test_config(domain: &str) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain: domain.to_string(),
            protocol: "https".to_string(),
        },
        database: config::DatabaseConfig { path: "unused".into() },
        federation: config::FederationConfig { enabled: true },
        registration: config::RegistrationConfig { mode: config::RegistrationMode::Open },
        instance: config::InstanceConfig {
            title: "Test Instance".to_string(),
            description: "Test Stegodon instance".to_string(),
        },
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

impl TestServer {
    /// Create a new test server instance with federation enabled.
    pub async fn new() -> Self {
        Self::with_domain("test.example.com").await
    }

    pub async fn with_domain(domain: &str) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(domain);

        let store: Arc<dyn Store> = Arc::new(SqliteStore::connect_in_memory().await.unwrap());
        let http_client = Arc::new(reqwest::Client::builder().build().unwrap());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let resolver = Arc::new(ActorResolver::new(store.clone(), http_client.clone(), clock.clone()));
        let inbox_processor = Arc::new(InboxProcessor::new(
            store.clone(),
            resolver.clone(),
            clock.clone(),
            config.server.base_url(),
        ));

        let state = AppState {
            config: Arc::new(config),
            store,
            clock,
            http_client,
            resolver,
            inbox_processor,
            rate_limiter_global: Arc::new(RateLimiter::global()),
            rate_limiter_activitypub: Arc::new(RateLimiter::activitypub()),
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        let app = build_test_router(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        Self { addr: addr_str, state, _temp_dir: temp_dir, client }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Create a local account named `testuser`, signed with the shared test
    /// RSA keypair so peer-signed requests in tests can be verified against it.
    pub async fn create_test_account(&self) -> Account {
        self.create_account("testuser").await
    }

    /// Host:port this server is bound to, without the `http://` scheme —
    /// the value both sides of a signed test request must agree `host`
    /// resolves to.
    pub fn host_port(&self) -> &str {
        self.addr.trim_start_matches("http://")
    }

    /// Sign `body` as `key_id`/`private_key_pem` and POST it to `path`,
    /// with the `Host` header pinned to match what `sign_request` signed
    /// over (it strips the port; a mismatched client-sent `Host` header
    /// would fail verification for a reason unrelated to the test).
    pub async fn signed_post(
        &self,
        path: &str,
        body: &[u8],
        key_id: &str,
        private_key_pem: &str,
    ) -> reqwest::Response {
        use stegodon_federation::federation::sign_request;

        let host_only = self.host_port().split(':').next().unwrap();
        let url = format!("http://{}{}", self.host_port(), path);
        let signed = sign_request("POST", &url, Some(body), private_key_pem, key_id).unwrap();

        let mut request = self
            .client
            .post(&self.url(path))
            .header("host", host_only)
            .header("signature", &signed.signature)
            .header("date", &signed.date)
            .header("content-type", "application/activity+json")
            .body(body.to_vec());
        if let Some(digest) = &signed.digest {
            request = request.header("digest", digest);
        }

        request.send().await.unwrap()
    }

    pub async fn create_account(&self, username: &str) -> Account {
        let now = Utc::now();
        let account = Account {
            id: Uuid::new_v4(),
            username: username.to_string(),
            ssh_public_key_sha256: format!("SHA256:{username}-test-fingerprint"),
            created_at: now,
            display_name: Some(format!("{username} display")),
            summary: Some("Test bio".to_string()),
            avatar_url: None,
            signing_private_key: TEST_PRIVATE_KEY.to_string(),
            signing_public_key: TEST_PUBLIC_KEY.to_string(),
            is_admin: false,
            is_muted: false,
            is_banned: false,
            last_ip: None,
            first_time_login: false,
        };

        self.state.store.create_account(&account).await.unwrap();
        account
    }

    /// Register a cached remote actor keyed by the shared test RSA keypair,
    /// so inbox tests can send a validly-signed activity from it without
    /// an outbound actor fetch.
    pub async fn create_remote_actor(&self, username: &str, domain: &str) -> RemoteActor {
        let actor_uri = format!("https://{domain}/users/{username}");
        self.state
            .store
            .upsert_remote_actor(
                RemoteActorUpsert {
                    actor_uri: actor_uri.clone(),
                    username: username.to_string(),
                    domain: domain.to_string(),
                    display_name: Some(username.to_string()),
                    summary: None,
                    avatar_url: None,
                    inbox_uri: format!("{actor_uri}/inbox"),
                    shared_inbox_uri: Some(format!("https://{domain}/inbox")),
                    followers_uri: Some(format!("{actor_uri}/followers")),
                    public_key_id: format!("{actor_uri}#main-key"),
                    public_key_pem: TEST_PUBLIC_KEY.to_string(),
                },
                Utc::now(),
            )
            .await
            .unwrap()
    }
}

/// Build the same router `main.rs` builds, minus the CORS/compression
/// layers tests don't need to exercise.
fn build_test_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::cors::CorsLayer;

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(stegodon_federation::api::wellknown_router())
        .merge(stegodon_federation::api::activitypub_router())
        .layer(CorsLayer::permissive())
        .with_state(state)
        .merge(stegodon_federation::api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}
