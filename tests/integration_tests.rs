//! End-to-end tests against a real Redis using testcontainers.
//!
//! These tests spin up a Redis container, start the application on an
//! ephemeral port, and drive it over HTTP. They need a Docker daemon, so they
//! are ignored by default.
//!
//! Run with: `cargo test --test integration_tests -- --ignored`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage};
use tokio::time::sleep;

use gateway_admission::audit::ViolationAuditLog;
use gateway_admission::middleware::rate_limit::audit_key;
use gateway_admission::store::{CallBudget, RedisConfig};
use gateway_admission::{AppState, Config, RedisStore, SharedStore, build_router};

/// Redis container configuration
struct RedisContainer {
    port: u16,
}

impl RedisContainer {
    const IMAGE: &'static str = "redis";
    const TAG: &'static str = "7-alpine";
    const PORT: u16 = 6379;

    /// Start a Redis container and return the mapped port
    async fn start() -> (ContainerAsync<GenericImage>, Self) {
        let container = GenericImage::new(Self::IMAGE, Self::TAG)
            .with_exposed_port(Self::PORT.tcp())
            .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
            .start()
            .await
            .expect("Failed to start Redis container");

        let port = container
            .get_host_port_ipv4(Self::PORT)
            .await
            .expect("Failed to get Redis port");

        (container, Self { port })
    }

    fn redis_host(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}

/// Find an available port for the test server
fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to ephemeral port")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

/// Test fixture that manages the Redis container and app server
struct TestFixture {
    _redis_container: ContainerAsync<GenericImage>,
    store: Arc<RedisStore>,
    base_url: String,
    client: Client,
}

impl TestFixture {
    /// Create a fixture with the default test configuration
    async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a fixture, letting the test adjust the configuration first
    async fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let (redis_container, redis) = RedisContainer::start().await;

        let app_port = find_available_port();
        let base_url = format!("http://127.0.0.1:{app_port}");

        let mut config = Config {
            host: "127.0.0.1".to_string(),
            port: app_port,
            redis_host: redis.redis_host(),
            // Generous quota unless a test tightens it
            rate_limit_max_requests: 1000,
            log_level: "warn".to_string(),
            ..Config::default()
        };
        adjust(&mut config);

        let store = Arc::new(
            RedisStore::connect(&config.redis())
                .await
                .expect("Failed to connect to Redis"),
        );

        let (tx, mut rx) = tokio::sync::oneshot::channel::<Result<(), String>>();

        let server_store = store.clone();
        tokio::spawn(async move {
            if let Err(e) = Self::start_server(config, server_store).await {
                let _ = tx.send(Err(e));
            }
        });

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self::wait_for_server(&client, &base_url, &mut rx).await;

        Self {
            _redis_container: redis_container,
            store,
            base_url,
            client,
        }
    }

    /// Start the application server
    async fn start_server(config: Config, store: Arc<RedisStore>) -> Result<(), String> {
        let addr = config.server_addr();
        let state = AppState::new(store, config);
        let app = build_router(state).map_err(|e| format!("Failed to build router: {e}"))?;

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("Failed to bind server: {e}"))?;

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .map_err(|e| format!("Server failed: {e}"))?;

        Ok(())
    }

    /// Wait for the server to become ready
    async fn wait_for_server(
        client: &Client,
        base_url: &str,
        error_rx: &mut tokio::sync::oneshot::Receiver<Result<(), String>>,
    ) {
        let health_url = format!("{base_url}/health");
        let max_attempts = 60;

        for attempt in 1..=max_attempts {
            if let Ok(Err(e)) = error_rx.try_recv() {
                panic!("Server failed to start: {e}");
            }

            match client.get(&health_url).send().await {
                Ok(response) if response.status().is_success() => return,
                _ if attempt == max_attempts => {
                    panic!("Server failed to become healthy after {max_attempts} attempts")
                }
                _ => {}
            }
            sleep(Duration::from_millis(250)).await;
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn topup(&self, key: Option<&str>, body: &Value) -> reqwest::Response {
        let mut request = self.client.post(self.url("/topups")).json(body);
        if let Some(key) = key {
            request = request.header("Idempotency-Key", key);
        }
        request.send().await.expect("Top-up request failed")
    }
}

fn cache_header(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get("x-idempotent-cache")
        .map(|v| v.to_str().unwrap().to_string())
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_health_endpoint() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .client
        .get(fixture.url("/health"))
        .send()
        .await
        .expect("Health request failed");

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["store_reachable"], true);
}

// ============================================================================
// Idempotency
// ============================================================================

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_replay_returns_identical_receipt() {
    let fixture = TestFixture::new().await;
    let body = json!({ "account": "acct-7", "amount_cents": 2500 });

    let first = fixture.topup(Some("redis-replay"), &body).await;
    assert_eq!(first.status(), StatusCode::CREATED);
    assert_eq!(cache_header(&first).as_deref(), Some("MISS"));
    let first_bytes = first.bytes().await.unwrap();

    let replay = fixture.topup(Some("redis-replay"), &body).await;
    assert_eq!(replay.status(), StatusCode::CREATED);
    assert_eq!(cache_header(&replay).as_deref(), Some("HIT"));
    assert_eq!(
        replay.headers()["content-type"].to_str().unwrap(),
        "application/json"
    );
    assert_eq!(replay.bytes().await.unwrap(), first_bytes);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_concurrent_duplicates_execute_once() {
    let fixture = TestFixture::new().await;
    let body = json!({ "account": "acct-8", "amount_cents": 100 });

    let requests = (0..8).map(|_| fixture.topup(Some("redis-race"), &body));
    let responses = futures_util::future::join_all(requests).await;

    let mut receipts = Vec::new();
    for response in responses {
        if response.status() == StatusCode::CREATED {
            receipts.push(response.json::<Value>().await.unwrap());
        } else {
            assert_eq!(response.status(), StatusCode::CONFLICT);
        }
    }

    assert!(!receipts.is_empty());
    let topup_id = &receipts[0]["topup_id"];
    assert!(receipts.iter().all(|r| &r["topup_id"] == topup_id));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_record_is_stored_with_ttl() {
    let fixture = TestFixture::with_config(|c| c.idempotency_ttl = Duration::from_secs(2)).await;
    let body = json!({ "account": "acct-9", "amount_cents": 100 });

    fixture.topup(Some("short-lived"), &body).await;
    let replay = fixture.topup(Some("short-lived"), &body).await;
    assert_eq!(cache_header(&replay).as_deref(), Some("HIT"));

    sleep(Duration::from_millis(2500)).await;
    let after = fixture.topup(Some("short-lived"), &body).await;
    assert_eq!(cache_header(&after).as_deref(), Some("MISS"));
}

// ============================================================================
// Rate Limiting
// ============================================================================

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_rate_limit_and_violation_log() {
    let fixture = TestFixture::with_config(|c| c.rate_limit_max_requests = 2).await;
    let body = json!({ "account": "acct-1", "amount_cents": 100 });

    for _ in 0..2 {
        assert_eq!(fixture.topup(None, &body).await.status(), StatusCode::CREATED);
    }

    let denied = fixture.topup(None, &body).await;
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(denied.headers()["retry-after"].to_str().unwrap(), "60");
    assert_eq!(denied.headers()["x-ratelimit-limit"].to_str().unwrap(), "2");
    assert_eq!(denied.text().await.unwrap(), "Too many requests");

    let entries = ViolationAuditLog::new(fixture.store.clone())
        .recent(
            &audit_key("topup", "127.0.0.1"),
            &CallBudget::new(Duration::from_secs(1)),
        )
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].path, "/topups");
    assert_eq!(entries[0].ip, "127.0.0.1");
    assert_eq!(
        serde_json::from_str::<Value>(&entries[0].body).unwrap(),
        body
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_forwarded_identities_are_limited_separately() {
    let fixture = TestFixture::with_config(|c| c.rate_limit_max_requests = 1).await;
    let body = json!({ "account": "acct-1", "amount_cents": 100 });

    for ip in ["198.51.100.1", "198.51.100.2"] {
        let response = fixture
            .client
            .post(fixture.url("/topups"))
            .header("X-Forwarded-For", ip)
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = fixture
        .client
        .post(fixture.url("/topups"))
        .header("X-Forwarded-For", "198.51.100.1")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_window_resets_after_expiry() {
    let fixture = TestFixture::with_config(|c| {
        c.rate_limit_max_requests = 1;
        c.rate_limit_window = Duration::from_secs(1);
    })
    .await;
    let body = json!({ "account": "acct-1", "amount_cents": 100 });

    assert_eq!(fixture.topup(None, &body).await.status(), StatusCode::CREATED);
    assert_eq!(
        fixture.topup(None, &body).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    sleep(Duration::from_millis(1500)).await;
    assert_eq!(fixture.topup(None, &body).await.status(), StatusCode::CREATED);
}

// ============================================================================
// Store Primitives
// ============================================================================

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_store_conditional_operations() {
    let (_container, redis) = RedisContainer::start().await;
    let store = RedisStore::connect(&RedisConfig {
        host: redis.redis_host(),
        ..RedisConfig::default()
    })
    .await
    .unwrap();
    let ttl = Duration::from_secs(30);

    assert!(store.set_if_absent("k", b"mine", ttl).await.unwrap());
    assert!(!store.set_if_absent("k", b"theirs", ttl).await.unwrap());

    assert!(!store.delete_if_equal("k", b"theirs").await.unwrap());
    assert_eq!(store.get("k").await.unwrap().as_deref(), Some(&b"mine"[..]));

    assert!(store.delete_if_equal("k", b"mine").await.unwrap());
    assert_eq!(store.get("k").await.unwrap(), None);

    assert_eq!(store.increment("n").await.unwrap(), 1);
    assert_eq!(store.increment("n").await.unwrap(), 2);
    assert!(store.expire("n", ttl).await.unwrap());
    assert!(!store.expire("missing", ttl).await.unwrap());

    let window = Duration::from_secs(60);
    assert_eq!(store.increment_in_window("w", window).await.unwrap(), 1);
    assert_eq!(store.increment_in_window("w", window).await.unwrap(), 2);
    // A counter that lost its expiry is given one again
    assert_eq!(store.increment("orphan").await.unwrap(), 1);
    assert_eq!(store.increment_in_window("orphan", window).await.unwrap(), 2);

    store.ping().await.unwrap();
}
