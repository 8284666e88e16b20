//! Shared helpers for integration tests: build an AppState with a static
//! identity verifier and an in-memory notification store, and run a real
//! server on an ephemeral port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use courier_api::auth::identity::{Identity, IdentityVerifier, StaticVerifier};
use courier_api::config::Config;
use courier_api::delivery::service::DeliveryService;
use courier_api::delivery::store::{MemoryNotificationStore, NotificationStore};
use courier_api::gateway::rate_limit::RateLimiter;
use courier_api::gateway::registry::ConnectionRegistry;
use courier_api::gateway::throttle::{ThrottleConfig, Throttler};
use courier_api::AppState;

/// Credential the static verifier accepts for the primary test user.
pub const TEST_TOKEN: &str = "tok_alpha";
pub const TEST_USER_ID: &str = "usr_alpha";

/// A second valid credential, bound to a non-admin user.
pub const OTHER_TOKEN: &str = "tok_beta";
pub const OTHER_USER_ID: &str = "usr_beta";

pub fn test_config() -> Config {
    Config {
        identity_url: "http://identity.invalid".to_string(),
        port: 0,
        heartbeat_interval_ms: 30_000,
        stale_after: Duration::from_secs(300),
        sweep_interval: Duration::from_secs(60),
        rate_limit_window: Duration::from_secs(60),
        rate_limit_ceiling: 60,
        // Short enough that deferred chat flushes land within a test read.
        throttle_interval: Duration::from_millis(100),
        throttle_max_batch: 10,
    }
}

pub fn test_state_with_config(config: Config) -> (AppState, Arc<MemoryNotificationStore>) {
    let verifier: Arc<dyn IdentityVerifier> = Arc::new(
        StaticVerifier::new()
            .with_identity(
                TEST_TOKEN,
                Identity {
                    id: TEST_USER_ID.to_string(),
                    display_name: "Alpha".to_string(),
                    roles: vec!["admin".to_string()],
                },
            )
            .with_identity(
                OTHER_TOKEN,
                Identity {
                    id: OTHER_USER_ID.to_string(),
                    display_name: "Beta".to_string(),
                    roles: Vec::new(),
                },
            ),
    );

    let store = Arc::new(MemoryNotificationStore::new());
    let registry = Arc::new(ConnectionRegistry::new(config.stale_after));
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit_window,
        config.rate_limit_ceiling,
    ));
    let throttler = Arc::new(Throttler::new(ThrottleConfig {
        interval: config.throttle_interval,
        max_batch: config.throttle_max_batch,
    }));
    let delivery = Arc::new(
        DeliveryService::new(
            Arc::clone(&registry),
            Arc::clone(&store) as Arc<dyn NotificationStore>,
        )
        // Fast replay spacing so bootstrap tests stay quick.
        .with_replay(3, Duration::from_millis(100)),
    );

    let state = AppState {
        config: Arc::new(config),
        registry,
        limiter,
        throttler,
        verifier,
        store: Arc::clone(&store) as Arc<dyn NotificationStore>,
        delivery,
    };
    (state, store)
}

pub fn test_state() -> (AppState, Arc<MemoryNotificationStore>) {
    test_state_with_config(test_config())
}

/// Start an actual TCP server for WebSocket testing. Returns the bound
/// address; the server runs in the background.
pub async fn start_server(state: AppState) -> SocketAddr {
    let app = courier_api::routes::router().with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}
