use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use courier_api::auth::identity::{IdentityClient, IdentityVerifier};
use courier_api::config::Config;
use courier_api::delivery::service::DeliveryService;
use courier_api::delivery::store::{MemoryNotificationStore, NotificationStore};
use courier_api::gateway::rate_limit::RateLimiter;
use courier_api::gateway::registry::ConnectionRegistry;
use courier_api::gateway::throttle::{ThrottleConfig, Throttler};
use courier_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing — env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    let verifier: Arc<dyn IdentityVerifier> = Arc::new(IdentityClient::new(&config.identity_url));

    // In-memory store for single-node deployments. Replace with the
    // SQL-backed store when wired to the back office's persistence layer.
    let store: Arc<dyn NotificationStore> = Arc::new(MemoryNotificationStore::new());

    let registry = Arc::new(ConnectionRegistry::new(config.stale_after));
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit_window,
        config.rate_limit_ceiling,
    ));
    let throttler = Arc::new(Throttler::new(ThrottleConfig {
        interval: config.throttle_interval,
        max_batch: config.throttle_max_batch,
    }));
    let delivery = Arc::new(DeliveryService::new(
        Arc::clone(&registry),
        Arc::clone(&store),
    ));

    tracing::info!(identity_url = %config.identity_url, "courier-api configured");

    let state = AppState {
        config: Arc::new(config),
        registry: Arc::clone(&registry),
        limiter: Arc::clone(&limiter),
        throttler,
        verifier,
        store,
        delivery,
    };

    // Background sweeps: stale connections and expired rate-limit windows.
    {
        let registry = Arc::clone(&registry);
        let limiter = Arc::clone(&limiter);
        let interval = state.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // First tick fires immediately; skip it.
            loop {
                ticker.tick().await;
                let reclaimed = registry.cleanup_inactive();
                let swept = limiter.sweep_expired();
                if reclaimed > 0 || swept > 0 {
                    tracing::debug!(reclaimed, swept, "sweep completed");
                }
            }
        });
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(courier_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "courier-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app).await.expect("server error");
}
