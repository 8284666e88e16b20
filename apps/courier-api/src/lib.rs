pub mod auth;
pub mod config;
pub mod delivery;
pub mod error;
pub mod gateway;
pub mod routes;
pub mod sanitize;

use std::sync::Arc;

use auth::identity::IdentityVerifier;
use config::Config;
use delivery::service::DeliveryService;
use delivery::store::NotificationStore;
use gateway::rate_limit::RateLimiter;
use gateway::registry::ConnectionRegistry;
use gateway::throttle::Throttler;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ConnectionRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub throttler: Arc<Throttler>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub store: Arc<dyn NotificationStore>,
    pub delivery: Arc<DeliveryService>,
}
