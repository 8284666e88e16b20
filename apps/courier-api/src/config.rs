use std::time::Duration;

/// Courier API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Origin of the identity service that validates bearer credentials
    /// (e.g. `http://localhost:4001`).
    pub identity_url: String,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Suggested client heartbeat interval, advertised in READY (ms).
    pub heartbeat_interval_ms: u64,
    /// Connections silent longer than this are reclaimed by the sweep.
    pub stale_after: Duration,
    /// How often the stale-connection and rate-limit sweeps run.
    pub sweep_interval: Duration,
    /// Inbound rate limit: window length.
    pub rate_limit_window: Duration,
    /// Inbound rate limit: messages admitted per window per identity.
    pub rate_limit_ceiling: u32,
    /// Outbound throttle: deferred flush interval.
    pub throttle_interval: Duration,
    /// Outbound throttle: batch size that flushes immediately.
    pub throttle_max_batch: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            identity_url: required_var("IDENTITY_URL"),
            port: var_or("PORT", 4010),
            heartbeat_interval_ms: var_or("HEARTBEAT_INTERVAL_MS", 30_000),
            stale_after: Duration::from_secs(var_or("STALE_AFTER_SECS", 300)),
            sweep_interval: Duration::from_secs(var_or("SWEEP_INTERVAL_SECS", 60)),
            rate_limit_window: Duration::from_secs(var_or("RATE_LIMIT_WINDOW_SECS", 60)),
            rate_limit_ceiling: var_or("RATE_LIMIT_CEILING", 60),
            throttle_interval: Duration::from_millis(var_or("THROTTLE_INTERVAL_MS", 2000)),
            throttle_max_batch: var_or("THROTTLE_MAX_BATCH", 10),
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn var_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
