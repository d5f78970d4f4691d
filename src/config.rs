//! Engine configuration.
//!
//! Values come from the environment (`RUNLOOM_*`, loaded through dotenvy) or
//! from builder-style overrides. Everything has a usable default so
//! `EngineConfig::default()` is enough for tests and embedded use.

use std::time::Duration;

/// Tunables for the engine, scheduler, and event fanout.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Global cap on concurrent driver invocations across all runs.
    /// 0 means unlimited.
    pub max_parallelism: usize,
    /// Retry budget applied to task nodes that don't set their own.
    pub default_max_retries: u32,
    /// Base of the exponential retry backoff, in seconds.
    pub default_backoff_secs: f64,
    /// How long past a node's advisory timeout the scheduler waits before
    /// hard-cancelling the driver call.
    pub timeout_grace: Duration,
    /// How long the main loop sleeps when idle before re-checking readiness.
    pub poll_interval: Duration,
    /// Idle interval between heartbeat frames on event subscriptions.
    pub heartbeat_interval: Duration,
    /// Outbound frame buffer per subscriber; a subscriber that falls this far
    /// behind is dropped.
    pub subscriber_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 0,
            default_max_retries: 0,
            default_backoff_secs: 1.0,
            timeout_grace: Duration::from_secs(30),
            poll_interval: Duration::from_millis(200),
            heartbeat_interval: Duration::from_secs(10),
            subscriber_buffer: 256,
        }
    }
}

impl EngineConfig {
    /// Read overrides from the environment (and a `.env` file if present).
    ///
    /// Unparseable values fall back to the defaults rather than erroring;
    /// configuration problems should not take the engine down.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        if let Some(v) = env_parse::<usize>("RUNLOOM_MAX_PARALLELISM") {
            config.max_parallelism = v;
        }
        if let Some(v) = env_parse::<u32>("RUNLOOM_DEFAULT_MAX_RETRIES") {
            config.default_max_retries = v;
        }
        if let Some(v) = env_parse::<f64>("RUNLOOM_DEFAULT_BACKOFF_SECS") {
            config.default_backoff_secs = v;
        }
        if let Some(v) = env_parse::<u64>("RUNLOOM_HEARTBEAT_SECS") {
            config.heartbeat_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<usize>("RUNLOOM_SUBSCRIBER_BUFFER") {
            config.subscriber_buffer = v;
        }
        config
    }

    #[must_use]
    pub fn with_max_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism;
        self
    }

    #[must_use]
    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    #[must_use]
    pub fn with_default_backoff_secs(mut self, secs: f64) -> Self {
        self.default_backoff_secs = secs;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// Install a fmt tracing subscriber honoring `RUST_LOG`.
///
/// For binaries and tests embedding the engine; quietly does nothing when a
/// global subscriber is already set.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(target: "runloom::config", %key, %raw, "ignoring unparseable value");
            None
        }
    }
}
