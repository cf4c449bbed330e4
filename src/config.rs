//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::jobs::model::JobStep;

/// Worker transport configuration.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// WebSocket URL of the scraper worker.
    pub url: String,
    /// Timeout for a single connection attempt.
    pub connect_timeout: Duration,
    /// First reconnect delay.
    pub initial_reconnect_delay: Duration,
    /// Multiplier applied per failed attempt.
    pub reconnect_multiplier: u32,
    /// Reconnect delay ceiling.
    pub max_reconnect_delay: Duration,
    /// Timeout for `search` calls.
    pub search_timeout: Duration,
    /// Timeout for `scrape` calls.
    pub scrape_timeout: Duration,
    /// Timeout for `pipeline.run_stage` calls.
    pub stage_timeout: Duration,
    /// Timeout for `health` calls.
    pub health_timeout: Duration,
}

impl RpcConfig {
    /// Reconnect delay for the given attempt number (0-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self.reconnect_multiplier.max(1).saturating_pow(attempt);
        self.initial_reconnect_delay
            .saturating_mul(factor)
            .min(self.max_reconnect_delay)
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8081/ws".to_string(),
            connect_timeout: Duration::from_secs(10),
            initial_reconnect_delay: Duration::from_secs(1),
            reconnect_multiplier: 2,
            max_reconnect_delay: Duration::from_secs(30),
            search_timeout: Duration::from_secs(60),
            scrape_timeout: Duration::from_secs(300),
            stage_timeout: Duration::from_secs(300),
            health_timeout: Duration::from_secs(10),
        }
    }
}

/// How long a job may sit in an active step without an update.
#[derive(Debug, Clone)]
pub struct JobTimeouts {
    pub searching: Duration,
    pub selecting: Duration,
    pub scraping: Duration,
    /// Window for the worker to acknowledge a dispatched call.
    pub ack: Duration,
}

impl JobTimeouts {
    /// Timeout for an active step. Terminal steps never time out.
    pub fn for_step(&self, step: JobStep) -> Option<Duration> {
        match step {
            JobStep::Searching => Some(self.searching),
            JobStep::Selecting => Some(self.selecting),
            JobStep::Scraping => Some(self.scraping),
            _ => None,
        }
    }
}

impl Default for JobTimeouts {
    fn default() -> Self {
        Self {
            searching: Duration::from_secs(3 * 60),
            selecting: Duration::from_secs(30 * 60),
            scraping: Duration::from_secs(5 * 60),
            ack: Duration::from_secs(30),
        }
    }
}

/// Background sweep configuration.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// How often the sweep runs.
    pub sweep_interval: Duration,
    /// How long terminal jobs are kept before deletion.
    pub retention: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// Service configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub rpc: RpcConfig,
    pub timeouts: JobTimeouts,
    pub lifecycle: LifecycleConfig,
    /// Path of the libSQL database file.
    pub db_path: String,
    /// Port for the HTTP API.
    pub http_port: u16,
    /// Initial connection attempts before giving up.
    pub connect_attempts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            rpc: RpcConfig::default(),
            timeouts: JobTimeouts::default(),
            lifecycle: LifecycleConfig::default(),
            db_path: "./data/scrape-jobs.db".to_string(),
            http_port: 8080,
            connect_attempts: 5,
        }
    }
}

impl OrchestratorConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = lookup("SCRAPER_WORKER_URL") {
            config.rpc.url = url;
        }
        if let Some(path) = lookup("SCRAPER_DB_PATH") {
            config.db_path = path;
        }
        if let Some(port) = parse_var(&lookup, "SCRAPER_HTTP_PORT")? {
            config.http_port = port;
        }
        if let Some(attempts) = parse_var(&lookup, "SCRAPER_CONNECT_ATTEMPTS")? {
            config.connect_attempts = attempts;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "SCRAPER_SWEEP_INTERVAL_SECS")? {
            config.lifecycle.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(hours) = parse_var::<u64>(&lookup, "SCRAPER_RETENTION_HOURS")? {
            config.lifecycle.retention = Duration::from_secs(hours * 3600);
        }

        Ok(config)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}
