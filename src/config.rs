//! Cluster configuration

use crate::supervisor::ClusterError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable that turns clustering on or off.
pub const ENABLE_CLUSTERING_ENV: &str = "ENABLE_CLUSTERING";
/// Environment variable overriding the worker count.
pub const CLUSTER_WORKERS_ENV: &str = "CLUSTER_WORKERS";
/// Environment variable naming the admin socket path.
pub const ADMIN_SOCKET_ENV: &str = "CLUSTER_ADMIN_SOCKET";

/// Settings for a supervised worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// When false the service runs in a single process without a supervisor.
    pub enabled: bool,
    /// Explicit worker count; `None` means one worker per CPU core.
    pub workers: Option<usize>,
    /// Period of the health-check / auto-heal loop.
    pub health_check_interval: Duration,
    /// Fixed delay before a crashed worker is replaced.
    pub replacement_delay: Duration,
    /// Upper bound on the graceful shutdown wait. `None` waits forever.
    pub shutdown_timeout: Option<Duration>,
    /// Unix socket for the admin surface, if any.
    pub admin_socket: Option<PathBuf>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: None,
            health_check_interval: Duration::from_secs(30),
            replacement_delay: Duration::from_secs(1),
            shutdown_timeout: None,
            admin_socket: None,
        }
    }
}

impl ClusterConfig {
    /// Reads overrides from the process environment.
    pub fn from_env() -> Result<Self, ClusterError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads overrides through `lookup`, starting from the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ClusterError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENABLE_CLUSTERING_ENV) {
            config.enabled = parse_flag(ENABLE_CLUSTERING_ENV, &raw)?;
        }

        if let Some(raw) = lookup(CLUSTER_WORKERS_ENV) {
            let raw = raw.trim();
            if !raw.is_empty() {
                let workers = raw.parse::<usize>().map_err(|_| {
                    ClusterError::InvalidConfig(format!(
                        "{} must be a positive integer, got '{}'",
                        CLUSTER_WORKERS_ENV, raw
                    ))
                })?;
                config.workers = Some(workers);
            }
        }

        if let Some(raw) = lookup(ADMIN_SOCKET_ENV) {
            if !raw.trim().is_empty() {
                config.admin_socket = Some(PathBuf::from(raw.trim()));
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Sets an explicit worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Enables or disables clustering.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the health-check period.
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Sets the crash replacement delay.
    pub fn with_replacement_delay(mut self, delay: Duration) -> Self {
        self.replacement_delay = delay;
        self
    }

    /// Bounds the graceful shutdown wait; stragglers are terminated at the deadline.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    /// Serves the admin surface on a Unix socket.
    pub fn with_admin_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.admin_socket = Some(path.into());
        self
    }

    /// Worker count the supervisor maintains: the override, else the CPU count.
    pub fn target_workers(&self) -> usize {
        self.workers.unwrap_or_else(available_cores)
    }

    /// Checks the settings for values the supervisor cannot honor.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.workers == Some(0) {
            return Err(ClusterError::InvalidConfig(
                "worker count must be at least 1".to_string(),
            ));
        }
        if self.health_check_interval.is_zero() {
            return Err(ClusterError::InvalidConfig(
                "health check interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Number of CPU cores available to this process.
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_flag(key: &str, raw: &str) -> Result<bool, ClusterError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ClusterError::InvalidConfig(format!(
            "{} must be true or false, got '{}'",
            key, other
        ))),
    }
}
