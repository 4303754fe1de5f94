//! Fleet and per-server configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5
}

fn default_priority() -> u32 {
    1
}

fn default_health_interval() -> u64 {
    30
}

/// Configuration for a single tool server.
///
/// Immutable after registration except for the `enabled` flag, which the
/// manager and the recovery logic may flip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique server name
    pub name: String,
    /// Command to launch the server subprocess
    pub command: String,
    /// Command arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides merged over the process environment
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Per-call request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Reconnect attempts before the sweep gives up on this server
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between reconnect attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// Whether this server participates in connect/reconnect at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Routing preference; higher is preferred
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Declared capability labels used for routing
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl ServerConfig {
    /// Create a config with defaults for everything but name and command
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            enabled: true,
            priority: default_priority(),
            capabilities: Vec::new(),
        }
    }

    /// Set command arguments
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Add an environment override
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the per-call timeout
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Set the reconnect bounds used by the manager's health sweep
    pub fn with_retry(mut self, max_retries: u32, retry_delay_secs: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_secs = retry_delay_secs;
        self
    }

    /// Set the routing priority
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the declared capability labels
    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Per-call timeout as a `Duration`
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Reconnect delay as a `Duration`
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Top-level fleet configuration consumed by the manager at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Whether the fleet integration is enabled at all
    #[serde(default)]
    pub enabled: bool,
    /// Servers to manage, keyed by name
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
    /// Default request timeout for servers that don't set one
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,
    /// Interval of the manager's reconnect sweep in seconds
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
    /// Whether to connect enabled servers on startup
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    /// Recovery policy shared by the advanced health monitor
    #[serde(default)]
    pub recovery: RecoveryPolicy,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            servers: HashMap::new(),
            default_timeout_secs: default_timeout(),
            health_check_interval_secs: default_health_interval(),
            auto_connect: true,
            recovery: RecoveryPolicy::default(),
        }
    }
}

impl FleetConfig {
    /// Merge with another fleet config (other takes precedence)
    pub fn merge(&mut self, other: FleetConfig) {
        if other.enabled {
            self.enabled = true;
        }
        for (name, config) in other.servers {
            self.servers.insert(name, config);
        }
        if other.default_timeout_secs > 0 {
            self.default_timeout_secs = other.default_timeout_secs;
        }
        if other.health_check_interval_secs > 0 {
            self.health_check_interval_secs = other.health_check_interval_secs;
        }
        self.auto_connect = other.auto_connect;
        self.recovery = other.recovery;
    }

    /// Iterate over enabled servers
    pub fn enabled_servers(&self) -> impl Iterator<Item = (&String, &ServerConfig)> {
        self.servers.iter().filter(|(_, config)| config.enabled)
    }

    /// Get the effective timeout for a server
    pub fn get_timeout(&self, server_name: &str) -> u64 {
        self.servers
            .get(server_name)
            .map(|s| s.timeout_secs)
            .unwrap_or(self.default_timeout_secs)
    }

    /// Sweep interval as a `Duration`
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

/// Bounds and thresholds for degradation alerts and auto-recovery.
///
/// One policy governs both the advanced monitor's alert thresholds and its
/// recovery ladder; the base manager's reconnect sweep reads its bounds from
/// each `ServerConfig` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    /// Recovery attempts per server before giving up
    pub max_restart_attempts: u32,
    /// Minimum seconds between recovery attempts for one server
    pub restart_backoff_secs: u64,
    /// Consecutive check failures before an emergency alert
    pub max_consecutive_failures: u32,
    /// Response time above which a warning alert fires, in seconds
    pub response_time_threshold_secs: f64,
    /// Error rate above which a critical alert fires (0.0 - 1.0)
    pub error_rate_threshold: f64,
    /// Whether the recovery task acts on alerts at all
    pub auto_recovery_enabled: bool,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_restart_attempts: 3,
            restart_backoff_secs: 30,
            max_consecutive_failures: 5,
            response_time_threshold_secs: 10.0,
            error_rate_threshold: 0.3,
            auto_recovery_enabled: true,
        }
    }
}

impl RecoveryPolicy {
    /// Fewer attempts, longer backoff, no automatic action
    pub fn conservative() -> Self {
        Self {
            max_restart_attempts: 2,
            restart_backoff_secs: 60,
            max_consecutive_failures: 3,
            auto_recovery_enabled: false,
            ..Self::default()
        }
    }

    /// More attempts, shorter backoff, tighter latency threshold
    pub fn aggressive() -> Self {
        Self {
            max_restart_attempts: 5,
            restart_backoff_secs: 15,
            max_consecutive_failures: 10,
            response_time_threshold_secs: 5.0,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_defaults() {
        let config = ServerConfig::new("echo", "toolbus-echo");
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay_secs, 5);
        assert!(config.enabled);
        assert_eq!(config.priority, 1);
    }

    #[test]
    fn server_config_builders() {
        let config = ServerConfig::new("echo", "toolbus-echo")
            .with_args(vec!["--quiet".to_string()])
            .with_env("RUST_LOG", "debug")
            .with_timeout(2)
            .with_retry(1, 0)
            .with_capabilities(vec!["testing".to_string()]);
        assert_eq!(config.args, vec!["--quiet"]);
        assert_eq!(config.env.get("RUST_LOG"), Some(&"debug".to_string()));
        assert_eq!(config.timeout(), Duration::from_secs(2));
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.capabilities, vec!["testing"]);
    }

    #[test]
    fn fleet_config_merge() {
        let mut base = FleetConfig::default();
        let mut other = FleetConfig::default();
        other.enabled = true;
        other.default_timeout_secs = 60;
        other
            .servers
            .insert("echo".to_string(), ServerConfig::new("echo", "toolbus-echo"));

        base.merge(other);
        assert!(base.enabled);
        assert_eq!(base.default_timeout_secs, 60);
        assert!(base.servers.contains_key("echo"));
    }

    #[test]
    fn fleet_config_enabled_servers() {
        let mut config = FleetConfig::default();
        config
            .servers
            .insert("on".to_string(), ServerConfig::new("on", "true"));
        let mut off = ServerConfig::new("off", "true");
        off.enabled = false;
        config.servers.insert("off".to_string(), off);

        let enabled: Vec<_> = config.enabled_servers().collect();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].0, "on");
    }

    #[test]
    fn fleet_config_get_timeout() {
        let mut config = FleetConfig {
            default_timeout_secs: 30,
            ..FleetConfig::default()
        };
        config.servers.insert(
            "fast".to_string(),
            ServerConfig::new("fast", "true").with_timeout(2),
        );
        assert_eq!(config.get_timeout("fast"), 2);
        assert_eq!(config.get_timeout("missing"), 30);
    }

    #[test]
    fn recovery_policy_presets() {
        let policy = RecoveryPolicy::default();
        assert_eq!(policy.max_restart_attempts, 3);
        assert!(policy.auto_recovery_enabled);

        let conservative = RecoveryPolicy::conservative();
        assert!(!conservative.auto_recovery_enabled);
        assert_eq!(conservative.restart_backoff_secs, 60);

        let aggressive = RecoveryPolicy::aggressive();
        assert_eq!(aggressive.max_restart_attempts, 5);
        assert_eq!(aggressive.response_time_threshold_secs, 5.0);
    }
}
