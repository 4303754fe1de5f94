//! Connection manager: owns the named collection of connections, the
//! reconnect sweep, and the [`ServerPool`] seam consumed by the health
//! monitors and the registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{FleetConfig, ServerConfig};
use crate::connection::{Connection, ConnectionMetrics, ConnectionState};
use crate::error::McpError;
use crate::protocol::ServerCapabilities;

/// Default interval of the reconnect sweep
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Read-only view of a connection pool, the seam between the manager and
/// its observers (health monitors, registry) plus the mutations the
/// recovery ladder needs.
#[async_trait]
pub trait ServerPool: Send + Sync {
    /// Every configured server name
    async fn server_names(&self) -> Vec<String>;
    /// Names of servers currently connected
    async fn available_servers(&self) -> Vec<String>;
    /// Whether a server's connection currently reports healthy
    async fn is_server_healthy(&self, name: &str) -> bool;
    /// Send a request to a named server
    async fn send_request(
        &self,
        server: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, McpError>;
    /// Capabilities the server advertised at handshake
    async fn server_capabilities(&self, name: &str) -> Option<ServerCapabilities>;
    /// Connect (or reconnect) a named server
    async fn connect_server(&self, name: &str) -> Result<(), McpError>;
    /// Disconnect a named server
    async fn disconnect_server(&self, name: &str) -> Result<(), McpError>;
    /// Flip a server's `enabled` flag
    async fn set_server_enabled(&self, name: &str, enabled: bool) -> Result<(), McpError>;
}

struct SweepHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct ManagerInner {
    configs: tokio::sync::RwLock<HashMap<String, ServerConfig>>,
    connections: tokio::sync::RwLock<HashMap<String, Arc<Connection>>>,
    sweep_interval: Duration,
}

/// Manager for a named collection of tool-server connections
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
    sweep: Mutex<Option<SweepHandle>>,
}

impl ConnectionManager {
    /// Create an empty manager with the default sweep interval
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    /// Create an empty manager with a custom sweep interval
    pub fn with_sweep_interval(interval: Duration) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                configs: tokio::sync::RwLock::new(HashMap::new()),
                connections: tokio::sync::RwLock::new(HashMap::new()),
                sweep_interval: interval,
            }),
            sweep: Mutex::new(None),
        }
    }

    /// Create a manager pre-loaded with a fleet's server configs
    pub fn from_config(fleet: &FleetConfig) -> Self {
        let configs: HashMap<String, ServerConfig> = fleet
            .servers
            .iter()
            .map(|(name, config)| (name.clone(), config.clone()))
            .collect();
        Self {
            inner: Arc::new(ManagerInner {
                configs: tokio::sync::RwLock::new(configs),
                connections: tokio::sync::RwLock::new(HashMap::new()),
                sweep_interval: fleet.health_check_interval(),
            }),
            sweep: Mutex::new(None),
        }
    }

    /// Register a server configuration
    pub async fn add_server(&self, config: ServerConfig) {
        info!("Added server config: {}", config.name);
        self.inner
            .configs
            .write()
            .await
            .insert(config.name.clone(), config);
    }

    /// Remove a server: drop its config and disconnect it if connected
    pub async fn remove_server(&self, name: &str) {
        self.inner.configs.write().await.remove(name);
        let connection = self.inner.connections.write().await.remove(name);
        if let Some(connection) = connection {
            connection.disconnect().await;
        }
        info!("Removed server: {}", name);
    }

    /// Connect every enabled server sequentially, then launch the
    /// periodic reconnect sweep. Individual connect failures are logged;
    /// the sweep retries them.
    pub async fn start(&self) {
        info!("Starting connection manager");
        let mut names: Vec<String> = {
            let configs = self.inner.configs.read().await;
            configs
                .values()
                .filter(|c| c.enabled)
                .map(|c| c.name.clone())
                .collect()
        };
        names.sort();
        for name in names {
            if let Err(e) = self.connect_server(&name).await {
                error!("Failed to connect to server '{}': {}", name, e);
            }
        }
        self.spawn_sweep();
    }

    /// Cancel the sweep and disconnect every connection
    pub async fn stop(&self) {
        info!("Stopping connection manager");
        let sweep = { self.sweep.lock().take() };
        if let Some(sweep) = sweep {
            sweep.cancel.cancel();
            let _ = sweep.task.await;
        }
        let connections: Vec<Arc<Connection>> = {
            let mut map = self.inner.connections.write().await;
            map.drain().map(|(_, c)| c).collect()
        };
        for connection in connections {
            connection.disconnect().await;
        }
    }

    /// Connect a named server, creating its connection lazily. Idempotent:
    /// connecting a connected server is a no-op.
    pub async fn connect_server(&self, name: &str) -> Result<(), McpError> {
        let config = {
            self.inner.configs.read().await.get(name).cloned()
        }
        .ok_or_else(|| McpError::connection(format!("no configuration for server '{}'", name)))?;
        if !config.enabled {
            return Err(McpError::connection(format!(
                "server '{}' is disabled",
                name
            )));
        }
        let connection = {
            let mut connections = self.inner.connections.write().await;
            connections
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Connection::new(config)))
                .clone()
        };
        connection.connect().await
    }

    /// Disconnect a named server. Idempotent: unknown or already
    /// disconnected servers are a no-op.
    pub async fn disconnect_server(&self, name: &str) {
        let connection = { self.inner.connections.read().await.get(name).cloned() };
        if let Some(connection) = connection {
            connection.disconnect().await;
        }
    }

    /// Send a request to a named server
    pub async fn send_request(
        &self,
        server: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, McpError> {
        let connection = { self.inner.connections.read().await.get(server).cloned() }
            .ok_or_else(|| McpError::server_unavailable(server))?;
        connection.send_request(method, params).await
    }

    /// Names of currently connected servers, sorted
    pub async fn available_servers(&self) -> Vec<String> {
        let connections = self.inner.connections.read().await;
        let mut names: Vec<String> = connections
            .iter()
            .filter(|(_, c)| c.state() == ConnectionState::Connected)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Every configured server name, sorted
    pub async fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.configs.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Capabilities a server advertised at handshake
    pub async fn server_capabilities(&self, name: &str) -> Option<ServerCapabilities> {
        let connections = self.inner.connections.read().await;
        connections.get(name).map(|c| c.capabilities())
    }

    /// Current lifecycle state of a server's connection
    pub async fn server_state(&self, name: &str) -> Option<ConnectionState> {
        let connections = self.inner.connections.read().await;
        connections.get(name).map(|c| c.state())
    }

    /// Request metrics for one server
    pub async fn server_metrics(&self, name: &str) -> Option<ConnectionMetrics> {
        let connections = self.inner.connections.read().await;
        connections.get(name).map(|c| c.metrics())
    }

    /// Request metrics for every connection
    pub async fn all_metrics(&self) -> HashMap<String, ConnectionMetrics> {
        let connections = self.inner.connections.read().await;
        connections
            .iter()
            .map(|(name, c)| (name.clone(), c.metrics()))
            .collect()
    }

    /// Flip a server's `enabled` flag, the only config field that is
    /// mutable after registration
    pub async fn set_server_enabled(&self, name: &str, enabled: bool) -> Result<(), McpError> {
        let mut configs = self.inner.configs.write().await;
        let config = configs
            .get_mut(name)
            .ok_or_else(|| McpError::connection(format!("no configuration for server '{}'", name)))?;
        config.enabled = enabled;
        info!(
            "Server '{}' {}",
            name,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Run one reconnect sweep immediately instead of waiting for the
    /// periodic task
    pub async fn run_health_sweep(&self) {
        self.inner.sweep_unhealthy().await;
    }

    fn spawn_sweep(&self) {
        let mut sweep = self.sweep.lock();
        if sweep.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => inner.sweep_unhealthy().await,
                }
            }
        });
        *sweep = Some(SweepHandle { cancel, task });
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerInner {
    /// Reconnect enabled-but-unhealthy connections with bounded retries.
    /// Past a connection's retry limit it is left in `Error` until someone
    /// re-enables or reconnects it explicitly.
    async fn sweep_unhealthy(&self) {
        let connections: Vec<(String, Arc<Connection>)> = {
            self.connections
                .read()
                .await
                .iter()
                .map(|(name, c)| (name.clone(), c.clone()))
                .collect()
        };
        for (name, connection) in connections {
            let config = { self.configs.read().await.get(&name).cloned() };
            let Some(config) = config else { continue };
            if !config.enabled || connection.is_healthy().await {
                continue;
            }
            if connection.retry_count() >= config.max_retries {
                if connection.state() != ConnectionState::Error {
                    error!("Max retries exceeded for '{}', marking as failed", name);
                    connection.set_state(ConnectionState::Error);
                }
                continue;
            }
            let attempt = connection.record_retry();
            warn!(
                "Server '{}' is unhealthy, reconnecting (attempt {}/{})",
                name, attempt, config.max_retries
            );
            connection.set_state(ConnectionState::Reconnecting);
            tokio::time::sleep(config.retry_delay()).await;
            match connection.connect().await {
                Ok(()) => info!("Successfully reconnected to '{}'", name),
                Err(e) => error!("Failed to reconnect to '{}': {}", name, e),
            }
        }
    }
}

#[async_trait]
impl ServerPool for ConnectionManager {
    async fn server_names(&self) -> Vec<String> {
        ConnectionManager::server_names(self).await
    }

    async fn available_servers(&self) -> Vec<String> {
        ConnectionManager::available_servers(self).await
    }

    async fn is_server_healthy(&self, name: &str) -> bool {
        let connection = { self.inner.connections.read().await.get(name).cloned() };
        match connection {
            Some(connection) => connection.is_healthy().await,
            None => false,
        }
    }

    async fn send_request(
        &self,
        server: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, McpError> {
        ConnectionManager::send_request(self, server, method, params).await
    }

    async fn server_capabilities(&self, name: &str) -> Option<ServerCapabilities> {
        ConnectionManager::server_capabilities(self, name).await
    }

    async fn connect_server(&self, name: &str) -> Result<(), McpError> {
        ConnectionManager::connect_server(self, name).await
    }

    async fn disconnect_server(&self, name: &str) -> Result<(), McpError> {
        ConnectionManager::disconnect_server(self, name).await;
        Ok(())
    }

    async fn set_server_enabled(&self, name: &str, enabled: bool) -> Result<(), McpError> {
        ConnectionManager::set_server_enabled(self, name, enabled).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_unknown_server_fails() {
        let manager = ConnectionManager::new();
        let err = manager.connect_server("ghost").await.unwrap_err();
        assert!(matches!(err, McpError::Connection { .. }));
    }

    #[tokio::test]
    async fn connect_disabled_server_fails() {
        let manager = ConnectionManager::new();
        let mut config = ServerConfig::new("off", "true");
        config.enabled = false;
        manager.add_server(config).await;
        assert!(manager.connect_server("off").await.is_err());
    }

    #[tokio::test]
    async fn send_request_to_unknown_server_is_unavailable() {
        let manager = ConnectionManager::new();
        let err = manager
            .send_request("ghost", "ping", None)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ServerUnavailable { .. }));
    }

    #[tokio::test]
    async fn set_enabled_flips_config() {
        let manager = ConnectionManager::new();
        manager.add_server(ServerConfig::new("echo", "true")).await;
        manager.set_server_enabled("echo", false).await.unwrap();
        assert!(manager.connect_server("echo").await.is_err());
        manager.set_server_enabled("echo", true).await.unwrap();
        assert!(manager.set_server_enabled("ghost", true).await.is_err());
    }

    #[tokio::test]
    async fn disconnect_unknown_server_is_a_noop() {
        let manager = ConnectionManager::new();
        manager.disconnect_server("ghost").await;
        assert!(manager.available_servers().await.is_empty());
    }
}
