//! Toolbus: drive a fleet of subprocess tool servers over JSON-RPC 2.0.
//!
//! Each server is an external process speaking newline-delimited JSON-RPC
//! over stdio. Toolbus owns the subprocess lifecycle, correlates concurrent
//! requests to responses by id, watches every server's health, recovers
//! degraded servers under a backoff policy, and routes requests to the most
//! capable live server.
//!
//! ## Example
//!
//! ```rust,ignore
//! use toolbus::{ConnectionManager, FleetConfig, ServerConfig};
//!
//! let mut fleet = FleetConfig::default();
//! fleet.servers.insert(
//!     "echo".to_string(),
//!     ServerConfig::new("echo", "toolbus-echo").with_capabilities(vec!["testing".into()]),
//! );
//!
//! let manager = ConnectionManager::from_config(&fleet);
//! manager.start().await;
//! let result = manager.send_request("echo", "ping", None).await?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod health;
pub mod manager;
pub mod protocol;
pub mod registry;

pub use config::{FleetConfig, RecoveryPolicy, ServerConfig};
pub use connection::{Connection, ConnectionMetrics, ConnectionState};
pub use error::McpError;
pub use health::{
    AdvancedHealthMonitor, AlertSeverity, HealthAlert, HealthCheck, HealthMetrics, HealthMonitor,
    HealthStatus, RecoveryAction,
};
pub use manager::{ConnectionManager, ServerPool};
pub use protocol::{Message, Notification, Request, RequestId, Response, RpcError};
pub use registry::{CapabilityMatch, RoutingRule, ServerRegistry};
