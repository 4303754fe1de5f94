//! Health monitoring for the server fleet.
//!
//! [`HealthMonitor`] runs pluggable checks against each known server and
//! drives a per-server status state machine; [`AdvancedHealthMonitor`]
//! layers trend detection, severity-graded alerting, and a bounded
//! auto-recovery ladder on top of it.

pub mod advanced;
pub mod monitor;

pub use advanced::{
    AdvancedHealthMonitor, AlertSeverity, HealthAlert, RecoveryAction, RecoveryStatistics,
    TrendBuffers,
};
pub use monitor::{
    CapabilityCheck, CheckOutcome, ConnectivityCheck, HealthCheck, HealthMetrics, HealthMonitor,
    HealthStatus, HealthSummary, ResponseTimeCheck,
};
