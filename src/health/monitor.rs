//! Base health monitor: pluggable checks and the status state machine

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::manager::ServerPool;
use crate::protocol::methods;

/// Default interval of the monitoring sweep
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Health status levels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Not yet observed
    #[default]
    Unknown,
    /// All checks passing
    Healthy,
    /// Most checks passing
    Warning,
    /// Most checks failing
    Critical,
    /// Absent from the live connection set
    Down,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Down => "down",
        };
        write!(f, "{}", name)
    }
}

/// Health metrics for one server, owned by the monitor
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthMetrics {
    /// Current status
    pub status: HealthStatus,
    /// Last measured round-trip time in seconds
    pub response_time: f64,
    /// Fraction of checks that passed in the most recent sweep
    pub success_rate: f64,
    /// Fraction of checks that failed in the most recent sweep
    pub error_rate: f64,
    /// Sweeps in a row with at least one failing check
    pub consecutive_failures: u32,
    /// When the server was last swept
    pub last_check: Option<DateTime<Utc>>,
    /// Most recent failure description
    pub last_error: Option<String>,
}

/// Outcome of one health check run
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    /// Whether the check passed
    pub passed: bool,
    /// Measured round-trip time, if the check performed one
    pub response_time: Option<f64>,
    /// Failure description
    pub error: Option<String>,
}

impl CheckOutcome {
    /// Passing outcome
    pub fn pass() -> Self {
        Self {
            passed: true,
            response_time: None,
            error: None,
        }
    }

    /// Passing outcome with a measured round trip
    pub fn pass_with_time(response_time: f64) -> Self {
        Self {
            passed: true,
            response_time: Some(response_time),
            error: None,
        }
    }

    /// Failing outcome
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            passed: false,
            response_time: None,
            error: Some(error.into()),
        }
    }
}

/// One pluggable health check with its own schedule
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Check name, used for the per-server schedule
    fn name(&self) -> &str;
    /// How often this check runs
    fn interval(&self) -> Duration;
    /// Time limit for one run; exceeding it counts as a failure
    fn timeout(&self) -> Duration;
    /// Whether the check participates in sweeps
    fn enabled(&self) -> bool {
        true
    }
    /// Run the check against one server
    async fn run(&self, server: &str, pool: &dyn ServerPool) -> CheckOutcome;
}

/// Delegates to the connection's own health verdict
pub struct ConnectivityCheck;

#[async_trait]
impl HealthCheck for ConnectivityCheck {
    fn name(&self) -> &str {
        "connectivity"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    async fn run(&self, server: &str, pool: &dyn ServerPool) -> CheckOutcome {
        if pool.is_server_healthy(server).await {
            CheckOutcome::pass()
        } else {
            CheckOutcome::fail("connection reports unhealthy")
        }
    }
}

/// Issues a lightweight round trip and fails above a latency threshold
pub struct ResponseTimeCheck {
    threshold_secs: f64,
}

impl ResponseTimeCheck {
    /// Create with a custom latency threshold
    pub fn with_threshold(threshold_secs: f64) -> Self {
        Self { threshold_secs }
    }
}

impl Default for ResponseTimeCheck {
    fn default() -> Self {
        Self {
            threshold_secs: 5.0,
        }
    }
}

#[async_trait]
impl HealthCheck for ResponseTimeCheck {
    fn name(&self) -> &str {
        "response_time"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(15)
    }

    async fn run(&self, server: &str, pool: &dyn ServerPool) -> CheckOutcome {
        let started = Instant::now();
        match pool.send_request(server, methods::PING, None).await {
            Ok(_) => {
                let elapsed = started.elapsed().as_secs_f64();
                if elapsed < self.threshold_secs {
                    CheckOutcome::pass_with_time(elapsed)
                } else {
                    CheckOutcome {
                        passed: false,
                        response_time: Some(elapsed),
                        error: Some(format!("round trip took {:.2}s", elapsed)),
                    }
                }
            }
            Err(e) => CheckOutcome::fail(e.to_string()),
        }
    }
}

/// Fails when the server currently reports an empty capability set
pub struct CapabilityCheck;

#[async_trait]
impl HealthCheck for CapabilityCheck {
    fn name(&self) -> &str {
        "capabilities"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(300)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(20)
    }

    async fn run(&self, server: &str, pool: &dyn ServerPool) -> CheckOutcome {
        match pool.server_capabilities(server).await {
            Some(capabilities) if !capabilities.is_empty() => CheckOutcome::pass(),
            _ => CheckOutcome::fail("server reports no capabilities"),
        }
    }
}

/// Alert callback invoked on a status transition
pub type StatusCallback = Box<dyn Fn(&str, HealthStatus, &str) + Send + Sync>;

/// Aggregate counts over all monitored servers
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSummary {
    /// Servers under monitoring
    pub total_servers: usize,
    /// Servers per status bucket
    pub healthy: usize,
    pub warning: usize,
    pub critical: usize,
    pub down: usize,
    pub unknown: usize,
}

pub(crate) struct MonitorInner {
    pool: Arc<dyn ServerPool>,
    checks: Vec<Arc<dyn HealthCheck>>,
    check_interval: Duration,
    health: RwLock<HashMap<String, HealthMetrics>>,
    last_run: Mutex<HashMap<(String, String), Instant>>,
    callbacks: Mutex<Vec<StatusCallback>>,
}

struct MonitorTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Health monitoring over a server pool
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
    task: Mutex<Option<MonitorTask>>,
}

impl HealthMonitor {
    /// Create a monitor with the built-in check set
    pub fn new(pool: Arc<dyn ServerPool>) -> Self {
        let checks: Vec<Arc<dyn HealthCheck>> = vec![
            Arc::new(ConnectivityCheck),
            Arc::new(ResponseTimeCheck::default()),
            Arc::new(CapabilityCheck),
        ];
        Self::with_checks(pool, checks)
    }

    /// Create a monitor with a custom check set
    pub fn with_checks(pool: Arc<dyn ServerPool>, checks: Vec<Arc<dyn HealthCheck>>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                pool,
                checks,
                check_interval: DEFAULT_CHECK_INTERVAL,
                health: RwLock::new(HashMap::new()),
                last_run: Mutex::new(HashMap::new()),
                callbacks: Mutex::new(Vec::new()),
            }),
            task: Mutex::new(None),
        }
    }

    /// Set the sweep interval
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        // Only possible before the monitor is shared; Arc::get_mut fails
        // once start_monitoring has cloned the inner state.
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.check_interval = interval;
        }
        self
    }

    /// Sweep interval currently in effect
    pub fn check_interval(&self) -> Duration {
        self.inner.check_interval
    }

    pub(crate) fn pool(&self) -> &Arc<dyn ServerPool> {
        &self.inner.pool
    }

    /// Add a server to monitoring before its first observation
    pub fn add_server(&self, name: &str) {
        let mut health = self.inner.health.write();
        if !health.contains_key(name) {
            info!("Added server to health monitoring: {}", name);
            health.insert(name.to_string(), HealthMetrics::default());
        }
    }

    /// Remove a server from monitoring
    pub fn remove_server(&self, name: &str) {
        if self.inner.health.write().remove(name).is_some() {
            info!("Removed server from health monitoring: {}", name);
        }
        self.inner.last_run.lock().retain(|(s, _), _| s != name);
    }

    /// Health metrics for one server
    pub fn server_health(&self, name: &str) -> Option<HealthMetrics> {
        self.inner.health.read().get(name).cloned()
    }

    /// Health metrics for every monitored server
    pub fn all_health(&self) -> HashMap<String, HealthMetrics> {
        self.inner.health.read().clone()
    }

    /// Register a callback fired on every status transition
    pub fn add_alert_callback(&self, callback: StatusCallback) {
        self.inner.callbacks.lock().push(callback);
    }

    /// Counts per status bucket
    pub fn health_summary(&self) -> HealthSummary {
        let health = self.inner.health.read();
        let mut summary = HealthSummary {
            total_servers: health.len(),
            ..HealthSummary::default()
        };
        for metrics in health.values() {
            match metrics.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Warning => summary.warning += 1,
                HealthStatus::Critical => summary.critical += 1,
                HealthStatus::Down => summary.down += 1,
                HealthStatus::Unknown => summary.unknown += 1,
            }
        }
        summary
    }

    pub(crate) fn reset_failures(&self, name: &str) {
        if let Some(metrics) = self.inner.health.write().get_mut(name) {
            metrics.consecutive_failures = 0;
        }
    }

    /// Run one sweep cycle over every known server
    pub async fn run_sweep(&self) {
        self.inner.run_sweep().await;
    }

    /// Start the periodic sweep task
    pub fn start_monitoring(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            warn!("Health monitoring already active");
            return;
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => inner.run_sweep().await,
                }
            }
        });
        *task = Some(MonitorTask {
            cancel,
            task: handle,
        });
        info!("Health monitoring started");
    }

    /// Stop the periodic sweep task
    pub async fn stop_monitoring(&self) {
        let task = { self.task.lock().take() };
        if let Some(task) = task {
            task.cancel.cancel();
            let _ = task.task.await;
            info!("Health monitoring stopped");
        }
    }
}

impl MonitorInner {
    async fn run_sweep(&self) {
        let live = self.pool.available_servers().await;

        // Servers appearing in the pool join monitoring on first sight.
        for name in self.pool.server_names().await {
            let mut health = self.health.write();
            health.entry(name).or_default();
        }

        let servers: Vec<String> = { self.health.read().keys().cloned().collect() };
        for server in servers {
            if !live.contains(&server) {
                self.mark_down(&server);
                continue;
            }
            self.check_server(&server).await;
        }
    }

    /// A server absent from the live set goes `Down` without running checks
    fn mark_down(&self, server: &str) {
        let old_status = {
            let mut health = self.health.write();
            let metrics = health.entry(server.to_string()).or_default();
            let old_status = metrics.status;
            metrics.status = HealthStatus::Down;
            metrics.last_error = Some("server not in live set".to_string());
            metrics.last_check = Some(Utc::now());
            old_status
        };
        if old_status != HealthStatus::Down {
            warn!("Server {} is down", server);
            self.fire_callbacks(server, HealthStatus::Down, "server not in live set");
        }
    }

    async fn check_server(&self, server: &str) {
        let now = Instant::now();
        let mut results: Vec<(String, CheckOutcome)> = Vec::new();

        for check in &self.checks {
            if !check.enabled() {
                continue;
            }
            let key = (server.to_string(), check.name().to_string());
            let due = {
                let last_run = self.last_run.lock();
                last_run
                    .get(&key)
                    .is_none_or(|last| now.duration_since(*last) >= check.interval())
            };
            if !due {
                continue;
            }
            self.last_run.lock().insert(key, now);

            let outcome =
                match tokio::time::timeout(check.timeout(), check.run(server, &*self.pool)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!("Health check '{}' timed out for {}", check.name(), server);
                        CheckOutcome::fail(format!("check '{}' timed out", check.name()))
                    }
                };
            results.push((check.name().to_string(), outcome));
        }

        if results.is_empty() {
            // Nothing was due this cycle.
            if let Some(metrics) = self.health.write().get_mut(server) {
                metrics.last_check = Some(Utc::now());
            }
            return;
        }
        self.apply_results(server, &results);
    }

    /// Fold check outcomes into the status transition rule: all passing is
    /// healthy and resets the failure streak; at least two thirds passing
    /// is a warning; below that is critical. Both degraded states extend
    /// the streak.
    fn apply_results(&self, server: &str, results: &[(String, CheckOutcome)]) {
        let total = results.len();
        let passed = results.iter().filter(|(_, o)| o.passed).count();
        let fraction = passed as f64 / total as f64;
        let response_time = results.iter().find_map(|(_, o)| o.response_time);
        let first_error = results
            .iter()
            .find(|(_, o)| !o.passed)
            .and_then(|(_, o)| o.error.clone());

        let (old_status, new_status) = {
            let mut health = self.health.write();
            let metrics = health.entry(server.to_string()).or_default();
            let old_status = metrics.status;
            let new_status = if passed == total {
                metrics.consecutive_failures = 0;
                HealthStatus::Healthy
            } else if passed * 3 >= total * 2 {
                metrics.consecutive_failures += 1;
                HealthStatus::Warning
            } else {
                metrics.consecutive_failures += 1;
                HealthStatus::Critical
            };
            metrics.status = new_status;
            metrics.success_rate = fraction;
            metrics.error_rate = 1.0 - fraction;
            if let Some(response_time) = response_time {
                metrics.response_time = response_time;
            }
            metrics.last_check = Some(Utc::now());
            metrics.last_error = if new_status == HealthStatus::Critical {
                first_error
            } else {
                None
            };
            (old_status, new_status)
        };

        if old_status != new_status {
            info!(
                "Server {} status changed: {} -> {}",
                server, old_status, new_status
            );
            let message = format!("health checks: {}/{} passed", passed, total);
            self.fire_callbacks(server, new_status, &message);
        }
    }

    fn fire_callbacks(&self, server: &str, status: HealthStatus, message: &str) {
        for callback in self.callbacks.lock().iter() {
            callback(server, status, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::testing::{StubPool, StubServer};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Check with a fixed outcome, for driving the state machine
    struct StaticCheck {
        name: &'static str,
        passed: bool,
    }

    #[async_trait]
    impl HealthCheck for StaticCheck {
        fn name(&self) -> &str {
            self.name
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(0)
        }

        fn timeout(&self) -> Duration {
            Duration::from_secs(1)
        }

        async fn run(&self, _server: &str, _pool: &dyn ServerPool) -> CheckOutcome {
            if self.passed {
                CheckOutcome::pass()
            } else {
                CheckOutcome::fail("forced failure")
            }
        }
    }

    fn monitor_with(pool: Arc<StubPool>, passing: usize, failing: usize) -> HealthMonitor {
        const NAMES: [&str; 3] = ["a", "b", "c"];
        let checks: Vec<Arc<dyn HealthCheck>> = NAMES
            .into_iter()
            .enumerate()
            .take(passing + failing)
            .map(|(i, name)| {
                Arc::new(StaticCheck {
                    name,
                    passed: i < passing,
                }) as Arc<dyn HealthCheck>
            })
            .collect();
        HealthMonitor::with_checks(pool, checks)
    }

    fn stub_pool() -> Arc<StubPool> {
        let pool = Arc::new(StubPool::new());
        pool.add("echo", StubServer::default());
        pool
    }

    #[tokio::test]
    async fn all_checks_passing_is_healthy_and_resets_streak() {
        let monitor = monitor_with(stub_pool(), 3, 0);
        monitor.run_sweep().await;
        let health = monitor.server_health("echo").unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.success_rate, 1.0);
    }

    #[tokio::test]
    async fn two_of_three_is_warning_with_streak() {
        let monitor = monitor_with(stub_pool(), 2, 1);
        monitor.run_sweep().await;
        let health = monitor.server_health("echo").unwrap();
        assert_eq!(health.status, HealthStatus::Warning);
        assert_eq!(health.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn one_of_three_is_critical_with_streak() {
        let monitor = monitor_with(stub_pool(), 1, 2);
        monitor.run_sweep().await;
        let health = monitor.server_health("echo").unwrap();
        assert_eq!(health.status, HealthStatus::Critical);
        assert_eq!(health.consecutive_failures, 1);
        assert!(health.last_error.is_some());
    }

    #[tokio::test]
    async fn absent_server_goes_down_without_checks() {
        let pool = stub_pool();
        let monitor = monitor_with(Arc::clone(&pool), 3, 0);
        monitor.run_sweep().await;
        assert_eq!(
            monitor.server_health("echo").unwrap().status,
            HealthStatus::Healthy
        );

        pool.set_live("echo", false);
        monitor.run_sweep().await;
        assert_eq!(
            monitor.server_health("echo").unwrap().status,
            HealthStatus::Down
        );
    }

    #[tokio::test]
    async fn callbacks_fire_only_on_status_change() {
        let monitor = monitor_with(stub_pool(), 3, 0);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        monitor.add_alert_callback(Box::new(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        monitor.run_sweep().await; // Unknown -> Healthy
        monitor.run_sweep().await; // still Healthy, no alert
        monitor.run_sweep().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connectivity_check_follows_pool_verdict() {
        let pool = stub_pool();
        let check = ConnectivityCheck;
        assert!(check.run("echo", &*pool).await.passed);
        pool.set_healthy("echo", false);
        assert!(!check.run("echo", &*pool).await.passed);
    }

    #[tokio::test]
    async fn capability_check_fails_on_empty_set() {
        let pool = stub_pool();
        pool.add(
            "bare",
            StubServer {
                capabilities: Default::default(),
                ..StubServer::default()
            },
        );
        let check = CapabilityCheck;
        assert!(check.run("echo", &*pool).await.passed);
        assert!(!check.run("bare", &*pool).await.passed);
        assert!(!check.run("ghost", &*pool).await.passed);
    }

    #[test]
    fn check_interval_is_configurable() {
        let monitor = HealthMonitor::with_checks(Arc::new(StubPool::new()), Vec::new())
            .with_check_interval(Duration::from_secs(5));
        assert_eq!(monitor.check_interval(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn summary_counts_statuses() {
        let pool = stub_pool();
        pool.add("gone", StubServer::default());
        pool.set_live("gone", false);
        let monitor = monitor_with(pool, 3, 0);
        monitor.run_sweep().await;

        let summary = monitor.health_summary();
        assert_eq!(summary.total_servers, 2);
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.down, 1);
    }
}
