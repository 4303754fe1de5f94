//! Advanced health monitoring: rolling history, trend detection,
//! severity-graded alerts, and a bounded auto-recovery ladder.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RecoveryPolicy;
use crate::health::monitor::{HealthMetrics, HealthMonitor, HealthStatus};
use crate::manager::ServerPool;

/// Samples kept per trend buffer
const TREND_POINTS: usize = 10;
/// Window in which alerts of the same (server, severity) are collapsed
const ALERT_DEDUP_WINDOW_MINS: i64 = 5;
/// How long resolved alerts and history entries are retained
const RETENTION_HOURS: i64 = 24;
/// Period of the predictive trend-analysis task
const PREDICTIVE_PERIOD: Duration = Duration::from_secs(300);
/// Period of the recovery task
const RECOVERY_PERIOD: Duration = Duration::from_secs(60);
/// Pause between disconnect and reconnect in a restart
const RESTART_PAUSE: Duration = Duration::from_secs(2);

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Emergency => "emergency",
        };
        write!(f, "{}", name)
    }
}

/// Recovery actions, attempted in the order an alert lists them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryAction {
    /// Plain reconnect attempt
    Reconnect,
    /// Disconnect, short pause, reconnect
    Restart,
    /// Disconnect and flip the server's enabled flag off
    Disable,
    /// Raise an emergency alert for human intervention
    Escalate,
    /// Succeed without acting
    Ignore,
}

/// A health alert raised by the advanced monitor
#[derive(Debug, Clone, Serialize)]
pub struct HealthAlert {
    /// Affected server
    pub server: String,
    /// Severity grade
    pub severity: AlertSeverity,
    /// Human-readable condition description
    pub message: String,
    /// When the alert was raised
    pub timestamp: DateTime<Utc>,
    /// Candidate recovery actions in preference order
    pub actions: Vec<RecoveryAction>,
    /// Whether an operator acknowledged the alert
    pub acknowledged: bool,
    /// Whether recovery resolved the alert
    pub resolved: bool,
    /// When the alert was resolved
    pub resolved_at: Option<DateTime<Utc>>,
}

impl HealthAlert {
    fn new(
        server: &str,
        severity: AlertSeverity,
        message: String,
        actions: Vec<RecoveryAction>,
    ) -> Self {
        Self {
            server: server.to_string(),
            severity,
            message,
            timestamp: Utc::now(),
            actions,
            acknowledged: false,
            resolved: false,
            resolved_at: None,
        }
    }
}

/// Rolling per-server trend buffers
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrendBuffers {
    /// Recent round-trip times in seconds
    pub response_times: VecDeque<f64>,
    /// Recent check success rates
    pub success_rates: VecDeque<f64>,
    /// Recent check error rates
    pub error_rates: VecDeque<f64>,
}

impl TrendBuffers {
    fn push(&mut self, response_time: f64, success_rate: f64, error_rate: f64) {
        push_capped(&mut self.response_times, response_time);
        push_capped(&mut self.success_rates, success_rate);
        push_capped(&mut self.error_rates, error_rate);
    }
}

fn push_capped(buffer: &mut VecDeque<f64>, value: f64) {
    buffer.push_back(value);
    while buffer.len() > TREND_POINTS {
        buffer.pop_front();
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Recovery bookkeeping exposed for operators
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStatistics {
    /// Alerts raised so far
    pub total_alerts: usize,
    /// Alerts recovery managed to resolve
    pub resolved_alerts: usize,
    /// Resolved fraction
    pub resolution_rate: f64,
    /// Recovery attempts per server
    pub attempts: HashMap<String, u32>,
    /// Servers with a recovery currently running
    pub servers_in_recovery: Vec<String>,
}

/// Sink invoked synchronously whenever an alert is created
pub type AlertSink = Box<dyn Fn(&HealthAlert) + Send + Sync>;

struct AdvancedInner {
    base: HealthMonitor,
    policy: RecoveryPolicy,
    history: Mutex<HashMap<String, Vec<(DateTime<Utc>, HealthMetrics)>>>,
    trends: Mutex<HashMap<String, TrendBuffers>>,
    alerts: Mutex<Vec<HealthAlert>>,
    sinks: Mutex<Vec<AlertSink>>,
    recovery_attempts: Mutex<HashMap<String, u32>>,
    in_recovery: Mutex<HashSet<String>>,
    last_attempt: Mutex<HashMap<String, DateTime<Utc>>>,
}

/// Health monitor with degradation trends, alerting, and auto-recovery.
/// Wraps [`HealthMonitor`]: its sweep drives the base sweep, then layers
/// the extensions on the base monitor's observations.
pub struct AdvancedHealthMonitor {
    inner: Arc<AdvancedInner>,
    tasks: Mutex<Vec<(CancellationToken, JoinHandle<()>)>>,
}

impl AdvancedHealthMonitor {
    /// Create with the built-in check set and the given policy
    pub fn new(pool: Arc<dyn ServerPool>, policy: RecoveryPolicy) -> Self {
        Self::with_monitor(HealthMonitor::new(pool), policy)
    }

    /// Create around an existing base monitor
    pub fn with_monitor(base: HealthMonitor, policy: RecoveryPolicy) -> Self {
        Self {
            inner: Arc::new(AdvancedInner {
                base,
                policy,
                history: Mutex::new(HashMap::new()),
                trends: Mutex::new(HashMap::new()),
                alerts: Mutex::new(Vec::new()),
                sinks: Mutex::new(Vec::new()),
                recovery_attempts: Mutex::new(HashMap::new()),
                in_recovery: Mutex::new(HashSet::new()),
                last_attempt: Mutex::new(HashMap::new()),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The wrapped base monitor
    pub fn base(&self) -> &HealthMonitor {
        &self.inner.base
    }

    /// Register a sink invoked on every new alert
    pub fn add_alert_sink(&self, sink: AlertSink) {
        self.inner.sinks.lock().push(sink);
    }

    /// Alerts filtered by severity and resolution state, newest first
    pub fn alerts(&self, severity: Option<AlertSeverity>, resolved: bool) -> Vec<HealthAlert> {
        let mut alerts: Vec<HealthAlert> = self
            .inner
            .alerts
            .lock()
            .iter()
            .filter(|a| a.resolved == resolved)
            .filter(|a| severity.is_none_or(|s| a.severity == s))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        alerts
    }

    /// Acknowledge an alert by its position in the store
    pub fn acknowledge_alert(&self, index: usize) -> bool {
        let mut alerts = self.inner.alerts.lock();
        match alerts.get_mut(index) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    /// Trend buffers for one server
    pub fn trends(&self, server: &str) -> Option<TrendBuffers> {
        self.inner.trends.lock().get(server).cloned()
    }

    /// Recovery bookkeeping snapshot
    pub fn recovery_statistics(&self) -> RecoveryStatistics {
        let alerts = self.inner.alerts.lock();
        let total_alerts = alerts.len();
        let resolved_alerts = alerts.iter().filter(|a| a.resolved).count();
        RecoveryStatistics {
            total_alerts,
            resolved_alerts,
            resolution_rate: if total_alerts == 0 {
                0.0
            } else {
                resolved_alerts as f64 / total_alerts as f64
            },
            attempts: self.inner.recovery_attempts.lock().clone(),
            servers_in_recovery: self.inner.in_recovery.lock().iter().cloned().collect(),
        }
    }

    /// Run one enhanced sweep: the base sweep, then history, trends, and
    /// alert conditions
    pub async fn run_sweep(&self) {
        self.inner.run_sweep().await;
    }

    /// Run one predictive trend analysis pass
    pub async fn run_predictive_analysis(&self) {
        self.inner.analyze_trends();
    }

    /// Run one recovery pass over unresolved critical/emergency alerts
    pub async fn run_recovery_pass(&self) {
        self.inner.run_recovery_pass().await;
    }

    /// Start the sweep, predictive, and recovery tasks
    pub fn start_monitoring(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("Advanced health monitoring already active");
            return;
        }

        let sweep_interval = self.inner.base.check_interval();
        tasks.push(spawn_periodic(
            Arc::clone(&self.inner),
            sweep_interval,
            PeriodicTask::Sweep,
        ));
        tasks.push(spawn_periodic(
            Arc::clone(&self.inner),
            PREDICTIVE_PERIOD,
            PeriodicTask::Predictive,
        ));
        tasks.push(spawn_periodic(
            Arc::clone(&self.inner),
            RECOVERY_PERIOD,
            PeriodicTask::Recovery,
        ));
        info!("Advanced health monitoring started");
    }

    /// Stop all monitoring tasks
    pub async fn stop_monitoring(&self) {
        let tasks: Vec<(CancellationToken, JoinHandle<()>)> =
            { self.tasks.lock().drain(..).collect() };
        if tasks.is_empty() {
            return;
        }
        for (cancel, _) in &tasks {
            cancel.cancel();
        }
        for (_, task) in tasks {
            let _ = task.await;
        }
        info!("Advanced health monitoring stopped");
    }
}

#[derive(Clone, Copy)]
enum PeriodicTask {
    Sweep,
    Predictive,
    Recovery,
}

fn spawn_periodic(
    inner: Arc<AdvancedInner>,
    period: Duration,
    kind: PeriodicTask,
) -> (CancellationToken, JoinHandle<()>) {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => match kind {
                    PeriodicTask::Sweep => inner.run_sweep().await,
                    PeriodicTask::Predictive => inner.analyze_trends(),
                    PeriodicTask::Recovery => inner.run_recovery_pass().await,
                },
            }
        }
    });
    (cancel, task)
}

impl AdvancedInner {
    async fn run_sweep(&self) {
        self.base.run_sweep().await;

        for (server, metrics) in self.base.all_health() {
            self.record_history(&server, &metrics);
            self.record_trends(&server, &metrics);
            self.raise_condition_alerts(&server, &metrics);
        }
        self.prune_resolved_alerts();
    }

    fn record_history(&self, server: &str, metrics: &HealthMetrics) {
        let cutoff = Utc::now() - chrono::Duration::hours(RETENTION_HOURS);
        let mut history = self.history.lock();
        let entries = history.entry(server.to_string()).or_default();
        entries.push((Utc::now(), metrics.clone()));
        entries.retain(|(timestamp, _)| *timestamp > cutoff);
    }

    fn record_trends(&self, server: &str, metrics: &HealthMetrics) {
        let mut trends = self.trends.lock();
        trends.entry(server.to_string()).or_default().push(
            metrics.response_time,
            metrics.success_rate,
            metrics.error_rate,
        );
    }

    /// Each condition is independently raisable per sweep
    fn raise_condition_alerts(&self, server: &str, metrics: &HealthMetrics) {
        if metrics.status == HealthStatus::Critical {
            self.raise_alert(HealthAlert::new(
                server,
                AlertSeverity::Critical,
                format!("server {} is in critical state", server),
                vec![RecoveryAction::Restart, RecoveryAction::Reconnect],
            ));
        }
        if metrics.response_time > self.policy.response_time_threshold_secs {
            self.raise_alert(HealthAlert::new(
                server,
                AlertSeverity::Warning,
                format!("high response time: {:.2}s", metrics.response_time),
                vec![RecoveryAction::Restart],
            ));
        }
        if metrics.error_rate > self.policy.error_rate_threshold {
            self.raise_alert(HealthAlert::new(
                server,
                AlertSeverity::Critical,
                format!("high error rate: {:.0}%", metrics.error_rate * 100.0),
                vec![RecoveryAction::Restart, RecoveryAction::Disable],
            ));
        }
        if metrics.consecutive_failures > self.policy.max_consecutive_failures {
            self.raise_alert(HealthAlert::new(
                server,
                AlertSeverity::Emergency,
                format!("{} consecutive failures", metrics.consecutive_failures),
                vec![RecoveryAction::Disable, RecoveryAction::Escalate],
            ));
        }
    }

    /// Store an alert unless an unresolved one of the same (server,
    /// severity) exists inside the dedup window, then notify sinks.
    fn raise_alert(&self, alert: HealthAlert) {
        {
            let mut alerts = self.alerts.lock();
            let duplicate = alerts.iter().any(|existing| {
                existing.server == alert.server
                    && existing.severity == alert.severity
                    && !existing.resolved
                    && alert.timestamp - existing.timestamp
                        < chrono::Duration::minutes(ALERT_DEDUP_WINDOW_MINS)
            });
            if duplicate {
                return;
            }
            alerts.push(alert.clone());
        }
        warn!(
            "Health alert [{}] {}: {}",
            alert.severity, alert.server, alert.message
        );
        self.notify_sinks(&alert);
    }

    /// Escalations bypass deduplication so every hand-off to a human is
    /// recorded.
    fn append_alert_unchecked(&self, alert: HealthAlert) {
        self.alerts.lock().push(alert.clone());
        error!("Escalated: {} ({})", alert.message, alert.server);
        self.notify_sinks(&alert);
    }

    fn notify_sinks(&self, alert: &HealthAlert) {
        for sink in self.sinks.lock().iter() {
            sink(alert);
        }
    }

    fn prune_resolved_alerts(&self) {
        let cutoff = Utc::now() - chrono::Duration::hours(RETENTION_HOURS);
        self.alerts
            .lock()
            .retain(|alert| !alert.resolved || alert.resolved_at.is_none_or(|at| at > cutoff));
    }

    /// Compare the mean of the most recent trend samples against the
    /// previous window and raise alerts for degrading servers.
    fn analyze_trends(&self) {
        let snapshot: Vec<(String, TrendBuffers)> = {
            self.trends
                .lock()
                .iter()
                .map(|(server, buffers)| (server.clone(), buffers.clone()))
                .collect()
        };

        for (server, buffers) in snapshot {
            let response_times: Vec<f64> = buffers.response_times.iter().copied().collect();
            if response_times.len() >= 6 {
                let recent = mean(&response_times[response_times.len() - 3..]);
                let older =
                    mean(&response_times[response_times.len() - 6..response_times.len() - 3]);
                if older > 0.0 && recent >= older * 1.5 {
                    self.raise_alert(HealthAlert::new(
                        &server,
                        AlertSeverity::Warning,
                        format!(
                            "response time trending up: {:.2}s over {:.2}s",
                            recent, older
                        ),
                        vec![RecoveryAction::Restart],
                    ));
                }
            }

            let success_rates: Vec<f64> = buffers.success_rates.iter().copied().collect();
            if success_rates.len() >= 5 {
                let recent = mean(&success_rates[success_rates.len() - 3..]);
                if recent < 0.8 {
                    self.raise_alert(HealthAlert::new(
                        &server,
                        AlertSeverity::Critical,
                        format!("success rate trending low: {:.0}%", recent * 100.0),
                        vec![RecoveryAction::Restart, RecoveryAction::Reconnect],
                    ));
                }
            }
        }
    }

    /// Walk unresolved critical/emergency alerts and attempt recovery for
    /// each affected server, bounded by the attempt cap and the backoff
    /// window.
    async fn run_recovery_pass(&self) {
        if !self.policy.auto_recovery_enabled {
            return;
        }
        let candidates: Vec<HealthAlert> = {
            self.alerts
                .lock()
                .iter()
                .filter(|a| {
                    matches!(
                        a.severity,
                        AlertSeverity::Critical | AlertSeverity::Emergency
                    ) && !a.acknowledged
                        && !a.resolved
                })
                .cloned()
                .collect()
        };
        for alert in candidates {
            self.recover(&alert).await;
        }
    }

    async fn recover(&self, alert: &HealthAlert) {
        let server = alert.server.clone();
        {
            let mut in_recovery = self.in_recovery.lock();
            if in_recovery.contains(&server) {
                return;
            }
            let attempts = self
                .recovery_attempts
                .lock()
                .get(&server)
                .copied()
                .unwrap_or(0);
            if attempts >= self.policy.max_restart_attempts {
                debug!("Recovery attempt limit reached for {}", server);
                return;
            }
            if let Some(last) = self.last_attempt.lock().get(&server) {
                let backoff = chrono::Duration::seconds(self.policy.restart_backoff_secs as i64);
                if Utc::now() - *last < backoff {
                    debug!("Recovery for {} still in backoff window", server);
                    return;
                }
            }
            in_recovery.insert(server.clone());
        }
        *self.recovery_attempts.lock().entry(server.clone()).or_insert(0) += 1;
        self.last_attempt.lock().insert(server.clone(), Utc::now());

        for action in &alert.actions {
            info!("Executing recovery action {:?} for {}", action, server);
            if self.execute_action(&server, *action).await {
                let mut alerts = self.alerts.lock();
                if let Some(stored) = alerts.iter_mut().find(|a| {
                    a.server == alert.server
                        && a.severity == alert.severity
                        && a.timestamp == alert.timestamp
                }) {
                    stored.resolved = true;
                    stored.resolved_at = Some(Utc::now());
                }
                break;
            }
        }

        self.in_recovery.lock().remove(&server);
    }

    async fn execute_action(&self, server: &str, action: RecoveryAction) -> bool {
        let pool = self.base.pool();
        match action {
            RecoveryAction::Reconnect => match pool.connect_server(server).await {
                Ok(()) => {
                    info!("Successfully reconnected to {}", server);
                    true
                }
                Err(e) => {
                    warn!("Reconnect failed for {}: {}", server, e);
                    false
                }
            },
            RecoveryAction::Restart => {
                if let Err(e) = pool.disconnect_server(server).await {
                    warn!("Restart of {} failed to disconnect: {}", server, e);
                    return false;
                }
                tokio::time::sleep(RESTART_PAUSE).await;
                match pool.connect_server(server).await {
                    Ok(()) => {
                        self.base.reset_failures(server);
                        info!("Successfully restarted {}", server);
                        true
                    }
                    Err(e) => {
                        warn!("Restart failed for {}: {}", server, e);
                        false
                    }
                }
            }
            RecoveryAction::Disable => {
                let _ = pool.disconnect_server(server).await;
                match pool.set_server_enabled(server, false).await {
                    Ok(()) => {
                        warn!("Disabled server {} after repeated failures", server);
                        true
                    }
                    Err(e) => {
                        warn!("Failed to disable {}: {}", server, e);
                        false
                    }
                }
            }
            RecoveryAction::Escalate => {
                self.append_alert_unchecked(HealthAlert::new(
                    server,
                    AlertSeverity::Emergency,
                    format!("server {} requires manual intervention", server),
                    Vec::new(),
                ));
                true
            }
            RecoveryAction::Ignore => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::testing::{StubPool, StubServer};

    fn pool_with(name: &str, server: StubServer) -> Arc<StubPool> {
        let pool = Arc::new(StubPool::new());
        pool.add(name, server);
        pool
    }

    fn monitor(pool: Arc<StubPool>, policy: RecoveryPolicy) -> AdvancedHealthMonitor {
        AdvancedHealthMonitor::with_monitor(
            HealthMonitor::with_checks(pool, Vec::new()),
            policy,
        )
    }

    #[tokio::test]
    async fn duplicate_alerts_collapse_within_window() {
        let monitor = monitor(pool_with("echo", StubServer::default()), RecoveryPolicy::default());
        for _ in 0..3 {
            monitor.inner.raise_alert(HealthAlert::new(
                "echo",
                AlertSeverity::Critical,
                "server echo is in critical state".to_string(),
                vec![RecoveryAction::Reconnect],
            ));
        }
        assert_eq!(monitor.alerts(None, false).len(), 1);

        // A different severity is not a duplicate.
        monitor.inner.raise_alert(HealthAlert::new(
            "echo",
            AlertSeverity::Warning,
            "high response time: 12.00s".to_string(),
            vec![RecoveryAction::Restart],
        ));
        assert_eq!(monitor.alerts(None, false).len(), 2);
        assert_eq!(monitor.alerts(Some(AlertSeverity::Critical), false).len(), 1);
    }

    #[tokio::test]
    async fn recovery_backoff_skips_rapid_second_attempt() {
        let pool = pool_with(
            "echo",
            StubServer {
                connect_ok: false,
                ..StubServer::default()
            },
        );
        let monitor = monitor(Arc::clone(&pool), RecoveryPolicy::default());
        monitor.inner.raise_alert(HealthAlert::new(
            "echo",
            AlertSeverity::Critical,
            "server echo is in critical state".to_string(),
            vec![RecoveryAction::Reconnect],
        ));

        monitor.run_recovery_pass().await;
        assert_eq!(pool.connect_calls(), 1);

        // Second pass lands inside restart_backoff_secs and must not churn
        // the subprocess.
        monitor.run_recovery_pass().await;
        assert_eq!(pool.connect_calls(), 1);

        let stats = monitor.recovery_statistics();
        assert_eq!(stats.attempts.get("echo"), Some(&1));
        assert_eq!(stats.resolved_alerts, 0);
    }

    #[tokio::test]
    async fn successful_reconnect_resolves_the_alert() {
        let pool = pool_with("echo", StubServer::default());
        let monitor = monitor(Arc::clone(&pool), RecoveryPolicy::default());
        monitor.inner.raise_alert(HealthAlert::new(
            "echo",
            AlertSeverity::Critical,
            "server echo is in critical state".to_string(),
            vec![RecoveryAction::Reconnect],
        ));

        monitor.run_recovery_pass().await;
        assert_eq!(monitor.alerts(None, true).len(), 1);
        assert!(monitor.alerts(None, false).is_empty());
        assert_eq!(monitor.recovery_statistics().resolution_rate, 1.0);
    }

    #[tokio::test]
    async fn disable_action_flips_the_enabled_flag() {
        let pool = pool_with(
            "flaky",
            StubServer {
                connect_ok: false,
                ..StubServer::default()
            },
        );
        let monitor = monitor(Arc::clone(&pool), RecoveryPolicy::default());
        monitor.inner.raise_alert(HealthAlert::new(
            "flaky",
            AlertSeverity::Critical,
            "high error rate: 60%".to_string(),
            vec![RecoveryAction::Reconnect, RecoveryAction::Disable],
        ));

        monitor.run_recovery_pass().await;
        assert!(!pool.is_enabled("flaky"));
        assert!(pool.disconnect_calls() >= 1);
        assert_eq!(monitor.alerts(None, true).len(), 1);
    }

    #[tokio::test]
    async fn escalate_records_an_emergency_alert() {
        let pool = pool_with("echo", StubServer::default());
        let monitor = monitor(pool, RecoveryPolicy::default());
        monitor.inner.raise_alert(HealthAlert::new(
            "echo",
            AlertSeverity::Emergency,
            "6 consecutive failures".to_string(),
            vec![RecoveryAction::Escalate],
        ));

        monitor.run_recovery_pass().await;
        let emergencies = monitor.alerts(Some(AlertSeverity::Emergency), false);
        assert_eq!(emergencies.len(), 1);
        assert!(emergencies[0].message.contains("manual intervention"));
        assert_eq!(monitor.alerts(Some(AlertSeverity::Emergency), true).len(), 1);
    }

    #[tokio::test]
    async fn auto_recovery_can_be_disabled() {
        let pool = pool_with("echo", StubServer::default());
        let monitor = monitor(Arc::clone(&pool), RecoveryPolicy::conservative());
        monitor.inner.raise_alert(HealthAlert::new(
            "echo",
            AlertSeverity::Critical,
            "server echo is in critical state".to_string(),
            vec![RecoveryAction::Reconnect],
        ));

        monitor.run_recovery_pass().await;
        assert_eq!(pool.connect_calls(), 0);
        assert_eq!(monitor.alerts(None, false).len(), 1);
    }

    #[tokio::test]
    async fn degrading_response_time_raises_a_trend_alert() {
        let pool = pool_with("echo", StubServer::default());
        let monitor = monitor(pool, RecoveryPolicy::default());
        for value in [1.0, 1.0, 1.0, 2.0, 2.0, 2.0] {
            monitor
                .inner
                .trends
                .lock()
                .entry("echo".to_string())
                .or_default()
                .push(value, 1.0, 0.0);
        }

        monitor.run_predictive_analysis().await;
        let warnings = monitor.alerts(Some(AlertSeverity::Warning), false);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("trending up"));
    }

    #[tokio::test]
    async fn low_success_rate_raises_a_trend_alert() {
        let pool = pool_with("echo", StubServer::default());
        let monitor = monitor(pool, RecoveryPolicy::default());
        for value in [1.0, 1.0, 0.5, 0.5, 0.5] {
            monitor
                .inner
                .trends
                .lock()
                .entry("echo".to_string())
                .or_default()
                .push(0.1, value, 1.0 - value);
        }

        monitor.run_predictive_analysis().await;
        let critical = monitor.alerts(Some(AlertSeverity::Critical), false);
        assert_eq!(critical.len(), 1);
        assert!(critical[0].message.contains("trending low"));
    }

    #[tokio::test]
    async fn sweep_records_history_and_trends() {
        let pool = pool_with("echo", StubServer::default());
        let monitor = monitor(pool, RecoveryPolicy::default());
        monitor.base().add_server("echo");
        monitor.run_sweep().await;
        monitor.run_sweep().await;

        let trends = monitor.trends("echo").unwrap();
        assert_eq!(trends.response_times.len(), 2);
        assert_eq!(monitor.inner.history.lock().get("echo").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn trend_buffers_are_capped() {
        let mut buffers = TrendBuffers::default();
        for i in 0..25 {
            buffers.push(i as f64, 1.0, 0.0);
        }
        assert_eq!(buffers.response_times.len(), TREND_POINTS);
        assert_eq!(buffers.response_times.front(), Some(&15.0));
    }

    #[tokio::test]
    async fn acknowledged_alerts_are_skipped_by_recovery() {
        let pool = pool_with("echo", StubServer::default());
        let monitor = monitor(Arc::clone(&pool), RecoveryPolicy::default());
        monitor.inner.raise_alert(HealthAlert::new(
            "echo",
            AlertSeverity::Critical,
            "server echo is in critical state".to_string(),
            vec![RecoveryAction::Reconnect],
        ));
        assert!(monitor.acknowledge_alert(0));

        monitor.run_recovery_pass().await;
        assert_eq!(pool.connect_calls(), 0);
    }
}
