//! Capability-based server registry and request routing.
//!
//! Servers are indexed by their declared capability labels. Routing runs
//! an ordered list of rules over the request text, filters candidates by
//! required capabilities and liveness, then picks the best server by a
//! composite of rule confidence and live performance.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::error::McpError;
use crate::manager::ServerPool;

/// Weight of the recorded success rate in the composite score
const WEIGHT_SUCCESS_RATE: f64 = 0.4;
/// Weight of the recorded response time in the composite score
const WEIGHT_RESPONSE_TIME: f64 = 0.3;
/// Weight of the rule confidence in the composite score
const WEIGHT_CONFIDENCE: f64 = 0.3;

/// A candidate server produced by a routing rule. Ephemeral: produced per
/// routing request, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityMatch {
    /// Candidate server name
    pub server_name: String,
    /// Rule confidence, 0.0 - 1.0
    pub confidence: f64,
    /// Capability labels the rule matched on
    pub capabilities: Vec<String>,
    /// Name of the rule that produced this match
    pub rule: String,
}

/// One ordered routing rule: inspects the request text (and optional
/// context) and emits zero or more candidates at a fixed confidence.
pub trait RoutingRule: Send + Sync {
    /// Rule name, recorded on every match it emits
    fn name(&self) -> &str;
    /// Evaluate the rule against a request
    fn evaluate(
        &self,
        request: &str,
        context: Option<&Value>,
        registry: &ServerRegistry,
    ) -> Vec<CapabilityMatch>;
}

/// Keyword-triggered rule: when any keyword appears in the request, every
/// server carrying the rule's capability becomes a candidate.
pub struct KeywordRule {
    name: String,
    capability: String,
    also_requires: Option<String>,
    keywords: Vec<String>,
    confidence: f64,
}

impl KeywordRule {
    /// Create a keyword rule for one capability
    pub fn new(
        name: impl Into<String>,
        capability: impl Into<String>,
        confidence: f64,
        keywords: &[&str],
    ) -> Self {
        Self {
            name: name.into(),
            capability: capability.into(),
            also_requires: None,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            confidence,
        }
    }

    /// Require candidates to carry a second capability as well
    pub fn also_requires(mut self, capability: impl Into<String>) -> Self {
        self.also_requires = Some(capability.into());
        self
    }
}

impl RoutingRule for KeywordRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(
        &self,
        request: &str,
        _context: Option<&Value>,
        registry: &ServerRegistry,
    ) -> Vec<CapabilityMatch> {
        let request = request.to_lowercase();
        if !self.keywords.iter().any(|k| request.contains(k.as_str())) {
            return Vec::new();
        }

        let mut labels = vec![self.capability.clone()];
        if let Some(extra) = &self.also_requires {
            labels.push(extra.clone());
        }

        registry
            .servers_with_capability(&self.capability)
            .into_iter()
            .filter(|server| {
                self.also_requires
                    .as_ref()
                    .is_none_or(|extra| registry.server_has_capability(server, extra))
            })
            .map(|server| CapabilityMatch {
                server_name: server,
                confidence: self.confidence,
                capabilities: labels.clone(),
                rule: self.name.clone(),
            })
            .collect()
    }
}

/// The default ordered rule list. Earlier rules win score ties.
fn default_rules() -> Vec<Arc<dyn RoutingRule>> {
    vec![
        Arc::new(KeywordRule::new(
            "filesystem",
            "filesystem",
            0.95,
            &[
                "file", "read", "write", "directory", "folder", "path", "copy", "move", "delete",
            ],
        )),
        Arc::new(KeywordRule::new(
            "semantic_code",
            "semantic-code",
            0.9,
            &["symbol", "refactor", "definition", "references", "codebase"],
        )),
        Arc::new(
            KeywordRule::new(
                "ui_generation",
                "generation",
                0.9,
                &[
                    "component",
                    "ui",
                    "interface",
                    "form",
                    "button",
                    "layout",
                    "design",
                ],
            )
            .also_requires("ui"),
        ),
        Arc::new(KeywordRule::new(
            "documentation",
            "documentation",
            0.8,
            &[
                "documentation",
                "docs",
                "example",
                "tutorial",
                "guide",
                "reference",
            ],
        )),
        Arc::new(KeywordRule::new(
            "testing",
            "testing",
            0.8,
            &["test", "testing", "validation", "verify", "check", "qa"],
        )),
        Arc::new(KeywordRule::new(
            "project_management",
            "project-management",
            0.8,
            &["project", "task", "milestone", "plan", "roadmap"],
        )),
        Arc::new(KeywordRule::new(
            "shell",
            "shell",
            0.8,
            &["run", "execute", "command", "shell", "terminal"],
        )),
        Arc::new(KeywordRule::new(
            "semantic_file",
            "semantic-file",
            0.8,
            &["search", "find", "locate"],
        )),
        Arc::new(KeywordRule::new(
            "analysis",
            "analysis",
            0.7,
            &[
                "analyze",
                "debug",
                "explain",
                "understand",
                "review",
                "investigate",
            ],
        )),
    ]
}

/// Live performance record fed back after every routed request
#[derive(Debug, Clone, Serialize)]
pub struct ServerPerformance {
    /// Exponentially averaged response time in seconds
    pub response_time: f64,
    /// Exponentially averaged success rate
    pub success_rate: f64,
    /// Requests routed through this server
    pub usage_count: u64,
}

impl Default for ServerPerformance {
    fn default() -> Self {
        Self {
            response_time: 0.0,
            success_rate: 1.0,
            usage_count: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct RegistryEntry {
    capabilities: Vec<String>,
    priority: u32,
    enabled: bool,
}

/// Per-server view in [`RegistryStatus`]
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatusEntry {
    /// Whether the server is currently live
    pub available: bool,
    /// Declared capability labels
    pub capabilities: Vec<String>,
    /// Routing priority from the config
    pub priority: u32,
    /// Whether the server is enabled
    pub enabled: bool,
    /// Recorded performance
    pub performance: ServerPerformance,
}

/// Snapshot of the registry for operators
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    /// Registered servers
    pub total_servers: usize,
    /// Registered servers that are currently live
    pub available_servers: usize,
    /// Distinct capability labels in the index
    pub total_capabilities: usize,
    /// Per-server detail
    pub servers: HashMap<String, ServerStatusEntry>,
}

/// Matches emitted by one rule during [`ServerRegistry::diagnose_routing`]
#[derive(Debug, Clone, Serialize)]
pub struct RuleMatches {
    /// Rule name
    pub rule: String,
    /// Candidates the rule emitted
    pub matches: Vec<CapabilityMatch>,
}

/// Routing debug report
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDiagnosis {
    /// The request text that was routed
    pub request: String,
    /// Live servers at evaluation time
    pub available_servers: Vec<String>,
    /// Raw candidates per rule, before filtering
    pub rule_matches: Vec<RuleMatches>,
    /// Candidates surviving capability and liveness filters
    pub final_matches: Vec<CapabilityMatch>,
    /// The server scoring highest, if any
    pub recommended: Option<CapabilityMatch>,
}

/// Registry of servers indexed by declared capability, with rule-based
/// routing and a performance feedback loop
pub struct ServerRegistry {
    pool: Arc<dyn ServerPool>,
    entries: DashMap<String, RegistryEntry>,
    capability_index: DashMap<String, BTreeSet<String>>,
    performance: DashMap<String, ServerPerformance>,
    rules: RwLock<Vec<Arc<dyn RoutingRule>>>,
}

impl ServerRegistry {
    /// Create a registry with the default rule list
    pub fn new(pool: Arc<dyn ServerPool>) -> Self {
        Self::with_rules(pool, default_rules())
    }

    /// Create a registry with a custom ordered rule list
    pub fn with_rules(pool: Arc<dyn ServerPool>, rules: Vec<Arc<dyn RoutingRule>>) -> Self {
        Self {
            pool,
            entries: DashMap::new(),
            capability_index: DashMap::new(),
            performance: DashMap::new(),
            rules: RwLock::new(rules),
        }
    }

    /// Append a custom routing rule after the existing ones
    pub fn add_rule(&self, rule: Arc<dyn RoutingRule>) {
        self.rules.write().push(rule);
    }

    /// Index a server under its declared capability labels
    pub fn register_server(&self, config: &ServerConfig) {
        self.entries.insert(
            config.name.clone(),
            RegistryEntry {
                capabilities: config.capabilities.clone(),
                priority: config.priority,
                enabled: config.enabled,
            },
        );
        for capability in &config.capabilities {
            self.capability_index
                .entry(capability.clone())
                .or_default()
                .insert(config.name.clone());
        }
        self.performance
            .entry(config.name.clone())
            .or_insert_with(ServerPerformance::default);
        info!(
            "Registered server '{}' with capabilities: {:?}",
            config.name, config.capabilities
        );
    }

    /// Remove a server from the index
    pub fn unregister_server(&self, name: &str) {
        let Some((_, entry)) = self.entries.remove(name) else {
            return;
        };
        for capability in &entry.capabilities {
            if let Some(mut servers) = self.capability_index.get_mut(capability) {
                servers.remove(name);
            }
            self.capability_index
                .remove_if(capability, |_, servers| servers.is_empty());
        }
        self.performance.remove(name);
        info!("Unregistered server '{}'", name);
    }

    /// Servers carrying one capability, sorted by name
    pub fn servers_with_capability(&self, capability: &str) -> Vec<String> {
        self.capability_index
            .get(capability)
            .map(|servers| servers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a registered server declares one capability
    pub fn server_has_capability(&self, server: &str, capability: &str) -> bool {
        self.entries
            .get(server)
            .is_some_and(|entry| entry.capabilities.iter().any(|c| c == capability))
    }

    /// Every capability label with its providing servers
    pub fn capabilities_summary(&self) -> HashMap<String, Vec<String>> {
        self.capability_index
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().iter().cloned().collect()))
            .collect()
    }

    /// Run every rule in order, then drop candidates missing a required
    /// capability and candidates that are not currently live
    pub async fn find_matches(
        &self,
        request: &str,
        required_capabilities: &[String],
        context: Option<&Value>,
    ) -> Vec<CapabilityMatch> {
        let rules: Vec<Arc<dyn RoutingRule>> = { self.rules.read().clone() };
        let mut matches = Vec::new();
        for rule in rules {
            matches.extend(rule.evaluate(request, context, self));
        }

        if !required_capabilities.is_empty() {
            matches.retain(|m| {
                required_capabilities
                    .iter()
                    .all(|c| self.server_has_capability(&m.server_name, c))
            });
        }

        let live = self.pool.available_servers().await;
        matches.retain(|m| live.contains(&m.server_name));
        matches
    }

    /// Pick the best surviving candidate by composite score; ties go to
    /// the earlier-registered rule
    pub async fn find_best_server(
        &self,
        request: &str,
        required_capabilities: &[String],
        context: Option<&Value>,
    ) -> Option<CapabilityMatch> {
        let matches = self
            .find_matches(request, required_capabilities, context)
            .await;
        let mut best: Option<(f64, CapabilityMatch)> = None;
        for candidate in matches {
            let score = self.score(&candidate);
            debug!(
                "Routing candidate {} via rule '{}': score {:.3}",
                candidate.server_name, candidate.rule, score
            );
            match &best {
                Some((top, _)) if score <= *top => {}
                _ => best = Some((score, candidate)),
            }
        }
        best.map(|(_, candidate)| candidate)
    }

    /// Like [`find_best_server`](Self::find_best_server), but failing with
    /// a typed error when nothing matches
    pub async fn select_server(
        &self,
        request: &str,
        required_capabilities: &[String],
        context: Option<&Value>,
    ) -> Result<CapabilityMatch, McpError> {
        self.find_best_server(request, required_capabilities, context)
            .await
            .ok_or_else(|| {
                let wanted = if required_capabilities.is_empty() {
                    "no live server matched the request".to_string()
                } else {
                    required_capabilities.join(", ")
                };
                McpError::capability_not_found(wanted)
            })
    }

    /// Feed a routed request's outcome back into the score. Response time
    /// and success rate move as exponential averages, so routing drifts
    /// away from degrading servers without forgetting history outright.
    pub fn update_performance(&self, server: &str, response_time: f64, success: bool) {
        let Some(mut performance) = self.performance.get_mut(server) else {
            return;
        };
        performance.response_time = performance.response_time * 0.8 + response_time * 0.2;
        let outcome = if success { 1.0 } else { 0.0 };
        performance.success_rate = performance.success_rate * 0.9 + outcome * 0.1;
        performance.usage_count += 1;
    }

    /// Recorded performance for one server
    pub fn server_performance(&self, server: &str) -> Option<ServerPerformance> {
        self.performance.get(server).map(|p| p.clone())
    }

    /// Snapshot of the whole registry
    pub async fn registry_status(&self) -> RegistryStatus {
        let live = self.pool.available_servers().await;
        let servers: HashMap<String, ServerStatusEntry> = self
            .entries
            .iter()
            .map(|entry| {
                let name = entry.key().clone();
                let performance = self
                    .performance
                    .get(&name)
                    .map(|p| p.clone())
                    .unwrap_or_default();
                (
                    name.clone(),
                    ServerStatusEntry {
                        available: live.contains(&name),
                        capabilities: entry.value().capabilities.clone(),
                        priority: entry.value().priority,
                        enabled: entry.value().enabled,
                        performance,
                    },
                )
            })
            .collect();
        RegistryStatus {
            total_servers: self.entries.len(),
            available_servers: servers.values().filter(|s| s.available).count(),
            total_capabilities: self.capability_index.len(),
            servers,
        }
    }

    /// Explain how a request would route: per-rule candidates, surviving
    /// matches, and the recommendation
    pub async fn diagnose_routing(&self, request: &str, context: Option<&Value>) -> RoutingDiagnosis {
        let rules: Vec<Arc<dyn RoutingRule>> = { self.rules.read().clone() };
        let rule_matches = rules
            .iter()
            .map(|rule| RuleMatches {
                rule: rule.name().to_string(),
                matches: rule.evaluate(request, context, self),
            })
            .collect();

        RoutingDiagnosis {
            request: request.to_string(),
            available_servers: self.pool.available_servers().await,
            rule_matches,
            final_matches: self.find_matches(request, &[], context).await,
            recommended: self.find_best_server(request, &[], context).await,
        }
    }

    fn score(&self, candidate: &CapabilityMatch) -> f64 {
        let (success_rate, response_time) = self
            .performance
            .get(&candidate.server_name)
            .map(|p| (p.success_rate, p.response_time))
            .unwrap_or((0.5, 1.0));
        success_rate * WEIGHT_SUCCESS_RATE
            + (1.0 - response_time.min(1.0)) * WEIGHT_RESPONSE_TIME
            + candidate.confidence * WEIGHT_CONFIDENCE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::testing::{StubPool, StubServer};

    fn server(name: &str, capabilities: &[&str]) -> ServerConfig {
        ServerConfig::new(name, "true")
            .with_capabilities(capabilities.iter().map(|c| c.to_string()).collect())
    }

    fn registry_with(servers: &[(&str, &[&str])]) -> (Arc<StubPool>, ServerRegistry) {
        let pool = Arc::new(StubPool::new());
        let registry = ServerRegistry::new(pool.clone());
        for (name, capabilities) in servers {
            pool.add(name, StubServer::default());
            registry.register_server(&server(name, capabilities));
        }
        (pool, registry)
    }

    #[tokio::test]
    async fn keyword_rule_matches_by_capability() {
        let (_, registry) = registry_with(&[("files", &["filesystem"]), ("docs", &["documentation"])]);

        let matches = registry.find_matches("read the config file", &[], None).await;
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].server_name, "files");
        assert_eq!(matches[0].confidence, 0.95);
        assert_eq!(matches[0].rule, "filesystem");
    }

    #[tokio::test]
    async fn required_capabilities_filter_candidates() {
        let (_, registry) = registry_with(&[
            ("files", &["filesystem"]),
            ("super", &["filesystem", "semantic-file"]),
        ]);

        let required = vec!["semantic-file".to_string()];
        let matches = registry.find_matches("delete the old file", &required, None).await;
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].server_name, "super");
    }

    #[tokio::test]
    async fn dead_servers_are_filtered_out() {
        let (pool, registry) = registry_with(&[("files", &["filesystem"])]);
        pool.set_live("files", false);

        let matches = registry.find_matches("read the file", &[], None).await;
        assert!(matches.is_empty());
        assert!(registry.find_best_server("read the file", &[], None).await.is_none());
    }

    #[tokio::test]
    async fn ui_rule_needs_both_labels() {
        let (_, registry) = registry_with(&[
            ("gen", &["generation"]),
            ("uigen", &["generation", "ui"]),
        ]);

        let matches = registry.find_matches("build a login form component", &[], None).await;
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].server_name, "uigen");
        assert_eq!(matches[0].confidence, 0.9);
    }

    #[tokio::test]
    async fn scoring_is_monotonic_in_success_rate() {
        let (_, registry) = registry_with(&[("a", &["filesystem"]), ("b", &["filesystem"])]);

        // Drive b's success rate down; a must win.
        for _ in 0..10 {
            registry.update_performance("b", 0.0, false);
        }
        let best = registry.find_best_server("read the file", &[], None).await.unwrap();
        assert_eq!(best.server_name, "a");

        let a = registry.server_performance("a").unwrap();
        let b = registry.server_performance("b").unwrap();
        assert!(a.success_rate > b.success_rate);
    }

    #[tokio::test]
    async fn scoring_is_monotonic_in_response_time() {
        let (_, registry) = registry_with(&[("fast", &["filesystem"]), ("slow", &["filesystem"])]);

        for _ in 0..10 {
            registry.update_performance("fast", 0.05, true);
            registry.update_performance("slow", 5.0, true);
        }
        let best = registry.find_best_server("read the file", &[], None).await.unwrap();
        assert_eq!(best.server_name, "fast");
    }

    #[tokio::test]
    async fn ties_go_to_the_first_registered_rule() {
        // Both servers match distinct rules with equal confidence and
        // identical performance; the earlier rule in the list must win.
        let (_, registry) = registry_with(&[
            ("docs", &["documentation"]),
            ("tester", &["testing"]),
        ]);

        let best = registry
            .find_best_server("verify the tutorial", &[], None)
            .await
            .unwrap();
        assert_eq!(best.rule, "documentation");
        assert_eq!(best.server_name, "docs");
    }

    #[tokio::test]
    async fn performance_moves_as_exponential_average() {
        let (_, registry) = registry_with(&[("echo", &["testing"])]);

        registry.update_performance("echo", 1.0, true);
        let perf = registry.server_performance("echo").unwrap();
        assert!((perf.response_time - 0.2).abs() < 1e-9);
        assert!((perf.success_rate - 1.0).abs() < 1e-9);
        assert_eq!(perf.usage_count, 1);

        registry.update_performance("echo", 1.0, false);
        let perf = registry.server_performance("echo").unwrap();
        assert!((perf.response_time - 0.36).abs() < 1e-9);
        assert!((perf.success_rate - 0.9).abs() < 1e-9);

        // Unknown servers are ignored.
        registry.update_performance("ghost", 1.0, true);
        assert!(registry.server_performance("ghost").is_none());
    }

    #[tokio::test]
    async fn select_server_errors_when_nothing_matches() {
        let (_, registry) = registry_with(&[("files", &["filesystem"])]);
        let err = registry
            .select_server("compose a symphony", &["music".to_string()], None)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::CapabilityNotFound { .. }));
        assert_eq!(err.code(), -32001);
    }

    #[tokio::test]
    async fn unregister_cleans_the_index() {
        let (_, registry) = registry_with(&[("files", &["filesystem"])]);
        assert_eq!(registry.servers_with_capability("filesystem"), vec!["files"]);

        registry.unregister_server("files");
        assert!(registry.servers_with_capability("filesystem").is_empty());
        assert!(registry.capabilities_summary().is_empty());
        assert!(registry.server_performance("files").is_none());
    }

    #[tokio::test]
    async fn registry_status_reports_availability() {
        let (pool, registry) = registry_with(&[
            ("files", &["filesystem"]),
            ("docs", &["documentation"]),
        ]);
        pool.set_live("docs", false);

        let status = registry.registry_status().await;
        assert_eq!(status.total_servers, 2);
        assert_eq!(status.available_servers, 1);
        assert_eq!(status.total_capabilities, 2);
        assert!(status.servers["files"].available);
        assert!(!status.servers["docs"].available);
    }

    #[tokio::test]
    async fn diagnosis_reports_rules_and_recommendation() {
        let (_, registry) = registry_with(&[("files", &["filesystem"])]);

        let diagnosis = registry.diagnose_routing("read the file", None).await;
        assert_eq!(diagnosis.available_servers, vec!["files"]);
        assert_eq!(diagnosis.final_matches.len(), 1);
        assert_eq!(diagnosis.recommended.unwrap().server_name, "files");
        let filesystem_rule = diagnosis
            .rule_matches
            .iter()
            .find(|r| r.rule == "filesystem")
            .unwrap();
        assert_eq!(filesystem_rule.matches.len(), 1);
    }

    #[tokio::test]
    async fn custom_rules_run_after_defaults() {
        struct AlwaysRule;
        impl RoutingRule for AlwaysRule {
            fn name(&self) -> &str {
                "always"
            }
            fn evaluate(
                &self,
                _request: &str,
                _context: Option<&Value>,
                registry: &ServerRegistry,
            ) -> Vec<CapabilityMatch> {
                registry
                    .servers_with_capability("fallback")
                    .into_iter()
                    .map(|server_name| CapabilityMatch {
                        server_name,
                        confidence: 0.1,
                        capabilities: vec!["fallback".to_string()],
                        rule: "always".to_string(),
                    })
                    .collect()
            }
        }

        let (pool, registry) = registry_with(&[("files", &["filesystem"])]);
        pool.add("backup", StubServer::default());
        registry.register_server(&server("backup", &["fallback"]));
        registry.add_rule(Arc::new(AlwaysRule));

        let best = registry
            .find_best_server("nothing keyword shaped", &[], None)
            .await
            .unwrap();
        assert_eq!(best.server_name, "backup");
        assert_eq!(best.rule, "always");
    }
}
