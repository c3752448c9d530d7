//! Multi-source state reconciliation.
//!
//! Four views are gathered independently (specification, generated source,
//! running service, logs) and compared pairwise. Nothing here mutates any of
//! the four; the result is a fresh [`MultiLevelState`] value per analysis.
//!
//! # Severity rules
//!
//! | Drift | Severity |
//! |---|---|
//! | specification entity absent from source | error |
//! | plain specification endpoint absent from source | warning |
//! | service not running / health unhealthy | error |
//! | source endpoint probed and failing | warning |
//! | critical marker in logs | error |
//! | other log errors | warning |
//! | log warnings only | info |

pub mod logs;
pub mod service_probe;
pub mod source_probe;

use crate::config::ProjectConfig;
use crate::error::Result;
use crate::spec::{Endpoint, Specification};
use chrono::{DateTime, Utc};
use logs::{LogInspector, LogsView};
use serde::{Deserialize, Serialize};
use service_probe::{HttpServiceProbe, ServiceProbe, ServiceView};
use source_probe::{RegexSourceProbe, SourceCodeProbe, SourceView};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Which pair of views disagrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscrepancyLevel {
    SpecCode,
    CodeService,
    ServiceLogs,
}

impl fmt::Display for DiscrepancyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SpecCode => "spec-code",
            Self::CodeService => "code-service",
            Self::ServiceLogs => "service-logs",
        };
        write!(f, "{name}")
    }
}

/// Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// One detected mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub level: DiscrepancyLevel,
    pub severity: Severity,
    pub source: String,
    pub expected: String,
    pub actual: String,
    pub suggestion: String,
}

impl Discrepancy {
    fn new(
        level: DiscrepancyLevel,
        severity: Severity,
        source: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            level,
            severity,
            source: source.into(),
            expected: expected.into(),
            actual: actual.into(),
            suggestion: suggestion.into(),
        }
    }
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: expected {}, found {}",
            self.severity, self.level, self.expected, self.actual
        )
    }
}

/// The contract as the specification states it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecView {
    pub entities: Vec<String>,
    /// Always includes the health endpoint.
    pub endpoints: Vec<Endpoint>,
}

impl SpecView {
    #[must_use]
    pub fn from_spec(spec: &Specification, health_path: &str) -> Self {
        Self {
            entities: spec.entity_names(),
            endpoints: spec.planned_endpoints(health_path),
        }
    }
}

/// All four views plus the derived discrepancies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiLevelState {
    pub timestamp: DateTime<Utc>,
    pub spec: SpecView,
    pub source: SourceView,
    pub service: ServiceView,
    pub logs: LogsView,
    pub discrepancies: Vec<Discrepancy>,
    /// True iff no discrepancy has error severity.
    pub reconciled: bool,
}

impl MultiLevelState {
    fn count(&self, severity: Severity) -> usize {
        self.discrepancies
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    #[must_use]
    pub fn summary(&self) -> ReconciliationSummary {
        ReconciliationSummary {
            reconciled: self.reconciled,
            errors: self.count(Severity::Error),
            warnings: self.count(Severity::Warning),
            infos: self.count(Severity::Info),
        }
    }
}

/// Counts recorded in snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationSummary {
    pub reconciled: bool,
    pub errors: usize,
    pub warnings: usize,
    pub infos: usize,
}

/// Compare the four views.
#[must_use]
pub fn compute_discrepancies(
    spec: &SpecView,
    source: &SourceView,
    service: &ServiceView,
    logs: &LogsView,
    health_path: &str,
) -> Vec<Discrepancy> {
    let mut found = Vec::new();

    for entity in &spec.entities {
        if !source.has_entity(entity) {
            found.push(Discrepancy::new(
                DiscrepancyLevel::SpecCode,
                Severity::Error,
                "specification",
                format!("entity {entity}"),
                "no storage or type declaration in source",
                format!("generate storage and a type declaration for {entity}"),
            ));
        }
    }

    for endpoint in &spec.endpoints {
        if endpoint.is_parameterized() || source.has_endpoint(endpoint) {
            continue;
        }
        found.push(Discrepancy::new(
            DiscrepancyLevel::SpecCode,
            Severity::Warning,
            "specification",
            endpoint.to_string(),
            "no route registered in source",
            format!("add the {endpoint} handler"),
        ));
    }

    if !service.health.running {
        found.push(Discrepancy::new(
            DiscrepancyLevel::CodeService,
            Severity::Error,
            "service",
            format!("service responding on {health_path}"),
            format!("not running ({})", service.health.detail),
            "start the service and check its log for startup errors",
        ));
    } else if !service.health.healthy {
        let status = service
            .health
            .status_code
            .map_or_else(|| "no status".to_string(), |c| c.to_string());
        found.push(Discrepancy::new(
            DiscrepancyLevel::CodeService,
            Severity::Error,
            "service",
            format!("GET {health_path} healthy"),
            format!("unhealthy ({status})"),
            "fix the health handler or the failure it reports",
        ));
    }

    for probe in service.probes.iter().filter(|p| !p.ok) {
        let actual = match (&probe.status_code, &probe.error) {
            (Some(code), _) => format!("HTTP {code}"),
            (None, Some(error)) => error.clone(),
            (None, None) => "no response".to_string(),
        };
        found.push(Discrepancy::new(
            DiscrepancyLevel::CodeService,
            Severity::Warning,
            "service",
            format!("{} responds 2xx", probe.endpoint),
            actual,
            format!("fix the {} handler", probe.endpoint),
        ));
    }

    if let Some(evidence) = logs.critical.last() {
        found.push(Discrepancy::new(
            DiscrepancyLevel::ServiceLogs,
            Severity::Error,
            "logs",
            "no critical errors in logs",
            evidence.clone(),
            "fix the failure reported in the service log",
        ));
    } else if let Some(evidence) = logs.errors.last() {
        found.push(Discrepancy::new(
            DiscrepancyLevel::ServiceLogs,
            Severity::Warning,
            "logs",
            "no errors in logs",
            evidence.clone(),
            "review the errors in the service log",
        ));
    } else if let Some(evidence) = logs.warnings.last() {
        found.push(Discrepancy::new(
            DiscrepancyLevel::ServiceLogs,
            Severity::Info,
            "logs",
            "no warnings in logs",
            evidence.clone(),
            "review the warnings in the service log",
        ));
    }

    found
}

/// Discrepancies ordered by severity then level, without duplicate suggestions.
#[must_use]
pub fn reconciliation_plan(state: &MultiLevelState) -> Vec<Discrepancy> {
    let mut ordered = state.discrepancies.clone();
    ordered.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.level.cmp(&b.level)));
    let mut seen = std::collections::HashSet::new();
    ordered.retain(|d| seen.insert(d.suggestion.clone()));
    ordered
}

/// Gathers the four views and compares them.
pub struct StateReconciler {
    spec: Specification,
    output_root: PathBuf,
    health_path: String,
    max_endpoints: usize,
    source_probe: Arc<dyn SourceCodeProbe>,
    service_probe: Arc<dyn ServiceProbe>,
    logs: LogInspector,
}

impl fmt::Debug for StateReconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateReconciler")
            .field("spec", &self.spec.name)
            .field("output_root", &self.output_root)
            .field("health_path", &self.health_path)
            .finish()
    }
}

impl StateReconciler {
    /// Reconciler with the regex source probe and the HTTP service probe.
    pub fn new(
        spec: Specification,
        output_root: impl Into<PathBuf>,
        config: &ProjectConfig,
    ) -> Result<Self> {
        let output_root = output_root.into();
        let log_dir = output_root.join(&config.logs.dir);
        Ok(Self {
            spec,
            output_root,
            health_path: config.service.health_path.clone(),
            max_endpoints: config.probe.max_endpoints,
            source_probe: Arc::new(RegexSourceProbe::new()),
            service_probe: Arc::new(HttpServiceProbe::new(
                config.service.base_url(),
                config.service.health_path.clone(),
                config.probe.timeout(),
            )),
            logs: LogInspector::new(log_dir, &config.logs)?,
        })
    }

    #[must_use]
    pub fn with_source_probe(mut self, probe: Arc<dyn SourceCodeProbe>) -> Self {
        self.source_probe = probe;
        self
    }

    #[must_use]
    pub fn with_service_probe(mut self, probe: Arc<dyn ServiceProbe>) -> Self {
        self.service_probe = probe;
        self
    }

    /// Gather every view and compute discrepancies.
    pub async fn analyze(&self) -> Result<MultiLevelState> {
        let spec = SpecView::from_spec(&self.spec, &self.health_path);
        let source = self.source_probe.scan(&self.output_root)?;
        let service = service_probe::gather(
            self.service_probe.as_ref(),
            &source.endpoints,
            &self.health_path,
            self.max_endpoints,
        )
        .await;
        let logs = self.logs.inspect();

        let discrepancies =
            compute_discrepancies(&spec, &source, &service, &logs, &self.health_path);
        let reconciled = !discrepancies.iter().any(|d| d.severity == Severity::Error);
        for d in &discrepancies {
            debug!("{}", d);
        }
        info!(
            "Reconciliation: {} discrepancies, reconciled={}",
            discrepancies.len(),
            reconciled
        );

        Ok(MultiLevelState {
            timestamp: Utc::now(),
            spec,
            source,
            service,
            logs,
            discrepancies,
            reconciled,
        })
    }

    #[must_use]
    pub fn reconciliation_plan(&self, state: &MultiLevelState) -> Vec<Discrepancy> {
        reconciliation_plan(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::{order_specification, write_source_tree};
    use crate::testing::mocks::MockServiceProbe;
    use tempfile::TempDir;

    fn reconciler(root: &std::path::Path, probe: Arc<MockServiceProbe>) -> StateReconciler {
        StateReconciler::new(order_specification(), root, &ProjectConfig::default())
            .unwrap()
            .with_service_probe(probe)
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_single_warning() {
        let temp = TempDir::new().unwrap();
        write_source_tree(
            temp.path(),
            "const ordersStore = new Map();\napp.get('/health', h);\napp.get('/api/v1/orders', h);\n",
        );
        let state = reconciler(temp.path(), Arc::new(MockServiceProbe::healthy()))
            .analyze()
            .await
            .unwrap();

        assert_eq!(state.discrepancies.len(), 1);
        let d = &state.discrepancies[0];
        assert_eq!(d.level, DiscrepancyLevel::SpecCode);
        assert_eq!(d.severity, Severity::Warning);
        assert!(d.suggestion.contains("POST /api/v1/orders"));
        assert!(state.reconciled);
    }

    #[tokio::test]
    async fn test_missing_entity_is_error() {
        let temp = TempDir::new().unwrap();
        write_source_tree(
            temp.path(),
            "app.get('/health', h);\napp.get('/api/v1/orders', h);\napp.post('/api/v1/orders', h);\n",
        );
        let state = reconciler(temp.path(), Arc::new(MockServiceProbe::healthy()))
            .analyze()
            .await
            .unwrap();
        assert_eq!(state.summary().errors, 1);
        assert!(!state.reconciled);
    }

    #[tokio::test]
    async fn test_down_service_is_one_error_and_no_probes() {
        let temp = TempDir::new().unwrap();
        write_source_tree(temp.path(), "const ordersStore = new Map();\n");
        let probe = Arc::new(MockServiceProbe::down());
        let state = reconciler(temp.path(), probe.clone()).analyze().await.unwrap();
        let service_errors: Vec<_> = state
            .discrepancies
            .iter()
            .filter(|d| d.level == DiscrepancyLevel::CodeService)
            .collect();
        assert_eq!(service_errors.len(), 1);
        assert_eq!(service_errors[0].severity, Severity::Error);
        assert!(probe.probed().is_empty());
    }

    #[tokio::test]
    async fn test_unhealthy_service_is_one_service_error() {
        let temp = TempDir::new().unwrap();
        write_source_tree(
            temp.path(),
            "const ordersStore = new Map();\napp.get('/health', h);\napp.get('/api/v1/orders', h);\napp.post('/api/v1/orders', h);\n",
        );
        let probe = Arc::new(MockServiceProbe::unhealthy());
        let state = reconciler(temp.path(), probe.clone()).analyze().await.unwrap();

        // Still running, so the source GET is probed; it answers and adds nothing.
        assert_eq!(probe.probed(), vec![Endpoint::new("GET", "/api/v1/orders")]);
        assert_eq!(state.discrepancies.len(), 1);
        let d = &state.discrepancies[0];
        assert_eq!(d.level, DiscrepancyLevel::CodeService);
        assert_eq!(d.severity, Severity::Error);
        assert_eq!(d.actual, "unhealthy (503)");
        assert!(!state.reconciled);
    }

    #[tokio::test]
    async fn test_only_source_endpoints_are_probed() {
        let temp = TempDir::new().unwrap();
        write_source_tree(
            temp.path(),
            "const ordersStore = new Map();\napp.get('/health', h);\n",
        );
        let probe = Arc::new(MockServiceProbe::healthy().failing("/api/v1/orders"));
        let state = reconciler(temp.path(), probe.clone()).analyze().await.unwrap();
        assert!(probe.probed().is_empty());
        assert!(!state
            .discrepancies
            .iter()
            .any(|d| d.level == DiscrepancyLevel::CodeService));
    }

    #[tokio::test]
    async fn test_critical_log_line_blocks_reconciliation() {
        let temp = TempDir::new().unwrap();
        write_source_tree(
            temp.path(),
            "const ordersStore = new Map();\napp.get('/health', h);\napp.get('/api/v1/orders', h);\napp.post('/api/v1/orders', h);\n",
        );
        std::fs::create_dir_all(temp.path().join("logs")).unwrap();
        std::fs::write(
            temp.path().join("logs/service.log"),
            "warn: slow\nTypeError: x is not a function\n",
        )
        .unwrap();

        let state = reconciler(temp.path(), Arc::new(MockServiceProbe::healthy()))
            .analyze()
            .await
            .unwrap();
        assert_eq!(state.discrepancies.len(), 1);
        assert_eq!(state.discrepancies[0].level, DiscrepancyLevel::ServiceLogs);
        assert_eq!(state.discrepancies[0].actual, "TypeError: x is not a function");
        assert!(!state.reconciled);
    }

    #[test]
    fn test_plan_orders_by_severity_then_level() {
        let d = |level, severity, suggestion: &str| {
            Discrepancy::new(level, severity, "s", "e", "a", suggestion)
        };
        let state = MultiLevelState {
            timestamp: Utc::now(),
            spec: SpecView::default(),
            source: SourceView::default(),
            service: ServiceView::default(),
            logs: LogsView::default(),
            discrepancies: vec![
                d(DiscrepancyLevel::ServiceLogs, Severity::Info, "c"),
                d(DiscrepancyLevel::CodeService, Severity::Warning, "b"),
                d(DiscrepancyLevel::ServiceLogs, Severity::Error, "a2"),
                d(DiscrepancyLevel::SpecCode, Severity::Error, "a1"),
                d(DiscrepancyLevel::SpecCode, Severity::Warning, "b"),
            ],
            reconciled: false,
        };
        let plan = reconciliation_plan(&state);
        let order: Vec<&str> = plan.iter().map(|d| d.suggestion.as_str()).collect();
        assert_eq!(order, vec!["a1", "a2", "b", "c"]);
        assert_eq!(plan[2].level, DiscrepancyLevel::SpecCode);
    }

    struct FixedSourceProbe(SourceView);

    impl SourceCodeProbe for FixedSourceProbe {
        fn scan(&self, _root: &std::path::Path) -> Result<SourceView> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_source_probe_is_swappable() {
        let temp = TempDir::new().unwrap();
        let view = SourceView {
            files_scanned: 1,
            entities: ["Order".to_string()].into_iter().collect(),
            endpoints: vec![
                Endpoint::new("GET", "/health"),
                Endpoint::new("GET", "/api/v1/orders"),
                Endpoint::new("POST", "/api/v1/orders"),
            ],
        };
        let probe = Arc::new(MockServiceProbe::healthy());
        let state = reconciler(temp.path(), probe.clone())
            .with_source_probe(Arc::new(FixedSourceProbe(view)))
            .analyze()
            .await
            .unwrap();

        assert!(state.discrepancies.is_empty());
        assert_eq!(probe.probed(), vec![Endpoint::new("GET", "/api/v1/orders")]);
    }
}
