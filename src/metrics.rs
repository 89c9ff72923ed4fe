use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Protocol {
    Ssh,
    Http,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Endpoint {
    UploadPack,
    ReceivePack,
    InfoRefs,
    Static,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub endpoint: Endpoint,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProtocolLabels {
    pub protocol: Protocol,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric the `web` process exposes.
pub struct Metrics {
    pub http_git_requests: Family<RequestLabels, Counter>,
    pub rpc_duration_seconds: Family<RequestLabels, Histogram>,
    pub ssh_sessions: Counter,
    pub ssh_exec_requests: Counter,
    pub access_denied: Family<ProtocolLabels, Counter>,
    pub auth_failures: Family<ProtocolLabels, Counter>,
    pub push_tasks_applied: Counter,
    pub active_subprocesses: Gauge,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let http_git_requests = Family::<RequestLabels, Counter>::default();
        registry.register(
            "gitgate_http_git_requests",
            "Smart/dumb HTTP git requests by endpoint",
            http_git_requests.clone(),
        );

        let rpc_duration_seconds = Family::<RequestLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.01, 2.0, 14))
        });
        registry.register(
            "gitgate_rpc_duration_seconds",
            "Lifetime of stateless-rpc git subprocesses",
            rpc_duration_seconds.clone(),
        );

        let ssh_sessions = Counter::default();
        registry.register(
            "gitgate_ssh_sessions",
            "SSH connections accepted",
            ssh_sessions.clone(),
        );

        let ssh_exec_requests = Counter::default();
        registry.register(
            "gitgate_ssh_exec_requests",
            "SSH exec requests dispatched",
            ssh_exec_requests.clone(),
        );

        let access_denied = Family::<ProtocolLabels, Counter>::default();
        registry.register(
            "gitgate_access_denied",
            "Requests refused by the access decision",
            access_denied.clone(),
        );

        let auth_failures = Family::<ProtocolLabels, Counter>::default();
        registry.register(
            "gitgate_auth_failures",
            "Rejected credentials",
            auth_failures.clone(),
        );

        let push_tasks_applied = Counter::default();
        registry.register(
            "gitgate_push_tasks_applied",
            "Update tasks consumed by push reactions",
            push_tasks_applied.clone(),
        );

        let active_subprocesses: Gauge = Gauge::default();
        registry.register(
            "gitgate_active_subprocesses",
            "Git subprocesses currently running",
            active_subprocesses.clone(),
        );

        Self {
            http_git_requests,
            rpc_duration_seconds,
            ssh_sessions,
            ssh_exec_requests,
            access_denied,
            auth_failures,
            push_tasks_applied,
            active_subprocesses,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Registry plus metrics, shared through [`crate::AppState`].
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Text exposition format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &self.registry)?;
        Ok(out)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_exposition() {
        let m = MetricsRegistry::new();
        m.metrics.ssh_sessions.inc();
        m.metrics
            .http_git_requests
            .get_or_create(&RequestLabels {
                endpoint: Endpoint::InfoRefs,
            })
            .inc();

        let text = m.encode().unwrap();
        assert!(text.contains("gitgate_ssh_sessions_total 1"));
        assert!(text.contains("gitgate_http_git_requests_total{endpoint=\"InfoRefs\"} 1"));
    }
}
