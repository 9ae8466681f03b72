use std::sync::Arc;

use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;

/// Thread-safe handle around the Prometheus registry and every counter the
/// gateway exposes.  Counters clone cheaply; the registry is only read by
/// the `/metrics` encoder.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,

    /// Requests that resolved to a repository path.
    pub requests_total: Counter,
    /// Paths that failed validation and fell through.
    pub path_rejections_total: Counter,
    /// 401 responses, challenge or not.
    pub auth_failures_total: Counter,
    /// CGI backend processes spawned.
    pub cgi_spawns_total: Counter,
    /// CGI bridge failures surfaced as 500s.
    pub cgi_errors_total: Counter,
    /// Settings snapshots committed (updates and external reloads).
    pub settings_reloads_total: Counter,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all gateway metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total: Counter = Counter::default();
        registry.register(
            "gitbridge_requests",
            "Requests that resolved to a repository path",
            requests_total.clone(),
        );

        let path_rejections_total: Counter = Counter::default();
        registry.register(
            "gitbridge_path_rejections",
            "Request paths rejected by validation",
            path_rejections_total.clone(),
        );

        let auth_failures_total: Counter = Counter::default();
        registry.register(
            "gitbridge_auth_failures",
            "Requests answered with 401",
            auth_failures_total.clone(),
        );

        let cgi_spawns_total: Counter = Counter::default();
        registry.register(
            "gitbridge_cgi_spawns",
            "CGI backend processes spawned",
            cgi_spawns_total.clone(),
        );

        let cgi_errors_total: Counter = Counter::default();
        registry.register(
            "gitbridge_cgi_errors",
            "CGI bridge failures",
            cgi_errors_total.clone(),
        );

        let settings_reloads_total: Counter = Counter::default();
        registry.register(
            "gitbridge_settings_reloads",
            "Settings snapshots committed",
            settings_reloads_total.clone(),
        );

        Self {
            registry: Arc::new(registry),
            requests_total,
            path_rejections_total,
            auth_failures_total,
            cgi_spawns_total,
            cgi_errors_total,
            settings_reloads_total,
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
