use metrics::{describe_counter, describe_gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros can be used
/// anywhere in the codebase; the handle only exists to render the
/// controller's `/metrics` endpoint. Agents never install a recorder, so
/// the macros are no-ops there.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder. Must be called once at
    /// startup, before any macro use.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install metrics recorder");

        describe_gauge!(
            "statiko_state_version",
            Unit::Count,
            "Current version of the cluster state document"
        );
        describe_counter!(
            "statiko_state_writes_total",
            Unit::Count,
            "Successful state mutations"
        );
        describe_gauge!(
            "statiko_nodes_connected",
            Unit::Count,
            "Agents currently registered on the channel"
        );
        describe_counter!(
            "statiko_state_pushes_total",
            Unit::Count,
            "State documents pushed to agent streams"
        );
        describe_counter!(
            "statiko_health_requests_total",
            Unit::Count,
            "Cluster-wide health collection rounds"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
