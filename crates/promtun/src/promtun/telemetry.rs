use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const RESOLVE_TOTAL: &str = "promtun_resolve_total";
pub const TUNNELS: &str = "promtun_tunnels";
pub const TUNNEL_CONNECTS_TOTAL: &str = "promtun_tunnel_connects_total";
pub const STREAMS_TOTAL: &str = "promtun_streams_total";
pub const ACTIVE_STREAMS: &str = "promtun_active_streams";
pub const STREAM_ERRORS_TOTAL: &str = "promtun_stream_errors_total";
/// Bytes copied from the gateway to destinations.
pub const BYTES_INGRESS_TOTAL: &str = "promtun_bytes_ingress_total";
/// Bytes copied from destinations back to the gateway.
pub const BYTES_EGRESS_TOTAL: &str = "promtun_bytes_egress_total";

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<SharedPrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")?;
    describe();
    Ok(Arc::new(handle))
}

fn describe() {
    metrics::describe_counter!(RESOLVE_TOTAL, "Endpoint resolutions by result.");
    metrics::describe_gauge!(TUNNELS, "Tunnels currently managed.");
    metrics::describe_counter!(TUNNEL_CONNECTS_TOTAL, "Gateway connection attempts by result.");
    metrics::describe_counter!(STREAMS_TOTAL, "Streams accepted from gateways.");
    metrics::describe_gauge!(ACTIVE_STREAMS, "Streams currently being relayed.");
    metrics::describe_counter!(STREAM_ERRORS_TOTAL, "Streams aborted by an error.");
    metrics::describe_counter!(BYTES_INGRESS_TOTAL, "Bytes relayed from gateways to destinations.");
    metrics::describe_counter!(BYTES_EGRESS_TOTAL, "Bytes relayed from destinations to gateways.");
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;
