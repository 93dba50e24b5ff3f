//! Outbound tunnels to the gateways.
//!
//! The agent dials every gateway endpoint returned by the resolver,
//! authenticates with the project token, and then serves as the yamux server
//! for streams the gateway opens, relaying each one to a local destination.

use std::time::Duration;

pub mod backoff;
pub mod connector;
pub mod handshake;
pub mod lifecycle;
pub mod manager;
pub mod relay;
pub mod resolver;
pub mod tls;
pub mod transport;

#[cfg(test)]
mod testutil;

/// Immutable tunables shared by every tunnel.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Bounds resolver calls, gateway handshakes and destination dials.
    pub timeout: Duration,
    pub stream_timeout: Duration,
    pub keepalive_interval: Duration,
    pub refresh_interval: Duration,
    pub backoff: backoff::BackoffConfig,
    pub tls_skip_verify: bool,
    /// Gateway status frames carry a trailing message.
    pub gateway_messages: bool,
    pub version: String,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            stream_timeout: Duration::from_secs(5 * 60),
            keepalive_interval: Duration::from_secs(1),
            refresh_interval: Duration::from_secs(10 * 60),
            backoff: backoff::BackoffConfig::default(),
            tls_skip_verify: false,
            gateway_messages: false,
            version: crate::promtun::VERSION.to_string(),
        }
    }
}

/// Resolves once stop has been requested or the stop handle is gone.
pub(crate) async fn stopped(rx: &mut tokio::sync::watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
