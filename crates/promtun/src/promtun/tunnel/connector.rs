use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{net::TcpStream, time::Instant};
use tokio_rustls::{TlsConnector, client::TlsStream};

use crate::promtun::tunnel::{
    TunnelSettings,
    handshake::{self, HandshakeHeader},
    tls,
    transport::BoxedStream,
};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to establish a connection to {endpoint}: {source}")]
    Dial {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to send config to {endpoint}: {source}")]
    HandshakeWrite {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read the response from {endpoint}: {source}")]
    HandshakeRead {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to authenticate project on {endpoint}: {status} {message}")]
    Auth {
        endpoint: String,
        status: u16,
        message: String,
    },
}

/// Produces authenticated physical connections to one gateway endpoint.
#[async_trait]
pub trait GatewayDialer: Send + Sync {
    fn endpoint(&self) -> &str;
    async fn connect(&self) -> Result<BoxedStream, ConnectError>;
}

pub trait DialerFactory: Send + Sync {
    fn dialer(&self, endpoint: &str) -> Arc<dyn GatewayDialer>;
}

/// Material shared by the connectors of every endpoint.
#[derive(Clone)]
pub struct GatewayConnectorFactory {
    server_name: String,
    header: HandshakeHeader,
    payload: Arc<[u8]>,
    tls: TlsConnector,
    settings: Arc<TunnelSettings>,
}

impl GatewayConnectorFactory {
    pub fn new(
        server_name: String,
        token: &str,
        payload: Vec<u8>,
        settings: Arc<TunnelSettings>,
    ) -> anyhow::Result<Self> {
        let config_size = u32::try_from(payload.len())
            .map_err(|_| anyhow::anyhow!("tunnel: config payload too large ({} bytes)", payload.len()))?;
        let header = HandshakeHeader::new(token.as_bytes(), settings.version.as_bytes(), config_size);
        let tls = TlsConnector::from(tls::client_config(settings.tls_skip_verify)?);
        Ok(Self {
            server_name,
            header,
            payload: payload.into(),
            tls,
            settings,
        })
    }

    pub fn connector(&self, endpoint: &str) -> GatewayConnector {
        GatewayConnector {
            endpoint: endpoint.to_string(),
            shared: self.clone(),
        }
    }
}

impl DialerFactory for GatewayConnectorFactory {
    fn dialer(&self, endpoint: &str) -> Arc<dyn GatewayDialer> {
        Arc::new(self.connector(endpoint))
    }
}

pub struct GatewayConnector {
    endpoint: String,
    shared: GatewayConnectorFactory,
}

impl GatewayConnector {
    /// Dials the gateway over TLS and authenticates.
    ///
    /// One deadline covers the dial, both handshake writes and the status
    /// read. Once authenticated the connection has no deadline.
    pub async fn connect_tls(&self) -> Result<TlsStream<TcpStream>, ConnectError> {
        let endpoint = self.endpoint.as_str();
        let s = &self.shared;
        tracing::info!(
            endpoint,
            server_name = %s.server_name,
            config_size = s.header.config_size(),
            "tunnel: connecting"
        );

        let deadline = Instant::now() + s.settings.timeout;

        let mut conn = within(deadline, self.dial())
            .await
            .map_err(|source| ConnectError::Dial {
                endpoint: endpoint.to_string(),
                source,
            })?;
        tracing::info!(endpoint, "tunnel: connected to gateway");

        within(deadline, handshake::write_handshake(&mut conn, &s.header, &s.payload))
            .await
            .map_err(|source| ConnectError::HandshakeWrite {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let resp = within(deadline, handshake::read_response(&mut conn, s.settings.gateway_messages))
            .await
            .map_err(|source| ConnectError::HandshakeRead {
                endpoint: endpoint.to_string(),
                source,
            })?;
        tracing::info!(endpoint, status = resp.status, "tunnel: gateway responded");

        if !resp.is_ok() {
            return Err(ConnectError::Auth {
                endpoint: endpoint.to_string(),
                status: resp.status,
                message: resp.message,
            });
        }

        tracing::info!(endpoint, "tunnel: ready to proxy requests");
        Ok(conn)
    }

    async fn dial(&self) -> std::io::Result<TlsStream<TcpStream>> {
        let name = tls::server_name(&self.shared.server_name, &self.endpoint)?;
        let tcp = TcpStream::connect(&self.endpoint).await?;
        tcp.set_nodelay(true)?;
        self.shared.tls.connect(name, tcp).await
    }
}

#[async_trait]
impl GatewayDialer for GatewayConnector {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&self) -> Result<BoxedStream, ConnectError> {
        let conn = self.connect_tls().await?;
        Ok(Box::new(conn))
    }
}

async fn within<T>(
    deadline: Instant,
    fut: impl Future<Output = std::io::Result<T>>,
) -> std::io::Result<T> {
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "deadline exceeded",
        )),
    }
}
