use std::sync::Arc;

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::watch,
    time::Instant,
};

use crate::promtun::{
    telemetry,
    tunnel::{
        TunnelSettings, handshake, stopped,
        transport::{BoxedStream, YamuxSession, mux_config},
    },
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to accept a stream: {0}")]
    Accept(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to read the destination: {0}")]
    Frame(#[source] std::io::Error),
    #[error("failed to establish a connection to {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("copy: {0}")]
    Copy(#[source] std::io::Error),
    #[error("stream deadline exceeded")]
    DeadlineExceeded,
}

/// Where the streams of a tunnel are relayed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Every stream goes to one configured address.
    Fixed(String),
    /// Every stream starts with a destination frame naming its target.
    PerStream,
}

impl Destination {
    pub async fn resolve<R: AsyncRead + Unpin>(&self, st: &mut R) -> Result<String, StreamError> {
        match self {
            Destination::Fixed(addr) => Ok(addr.clone()),
            Destination::PerStream => handshake::read_destination(st)
                .await
                .map_err(StreamError::Frame),
        }
    }
}

/// Serves the yamux session on an authenticated gateway connection until
/// stopped (`Ok`) or until the session dies (`Err`).
///
/// The session, and with it the physical connection, is closed on return.
pub async fn relay(
    conn: BoxedStream,
    destination: Arc<Destination>,
    settings: Arc<TunnelSettings>,
    mut stop: watch::Receiver<bool>,
) -> Result<(), SessionError> {
    let sess = YamuxSession::server(conn, mux_config(settings.keepalive_interval));

    let res = loop {
        tokio::select! {
            biased;
            _ = stopped(&mut stop) => break Ok(()),
            st = sess.accept_stream() => match st {
                Ok(st) => {
                    let destination = destination.clone();
                    let settings = settings.clone();
                    tokio::spawn(async move {
                        let _active = ActiveStreamGuard::new();
                        match serve_stream(st, &destination, &settings).await {
                            Ok((ingress, egress)) => {
                                metrics::counter!(telemetry::BYTES_INGRESS_TOTAL).increment(ingress);
                                metrics::counter!(telemetry::BYTES_EGRESS_TOTAL).increment(egress);
                            }
                            Err(err) => {
                                metrics::counter!(telemetry::STREAM_ERRORS_TOTAL).increment(1);
                                tracing::warn!(err = %err, "tunnel: stream aborted");
                            }
                        }
                    });
                }
                Err(err) => break Err(SessionError::Accept(err)),
            },
        }
    };

    sess.close().await;
    res
}

/// Relays one logical stream until either side closes or errors. Both ends
/// are dropped, and therefore closed, when this returns.
///
/// Returns the bytes copied gateway->destination and destination->gateway.
pub async fn serve_stream(
    mut st: BoxedStream,
    destination: &Destination,
    settings: &TunnelSettings,
) -> Result<(u64, u64), StreamError> {
    let deadline = Instant::now() + settings.stream_timeout;

    let work = async {
        let addr = destination.resolve(&mut st).await?;

        let mut up = match tokio::time::timeout(settings.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(c)) => c,
            Ok(Err(source)) => return Err(StreamError::Dial { addr, source }),
            Err(_) => {
                return Err(StreamError::Dial {
                    addr,
                    source: std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline exceeded"),
                });
            }
        };
        tracing::debug!(destination = %addr, "tunnel: relaying stream");

        let (mut st_r, mut st_w) = tokio::io::split(&mut st);
        let (mut up_r, mut up_w) = up.split();
        let (mut ingress, mut egress) = (0u64, 0u64);

        let res = tokio::select! {
            res = pipe(&mut st_r, &mut up_w, &mut ingress) => res,
            res = pipe(&mut up_r, &mut st_w, &mut egress) => res,
        };
        res.map_err(StreamError::Copy)?;
        Ok((ingress, egress))
    };

    tokio::time::timeout_at(deadline, work)
        .await
        .map_err(|_| StreamError::DeadlineExceeded)?
}

/// Copies `r` into `w` until EOF, counting bytes into `n`. `w` is shut down
/// on EOF.
async fn pipe<R, W>(r: &mut R, w: &mut W, n: &mut u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let k = r.read(&mut buf).await?;
        if k == 0 {
            let _ = w.shutdown().await;
            return Ok(());
        }
        w.write_all(&buf[..k]).await?;
        w.flush().await?;
        *n += k as u64;
    }
}

struct ActiveStreamGuard;

impl ActiveStreamGuard {
    fn new() -> Self {
        metrics::counter!(telemetry::STREAMS_TOTAL).increment(1);
        metrics::gauge!(telemetry::ACTIVE_STREAMS).increment(1.0);
        Self
    }
}

impl Drop for ActiveStreamGuard {
    fn drop(&mut self) {
        metrics::gauge!(telemetry::ACTIVE_STREAMS).decrement(1.0);
    }
}
