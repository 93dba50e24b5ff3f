use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

pub fn mux_config(keepalive_interval: Duration) -> tokio_yamux::Config {
    tokio_yamux::Config {
        enable_keepalive: true,
        keepalive_interval,
        ..tokio_yamux::Config::default()
    }
}

/// One yamux session over a physical connection.
///
/// The session is driven by a background task that forwards inbound streams;
/// closing the session aborts that task, which drops the connection.
pub struct YamuxSession {
    control: tokio::sync::Mutex<tokio_yamux::Control>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<tokio_yamux::StreamHandle>>,
    task: tokio::task::JoinHandle<()>,
}

impl YamuxSession {
    pub fn server(conn: BoxedStream, cfg: tokio_yamux::Config) -> Self {
        Self::from_session(tokio_yamux::Session::new_server(conn, cfg))
    }

    #[cfg(test)]
    pub fn client(conn: BoxedStream, cfg: tokio_yamux::Config) -> Self {
        Self::from_session(tokio_yamux::Session::new_client(conn, cfg))
    }

    fn from_session(mut session: tokio_yamux::Session<BoxedStream>) -> Self {
        let control = session.control();

        let (tx, rx) = mpsc::channel::<tokio_yamux::StreamHandle>(64);
        let task = tokio::spawn(async move {
            while let Some(next) = session.next().await {
                match next {
                    Ok(st) => {
                        if tx.send(st).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(err = %err, "tunnel: session terminated");
                        break;
                    }
                }
            }
        });

        Self {
            control: tokio::sync::Mutex::new(control),
            incoming: tokio::sync::Mutex::new(rx),
            task,
        }
    }

    /// Blocks until the peer opens a stream or the session dies.
    pub async fn accept_stream(&self) -> std::io::Result<BoxedStream> {
        let mut rx = self.incoming.lock().await;
        let st = rx.recv().await.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::ConnectionAborted, "session closed")
        })?;
        Ok(Box::new(st))
    }

    #[cfg(test)]
    pub async fn open_stream(&self) -> std::io::Result<BoxedStream> {
        let mut ctrl = self.control.lock().await;
        let st = ctrl
            .open_stream()
            .await
            .map_err(|err| std::io::Error::other(err.to_string()))?;
        Ok(Box::new(st))
    }

    pub async fn close(&self) {
        self.task.abort();
        let mut ctrl = self.control.lock().await;
        ctrl.close().await;
    }
}

impl Drop for YamuxSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}
