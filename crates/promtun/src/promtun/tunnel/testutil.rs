//! Loopback gateway and destination fixtures for the tunnel tests.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::{TlsAcceptor, server::TlsStream};

use crate::promtun::tunnel::handshake::{self, HandshakeHeader, HandshakeResponse};

pub const TOKEN: &str = "b8ea8af6-ffee-44b3-aa9a-1fc02233cfb7";

/// A TLS listener with a throwaway self-signed certificate.
pub struct Gateway {
    pub addr: String,
    ln: TcpListener,
    acceptor: TlsAcceptor,
}

impl Gateway {
    pub async fn start() -> Self {
        let rcgen::CertifiedKey { cert, signing_key } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()])
                .expect("generate cert");
        let cert_der: CertificateDer<'static> = cert.der().clone();
        let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));

        let cfg = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .expect("server config");

        let ln = TcpListener::bind("127.0.0.1:0").await.expect("bind gateway");
        let addr = ln.local_addr().expect("local addr").to_string();
        Self {
            addr,
            ln,
            acceptor: TlsAcceptor::from(Arc::new(cfg)),
        }
    }

    pub async fn accept_tls(&self) -> TlsStream<TcpStream> {
        let (c, _) = self.ln.accept().await.expect("accept");
        self.acceptor.accept(c).await.expect("tls accept")
    }

    /// Accepts one agent and reads its handshake, without answering.
    pub async fn accept_handshake(&self) -> (TlsStream<TcpStream>, HandshakeHeader, Vec<u8>) {
        let mut conn = self.accept_tls().await;
        let (header, payload) = handshake::read_handshake(&mut conn, 1 << 20)
            .await
            .expect("read handshake");
        (conn, header, payload)
    }
}

/// Answers a handshake with status 200.
pub async fn accept(conn: &mut TlsStream<TcpStream>, with_message: bool) {
    let resp = HandshakeResponse {
        status: handshake::STATUS_OK,
        message: String::new(),
    };
    handshake::write_response(conn, &resp, with_message)
        .await
        .expect("write response");
}

/// Minimal HTTP responder: reads one request head, answers `body`, closes.
pub async fn http_responder(body: &'static str) -> String {
    let ln = TcpListener::bind("127.0.0.1:0").await.expect("bind responder");
    let addr = ln.local_addr().expect("local addr").to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut c, _)) = ln.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match c.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let resp = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = c.write_all(resp.as_bytes()).await;
                let _ = c.shutdown().await;
            });
        }
    });
    addr
}

pub const HEALTH_REQUEST: &[u8] = b"GET /-/healthy HTTP/1.1\r\nHost: any\r\nConnection: close\r\n\r\n";

/// What the destination answers when asked directly.
pub async fn direct_response(addr: &str) -> Vec<u8> {
    let mut c = TcpStream::connect(addr).await.expect("connect responder");
    c.write_all(HEALTH_REQUEST).await.expect("write request");
    let mut out = Vec::new();
    c.read_to_end(&mut out).await.expect("read response");
    out
}
