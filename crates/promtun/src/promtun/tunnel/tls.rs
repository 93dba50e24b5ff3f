use std::sync::Arc;

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, ServerName, UnixTime},
};

use crate::promtun::net;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Client config for gateway connections. Verification uses the bundled
/// webpki roots unless `insecure_skip_verify` is set.
pub fn client_config(insecure_skip_verify: bool) -> anyhow::Result<Arc<rustls::ClientConfig>> {
    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?;

    if insecure_skip_verify {
        let cfg = builder
            .dangerous()
            .with_custom_certificate_verifier(SkipServerVerification::new())
            .with_no_client_auth();
        return Ok(Arc::new(cfg));
    }

    let roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let cfg = builder.with_root_certificates(roots).with_no_client_auth();
    Ok(Arc::new(cfg))
}

/// SNI / verification name for a gateway. Falls back to the endpoint's host
/// when no server name is configured.
pub fn server_name(configured: &str, endpoint: &str) -> std::io::Result<ServerName<'static>> {
    let name = match configured.trim() {
        "" => net::host_of(endpoint),
        s => s,
    };
    ServerName::try_from(name.to_string()).map_err(|err| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid tls server name {name:?}: {err}"),
        )
    })
}

/// Dummy certificate verifier that treats any certificate as valid.
///
/// NOTE: vulnerable to MITM. Intended for local dev / testing only.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(provider()))
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_prefers_configured() {
        let n = server_name("gw.coroot.com", "10.0.0.1:443").unwrap();
        assert_eq!(n, ServerName::try_from("gw.coroot.com").unwrap());
    }

    #[test]
    fn server_name_falls_back_to_endpoint_host() {
        let n = server_name("", "127.0.0.1:4433").unwrap();
        assert!(matches!(n, ServerName::IpAddress(_)));

        let n = server_name(" ", "[::1]:4433").unwrap();
        assert!(matches!(n, ServerName::IpAddress(_)));
    }

    #[test]
    fn skip_verify_and_verifying_configs_build() {
        assert!(client_config(true).is_ok());
        assert!(client_config(false).is_ok());
    }
}
