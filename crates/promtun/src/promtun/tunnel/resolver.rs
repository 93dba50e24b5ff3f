use async_trait::async_trait;
use thiserror::Error;

use crate::promtun::tunnel::TunnelSettings;

pub const TOKEN_HEADER: &str = "X-Token";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("{status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Source of the desired gateway endpoint set.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    async fn resolve(&self) -> Result<Vec<String>, ResolveError>;
}

pub struct HttpResolver {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl HttpResolver {
    pub fn new(url: &str, token: &str, settings: &TunnelSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .danger_accept_invalid_certs(settings.tls_skip_verify)
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            token: token.to_string(),
        })
    }
}

#[async_trait]
impl EndpointResolver for HttpResolver {
    async fn resolve(&self) -> Result<Vec<String>, ResolveError> {
        let resp = self
            .client
            .get(&self.url)
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if status != reqwest::StatusCode::OK {
            return Err(ResolveError::Status { status, body });
        }
        Ok(parse_endpoints(&body))
    }
}

/// Splits a resolver body into endpoints: trimmed, `;`-separated, empty
/// entries dropped.
pub fn parse_endpoints(body: &str) -> Vec<String> {
    body.trim()
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
