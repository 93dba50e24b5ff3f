use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const TOKEN_LEN: usize = 36;
pub const VERSION_LEN: usize = 16;
pub const HEADER_LEN: usize = TOKEN_LEN + VERSION_LEN + 4;

pub const STATUS_OK: u16 = 200;

#[cfg(test)]
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("config payload too large: {0} bytes")]
    PayloadTooLarge(u32),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Fixed-size authentication header sent by the agent right after the TLS
/// handshake. All numeric fields are little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeHeader {
    token: [u8; TOKEN_LEN],
    version: [u8; VERSION_LEN],
    config_size: u32,
}

impl HandshakeHeader {
    /// Short values are zero-padded, long ones truncated. Neither field is
    /// null-terminated.
    pub fn new(token: &[u8], version: &[u8], config_size: u32) -> Self {
        let mut h = Self {
            token: [0u8; TOKEN_LEN],
            version: [0u8; VERSION_LEN],
            config_size,
        };
        copy_padded(&mut h.token, token);
        copy_padded(&mut h.version, version);
        h
    }

    #[cfg(test)]
    pub fn token(&self) -> &[u8] {
        trim_zeros(&self.token)
    }

    #[cfg(test)]
    pub fn version(&self) -> &[u8] {
        trim_zeros(&self.version)
    }

    pub fn config_size(&self) -> u32 {
        self.config_size
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..TOKEN_LEN].copy_from_slice(&self.token);
        out[TOKEN_LEN..TOKEN_LEN + VERSION_LEN].copy_from_slice(&self.version);
        out[TOKEN_LEN + VERSION_LEN..].copy_from_slice(&self.config_size.to_le_bytes());
        out
    }

    #[cfg(test)]
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        let mut token = [0u8; TOKEN_LEN];
        let mut version = [0u8; VERSION_LEN];
        token.copy_from_slice(&buf[..TOKEN_LEN]);
        version.copy_from_slice(&buf[TOKEN_LEN..TOKEN_LEN + VERSION_LEN]);
        let mut size = [0u8; 4];
        size.copy_from_slice(&buf[TOKEN_LEN + VERSION_LEN..]);
        Self {
            token,
            version,
            config_size: u32::from_le_bytes(size),
        }
    }
}

fn copy_padded(dst: &mut [u8], src: &[u8]) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
}

#[cfg(test)]
fn trim_zeros(b: &[u8]) -> &[u8] {
    let end = b.iter().rposition(|&c| c != 0).map_or(0, |i| i + 1);
    &b[..end]
}

/// Writes the header followed by the config payload and flushes.
///
/// The header is written in one piece; the payload is a second write.
pub async fn write_handshake<W: AsyncWrite + Unpin>(
    w: &mut W,
    header: &HandshakeHeader,
    payload: &[u8],
) -> std::io::Result<()> {
    w.write_all(&header.encode()).await?;
    w.write_all(payload).await?;
    w.flush().await
}

/// Gateway side of [`write_handshake`].
#[cfg(test)]
pub async fn read_handshake<R: AsyncRead + Unpin>(
    r: &mut R,
    max_config_bytes: u32,
) -> Result<(HandshakeHeader, Vec<u8>), HandshakeError> {
    let mut buf = [0u8; HEADER_LEN];
    r.read_exact(&mut buf).await?;
    let header = HandshakeHeader::decode(&buf);
    if header.config_size > max_config_bytes {
        return Err(HandshakeError::PayloadTooLarge(header.config_size));
    }
    let mut payload = vec![0u8; header.config_size as usize];
    r.read_exact(&mut payload).await?;
    Ok((header, payload))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub status: u16,
    pub message: String,
}

impl HandshakeResponse {
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// Reads the gateway's answer. With `with_message` the status is followed by a
/// `u16` message length and the message itself.
pub async fn read_response<R: AsyncRead + Unpin>(
    r: &mut R,
    with_message: bool,
) -> std::io::Result<HandshakeResponse> {
    let status = r.read_u16_le().await?;
    let mut message = String::new();
    if with_message {
        let n = r.read_u16_le().await?;
        let mut buf = vec![0u8; n as usize];
        r.read_exact(&mut buf).await?;
        message = String::from_utf8_lossy(&buf).into_owned();
    }
    Ok(HandshakeResponse { status, message })
}

#[cfg(test)]
pub async fn write_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    resp: &HandshakeResponse,
    with_message: bool,
) -> std::io::Result<()> {
    w.write_u16_le(resp.status).await?;
    if with_message {
        let msg = resp.message.as_bytes();
        let n = msg.len().min(u16::MAX as usize);
        w.write_u16_le(n as u16).await?;
        w.write_all(&msg[..n]).await?;
    }
    w.flush().await
}

/// Reads the per-stream destination frame: `u16` length, then `host:port`.
pub async fn read_destination<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<String> {
    let n = r.read_u16_le().await?;
    if n == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "empty destination",
        ));
    }
    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    String::from_utf8(buf)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "destination is not utf-8"))
}

#[cfg(test)]
pub async fn write_destination<W: AsyncWrite + Unpin>(w: &mut W, addr: &str) -> std::io::Result<()> {
    let b = addr.as_bytes();
    let n: u16 = b.len().try_into().map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "destination too long")
    })?;
    w.write_u16_le(n).await?;
    w.write_all(b).await?;
    w.flush().await
}
