//! The `Transceiver` abstraction: a bidirectional, ordered message channel
//! the requestor drives. Concrete implementations own the physical
//! connection; this module defines the trait plus an HTTP binding.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::connection::error::{Result, RpcError};
use crate::debug_log;
use crate::frame::{frame_decode, frame_encode};

pub const AVRO_CONTENT_TYPE: &str = "avro/binary";

/// One call's worth of framed bytes flowing in each direction.
#[async_trait]
pub trait Transceiver: Send {
    /// A human-meaningful name for the remote peer, when known. Used for
    /// logging only; nothing in the protocol depends on its value.
    fn remote_name(&self) -> Option<String>;

    async fn read_message(&mut self) -> Result<Vec<u8>>;

    async fn write_message(&mut self, message: &[u8]) -> Result<()>;

    /// Writes `request` and returns the matching response. The default
    /// implementation is adequate for transports where each call is its
    /// own exchange (e.g. HTTP); stream transports may override to pin
    /// call/response ordering explicitly.
    async fn transceive(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        self.write_message(request).await?;
        self.read_message().await
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// HTTP binding: one POST carries exactly one RPC. Connections are not
/// pooled: a fresh `TcpStream` is opened for every `transceive` call (see
/// DESIGN.md's resolution of the corresponding Open Question).
pub struct HttpTransceiver {
    host: String,
    port: u16,
    path: String,
    last_remote_addr: Option<SocketAddr>,
}

impl HttpTransceiver {
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self { host: host.into(), port, path: path.into(), last_remote_addr: None }
    }

    async fn connect(&mut self) -> Result<TcpStream> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        self.last_remote_addr = stream.peer_addr().ok();
        Ok(stream)
    }
}

#[async_trait]
impl Transceiver for HttpTransceiver {
    fn remote_name(&self) -> Option<String> {
        self.last_remote_addr.map(|addr| addr.to_string())
    }

    async fn read_message(&mut self) -> Result<Vec<u8>> {
        Err(RpcError::Other("HttpTransceiver only supports transceive(), not independent read_message()".into()))
    }

    async fn write_message(&mut self, _message: &[u8]) -> Result<()> {
        Err(RpcError::Other("HttpTransceiver only supports transceive(), not independent write_message()".into()))
    }

    async fn transceive(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let mut stream = self.connect().await?;
        let framed_body = frame_encode(request);

        let mut head = String::new();
        head.push_str(&format!("POST {} HTTP/1.1\r\n", self.path));
        head.push_str(&format!("Host: {}:{}\r\n", self.host, self.port));
        head.push_str(&format!("Content-Type: {}\r\n", AVRO_CONTENT_TYPE));
        head.push_str(&format!("Content-Length: {}\r\n", framed_body.len()));
        head.push_str("Connection: close\r\n\r\n");

        stream.write_all(head.as_bytes()).await?;
        stream.write_all(&framed_body).await?;
        stream.flush().await?;

        debug_log!("avro-rpc: sent {} bytes to {}:{}{}", framed_body.len(), self.host, self.port, self.path);

        let mut reader = BufReader::new(stream);
        let (_status, content_length) = read_http_response_head(&mut reader).await?;
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await?;
        frame_decode(&body)
    }
}

/// Reads an HTTP/1.1 response's status line and headers, returning the
/// status code and `Content-Length`. Minimal on purpose: this crate's HTTP
/// binding never needs chunked transfer-encoding, redirects, or keep-alive.
async fn read_http_response_head(reader: &mut BufReader<TcpStream>) -> Result<(u16, usize)> {
    use tokio::io::AsyncBufReadExt;

    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    if status_line.is_empty() {
        return Err(RpcError::ConnectionClosed);
    }
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| RpcError::ProtocolViolation(format!("malformed HTTP status line: {status_line:?}")))?;

    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().map_err(|_| {
                    RpcError::ProtocolViolation(format!("malformed Content-Length: {value:?}"))
                })?;
            }
        }
    }

    if status != 200 {
        return Err(RpcError::ProtocolViolation(format!("unexpected HTTP status {status}")));
    }
    Ok((status, content_length))
}
