//! Thin buffered wrapper around a Tokio `TcpStream`.
//!
//! Transport security (TLS, auth) is delegated to the underlying channel
//! and out of scope here; this module only provides the buffered
//! read/write halves the frame codec needs, plus the socket metadata a
//! `Transceiver` implementation may want to key a cache on.

use std::net::SocketAddr;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader, BufWriter, ReadBuf, ReadHalf, WriteHalf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::net::TcpStream;

/// Splits a `TcpStream` into buffered, address-aware reader/writer halves.
pub fn split_connection(stream: TcpStream) -> (TcpReader, TcpWriter) {
    let local_addr = stream.local_addr().ok();
    let remote_addr = stream.peer_addr().ok();
    let (read_half, write_half) = tokio::io::split(stream);
    (
        TcpReader::new(BufReader::new(read_half), local_addr, remote_addr),
        TcpWriter::new(BufWriter::new(write_half)),
    )
}

/// Buffered TCP reader carrying the connection's socket addresses.
pub struct TcpReader {
    inner: BufReader<ReadHalf<TcpStream>>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

/// Buffered TCP writer.
pub struct TcpWriter {
    inner: BufWriter<WriteHalf<TcpStream>>,
}

impl TcpReader {
    pub fn new(
        inner: BufReader<ReadHalf<TcpStream>>,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self { inner, local_addr, remote_addr }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

impl TcpWriter {
    pub fn new(inner: BufWriter<WriteHalf<TcpStream>>) -> Self {
        Self { inner }
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        tokio::io::AsyncWriteExt::flush(&mut self.inner).await
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        tokio::io::AsyncWriteExt::shutdown(&mut self.inner).await
    }
}

impl AsyncRead for TcpReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncBufRead for TcpReader {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<&[u8]>> {
        Pin::new(&mut self.get_mut().inner).poll_fill_buf(cx)
    }

    fn consume(mut self: Pin<&mut Self>, amt: usize) {
        Pin::new(&mut self.inner).consume(amt)
    }
}

impl AsyncWrite for TcpWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn reader_writer_split_preserves_addrs_and_io() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener_addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(listener_addr).await.unwrap();
        let (server_stream, client_addr) = listener.accept().await.unwrap();

        let (mut reader, mut writer) = split_connection(server_stream);

        assert_eq!(reader.local_addr(), Some(listener_addr));
        assert_eq!(reader.remote_addr(), Some(client_addr));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        writer.write_all(b"pong").await.unwrap();
        writer.flush().await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
    }
}
