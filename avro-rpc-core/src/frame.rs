//! Frame codec: a message is a sequence of size-prefixed buffers
//! terminated by a zero-length buffer, the framing Avro RPC uses to
//! decouple message boundaries from TCP or HTTP chunking.
//!
//! `uint32` sizes are big-endian on the wire.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::connection::error::{Result, RpcError};

/// Largest single buffer a `FrameWriter` emits before starting a new one.
///
/// Chunking is bounded with `min(BUFFER_SIZE, remaining)` (see DESIGN.md),
/// so no single frame exceeds `BUFFER_SIZE` regardless of message size.
pub const BUFFER_SIZE: usize = 8192;

/// Reads whole messages off an `AsyncRead`, reassembling frames.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Reads one message: frames until a zero-length frame terminates it.
    ///
    /// Any EOF, whether before the first byte or mid-frame, is reported as
    /// [`RpcError::ConnectionClosed`]. A partial frame means the peer went
    /// away, not a malformed message.
    pub async fn read_message(&mut self) -> Result<Vec<u8>> {
        let mut message = BytesMut::new();
        loop {
            let len = self.read_u32().await?;
            if len == 0 {
                return Ok(message.to_vec());
            }
            let mut chunk = vec![0u8; len as usize];
            self.inner.read_exact(&mut chunk).await.map_err(|_| RpcError::ConnectionClosed)?;
            message.put_slice(&chunk);
        }
    }

    async fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf).await?;
        Ok(u32::from_be_bytes(buf))
    }
}

/// Writes whole messages to an `AsyncWrite`, chunking into frames.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Writes `message` as one or more size-prefixed frames followed by
    /// the terminating zero-length frame, then flushes.
    pub async fn write_message(&mut self, message: &[u8]) -> Result<()> {
        let mut remaining = message;
        while !remaining.is_empty() {
            let chunk_len = remaining.len().min(BUFFER_SIZE);
            let (chunk, rest) = remaining.split_at(chunk_len);
            self.write_frame(chunk).await?;
            remaining = rest;
        }
        self.write_frame(&[]).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn write_frame(&mut self, chunk: &[u8]) -> Result<()> {
        let mut header = BytesMut::with_capacity(4);
        header.put_u32(chunk.len() as u32);
        self.inner.write_all(&header).await?;
        if !chunk.is_empty() {
            self.inner.write_all(chunk).await?;
        }
        Ok(())
    }
}

/// Encodes `message` as a standalone framed byte buffer (used by the HTTP
/// binding, which frames the call bytes into the HTTP body rather than
/// writing them straight to a socket).
pub fn frame_encode(message: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::new();
    let mut remaining = message;
    while !remaining.is_empty() {
        let chunk_len = remaining.len().min(BUFFER_SIZE);
        let (chunk, rest) = remaining.split_at(chunk_len);
        out.put_u32(chunk.len() as u32);
        out.put_slice(chunk);
        remaining = rest;
    }
    out.put_u32(0);
    out.to_vec()
}

/// Decodes a complete framed byte buffer back into the original message.
pub fn frame_decode(mut framed: &[u8]) -> Result<Vec<u8>> {
    let mut message = BytesMut::new();
    loop {
        if framed.len() < 4 {
            return Err(RpcError::ProtocolViolation("truncated frame header".into()));
        }
        let len = framed.get_u32() as usize;
        if len == 0 {
            return Ok(message.to_vec());
        }
        if framed.len() < len {
            return Err(RpcError::ProtocolViolation("truncated frame body".into()));
        }
        message.put_slice(&framed[..len]);
        framed.advance(len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn round_trips_a_message_across_multiple_frames() {
        let (client, server) = duplex(64 * 1024);
        let (client_reader, client_writer) = tokio::io::split(client);
        let (server_reader, server_writer) = tokio::io::split(server);

        let payload = vec![7u8; BUFFER_SIZE * 2 + 42];
        let payload_clone = payload.clone();

        let writer_task = tokio::spawn(async move {
            let mut writer = FrameWriter::new(client_writer);
            writer.write_message(&payload_clone).await.unwrap();
        });
        drop(client_reader);

        let mut reader = FrameReader::new(server_reader);
        let received = reader.read_message().await.unwrap();
        writer_task.await.unwrap();
        drop(server_writer);

        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn empty_message_is_a_single_zero_length_frame() {
        let (client, server) = duplex(64);
        let (_client_reader, client_writer) = tokio::io::split(client);
        let (server_reader, _server_writer) = tokio::io::split(server);

        let mut writer = FrameWriter::new(client_writer);
        writer.write_message(&[]).await.unwrap();

        let mut reader = FrameReader::new(server_reader);
        let received = reader.read_message().await.unwrap();
        assert!(received.is_empty());
    }

    #[test]
    fn frame_encode_decode_round_trip() {
        let message = b"hello avro".to_vec();
        let framed = frame_encode(&message);
        let decoded = frame_decode(&framed).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn empty_message_is_exactly_one_terminator_frame() {
        // Regression test: an earlier version wrote the terminator twice for
        // an empty message (once from a pre-loop special case, once after
        // the now-empty loop), leaving a stray `00 00 00 00` that would eat
        // the next message's size header on a shared channel.
        assert_eq!(frame_encode(&[]), [0u8, 0, 0, 0]);
    }

    #[tokio::test]
    async fn two_messages_in_sequence_do_not_desync_after_an_empty_message() {
        let (client, server) = duplex(64 * 1024);
        let (client_reader, client_writer) = tokio::io::split(client);
        let (server_reader, server_writer) = tokio::io::split(server);

        let writer_task = tokio::spawn(async move {
            let mut writer = FrameWriter::new(client_writer);
            writer.write_message(&[]).await.unwrap();
            writer.write_message(b"second message").await.unwrap();
        });
        drop(client_reader);

        let mut reader = FrameReader::new(server_reader);
        let first = reader.read_message().await.unwrap();
        let second = reader.read_message().await.unwrap();
        writer_task.await.unwrap();
        drop(server_writer);

        assert!(first.is_empty());
        assert_eq!(second, b"second message");
    }

    #[tokio::test]
    async fn truncated_frame_surfaces_connection_closed_with_no_partial_datum() {
        // A frame header claims more bytes than are actually delivered
        // before the channel closes.
        let (client, server) = duplex(64);
        let (_client_reader, mut client_writer) = tokio::io::split(client);
        let (server_reader, server_writer) = tokio::io::split(server);

        let mut header = BytesMut::with_capacity(4);
        header.put_u32(1024);
        client_writer.write_all(&header).await.unwrap();
        client_writer.write_all(&[0u8; 100]).await.unwrap();
        client_writer.flush().await.unwrap();
        drop(client_writer);
        drop(server_writer);

        let mut reader = FrameReader::new(server_reader);
        let result = reader.read_message().await;
        assert!(matches!(result, Err(RpcError::ConnectionClosed)));
    }
}
