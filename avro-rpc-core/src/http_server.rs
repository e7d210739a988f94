//! Multi-threaded HTTP server adapter: accepts connections, parses one
//! HTTP request per connection, and feeds the framed call bytes to a
//! [`Responder`].
//!
//! Bootstrap follows the `App`/`AppBuilder` pattern (own tokio runtime,
//! worker-count builder method, ctrl-c shutdown, per-connection timeout)
//! scoped down to the single-endpoint POST/200/avro-binary exchange this
//! binding requires. No routing, no middleware.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::connection::error::{Result, RpcError};
use crate::debug_error;
use crate::debug_log;
use crate::debug_warn;
use crate::frame::{frame_decode, frame_encode};
use crate::responder::Responder;
use crate::transceiver::AVRO_CONTENT_TYPE;

/// Server configuration, built with [`RpcServerBuilder`].
pub struct RpcServer {
    binding_address: String,
    responder: Arc<Responder>,
    worker: usize,
    max_connection_time: Duration,
}

pub struct RpcServerBuilder {
    binding_address: Option<String>,
    responder: Option<Arc<Responder>>,
    worker: Option<usize>,
    max_connection_time: Option<Duration>,
}

impl RpcServerBuilder {
    pub fn new() -> Self {
        Self { binding_address: None, responder: None, worker: None, max_connection_time: None }
    }

    pub fn binding(mut self, binding: impl Into<String>) -> Self {
        self.binding_address = Some(binding.into());
        self
    }

    pub fn responder(mut self, responder: Responder) -> Self {
        self.responder = Some(Arc::new(responder));
        self
    }

    /// Worker threads for the server's own tokio runtime. Defaults to the
    /// number of available CPUs.
    pub fn worker(mut self, threads: usize) -> Self {
        self.worker = Some(threads);
        self
    }

    pub fn max_connection_time(mut self, duration: Duration) -> Self {
        self.max_connection_time = Some(duration);
        self
    }

    pub fn build(self) -> Arc<RpcServer> {
        Arc::new(RpcServer {
            binding_address: self.binding_address.unwrap_or_else(|| "127.0.0.1:3030".to_string()),
            responder: self.responder.expect("RpcServerBuilder requires a responder"),
            worker: self.worker.unwrap_or_else(num_cpus),
            max_connection_time: self.max_connection_time.unwrap_or(Duration::from_secs(30)),
        })
    }
}

impl RpcServer {
    pub fn new() -> RpcServerBuilder {
        RpcServerBuilder::new()
    }

    /// Runs the server with its own dedicated multi-threaded tokio
    /// runtime, blocking until a ctrl-c signal triggers shutdown.
    pub async fn run(self: Arc<Self>) {
        let worker_count = self.worker;
        let app = self.clone();
        tokio::task::spawn_blocking(move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(worker_count)
                .enable_all()
                .build()
                .expect("failed to create tokio runtime");
            runtime.block_on(app.run_accept_loop());
        })
        .await
        .expect("server runtime task panicked");
    }

    async fn run_accept_loop(self: Arc<Self>) {
        let listener = TcpListener::bind(&self.binding_address)
            .await
            .unwrap_or_else(|e| panic!("failed to bind {}: {e}", self.binding_address));

        debug_log!("avro-rpc: listening on {}", listener.local_addr().map(|a| a.to_string()).unwrap_or_default());

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug_log!("avro-rpc: received shutdown signal");
                let _ = shutdown_tx.send(());
            }
        });

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug_log!("avro-rpc: accepted connection from {addr}");
                            Arc::clone(&self).handle_connection(stream);
                        }
                        Err(e) => debug_error!("avro-rpc: failed to accept connection: {e}"),
                    }
                }
                _ = &mut shutdown_rx => {
                    debug_log!("avro-rpc: shutting down");
                    break;
                }
            }
        }
    }

    fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let timeout = self.max_connection_time;
        tokio::spawn(async move {
            tokio::select! {
                result = self.serve_one_exchange(stream) => {
                    if let Err(e) = result {
                        debug_error!("avro-rpc: connection error: {e}");
                    }
                }
                _ = tokio::time::sleep(timeout) => {
                    debug_warn!("avro-rpc: connection timed out after {:?}", timeout);
                }
            }
        });
    }

    /// Exactly one RPC per HTTP exchange. The server does not keep the
    /// connection open for a second request.
    async fn serve_one_exchange(&self, stream: TcpStream) -> Result<()> {
        let mut reader = BufReader::new(stream);
        let content_length = read_http_request_head(&mut reader).await?;

        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await?;
        let call_request = frame_decode(&body)?;

        let call_response = self.responder.respond(&call_request).await?;
        let framed_response = frame_encode(&call_response);

        let mut stream = reader.into_inner();
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            AVRO_CONTENT_TYPE,
            framed_response.len()
        );
        stream.write_all(head.as_bytes()).await?;
        stream.write_all(&framed_response).await?;
        stream.flush().await?;
        stream.shutdown().await?;
        Ok(())
    }
}

/// Parses an HTTP/1.1 request line and headers, returning `Content-Length`.
/// Rejects anything other than a POST.
async fn read_http_request_head(reader: &mut BufReader<TcpStream>) -> Result<usize> {
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    if request_line.is_empty() {
        return Err(RpcError::ConnectionClosed);
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    if method != "POST" {
        return Err(RpcError::ProtocolViolation(format!("unsupported HTTP method: {method}")));
    }

    let mut content_length = None;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().ok();
            }
        }
    }

    content_length.ok_or_else(|| RpcError::ProtocolViolation("request missing Content-Length".into()))
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}
