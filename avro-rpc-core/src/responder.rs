//! Server-side call dispatch: handshake processing, protocol caching, and
//! message invocation.

use std::collections::HashMap;
use std::sync::Arc;

use apache_avro::types::Value;
use apache_avro::{from_avro_datum, to_avro_datum};
use async_trait::async_trait;

use crate::alias::PRwLock;
use crate::connection::error::{Result, RpcError};
use crate::debug_error;
use crate::debug_log;
use crate::handshake::{HandshakeMatch, HandshakeRequest, HandshakeResponse};
use crate::schema::{Fingerprint, Protocol, METADATA_SCHEMA, SYSTEM_ERROR_SCHEMA};

/// Outcome of an application-level message handler.
pub enum HandlerOutcome {
    /// A value for the message's declared error union, excluding the
    /// leading `"string"` branch, e.g. the `DivByZero` branch of a
    /// `["string", "DivByZero"]` union. The responder writes it against
    /// the local message's `errors` schema.
    Declared(Value),
    /// An undeclared failure. Converted to a remote error carrying the
    /// text, the same as any other unhandled application exception.
    Application(String),
}

/// An application-level message handler, looked up by message name.
///
/// Per the "closed lookup table" design note, handlers are registered
/// once at construction rather than dispatched via runtime reflection.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn invoke(&self, request: Value) -> std::result::Result<Value, HandlerOutcome>;
}

type BoxedHandler = Box<dyn MessageHandler>;

/// Caches remote protocols the responder has already validated against
/// its own protocol, keyed by the client's fingerprint.
///
/// Pre-seeded at construction with `(localHash -> localProtocol)`: a
/// client whose `clientHash` happens to equal `localHash` resolves
/// immediately without ever sending protocol text.
struct ProtocolCache {
    local: Arc<Protocol>,
    remote_by_hash: PRwLock<HashMap<Fingerprint, Arc<Protocol>>>,
}

/// Dispatches handshake and call requests against one local protocol.
///
/// `respond` is the only mutating entry point; its sole mutable state is
/// the protocol cache, guarded by `PRwLock` so it is safe to call from
/// multiple worker threads at once.
pub struct Responder {
    cache: ProtocolCache,
    handlers: HashMap<String, BoxedHandler>,
}

impl Responder {
    pub fn new(local_protocol: Protocol) -> Self {
        let local = Arc::new(local_protocol);
        let mut remote_by_hash = HashMap::new();
        remote_by_hash.insert(local.fingerprint(), local.clone());
        Self {
            cache: ProtocolCache { local, remote_by_hash: PRwLock::new(remote_by_hash) },
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, message_name: impl Into<String>, handler: BoxedHandler) {
        self.handlers.insert(message_name.into(), handler);
    }

    pub fn local_protocol(&self) -> &Protocol {
        &self.cache.local
    }

    /// Processes one complete call request: handshake prefix followed by
    /// the call request body, and returns a complete call response,
    /// handshake response prefixed.
    ///
    /// Handshake decode, handshake resolution, request decode, and dispatch
    /// are one recoverable scope: any error escaping any of them, not just
    /// a dispatch failure, discards whatever was built and is replaced with
    /// a fresh system-error response. `Err` is reserved for failures while
    /// encoding that very fallback, which cannot happen for the fixed
    /// schemas used here.
    pub async fn respond(&self, call_request: &[u8]) -> Result<Vec<u8>> {
        match self.respond_inner(call_request).await {
            Ok(bytes) => Ok(bytes),
            Err(err) => {
                debug_error!("avro-rpc: request failed, discarding partial response: {err}");
                self.system_error_response(&err)
            }
        }
    }

    async fn respond_inner(&self, call_request: &[u8]) -> Result<Vec<u8>> {
        let mut reader = call_request;
        let handshake_request = HandshakeRequest::decode(&mut reader)?;
        let (handshake_response, remote) = self.process_handshake(&handshake_request)?;
        let handshake_bytes = handshake_response.encode()?;

        if handshake_response.handshake_match == HandshakeMatch::None {
            return Ok(handshake_bytes);
        }
        let remote = remote.expect("remote protocol is resolved whenever match != NONE");

        match self.handle_call(reader, &remote).await {
            Ok(mut body) => {
                let mut out = handshake_bytes;
                out.append(&mut body);
                Ok(out)
            }
            Err(err) => {
                debug_error!("avro-rpc: call failed, discarding partial response: {err}");
                let mut out = handshake_bytes;
                out.extend(system_error_tail(&err)?);
                Ok(out)
            }
        }
    }

    /// Builds a fresh response from nothing but local state, for when the
    /// handshake itself (steps 1-3) failed and no real handshake response
    /// was ever computed. The handshake half reports `NONE` with the
    /// server's own protocol, the same as an unresolvable client protocol
    /// would; the requestor never reads past `match` on a `NONE` response,
    /// so the trailing system-error payload is there for any peer willing
    /// to look, but is otherwise harmless.
    fn system_error_response(&self, err: &RpcError) -> Result<Vec<u8>> {
        let handshake_response = HandshakeResponse {
            handshake_match: HandshakeMatch::None,
            server_protocol: Some(self.cache.local.canonical_text().to_string()),
            server_hash: Some(self.cache.local.fingerprint()),
        };
        let mut out = handshake_response.encode()?;
        out.extend(system_error_tail(err)?);
        Ok(out)
    }

    /// Resolves the caller's protocol and computes the handshake match.
    fn process_handshake(&self, request: &HandshakeRequest) -> Result<(HandshakeResponse, Option<Arc<Protocol>>)> {
        let remote = if let Some(cached) = self.cache.remote_by_hash.read().get(&request.client_hash).cloned() {
            Some(cached)
        } else if let Some(text) = &request.client_protocol {
            let parsed = Arc::new(Protocol::parse(text)?);
            if parsed.fingerprint() != request.client_hash {
                return Err(RpcError::ProtocolViolation(
                    "clientHash does not match the fingerprint of the supplied clientProtocol".into(),
                ));
            }
            self.cache.remote_by_hash.write().insert(request.client_hash, parsed.clone());
            debug_log!("avro-rpc: cached new client protocol, fingerprint {:x?}", request.client_hash);
            Some(parsed)
        } else {
            None
        };

        let local_hash = self.cache.local.fingerprint();
        let handshake_match = match (&remote, request.server_hash == local_hash) {
            (None, _) => HandshakeMatch::None,
            (Some(_), true) => HandshakeMatch::Both,
            (Some(_), false) => HandshakeMatch::Client,
        };

        let response = HandshakeResponse {
            handshake_match,
            server_protocol: (handshake_match != HandshakeMatch::Both)
                .then(|| self.cache.local.canonical_text().to_string()),
            server_hash: (handshake_match != HandshakeMatch::Both).then_some(local_hash),
        };
        Ok((response, remote))
    }

    /// Decodes the request with schema resolution (remote writer, local
    /// reader) and dispatches to the registered handler.
    async fn handle_call(&self, mut reader: &[u8], remote: &Protocol) -> Result<Vec<u8>> {
        let _metadata = from_avro_datum(&METADATA_SCHEMA, &mut reader, None)?;
        let message_name = read_string(&mut reader)?;

        let local_message = self
            .cache
            .local
            .message(&message_name)
            .ok_or_else(|| RpcError::UnknownMessage(message_name.clone()))?;
        let remote_message = remote
            .message(&message_name)
            .ok_or_else(|| RpcError::UnknownMessage(message_name.clone()))?;

        let request_value = from_avro_datum(&remote_message.request, &mut reader, Some(&local_message.request))?;

        let mut out = to_avro_datum(&METADATA_SCHEMA, empty_metadata())?;
        match self.dispatch(&message_name, request_value).await {
            Ok(response_value) => {
                out.push(0u8);
                out.extend(to_avro_datum(&local_message.response, response_value)?);
            }
            Err(HandlerOutcome::Declared(error_value)) => {
                debug_log!("avro-rpc: message {message_name} failed with a declared error");
                out.push(1u8);
                out.extend(to_avro_datum(&local_message.errors, error_value)?);
            }
            Err(HandlerOutcome::Application(text)) => {
                debug_error!("avro-rpc: message {message_name} failed: {text}");
                out.push(1u8);
                let system_error = Value::Union(0, Box::new(Value::String(text)));
                out.extend(to_avro_datum(&local_message.errors, system_error)?);
            }
        }
        Ok(out)
    }

    async fn dispatch(&self, message_name: &str, request: Value) -> std::result::Result<Value, HandlerOutcome> {
        match self.handlers.get(message_name) {
            Some(handler) => handler.invoke(request).await,
            None => Err(HandlerOutcome::Application(format!("no handler registered for {message_name}"))),
        }
    }
}

fn empty_metadata() -> Value {
    Value::Map(HashMap::new())
}

/// The `metadata, errorFlag = true, systemError` tail shared by both
/// system-error fallbacks, encoded against the distinguished `["string"]`
/// union rather than any message-specific errors schema.
fn system_error_tail(err: &RpcError) -> Result<Vec<u8>> {
    let mut out = to_avro_datum(&METADATA_SCHEMA, empty_metadata())?;
    out.push(1u8); // errorFlag = true
    let system_error = Value::Union(0, Box::new(Value::String(err.to_string())));
    out.extend(to_avro_datum(&SYSTEM_ERROR_SCHEMA, system_error)?);
    Ok(out)
}

fn read_string(reader: &mut &[u8]) -> Result<String> {
    let value = from_avro_datum(&apache_avro::Schema::String, reader, None)?;
    match value {
        Value::String(s) => Ok(s),
        _ => Err(RpcError::ProtocolViolation("expected a string message name".into())),
    }
}
