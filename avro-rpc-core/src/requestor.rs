//! Client-side call construction: handshake negotiation and response
//! decoding, driving an arbitrary [`Transceiver`].

use std::collections::HashMap;

use apache_avro::types::Value;
use apache_avro::{from_avro_datum, to_avro_datum, Schema};

use crate::connection::error::{Result, RpcError};
use crate::debug_log;
use crate::handshake::{HandshakeMatch, HandshakeRequest, HandshakeResponse};
use crate::schema::{Fingerprint, Protocol, METADATA_SCHEMA};
use crate::transceiver::Transceiver;

/// A successful call's decoded response, or the remote's declared error.
pub enum CallResult {
    Response(Value),
    /// The branch of the message's `errors` union the server chose,
    /// including the system-error `string` branch for undeclared
    /// failures the responder converted on the application's behalf.
    RemoteError(Value),
}

/// Bound on handshake attempts within a single `request` call. Reentrant
/// retry is expressed as a bounded loop rather than recursion, so the
/// termination proof does not depend on the call stack. The second attempt
/// always sets `sendProtocol = true`, which forces the responder to answer
/// `BOTH` or `CLIENT`.
const MAX_HANDSHAKE_ATTEMPTS: u32 = 2;

/// Drives one logical protocol session over a [`Transceiver`].
///
/// A `Requestor` is not shared across concurrent calls: each call is
/// issued, handshaken, and completed before the next begins, so the
/// per-peer state below is owned outright, with no internal locking.
pub struct Requestor<T: Transceiver> {
    local_protocol: Protocol,
    transceiver: T,
    /// Set once a `CLIENT`/`NONE` response tells us the peer's protocol,
    /// so the remote message's schemas are available for schema
    /// resolution on the next call's response.
    remote_protocol: Option<Protocol>,
    remote_hash: Option<Fingerprint>,
    /// Whether the next handshake must include the full protocol text.
    /// Starts `false`: the requestor optimistically guesses the peer
    /// already runs `localProtocol`.
    send_protocol: bool,
}

impl<T: Transceiver> Requestor<T> {
    pub fn new(local_protocol: Protocol, transceiver: T) -> Self {
        Self { local_protocol, transceiver, remote_protocol: None, remote_hash: None, send_protocol: false }
    }

    pub fn transceiver(&self) -> &T {
        &self.transceiver
    }

    /// Issues `message_name(request)` against the remote, handshaking as
    /// needed. Retries at most once if the server reports `NONE`.
    pub async fn request(&mut self, message_name: &str, request: Value) -> Result<CallResult> {
        let local_message = self
            .local_protocol
            .message(message_name)
            .ok_or_else(|| RpcError::UnknownMessage(message_name.to_string()))?
            .clone();

        for attempt in 0..MAX_HANDSHAKE_ATTEMPTS {
            let client_hash = self.local_protocol.fingerprint();
            let handshake = HandshakeRequest {
                client_hash,
                client_protocol: self.send_protocol.then(|| self.local_protocol.canonical_text().to_string()),
                server_hash: self.remote_hash.unwrap_or(client_hash),
            };

            let mut call_request = handshake.encode()?;
            call_request.extend(to_avro_datum(&METADATA_SCHEMA, Value::Map(HashMap::new()))?);
            call_request.extend(to_avro_datum(&Schema::String, Value::String(message_name.to_string()))?);
            call_request.extend(to_avro_datum(&local_message.request, request.clone())?);

            let call_response = self.transceiver.transceive(&call_request).await?;
            let mut cursor = call_response.as_slice();
            let handshake_response = HandshakeResponse::decode(&mut cursor)?;

            let call_follows = self.apply_handshake_response(&handshake_response)?;
            if !call_follows {
                if attempt + 1 < MAX_HANDSHAKE_ATTEMPTS {
                    debug_log!("avro-rpc: handshake NONE, retrying with full protocol text");
                    continue;
                }
                return Err(RpcError::ProtocolViolation(
                    "handshake failed to converge after the retry bound".into(),
                ));
            }

            let _metadata = from_avro_datum(&METADATA_SCHEMA, &mut cursor, None)?;
            if cursor.is_empty() {
                return Err(RpcError::ProtocolViolation("call response missing after successful handshake".into()));
            }
            let is_error = cursor[0] != 0;
            cursor = &cursor[1..];

            // `remote_protocol` is `None` only when no CLIENT/NONE response has
            // ever told us otherwise, i.e. the remote is known to run exactly
            // `local_protocol` (match = BOTH on the very first handshake). Once
            // it is `Some`, a miss is a real unknown-message condition, not a
            // reason to fall back to the local schema.
            let remote_message = match &self.remote_protocol {
                Some(remote) => remote
                    .message(message_name)
                    .ok_or_else(|| RpcError::UnknownMessage(message_name.to_string()))?,
                None => &local_message,
            };

            return if is_error {
                let error_value = from_avro_datum(&remote_message.errors, &mut cursor, Some(&local_message.errors))?;
                Ok(CallResult::RemoteError(error_value))
            } else {
                let response_value =
                    from_avro_datum(&remote_message.response, &mut cursor, Some(&local_message.response))?;
                Ok(CallResult::Response(response_value))
            };
        }

        unreachable!("loop above always returns or errors within MAX_HANDSHAKE_ATTEMPTS")
    }

    /// Applies the handshake response handling table. Returns whether a
    /// call response follows in the same buffer.
    fn apply_handshake_response(&mut self, response: &HandshakeResponse) -> Result<bool> {
        match response.handshake_match {
            HandshakeMatch::Both => {
                self.send_protocol = false;
                Ok(true)
            }
            HandshakeMatch::Client => {
                if let Some(text) = &response.server_protocol {
                    self.remote_protocol = Some(Protocol::parse(text)?);
                }
                self.remote_hash = response.server_hash;
                self.send_protocol = false;
                Ok(true)
            }
            HandshakeMatch::None => {
                if let Some(text) = &response.server_protocol {
                    self.remote_protocol = Some(Protocol::parse(text)?);
                }
                self.remote_hash = response.server_hash;
                self.send_protocol = true;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::responder::{HandlerOutcome, MessageHandler, Responder};
    use crate::transceiver::Transceiver;
    use async_trait::async_trait;

    const ECHO_PROTOCOL: &str = r#"{
        "protocol": "Echo",
        "messages": {
            "echo": {
                "request": [{"name": "message", "type": "string"}],
                "response": "string"
            }
        }
    }"#;

    const ECHO_PROTOCOL_V2: &str = r#"{
        "protocol": "EchoV2",
        "messages": {
            "echo": {
                "request": [{"name": "message", "type": "string"}],
                "response": "string"
            }
        }
    }"#;

    /// Same `echo` message as `ECHO_PROTOCOL`, plus an `extra` message the
    /// server (running `ECHO_PROTOCOL`) has never heard of.
    const ECHO_PROTOCOL_WITH_EXTRA: &str = r#"{
        "protocol": "EchoExtra",
        "messages": {
            "echo": {
                "request": [{"name": "message", "type": "string"}],
                "response": "string"
            },
            "extra": {
                "request": [],
                "response": "string"
            }
        }
    }"#;

    const DIVIDE_PROTOCOL: &str = r#"{
        "protocol": "Divide",
        "messages": {
            "divide": {
                "request": [{"name": "numerator", "type": "int"}, {"name": "denominator", "type": "int"}],
                "response": "int",
                "errors": ["DivByZero"]
            }
        },
        "types": [
            {"type": "record", "name": "DivByZero", "fields": [{"name": "message", "type": "string"}]}
        ]
    }"#;

    struct EchoHandler;

    #[async_trait]
    impl MessageHandler for EchoHandler {
        async fn invoke(&self, request: Value) -> std::result::Result<Value, HandlerOutcome> {
            match request {
                Value::Record(fields) => {
                    Ok(fields.into_iter().find(|(n, _)| n == "message").map(|(_, v)| v).unwrap())
                }
                _ => Err(HandlerOutcome::Application("bad request".into())),
            }
        }
    }

    /// An in-process transceiver wired directly to a `Responder`, so the
    /// requestor/responder contract can be tested without a real socket.
    struct InProcessTransceiver {
        responder: Responder,
    }

    #[async_trait]
    impl Transceiver for InProcessTransceiver {
        fn remote_name(&self) -> Option<String> {
            Some("in-process".into())
        }

        async fn read_message(&mut self) -> Result<Vec<u8>> {
            unreachable!("transceive is overridden below")
        }

        async fn write_message(&mut self, _message: &[u8]) -> Result<()> {
            unreachable!("transceive is overridden below")
        }

        async fn transceive(&mut self, request: &[u8]) -> Result<Vec<u8>> {
            self.responder.respond(request).await
        }
    }

    fn responder_for(protocol_text: &str) -> Responder {
        let mut responder = Responder::new(Protocol::parse(protocol_text).unwrap());
        responder.register("echo", Box::new(EchoHandler));
        responder
    }

    /// Raises the `DivByZero` branch of `divide`'s declared errors union
    /// whenever the denominator is zero, exercising `HandlerOutcome::Declared`.
    struct DivideHandler;

    #[async_trait]
    impl MessageHandler for DivideHandler {
        async fn invoke(&self, request: Value) -> std::result::Result<Value, HandlerOutcome> {
            let fields = match request {
                Value::Record(fields) => fields,
                _ => return Err(HandlerOutcome::Application("bad request".into())),
            };
            let field = |name: &str| fields.iter().find(|(n, _)| n == name).map(|(_, v)| v.clone());
            let (Some(Value::Int(numerator)), Some(Value::Int(denominator))) =
                (field("numerator"), field("denominator"))
            else {
                return Err(HandlerOutcome::Application("missing numerator/denominator".into()));
            };
            if denominator == 0 {
                let declared = Value::Union(
                    1,
                    Box::new(Value::Record(vec![("message".into(), Value::String("division by zero".into()))])),
                );
                return Err(HandlerOutcome::Declared(declared));
            }
            Ok(Value::Int(numerator / denominator))
        }
    }

    #[tokio::test]
    async fn first_call_handshakes_with_matching_protocol_in_one_exchange() {
        let protocol = Protocol::parse(ECHO_PROTOCOL).unwrap();
        let responder = responder_for(ECHO_PROTOCOL);

        let mut requestor = Requestor::new(protocol, InProcessTransceiver { responder });
        let result = requestor
            .request("echo", Value::Record(vec![("message".into(), Value::String("hello".into()))]))
            .await
            .unwrap();

        match result {
            CallResult::Response(Value::String(s)) => assert_eq!(s, "hello"),
            _ => panic!("expected a string response"),
        }
        assert!(!requestor.send_protocol);
    }

    #[tokio::test]
    async fn second_call_on_same_requestor_skips_protocol_resend() {
        let protocol = Protocol::parse(ECHO_PROTOCOL).unwrap();
        let responder = responder_for(ECHO_PROTOCOL);

        let mut requestor = Requestor::new(protocol, InProcessTransceiver { responder });
        requestor
            .request("echo", Value::Record(vec![("message".into(), Value::String("one".into()))]))
            .await
            .unwrap();
        let result = requestor
            .request("echo", Value::Record(vec![("message".into(), Value::String("two".into()))]))
            .await
            .unwrap();

        match result {
            CallResult::Response(Value::String(s)) => assert_eq!(s, "two"),
            _ => panic!("expected a string response"),
        }
    }

    #[tokio::test]
    async fn mismatched_protocol_converges_after_one_retry() {
        let local = Protocol::parse(ECHO_PROTOCOL_V2).unwrap();
        let responder = responder_for(ECHO_PROTOCOL);

        let mut requestor = Requestor::new(local, InProcessTransceiver { responder });
        let result = requestor
            .request("echo", Value::Record(vec![("message".into(), Value::String("hi".into()))]))
            .await
            .unwrap();

        match result {
            CallResult::Response(Value::String(s)) => assert_eq!(s, "hi"),
            _ => panic!("expected a string response"),
        }
    }

    #[tokio::test]
    async fn unknown_message_name_errors_without_a_round_trip() {
        let protocol = Protocol::parse(ECHO_PROTOCOL).unwrap();
        let responder = Responder::new(Protocol::parse(ECHO_PROTOCOL).unwrap());
        let mut requestor = Requestor::new(protocol, InProcessTransceiver { responder });
        let result = requestor.request("missing", Value::Null).await;
        assert!(matches!(result, Err(RpcError::UnknownMessage(_))));
    }

    #[tokio::test]
    async fn message_known_locally_but_absent_from_a_resolved_remote_protocol_is_unknown() {
        // The server's protocol is learned (via a NONE round trip) before
        // this call converges, so `remote_protocol` is `Some` by the time
        // the response is decoded. It must not be papered over with the
        // local schema just because the lookup misses.
        let local = Protocol::parse(ECHO_PROTOCOL_WITH_EXTRA).unwrap();
        let responder = responder_for(ECHO_PROTOCOL);

        let mut requestor = Requestor::new(local, InProcessTransceiver { responder });
        let result = requestor.request("extra", Value::Record(vec![])).await;
        assert!(matches!(result, Err(RpcError::UnknownMessage(name)) if name == "extra"));
    }

    #[tokio::test]
    async fn declared_remote_error_decodes_against_the_errors_union() {
        let protocol = Protocol::parse(DIVIDE_PROTOCOL).unwrap();
        let mut responder = Responder::new(Protocol::parse(DIVIDE_PROTOCOL).unwrap());
        responder.register("divide", Box::new(DivideHandler));

        let mut requestor = Requestor::new(protocol, InProcessTransceiver { responder });
        let result = requestor
            .request(
                "divide",
                Value::Record(vec![("numerator".into(), Value::Int(1)), ("denominator".into(), Value::Int(0))]),
            )
            .await
            .unwrap();

        let remote_error = match result {
            CallResult::RemoteError(value) => value,
            CallResult::Response(_) => panic!("expected a declared DivByZero remote error"),
        };
        // Decoding a union schema yields `Value::Union(index, inner)`; unwrap
        // to the `DivByZero` branch it was encoded against.
        let record = match remote_error {
            Value::Union(_, inner) => *inner,
            other => other,
        };
        match record {
            Value::Record(fields) => {
                let message = fields.into_iter().find(|(name, _)| name == "message").map(|(_, v)| v);
                assert_eq!(message, Some(Value::String("division by zero".into())));
            }
            other => panic!("expected a DivByZero record, got {other:?}"),
        }
    }
}
