//! Handshake record codec: fixed, well-known Avro schemas for negotiating
//! protocol compatibility before the first call.

use std::collections::HashMap;
use std::io::Read;
use std::sync::LazyLock;

use apache_avro::types::Value;
use apache_avro::{from_avro_datum, to_avro_datum, Schema};

use crate::connection::error::{Result, RpcError};
use crate::schema::Fingerprint;

const HANDSHAKE_REQUEST_SCHEMA_JSON: &str = r#"{
    "type": "record",
    "name": "HandshakeRequest",
    "namespace": "org.apache.avro.ipc",
    "fields": [
        {"name": "clientHash", "type": {"type": "fixed", "name": "MD5", "size": 16}},
        {"name": "clientProtocol", "type": ["null", "string"]},
        {"name": "serverHash", "type": "MD5"},
        {"name": "meta", "type": ["null", {"type": "map", "values": "bytes"}]}
    ]
}"#;

const HANDSHAKE_RESPONSE_SCHEMA_JSON: &str = r#"{
    "type": "record",
    "name": "HandshakeResponse",
    "namespace": "org.apache.avro.ipc",
    "fields": [
        {"name": "match", "type": {"type": "enum", "name": "HandshakeMatch", "symbols": ["BOTH", "CLIENT", "NONE"]}},
        {"name": "serverProtocol", "type": ["null", "string"]},
        {"name": "serverHash", "type": ["null", {"type": "fixed", "name": "MD5", "size": 16}]},
        {"name": "meta", "type": ["null", {"type": "map", "values": "bytes"}]}
    ]
}"#;

static HANDSHAKE_REQUEST_SCHEMA: LazyLock<Schema> =
    LazyLock::new(|| Schema::parse_str(HANDSHAKE_REQUEST_SCHEMA_JSON).expect("HandshakeRequest schema is valid"));
static HANDSHAKE_RESPONSE_SCHEMA: LazyLock<Schema> =
    LazyLock::new(|| Schema::parse_str(HANDSHAKE_RESPONSE_SCHEMA_JSON).expect("HandshakeResponse schema is valid"));

/// The three handshake outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMatch {
    Both,
    Client,
    None,
}

impl HandshakeMatch {
    fn symbol(self) -> &'static str {
        match self {
            Self::Both => "BOTH",
            Self::Client => "CLIENT",
            Self::None => "NONE",
        }
    }

    fn from_symbol(symbol: &str) -> Result<Self> {
        match symbol {
            "BOTH" => Ok(Self::Both),
            "CLIENT" => Ok(Self::Client),
            "NONE" => Ok(Self::None),
            other => Err(RpcError::ProtocolViolation(format!("unknown handshake match symbol: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    pub client_hash: Fingerprint,
    /// Present only on the first attempt, or after a CLIENT/NONE response
    /// forced a retry. Carries the full protocol text so the server can
    /// learn it.
    pub client_protocol: Option<String>,
    pub server_hash: Fingerprint,
}

#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub handshake_match: HandshakeMatch,
    /// Present when `handshake_match` is not `Both`: the server's own
    /// protocol text, so the client can adopt it and retry.
    pub server_protocol: Option<String>,
    pub server_hash: Option<Fingerprint>,
}

impl HandshakeRequest {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let value = Value::Record(vec![
            ("clientHash".into(), Value::Fixed(16, self.client_hash.to_vec())),
            ("clientProtocol".into(), optional_string(self.client_protocol.as_deref())),
            ("serverHash".into(), Value::Fixed(16, self.server_hash.to_vec())),
            ("meta".into(), Value::Union(0, Box::new(Value::Null))),
        ]);
        Ok(to_avro_datum(&HANDSHAKE_REQUEST_SCHEMA, value)?)
    }

    pub fn decode(reader: &mut impl Read) -> Result<Self> {
        let value = from_avro_datum(&HANDSHAKE_REQUEST_SCHEMA, reader, None)?;
        let fields = record_fields(value, "HandshakeRequest")?;
        Ok(Self {
            client_hash: fixed16(fields.get("clientHash"))?,
            client_protocol: union_string(fields.get("clientProtocol")),
            server_hash: fixed16(fields.get("serverHash"))?,
        })
    }
}

impl HandshakeResponse {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let symbol_index = match self.handshake_match {
            HandshakeMatch::Both => 0,
            HandshakeMatch::Client => 1,
            HandshakeMatch::None => 2,
        };
        let value = Value::Record(vec![
            ("match".into(), Value::Enum(symbol_index, self.handshake_match.symbol().to_string())),
            ("serverProtocol".into(), optional_string(self.server_protocol.as_deref())),
            (
                "serverHash".into(),
                match self.server_hash {
                    Some(hash) => Value::Union(1, Box::new(Value::Fixed(16, hash.to_vec()))),
                    None => Value::Union(0, Box::new(Value::Null)),
                },
            ),
            ("meta".into(), Value::Union(0, Box::new(Value::Null))),
        ]);
        Ok(to_avro_datum(&HANDSHAKE_RESPONSE_SCHEMA, value)?)
    }

    pub fn decode(reader: &mut impl Read) -> Result<Self> {
        let value = from_avro_datum(&HANDSHAKE_RESPONSE_SCHEMA, reader, None)?;
        let fields = record_fields(value, "HandshakeResponse")?;
        let handshake_match = match fields.get("match") {
            Some(Value::Enum(_, symbol)) => HandshakeMatch::from_symbol(symbol)?,
            _ => return Err(RpcError::ProtocolViolation("handshake response missing match".into())),
        };
        Ok(Self {
            handshake_match,
            server_protocol: union_string(fields.get("serverProtocol")),
            server_hash: match fields.get("serverHash") {
                Some(Value::Union(_, inner)) => match inner.as_ref() {
                    Value::Fixed(16, bytes) => {
                        let mut out = [0u8; 16];
                        out.copy_from_slice(bytes);
                        Some(out)
                    }
                    _ => None,
                },
                _ => None,
            },
        })
    }
}

fn optional_string(value: Option<&str>) -> Value {
    match value {
        Some(s) => Value::Union(1, Box::new(Value::String(s.to_string()))),
        None => Value::Union(0, Box::new(Value::Null)),
    }
}

fn union_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::Union(_, inner)) => match inner.as_ref() {
            Value::String(s) => Some(s.clone()),
            _ => None,
        },
        _ => None,
    }
}

fn record_fields(value: Value, record_name: &str) -> Result<HashMap<String, Value>> {
    match value {
        Value::Record(fields) => Ok(fields.into_iter().collect()),
        _ => Err(RpcError::ProtocolViolation(format!("{record_name} is not a record"))),
    }
}

fn fixed16(value: Option<&Value>) -> Result<Fingerprint> {
    match value {
        Some(Value::Fixed(16, bytes)) => {
            let mut out = [0u8; 16];
            out.copy_from_slice(bytes);
            Ok(out)
        }
        _ => Err(RpcError::ProtocolViolation("expected a 16-byte fixed field".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_request_round_trips() {
        let req = HandshakeRequest {
            client_hash: [1u8; 16],
            client_protocol: Some("{\"protocol\":\"Echo\"}".into()),
            server_hash: [2u8; 16],
        };
        let encoded = req.encode().unwrap();
        let decoded = HandshakeRequest::decode(&mut encoded.as_slice()).unwrap();
        assert_eq!(decoded.client_hash, req.client_hash);
        assert_eq!(decoded.server_hash, req.server_hash);
        assert_eq!(decoded.client_protocol, req.client_protocol);
    }

    #[test]
    fn handshake_response_round_trips_without_server_protocol() {
        let resp = HandshakeResponse {
            handshake_match: HandshakeMatch::Both,
            server_protocol: None,
            server_hash: None,
        };
        let encoded = resp.encode().unwrap();
        let decoded = HandshakeResponse::decode(&mut encoded.as_slice()).unwrap();
        assert_eq!(decoded.handshake_match, HandshakeMatch::Both);
        assert!(decoded.server_protocol.is_none());
    }

    #[test]
    fn handshake_response_carries_server_protocol_on_mismatch() {
        let resp = HandshakeResponse {
            handshake_match: HandshakeMatch::None,
            server_protocol: Some("{\"protocol\":\"Echo\"}".into()),
            server_hash: Some([9u8; 16]),
        };
        let encoded = resp.encode().unwrap();
        let decoded = HandshakeResponse::decode(&mut encoded.as_slice()).unwrap();
        assert_eq!(decoded.handshake_match, HandshakeMatch::None);
        assert_eq!(decoded.server_protocol, resp.server_protocol);
        assert_eq!(decoded.server_hash, resp.server_hash);
    }
}
