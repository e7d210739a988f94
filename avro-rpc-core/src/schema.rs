//! The Avro `Protocol`/`Message` object model and datum (de)serialization.
//!
//! The schema parser and datum reader/writer themselves belong to the
//! `apache-avro` crate, not to this crate. This module is the thin seam
//! between that crate's `Schema`/`Value` types and the handshake/call
//! codecs that consume them: it parses an Avro Protocol JSON document
//! into named `Message` schemas and computes the protocol's
//! content-addressed fingerprint.

use std::collections::HashMap;
use std::sync::LazyLock;

use apache_avro::Schema;
use md5::{Digest, Md5};
use serde_json::Value as Json;

use crate::connection::error::{Result, RpcError};

pub type Fingerprint = [u8; 16];

/// `map<bytes>`, the schema of the handshake-adjacent `metadata` field
/// carried by both the call request and the call response.
pub static METADATA_SCHEMA: LazyLock<Schema> =
    LazyLock::new(|| Schema::parse_str(r#"{"type": "map", "values": "bytes"}"#).expect("metadata schema is valid"));

/// `["string"]`, the distinguished union used to surface transport- or
/// encoding-level failures before a message-specific error schema is
/// available.
pub static SYSTEM_ERROR_SCHEMA: LazyLock<Schema> =
    LazyLock::new(|| Schema::parse_str(r#"["string"]"#).expect("system error schema is valid"));

/// One named entry point of a `Protocol`: request parameters, response,
/// and declared errors, each an Avro schema.
#[derive(Debug, Clone)]
pub struct Message {
    pub name: String,
    pub request: Schema,
    pub response: Schema,
    pub errors: Schema,
}

/// An immutable, named collection of messages with a stable fingerprint.
///
/// Two protocols are wire-compatible (§3) when `fingerprint()` matches.
#[derive(Debug, Clone)]
pub struct Protocol {
    pub name: String,
    pub namespace: Option<String>,
    messages: HashMap<String, Message>,
    canonical_text: String,
    fingerprint: Fingerprint,
}

impl Protocol {
    /// Parses an Avro Protocol JSON document.
    ///
    /// Supports the subset of the Avro IDL/Protocol JSON format this
    /// crate needs: a `protocol` name, optional `namespace`, a `types`
    /// array of named schemas, and a `messages` map of
    /// `{request: [field...], response: schema, errors: [schema...]}`.
    pub fn parse(text: &str) -> Result<Self> {
        let doc: Json = serde_json::from_str(text)
            .map_err(|e| RpcError::ProtocolViolation(format!("invalid protocol JSON: {e}")))?;

        let name = doc
            .get("protocol")
            .and_then(Json::as_str)
            .ok_or_else(|| RpcError::ProtocolViolation("protocol is missing \"protocol\" name".into()))?
            .to_string();
        let namespace = doc.get("namespace").and_then(Json::as_str).map(str::to_string);

        let mut schema_strings: Vec<String> = Vec::new();
        if let Some(types) = doc.get("types").and_then(Json::as_array) {
            for t in types {
                schema_strings.push(t.to_string());
            }
        }

        let messages_json = doc
            .get("messages")
            .and_then(Json::as_object)
            .ok_or_else(|| RpcError::ProtocolViolation("protocol is missing \"messages\" map".into()))?;

        // One (request, response, errors) schema string triple per message,
        // appended after the named types so cross-references resolve
        // within a single `Schema::parse_list` call.
        let mut message_names: Vec<String> = Vec::new();
        for (msg_name, def) in messages_json {
            let fields = def
                .get("request")
                .and_then(Json::as_array)
                .ok_or_else(|| RpcError::ProtocolViolation(format!("message {msg_name} is missing \"request\"")))?;
            let request_schema = serde_json::json!({
                "type": "record",
                "name": format!("{msg_name}Request"),
                "fields": fields,
            });

            let response_schema = def.get("response").cloned().unwrap_or(Json::String("null".into()));

            let errors_schema = normalize_errors(def.get("errors"));

            schema_strings.push(request_schema.to_string());
            schema_strings.push(response_schema.to_string());
            schema_strings.push(errors_schema.to_string());
            message_names.push(msg_name.clone());
        }

        let type_count = schema_strings.len() - message_names.len() * 3;
        let refs: Vec<&str> = schema_strings.iter().map(String::as_str).collect();
        let parsed = Schema::parse_list(&refs)
            .map_err(|e| RpcError::ProtocolViolation(format!("schema resolution failed: {e}")))?;

        let mut messages = HashMap::with_capacity(message_names.len());
        for (i, msg_name) in message_names.into_iter().enumerate() {
            let base = type_count + i * 3;
            messages.insert(
                msg_name.clone(),
                Message {
                    name: msg_name,
                    request: parsed[base].clone(),
                    response: parsed[base + 1].clone(),
                    errors: parsed[base + 2].clone(),
                },
            );
        }

        let canonical_text = canonicalize(&doc);
        let fingerprint = fingerprint_of(&canonical_text);

        Ok(Self { name, namespace, messages, canonical_text, fingerprint })
    }

    pub fn message(&self, name: &str) -> Option<&Message> {
        self.messages.get(name)
    }

    pub fn messages(&self) -> &HashMap<String, Message> {
        &self.messages
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn canonical_text(&self) -> &str {
        &self.canonical_text
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical_text)
    }
}

/// Ensures the errors union's first branch is `"string"`, so there is
/// always a system-error branch to fall back on.
fn normalize_errors(errors: Option<&Json>) -> Json {
    let mut branches: Vec<Json> = errors
        .and_then(Json::as_array)
        .cloned()
        .unwrap_or_default();
    let has_leading_string = matches!(branches.first(), Some(Json::String(s)) if s == "string");
    if !has_leading_string {
        branches.insert(0, Json::String("string".into()));
    }
    Json::Array(branches)
}

/// Recursively sorts object keys so that two textually different but
/// semantically identical documents canonicalize to the same bytes.
fn canonicalize(value: &Json) -> String {
    fn sort(value: &Json) -> Json {
        match value {
            Json::Object(map) => {
                let mut sorted: Vec<(String, Json)> =
                    map.iter().map(|(k, v)| (k.clone(), sort(v))).collect();
                sorted.sort_by(|a, b| a.0.cmp(&b.0));
                Json::Object(sorted.into_iter().collect())
            }
            Json::Array(items) => Json::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

fn fingerprint_of(canonical_text: &str) -> Fingerprint {
    let mut hasher = Md5::new();
    hasher.update(canonical_text.as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const ECHO_PROTOCOL: &str = r#"{
        "protocol": "Echo",
        "namespace": "org.example",
        "messages": {
            "echo": {
                "request": [{"name": "message", "type": "string"}],
                "response": "string"
            }
        }
    }"#;

    #[test]
    fn parses_messages_and_defaults_errors_to_string_union() {
        let protocol = Protocol::parse(ECHO_PROTOCOL).unwrap();
        let echo = protocol.message("echo").expect("echo message");
        assert!(matches!(echo.response, Schema::String));
        assert!(matches!(echo.errors, Schema::Union(_)));
    }

    #[test]
    fn fingerprint_is_stable_across_whitespace_and_key_order() {
        let spaced = ECHO_PROTOCOL.replace('\n', "  \n  ");
        let reordered = r#"{
            "namespace": "org.example",
            "protocol": "Echo",
            "messages": {
                "echo": {
                    "response": "string",
                    "request": [{"type": "string", "name": "message"}]
                }
            }
        }"#;

        let a = Protocol::parse(&spaced).unwrap();
        let b = Protocol::parse(reordered).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_differs_for_different_protocols() {
        let a = Protocol::parse(ECHO_PROTOCOL).unwrap();
        let other = ECHO_PROTOCOL.replace("Echo", "Echo2");
        let b = Protocol::parse(&other).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
