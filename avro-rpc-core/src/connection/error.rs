use std::fmt;
use std::io;

use apache_avro::types::Value;

/// Error kinds produced by the handshake, frame, and call layers.
///
/// `RemoteError` and `ApplicationError` both surface a decoded remote
/// payload to the caller; the distinction is where the error originated
/// (peer's declared error union vs. an exception the responder had to
/// convert on the peer's behalf).
#[derive(Debug)]
pub enum RpcError {
    IoError(io::Error),
    ConnectionClosed,
    ProtocolViolation(String),
    SchemaResolution(String),
    RemoteError(Value),
    ApplicationError(String),
    UnknownMessage(String),
    Other(String),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IoError(err) => write!(f, "I/O error: {}", err),
            Self::ConnectionClosed => write!(f, "connection closed unexpectedly"),
            Self::ProtocolViolation(err) => write!(f, "protocol violation: {}", err),
            Self::SchemaResolution(err) => write!(f, "schema resolution failed: {}", err),
            Self::RemoteError(datum) => write!(f, "remote error: {:?}", datum),
            Self::ApplicationError(msg) => write!(f, "application error: {}", msg),
            Self::UnknownMessage(name) => write!(f, "unknown message: {}", name),
            Self::Other(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<io::Error> for RpcError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Self::ConnectionClosed
        } else {
            Self::IoError(err)
        }
    }
}

impl From<apache_avro::Error> for RpcError {
    fn from(err: apache_avro::Error) -> Self {
        Self::SchemaResolution(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
