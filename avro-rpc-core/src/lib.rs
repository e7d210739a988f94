// Type aliases and logging macros must come first: every other module
// uses `debug_log!`/`PRwLock` internally.
pub mod alias;
pub mod debug;

pub mod connection;
pub mod frame;
pub mod handshake;
pub mod http_server;
pub mod requestor;
pub mod responder;
pub mod schema;
pub mod transceiver;

pub use alias::{PMutex, PMutexGuard, PRwLock, PRwLockReadGuard, PRwLockWriteGuard};
pub use connection::error::{Result, RpcError};
pub use handshake::{HandshakeMatch, HandshakeRequest, HandshakeResponse};
pub use http_server::{RpcServer, RpcServerBuilder};
pub use requestor::{CallResult, Requestor};
pub use responder::{HandlerOutcome, MessageHandler, Responder};
pub use schema::{Fingerprint, Message, Protocol};
pub use transceiver::{HttpTransceiver, Transceiver};
