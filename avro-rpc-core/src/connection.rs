pub mod error;
pub mod stream;

pub use self::error::{Result, RpcError};
pub use self::stream::{split_connection, TcpReader, TcpWriter};
