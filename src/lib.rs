#[cfg(test)]
#[macro_use]
extern crate lazy_static;

pub mod error;
pub mod rpc;

pub use error::{CallError, ConnectError, FramingError, TransportError};
pub use rpc::{CallHandle, ConnectionState, Framing, RpcTransport, RpcTransportConfig};

pub const NEWLINE: u8 = b'\n';
