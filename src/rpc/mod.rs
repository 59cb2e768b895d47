pub mod codec;
pub mod connection;
pub mod pending;
pub mod request;
pub mod response;
pub mod state;
pub mod transport;

pub use codec::Framing;
pub use pending::CallHandle;
pub use state::ConnectionState;
pub use transport::{RpcTransport, RpcTransportConfig};

/// Bytes requested from the socket per read; the same size the stock peer reads with.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;
