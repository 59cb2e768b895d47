use err_derive::Error;

pub type AsyncError = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, AsyncError>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error(display = "failed to connect to {}: {}", address, reason)]
    Unreachable { address: String, reason: String },
    #[error(display = "transport is already connected")]
    AlreadyConnected,
    #[error(display = "transport is closed")]
    Closed,
}

/// Failure of a single call. Only `TransportClosed` says anything about the connection;
/// every other variant leaves the transport usable.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CallError {
    #[error(display = "{}", message)]
    Remote { message: String },
    #[error(display = "transport closed before a response arrived")]
    TransportClosed,
    #[error(display = "transport is not connected")]
    NotConnected,
    #[error(display = "call was cancelled")]
    Cancelled,
    #[error(display = "call timed out")]
    Timeout,
    #[error(display = "malformed response: {}", _0)]
    MalformedResponse(String),
    #[error(display = "failed to encode request: {}", _0)]
    Encode(String),
    #[error(display = "failed to decode result: {}", _0)]
    Decode(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error(display = "frame of {} bytes exceeds limit of {} bytes", length, max)]
    FrameTooLong { length: usize, max: usize },
    #[error(display = "malformed frame: {}", _0)]
    Malformed(String),
}

/// Why the connection ended, if it ended on its own.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error(display = "i/o error: {}", _0)]
    Io(String),
    #[error(display = "unrecoverable framing error: {}", _0)]
    Framing(FramingError),
    #[error(display = "peer closed the connection")]
    PeerClosed,
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}
