use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(n: u8) -> ConnectionState {
        match n {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Lock-free holder for the connection state, shared between the transport and its
/// receive loop. `Closed` is terminal: no transition leaves it.
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> StateCell {
        StateCell(AtomicU8::new(ConnectionState::Disconnected as u8))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Move from `from` to `to`, returning the state actually observed on failure.
    pub fn transition(
        &self,
        from: ConnectionState,
        to: ConnectionState,
    ) -> Result<(), ConnectionState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(ConnectionState::from_u8)
    }

    /// Move to `Closed` from wherever we are. Returns the previous state.
    pub fn close(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(ConnectionState::Closed as u8, Ordering::SeqCst))
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
