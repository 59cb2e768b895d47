use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, OnceCell};
use tokio::time::{self, Duration};
use tracing::{debug, error, warn};

use crate::error::{CallError, ConnectError, FramingError, TransportError};
use crate::rpc::codec::{Framing, DEFAULT_MAX_FRAME_LENGTH};
use crate::rpc::connection::{Connection, FrameReader, FrameWriter};
use crate::rpc::pending::{CallHandle, PendingCalls};
use crate::rpc::request::Request;
use crate::rpc::response::{Outcome, ParseFailure, Response};
use crate::rpc::state::{ConnectionState, StateCell};
use crate::rpc::DEFAULT_READ_CHUNK_SIZE;

/// Encoded frames waiting for the writer task.
pub const OUTBOUND_QUEUE_SIZE: usize = 64;

#[derive(Clone, Debug)]
pub struct RpcTransportConfig {
    pub framing: Framing,
    pub max_frame_length: usize,
    pub read_chunk_size: usize,
}

impl Default for RpcTransportConfig {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

impl RpcTransportConfig {
    /// Create an inert `RpcTransport`. Nothing touches the network until `connect`.
    pub fn build(self) -> RpcTransport {
        RpcTransport {
            config: self,
            session: Arc::new(Session::new()),
            request_id: AtomicU64::new(1),
            outbound: OnceCell::new(),
        }
    }
}

/// One complete frame for the writer task, acknowledged once it is on the wire.
struct Outbound {
    id: u64,
    frame: Bytes,
    written: oneshot::Sender<()>,
}

/// Everything the transport shares with its receive loop and writer task.
struct Session {
    state: StateCell,
    pending: PendingCalls,
    // why the session ended on its own, until the next `close` reports it
    failure: Mutex<Option<TransportError>>,
    closing: watch::Sender<bool>,
    closed: watch::Receiver<bool>,
}

impl Session {
    fn new() -> Session {
        let (closing, closed) = watch::channel(false);
        Session {
            state: StateCell::new(),
            pending: PendingCalls::new(),
            failure: Mutex::new(None),
            closing,
            closed,
        }
    }

    /// Close after a failure nobody asked for, keeping `cause` for the next `close`.
    async fn fail(&self, cause: TransportError) -> usize {
        {
            let mut failure = self.failure.lock().await;
            if self.state.close() != ConnectionState::Closed {
                *failure = Some(cause);
            }
        }
        self.wind_down()
    }

    /// Signal both connection tasks to stop and fail everything still pending. Only
    /// meaningful once the state is `Closed`.
    fn wind_down(&self) -> usize {
        let _ = self.closing.send(true);
        self.pending.fail_all(CallError::TransportClosed)
    }
}

/// Resolves once the session has been told to close.
async fn until_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        let closing = *closed.borrow();
        if closing || closed.changed().await.is_err() {
            return;
        }
    }
}

/// A client session over one stream connection to one peer.
///
/// Requests are encoded by the caller and handed whole to a writer task that owns the
/// write half, so frames never interleave and a caller that gives up halfway cannot
/// truncate one. Responses come back through a receive loop task that owns the read
/// half, and are handed to callers through the `PendingCalls` registry by id.
///
/// Transport failures (reset, end of stream, an unrecoverable frame) close the session,
/// fail every pending call with `CallError::TransportClosed` and are reported once by the
/// next `close`. Nothing is retried here.
pub struct RpcTransport {
    config: RpcTransportConfig,
    session: Arc<Session>,
    request_id: AtomicU64,
    outbound: OnceCell<mpsc::Sender<Outbound>>,
}

impl RpcTransport {
    pub fn state(&self) -> ConnectionState {
        self.session.state.get()
    }

    pub fn pending_count(&self) -> usize {
        self.session.pending.len()
    }

    /// Atomically fetch and increment the id used to tag the next request. Ids start at 1
    /// and are never reused within a session.
    pub fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Open a TCP connection to `host:port` and start listening for responses on it.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), ConnectError> {
        self.begin_connecting()?;

        let address = format!("{}:{}", host, port);
        let stream = match TcpStream::connect((host, port)).await {
            Ok(stream) => stream,
            Err(e) => {
                // let the caller retry; a concurrent close has already moved us to `Closed`
                let _ = self
                    .session
                    .state
                    .transition(ConnectionState::Connecting, ConnectionState::Disconnected);
                debug!(%address, error = %e, "connect failed");
                return Err(ConnectError::Unreachable {
                    address,
                    reason: e.to_string(),
                });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%address, error = %e, "could not disable nagle");
        }

        let RpcTransportConfig {
            framing,
            max_frame_length,
            read_chunk_size,
        } = self.config.clone();
        self.attach(Connection::new(
            stream,
            framing,
            max_frame_length,
            read_chunk_size,
        ))?;
        debug!(%address, "connected");
        Ok(())
    }

    /// Run the session over an already-open stream instead of dialing TCP.
    pub async fn connect_with(&self, connection: Connection) -> Result<(), ConnectError> {
        self.begin_connecting()?;
        self.attach(connection)
    }

    fn begin_connecting(&self) -> Result<(), ConnectError> {
        self.session
            .state
            .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
            .map_err(|observed| match observed {
                ConnectionState::Closed => ConnectError::Closed,
                _ => ConnectError::AlreadyConnected,
            })
    }

    fn attach(&self, connection: Connection) -> Result<(), ConnectError> {
        let Connection { reader, writer } = connection;
        let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE_SIZE);
        self.outbound
            .set(outbound_tx)
            .map_err(|_| ConnectError::AlreadyConnected)?;

        if self
            .session
            .state
            .transition(ConnectionState::Connecting, ConnectionState::Connected)
            .is_err()
        {
            // closed while we were connecting; dropping the halves ends the stream
            return Err(ConnectError::Closed);
        }

        tokio::spawn(RpcTransport::transmit(
            writer,
            outbound_rx,
            self.session.clone(),
        ));
        tokio::spawn(RpcTransport::receive(reader, self.session.clone()));
        Ok(())
    }

    /// Send `method(params)` and wait for the peer's answer. Safe to drop at any point:
    /// a request is either written whole or not at all.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, CallError> {
        self.start_call(method, params).await?.await
    }

    /// Like `call`, then deserialize the result into `R`.
    pub async fn invoke<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<R, CallError> {
        let result = self.call(method, params).await?;
        serde_json::from_value(result).map_err(|e| CallError::Decode(e.to_string()))
    }

    /// Like `call`, giving up with `CallError::Timeout` once `deadline` has elapsed since
    /// the request was sent. The pending entry is cancelled on expiry.
    pub async fn call_with_deadline(
        &self,
        method: &str,
        params: Vec<Value>,
        deadline: Duration,
    ) -> Result<Value, CallError> {
        let mut handle = self.start_call(method, params).await?;
        match time::timeout(deadline, &mut handle).await {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(id = handle.id(), "call timed out");
                handle.cancel();
                Err(CallError::Timeout)
            }
        }
    }

    /// Register and transmit a request, returning once it has been written. The handle
    /// resolves when the matching response arrives.
    pub async fn start_call(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<CallHandle, CallError> {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Closed => return Err(CallError::TransportClosed),
            _ => return Err(CallError::NotConnected),
        }
        let outbound = self.outbound.get().ok_or(CallError::NotConnected)?;

        let id = self.next_id();
        let frame = self.encode(Request::new(id, method, params))?;

        let pending = &self.session.pending;
        let handle = CallHandle::new(id, pending.register(id), pending.clone());
        // the session may have failed everything between the state check and register
        if self.state() == ConnectionState::Closed {
            pending.resolve(id, Err(CallError::TransportClosed));
            return Err(CallError::TransportClosed);
        }

        let (written, written_rx) = oneshot::channel();
        if outbound.send(Outbound { id, frame, written }).await.is_err() {
            return Err(CallError::TransportClosed);
        }
        // dropped unacknowledged when the write failed or the session closed first
        match written_rx.await {
            Ok(()) => Ok(handle),
            Err(_) => Err(CallError::TransportClosed),
        }
    }

    fn encode(&self, request: Request) -> Result<Bytes, CallError> {
        let payload = request
            .to_bytes()
            .map_err(|e| CallError::Encode(e.to_string()))?;
        let mut frame = BytesMut::new();
        self.config
            .framing
            .encode(&payload, &mut frame)
            .map_err(|e| CallError::Encode(e.to_string()))?;
        Ok(frame.freeze())
    }

    /// Stop waiting for the call tagged `id`. Its handle resolves to `Cancelled` and any
    /// response that later arrives for it is ignored.
    pub fn cancel(&self, id: u64) -> bool {
        self.session.pending.cancel(id)
    }

    /// End the session. Every pending call fails with `TransportClosed`. Closing a closed
    /// transport does nothing, except that a failure which closed the transport on its own
    /// is returned by the first `close` after it.
    ///
    /// Never waits on the stream: a write stuck on a peer that stopped reading is
    /// abandoned, and an idle writer shuts its half down in the background.
    pub async fn close(&self) -> Result<(), TransportError> {
        let (previous, cause) = {
            let mut failure = self.session.failure.lock().await;
            (self.session.state.close(), failure.take())
        };
        let failed = self.session.wind_down();

        if previous == ConnectionState::Closed {
            return cause.map_or(Ok(()), Err);
        }
        debug!(failed, "transport closed");
        Ok(())
    }

    /// Write queued frames in order until the session closes or a write fails. Owns the
    /// write half for its whole life.
    async fn transmit(
        mut writer: FrameWriter,
        mut outbound: mpsc::Receiver<Outbound>,
        session: Arc<Session>,
    ) {
        let mut closed = session.closed.clone();
        loop {
            let Outbound { id, frame, written } = tokio::select! {
                biased;
                _ = until_closed(&mut closed) => break,
                next = outbound.recv() => match next {
                    Some(next) => next,
                    None => break,
                },
            };

            let result = tokio::select! {
                biased;
                _ = until_closed(&mut closed) => {
                    debug!(id, "abandoning a frame mid-write");
                    return;
                }
                result = writer.write_frame(&frame) => result,
            };
            match result {
                Ok(()) => {
                    let _ = written.send(());
                }
                Err(cause) => {
                    error!(id, error = %cause, "write failed, closing transport");
                    session.fail(cause).await;
                    return;
                }
            }
        }

        // fail whatever is still queued before touching the stream again
        drop(outbound);
        if let Err(e) = writer.shutdown().await {
            debug!(error = %e, "shutting down the write half failed");
        }
    }

    /// Read from the stream until it fails, dispatching every complete frame as it
    /// arrives. Owns the read half and the receive buffer for its whole life.
    async fn receive(mut reader: FrameReader, session: Arc<Session>) {
        let mut closed = session.closed.clone();
        let cause = loop {
            let filled = tokio::select! {
                biased;
                _ = until_closed(&mut closed) => return,
                filled = reader.fill() => filled,
            };
            if let Err(e) = filled {
                break e;
            }
            if let Err(e) = RpcTransport::dispatch_frames(&mut reader, &session.pending) {
                break TransportError::Framing(e);
            }
        };

        match &cause {
            TransportError::PeerClosed => debug!("peer closed the connection"),
            other => error!(error = %other, "receive loop failed"),
        }
        let failed = session.fail(cause).await;
        debug!(failed, "failed pending calls after connection loss");
    }

    /// Dispatch every complete frame currently buffered. Errors only when the stream can
    /// no longer be split into frames.
    fn dispatch_frames(
        reader: &mut FrameReader,
        pending: &PendingCalls,
    ) -> Result<(), FramingError> {
        loop {
            match reader.next_frame() {
                Ok(Some(frame)) => RpcTransport::dispatch(&frame, pending),
                Ok(None) => return Ok(()),
                Err(e) if reader.framing().resynchronizes() => {
                    warn!(error = %e, "dropping frame");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn dispatch(frame: &[u8], pending: &PendingCalls) {
        match Response::parse(frame) {
            Ok(Response { id, outcome }) => {
                let outcome = match outcome {
                    Outcome::Result(value) => Ok(value),
                    Outcome::Error(e) => Err(CallError::Remote { message: e.message }),
                };
                if !pending.resolve(id, outcome) {
                    debug!(id, "ignoring response with no pending call");
                }
            }
            Err(ParseFailure::Malformed { id, reason }) => {
                warn!(id, %reason, "malformed response");
                pending.resolve(id, Err(CallError::MalformedResponse(reason)));
            }
            Err(ParseFailure::Unattributable(reason)) => {
                warn!(%reason, "skipping frame with no usable id");
            }
        }
    }
}

impl Drop for RpcTransport {
    fn drop(&mut self) {
        self.session.state.close();
        self.session.wind_down();
    }
}

/*********
 * TESTS *
 *********/
