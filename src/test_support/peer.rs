#![allow(dead_code)]
use std::convert::TryFrom;
use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::mpsc::{Receiver, Sender, UnboundedReceiver, UnboundedSender};

use crate::rpc::codec::{Framing, ReceiveBuffer, DEFAULT_MAX_FRAME_LENGTH};
use crate::rpc::connection::Connection;
use crate::rpc::request::Request;
use crate::rpc::response::Response;
use crate::rpc::transport::{RpcTransport, RpcTransportConfig};
use crate::test_support::connection::{FakeReader, FakeWriter};
use crate::test_support::gen::Gen;
use crate::test_support::CHAN_BUF_SIZE;

/// The far end of a channel-backed transport. Tests read the requests the transport
/// wrote and push response bytes back in whatever chunks they like.
pub struct FakePeer {
    framing: Framing,
    input: Option<UnboundedSender<Vec<u8>>>,
    output: UnboundedReceiver<Vec<u8>>,
    received: ReceiveBuffer,
}

impl FakePeer {
    /// Build a transport wired to a `FakePeer` and connect it.
    pub async fn connected(config: RpcTransportConfig) -> (RpcTransport, FakePeer) {
        let (connection, peer) = FakePeer::detached(&config);
        let transport = config.build();
        transport.connect_with(connection).await.unwrap();
        (transport, peer)
    }

    /// A connection wired to a `FakePeer`, not yet handed to any transport.
    pub fn detached(config: &RpcTransportConfig) -> (Connection, FakePeer) {
        let (reader, input) = FakeReader::new();
        let (writer, output) = FakeWriter::new();
        let connection = Connection::from_halves(
            Box::new(reader),
            Box::new(writer),
            config.framing,
            config.max_frame_length,
            config.read_chunk_size,
        );
        let peer = FakePeer {
            framing: config.framing,
            input: Some(input),
            output,
            received: ReceiveBuffer::new(config.framing, DEFAULT_MAX_FRAME_LENGTH),
        };
        (connection, peer)
    }

    pub async fn next_request(&mut self) -> Request {
        loop {
            if let Some(frame) = self.received.next_frame().unwrap() {
                return Request::try_from(frame.to_vec()).unwrap();
            }
            let chunk = self.output.recv().await.unwrap();
            self.received.extend(&chunk);
        }
    }

    /// The next chunk the transport wrote, exactly as written.
    pub async fn next_raw(&mut self) -> Vec<u8> {
        self.output.recv().await.unwrap()
    }

    /// Deliver raw bytes as a single read on the transport side.
    pub fn send_raw(&self, bytes: &[u8]) {
        if let Some(input) = &self.input {
            input.send(bytes.to_vec()).unwrap();
        }
    }

    pub fn frame(&self, response: &Response) -> Vec<u8> {
        let mut framed = BytesMut::new();
        self.framing
            .encode(&response.to_bytes().unwrap(), &mut framed)
            .unwrap();
        framed.to_vec()
    }

    pub fn respond(&self, response: &Response) {
        self.send_raw(&self.frame(response));
    }

    /// End the stream, as if the peer closed its socket.
    pub fn hang_up(&mut self) {
        self.input.take();
    }

    /// Whether the transport let go of its write half without writing anything more.
    pub async fn writer_dropped(&mut self) -> bool {
        self.output.recv().await.is_none()
    }

    /// Stop accepting writes, as if the socket had been reset.
    pub fn reset(&mut self) {
        self.output.close();
        while self.output.try_recv().is_ok() {}
    }
}

/// The far end of a transport whose writes back up once `capacity` bytes sit unread.
/// Nothing is read from the pipe until the test does so itself.
pub struct SlowPeer {
    pub pipe: DuplexStream,
    // held so the transport's read half never sees end of stream
    _input: UnboundedSender<Vec<u8>>,
    received: ReceiveBuffer,
}

impl SlowPeer {
    pub async fn connected(capacity: usize) -> (RpcTransport, SlowPeer) {
        let config = RpcTransportConfig::default();
        let (reader, input) = FakeReader::new();
        let (near, pipe) = tokio::io::duplex(capacity);
        let connection = Connection::from_halves(
            Box::new(reader),
            Box::new(near),
            config.framing,
            config.max_frame_length,
            config.read_chunk_size,
        );
        let transport = config.build();
        transport.connect_with(connection).await.unwrap();
        let peer = SlowPeer {
            pipe,
            _input: input,
            received: ReceiveBuffer::new(Framing::Newline, DEFAULT_MAX_FRAME_LENGTH),
        };
        (transport, peer)
    }

    /// Read until `n` complete requests have arrived. Panics on anything that is not a
    /// well-formed request line.
    pub async fn read_requests(&mut self, n: usize) -> Vec<Request> {
        let mut requests = Vec::new();
        while requests.len() < n {
            match self.received.next_frame().unwrap() {
                Some(frame) => requests.push(Request::try_from(frame.to_vec()).unwrap()),
                None => {
                    let read = self.pipe.read_buf(self.received.bytes_mut()).await.unwrap();
                    assert!(read > 0, "transport hung up its write half");
                }
            }
        }
        requests
    }
}

pub enum PeerCommand {
    Send(Vec<u8>),
    HangUp,
}

/// A real TCP peer on a free local port. It accepts one connection, reports every
/// newline-framed request it reads, and writes whatever the test tells it to.
pub struct TcpPeer {
    pub address: SocketAddr,
    pub request_rx: Receiver<Request>,
    command_tx: Sender<PeerCommand>,
}

impl TcpPeer {
    pub async fn spawn() -> TcpPeer {
        let address = Gen::local_addr();
        let listener = TcpListener::bind(address).await.unwrap();
        let (request_tx, request_rx) = mpsc::channel::<Request>(CHAN_BUF_SIZE);
        let (command_tx, mut command_rx) = mpsc::channel::<PeerCommand>(CHAN_BUF_SIZE);

        tokio::spawn(async move {
            let (socket, _client_addr) = listener.accept().await.unwrap();
            let (mut r, mut w) = socket.into_split();

            tokio::spawn(async move {
                let mut received = ReceiveBuffer::new(Framing::Newline, DEFAULT_MAX_FRAME_LENGTH);
                loop {
                    if r.read_buf(received.bytes_mut()).await.unwrap_or(0) == 0 {
                        return;
                    }
                    while let Ok(Some(frame)) = received.next_frame() {
                        let request = Request::try_from(frame.to_vec()).unwrap();
                        if request_tx.send(request).await.is_err() {
                            return;
                        }
                    }
                }
            });

            while let Some(command) = command_rx.recv().await {
                match command {
                    PeerCommand::Send(bytes) => {
                        w.write_all(&bytes).await.unwrap();
                        w.flush().await.unwrap();
                    }
                    PeerCommand::HangUp => {
                        let _ = w.shutdown().await;
                        return;
                    }
                }
            }
        });

        TcpPeer {
            address,
            request_rx,
            command_tx,
        }
    }

    pub async fn next_request(&mut self) -> Request {
        self.request_rx.recv().await.unwrap()
    }

    pub async fn send_raw(&self, bytes: &[u8]) {
        let _ = self.command_tx.send(PeerCommand::Send(bytes.to_vec())).await;
    }

    pub async fn respond(&self, response: &Response) {
        let mut bytes = response.to_bytes().unwrap();
        bytes.push(crate::NEWLINE);
        self.send_raw(&bytes).await;
    }

    pub async fn hang_up(&self) {
        let _ = self.command_tx.send(PeerCommand::HangUp).await;
    }
}
