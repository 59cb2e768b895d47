use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::{FramingError, TransportError};
use crate::rpc::codec::{Framing, ReceiveBuffer};

pub trait AsyncReader: AsyncRead + Unpin + Send {}
impl AsyncReader for OwnedReadHalf {}

pub trait AsyncWriter: AsyncWrite + Unpin + Send {}
impl AsyncWriter for OwnedWriteHalf {}

/// Both halves of one byte stream. The read half goes to the receive loop, the write
/// half to the writer task.
pub struct Connection {
    pub reader: FrameReader,
    pub writer: FrameWriter,
}

pub struct FrameReader {
    input: Box<dyn AsyncReader>,
    buffer: ReceiveBuffer,
    read_chunk_size: usize,
}

pub struct FrameWriter {
    output: BufWriter<Box<dyn AsyncWriter>>,
}

impl Connection {
    /// Create a new `Connection` backed by `socket`.
    pub fn new(
        socket: TcpStream,
        framing: Framing,
        max_frame_length: usize,
        read_chunk_size: usize,
    ) -> Connection {
        let (r, w) = socket.into_split();
        Connection::from_halves(
            Box::new(r),
            Box::new(w),
            framing,
            max_frame_length,
            read_chunk_size,
        )
    }

    pub fn from_halves(
        input: Box<dyn AsyncReader>,
        output: Box<dyn AsyncWriter>,
        framing: Framing,
        max_frame_length: usize,
        read_chunk_size: usize,
    ) -> Connection {
        Self {
            reader: FrameReader {
                input,
                buffer: ReceiveBuffer::new(framing, max_frame_length),
                read_chunk_size,
            },
            writer: FrameWriter {
                output: BufWriter::new(output),
            },
        }
    }
}

impl FrameReader {
    /// Pull one read's worth of bytes off the stream into the receive buffer.
    /// End of stream is reported as `TransportError::PeerClosed`.
    pub async fn fill(&mut self) -> Result<usize, TransportError> {
        let buf = self.buffer.bytes_mut();
        buf.reserve(self.read_chunk_size);
        match self.input.read_buf(buf).await? {
            0 => Err(TransportError::PeerClosed),
            n => Ok(n),
        }
    }

    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FramingError> {
        self.buffer.next_frame()
    }

    pub fn framing(&self) -> Framing {
        self.buffer.framing()
    }
}

impl FrameWriter {
    /// Write one already-encoded frame and flush it.
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.output.write_all(frame).await?;
        self.output.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.output.shutdown().await?;
        Ok(())
    }
}
