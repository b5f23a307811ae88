//! Per-connection byte pumps.
//!
//! Endpoints own the only references to a connection's TCP stream. The
//! receiver turns the inbound byte stream into complete FIX frames; the
//! sender buffers outbound bytes and drains them as the socket allows. Both
//! are polled by the framer; neither ever blocks.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};

use bytes::{Buf, Bytes, BytesMut};

use crate::config::EngineConfiguration;
use crate::messages::DisconnectReason;
use crate::protocol;

/// A non-blocking TCP stream plus the peer address it came with.
#[derive(Debug)]
pub struct TcpChannel {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpChannel {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        Ok(Self { stream, peer })
    }

    /// Open an outbound connection.
    pub fn connect(host: &str, port: u16) -> io::Result<Self> {
        let stream = TcpStream::connect((host, port))?;
        Self::new(stream)
    }

    /// Second handle onto the same socket, for the opposite-direction
    /// endpoint.
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            stream: self.stream.try_clone()?,
            peer: self.peer,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn shutdown(&self, how: Shutdown) {
        let _ = self.stream.shutdown(how);
    }
}

/// Factory for outbound channels. Overridable so tests can inject connect
/// failures without a real unreachable host.
pub trait TcpChannelSupplier: Send {
    fn open(&mut self, host: &str, port: u16) -> io::Result<TcpChannel>;
}

#[derive(Debug, Default)]
pub struct DefaultChannelSupplier;

impl TcpChannelSupplier for DefaultChannelSupplier {
    fn open(&mut self, host: &str, port: u16) -> io::Result<TcpChannel> {
        TcpChannel::connect(host, port)
    }
}

/// Result of one receiver poll.
#[derive(Debug, Default)]
pub struct ReceiverPoll {
    /// Complete frames, in arrival order
    pub frames: Vec<Bytes>,
    /// The peer performed an orderly close
    pub closed_by_peer: bool,
}

/// Inbound half of a connection: reads bytes, extracts FIX frames.
#[derive(Debug)]
pub struct ReceiverEndpoint {
    channel: TcpChannel,
    connection_id: u64,
    session_id: i64,
    library_id: i32,
    buffer: BytesMut,
    /// Bytes read from the socket in one poll are capped at this
    read_limit: usize,
    /// Frames the framer could not forward yet (bus back-pressure); they
    /// are redelivered ahead of any new socket data.
    parked: VecDeque<Bytes>,
    closed: bool,
}

impl ReceiverEndpoint {
    pub fn new(
        channel: TcpChannel,
        connection_id: u64,
        session_id: i64,
        library_id: i32,
        buffer_size: usize,
    ) -> Self {
        Self {
            channel,
            connection_id,
            session_id,
            library_id,
            buffer: BytesMut::with_capacity(buffer_size),
            read_limit: buffer_size,
            parked: VecDeque::new(),
            closed: false,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    pub fn set_session_id(&mut self, session_id: i64) {
        self.session_id = session_id;
    }

    pub fn library_id(&self) -> i32 {
        self.library_id
    }

    pub fn set_library_id(&mut self, library_id: i32) {
        self.library_id = library_id;
    }

    pub fn peer(&self) -> SocketAddr {
        self.channel.peer()
    }

    /// Pull at most `frame_limit` complete frames. Parked frames are
    /// returned first; the socket is not read while any remain, so order is
    /// preserved under back-pressure.
    pub fn poll_for_data(&mut self, frame_limit: usize) -> io::Result<ReceiverPoll> {
        let mut poll = ReceiverPoll::default();
        if self.closed {
            return Ok(poll);
        }

        while poll.frames.len() < frame_limit {
            match self.parked.pop_front() {
                Some(frame) => poll.frames.push(frame),
                None => break,
            }
        }
        if !self.parked.is_empty() || poll.frames.len() == frame_limit {
            return Ok(poll);
        }

        let mut chunk = [0u8; 4096];
        let mut read_bytes = 0;
        loop {
            match self.channel.read(&mut chunk) {
                Ok(0) => {
                    poll.closed_by_peer = true;
                    break;
                }
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    read_bytes += n;
                    // Socket may have more, but one buffer's worth is
                    // enough for one tick.
                    if n < chunk.len() || read_bytes >= self.read_limit {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        while poll.frames.len() < frame_limit {
            match protocol::try_extract_one(&mut self.buffer) {
                Some(frame) => poll.frames.push(frame),
                None => break,
            }
        }
        Ok(poll)
    }

    /// Queue a frame for redelivery ahead of any new socket data. Frames
    /// must be parked in arrival order; the parked queue is always fully
    /// drained before the socket is read again, so ordering holds.
    pub fn park(&mut self, frame: Bytes) {
        self.parked.push_back(frame);
    }

    pub fn has_parked(&self) -> bool {
        !self.parked.is_empty()
    }

    pub fn close(&mut self, reason: DisconnectReason) {
        if self.closed {
            return;
        }
        self.closed = true;
        tracing::info!(
            connection_id = self.connection_id,
            library_id = self.library_id,
            ?reason,
            "receiver closed"
        );
        self.channel.shutdown(Shutdown::Both);
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Outbound half of a connection: buffers bytes, drains without blocking.
#[derive(Debug)]
pub struct SenderEndpoint {
    channel: TcpChannel,
    connection_id: u64,
    library_id: i32,
    out: BytesMut,
    closed: bool,
}

impl SenderEndpoint {
    pub fn new(
        channel: TcpChannel,
        connection_id: u64,
        library_id: i32,
        buffer_size: usize,
    ) -> Self {
        Self {
            channel,
            connection_id,
            library_id,
            out: BytesMut::with_capacity(buffer_size),
            closed: false,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn library_id(&self) -> i32 {
        self.library_id
    }

    pub fn set_library_id(&mut self, library_id: i32) {
        self.library_id = library_id;
    }

    pub fn enqueue(&mut self, bytes: &[u8]) {
        if !self.closed {
            self.out.extend_from_slice(bytes);
        }
    }

    /// Attempt to drain the outbound buffer. Returns bytes written this
    /// poll; a partial write leaves the rest for the next tick.
    pub fn poll(&mut self) -> io::Result<usize> {
        if self.closed || self.out.is_empty() {
            return Ok(0);
        }
        let mut written = 0;
        while !self.out.is_empty() {
            match self.channel.write(&self.out) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted zero bytes",
                    ))
                }
                Ok(n) => {
                    self.out.advance(n);
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    pub fn has_backlog(&self) -> bool {
        !self.out.is_empty()
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        tracing::debug!(connection_id = self.connection_id, "sender closed");
        self.channel.shutdown(Shutdown::Write);
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Builds the endpoint pair for a new connection.
pub trait EndpointFactory: Send {
    fn receiver_endpoint(
        &mut self,
        channel: TcpChannel,
        connection_id: u64,
        session_id: i64,
        library_id: i32,
    ) -> ReceiverEndpoint;

    fn sender_endpoint(
        &mut self,
        channel: TcpChannel,
        connection_id: u64,
        library_id: i32,
    ) -> SenderEndpoint;
}

#[derive(Debug)]
pub struct DefaultEndpointFactory {
    receive_buffer_size: usize,
    send_buffer_size: usize,
}

impl DefaultEndpointFactory {
    pub fn new(configuration: &EngineConfiguration) -> Self {
        Self {
            receive_buffer_size: configuration.receive_buffer_size,
            send_buffer_size: configuration.send_buffer_size,
        }
    }
}

impl EndpointFactory for DefaultEndpointFactory {
    fn receiver_endpoint(
        &mut self,
        channel: TcpChannel,
        connection_id: u64,
        session_id: i64,
        library_id: i32,
    ) -> ReceiverEndpoint {
        ReceiverEndpoint::new(
            channel,
            connection_id,
            session_id,
            library_id,
            self.receive_buffer_size,
        )
    }

    fn sender_endpoint(
        &mut self,
        channel: TcpChannel,
        connection_id: u64,
        library_id: i32,
    ) -> SenderEndpoint {
        SenderEndpoint::new(channel, connection_id, library_id, self.send_buffer_size)
    }
}
