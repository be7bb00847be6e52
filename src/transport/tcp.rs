//! TCP transport
//!
//! Frames go back to back on the stream. Reads accumulate in a buffer until
//! a whole frame is present, so short reads and coalesced frames are both
//! handled by [`Message::decode`].

use super::{
    normalize_address, Connection, ConnectionState, Endpoint, Listener, TcpConfig, Transport,
    TransportKind,
};
use crate::error::{Fault, Result, TransportError};
use crate::protocol::{frame_len, Message, MAX_FIELD_LEN};
use async_trait::async_trait;
use bytes::BytesMut;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const READ_BUF_CAPACITY: usize = 64 * 1024;

pub struct TcpTransport {
    config: TcpConfig,
}

impl TcpTransport {
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>> {
        let addr = normalize_address(addr)?;
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| TransportError::Connect {
                addr: addr.clone(),
                source,
            })?;
        let mut conn = TcpConnection::new(stream, self.config.nodelay).map_err(|source| {
            TransportError::Connect { addr, source }
        })?;
        conn.state = ConnectionState::Ready;
        tracing::debug!("TCP connection established {}", conn.endpoint);
        Ok(Box::new(conn))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let addr = normalize_address(addr)?;
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;
        tracing::info!("TCP listener bound to {}", local_addr);
        Ok(Box::new(TcpListenerHandle {
            listener,
            local_addr,
            nodelay: self.config.nodelay,
        }))
    }
}

struct TcpListenerHandle {
    listener: TcpListener,
    local_addr: SocketAddr,
    nodelay: bool,
}

#[async_trait]
impl Listener for TcpListenerHandle {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept(&mut self) -> Result<Box<dyn Connection>> {
        let (stream, peer) = self.listener.accept().await.map_err(TransportError::Accept)?;
        tracing::debug!("Accepted TCP connection from {}", peer);
        let conn = TcpConnection::new(stream, self.nodelay).map_err(TransportError::Accept)?;
        Ok(Box::new(conn))
    }
}

pub struct TcpConnection {
    stream: Option<TcpStream>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    state: ConnectionState,
    endpoint: Endpoint,
}

impl TcpConnection {
    fn new(stream: TcpStream, nodelay: bool) -> std::io::Result<Self> {
        stream.set_nodelay(nodelay)?;
        let endpoint = Endpoint {
            local: stream.local_addr()?,
            remote: stream.peer_addr()?,
            rdma: None,
        };
        Ok(Self {
            stream: Some(stream),
            read_buf: BytesMut::with_capacity(READ_BUF_CAPACITY),
            write_buf: BytesMut::new(),
            state: ConnectionState::Init,
            endpoint,
        })
    }

}

/// The stream, if the connection is READY. Takes the fields separately so
/// callers can keep borrowing the buffers.
fn ready_stream<'a>(
    state: &ConnectionState,
    stream: &'a mut Option<TcpStream>,
) -> std::result::Result<&'a mut TcpStream, Fault> {
    match (state, stream.as_mut()) {
        (ConnectionState::Ready, Some(stream)) => Ok(stream),
        (state, _) => Err(Fault::NotReady(*state)),
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn max_message_len(&self) -> usize {
        frame_len(MAX_FIELD_LEN, MAX_FIELD_LEN)
    }

    async fn handshake(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Ready => Ok(()),
            ConnectionState::Init if self.stream.is_some() => {
                // Nothing to exchange on TCP.
                self.state = ConnectionState::Ready;
                Ok(())
            }
            state => Err(TransportError::handshake("tcp", Fault::NotReady(state))),
        }
    }

    async fn send(&mut self, msg: &Message) -> Result<()> {
        let max = self.max_message_len();
        msg.validate(max).map_err(TransportError::Send)?;

        self.write_buf.clear();
        msg.encode(&mut self.write_buf).map_err(TransportError::Send)?;

        let frame = self.write_buf.split().freeze();
        let stream = ready_stream(&self.state, &mut self.stream).map_err(TransportError::Send)?;
        stream
            .write_all(&frame)
            .await
            .map_err(|e| TransportError::Send(Fault::Io(e)))?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<Message>> {
        loop {
            if let Some(msg) = Message::decode(&mut self.read_buf).map_err(TransportError::Receive)? {
                return Ok(Some(msg));
            }

            let stream = ready_stream(&self.state, &mut self.stream).map_err(TransportError::Receive)?;
            let n = stream
                .read_buf(&mut self.read_buf)
                .await
                .map_err(|e| TransportError::Receive(Fault::Io(e)))?;

            if n == 0 {
                if self.read_buf.is_empty() {
                    tracing::debug!("Peer {} closed the connection", self.endpoint.remote);
                    return Ok(None);
                }
                return Err(TransportError::Receive(Fault::Malformed(format!(
                    "peer closed with {} bytes of a partial frame buffered",
                    self.read_buf.len()
                ))));
            }
        }
    }

    async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closing;
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!("TCP shutdown for {} failed: {}", self.endpoint.remote, e);
            }
        }
        self.read_buf.clear();
        self.state = ConnectionState::Closed;
        tracing::debug!("TCP connection {} closed", self.endpoint);
    }
}
