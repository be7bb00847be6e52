//! Transport abstraction
//!
//! One trait family ([`Transport`], [`Listener`], [`Connection`]) with a TCP
//! and an RDMA implementation, chosen once at construction time through
//! [`build_transport`]. Sessions only ever see `Box<dyn Connection>`.

use crate::error::{ConfigError, Result};
use crate::protocol::Message;
use crate::verbs::ProviderKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub mod rdma;
pub mod tcp;

pub use rdma::RdmaTransport;
pub use tcp::TcpTransport;

/// TCP data port and RDMA side-channel port.
pub const DEFAULT_PORT: u16 = 4444;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    Tcp,
    #[default]
    Rdma,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => f.write_str("tcp"),
            TransportKind::Rdma => f.write_str("rdma"),
        }
    }
}

/// Connection lifecycle. CLOSED is reachable from every state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Init,
    Handshaking,
    Ready,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Init => "INIT",
            ConnectionState::Handshaking => "HANDSHAKING",
            ConnectionState::Ready => "READY",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// RDMA-specific part of an endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RdmaEndpoint {
    pub device: String,
    pub port: u8,
    pub qp_num: u32,
    pub psn: u32,
    /// Process-unique reference used in log lines
    pub conn_ref: u64,
}

/// Addressing of one connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub rdma: Option<RdmaEndpoint>,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.local, self.remote)?;
        if let Some(rdma) = &self.rdma {
            write!(f, " [{}:{} qp={:#x}]", rdma.device, rdma.port, rdma.qp_num)?;
        }
        Ok(())
    }
}

/// Factory for listeners and outgoing connections.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Connect and complete the handshake. The returned connection is READY.
    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>>;

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>>;
}

#[async_trait]
pub trait Listener: Send {
    fn local_addr(&self) -> SocketAddr;

    /// Wait for the next peer. The returned connection is in INIT; the caller
    /// drives it to READY with [`Connection::handshake`].
    async fn accept(&mut self) -> Result<Box<dyn Connection>>;
}

/// One established (or establishing) connection, driven by a single task.
#[async_trait]
pub trait Connection: Send {
    fn kind(&self) -> TransportKind;

    fn state(&self) -> ConnectionState;

    fn endpoint(&self) -> &Endpoint;

    /// Largest encoded frame `send` accepts.
    fn max_message_len(&self) -> usize;

    /// Bring an accepted connection to READY. No-op when already READY.
    async fn handshake(&mut self) -> Result<()>;

    async fn send(&mut self, msg: &Message) -> Result<()>;

    /// Next message, or `None` once the peer closed in order.
    async fn receive(&mut self) -> Result<Option<Message>>;

    /// Release everything. Safe to call repeatedly and after a failure.
    async fn close(&mut self);
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TcpConfig {
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

/// Configuration for the RDMA transport
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RdmaConfig {
    pub provider: ProviderKind,
    /// Device name; first device when unset
    pub device: Option<String>,
    pub ib_port: u8,
    pub gid_index: u8,
    /// Bound on every completion wait
    pub completion_timeout: Duration,
    /// Bytes per receive/send slot; the largest frame one message can use
    pub slot_size: usize,
    /// Receive slots posted per connection
    pub recv_depth: usize,
}

impl Default for RdmaConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Soft,
            device: None,
            ib_port: 1,
            gid_index: 0,
            completion_timeout: Duration::from_secs(5),
            slot_size: 64 * 1024,
            recv_depth: 16,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    pub kind: TransportKind,
    pub tcp: TcpConfig,
    pub rdma: RdmaConfig,
}

impl TransportConfig {
    pub fn tcp() -> Self {
        Self {
            kind: TransportKind::Tcp,
            ..Default::default()
        }
    }

    pub fn rdma(rdma: RdmaConfig) -> Self {
        Self {
            kind: TransportKind::Rdma,
            rdma,
            ..Default::default()
        }
    }
}

/// Build the transport selected by `config.kind`.
pub fn build_transport(config: &TransportConfig) -> Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match config.kind {
        TransportKind::Tcp => Arc::new(TcpTransport::new(config.tcp.clone())),
        TransportKind::Rdma => Arc::new(RdmaTransport::new(config.rdma.clone())?),
    };
    Ok(transport)
}

/// Validate a peer or bind address, appending [`DEFAULT_PORT`] when the
/// port is missing.
pub fn normalize_address(addr: &str) -> std::result::Result<String, ConfigError> {
    normalize_address_with_port(addr, DEFAULT_PORT)
}

/// Like [`normalize_address`] with a caller-chosen default port.
///
/// Only checks shape; resolution happens on connect.
pub fn normalize_address_with_port(
    addr: &str,
    default_port: u16,
) -> std::result::Result<String, ConfigError> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(ConfigError::MissingServerAddress);
    }
    if addr.chars().any(char::is_whitespace) {
        return Err(ConfigError::InvalidAddress(addr.to_string()));
    }
    if addr.parse::<SocketAddr>().is_ok() {
        return Ok(addr.to_string());
    }
    // Bare IPv6 literal
    if addr.parse::<std::net::Ipv6Addr>().is_ok() {
        return Ok(format!("[{}]:{}", addr, default_port));
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') => {
            port.parse::<u16>()
                .map_err(|_| ConfigError::InvalidAddress(addr.to_string()))?;
            Ok(addr.to_string())
        }
        Some(_) => Err(ConfigError::InvalidAddress(addr.to_string())),
        None => Ok(format!("{}:{}", addr, default_port)),
    }
}
