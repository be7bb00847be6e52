//! wisp: request/response messaging and latency benchmarking over TCP or
//! RDMA queue pairs.
//!
//! ## Architecture
//!
//! - [`transport`]: one `Transport`/`Listener`/`Connection` interface with a
//!   TCP and an RDMA implementation
//! - [`handshake`]: side-channel exchange that brings RDMA queue pairs up
//! - [`verbs`]: device layer driven by the RDMA transport (software fabric
//!   or ibverbs hardware with the `rdma` feature)
//! - [`session`], [`server`], [`client`]: echo protocol on top of a connection
//! - [`perf`]: round-trip latency and throughput harness
//!
//! ## Usage
//!
//! ```bash
//! wisp -s -t                       # TCP echo server on port 4444
//! wisp -p 127.0.0.1 -t --key_size 3 --payload_size 10
//! wisp -c 127.0.0.1 -t             # KEY [PAYLOAD] lines on stdin
//! ```

pub mod client;
pub mod error;
pub mod handshake;
pub mod memory;
pub mod perf;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;
pub mod verbs;

pub use client::{Client, ClientConfig};
pub use error::{ConfigError, Fault, TransportError};
pub use perf::{PerfConfig, PerfHarness, PerfResult};
pub use protocol::{Message, Opcode};
pub use server::{Server, ServerConfig};
pub use session::Session;
pub use transport::{build_transport, RdmaConfig, TransportConfig, TransportKind};
