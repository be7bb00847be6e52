//! Verbs provider abstraction
//!
//! The RDMA transport drives a device through [`DeviceContext`]: one opened
//! device with a single completion queue, one reliable-connection queue pair
//! and one registered memory region. Two providers exist:
//!
//! - [`soft::SoftVerbs`]: in-process software fabric. Queue pairs only reach
//!   peers living in the same process (tests and demos).
//! - `sideway::SidewayVerbs` (feature `rdma`): real hardware via ibverbs.

use crate::protocol::{Gid, MemoryRegionRemoteKey, QueuePairInfo};
use crate::transport::RdmaConfig;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub mod soft;
#[cfg(feature = "rdma")]
pub mod sideway;

/// Completions drained per poll call.
pub const POLL_BATCH: usize = 16;

pub type Completions = SmallVec<[WorkCompletion; POLL_BATCH]>;

#[derive(Debug, Error)]
pub enum VerbsError {
    #[error("no RDMA device available{0}")]
    NoDevice(String),

    #[error("{op} failed: {reason}")]
    Call { op: &'static str, reason: String },

    #[error("invalid queue pair transition {from:?} -> {to:?}")]
    InvalidTransition { from: QpState, to: QpState },

    #[error("region access [{offset}, {end}) outside registered {len} bytes")]
    OutOfBounds { offset: usize, end: usize, len: usize },

    #[error("{0} not allocated")]
    Missing(&'static str),
}

impl VerbsError {
    pub fn call(op: &'static str, reason: impl fmt::Display) -> Self {
        VerbsError::Call {
            op,
            reason: reason.to_string(),
        }
    }
}

/// Queue pair states the transport walks through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QpState {
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WcStatus {
    Success,
    LocalLength,
    LocalProtection,
    Flushed,
    RemoteAccess,
    RemoteInvalidRequest,
    RetryExceeded,
    RnrRetryExceeded,
    Other(u32),
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WcStatus::Success => f.write_str("success"),
            WcStatus::LocalLength => f.write_str("local length error"),
            WcStatus::LocalProtection => f.write_str("local protection error"),
            WcStatus::Flushed => f.write_str("work request flushed"),
            WcStatus::RemoteAccess => f.write_str("remote access error"),
            WcStatus::RemoteInvalidRequest => f.write_str("remote invalid request"),
            WcStatus::RetryExceeded => f.write_str("transport retry counter exceeded"),
            WcStatus::RnrRetryExceeded => f.write_str("RNR retry counter exceeded"),
            WcStatus::Other(code) => write!(f, "status {}", code),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    Recv,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub byte_len: u32,
}

/// Addressing of the local port.
#[derive(Clone, Copy, Debug)]
pub struct PortAddress {
    pub port_num: u8,
    pub lid: u16,
    pub gid: Gid,
}

/// Keys and address of a registered region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionKeys {
    pub lkey: u32,
    pub rkey: MemoryRegionRemoteKey,
    pub addr: u64,
    pub len: usize,
}

/// Factory for device contexts.
pub trait VerbsProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn open(&self, config: &RdmaConfig) -> Result<Box<dyn DeviceContext>, VerbsError>;
}

/// An opened device with its completion queue, queue pair and region.
///
/// Callers release in the order queue pair, region, context (drop).
pub trait DeviceContext: Send {
    fn device_name(&self) -> &str;

    fn port(&self) -> PortAddress;

    fn register_region(&mut self, len: usize) -> Result<RegionKeys, VerbsError>;

    fn write_region(&mut self, offset: usize, data: &[u8]) -> Result<(), VerbsError>;

    fn read_region(&self, offset: usize, out: &mut [u8]) -> Result<(), VerbsError>;

    fn deregister_region(&mut self);

    /// Create the RC queue pair in RESET and return its number.
    fn create_queue_pair(&mut self, max_send_wr: u32, max_recv_wr: u32)
        -> Result<u32, VerbsError>;

    fn queue_pair_state(&self) -> QpState;

    fn modify_to_init(&mut self) -> Result<(), VerbsError>;

    fn modify_to_rtr(&mut self, peer: &QueuePairInfo) -> Result<(), VerbsError>;

    fn modify_to_rts(&mut self, local_psn: u32) -> Result<(), VerbsError>;

    fn post_recv(&mut self, wr_id: u64, offset: usize, len: usize) -> Result<(), VerbsError>;

    /// Post a signaled SEND of `len` bytes starting at `offset`.
    fn post_send(&mut self, wr_id: u64, offset: usize, len: usize) -> Result<(), VerbsError>;

    /// Move available completions into `out` without blocking.
    fn poll(&mut self, out: &mut Completions) -> Result<(), VerbsError>;

    fn destroy_queue_pair(&mut self);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderKind {
    /// In-process software fabric
    #[default]
    Soft,
    /// ibverbs hardware (requires the `rdma` feature)
    Verbs,
}

/// Build the provider selected by the configuration.
pub fn provider(kind: ProviderKind) -> Result<Arc<dyn VerbsProvider>, VerbsError> {
    match kind {
        ProviderKind::Soft => Ok(Arc::new(soft::SoftVerbs)),
        ProviderKind::Verbs => {
            #[cfg(feature = "rdma")]
            {
                Ok(Arc::new(sideway::SidewayVerbs))
            }
            #[cfg(not(feature = "rdma"))]
            {
                tracing::error!("Real RDMA requested but binary was not compiled with 'rdma' feature");
                Err(VerbsError::NoDevice(
                    ": rebuild with '--features rdma' or use --soft".to_string(),
                ))
            }
        }
    }
}

/// Bounded check shared by providers.
pub(crate) fn check_bounds(offset: usize, len: usize, region_len: usize) -> Result<(), VerbsError> {
    let end = offset.saturating_add(len);
    if end > region_len {
        return Err(VerbsError::OutOfBounds {
            offset,
            end,
            len: region_len,
        });
    }
    Ok(())
}
