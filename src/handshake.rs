//! RDMA side-channel handshake
//!
//! Before a queue pair can leave INIT each side needs the other's queue pair
//! number, PSN and region keys. Peers swap one fixed-width
//! [`QueuePairInfo`] record over a short-lived TCP connection, bring their
//! queue pairs up, then swap a single ready byte so neither side sends before
//! the other has reached RTS. The side channel is dropped after that.

use crate::error::Fault;
use crate::protocol::QueuePairInfo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Byte each side writes once its queue pair is in RTS.
pub const READY_MARKER: u8 = b'R';

const PSN_MASK: u32 = 0x00ff_ffff;

/// Random 24-bit starting PSN.
pub fn generate_psn() -> u32 {
    rand::random::<u32>() & PSN_MASK
}

/// Send our record and read the peer's.
///
/// Both sides write first; the record fits in a socket buffer so this never
/// deadlocks.
pub async fn exchange<S>(stream: &mut S, local: &QueuePairInfo) -> Result<QueuePairInfo, Fault>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&local.to_bytes()).await?;
    stream.flush().await?;

    let mut buf = [0u8; QueuePairInfo::ENCODED_LEN];
    stream.read_exact(&mut buf).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => Fault::PeerClosed,
        _ => Fault::Io(e),
    })?;
    let peer = QueuePairInfo::from_bytes(&buf)?;
    tracing::debug!(
        "Side channel: local qp={:#x} psn={:#x}, peer qp={:#x} psn={:#x} lid={}",
        local.qp_num,
        local.psn,
        peer.qp_num,
        peer.psn,
        peer.lid
    );
    Ok(peer)
}

/// Swap the ready marker.
pub async fn ready_barrier<S>(stream: &mut S) -> Result<(), Fault>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[READY_MARKER]).await?;
    stream.flush().await?;

    let mut marker = [0u8; 1];
    stream.read_exact(&mut marker).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => Fault::PeerClosed,
        _ => Fault::Io(e),
    })?;
    if marker[0] != READY_MARKER {
        return Err(Fault::Malformed(format!(
            "expected ready marker {:#04x}, got {:#04x}",
            READY_MARKER, marker[0]
        )));
    }
    Ok(())
}
