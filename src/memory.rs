//! Registered message buffer for RDMA connections
//!
//! Each RDMA connection registers one region and carves it into fixed-size
//! slots: `recv_depth` receive slots followed by one send slot.
//!
//! ```text
//! | recv 0 | recv 1 | ... | recv N-1 | send |
//! ```
//!
//! The keys stay inside [`MemoryRegion`]; nothing outside the owning
//! connection can hold them past deregistration.

use crate::error::Fault;
use crate::protocol::Message;
use crate::verbs::{DeviceContext, RegionKeys, VerbsError};

/// Slot sizes are rounded up to this many bytes.
pub const SLOT_ALIGNMENT: usize = 64;

/// Slot geometry of a region
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotLayout {
    pub slot_size: usize,
    pub recv_depth: usize,
}

impl SlotLayout {
    pub fn new(slot_size: usize, recv_depth: usize) -> Self {
        let slot_size = (slot_size.max(1) + SLOT_ALIGNMENT - 1) & !(SLOT_ALIGNMENT - 1);
        Self {
            slot_size,
            recv_depth: recv_depth.max(1),
        }
    }

    pub fn region_len(&self) -> usize {
        self.slot_size * (self.recv_depth + 1)
    }

    pub fn recv_offset(&self, slot: usize) -> usize {
        slot * self.slot_size
    }

    pub fn send_offset(&self) -> usize {
        self.recv_depth * self.slot_size
    }
}

/// A registered region with its slot layout.
pub struct MemoryRegion {
    keys: RegionKeys,
    layout: SlotLayout,
    /// Staging copy for the slot currently being encoded or decoded
    staging: Vec<u8>,
    registered: bool,
}

impl MemoryRegion {
    /// Register a region sized for `layout` on `ctx`.
    pub fn register(ctx: &mut dyn DeviceContext, layout: SlotLayout) -> Result<Self, VerbsError> {
        let keys = ctx.register_region(layout.region_len())?;
        tracing::debug!(
            "Registered {} bytes on {} ({} recv slots of {} bytes) lkey={:#x}",
            keys.len,
            ctx.device_name(),
            layout.recv_depth,
            layout.slot_size,
            keys.lkey
        );
        Ok(Self {
            keys,
            layout,
            staging: vec![0u8; layout.slot_size],
            registered: true,
        })
    }

    pub fn layout(&self) -> SlotLayout {
        self.layout
    }

    pub(crate) fn keys(&self) -> &RegionKeys {
        &self.keys
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Encode `msg` into the send slot and return the frame length.
    pub fn stage_send(&mut self, ctx: &mut dyn DeviceContext, msg: &Message) -> Result<usize, Fault> {
        self.check_registered()?;
        let len = msg.encode_into(&mut self.staging)?;
        ctx.write_region(self.layout.send_offset(), &self.staging[..len])?;
        Ok(len)
    }

    /// Decode the frame a completion reported in receive slot `slot`.
    pub fn load_recv(
        &mut self,
        ctx: &dyn DeviceContext,
        slot: usize,
        len: usize,
    ) -> Result<Message, Fault> {
        self.check_registered()?;
        if slot >= self.layout.recv_depth {
            return Err(Fault::Malformed(format!("completion for unknown slot {}", slot)));
        }
        if len > self.layout.slot_size {
            return Err(Fault::TooLarge {
                len,
                max: self.layout.slot_size,
            });
        }
        ctx.read_region(self.layout.recv_offset(slot), &mut self.staging[..len])?;
        Message::decode_exact(&self.staging[..len])
    }

    /// Drop the registration. Later calls are no-ops.
    pub fn deregister(&mut self, ctx: &mut dyn DeviceContext) {
        if self.registered {
            ctx.deregister_region();
            self.registered = false;
        }
    }

    fn check_registered(&self) -> Result<(), Fault> {
        if self.registered {
            Ok(())
        } else {
            Err(Fault::Verbs(VerbsError::Missing("memory region")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RdmaConfig;
    use crate::verbs::soft::SoftVerbs;
    use crate::verbs::VerbsProvider;

    #[test]
    fn test_slot_layout() {
        let layout = SlotLayout::new(100, 4);
        assert_eq!(layout.slot_size, 128);
        assert_eq!(layout.region_len(), 128 * 5);
        assert_eq!(layout.recv_offset(0), 0);
        assert_eq!(layout.recv_offset(3), 384);
        assert_eq!(layout.send_offset(), 512);

        assert_eq!(SlotLayout::new(0, 0), SlotLayout::new(1, 1));
    }

    #[test]
    fn test_stage_and_load() {
        let mut ctx = SoftVerbs.open(&RdmaConfig::default()).unwrap();
        let layout = SlotLayout::new(128, 2);
        let mut region = MemoryRegion::register(ctx.as_mut(), layout).unwrap();
        assert_eq!(region.keys().len, layout.region_len());

        let msg = Message::request(&b"key"[..], &b"Hello, RDMA!"[..]);
        let len = region.stage_send(ctx.as_mut(), &msg).unwrap();
        assert_eq!(len, msg.encoded_len());

        // Copy the send slot into receive slot 1 to fake a delivery.
        let mut raw = vec![0u8; len];
        ctx.read_region(layout.send_offset(), &mut raw).unwrap();
        ctx.write_region(layout.recv_offset(1), &raw).unwrap();
        assert_eq!(region.load_recv(ctx.as_ref(), 1, len).unwrap(), msg);

        assert!(region.load_recv(ctx.as_ref(), 2, len).is_err());
        assert!(region.load_recv(ctx.as_ref(), 0, 129).is_err());
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut ctx = SoftVerbs.open(&RdmaConfig::default()).unwrap();
        let mut region = MemoryRegion::register(ctx.as_mut(), SlotLayout::new(64, 1)).unwrap();
        let msg = Message::request(vec![0u8; 32], vec![0u8; 32]);
        assert!(matches!(
            region.stage_send(ctx.as_mut(), &msg),
            Err(Fault::TooLarge { len: 73, max: 64 })
        ));
    }

    #[test]
    fn test_deregister_is_idempotent() {
        let mut ctx = SoftVerbs.open(&RdmaConfig::default()).unwrap();
        let mut region = MemoryRegion::register(ctx.as_mut(), SlotLayout::new(64, 1)).unwrap();
        region.deregister(ctx.as_mut());
        region.deregister(ctx.as_mut());
        assert!(!region.is_registered());
        let msg = Message::request(&b""[..], &b""[..]);
        assert!(region.stage_send(ctx.as_mut(), &msg).is_err());
    }
}
