//! ibverbs provider backed by `sideway`
//!
//! One device context per connection: protection domain, one CQ shared by
//! the send and receive queues, one RC queue pair and one registered buffer.
//! The queue pair is driven through RESET -> INIT -> RTR -> RTS by hand from
//! the peer record exchanged over the side channel.

use super::{
    check_bounds, Completions, DeviceContext, PortAddress, QpState, RegionKeys, VerbsError,
    VerbsProvider, WcOpcode, WcStatus, WorkCompletion, POLL_BATCH,
};
use crate::protocol::{Gid, MemoryRegionRemoteKey, QueuePairInfo};
use crate::transport::RdmaConfig;
use sideway::ibverbs::address::{AddressHandleAttribute, Gid as VerbsGid};
use sideway::ibverbs::completion::{
    GenericCompletionQueue, PollCompletionQueueError, WorkCompletionOperationType,
    WorkCompletionStatus,
};
use sideway::ibverbs::device::{DeviceInfo, DeviceList};
use sideway::ibverbs::device_context::{DeviceContext as VerbsContext, Mtu};
use sideway::ibverbs::memory_region::MemoryRegion;
use sideway::ibverbs::protection_domain::ProtectionDomain;
use sideway::ibverbs::queue_pair::{
    GenericQueuePair, PostSendGuard as _, QueuePair, QueuePairAttribute, QueuePairState,
    QueuePairType, SetScatterGatherEntry, WorkRequestFlags,
};
use sideway::ibverbs::AccessFlags;
use std::sync::Arc;

const CQ_DEPTH: u32 = 1024;

pub struct SidewayVerbs;

impl VerbsProvider for SidewayVerbs {
    fn name(&self) -> &'static str {
        "verbs"
    }

    fn open(&self, config: &RdmaConfig) -> Result<Box<dyn DeviceContext>, VerbsError> {
        let device_list = DeviceList::new().map_err(|e| VerbsError::call("ibv_get_device_list", e))?;
        let device = match &config.device {
            Some(name) => device_list
                .iter()
                .find(|d| d.name() == *name)
                .ok_or_else(|| VerbsError::NoDevice(format!(" named '{}'", name)))?,
            None => device_list
                .iter()
                .next()
                .ok_or_else(|| VerbsError::NoDevice(String::new()))?,
        };
        let name = device.name().to_string();
        let ctx = device.open().map_err(|e| VerbsError::call("ibv_open_device", e))?;
        let pd = ctx.alloc_pd().map_err(|e| VerbsError::call("ibv_alloc_pd", e))?;
        let cq: GenericCompletionQueue = ctx
            .create_cq_builder()
            .setup_cqe(CQ_DEPTH)
            .build()
            .map_err(|e| VerbsError::call("ibv_create_cq", e))?
            .into();

        let port_attr = ctx
            .query_port(config.ib_port)
            .map_err(|e| VerbsError::call("ibv_query_port", e))?;
        let gid = ctx
            .query_gid(config.ib_port, config.gid_index as u32)
            .map_err(|e| VerbsError::call("ibv_query_gid", e))?;

        tracing::info!(
            "Opened RDMA device {} port {} lid {}",
            name,
            config.ib_port,
            port_attr.lid()
        );

        Ok(Box::new(SidewayContext {
            name,
            port: PortAddress {
                port_num: config.ib_port,
                lid: port_attr.lid(),
                gid: Gid(gid.raw),
            },
            gid_index: config.gid_index,
            qp: None,
            qp_state: QpState::Reset,
            region: None,
            cq: Some(cq),
            pd: Some(pd),
            ctx: Some(ctx),
        }))
    }
}

struct Region {
    mr: Arc<MemoryRegion>,
    // Registered memory; must outlive `mr`.
    buf: Box<[u8]>,
    keys: RegionKeys,
}

struct SidewayContext {
    name: String,
    port: PortAddress,
    gid_index: u8,
    qp: Option<GenericQueuePair>,
    qp_state: QpState,
    region: Option<Region>,
    cq: Option<GenericCompletionQueue>,
    pd: Option<Arc<ProtectionDomain>>,
    ctx: Option<Arc<VerbsContext>>,
}

impl SidewayContext {
    fn qp_mut(&mut self) -> Result<&mut GenericQueuePair, VerbsError> {
        self.qp.as_mut().ok_or(VerbsError::Missing("queue pair"))
    }

    fn region(&self) -> Result<&Region, VerbsError> {
        self.region.as_ref().ok_or(VerbsError::Missing("memory region"))
    }

    fn expect_state(&self, from: QpState, to: QpState) -> Result<(), VerbsError> {
        if self.qp_state != from {
            return Err(VerbsError::InvalidTransition {
                from: self.qp_state,
                to,
            });
        }
        Ok(())
    }

    fn sge(&self, offset: usize, len: usize) -> Result<(u32, u64, u32), VerbsError> {
        let region = self.region()?;
        check_bounds(offset, len, region.keys.len)?;
        Ok((region.keys.lkey, region.keys.addr + offset as u64, len as u32))
    }
}

fn map_status(status: WorkCompletionStatus) -> WcStatus {
    match status {
        WorkCompletionStatus::Success => WcStatus::Success,
        WorkCompletionStatus::LocalLengthError => WcStatus::LocalLength,
        WorkCompletionStatus::LocalProtectionError => WcStatus::LocalProtection,
        WorkCompletionStatus::WorkRequestFlushedError => WcStatus::Flushed,
        WorkCompletionStatus::RemoteAccessError => WcStatus::RemoteAccess,
        WorkCompletionStatus::RemoteInvalidRequestError => WcStatus::RemoteInvalidRequest,
        WorkCompletionStatus::TransportRetryCounterExceeded => WcStatus::RetryExceeded,
        WorkCompletionStatus::RnrRetryCounterExceeded => WcStatus::RnrRetryExceeded,
        other => WcStatus::Other(other as u32),
    }
}

impl DeviceContext for SidewayContext {
    fn device_name(&self) -> &str {
        &self.name
    }

    fn port(&self) -> PortAddress {
        self.port
    }

    fn register_region(&mut self, len: usize) -> Result<RegionKeys, VerbsError> {
        if self.region.is_some() {
            return Err(VerbsError::call("ibv_reg_mr", "region already registered"));
        }
        let pd = self.pd.as_ref().ok_or(VerbsError::Missing("protection domain"))?;
        let mut buf = vec![0u8; len].into_boxed_slice();
        let access = AccessFlags::LocalWrite | AccessFlags::RemoteWrite | AccessFlags::RemoteRead;

        // SAFETY: `buf` is owned by the same `Region` as `mr` and is only
        // dropped after the registration is released.
        let mr = unsafe { pd.reg_mr(buf.as_mut_ptr() as usize, len, access) }
            .map_err(|e| VerbsError::call("ibv_reg_mr", e))?;

        let keys = RegionKeys {
            lkey: mr.lkey(),
            rkey: MemoryRegionRemoteKey(mr.rkey()),
            addr: buf.as_ptr() as u64,
            len,
        };
        self.region = Some(Region { mr, buf, keys });
        Ok(keys)
    }

    fn write_region(&mut self, offset: usize, data: &[u8]) -> Result<(), VerbsError> {
        let region = self.region.as_mut().ok_or(VerbsError::Missing("memory region"))?;
        check_bounds(offset, data.len(), region.keys.len)?;
        region.buf[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_region(&self, offset: usize, out: &mut [u8]) -> Result<(), VerbsError> {
        let region = self.region()?;
        check_bounds(offset, out.len(), region.keys.len)?;
        out.copy_from_slice(&region.buf[offset..offset + out.len()]);
        Ok(())
    }

    fn deregister_region(&mut self) {
        if let Some(region) = self.region.take() {
            let Region { mr, buf, keys } = region;
            drop(mr);
            drop(buf);
            tracing::debug!("Deregistered memory region lkey={:#x}", keys.lkey);
        }
    }

    fn create_queue_pair(&mut self, max_send_wr: u32, max_recv_wr: u32) -> Result<u32, VerbsError> {
        let pd = self.pd.as_ref().ok_or(VerbsError::Missing("protection domain"))?;
        let cq = self.cq.as_ref().ok_or(VerbsError::Missing("completion queue"))?;

        let mut builder = pd.create_qp_builder();
        builder.setup_send_cq(cq.clone());
        builder.setup_recv_cq(cq.clone());
        builder.setup_qp_type(QueuePairType::ReliableConnection);
        builder
            .setup_max_send_wr(max_send_wr)
            .setup_max_send_sge(1)
            .setup_max_recv_wr(max_recv_wr)
            .setup_max_recv_sge(1);
        let qp = builder.build().map_err(|e| VerbsError::call("ibv_create_qp", e))?;
        let qp = GenericQueuePair::Basic(qp);
        let qp_num = qp.qp_number();
        self.qp = Some(qp);
        self.qp_state = QpState::Reset;
        Ok(qp_num)
    }

    fn queue_pair_state(&self) -> QpState {
        self.qp_state
    }

    fn modify_to_init(&mut self) -> Result<(), VerbsError> {
        self.expect_state(QpState::Reset, QpState::Init)?;
        let port_num = self.port.port_num;
        let mut attr = QueuePairAttribute::new();
        attr.setup_state(QueuePairState::Init)
            .setup_pkey_index(0)
            .setup_port(port_num)
            .setup_access_flags(
                AccessFlags::LocalWrite | AccessFlags::RemoteWrite | AccessFlags::RemoteRead,
            );
        self.qp_mut()?
            .modify(&attr)
            .map_err(|e| VerbsError::call("ibv_modify_qp(INIT)", e))?;
        self.qp_state = QpState::Init;
        Ok(())
    }

    fn modify_to_rtr(&mut self, peer: &QueuePairInfo) -> Result<(), VerbsError> {
        self.expect_state(QpState::Init, QpState::ReadyToReceive)?;
        let port_num = self.port.port_num;
        let gid_index = self.gid_index;

        let mut ah_attr = AddressHandleAttribute::new();
        ah_attr.setup_dest_lid(peer.lid).setup_port(port_num).setup_service_level(0);
        if peer.gid != Gid::default() {
            ah_attr
                .setup_grh_src_gid_index(gid_index)
                .setup_grh_dest_gid(&VerbsGid::from(peer.gid.0))
                .setup_grh_hop_limit(64);
        }

        let mut attr = QueuePairAttribute::new();
        attr.setup_state(QueuePairState::ReadyToReceive)
            .setup_path_mtu(Mtu::Mtu1024)
            .setup_dest_qp_num(peer.qp_num)
            .setup_rq_psn(peer.psn)
            .setup_max_dest_read_atomic(1)
            .setup_min_rnr_timer(12)
            .setup_address_vector(&ah_attr);
        self.qp_mut()?
            .modify(&attr)
            .map_err(|e| VerbsError::call("ibv_modify_qp(RTR)", e))?;
        self.qp_state = QpState::ReadyToReceive;
        Ok(())
    }

    fn modify_to_rts(&mut self, local_psn: u32) -> Result<(), VerbsError> {
        self.expect_state(QpState::ReadyToReceive, QpState::ReadyToSend)?;
        let mut attr = QueuePairAttribute::new();
        attr.setup_state(QueuePairState::ReadyToSend)
            .setup_sq_psn(local_psn)
            .setup_timeout(14)
            .setup_retry_cnt(7)
            .setup_rnr_retry(7)
            .setup_max_read_atomic(1);
        self.qp_mut()?
            .modify(&attr)
            .map_err(|e| VerbsError::call("ibv_modify_qp(RTS)", e))?;
        self.qp_state = QpState::ReadyToSend;
        Ok(())
    }

    fn post_recv(&mut self, wr_id: u64, offset: usize, len: usize) -> Result<(), VerbsError> {
        let (lkey, addr, len) = self.sge(offset, len)?;
        let qp = self.qp_mut()?;
        let mut guard = qp.start_post_recv();
        // SAFETY: the SGE lies inside the registered region owned by this context.
        unsafe {
            guard.construct_wr(wr_id).setup_sge(lkey, addr, len);
        }
        guard.post().map_err(|e| VerbsError::call("ibv_post_recv", e))
    }

    fn post_send(&mut self, wr_id: u64, offset: usize, len: usize) -> Result<(), VerbsError> {
        let (lkey, addr, len) = self.sge(offset, len)?;
        let qp = self.qp_mut()?;
        let mut guard = qp.start_post_send();
        let wr = guard.construct_wr(wr_id, WorkRequestFlags::Signaled);
        // SAFETY: the SGE lies inside the registered region owned by this context.
        unsafe {
            wr.setup_send().setup_sge(lkey, addr, len);
        }
        guard.post().map_err(|e| VerbsError::call("ibv_post_send", e))
    }

    fn poll(&mut self, out: &mut Completions) -> Result<(), VerbsError> {
        let cq = self.cq.as_ref().ok_or(VerbsError::Missing("completion queue"))?;
        match cq.start_poll() {
            Ok(poller) => {
                for wc in poller {
                    let opcode = match WorkCompletionOperationType::from(wc.opcode()) {
                        WorkCompletionOperationType::Receive
                        | WorkCompletionOperationType::ReceiveWithImmediate => WcOpcode::Recv,
                        _ => WcOpcode::Send,
                    };
                    out.push(WorkCompletion {
                        wr_id: wc.wr_id(),
                        status: map_status(WorkCompletionStatus::from(wc.status())),
                        opcode,
                        byte_len: wc.byte_len(),
                    });
                    if out.len() >= POLL_BATCH {
                        break;
                    }
                }
                Ok(())
            }
            Err(PollCompletionQueueError::CompletionQueueEmpty) => Ok(()),
            Err(e) => Err(VerbsError::call("ibv_poll_cq", format!("{:?}", e))),
        }
    }

    fn destroy_queue_pair(&mut self) {
        if let Some(mut qp) = self.qp.take() {
            if !matches!(self.qp_state, QpState::Reset | QpState::Error) {
                let mut attr = QueuePairAttribute::new();
                attr.setup_state(QueuePairState::Error);
                if let Err(e) = qp.modify(&attr) {
                    tracing::warn!("failed to move QP to Error before destroy: {}", e);
                }
            }
            drop(qp);
            self.qp_state = QpState::Reset;
            tracing::debug!("Destroyed queue pair on {}", self.name);
        }
    }
}

impl Drop for SidewayContext {
    fn drop(&mut self) {
        self.destroy_queue_pair();
        self.deregister_region();
        self.cq.take();
        self.pd.take();
        self.ctx.take();
    }
}
