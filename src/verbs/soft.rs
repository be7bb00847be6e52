//! Software verbs fabric
//!
//! Emulates reliable-connection queue pairs inside one process so the RDMA
//! transport can run without hardware. Queue pairs register on a global
//! fabric by number; a SEND copies bytes from the sender's region straight
//! into the receive slot the peer posted. PSNs are checked the way an RC
//! responder does: a sender whose send PSN does not match the responder's
//! expected PSN never gets its packet accepted and fails with a retry error.
//!
//! Peers in different processes cannot reach each other; the RTR transition
//! reports that instead of hanging.

use super::{
    check_bounds, Completions, DeviceContext, PortAddress, QpState, RegionKeys, VerbsError,
    VerbsProvider, WcOpcode, WcStatus, WorkCompletion, POLL_BATCH,
};
use crate::protocol::{Gid, MemoryRegionRemoteKey, QueuePairInfo};
use crate::transport::RdmaConfig;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

const PSN_MASK: u32 = 0x00ff_ffff;

static FABRIC: Lazy<SoftFabric> = Lazy::new(SoftFabric::new);

struct SoftFabric {
    next_qp_num: AtomicU32,
    next_key: AtomicU32,
    next_lid: AtomicU16,
    queue_pairs: DashMap<u32, Arc<Mutex<SoftQueuePair>>>,
}

impl SoftFabric {
    fn new() -> Self {
        Self {
            next_qp_num: AtomicU32::new(0x100),
            next_key: AtomicU32::new(0x1000),
            next_lid: AtomicU16::new(1),
            queue_pairs: DashMap::new(),
        }
    }

    fn lookup(&self, qp_num: u32) -> Option<Arc<Mutex<SoftQueuePair>>> {
        self.queue_pairs.get(&qp_num).map(|entry| Arc::clone(entry.value()))
    }
}

type RegionStorage = Arc<Mutex<Vec<u8>>>;

struct PostedRecv {
    wr_id: u64,
    offset: usize,
    len: usize,
}

struct SoftQueuePair {
    qp_num: u32,
    state: QpState,
    region: Option<RegionStorage>,
    dest_qp_num: u32,
    rq_psn: u32,
    sq_psn: u32,
    max_recv_wr: usize,
    recvs: VecDeque<PostedRecv>,
    /// Packets that arrived before a receive was posted
    backlog: VecDeque<Vec<u8>>,
    cq: VecDeque<WorkCompletion>,
}

impl SoftQueuePair {
    /// Land `data` in the oldest posted receive.
    fn land(&mut self, recv: PostedRecv, data: &[u8]) {
        if data.len() > recv.len {
            self.complete(recv.wr_id, WcStatus::LocalLength, WcOpcode::Recv, 0);
            return;
        }
        let Some(region) = &self.region else {
            self.complete(recv.wr_id, WcStatus::LocalProtection, WcOpcode::Recv, 0);
            return;
        };
        region.lock()[recv.offset..recv.offset + data.len()].copy_from_slice(data);
        self.complete(recv.wr_id, WcStatus::Success, WcOpcode::Recv, data.len() as u32);
    }

    fn complete(&mut self, wr_id: u64, status: WcStatus, opcode: WcOpcode, byte_len: u32) {
        self.cq.push_back(WorkCompletion {
            wr_id,
            status,
            opcode,
            byte_len,
        });
    }
}

/// Provider handle for the software fabric.
pub struct SoftVerbs;

impl VerbsProvider for SoftVerbs {
    fn name(&self) -> &'static str {
        "soft"
    }

    fn open(&self, config: &RdmaConfig) -> Result<Box<dyn DeviceContext>, VerbsError> {
        if let Some(device) = &config.device {
            if device != "soft0" {
                return Err(VerbsError::NoDevice(format!(": '{}' (soft fabric only has soft0)", device)));
            }
        }
        let lid = FABRIC.next_lid.fetch_add(1, Ordering::Relaxed);
        let mut gid = [0u8; 16];
        gid[0] = 0xfe;
        gid[1] = 0x80;
        gid[14..16].copy_from_slice(&lid.to_be_bytes());

        tracing::debug!("Opened soft verbs context lid={}", lid);

        Ok(Box::new(SoftContext {
            port: PortAddress {
                port_num: config.ib_port,
                lid,
                gid: Gid(gid),
            },
            region: None,
            qp: None,
        }))
    }
}

struct SoftContext {
    port: PortAddress,
    region: Option<(RegionKeys, RegionStorage)>,
    qp: Option<Arc<Mutex<SoftQueuePair>>>,
}

impl SoftContext {
    fn qp(&self) -> Result<&Arc<Mutex<SoftQueuePair>>, VerbsError> {
        self.qp.as_ref().ok_or(VerbsError::Missing("queue pair"))
    }

    fn transition(&self, from: QpState, to: QpState) -> Result<(), VerbsError> {
        let mut qp = self.qp()?.lock();
        if qp.state != from {
            return Err(VerbsError::InvalidTransition { from: qp.state, to });
        }
        qp.state = to;
        Ok(())
    }
}

impl DeviceContext for SoftContext {
    fn device_name(&self) -> &str {
        "soft0"
    }

    fn port(&self) -> PortAddress {
        self.port
    }

    fn register_region(&mut self, len: usize) -> Result<RegionKeys, VerbsError> {
        if self.region.is_some() {
            return Err(VerbsError::call("reg_mr", "region already registered"));
        }
        let storage = vec![0u8; len];
        let lkey = FABRIC.next_key.fetch_add(2, Ordering::Relaxed);
        let keys = RegionKeys {
            lkey,
            rkey: MemoryRegionRemoteKey(lkey + 1),
            addr: storage.as_ptr() as u64,
            len,
        };
        let storage = Arc::new(Mutex::new(storage));
        if let Some(qp) = &self.qp {
            qp.lock().region = Some(Arc::clone(&storage));
        }
        self.region = Some((keys, storage));
        Ok(keys)
    }

    fn write_region(&mut self, offset: usize, data: &[u8]) -> Result<(), VerbsError> {
        let (keys, storage) = self.region.as_ref().ok_or(VerbsError::Missing("memory region"))?;
        check_bounds(offset, data.len(), keys.len)?;
        storage.lock()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_region(&self, offset: usize, out: &mut [u8]) -> Result<(), VerbsError> {
        let (keys, storage) = self.region.as_ref().ok_or(VerbsError::Missing("memory region"))?;
        check_bounds(offset, out.len(), keys.len)?;
        out.copy_from_slice(&storage.lock()[offset..offset + out.len()]);
        Ok(())
    }

    fn deregister_region(&mut self) {
        if let Some((keys, _)) = self.region.take() {
            tracing::trace!("Deregistered soft region lkey={}", keys.lkey);
        }
    }

    fn create_queue_pair(&mut self, _max_send_wr: u32, max_recv_wr: u32) -> Result<u32, VerbsError> {
        if self.qp.is_some() {
            return Err(VerbsError::call("create_qp", "queue pair already created"));
        }
        let qp_num = FABRIC.next_qp_num.fetch_add(1, Ordering::Relaxed);
        let qp = Arc::new(Mutex::new(SoftQueuePair {
            qp_num,
            state: QpState::Reset,
            region: self.region.as_ref().map(|(_, storage)| Arc::clone(storage)),
            dest_qp_num: 0,
            rq_psn: 0,
            sq_psn: 0,
            max_recv_wr: max_recv_wr as usize,
            recvs: VecDeque::new(),
            backlog: VecDeque::new(),
            cq: VecDeque::new(),
        }));
        FABRIC.queue_pairs.insert(qp_num, Arc::clone(&qp));
        self.qp = Some(qp);
        Ok(qp_num)
    }

    fn queue_pair_state(&self) -> QpState {
        self.qp
            .as_ref()
            .map(|qp| qp.lock().state)
            .unwrap_or(QpState::Reset)
    }

    fn modify_to_init(&mut self) -> Result<(), VerbsError> {
        self.transition(QpState::Reset, QpState::Init)
    }

    fn modify_to_rtr(&mut self, peer: &QueuePairInfo) -> Result<(), VerbsError> {
        if FABRIC.lookup(peer.qp_num).is_none() {
            return Err(VerbsError::call(
                "modify_qp(RTR)",
                format!(
                    "peer queue pair {:#x} is not on the soft fabric (soft verbs only reach peers in the same process)",
                    peer.qp_num
                ),
            ));
        }
        self.transition(QpState::Init, QpState::ReadyToReceive)?;
        let mut qp = self.qp()?.lock();
        qp.dest_qp_num = peer.qp_num;
        qp.rq_psn = peer.psn & PSN_MASK;
        Ok(())
    }

    fn modify_to_rts(&mut self, local_psn: u32) -> Result<(), VerbsError> {
        self.transition(QpState::ReadyToReceive, QpState::ReadyToSend)?;
        self.qp()?.lock().sq_psn = local_psn & PSN_MASK;
        Ok(())
    }

    fn post_recv(&mut self, wr_id: u64, offset: usize, len: usize) -> Result<(), VerbsError> {
        let (keys, _) = self.region.as_ref().ok_or(VerbsError::Missing("memory region"))?;
        check_bounds(offset, len, keys.len)?;

        let mut qp = self.qp()?.lock();
        if matches!(qp.state, QpState::Reset | QpState::Error) {
            return Err(VerbsError::call("post_recv", format!("queue pair in {:?}", qp.state)));
        }
        if qp.recvs.len() >= qp.max_recv_wr {
            return Err(VerbsError::call("post_recv", "receive queue full"));
        }
        let recv = PostedRecv { wr_id, offset, len };
        match qp.backlog.pop_front() {
            Some(data) => qp.land(recv, &data),
            None => qp.recvs.push_back(recv),
        }
        Ok(())
    }

    fn post_send(&mut self, wr_id: u64, offset: usize, len: usize) -> Result<(), VerbsError> {
        let mut data = vec![0u8; len];
        self.read_region(offset, &mut data)?;

        let qp = Arc::clone(self.qp()?);
        let (qp_num, dest, sq_psn) = {
            let guard = qp.lock();
            if guard.state != QpState::ReadyToSend {
                return Err(VerbsError::call("post_send", format!("queue pair in {:?}", guard.state)));
            }
            (guard.qp_num, guard.dest_qp_num, guard.sq_psn)
        };

        let status = match FABRIC.lookup(dest) {
            None => WcStatus::RetryExceeded,
            Some(peer) => {
                let mut peer = peer.lock();
                if !matches!(peer.state, QpState::ReadyToReceive | QpState::ReadyToSend)
                    || peer.dest_qp_num != qp_num
                {
                    WcStatus::RetryExceeded
                } else if peer.rq_psn != sq_psn {
                    tracing::trace!(
                        "Soft fabric dropped packet: psn {:#x} expected {:#x}",
                        sq_psn,
                        peer.rq_psn
                    );
                    WcStatus::RetryExceeded
                } else {
                    peer.rq_psn = (peer.rq_psn + 1) & PSN_MASK;
                    match peer.recvs.pop_front() {
                        Some(recv) if len > recv.len => {
                            peer.land(recv, &data);
                            WcStatus::RemoteInvalidRequest
                        }
                        Some(recv) => {
                            peer.land(recv, &data);
                            WcStatus::Success
                        }
                        None => {
                            peer.backlog.push_back(data);
                            WcStatus::Success
                        }
                    }
                }
            }
        };

        let mut guard = qp.lock();
        if status == WcStatus::Success {
            guard.sq_psn = (guard.sq_psn + 1) & PSN_MASK;
        } else {
            guard.state = QpState::Error;
        }
        guard.complete(wr_id, status, WcOpcode::Send, len as u32);
        Ok(())
    }

    fn poll(&mut self, out: &mut Completions) -> Result<(), VerbsError> {
        let mut qp = self.qp()?.lock();
        while out.len() < POLL_BATCH {
            match qp.cq.pop_front() {
                Some(wc) => out.push(wc),
                None => break,
            }
        }
        Ok(())
    }

    fn destroy_queue_pair(&mut self) {
        if let Some(qp) = self.qp.take() {
            let mut guard = qp.lock();
            FABRIC.queue_pairs.remove(&guard.qp_num);
            guard.state = QpState::Reset;
            guard.recvs.clear();
            guard.backlog.clear();
            guard.cq.clear();
            guard.region = None;
            tracing::trace!("Destroyed soft queue pair {:#x}", guard.qp_num);
        }
    }
}

impl Drop for SoftContext {
    fn drop(&mut self) {
        self.destroy_queue_pair();
        self.deregister_region();
    }
}
