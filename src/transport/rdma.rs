//! RDMA transport
//!
//! Connection setup goes through a TCP side channel (see [`crate::handshake`]);
//! data moves with two-sided SEND/RECV on one RC queue pair per connection.
//! Every frame occupies exactly one slot of the registered region, and a
//! zero-length SEND tells the peer we are closing.

use super::{
    normalize_address, Connection, ConnectionState, Endpoint, Listener, RdmaConfig,
    RdmaEndpoint, Transport, TransportKind,
};
use crate::error::{Fault, Result, TransportError};
use crate::handshake::{self, generate_psn};
use crate::memory::{MemoryRegion, SlotLayout};
use crate::protocol::{Message, QueuePairInfo};
use crate::verbs::{
    self, Completions, DeviceContext, VerbsError, VerbsProvider, WcOpcode, WcStatus,
    WorkCompletion,
};
use async_trait::async_trait;
use crossbeam::utils::Backoff;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

/// Send work requests are tagged above every receive slot index.
const SEND_WR_BASE: u64 = 1 << 63;

/// Busy-spin rounds before yielding to the runtime.
const SPIN_ROUNDS: u32 = 64;
/// Yield rounds before falling back to short sleeps.
const YIELD_ROUNDS: u32 = 256;
const POLL_SLEEP: Duration = Duration::from_micros(50);

/// Upper bound on waiting for the close marker to leave.
const CLOSE_MARKER_TIMEOUT: Duration = Duration::from_millis(100);

static NEXT_CONN_REF: AtomicU64 = AtomicU64::new(1);

pub struct RdmaTransport {
    config: RdmaConfig,
    provider: Arc<dyn VerbsProvider>,
}

impl RdmaTransport {
    pub fn new(config: RdmaConfig) -> Result<Self> {
        let provider = verbs::provider(config.provider)
            .map_err(|e| TransportError::handshake("verbs provider", e))?;
        tracing::info!(
            "RDMA transport using {} verbs, slot {} bytes x {} receives",
            provider.name(),
            config.slot_size,
            config.recv_depth
        );
        Ok(Self { config, provider })
    }
}

#[async_trait]
impl Transport for RdmaTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Rdma
    }

    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>> {
        let addr = normalize_address(addr)?;
        let side_channel = TcpStream::connect(&addr)
            .await
            .map_err(|source| TransportError::Connect {
                addr: addr.clone(),
                source,
            })?;
        let mut conn = RdmaConnection::new(side_channel, self.config.clone(), Arc::clone(&self.provider))
            .map_err(|source| TransportError::Connect { addr, source })?;
        conn.handshake().await?;
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
        tracing::info!("RDMA side channel listening on {}", local_addr);
        Ok(Box::new(RdmaListener {
            listener,
            local_addr,
            config: self.config.clone(),
            provider: Arc::clone(&self.provider),
        }))
    }
}

struct RdmaListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: RdmaConfig,
    provider: Arc<dyn VerbsProvider>,
}

#[async_trait]
impl Listener for RdmaListener {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept(&mut self) -> Result<Box<dyn Connection>> {
        let (stream, peer) = self.listener.accept().await.map_err(TransportError::Accept)?;
        tracing::debug!("Side channel accepted from {}", peer);
        let conn = RdmaConnection::new(stream, self.config.clone(), Arc::clone(&self.provider))
            .map_err(TransportError::Accept)?;
        Ok(Box::new(conn))
    }
}

/// Device handles owned by one connection.
///
/// `release` tears down queue pair, region, then context, each at most once.
#[derive(Default)]
struct RdmaResources {
    ctx: Option<Box<dyn DeviceContext>>,
    region: Option<MemoryRegion>,
    qp_num: Option<u32>,
}

impl RdmaResources {
    fn release(&mut self) {
        if let Some(ctx) = self.ctx.as_mut() {
            if let Some(qp_num) = self.qp_num.take() {
                ctx.destroy_queue_pair();
                tracing::trace!("Released queue pair {:#x}", qp_num);
            }
            if let Some(mut region) = self.region.take() {
                region.deregister(ctx.as_mut());
            }
        }
        self.ctx.take();
    }
}

impl Drop for RdmaResources {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Clone, Copy)]
enum Wanted {
    Send(u64),
    Recv,
}

pub struct RdmaConnection {
    config: RdmaConfig,
    provider: Arc<dyn VerbsProvider>,
    side_channel: Option<TcpStream>,
    resources: RdmaResources,
    state: ConnectionState,
    endpoint: Endpoint,
    conn_ref: u64,
    max_message_len: usize,
    /// Receive completions seen while waiting for something else
    stashed: VecDeque<WorkCompletion>,
    scratch: Completions,
    next_send: u64,
    peer_closed: bool,
}

impl RdmaConnection {
    fn new(
        side_channel: TcpStream,
        config: RdmaConfig,
        provider: Arc<dyn VerbsProvider>,
    ) -> std::io::Result<Self> {
        side_channel.set_nodelay(true)?;
        let endpoint = Endpoint {
            local: side_channel.local_addr()?,
            remote: side_channel.peer_addr()?,
            rdma: None,
        };
        let max_message_len = SlotLayout::new(config.slot_size, config.recv_depth).slot_size;
        Ok(Self {
            config,
            provider,
            side_channel: Some(side_channel),
            resources: RdmaResources::default(),
            state: ConnectionState::Init,
            endpoint,
            conn_ref: NEXT_CONN_REF.fetch_add(1, Ordering::Relaxed),
            max_message_len,
            stashed: VecDeque::new(),
            scratch: Completions::new(),
            next_send: 0,
            peer_closed: false,
        })
    }

    /// Open the device, register slots, exchange records and walk the queue
    /// pair to RTS.
    async fn bring_up(&mut self) -> Result<()> {
        let ctx = self
            .provider
            .open(&self.config)
            .map_err(|e| TransportError::handshake("open device", e))?;
        let ctx = self.resources.ctx.insert(ctx);

        let layout = SlotLayout::new(self.config.slot_size, self.config.recv_depth);
        let region = MemoryRegion::register(ctx.as_mut(), layout)
            .map_err(|e| TransportError::handshake("register memory", e))?;
        let keys = *region.keys();
        self.resources.region = Some(region);

        let depth = layout.recv_depth as u32;
        let qp_num = ctx
            .create_queue_pair(depth, depth)
            .map_err(|e| TransportError::handshake("create queue pair", e))?;
        self.resources.qp_num = Some(qp_num);

        let psn = generate_psn();
        let port = ctx.port();
        self.endpoint.rdma = Some(RdmaEndpoint {
            device: ctx.device_name().to_string(),
            port: port.port_num,
            qp_num,
            psn,
            conn_ref: self.conn_ref,
        });

        ctx.modify_to_init()
            .map_err(|e| TransportError::handshake("modify to INIT", e))?;
        for slot in 0..layout.recv_depth {
            ctx.post_recv(slot as u64, layout.recv_offset(slot), layout.slot_size)
                .map_err(|e| TransportError::handshake("post receive", e))?;
        }

        let local = QueuePairInfo {
            qp_num,
            psn,
            lid: port.lid,
            gid: port.gid,
            lkey: keys.lkey,
            rkey: keys.rkey,
            addr: keys.addr,
            slot_size: layout.slot_size as u32,
            recv_depth: depth,
        };

        let side_channel = self
            .side_channel
            .as_mut()
            .ok_or_else(|| TransportError::Handshake("side channel already closed".to_string()))?;
        let timeout = self.config.completion_timeout;

        let peer = tokio::time::timeout(timeout, handshake::exchange(side_channel, &local))
            .await
            .map_err(|_| TransportError::handshake("side channel exchange", "timed out"))?
            .map_err(|e| TransportError::handshake("side channel exchange", e))?;

        ctx.modify_to_rtr(&peer)
            .map_err(|e| TransportError::handshake("modify to RTR", e))?;
        ctx.modify_to_rts(psn)
            .map_err(|e| TransportError::handshake("modify to RTS", e))?;

        tokio::time::timeout(timeout, handshake::ready_barrier(side_channel))
            .await
            .map_err(|_| TransportError::handshake("ready barrier", "timed out"))?
            .map_err(|e| TransportError::handshake("ready barrier", e))?;

        if let Some(mut side_channel) = self.side_channel.take() {
            if let Err(e) = side_channel.shutdown().await {
                tracing::debug!("Side channel shutdown for {} failed: {}", self.endpoint.remote, e);
            }
        }

        self.max_message_len = layout.slot_size.min(peer.slot_size as usize);
        tracing::info!(
            "RDMA connection #{} ready on {}: qp={:#x} -> peer qp={:#x}, max frame {} bytes",
            self.conn_ref,
            ctx.device_name(),
            qp_num,
            peer.qp_num,
            self.max_message_len
        );
        Ok(())
    }

    fn ready(&self) -> std::result::Result<(), Fault> {
        match self.state {
            ConnectionState::Ready => Ok(()),
            state => Err(Fault::NotReady(state)),
        }
    }

    fn post_send(&mut self, len: usize) -> std::result::Result<u64, Fault> {
        let ctx = self
            .resources
            .ctx
            .as_mut()
            .ok_or(VerbsError::Missing("device context"))?;
        let layout = SlotLayout::new(self.config.slot_size, self.config.recv_depth);
        let wr_id = SEND_WR_BASE | self.next_send;
        self.next_send = self.next_send.wrapping_add(1) & !SEND_WR_BASE;
        ctx.post_send(wr_id, layout.send_offset(), len)?;
        Ok(wr_id)
    }

    /// Adaptive poll for one completion, bounded by `timeout`.
    ///
    /// Receive completions that show up while waiting for a send are stashed
    /// in arrival order.
    async fn wait_for(
        &mut self,
        wanted: Wanted,
        timeout: Duration,
        wrap: fn(Fault) -> TransportError,
    ) -> Result<WorkCompletion> {
        if let Wanted::Recv = wanted {
            if let Some(wc) = self.stashed.pop_front() {
                return Ok(wc);
            }
        }

        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        let mut rounds: u32 = 0;

        loop {
            let ctx = self
                .resources
                .ctx
                .as_mut()
                .ok_or_else(|| wrap(Fault::Verbs(VerbsError::Missing("device context"))))?;
            self.scratch.clear();
            ctx.poll(&mut self.scratch).map_err(|e| wrap(Fault::Verbs(e)))?;

            let mut found = None;
            for wc in self.scratch.drain(..) {
                match (wc.opcode, wanted) {
                    (WcOpcode::Send, Wanted::Send(id)) if wc.wr_id == id => found = Some(wc),
                    (WcOpcode::Recv, Wanted::Recv) if found.is_none() => found = Some(wc),
                    (WcOpcode::Recv, _) => self.stashed.push_back(wc),
                    (WcOpcode::Send, _) => {
                        if wc.status != WcStatus::Success {
                            tracing::debug!("Stale send completion {:#x}: {}", wc.wr_id, wc.status);
                        }
                    }
                }
            }
            if let Some(wc) = found {
                return Ok(wc);
            }

            if Instant::now() >= deadline {
                return Err(TransportError::Timeout(timeout));
            }
            rounds += 1;
            if rounds <= SPIN_ROUNDS {
                backoff.spin();
            } else if rounds <= SPIN_ROUNDS + YIELD_ROUNDS {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(POLL_SLEEP).await;
            }
        }
    }

    /// An unconfirmed SEND may still be reading the send slot, so the slot
    /// must not be restaged. The connection stops accepting traffic and only
    /// `close` remains.
    fn abandon_send(&mut self, err: TransportError) -> TransportError {
        if err.is_timeout() && self.state == ConnectionState::Ready {
            tracing::warn!(
                "RDMA connection #{}: send not confirmed within {:?}, connection must be closed",
                self.conn_ref,
                self.config.completion_timeout
            );
            self.state = ConnectionState::Closing;
        }
        err
    }

    /// Best-effort zero-length SEND so the peer sees end of stream.
    async fn send_close_marker(&mut self) {
        let wr_id = match self.post_send(0) {
            Ok(wr_id) => wr_id,
            Err(e) => {
                tracing::debug!("Close marker not posted on #{}: {}", self.conn_ref, e);
                return;
            }
        };
        let timeout = CLOSE_MARKER_TIMEOUT.min(self.config.completion_timeout);
        match self.wait_for(Wanted::Send(wr_id), timeout, TransportError::Send).await {
            Ok(wc) if wc.status == WcStatus::Success => {}
            Ok(wc) => tracing::debug!("Close marker on #{} completed with {}", self.conn_ref, wc.status),
            Err(e) => tracing::debug!("Close marker on #{} not confirmed: {}", self.conn_ref, e),
        }
    }
}

#[async_trait]
impl Connection for RdmaConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::Rdma
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn max_message_len(&self) -> usize {
        self.max_message_len
    }

    async fn handshake(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Ready => return Ok(()),
            ConnectionState::Init => {}
            state => return Err(TransportError::handshake("rdma", Fault::NotReady(state))),
        }

        self.state = ConnectionState::Handshaking;
        match self.bring_up().await {
            Ok(()) => {
                self.state = ConnectionState::Ready;
                Ok(())
            }
            Err(e) => {
                tracing::warn!("RDMA handshake with {} failed: {}", self.endpoint.remote, e);
                self.close().await;
                Err(e)
            }
        }
    }

    async fn send(&mut self, msg: &Message) -> Result<()> {
        self.ready().map_err(TransportError::Send)?;
        msg.validate(self.max_message_len).map_err(TransportError::Send)?;

        let len = {
            let RdmaResources { ctx, region, .. } = &mut self.resources;
            match (ctx.as_mut(), region.as_mut()) {
                (Some(ctx), Some(region)) => region
                    .stage_send(ctx.as_mut(), msg)
                    .map_err(TransportError::Send)?,
                _ => {
                    return Err(TransportError::Send(Fault::Verbs(VerbsError::Missing(
                        "memory region",
                    ))))
                }
            }
        };

        let wr_id = self.post_send(len).map_err(TransportError::Send)?;
        let timeout = self.config.completion_timeout;
        let wc = match self.wait_for(Wanted::Send(wr_id), timeout, TransportError::Send).await {
            Ok(wc) => wc,
            Err(e) => return Err(self.abandon_send(e)),
        };
        if wc.status != WcStatus::Success {
            return Err(TransportError::Send(Fault::Completion(wc.status)));
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<Message>> {
        if self.peer_closed {
            return Ok(None);
        }
        self.ready().map_err(TransportError::Receive)?;

        let timeout = self.config.completion_timeout;
        let wc = self.wait_for(Wanted::Recv, timeout, TransportError::Receive).await?;
        if wc.status != WcStatus::Success {
            return Err(TransportError::Receive(Fault::Completion(wc.status)));
        }
        if wc.byte_len == 0 {
            tracing::debug!("RDMA connection #{}: peer sent close marker", self.conn_ref);
            self.peer_closed = true;
            return Ok(None);
        }

        let slot = wc.wr_id as usize;
        let RdmaResources { ctx, region, .. } = &mut self.resources;
        let (Some(ctx), Some(region)) = (ctx.as_mut(), region.as_mut()) else {
            return Err(TransportError::Receive(Fault::Verbs(VerbsError::Missing(
                "memory region",
            ))));
        };
        let msg = region
            .load_recv(ctx.as_ref(), slot, wc.byte_len as usize)
            .map_err(TransportError::Receive)?;

        let layout = region.layout();
        ctx.post_recv(wc.wr_id, layout.recv_offset(slot), layout.slot_size)
            .map_err(|e| TransportError::Receive(Fault::Verbs(e)))?;
        Ok(Some(msg))
    }

    async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if self.state == ConnectionState::Ready && !self.peer_closed {
            self.send_close_marker().await;
        }
        self.state = ConnectionState::Closing;

        if let Some(mut side_channel) = self.side_channel.take() {
            if let Err(e) = side_channel.shutdown().await {
                tracing::debug!("Side channel shutdown for {} failed: {}", self.endpoint.remote, e);
            }
        }
        self.resources.release();
        self.stashed.clear();
        self.state = ConnectionState::Closed;
        tracing::debug!("RDMA connection #{} closed", self.conn_ref);
    }
}

impl Drop for RdmaConnection {
    fn drop(&mut self) {
        if self.state != ConnectionState::Closed {
            tracing::debug!(
                "RDMA connection #{} dropped in {}, releasing resources",
                self.conn_ref,
                self.state
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(timeout_ms: u64) -> RdmaConfig {
        RdmaConfig {
            completion_timeout: Duration::from_millis(timeout_ms),
            slot_size: 1024,
            recv_depth: 4,
            ..Default::default()
        }
    }

    async fn pair(config: RdmaConfig) -> (Box<dyn Connection>, Box<dyn Connection>) {
        let transport = RdmaTransport::new(config).unwrap();
        let mut listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().to_string();

        let server = async {
            let mut conn = listener.accept().await?;
            conn.handshake().await?;
            Ok::<_, TransportError>(conn)
        };
        let (client, server) = tokio::join!(transport.connect(&addr), server);
        (client.unwrap(), server.unwrap())
    }

    #[tokio::test]
    async fn test_soft_echo() {
        let (mut client, mut server) = pair(config(2000)).await;
        assert_eq!(client.state(), ConnectionState::Ready);
        assert_eq!(server.state(), ConnectionState::Ready);
        assert!(client.endpoint().rdma.is_some());

        let msg = Message::request(&b"abc"[..], &b"0123456789"[..]);
        client.send(&msg).await.unwrap();
        let got = server.receive().await.unwrap().unwrap();
        assert_eq!(got, msg);
        server.send(&Message::response_to(&got)).await.unwrap();
        assert_eq!(client.receive().await.unwrap().unwrap().key(), msg.key());
    }

    #[tokio::test]
    async fn test_slots_are_reposted() {
        let (mut client, mut server) = pair(config(2000)).await;
        // More round trips than receive slots.
        for i in 0..20u32 {
            let msg = Message::request(i.to_be_bytes().to_vec(), vec![b'x'; i as usize]);
            client.send(&msg).await.unwrap();
            assert_eq!(server.receive().await.unwrap().unwrap(), msg);
        }
    }

    #[tokio::test]
    async fn test_receive_times_out() {
        let (mut client, _server) = pair(config(50)).await;
        let started = Instant::now();
        let err = client.receive().await.unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(50));
        // Still usable after a timeout.
        assert_eq!(client.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_close_marker_is_end_of_stream() {
        let (mut client, mut server) = pair(config(2000)).await;
        client.close().await;
        client.close().await;
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(server.receive().await.unwrap().is_none());
        assert!(server.receive().await.unwrap().is_none());
        server.close().await;
    }

    #[tokio::test]
    async fn test_frame_larger_than_slot_rejected() {
        let (mut client, _server) = pair(config(2000)).await;
        let msg = Message::request(vec![0u8; 8], vec![0u8; 2048]);
        let err = client.send(&msg).await.unwrap_err();
        assert!(matches!(err, TransportError::Send(Fault::TooLarge { .. })));
    }

    #[tokio::test]
    async fn test_handshake_fails_when_peer_drops_side_channel() {
        let transport = RdmaTransport::new(config(500)).unwrap();
        let raw = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = raw.local_addr().unwrap().to_string();
        let peer = tokio::spawn(async move {
            let (stream, _) = raw.accept().await.unwrap();
            drop(stream);
        });
        let err = transport.connect(&addr).await.err().unwrap();
        assert!(matches!(err, TransportError::Handshake(_)));
        peer.await.unwrap();
    }

    async fn concrete_pair(config: RdmaConfig) -> (RdmaConnection, RdmaConnection) {
        let provider = verbs::provider(verbs::ProviderKind::Soft).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (a, b) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut client = RdmaConnection::new(a.unwrap(), config.clone(), Arc::clone(&provider)).unwrap();
        let mut server = RdmaConnection::new(b.unwrap().0, config, provider).unwrap();
        let (x, y) = tokio::join!(client.handshake(), server.handshake());
        x.unwrap();
        y.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_unconfirmed_send_retires_connection() {
        let (mut client, mut server) = concrete_pair(config(2000)).await;
        let err = client.abandon_send(TransportError::Timeout(Duration::from_millis(5)));
        assert!(err.is_timeout());
        assert_eq!(client.state(), ConnectionState::Closing);

        let msg = Message::request(&b"k"[..], &b"v"[..]);
        assert!(matches!(
            client.send(&msg).await,
            Err(TransportError::Send(Fault::NotReady(ConnectionState::Closing)))
        ));
        assert!(client.receive().await.is_err());

        client.close().await;
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(client.resources.ctx.is_none());
        server.close().await;
    }

    #[tokio::test]
    async fn test_failed_send_status_keeps_state() {
        let (mut client, _server) = concrete_pair(config(2000)).await;
        let err = client.abandon_send(TransportError::Send(Fault::Completion(WcStatus::RetryExceeded)));
        assert!(!err.is_timeout());
        assert_eq!(client.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_close_before_handshake() {
        let transport = RdmaTransport::new(config(500)).unwrap();
        let mut listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let _raw = TcpStream::connect(addr).await.unwrap();
        let mut conn = listener.accept().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Init);
        assert!(conn.endpoint().rdma.is_none());

        conn.close().await;
        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.handshake().await.is_err());
    }

    #[test]
    fn test_release_is_ordered_and_idempotent() {
        let provider = verbs::provider(verbs::ProviderKind::Soft).unwrap();
        let mut ctx = provider.open(&RdmaConfig::default()).unwrap();
        let region = MemoryRegion::register(ctx.as_mut(), SlotLayout::new(64, 1)).unwrap();
        let qp_num = ctx.create_queue_pair(1, 1).unwrap();

        let mut resources = RdmaResources {
            ctx: Some(ctx),
            region: Some(region),
            qp_num: Some(qp_num),
        };
        resources.release();
        assert!(resources.ctx.is_none());
        assert!(resources.region.is_none());
        assert!(resources.qp_num.is_none());
        resources.release();
    }
}
