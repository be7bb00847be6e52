//! Echo server
//!
//! Accepts connections until shut down and serves each one in its own task.
//! A failing connection only ends its own task; the listener keeps going.

use crate::error::{Result, TransportError};
use crate::session::{Session, SessionStats};
use crate::transport::{
    build_transport, Connection, Listener, Transport, TransportConfig, TransportKind,
    DEFAULT_PORT,
};
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Sessions with no request for this long are closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Data port (TCP) or side-channel port (RDMA)
    pub listen_addr: String,
    pub transport: TransportConfig,
    /// Close sessions that received nothing for this long
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: format!("0.0.0.0:{}", DEFAULT_PORT),
            transport: TransportConfig::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Aggregate counters across all sessions
#[derive(Debug, Default)]
pub struct ServerStats {
    accepted: AtomicU64,
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ServerStatsSnapshot {
    pub accepted: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl ServerStats {
    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Registry entry for a live session
#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    pub id: u64,
    pub remote: SocketAddr,
    pub kind: TransportKind,
    #[serde(skip)]
    pub started: Instant,
}

/// Shared view of a running server.
#[derive(Clone)]
pub struct ServerHandle {
    stats: Arc<ServerStats>,
    sessions: Arc<DashMap<u64, SessionInfo>>,
}

impl ServerHandle {
    pub fn stats(&self) -> ServerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }
}

pub struct Server {
    config: ServerConfig,
    transport: Arc<dyn Transport>,
    listener: Box<dyn Listener>,
    handle: ServerHandle,
    next_id: AtomicU64,
}

impl Server {
    /// Build the transport and bind the listener.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let transport = build_transport(&config.transport)?;
        let listener = transport.listen(&config.listen_addr).await?;
        tracing::info!(
            "Echo server listening on {} ({})",
            listener.local_addr(),
            transport.kind()
        );
        Ok(Self {
            config,
            transport,
            listener,
            handle: ServerHandle {
                stats: Arc::new(ServerStats::default()),
                sessions: Arc::new(DashMap::new()),
            },
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Serve until stopped from outside.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then stop accepting and end all
    /// session tasks.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Session task panicked: {}", e);
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => {
                        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                        self.handle.stats.accepted.fetch_add(1, Ordering::Relaxed);
                        let handle = self.handle.clone();
                        let idle_timeout = self.config.idle_timeout;
                        tasks.spawn(serve_connection(id, conn, idle_timeout, handle));
                    }
                    Err(e) => {
                        tracing::warn!("Accept failed, continuing: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        tracing::info!(
            "Shutting down {} server: {} sessions still active",
            self.transport.kind(),
            tasks.len()
        );
        tasks.shutdown().await;
        self.handle.sessions.clear();
        Ok(())
    }
}

async fn serve_connection(
    id: u64,
    conn: Box<dyn Connection>,
    idle_timeout: Duration,
    handle: ServerHandle,
) {
    let remote = conn.endpoint().remote;
    let kind = conn.kind();

    let mut session = match Session::accept(conn).await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!("Session {} with {}: handshake failed: {}", id, remote, e);
            handle.stats.failed.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    handle.sessions.insert(
        id,
        SessionInfo {
            id,
            remote,
            kind,
            started: Instant::now(),
        },
    );
    handle.stats.active.fetch_add(1, Ordering::Relaxed);
    tracing::info!("Session {} ready: {}", id, session.endpoint());

    let outcome = session.serve(idle_timeout).await;
    session.close().await;

    handle.sessions.remove(&id);
    handle.stats.active.fetch_sub(1, Ordering::Relaxed);
    log_session_end(id, &outcome, session.stats(), session.elapsed());
    match outcome {
        Ok(()) => handle.stats.completed.fetch_add(1, Ordering::Relaxed),
        Err(_) => handle.stats.failed.fetch_add(1, Ordering::Relaxed),
    };
}

fn log_session_end(id: u64, outcome: &Result<()>, stats: &SessionStats, elapsed: Duration) {
    match outcome {
        Ok(()) => tracing::info!(
            "Session {} closed: {} requests, {} bytes in, {} bytes out, {:.2}s",
            id,
            stats.responses,
            stats.bytes_received,
            stats.bytes_sent,
            elapsed.as_secs_f64()
        ),
        Err(TransportError::Timeout(_)) => {
            tracing::info!("Session {} timed out after {} requests", id, stats.responses)
        }
        Err(e) => tracing::warn!(
            "Session {} failed after {} requests: {}",
            id,
            stats.responses,
            e
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use crate::session::Role;

    fn config() -> ServerConfig {
        ServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            transport: TransportConfig::tcp(),
            idle_timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = Server::bind(config()).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.handle().stats(), ServerStatsSnapshot::default());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let first = Server::bind(config()).await.unwrap();
        let taken = ServerConfig {
            listen_addr: first.local_addr().to_string(),
            ..config()
        };
        let err = Server::bind(taken).await.err().unwrap();
        assert!(matches!(err, TransportError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_failed_connection_does_not_stop_server() {
        let server = Server::bind(config()).await.unwrap();
        let addr = server.local_addr();
        let handle = server.handle();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let running = tokio::spawn(server.run_until(async {
            let _ = stop_rx.await;
        }));

        // Garbage opcode kills this connection only.
        {
            use tokio::io::AsyncWriteExt;
            let mut raw = tokio::net::TcpStream::connect(addr).await.unwrap();
            raw.write_all(&[9u8; 16]).await.unwrap();
        }

        let transport = build_transport(&TransportConfig::tcp()).unwrap();
        let conn = transport.connect(&addr.to_string()).await.unwrap();
        let mut session = Session::new(conn, Role::Client);
        let reply = session
            .request(&Message::request(&b"key"[..], &b"still alive"[..]))
            .await
            .unwrap();
        assert_eq!(&reply.payload()[..], b"still alive");
        assert!(!handle.active_sessions().is_empty());
        session.close().await;

        for _ in 0..100 {
            let stats = handle.stats();
            if stats.active == 0 && stats.completed + stats.failed == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = handle.stats();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);

        stop_tx.send(()).unwrap();
        running.await.unwrap().unwrap();
    }
}
