//! Request/response sessions over one connection
//!
//! A [`Session`] owns its connection. The client side issues one request and
//! waits for the matching response; the server side echoes every request
//! back until the peer closes.

use crate::error::{Fault, Result, TransportError};
use crate::protocol::{Message, Opcode};
use crate::transport::{Connection, ConnectionState, Endpoint, TransportKind};
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Role {
    Client,
    Server,
}

/// Per-session counters
#[derive(Clone, Debug, Default, Serialize)]
pub struct SessionStats {
    pub requests: u64,
    pub responses: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

pub struct Session {
    conn: Box<dyn Connection>,
    role: Role,
    stats: SessionStats,
    started: Instant,
}

impl Session {
    pub fn new(conn: Box<dyn Connection>, role: Role) -> Self {
        Self {
            conn,
            role,
            stats: SessionStats::default(),
            started: Instant::now(),
        }
    }

    /// Server side: finish the handshake of an accepted connection.
    pub async fn accept(mut conn: Box<dyn Connection>) -> Result<Self> {
        if let Err(e) = conn.handshake().await {
            conn.close().await;
            return Err(e);
        }
        Ok(Self::new(conn, Role::Server))
    }

    pub fn kind(&self) -> TransportKind {
        self.conn.kind()
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.conn.endpoint()
    }

    pub fn max_message_len(&self) -> usize {
        self.conn.max_message_len()
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Send without waiting for the response.
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        self.conn.send(msg).await?;
        match msg.opcode() {
            Opcode::Request => self.stats.requests += 1,
            Opcode::Response => self.stats.responses += 1,
        }
        self.stats.bytes_sent += msg.encoded_len() as u64;
        Ok(())
    }

    pub async fn receive(&mut self) -> Result<Option<Message>> {
        let msg = self.conn.receive().await?;
        if let Some(msg) = &msg {
            self.stats.bytes_received += msg.encoded_len() as u64;
        }
        Ok(msg)
    }

    /// Receive the response to an earlier request.
    pub async fn receive_response(&mut self) -> Result<Message> {
        match self.receive().await? {
            Some(msg) if msg.opcode() == Opcode::Response => Ok(msg),
            Some(_) => Err(TransportError::Receive(Fault::Malformed(
                "expected a response, got a request".to_string(),
            ))),
            None => Err(TransportError::Receive(Fault::PeerClosed)),
        }
    }

    /// One round trip: send `msg`, wait for its response.
    pub async fn request(&mut self, msg: &Message) -> Result<Message> {
        self.send(msg).await?;
        self.receive_response().await
    }

    /// Echo requests until the peer closes.
    ///
    /// Completion timeouts from the transport count as idle time. The session
    /// ends with [`TransportError::Timeout`] once nothing arrived for
    /// `idle_timeout`, so a peer that vanished without closing is reaped.
    pub async fn serve(&mut self, idle_timeout: Duration) -> Result<()> {
        let mut last_activity = Instant::now();
        loop {
            let remaining = idle_timeout.saturating_sub(last_activity.elapsed());
            let msg = match tokio::time::timeout(remaining, self.receive()).await {
                Ok(Ok(Some(msg))) => msg,
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(e)) if e.is_timeout() && last_activity.elapsed() < idle_timeout => continue,
                Ok(Err(e)) if !e.is_timeout() => return Err(e),
                _ => {
                    tracing::info!(
                        "Closing idle session with {} after {:?}",
                        self.endpoint().remote,
                        last_activity.elapsed()
                    );
                    return Err(TransportError::Timeout(idle_timeout));
                }
            };
            last_activity = Instant::now();

            if msg.opcode() != Opcode::Request {
                return Err(TransportError::Receive(Fault::Malformed(
                    "server received a response".to_string(),
                )));
            }
            tracing::trace!(
                "Echo key={} bytes payload={} bytes",
                msg.key().len(),
                msg.payload().len()
            );
            self.send(&Message::response_to(&msg)).await?;
        }
    }

    pub async fn close(&mut self) {
        if self.conn.state() == ConnectionState::Closed {
            return;
        }
        self.conn.close().await;
        tracing::debug!(
            "{:?} session with {} closed: {} requests, {} responses",
            self.role,
            self.endpoint().remote,
            self.stats.requests,
            self.stats.responses
        );
    }
}
