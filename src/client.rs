//! Client side: one session to a server
//!
//! Plain mode reads `KEY [PAYLOAD]` lines and prints each echoed response.
//! Perf mode hands the session to [`PerfHarness`].

use crate::error::{Fault, Result, TransportError};
use crate::perf::{PerfConfig, PerfHarness, PerfResult};
use crate::protocol::Message;
use crate::session::{Role, Session};
use crate::transport::{build_transport, normalize_address, TransportConfig};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Client configuration
#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    /// Server address; the default port is used when it has none
    pub server_addr: String,
    pub transport: TransportConfig,
}

/// Totals of a plain-mode run
#[derive(Clone, Debug, Serialize)]
pub struct PlainSummary {
    pub requests: u64,
    pub elapsed: Duration,
}

pub struct Client {
    session: Session,
}

impl Client {
    /// Connect to the configured server.
    ///
    /// The address is checked before any transport resource is created.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let addr = normalize_address(&config.server_addr)?;
        let transport = build_transport(&config.transport)?;

        tracing::info!("Connecting to server at {} over {}", addr, transport.kind());
        let conn = transport.connect(&addr).await?;
        tracing::info!("Connected: {}", conn.endpoint());

        Ok(Self {
            session: Session::new(conn, Role::Client),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// One request/response round trip.
    pub async fn request(&mut self, key: &[u8], payload: &[u8]) -> Result<Message> {
        let msg = Message::request(key.to_vec(), payload.to_vec());
        let reply = self.session.request(&msg).await?;
        if reply.key() != msg.key() {
            return Err(TransportError::Receive(Fault::Malformed(
                "response key does not match request".to_string(),
            )));
        }
        Ok(reply)
    }

    /// Plain mode: one request per input line until end of input.
    pub async fn run_interactive<R, W>(&mut self, input: R, mut output: W) -> Result<PlainSummary>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let start = Instant::now();
        let mut requests = 0u64;
        let mut lines = input.lines();

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| TransportError::Send(Fault::Io(e)))?
        {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, payload) = match line.split_once(char::is_whitespace) {
                Some((key, payload)) => (key, payload.trim_start()),
                None => (line, ""),
            };

            let reply = self.request(key.as_bytes(), payload.as_bytes()).await?;
            requests += 1;

            let text = format!(
                "{} {}\n",
                String::from_utf8_lossy(reply.key()),
                String::from_utf8_lossy(reply.payload())
            );
            output
                .write_all(text.as_bytes())
                .await
                .map_err(|e| TransportError::Receive(Fault::Io(e)))?;
        }
        output
            .flush()
            .await
            .map_err(|e| TransportError::Receive(Fault::Io(e)))?;

        Ok(PlainSummary {
            requests,
            elapsed: start.elapsed(),
        })
    }

    pub async fn run_perf(&mut self, config: &PerfConfig) -> Result<PerfResult> {
        PerfHarness::run(&mut self.session, config).await
    }

    pub async fn close(&mut self) {
        self.session.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;

    #[tokio::test]
    async fn test_empty_address_rejected() {
        let config = ClientConfig {
            server_addr: String::new(),
            transport: TransportConfig::tcp(),
        };
        let err = Client::connect(&config).await.err().unwrap();
        assert!(matches!(
            err,
            TransportError::Config(ConfigError::MissingServerAddress)
        ));
        assert_eq!(err.exit_code(), crate::error::EXIT_MISSING_ADDRESS);
    }
}
