//! Integration tests for wisp over TCP and soft RDMA

use std::time::Duration;
use wisp::error::{ConfigError, TransportError, EXIT_MISSING_ADDRESS};
use wisp::server::ServerHandle;
use wisp::transport::{ConnectionState, RdmaConfig, TransportConfig};
use wisp::{Client, ClientConfig, Message, PerfConfig, Server, ServerConfig};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

fn soft_rdma() -> TransportConfig {
    TransportConfig::rdma(RdmaConfig {
        completion_timeout: Duration::from_secs(2),
        slot_size: 4096,
        recv_depth: 16,
        ..Default::default()
    })
}

/// Start a server on an ephemeral port and return its address.
async fn start_server(
    transport: TransportConfig,
) -> (String, ServerHandle, tokio::task::JoinHandle<()>) {
    start_server_with_idle(transport, Duration::from_secs(30)).await
}

async fn start_server_with_idle(
    transport: TransportConfig,
    idle_timeout: Duration,
) -> (String, ServerHandle, tokio::task::JoinHandle<()>) {
    let server = Server::bind(ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        transport,
        idle_timeout,
    })
    .await
    .unwrap();
    let addr = server.local_addr().to_string();
    let handle = server.handle();
    let task = tokio::spawn(async move {
        server.run().await.unwrap();
    });
    (addr, handle, task)
}

async fn connect(addr: &str, transport: TransportConfig) -> Client {
    Client::connect(&ClientConfig {
        server_addr: addr.to_string(),
        transport,
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_tcp_perf_key3_payload10() {
    init_tracing();
    let (addr, _handle, server) = start_server(TransportConfig::tcp()).await;
    let mut client = connect(&addr, TransportConfig::tcp()).await;

    let config = PerfConfig {
        key_size: 3,
        payload_size: 10,
        iterations: 100,
        warmup: 10,
    };
    let result = client.run_perf(&config).await.unwrap();
    assert_eq!(result.operation_count, 100);
    assert_eq!(result.samples.len(), 100);
    assert!(result.samples.iter().all(|s| *s >= Duration::ZERO));
    assert!(result.throughput() > 0.0);
    assert!(result.p50() <= result.p99());
    assert!(result.p99() <= result.max());

    // Same parameters again: same count.
    let again = client.run_perf(&config).await.unwrap();
    assert_eq!(again.operation_count, 100);
    assert!(again.throughput() > 0.0);

    client.close().await;
    server.abort();
}

#[tokio::test]
async fn test_two_clients_are_isolated() {
    init_tracing();
    let (addr, handle, server) = start_server(TransportConfig::tcp()).await;

    let mut tasks = Vec::new();
    for id in 0..2u8 {
        let addr = addr.clone();
        tasks.push(tokio::spawn(async move {
            let mut client = connect(&addr, TransportConfig::tcp()).await;
            for i in 0..200u32 {
                let key = format!("client{}-{}", id, i);
                let payload = vec![b'A' + id; 64 + (i as usize % 32)];
                let reply = client.request(key.as_bytes(), &payload).await.unwrap();
                assert_eq!(&reply.key()[..], key.as_bytes());
                assert_eq!(&reply.payload()[..], &payload[..]);
            }
            client.close().await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for _ in 0..100 {
        if handle.stats().completed == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stats = handle.stats();
    assert_eq!(stats.accepted, 2);
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.failed, 0);
    server.abort();
}

#[tokio::test]
async fn test_queued_sends_keep_order() {
    init_tracing();
    for transport in [TransportConfig::tcp(), soft_rdma()] {
        let (addr, _handle, server) = start_server(transport.clone()).await;
        let mut client = connect(&addr, transport).await;

        let session = client.session_mut();
        let requests: Vec<_> = (0..8u32)
            .map(|i| Message::request(i.to_be_bytes().to_vec(), vec![i as u8; 100]))
            .collect();
        for msg in &requests {
            session.send(msg).await.unwrap();
        }
        for msg in &requests {
            let reply = session.receive_response().await.unwrap();
            assert_eq!(reply.key(), msg.key());
        }

        client.close().await;
        server.abort();
    }
}

#[tokio::test]
async fn test_soft_rdma_echo_and_perf() {
    init_tracing();
    let (addr, handle, server) = start_server(soft_rdma()).await;
    let mut client = connect(&addr, soft_rdma()).await;

    let endpoint = client.session().endpoint().clone();
    let rdma = endpoint.rdma.expect("rdma endpoint");
    assert_eq!(rdma.device, "soft0");

    let reply = client.request(b"abc", b"0123456789").await.unwrap();
    assert_eq!(&reply.payload()[..], b"0123456789");

    let result = client
        .run_perf(&PerfConfig {
            key_size: 16,
            payload_size: 1024,
            iterations: 200,
            warmup: 20,
        })
        .await
        .unwrap();
    assert_eq!(result.operation_count, 200);
    assert!(result.throughput() > 0.0);

    client.close().await;
    assert_eq!(client.session().state(), ConnectionState::Closed);

    for _ in 0..100 {
        if handle.stats().completed == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handle.stats().completed, 1);
    server.abort();
}

#[tokio::test]
async fn test_soft_rdma_perf_frame_over_slot_is_config_error() {
    init_tracing();
    let (addr, _handle, server) = start_server(soft_rdma()).await;
    let mut client = connect(&addr, soft_rdma()).await;

    let err = client
        .run_perf(&PerfConfig::new(16, 8192, 10))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::Config(ConfigError::FrameTooLarge { .. })
    ));

    // Session is untouched.
    client.request(b"k", b"v").await.unwrap();
    client.close().await;
    server.abort();
}

#[tokio::test]
async fn test_empty_server_address_rejected() {
    init_tracing();
    for transport in [TransportConfig::tcp(), soft_rdma()] {
        let err = Client::connect(&ClientConfig {
            server_addr: "".to_string(),
            transport,
        })
        .await
        .err()
        .unwrap();
        assert!(matches!(
            err,
            TransportError::Config(ConfigError::MissingServerAddress)
        ));
        assert_eq!(err.exit_code(), EXIT_MISSING_ADDRESS);
    }
}

#[tokio::test]
async fn test_close_twice_is_harmless() {
    init_tracing();
    let (addr, _handle, server) = start_server(TransportConfig::tcp()).await;
    let mut client = connect(&addr, TransportConfig::tcp()).await;
    client.close().await;
    client.close().await;
    assert_eq!(client.session().state(), ConnectionState::Closed);
    assert!(client.request(b"k", b"v").await.is_err());
    server.abort();
}

#[tokio::test]
async fn test_plain_client_lines() {
    init_tracing();
    let (addr, _handle, server) = start_server(TransportConfig::tcp()).await;
    let mut client = connect(&addr, TransportConfig::tcp()).await;

    let input: &[u8] = b"alpha one two\n\nbeta\n  gamma   spaced  \n";
    let mut output = Vec::new();
    let summary = client.run_interactive(input, &mut output).await.unwrap();

    assert_eq!(summary.requests, 3);
    assert_eq!(
        String::from_utf8(output).unwrap(),
        "alpha one two\nbeta \ngamma spaced\n"
    );
    client.close().await;
    server.abort();
}

#[tokio::test]
async fn test_vanished_rdma_peer_is_reaped() {
    init_tracing();
    let transport = TransportConfig::rdma(RdmaConfig {
        completion_timeout: Duration::from_millis(50),
        slot_size: 4096,
        recv_depth: 16,
        ..Default::default()
    });
    let (addr, handle, server) =
        start_server_with_idle(transport.clone(), Duration::from_millis(300)).await;

    let mut client = connect(&addr, transport).await;
    client.request(b"k", b"v").await.unwrap();
    // Gone without a close marker.
    drop(client);

    for _ in 0..300 {
        let stats = handle.stats();
        if stats.active == 0 && stats.completed + stats.failed == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stats = handle.stats();
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.completed + stats.failed, 1);
    assert!(handle.active_sessions().is_empty());
    server.abort();
}
