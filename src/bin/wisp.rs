//! wisp binary: echo server, plain client or perf client over TCP or RDMA
//!
//! Run with: cargo run --bin wisp -- --help

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::BufReader;
use wisp::error::{ConfigError, TransportError};
use wisp::perf::{self, PerfConfig, DEFAULT_ITERATIONS, DEFAULT_WARMUP};
use wisp::transport::{normalize_address_with_port, RdmaConfig, TransportConfig, DEFAULT_PORT};
use wisp::server::DEFAULT_IDLE_TIMEOUT;
use wisp::verbs::ProviderKind;
use wisp::{Client, ClientConfig, Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "wisp", version)]
#[command(about = "Request/response messaging and latency benchmark over TCP or RDMA")]
#[command(group(ArgGroup::new("role").required(true).args(["server", "client", "client_perf"])))]
struct Args {
    /// Run as echo server
    #[arg(short = 's', long)]
    server: bool,

    /// Run as plain client against ADDR, reading `KEY [PAYLOAD]` lines from stdin
    #[arg(short = 'c', long, value_name = "ADDR", num_args = 0..=1, default_missing_value = "")]
    client: Option<String>,

    /// Run as perf client against ADDR
    #[arg(
        short = 'p',
        long = "client-perf",
        value_name = "ADDR",
        num_args = 0..=1,
        default_missing_value = "",
        requires_all = ["key_size", "payload_size"]
    )]
    client_perf: Option<String>,

    /// Key size in bytes (perf mode)
    #[arg(long = "key_size", value_name = "N", allow_hyphen_values = true)]
    key_size: Option<String>,

    /// Payload size in bytes (perf mode)
    #[arg(long = "payload_size", value_name = "N", allow_hyphen_values = true)]
    payload_size: Option<String>,

    /// Use TCP instead of RDMA
    #[arg(short = 't', long)]
    tcp: bool,

    /// Data port (TCP) or side-channel port (RDMA)
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Measured round trips in perf mode
    #[arg(long, default_value_t = DEFAULT_ITERATIONS)]
    iterations: usize,

    /// Discarded warm-up round trips in perf mode
    #[arg(long, default_value_t = DEFAULT_WARMUP)]
    warmup: usize,

    /// Use the in-process software verbs provider (server and client in one process only)
    #[arg(long, default_value_t = false)]
    soft: bool,

    /// RDMA device name (first device when unset)
    #[arg(long)]
    device: Option<String>,

    /// RDMA completion timeout in milliseconds
    #[arg(long = "timeout-ms", default_value = "5000")]
    timeout_ms: u64,

    /// Close server sessions idle for this many seconds
    #[arg(long = "idle-timeout-secs", default_value_t = DEFAULT_IDLE_TIMEOUT.as_secs())]
    idle_timeout_secs: u64,

    /// Print the perf report as JSON
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Number of worker threads
    #[arg(long, default_value = "4")]
    worker_threads: usize,
}

impl Args {
    fn transport_config(&self) -> TransportConfig {
        if self.tcp {
            return TransportConfig::tcp();
        }
        TransportConfig::rdma(RdmaConfig {
            provider: if self.soft {
                ProviderKind::Soft
            } else {
                ProviderKind::Verbs
            },
            device: self.device.clone(),
            completion_timeout: Duration::from_millis(self.timeout_ms),
            ..Default::default()
        })
    }

    fn transport_name(&self) -> &'static str {
        match (self.tcp, self.soft) {
            (true, _) => "TCP",
            (false, true) => "RDMA (soft verbs, same process only)",
            (false, false) => "RDMA",
        }
    }

    /// Sizes and counts for perf mode, checked before any connection exists.
    fn perf_config(&self) -> Result<PerfConfig, ConfigError> {
        let key_size = perf::parse_size("key_size", self.key_size.as_deref().unwrap_or(""))?;
        let payload_size =
            perf::parse_size("payload_size", self.payload_size.as_deref().unwrap_or(""))?;
        let config = PerfConfig {
            key_size,
            payload_size,
            iterations: self.iterations,
            warmup: self.warmup,
        };
        config.validate(usize::MAX)?;
        Ok(config)
    }
}

fn print_banner(args: &Args) {
    println!("==============================================");
    println!("wisp {}", env!("CARGO_PKG_VERSION"));
    println!("==============================================");
    let role = if args.server {
        "server"
    } else if args.client_perf.is_some() {
        "client (perf)"
    } else {
        "client"
    };
    println!("Role:       {}", role);
    println!("Transport:  {}", args.transport_name());
    println!("Port:       {}", args.port);
    println!("==============================================");
}

async fn run_server(args: &Args) -> Result<()> {
    let config = ServerConfig {
        listen_addr: format!("0.0.0.0:{}", args.port),
        transport: args.transport_config(),
        idle_timeout: Duration::from_secs(args.idle_timeout_secs.max(1)),
    };

    let server = Server::bind(config).await?;
    let handle = server.handle();
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Ctrl-C received, stopping");
        })
        .await?;

    let stats = handle.stats();
    println!(
        "Served {} sessions ({} completed, {} failed)",
        stats.accepted, stats.completed, stats.failed
    );
    Ok(())
}

async fn run_plain_client(args: &Args, addr: &str) -> Result<()> {
    let config = ClientConfig {
        server_addr: normalize_address_with_port(addr, args.port)?,
        transport: args.transport_config(),
    };
    let mut client = Client::connect(&config).await?;

    eprintln!("Enter requests as: KEY [PAYLOAD]  (end with Ctrl-D)");
    let outcome = client
        .run_interactive(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await;
    client.close().await;

    let summary = outcome?;
    println!(
        "{} requests in {:.3}s",
        summary.requests,
        summary.elapsed.as_secs_f64()
    );
    Ok(())
}

async fn run_perf_client(args: &Args, addr: &str) -> Result<()> {
    let server_addr = normalize_address_with_port(addr, args.port)?;
    let perf_config = args.perf_config()?;
    let config = ClientConfig {
        server_addr,
        transport: args.transport_config(),
    };
    let mut client = Client::connect(&config).await?;

    let outcome = client.run_perf(&perf_config).await;
    client.close().await;

    let report = outcome?.report();
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to encode report")?
        );
    } else {
        println!("\n=== Perf Results ===");
        println!("{}", report);
    }
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    if args.server {
        return run_server(&args).await;
    }
    match (&args.client_perf, &args.client) {
        (Some(addr), _) => run_perf_client(&args, addr).await,
        (None, Some(addr)) => run_plain_client(&args, addr).await,
        (None, None) => Err(ConfigError::MissingServerAddress.into()),
    }
}

/// Map a failure back to its process exit code.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(e) = err.downcast_ref::<TransportError>() {
        return e.exit_code();
    }
    if let Some(e) = err.downcast_ref::<ConfigError>() {
        return e.exit_code();
    }
    1
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    print_banner(&args);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.worker_threads.max(1))
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            return ExitCode::from(wisp::error::EXIT_SETUP_FAILURE);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}
