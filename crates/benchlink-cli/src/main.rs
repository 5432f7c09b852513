//! benchlink command-line tool
//!
//! `benchlink serve` runs the broker until Ctrl-C. The other subcommands
//! connect to a running broker, perform one operation on an instrument
//! address, and print the result.

use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use benchlink_core::constants::{DEFAULT_CLIENT_TIMEOUT, DEFAULT_MAX_CONNECTIONS};
use benchlink_core::{Address, Settings};
use benchlink_hardware::mock::MockBackend;
use benchlink_hardware::{AnyBackend, DeviceBackend, ResourceRegistry};
use benchlink_network::{BrokerClient, ClientConfig, ConnectionListener, DiscoveryFile, ListenerConfig};

#[derive(Parser, Debug)]
#[command(name = "benchlink")]
#[command(version, about = "Share lab instrument sessions between processes")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Discovery file the broker publishes its endpoint to.
    #[arg(long, global = true, env = "BENCHLINK_DISCOVERY_FILE")]
    discovery_file: Option<PathBuf>,

    /// Log level, used when RUST_LOG is not set.
    #[arg(long, global = true, env = "BENCHLINK_LOG_LEVEL")]
    log_level: Option<String>,

    /// Append logs to this file instead of stderr.
    #[arg(long, global = true, env = "BENCHLINK_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the broker.
    Serve(ServeArgs),
    /// Send command text to an instrument.
    Write {
        #[command(flatten)]
        target: Target,
        text: String,
    },
    /// Read one response from an instrument.
    Read {
        #[command(flatten)]
        target: Target,
    },
    /// Write command text and print the response.
    Query {
        #[command(flatten)]
        target: Target,
        text: String,
    },
    /// Print the instrument identity.
    Idn {
        #[command(flatten)]
        target: Target,
    },
    /// Apply key=value settings to an instrument session.
    Configure {
        #[command(flatten)]
        target: Target,
        #[arg(required = true, value_parser = parse_setting)]
        settings: Vec<(String, Value)>,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on. Port 0 picks a free port.
    #[arg(long, env = "BENCHLINK_BIND", default_value = "127.0.0.1:0")]
    bind: SocketAddr,

    /// Device backend behind the broker.
    #[arg(long, env = "BENCHLINK_BACKEND", value_enum, default_value_t = BackendKind::Mock)]
    backend: BackendKind,

    /// Baud rate for the serial backend.
    #[arg(long, env = "BENCHLINK_BAUD_RATE", default_value_t = 9600)]
    baud_rate: u32,

    /// Read timeout in milliseconds for newly opened serial ports.
    #[arg(long, env = "BENCHLINK_SERIAL_TIMEOUT", default_value_t = 2000)]
    serial_timeout: u64,

    /// Maximum number of simultaneous client connections.
    #[arg(long, env = "BENCHLINK_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,
}

#[derive(Args, Debug)]
struct Target {
    /// Instrument address, e.g. GPIB0::1::INSTR
    address: String,

    /// Seconds to wait for each reply.
    #[arg(long, env = "BENCHLINK_TIMEOUT", default_value_t = DEFAULT_CLIENT_TIMEOUT.as_secs())]
    timeout: u64,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum BackendKind {
    /// In-memory simulated instruments
    Mock,
    /// Serial ports (ASRL addresses)
    Serial,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Command::Serve(_) => "info",
        _ => "warn",
    };
    init_tracing(cli.log_level.as_deref().unwrap_or(default_level), cli.log_file.as_deref())?;

    let discovery_path = cli
        .discovery_file
        .unwrap_or_else(DiscoveryFile::default_path);

    match cli.command {
        Command::Serve(args) => serve(args, discovery_path).await,
        Command::Write { target, text } => {
            let mut client = target.connect(discovery_path).await?;
            client.write(&text).await?;
            client.close().await?;
            Ok(())
        }
        Command::Read { target } => {
            // READ drops the connection on its own
            let mut client = target.connect(discovery_path).await?;
            println!("{}", client.read().await?);
            Ok(())
        }
        Command::Query { target, text } => {
            let mut client = target.connect(discovery_path).await?;
            let response = client.query(&text).await?;
            client.close().await?;
            println!("{response}");
            Ok(())
        }
        Command::Idn { target } => {
            let mut client = target.connect(discovery_path).await?;
            let identity = client.idn().await?;
            client.close().await?;
            println!("{identity}");
            Ok(())
        }
        Command::Configure { target, settings } => {
            let settings: Settings = settings.into_iter().collect();
            let mut client = target.connect(discovery_path).await?;
            client.configure(&settings).await?;
            client.close().await?;
            Ok(())
        }
    }
}

fn init_tracing(level: &str, log_file: Option<&Path>) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
    Ok(())
}

async fn serve(args: ServeArgs, discovery_path: PathBuf) -> anyhow::Result<()> {
    let backend = build_backend(&args)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = backend.name(),
        bind = %args.bind,
        discovery = %discovery_path.display(),
        "Starting benchlink broker"
    );

    let registry = Arc::new(ResourceRegistry::new(backend));
    let config = ListenerConfig {
        bind_addr: args.bind,
        discovery_path,
        max_connections: args.max_connections,
    };
    let listener = ConnectionListener::new(config, registry);

    let stop = listener.cancellation_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                stop.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });

    listener.serve().await?;
    Ok(())
}

fn build_backend(args: &ServeArgs) -> anyhow::Result<AnyBackend> {
    match args.backend {
        BackendKind::Mock => Ok(MockBackend::default().into()),
        #[cfg(feature = "hardware-serial")]
        BackendKind::Serial => Ok(benchlink_hardware::serial::SerialBackend::new()
            .with_baud_rate(args.baud_rate)
            .with_timeout(Duration::from_millis(args.serial_timeout))
            .into()),
        #[cfg(not(feature = "hardware-serial"))]
        BackendKind::Serial => {
            anyhow::bail!("serial backend not compiled in (enable the hardware-serial feature)")
        }
    }
}

impl Target {
    async fn connect(&self, discovery_path: PathBuf) -> anyhow::Result<BrokerClient> {
        let address = Address::new(self.address.as_str())?;
        let config = ClientConfig {
            discovery_path,
            timeout: Duration::from_secs(self.timeout),
        };
        BrokerClient::connect(address, config)
            .await
            .with_context(|| format!("failed to open {}", self.address))
    }
}

/// Parse `key=value`; the value is JSON if it parses, a string otherwise.
fn parse_setting(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    if key.is_empty() {
        return Err(format!("missing key in {raw:?}"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
