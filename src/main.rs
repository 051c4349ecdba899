//! edgetunnel CLI - Connect a local node to the edge
//!
//! Keeps a set of registered HA connections open until interrupted.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use edgetunnel_client::identity::{client_info, DEFAULT_FEATURES};
use edgetunnel_client::{
    ConfigurationFlags, ConnectionOptions, DnsResolver, EdgeDiscovery, EdgeIpVersion,
    EdgeResolver, NoopMetrics, Orchestrator, PercentageFetcher, ProtocolChoice, ProtocolSelector,
    StaticPercentages, StaticResolver, Supervisor, SupervisorConfig, SupervisorParams,
    TransportDialer, TunnelToken, UnvalidatedConfig,
};
use edgetunnel_client::edge_discovery::{DEFAULT_EDGE_DOMAIN, DEFAULT_EDGE_PORT};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

/// edgetunnel - Expose local services through the edge network
#[derive(Parser, Debug)]
#[command(name = "edgetunnel")]
#[command(about = "edgetunnel - Expose local services through the edge network")]
#[command(version = env!("GIT_TAG"))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a named tunnel
    #[command(long_about = r#"
Register HA connections for a named tunnel and keep them alive until
interrupted. Connections reconnect with backoff and fall back from QUIC
to HTTP/2 when QUIC is unreachable.

EXAMPLES:
  # Run with a token from the dashboard
  edgetunnel run --token $TUNNEL_TOKEN

  # Pin HTTP/2 and use a local ingress file
  edgetunnel run --token $TUNNEL_TOKEN --protocol http2 --config ingress.yaml

  # Talk to a fixed set of edge addresses
  edgetunnel run --token $TUNNEL_TOKEN --edge 198.51.100.1:7844 --edge 198.51.100.2:7844

ENVIRONMENT VARIABLES:
  TUNNEL_TOKEN            Tunnel token (base64)
  TUNNEL_TRANSPORT_PROTOCOL  auto, quic or http2
  TUNNEL_HA_CONNECTIONS   Number of HA connections
  TUNNEL_EDGE             Comma separated edge addresses
  TUNNEL_REGION           Edge region
  TUNNEL_EDGE_IP_VERSION  4, 6 or auto
  TUNNEL_CONFIG           Ingress configuration file (YAML)
  TUNNEL_GRACE_PERIOD     Shutdown grace period in seconds
  TUNNEL_PROTOCOL_PERCENTAGES  Fixed rollout, e.g. quic=50,http2=100
    "#)]
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Tunnel token
    #[arg(long, env = "TUNNEL_TOKEN", hide_env_values = true)]
    token: String,

    /// Transport protocol (auto, quic, http2)
    #[arg(long, env = "TUNNEL_TRANSPORT_PROTOCOL", default_value = "auto")]
    protocol: ProtocolChoice,

    /// Number of HA connections
    #[arg(long, env = "TUNNEL_HA_CONNECTIONS", default_value = "4")]
    ha_connections: u8,

    /// Edge addresses to use instead of DNS discovery
    #[arg(long, env = "TUNNEL_EDGE", value_delimiter = ',')]
    edge: Vec<SocketAddr>,

    /// Edge region (e.g., us)
    #[arg(long, env = "TUNNEL_REGION")]
    region: Option<String>,

    /// IP version of edge addresses (4, 6, auto)
    #[arg(long, env = "TUNNEL_EDGE_IP_VERSION", default_value = "auto")]
    edge_ip_version: EdgeIpVersion,

    /// Ingress configuration file (YAML)
    #[arg(long, env = "TUNNEL_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds to wait for connections to unregister on shutdown
    #[arg(long, env = "TUNNEL_GRACE_PERIOD", default_value = "30")]
    grace_period: u64,

    /// Maximum registration retries per connection
    #[arg(long, env = "TUNNEL_RETRIES", default_value = "5")]
    retries: u32,

    /// Local IP reported to the edge as the origin address
    #[arg(long, env = "TUNNEL_ORIGIN_LOCAL_IP")]
    origin_local_ip: Option<IpAddr>,

    /// Extra root certificates (PEM) for the edge TLS handshake
    #[arg(long, env = "TUNNEL_EDGE_CA")]
    edge_ca: Option<PathBuf>,

    /// Skip certificate verification (insecure, for development only)
    #[arg(long)]
    insecure: bool,

    /// Fixed protocol rollout percentages for automatic selection (quic=50,http2=100)
    #[arg(long, env = "TUNNEL_PROTOCOL_PERCENTAGES")]
    protocol_percentages: Option<StaticPercentages>,
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn load_ingress(path: Option<&PathBuf>) -> Result<UnvalidatedConfig> {
    let Some(path) = path else {
        return Ok(UnvalidatedConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    UnvalidatedConfig::from_yaml(&raw)
        .with_context(|| format!("Invalid config file {}", path.display()))
}

/// Non-secret command line settings reported to the edge with the local configuration
fn configuration_flags(args: &RunArgs) -> ConfigurationFlags {
    let mut flags = ConfigurationFlags::new();
    flags.insert("protocol".to_string(), args.protocol.to_string());
    flags.insert("ha-connections".to_string(), args.ha_connections.to_string());
    flags.insert("edge-ip-version".to_string(), args.edge_ip_version.to_string());
    flags.insert("grace-period".to_string(), format!("{}s", args.grace_period));
    flags.insert("retries".to_string(), args.retries.to_string());

    if !args.edge.is_empty() {
        let edge: Vec<String> = args.edge.iter().map(SocketAddr::to_string).collect();
        flags.insert("edge".to_string(), edge.join(","));
    }
    if let Some(region) = &args.region {
        flags.insert("region".to_string(), region.clone());
    }
    if let Some(config) = &args.config {
        flags.insert("config".to_string(), config.display().to_string());
    }
    if let Some(ip) = args.origin_local_ip {
        flags.insert("origin-local-ip".to_string(), ip.to_string());
    }
    if let Some(ca) = &args.edge_ca {
        flags.insert("edge-ca".to_string(), ca.display().to_string());
    }
    if args.insecure {
        flags.insert("insecure".to_string(), "true".to_string());
    }
    if let Some(percentages) = &args.protocol_percentages {
        let pairs: Vec<String> = percentages
            .0
            .iter()
            .map(|p| format!("{}={}", p.protocol, p.percentage))
            .collect();
        flags.insert("protocol-percentages".to_string(), pairs.join(","));
    }
    flags
}

async fn run_tunnel(args: RunArgs) -> Result<()> {
    let flags = configuration_flags(&args);
    let RunArgs {
        token,
        protocol,
        ha_connections,
        edge,
        region,
        edge_ip_version,
        config,
        grace_period,
        retries,
        origin_local_ip,
        edge_ca,
        insecure,
        protocol_percentages,
    } = args;

    let token = TunnelToken::decode(&token).context("Failed to decode tunnel token")?;
    let ingress = load_ingress(config.as_ref())?;

    let supervisor_config = SupervisorConfig::default()
        .with_ha_connections(ha_connections)
        .with_retries(retries)
        .with_grace_period(Duration::from_secs(grace_period))
        .with_region(region)
        .with_edge_ip_version(edge_ip_version);

    let resolver: Arc<dyn EdgeResolver> = if edge.is_empty() {
        Arc::new(DnsResolver::new(DEFAULT_EDGE_DOMAIN, DEFAULT_EDGE_PORT))
    } else {
        info!("Using {} static edge addresses", edge.len());
        Arc::new(StaticResolver::new(edge))
    };

    let root_certs = match edge_ca {
        Some(path) => edgetunnel_transport::tls::load_root_certs(&path)
            .with_context(|| format!("Failed to load edge CA {}", path.display()))?,
        None => Vec::new(),
    };
    if insecure {
        warn!("⚠️  Certificate verification disabled (insecure mode)");
    }
    let dialer = TransportDialer::edge_default(insecure, root_certs)
        .context("Failed to set up edge transports")?;

    let connector_id = Uuid::new_v4();
    let mut options = ConnectionOptions {
        client: client_info(connector_id, DEFAULT_FEATURES),
        ..Default::default()
    };
    if let Some(ip) = origin_local_ip {
        options = options.with_origin_local_ip(ip);
    }

    let metrics = Arc::new(NoopMetrics);
    let orchestrator =
        Orchestrator::new(ingress, flags, metrics.clone()).context("Invalid ingress rules")?;
    let fetcher = protocol_percentages.map(|p| Arc::new(p) as Arc<dyn PercentageFetcher>);
    if fetcher.is_some() && protocol == ProtocolChoice::Auto {
        info!("Using fixed protocol rollout percentages");
    }
    let selector = ProtocolSelector::new(protocol, &token.account_tag, fetcher);

    info!("Tunnel ID: {}", token.tunnel_id);
    info!("Connector ID: {}", connector_id);
    info!("Protocol: {}", protocol);

    let supervisor = Supervisor::new(SupervisorParams {
        config: supervisor_config,
        auth: token.auth(),
        tunnel_id: token.tunnel_id,
        options,
        discovery: Arc::new(EdgeDiscovery::new(resolver)),
        selector: Arc::new(selector),
        dialer: Arc::new(dialer),
        orchestrator: Arc::new(orchestrator),
        metrics,
    })?;

    let mut connected = supervisor.connected_signal();
    tokio::spawn(async move {
        if connected.wait().await {
            info!("Tunnel connected");
        }
    });

    let shutdown = CancellationToken::new();
    let ctrl_c_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down...");
            ctrl_c_token.cancel();
        }
    });

    supervisor.run(shutdown).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Run(args) => {
            info!(
                "edgetunnel {} ({}, built {}) starting...",
                env!("GIT_TAG"),
                env!("GIT_HASH"),
                env!("BUILD_TIME")
            );

            let result = run_tunnel(args).await;

            if let Err(e) = &result {
                error!("Tunnel stopped: {:#}", e);
            } else {
                info!("edgetunnel stopped");
            }
            result
        }
    }
}
