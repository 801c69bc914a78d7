//! BINLINK CLI
//!
//! Runs a hub or a link from a TOML configuration file.

mod config;

use anyhow::Context;
use binlink_core::{ChannelManager, CoreConfig, Service};
use binlink_discovery::Discovery;
use binlink_transport::{SerialTransport, UdpTransport};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use config::Config;

/// BINLINK - secure bin-to-hub messaging
#[derive(Parser)]
#[command(name = "binlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the central hub
    Hub {
        /// Listen address (overrides the config file)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Run a bin or relay link
    Link {
        /// Serial device (overrides the config file)
        #[arg(short, long)]
        serial: Option<String>,

        /// Do not fall back to UDP
        #[arg(long)]
        no_udp: bool,
    },

    /// Probe for a hub once and print its address
    Discover,

    /// Show the effective configuration
    Status,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Generate a random pre-shared key
    Keygen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);

    if let Commands::Init { force } = cli.command {
        init_logging(cli.verbose, "info");
        return write_default_config(&config_path, force);
    }

    let config = if config_path.exists() {
        Config::load(&config_path)
            .with_context(|| format!("reading {}", config_path.display()))?
    } else if cli.config.is_none() {
        Config::load_or_default()?
    } else {
        anyhow::bail!("Configuration file not found: {}", config_path.display());
    };

    init_logging(cli.verbose, &config.logging.level);
    config.validate()?;

    match cli.command {
        Commands::Hub { bind } => run_hub(bind, &config).await?,
        Commands::Link { serial, no_udp } => run_link(serial, no_udp, &config).await?,
        Commands::Discover => discover(&config).await?,
        Commands::Status => show_status(&config, &config_path),
        Commands::Keygen => generate_key()?,
        Commands::Init { .. } => {}
    }

    Ok(())
}

fn init_logging(verbose: bool, level: &str) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn write_default_config(path: &PathBuf, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let mut config = Config::default();
    config.security.pre_shared_key = binlink_crypto::random::random_hex(32)?;
    config.save(path)?;
    println!("Configuration written to {}", path.display());
    Ok(())
}

async fn wait_and_stop(service: &Service) -> anyhow::Result<()> {
    println!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    let status = service.status().await;
    service.stop().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Run the hub until interrupted
async fn run_hub(bind: Option<String>, config: &Config) -> anyhow::Result<()> {
    let core = config.to_core()?;
    let addr = match bind {
        Some(bind) => bind.parse().with_context(|| format!("invalid bind address {bind}"))?,
        None => config.hub_addr()?,
    };

    let transport = Arc::new(UdpTransport::bind(addr).await?);
    tracing::info!("Hub listening on {}", transport.local_addr());

    let hub = Service::hub(core, transport)?;
    hub.start().await?;

    println!("BINLINK hub");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Listen: {}", addr);

    wait_and_stop(&hub).await
}

/// Run a link until interrupted
async fn run_link(serial: Option<String>, no_udp: bool, config: &Config) -> anyhow::Result<()> {
    let core = config.to_core()?;
    let mut channel = ChannelManager::new(&core);

    let serial_port = serial.or_else(|| config.serial.port.clone());
    if let Some(port) = &serial_port {
        match SerialTransport::open(port, config.serial.baud_rate) {
            Ok(transport) => channel = channel.with_serial(Arc::new(transport)),
            Err(e) => tracing::warn!("Serial port unavailable, continuing without it: {}", e),
        }
    }

    let udp_enabled = config.network.udp_enabled && !no_udp;
    if udp_enabled {
        let transport = Arc::new(UdpTransport::bind(config.link_addr()?).await?);
        tracing::info!("Link UDP socket on {}", transport.local_addr());
        channel = channel.with_udp(transport, &core);
    }

    let identity = config.identity();
    println!("BINLINK link");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Device: {} ({})", identity.display_name(), identity.device_id);
    println!("Serial: {}", serial_port.as_deref().unwrap_or("none"));
    println!("UDP: {}", udp_enabled);

    let link = Service::link(core, channel, identity)?;
    link.start().await?;

    wait_and_stop(&link).await
}

/// Run one discovery round
async fn discover(config: &Config) -> anyhow::Result<()> {
    let core: CoreConfig = config.to_core()?;
    let transport = Arc::new(UdpTransport::bind(config.link_addr()?).await?);

    println!("Probing {} ...", core.discovery.broadcast_addr);
    let discovery = Discovery::new(transport, core.discovery);
    match discovery.run().await {
        Ok(peer) => println!("Found peer at {}", peer),
        Err(e) => println!("No peer found: {}", e),
    }
    Ok(())
}

/// Show the effective configuration
fn show_status(config: &Config, path: &std::path::Path) {
    println!("BINLINK Status");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Config: {}", path.display());
    println!();

    println!("Security:");
    println!(
        "  Pre-shared key: {}",
        if config.security.pre_shared_key.is_empty() { "missing" } else { "set" }
    );
    println!("  Replay window: {}s", config.security.replay_window_secs);
    println!("  Session lifetime: {}s", config.security.token_timeout_secs);
    println!();

    println!("Network:");
    println!("  Hub address: {}", config.network.hub_addr);
    println!("  Link address: {}", config.network.link_addr);
    println!("  Broadcast: {}", config.network.broadcast_addr);
    println!("  UDP enabled: {}", config.network.udp_enabled);
    match binlink_transport::udp::detect_local_ip() {
        Some(ip) => println!("  Local IP: {}", ip),
        None => println!("  Local IP: unknown"),
    }
    println!();

    println!("Serial:");
    println!("  Port: {}", config.serial.port.as_deref().unwrap_or("none"));
    println!("  Baud rate: {}", config.serial.baud_rate);
    println!();

    println!("Device:");
    println!("  ID: {}", config.device.device_id);
    println!("  Name: {}", config.device.device_name);
}

/// Print a fresh pre-shared key
fn generate_key() -> anyhow::Result<()> {
    let key = binlink_crypto::random::random_hex(32)?;
    println!("{}", key);
    println!("\nPut this in [security] pre_shared_key on every hub and link.");
    Ok(())
}
