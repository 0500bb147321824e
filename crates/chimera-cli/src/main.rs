//! Chimera CLI
//!
//! Multiplexed TCP-over-UDP tunnel with sealed, padded datagrams

mod config;

use anyhow::Context;
use chimera_core::{ClientEndpoint, RelayEndpoint, Tunnel};
use chimera_handshake::perform;
use chimera_transport::{AsyncUdpTransport, Transport};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use config::{Config, Overrides, Role};

/// Configuration file read when `--config` is not given
const DEFAULT_CONFIG: &str = "chimera.toml";

/// Chimera - TCP-over-UDP tunnel
#[derive(Parser)]
#[command(name = "chimera")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (TOML, or JSON with a .json extension)
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept local TCP connections and carry them to the client
    Relay {
        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Receive streams from the relay and dial the destination for each
    Client {
        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Run the role named by tunnel.role in the configuration file
    Run {
        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Check the configuration and exit
    Validate {
        /// Role to validate for (defaults to tunnel.role)
        #[arg(long)]
        role: Option<String>,
    },
}

#[derive(Args)]
struct OverrideArgs {
    /// Relay TCP accept address
    #[arg(long)]
    listen: Option<String>,

    /// Peer tunnel address
    #[arg(long)]
    peer: Option<String>,

    /// Client TCP destination (host:port)
    #[arg(long)]
    destination: Option<String>,

    /// UDP tunnel socket address
    #[arg(long)]
    bind: Option<String>,
}

impl From<OverrideArgs> for Overrides {
    fn from(args: OverrideArgs) -> Self {
        Self {
            listen: args.listen,
            peer: args.peer,
            destination: args.destination,
            bind: args.bind,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // A missing default file means defaults plus flags; any other path must exist
    let mut config = if !cli.config.exists() && cli.config == Path::new(DEFAULT_CONFIG) {
        Config::default()
    } else {
        Config::load(&cli.config)
            .with_context(|| format!("Failed to load configuration {}", cli.config.display()))?
    };

    // Initialize logging; RUST_LOG wins over the file and --verbose
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Commands::Relay { overrides } => {
            config.apply(overrides.into());
            run_tunnel(Role::Relay, config).await
        }
        Commands::Client { overrides } => {
            config.apply(overrides.into());
            run_tunnel(Role::Client, config).await
        }
        Commands::Run { overrides } => {
            config.apply(overrides.into());
            let role = config
                .tunnel
                .role
                .context("tunnel.role is not set; use `chimera relay` or `chimera client`")?;
            run_tunnel(role, config).await
        }
        Commands::Validate { role } => validate(role, &config),
    }
}

/// Validate configuration and print a summary
fn validate(role: Option<String>, config: &Config) -> anyhow::Result<()> {
    let role = match role.as_deref() {
        Some("relay") => Role::Relay,
        Some("client") => Role::Client,
        Some(other) => anyhow::bail!("Unknown role: {other}. Must be relay or client"),
        None => config
            .tunnel
            .role
            .context("tunnel.role is not set; pass --role")?,
    };

    config.validate(role)?;

    println!("Configuration OK");
    println!("  Role: {role}");
    println!("  Tunnel bind: {}", config.tunnel.bind_addr);
    if let Some(peer) = &config.tunnel.peer_addr {
        println!("  Peer: {peer}");
    }
    println!("  Padding: {}", config.tunnel.padding);
    println!(
        "  Handshake: {:?} ({})",
        config.handshake.method,
        config.handshake_side(role)
    );
    match role {
        Role::Relay => println!("  Listen: {}", config.relay.listen_addr),
        Role::Client => println!("  Destination: {}", config.destination()?),
    }
    Ok(())
}

/// Bind, handshake, then serve the tunnel until a shutdown signal
async fn run_tunnel(role: Role, config: Config) -> anyhow::Result<()> {
    config.validate(role)?;

    let bind = config.bind_addr()?;
    let transport: Arc<dyn Transport> = Arc::new(
        AsyncUdpTransport::bind(bind)
            .await
            .with_context(|| format!("Failed to bind tunnel socket {bind}"))?,
    );
    tracing::info!(
        "Chimera {} {} on {}",
        role,
        env!("CARGO_PKG_VERSION"),
        transport.local_addr()?
    );

    let configured_peer = config.peer_addr()?;
    let carrier = config
        .handshake
        .build_carrier(Arc::clone(&transport), configured_peer)?;

    let rendezvous = tokio::select! {
        result = perform(carrier.as_ref(), config.handshake_side(role)) => {
            result.context("Handshake failed")?
        }
        () = shutdown_signal() => {
            tracing::info!("Shutdown requested during handshake");
            return Ok(());
        }
    };

    let peer = rendezvous
        .peer_addr
        .or(configured_peer)
        .context("Handshake yielded no peer address; set tunnel.peer_addr")?;
    let tunnel = Tunnel::new(
        Arc::clone(&transport),
        peer,
        &rendezvous.session_key,
        config.tunnel.padding,
    );

    match role {
        Role::Relay => {
            let relay = RelayEndpoint::bind(config.listen_addr()?, tunnel, config.mux_config())
                .await
                .context("Failed to bind relay listener")?;
            tokio::select! {
                result = Arc::clone(&relay).run() => result?,
                () = shutdown_signal() => tracing::info!("Shutting down relay"),
            }
            relay.shutdown().await;
            tracing::info!(stats = ?relay.stats(), "Relay stopped");
        }
        Role::Client => {
            let client = ClientEndpoint::new(tunnel, config.destination()?, config.mux_config());
            tokio::select! {
                result = Arc::clone(&client).run() => result?,
                () = shutdown_signal() => tracing::info!("Shutting down client"),
            }
            client.shutdown().await;
            tracing::info!(stats = ?client.stats(), "Client stopped");
        }
    }

    tracing::info!(stats = ?transport.stats(), "Transport closed");
    transport.close().await?;
    Ok(())
}

/// Resolve on Ctrl+C, or SIGTERM on Unix
async fn shutdown_signal() {
    let interrupt = signal_or_pending("Ctrl+C", tokio::signal::ctrl_c());

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                tracing::error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => {}
        () = terminate => {}
    }
}

/// Wait for a signal; if its handler cannot be installed, never resolve.
async fn signal_or_pending<F>(name: &str, installed: F)
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    if let Err(e) = installed.await {
        tracing::error!("Cannot listen for {}: {}", name, e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_failed_signal_install_never_resolves() {
        let failing = async { Err(std::io::Error::other("no signal driver")) };
        let waited = timeout(Duration::from_millis(100), signal_or_pending("test", failing)).await;
        assert!(waited.is_err(), "install failure must not trigger shutdown");
    }

    #[tokio::test]
    async fn test_delivered_signal_resolves() {
        let delivered = async { Ok(()) };
        let waited = timeout(Duration::from_millis(100), signal_or_pending("test", delivered)).await;
        assert!(waited.is_ok());
    }

    #[test]
    fn test_cli_parses_relay_overrides() {
        let cli = Cli::try_parse_from([
            "chimera",
            "relay",
            "--listen",
            "127.0.0.1:8080",
            "--peer",
            "203.0.113.9:9000",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG));
        match cli.command {
            Commands::Relay { overrides } => {
                assert_eq!(overrides.listen.as_deref(), Some("127.0.0.1:8080"));
                assert_eq!(overrides.peer.as_deref(), Some("203.0.113.9:9000"));
                assert!(overrides.destination.is_none());
            }
            _ => panic!("expected relay command"),
        }
    }
}
