//! Configuration system for the Chimera CLI.
//!
//! TOML by default; a `.json` file is read as JSON.

use chimera_core::{MAX_PAYLOAD_SIZE, MuxConfig, PaddingMode};
use chimera_handshake::{HandshakeConfig, Method, Side};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Accepts local TCP, opens tunnel streams
    Relay,
    /// Dials the destination for each tunnel stream
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Relay => write!(f, "relay"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Chimera configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tunnel socket and stream settings
    pub tunnel: TunnelConfig,
    /// Relay settings
    pub relay: RelayConfig,
    /// Client settings
    pub client: ClientConfig,
    /// Handshake settings
    pub handshake: HandshakeConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Role used by `chimera run`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    /// UDP tunnel socket address
    pub bind_addr: String,
    /// Peer tunnel address, when known ahead of the handshake
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_addr: Option<String>,
    /// Frame padding policy
    pub padding: PaddingMode,
    /// TCP read size per DATA frame
    pub read_chunk: usize,
    /// Destination dial timeout in seconds
    pub dial_timeout_secs: u64,
    /// Inbound payloads buffered per stream
    pub write_queue: usize,
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// TCP accept address
    pub listen_addr: String,
}

/// Client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Fixed TCP destination, `host:port`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

/// Values given on the command line, applied over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Relay TCP accept address
    pub listen: Option<String>,
    /// Peer tunnel address
    pub peer: Option<String>,
    /// Client destination
    pub destination: Option<String>,
    /// UDP tunnel socket address
    pub bind: Option<String>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            role: None,
            bind_addr: "0.0.0.0:9000".to_string(),
            peer_addr: None,
            padding: PaddingMode::Random,
            read_chunk: chimera_core::DEFAULT_READ_CHUNK,
            dial_timeout_secs: 10,
            write_queue: chimera_core::mux::DEFAULT_WRITE_QUEUE,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let config = if is_json {
            serde_json::from_str(&contents)?
        } else {
            toml::from_str(&contents)?
        };
        Ok(config)
    }

    /// Apply command-line overrides.
    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(listen) = overrides.listen {
            self.relay.listen_addr = listen;
        }
        if let Some(peer) = overrides.peer {
            self.tunnel.peer_addr = Some(peer);
        }
        if let Some(destination) = overrides.destination {
            self.client.destination = Some(destination);
        }
        if let Some(bind) = overrides.bind {
            self.tunnel.bind_addr = bind;
        }
    }

    /// Parse the tunnel socket address
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.tunnel
            .bind_addr
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid tunnel bind_addr: {}", self.tunnel.bind_addr))
    }

    /// Parse the configured peer address, if any
    ///
    /// # Errors
    ///
    /// Returns an error if the address is set but cannot be parsed.
    pub fn peer_addr(&self) -> anyhow::Result<Option<SocketAddr>> {
        self.tunnel
            .peer_addr
            .as_deref()
            .map(|peer| {
                peer.parse()
                    .map_err(|_| anyhow::anyhow!("Invalid tunnel peer_addr: {peer}"))
            })
            .transpose()
    }

    /// Parse the relay TCP accept address
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.relay
            .listen_addr
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid relay listen_addr: {}", self.relay.listen_addr))
    }

    /// Client destination
    ///
    /// # Errors
    ///
    /// Returns an error if no destination is configured.
    pub fn destination(&self) -> anyhow::Result<&str> {
        self.client
            .destination
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Client needs a destination (client.destination or --destination)"))
    }

    /// Handshake half for `role`: explicit setting, else client listens and
    /// relay connects.
    #[must_use]
    pub fn handshake_side(&self, role: Role) -> Side {
        self.handshake.side.unwrap_or(match role {
            Role::Client => Side::Listen,
            Role::Relay => Side::Connect,
        })
    }

    /// Multiplexer settings
    #[must_use]
    pub fn mux_config(&self) -> MuxConfig {
        MuxConfig {
            read_chunk: self.tunnel.read_chunk,
            write_queue: self.tunnel.write_queue,
            dial_timeout: Duration::from_secs(self.tunnel.dial_timeout_secs),
        }
    }

    /// Validate configuration for `role`
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self, role: Role) -> anyhow::Result<()> {
        self.bind_addr()?;
        let peer = self.peer_addr()?;

        if self.tunnel.read_chunk == 0 || self.tunnel.read_chunk > MAX_PAYLOAD_SIZE {
            anyhow::bail!("read_chunk must be between 1 and {MAX_PAYLOAD_SIZE}");
        }
        if self.tunnel.write_queue == 0 {
            anyhow::bail!("write_queue must be at least 1");
        }
        if self.tunnel.dial_timeout_secs == 0 {
            anyhow::bail!("dial_timeout_secs must be positive");
        }

        match role {
            Role::Relay => {
                self.listen_addr()?;
            }
            Role::Client => {
                validate_host_port(self.destination()?, "Destination")?;
            }
        }

        self.handshake.validate()?;
        if self.handshake.method == Method::Direct
            && self.handshake_side(role) == Side::Connect
            && peer.is_none()
        {
            anyhow::bail!("Direct handshake in connect mode needs tunnel.peer_addr (or --peer)");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}

/// Validate host:port format
fn validate_host_port(addr: &str, name: &str) -> anyhow::Result<()> {
    let Some((host, port_str)) = addr.rsplit_once(':') else {
        anyhow::bail!("{name} '{addr}' missing port (expected format: host:port)");
    };

    let port: u16 = port_str
        .parse()
        .map_err(|_| anyhow::anyhow!("{name} '{addr}' has invalid port: {port_str}"))?;
    if port == 0 {
        anyhow::bail!("{name} '{addr}' has invalid port: 0");
    }
    if host.is_empty() {
        anyhow::bail!("{name} '{addr}' has empty hostname");
    }
    Ok(())
}
