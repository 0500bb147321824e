//! Relay/client tunnel fixture for end-to-end tests.
//!
//! Runs a full tunnel on loopback: a [`RelayEndpoint`] listening for local
//! TCP connections, a [`ClientEndpoint`] dialing a destination, and one UDP
//! transport per side carrying the sealed frames between them.
//!
//! # Example
//!
//! ```no_run
//! use chimera_integration_tests::fixtures::{EchoServer, TunnelPair, connect_and_echo};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let echo = EchoServer::start().await?;
//! let pair = TunnelPair::start(echo.addr().to_string()).await?;
//!
//! let echoed = connect_and_echo(pair.listen_addr, b"ping").await?;
//! assert_eq!(echoed, b"ping");
//! # Ok(())
//! # }
//! ```

use chimera_core::{ClientEndpoint, MuxConfig, PaddingMode, RelayEndpoint, Tunnel};
use chimera_crypto::SessionKey;
use chimera_transport::{AsyncUdpTransport, Transport};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Boxed error for fixture setup
pub type FixtureError = Box<dyn std::error::Error + Send + Sync>;

/// Upper bound on any single wait in the fixtures
const IO_TIMEOUT: Duration = Duration::from_secs(5);

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// Bind a UDP transport on an ephemeral loopback port.
///
/// # Errors
///
/// Returns the bind error.
pub async fn bind_loopback() -> Result<Arc<AsyncUdpTransport>, FixtureError> {
    Ok(Arc::new(AsyncUdpTransport::bind(loopback()).await?))
}

/// One side of the tunnel before it is started
pub struct EndpointSetup {
    /// Socket carrying this side's frames
    pub transport: Arc<AsyncUdpTransport>,
    /// The other side's tunnel address
    pub peer: SocketAddr,
    /// Key this side seals and opens with
    pub session_key: SessionKey,
}

/// A running relay and client joined by one tunnel
pub struct TunnelPair {
    /// Relay endpoint
    pub relay: Arc<RelayEndpoint>,
    /// Client endpoint
    pub client: Arc<ClientEndpoint>,
    /// Relay's local TCP listener
    pub listen_addr: SocketAddr,
    /// Relay's UDP transport
    pub relay_transport: Arc<AsyncUdpTransport>,
    /// Client's UDP transport
    pub client_transport: Arc<AsyncUdpTransport>,
    /// Key the relay seals with
    pub session_key: SessionKey,
    tasks: Vec<JoinHandle<()>>,
}

impl TunnelPair {
    /// Start a tunnel to `destination` with a freshly generated shared key.
    ///
    /// # Errors
    ///
    /// Returns any bind or key generation error.
    pub async fn start(destination: impl Into<String>) -> Result<Self, FixtureError> {
        Self::start_with_config(destination, MuxConfig::default()).await
    }

    /// Like [`start`](Self::start) with explicit multiplexer settings.
    ///
    /// # Errors
    ///
    /// Returns any bind or key generation error.
    pub async fn start_with_config(
        destination: impl Into<String>,
        config: MuxConfig,
    ) -> Result<Self, FixtureError> {
        let relay_transport = bind_loopback().await?;
        let client_transport = bind_loopback().await?;
        let key = SessionKey::generate()?;

        let relay = EndpointSetup {
            peer: client_transport.local_addr()?,
            transport: relay_transport.clone(),
            session_key: key.clone(),
        };
        let client = EndpointSetup {
            peer: relay_transport.local_addr()?,
            transport: client_transport,
            session_key: key,
        };
        Self::launch(relay, client, destination, config).await
    }

    /// Start both endpoints from explicit per-side settings.
    ///
    /// # Errors
    ///
    /// Returns the relay's listener bind error.
    pub async fn launch(
        relay: EndpointSetup,
        client: EndpointSetup,
        destination: impl Into<String>,
        config: MuxConfig,
    ) -> Result<Self, FixtureError> {
        let relay_transport = relay.transport.clone();
        let client_transport = client.transport.clone();

        let relay_tunnel = Tunnel::new(
            relay.transport,
            relay.peer,
            &relay.session_key,
            PaddingMode::Random,
        );
        let client_tunnel = Tunnel::new(
            client.transport,
            client.peer,
            &client.session_key,
            PaddingMode::Random,
        );

        let relay_endpoint = RelayEndpoint::bind(loopback(), relay_tunnel, config.clone()).await?;
        let listen_addr = relay_endpoint.local_addr()?;
        let client_endpoint = ClientEndpoint::new(client_tunnel, destination, config);

        let relay_task = {
            let relay_endpoint = relay_endpoint.clone();
            tokio::spawn(async move {
                if let Err(e) = relay_endpoint.run().await {
                    tracing::debug!("Relay stopped: {}", e);
                }
            })
        };
        let client_task = {
            let client_endpoint = client_endpoint.clone();
            tokio::spawn(async move {
                if let Err(e) = client_endpoint.run().await {
                    tracing::debug!("Client stopped: {}", e);
                }
            })
        };

        Ok(Self {
            relay: relay_endpoint,
            client: client_endpoint,
            listen_addr,
            relay_transport,
            client_transport,
            session_key: relay.session_key,
            tasks: vec![relay_task, client_task],
        })
    }

    /// Open a local TCP connection to the relay.
    ///
    /// # Errors
    ///
    /// Returns the connect error.
    pub async fn connect(&self) -> io::Result<TcpStream> {
        TcpStream::connect(self.listen_addr).await
    }
}

impl Drop for TunnelPair {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// TCP server echoing every byte back on each accepted connection
pub struct EchoServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl EchoServer {
    /// Bind on an ephemeral loopback port and start serving.
    ///
    /// # Errors
    ///
    /// Returns the bind error.
    pub async fn start() -> io::Result<Self> {
        let listener = TcpListener::bind(loopback()).await?;
        let addr = listener.local_addr()?;
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = accepted.clone();
        let task = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                    let _ = writer.shutdown().await;
                });
            }
        });

        Ok(Self {
            addr,
            accepted,
            task,
        })
    }

    /// Address to use as the tunnel destination.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connections accepted so far.
    #[must_use]
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Connect to `addr`, send `payload`, and read back as many bytes.
///
/// # Errors
///
/// Returns any I/O error, or `TimedOut` if the echo does not arrive.
pub async fn connect_and_echo(addr: SocketAddr, payload: &[u8]) -> io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(payload).await?;

    let mut echoed = vec![0u8; payload.len()];
    timeout(IO_TIMEOUT, stream.read_exact(&mut echoed))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "echo timed out"))??;
    Ok(echoed)
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + IO_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
