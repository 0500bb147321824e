//! Handshake configuration and carrier construction.

use crate::broker::{Broker, BrokerCarrier, GooglePubSubBroker};
use crate::carrier::Carrier;
use crate::direct::DirectCarrier;
use crate::error::HandshakeError;
use crate::{BROKER_REPLY_TIMEOUT, DIRECT_REPLY_TIMEOUT, LISTEN_TIMEOUT};
use chimera_transport::Transport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Which carrier to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Raw key datagrams on the tunnel socket
    #[default]
    #[serde(alias = "static")]
    Direct,
    /// Publish/subscribe broker
    #[serde(alias = "google")]
    Broker,
}

/// Which half of the handshake this endpoint runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Wait for the peer's handshake
    Listen,
    /// Initiate the handshake
    Connect,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listen => write!(f, "listen"),
            Self::Connect => write!(f, "connect"),
        }
    }
}

/// Broker connection settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Cloud project holding the topic
    pub project_id: String,
    /// Well-known handshake topic
    pub topic_id: String,
    /// File holding the bearer access token
    pub credentials_file: Option<PathBuf>,
    /// REST base URL (emulator or proxy); Google's endpoint when unset
    pub endpoint: Option<String>,
    /// This endpoint's reachable tunnel address, sent to the peer
    pub advertise_addr: Option<SocketAddr>,
}

/// Handshake settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Carrier selection
    pub method: Method,
    /// Handshake half; the role decides when unset
    pub side: Option<Side>,
    /// Seconds `connect` waits for a reply; carrier default when unset
    pub reply_timeout_secs: Option<u64>,
    /// Seconds `listen` waits; `0` waits until cancelled, default 120
    pub listen_timeout_secs: Option<u64>,
    /// Broker settings, required for [`Method::Broker`]
    pub broker: Option<BrokerConfig>,
}

impl HandshakeConfig {
    /// Reply timeout for the selected method.
    #[must_use]
    pub fn reply_timeout(&self) -> Duration {
        match (self.reply_timeout_secs, self.method) {
            (Some(secs), _) => Duration::from_secs(secs),
            (None, Method::Direct) => DIRECT_REPLY_TIMEOUT,
            (None, Method::Broker) => BROKER_REPLY_TIMEOUT,
        }
    }

    /// Listen timeout; `None` means wait until cancelled.
    #[must_use]
    pub fn listen_timeout(&self) -> Option<Duration> {
        match self.listen_timeout_secs {
            None => Some(LISTEN_TIMEOUT),
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
        }
    }

    /// Check settings without touching the network.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Config`] describing the first problem.
    pub fn validate(&self) -> Result<(), HandshakeError> {
        if self.reply_timeout_secs == Some(0) {
            return Err(HandshakeError::Config(
                "reply_timeout_secs must be positive".to_string(),
            ));
        }
        if self.method == Method::Broker {
            let broker = self.broker.as_ref().ok_or_else(|| {
                HandshakeError::Config("broker method needs a [handshake.broker] section".to_string())
            })?;
            if broker.project_id.is_empty() || broker.topic_id.is_empty() {
                return Err(HandshakeError::Config(
                    "broker method needs project_id and topic_id".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Build the configured carrier.
    ///
    /// `transport` is the tunnel socket, used by the direct carrier. `peer`
    /// is where to connect (direct) or the fallback peer address (broker).
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Config`] for invalid settings, or the broker
    /// client's construction error.
    pub fn build_carrier(
        &self,
        transport: Arc<dyn Transport>,
        peer: Option<SocketAddr>,
    ) -> Result<Box<dyn Carrier>, HandshakeError> {
        self.validate()?;

        match (self.method, &self.broker) {
            (Method::Direct, _) => {
                let mut carrier = DirectCarrier::new(transport)
                    .with_reply_timeout(self.reply_timeout())
                    .with_listen_timeout(self.listen_timeout());
                if let Some(peer) = peer {
                    carrier = carrier.with_peer(peer);
                }
                Ok(Box::new(carrier))
            }
            (Method::Broker, Some(settings)) => {
                let broker: Arc<dyn Broker> = Arc::new(match &settings.credentials_file {
                    Some(path) => GooglePubSubBroker::from_credentials_file(
                        settings.project_id.clone(),
                        settings.endpoint.clone(),
                        path,
                    )?,
                    None => GooglePubSubBroker::new(
                        settings.project_id.clone(),
                        settings.endpoint.clone(),
                        None,
                    )?,
                });
                Ok(Box::new(self.broker_carrier(broker, peer)?))
            }
            (Method::Broker, None) => Err(HandshakeError::Config(
                "broker method needs a [handshake.broker] section".to_string(),
            )),
        }
    }

    /// Build a broker carrier on an explicit broker.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Config`] if broker settings are missing.
    pub fn broker_carrier(
        &self,
        broker: Arc<dyn Broker>,
        peer: Option<SocketAddr>,
    ) -> Result<BrokerCarrier, HandshakeError> {
        let settings = self.broker.as_ref().ok_or_else(|| {
            HandshakeError::Config("broker method needs a [handshake.broker] section".to_string())
        })?;

        Ok(BrokerCarrier::new(broker, settings.topic_id.clone())
            .with_advertise_addr(settings.advertise_addr)
            .with_peer(peer)
            .with_reply_timeout(self.reply_timeout())
            .with_listen_timeout(self.listen_timeout()))
    }
}
