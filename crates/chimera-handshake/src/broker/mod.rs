//! Broker carrier: handshake through a publish/subscribe service.
//!
//! The broker hides the sender's network identity, so the connector puts
//! its reachable tunnel address into the message itself.
//!
//! ```text
//! connector                          broker                          listener
//!    │ create reply-<id>, reply-<id>-sub                                │
//!    │                                 │      create <topic>-sub-<id>   │
//!    │ publish {key, reply, addr} ───► <topic> ──────────────────────►  │
//!    │                                 │  ◄──── publish {key, addr}     │
//!    │ ◄──────────────────── reply-<id>                                 │
//!    │ delete reply-<id>-sub, reply-<id>        delete <topic>-sub-<id> │
//! ```
//!
//! The listener must be subscribed before the connector publishes.

mod memory;
mod pubsub;

pub use memory::MemoryBroker;
pub use pubsub::{DEFAULT_ENDPOINT, GooglePubSubBroker};

use crate::carrier::{Carrier, Rendezvous};
use crate::error::HandshakeError;
use crate::{BROKER_REPLY_TIMEOUT, LISTEN_TIMEOUT};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chimera_crypto::random::random_8;
use chimera_crypto::{EphemeralKeyPair, PublicKey};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Pause between empty pulls
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Minimal publish/subscribe surface needed by the handshake
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create a topic.
    async fn create_topic(&self, topic: &str) -> Result<(), HandshakeError>;

    /// Delete a topic.
    async fn delete_topic(&self, topic: &str) -> Result<(), HandshakeError>;

    /// Create a subscription on `topic`. Only messages published afterwards
    /// are delivered to it.
    async fn create_subscription(&self, subscription: &str, topic: &str)
    -> Result<(), HandshakeError>;

    /// Delete a subscription.
    async fn delete_subscription(&self, subscription: &str) -> Result<(), HandshakeError>;

    /// Publish one message.
    async fn publish(&self, topic: &str, data: &[u8]) -> Result<(), HandshakeError>;

    /// Pull and acknowledge at most one message. `None` when nothing is
    /// waiting.
    async fn pull_one(&self, subscription: &str) -> Result<Option<Vec<u8>>, HandshakeError>;
}

/// JSON message exchanged over the broker.
///
/// `public_key` is standard base64. The listener's reply leaves
/// `reply_topic` empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    /// Sender's ephemeral public key, base64
    pub public_key: String,
    /// Topic the listener must answer on
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reply_topic: String,
    /// Sender's reachable tunnel address
    #[serde(rename = "real_ip", default, skip_serializing_if = "Option::is_none")]
    pub real_address: Option<String>,
}

impl HandshakeMessage {
    /// Build a message carrying `key`.
    #[must_use]
    pub fn new(key: &PublicKey, reply_topic: String, real_address: Option<SocketAddr>) -> Self {
        Self {
            public_key: STANDARD.encode(key.as_bytes()),
            reply_topic,
            real_address: real_address.map(|addr| addr.to_string()),
        }
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Broker`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, HandshakeError> {
        serde_json::to_vec(self).map_err(|e| HandshakeError::Broker(e.to_string()))
    }

    /// Parse JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Broker`] if `data` is not a handshake message.
    pub fn from_bytes(data: &[u8]) -> Result<Self, HandshakeError> {
        serde_json::from_slice(data).map_err(|e| HandshakeError::Broker(e.to_string()))
    }

    /// Decode the carried public key.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::InvalidKey`] if it is not 32 base64 bytes.
    pub fn public_key(&self) -> Result<PublicKey, HandshakeError> {
        let bytes = STANDARD
            .decode(&self.public_key)
            .map_err(|e| HandshakeError::InvalidKey(e.to_string()))?;
        Ok(PublicKey::from_slice(&bytes)?)
    }

    /// Parse the carried address, if any. An empty string counts as absent.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Broker`] if present but not `ip:port`.
    pub fn real_address(&self) -> Result<Option<SocketAddr>, HandshakeError> {
        self.real_address
            .as_deref()
            .filter(|addr| !addr.is_empty())
            .map(|addr| {
                addr.parse()
                    .map_err(|_| HandshakeError::Broker(format!("bad real address {addr:?}")))
            })
            .transpose()
    }
}

/// Handshake relayed through a [`Broker`]
pub struct BrokerCarrier {
    broker: Arc<dyn Broker>,
    topic: String,
    advertise_addr: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    reply_timeout: Duration,
    listen_timeout: Option<Duration>,
    poll_interval: Duration,
}

impl BrokerCarrier {
    /// Create a carrier using the well-known `topic`.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
            advertise_addr: None,
            peer: None,
            reply_timeout: BROKER_REPLY_TIMEOUT,
            listen_timeout: Some(LISTEN_TIMEOUT),
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Tunnel address to announce to the other side.
    #[must_use]
    pub fn with_advertise_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.advertise_addr = addr;
        self
    }

    /// Fallback peer address when the other side announces none.
    #[must_use]
    pub fn with_peer(mut self, peer: Option<SocketAddr>) -> Self {
        self.peer = peer;
        self
    }

    /// How long `connect` waits for the reply.
    #[must_use]
    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    /// How long `listen` waits; `None` waits until cancelled.
    #[must_use]
    pub fn with_listen_timeout(mut self, listen_timeout: Option<Duration>) -> Self {
        self.listen_timeout = listen_timeout;
        self
    }

    /// Pause between empty pulls.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Pull until a decodable handshake message arrives.
    async fn next_message(&self, subscription: &str) -> Result<HandshakeMessage, HandshakeError> {
        loop {
            match self.broker.pull_one(subscription).await? {
                Some(data) => match HandshakeMessage::from_bytes(&data) {
                    Ok(message) => return Ok(message),
                    Err(e) => warn!(subscription, error = %e, "Skipping undecodable broker message"),
                },
                None => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }

    async fn answer(&self, subscription: &str) -> Result<Rendezvous, HandshakeError> {
        let message = match self.listen_timeout {
            Some(limit) => timeout(limit, self.next_message(subscription))
                .await
                .map_err(|_| HandshakeError::Timeout(limit))??,
            None => self.next_message(subscription).await?,
        };

        let peer_public = message.public_key()?;
        if message.reply_topic.is_empty() {
            return Err(HandshakeError::Broker(
                "handshake message without reply topic".to_string(),
            ));
        }
        let peer_addr = message.real_address()?.or(self.peer);

        let own = EphemeralKeyPair::generate();
        let session_key = own.exchange(&peer_public)?.session_key();

        let reply = HandshakeMessage::new(&own.public_key(), String::new(), self.advertise_addr);
        self.broker
            .publish(&message.reply_topic, &reply.to_bytes()?)
            .await?;
        info!(reply_topic = %message.reply_topic, peer = ?peer_addr, "Answered broker handshake");

        Ok(Rendezvous {
            session_key,
            peer_addr,
        })
    }

    async fn initiate(&self, reply_topic: &str, reply_sub: &str) -> Result<Rendezvous, HandshakeError> {
        let own = EphemeralKeyPair::generate();
        let message =
            HandshakeMessage::new(&own.public_key(), reply_topic.to_string(), self.advertise_addr);
        self.broker.publish(&self.topic, &message.to_bytes()?).await?;
        debug!(topic = %self.topic, reply_topic, "Published broker handshake");

        let reply = timeout(self.reply_timeout, self.next_message(reply_sub))
            .await
            .map_err(|_| HandshakeError::Timeout(self.reply_timeout))??;

        let peer_public = reply.public_key()?;
        let session_key = own.exchange(&peer_public)?.session_key();

        Ok(Rendezvous {
            session_key,
            peer_addr: reply.real_address()?.or(self.peer),
        })
    }

    async fn cleanup_subscription(&self, subscription: &str) {
        if let Err(e) = self.broker.delete_subscription(subscription).await {
            warn!(subscription, error = %e, "Failed to delete subscription");
        }
    }

    async fn cleanup_topic(&self, topic: &str) {
        if let Err(e) = self.broker.delete_topic(topic).await {
            warn!(topic, error = %e, "Failed to delete topic");
        }
    }
}

#[async_trait]
impl Carrier for BrokerCarrier {
    fn name(&self) -> &'static str {
        "broker"
    }

    async fn listen(&self) -> Result<Rendezvous, HandshakeError> {
        let subscription = format!("{}-sub-{}", self.topic, unique_suffix()?);
        self.broker
            .create_subscription(&subscription, &self.topic)
            .await?;
        info!(topic = %self.topic, subscription = %subscription, "Waiting for broker handshake");

        let result = self.answer(&subscription).await;
        self.cleanup_subscription(&subscription).await;
        result
    }

    async fn connect(&self) -> Result<Rendezvous, HandshakeError> {
        let reply_topic = format!("reply-{}", unique_suffix()?);
        let reply_sub = format!("{reply_topic}-sub");

        self.broker.create_topic(&reply_topic).await?;
        if let Err(e) = self
            .broker
            .create_subscription(&reply_sub, &reply_topic)
            .await
        {
            self.cleanup_topic(&reply_topic).await;
            return Err(e);
        }

        let result = self.initiate(&reply_topic, &reply_sub).await;
        self.cleanup_subscription(&reply_sub).await;
        self.cleanup_topic(&reply_topic).await;
        result
    }
}

/// Random hex suffix for per-attempt topic and subscription names.
fn unique_suffix() -> Result<String, HandshakeError> {
    Ok(hex::encode(random_8()?))
}
