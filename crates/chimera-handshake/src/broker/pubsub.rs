//! Google Cloud Pub/Sub over its REST v1 API.
//!
//! Authentication is a bearer access token read from the credentials file:
//! either a JSON object with an `access_token` field or the bare token. No
//! token is sent when none is configured, which is what the Pub/Sub
//! emulator expects.

use super::Broker;
use crate::error::HandshakeError;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Public Pub/Sub REST endpoint
pub const DEFAULT_ENDPOINT: &str = "https://pubsub.googleapis.com/v1";

/// Per-request timeout for topic and subscription management
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A pull that hangs past this counts as an empty pull
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct SubscriptionRequest<'a> {
    topic: &'a str,
}

#[derive(Serialize)]
struct PublishRequest {
    messages: Vec<OutboundMessage>,
}

#[derive(Serialize)]
struct OutboundMessage {
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: u32,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: InboundMessage,
}

#[derive(Deserialize)]
struct InboundMessage {
    #[serde(default)]
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    ack_ids: Vec<&'a str>,
}

#[derive(Deserialize)]
struct TokenFile {
    access_token: String,
}

/// Pub/Sub client for one project
pub struct GooglePubSubBroker {
    http_client: reqwest::Client,
    endpoint: String,
    project_id: String,
    token: Option<String>,
    pull_timeout: Duration,
}

impl GooglePubSubBroker {
    /// Create a client for `project_id` against `endpoint`
    /// (default [`DEFAULT_ENDPOINT`]).
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Http`] if the HTTP client cannot be built.
    pub fn new(
        project_id: impl Into<String>,
        endpoint: Option<String>,
        token: Option<String>,
    ) -> Result<Self, HandshakeError> {
        let http_client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http_client,
            endpoint: endpoint
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
            project_id: project_id.into(),
            token,
            pull_timeout: DEFAULT_PULL_TIMEOUT,
        })
    }

    /// Bound each pull; one that outlasts `timeout` returns no message.
    #[must_use]
    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    /// Create a client authenticated with the token in `credentials_file`.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Config`] if the file cannot be read or holds
    /// no token.
    pub fn from_credentials_file(
        project_id: impl Into<String>,
        endpoint: Option<String>,
        credentials_file: &Path,
    ) -> Result<Self, HandshakeError> {
        let token = read_token(credentials_file)?;
        Self::new(project_id, endpoint, Some(token))
    }

    fn topic_path(&self, topic: &str) -> String {
        format!("projects/{}/topics/{}", self.project_id, topic)
    }

    fn topic_url(&self, topic: &str) -> String {
        format!("{}/{}", self.endpoint, self.topic_path(topic))
    }

    fn subscription_url(&self, subscription: &str) -> String {
        format!(
            "{}/projects/{}/subscriptions/{}",
            self.endpoint, self.project_id, subscription
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        action: &str,
    ) -> Result<reqwest::Response, HandshakeError> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(HandshakeError::Broker(format!(
            "{action} failed with HTTP {}: {}",
            status.as_u16(),
            body.trim()
        )))
    }
}

#[async_trait]
impl Broker for GooglePubSubBroker {
    async fn create_topic(&self, topic: &str) -> Result<(), HandshakeError> {
        let request = self
            .http_client
            .put(self.topic_url(topic))
            .json(&serde_json::json!({}));
        self.execute(request, "create topic").await?;
        debug!(topic, "Created topic");
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> Result<(), HandshakeError> {
        let request = self.http_client.delete(self.topic_url(topic));
        self.execute(request, "delete topic").await?;
        debug!(topic, "Deleted topic");
        Ok(())
    }

    async fn create_subscription(
        &self,
        subscription: &str,
        topic: &str,
    ) -> Result<(), HandshakeError> {
        let topic_path = self.topic_path(topic);
        let request = self
            .http_client
            .put(self.subscription_url(subscription))
            .json(&SubscriptionRequest { topic: &topic_path });
        self.execute(request, "create subscription").await?;
        debug!(subscription, topic, "Created subscription");
        Ok(())
    }

    async fn delete_subscription(&self, subscription: &str) -> Result<(), HandshakeError> {
        let request = self.http_client.delete(self.subscription_url(subscription));
        self.execute(request, "delete subscription").await?;
        debug!(subscription, "Deleted subscription");
        Ok(())
    }

    async fn publish(&self, topic: &str, data: &[u8]) -> Result<(), HandshakeError> {
        let body = PublishRequest {
            messages: vec![OutboundMessage {
                data: STANDARD.encode(data),
            }],
        };
        let request = self
            .http_client
            .post(format!("{}:publish", self.topic_url(topic)))
            .json(&body);
        self.execute(request, "publish").await?;
        Ok(())
    }

    async fn pull_one(&self, subscription: &str) -> Result<Option<Vec<u8>>, HandshakeError> {
        let url = self.subscription_url(subscription);
        let request = self
            .http_client
            .post(format!("{url}:pull"))
            .timeout(self.pull_timeout)
            .json(&PullRequest { max_messages: 1 });
        let pulled = match self.execute(request, "pull").await {
            Ok(response) => response.json::<PullResponse>().await.map_err(HandshakeError::from),
            Err(e) => Err(e),
        };
        let response = match pulled {
            Ok(response) => response,
            Err(HandshakeError::Http(e)) if e.is_timeout() => {
                debug!(subscription, "Pull timed out with no message");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let Some(received) = response.received_messages.into_iter().next() else {
            return Ok(None);
        };

        let request = self
            .http_client
            .post(format!("{url}:acknowledge"))
            .json(&AcknowledgeRequest {
                ack_ids: vec![received.ack_id.as_str()],
            });
        self.execute(request, "acknowledge").await?;

        STANDARD
            .decode(received.message.data)
            .map(Some)
            .map_err(|e| HandshakeError::Broker(format!("message data is not base64: {e}")))
    }
}

fn read_token(path: &Path) -> Result<String, HandshakeError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        HandshakeError::Config(format!("cannot read credentials {}: {e}", path.display()))
    })?;

    let token = match serde_json::from_str::<TokenFile>(&contents) {
        Ok(file) => file.access_token,
        Err(_) => contents.trim().to_string(),
    };

    if token.is_empty() || token.contains(char::is_whitespace) {
        return Err(HandshakeError::Config(format!(
            "no access token in {}",
            path.display()
        )));
    }
    Ok(token)
}
