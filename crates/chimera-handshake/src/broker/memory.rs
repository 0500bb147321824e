//! In-process broker for tests and single-host setups.

use super::Broker;
use crate::error::HandshakeError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
struct State {
    /// Topic name to its subscriptions
    topics: HashMap<String, Vec<String>>,
    /// Subscription name to pending messages
    queues: HashMap<String, VecDeque<Vec<u8>>>,
}

/// Broker held entirely in memory.
///
/// Mirrors the semantics the handshake relies on: creating an existing
/// topic or subscription fails, and a subscription only sees messages
/// published after it was created.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
}

impl MemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live topics.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.lock().map(|state| state.topics.len()).unwrap_or(0)
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.lock().map(|state| state.queues.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, HandshakeError> {
        self.state
            .lock()
            .map_err(|_| HandshakeError::Broker("broker state poisoned".to_string()))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn create_topic(&self, topic: &str) -> Result<(), HandshakeError> {
        let mut state = self.lock()?;
        if state.topics.contains_key(topic) {
            return Err(HandshakeError::Broker(format!("topic {topic} already exists")));
        }
        state.topics.insert(topic.to_string(), Vec::new());
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> Result<(), HandshakeError> {
        let mut state = self.lock()?;
        state
            .topics
            .remove(topic)
            .map(|_| ())
            .ok_or_else(|| HandshakeError::Broker(format!("topic {topic} not found")))
    }

    async fn create_subscription(
        &self,
        subscription: &str,
        topic: &str,
    ) -> Result<(), HandshakeError> {
        let mut state = self.lock()?;
        if state.queues.contains_key(subscription) {
            return Err(HandshakeError::Broker(format!(
                "subscription {subscription} already exists"
            )));
        }
        let Some(subscribers) = state.topics.get_mut(topic) else {
            return Err(HandshakeError::Broker(format!("topic {topic} not found")));
        };
        subscribers.push(subscription.to_string());
        state.queues.insert(subscription.to_string(), VecDeque::new());
        Ok(())
    }

    async fn delete_subscription(&self, subscription: &str) -> Result<(), HandshakeError> {
        let mut state = self.lock()?;
        if state.queues.remove(subscription).is_none() {
            return Err(HandshakeError::Broker(format!(
                "subscription {subscription} not found"
            )));
        }
        for subscribers in state.topics.values_mut() {
            subscribers.retain(|name| name != subscription);
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, data: &[u8]) -> Result<(), HandshakeError> {
        let mut state = self.lock()?;
        let Some(subscribers) = state.topics.get(topic).cloned() else {
            return Err(HandshakeError::Broker(format!("topic {topic} not found")));
        };
        for subscription in subscribers {
            if let Some(queue) = state.queues.get_mut(&subscription) {
                queue.push_back(data.to_vec());
            }
        }
        Ok(())
    }

    async fn pull_one(&self, subscription: &str) -> Result<Option<Vec<u8>>, HandshakeError> {
        let mut state = self.lock()?;
        let queue = state.queues.get_mut(subscription).ok_or_else(|| {
            HandshakeError::Broker(format!("subscription {subscription} not found"))
        })?;
        Ok(queue.pop_front())
    }
}
