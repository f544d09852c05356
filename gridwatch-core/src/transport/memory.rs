//! In-process bus with MQTT filter semantics, for single-process deployments and tests.

use super::{topic_matches, Inbound, Inbox, Transport};
use crate::error::TransportError;
use crate::state::{new_state, Shared};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

struct Endpoint {
    name: String,
    filters: Vec<String>,
    sender: mpsc::UnboundedSender<Inbound>,
}

#[derive(Clone, Default)]
pub struct MemoryBus {
    endpoints: Shared<Vec<Endpoint>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self { endpoints: new_state(Vec::new()) }
    }

    /// Creates a client of the bus and the receiver of its subscriptions.
    pub fn connect(&self, name: impl Into<String>) -> (Arc<MemoryClient>, Inbox) {
        let (sender, inbox) = mpsc::unbounded_channel();
        let name = name.into();
        self.endpoints.lock().push(Endpoint { name: name.clone(), filters: Vec::new(), sender });
        (Arc::new(MemoryClient { bus: self.clone(), name }), inbox)
    }

    /// Delivers to every endpoint with a matching filter, at most once per endpoint.
    pub fn deliver(&self, topic: &str, payload: &[u8]) -> usize {
        let mut endpoints = self.endpoints.lock();
        endpoints.retain(|e| !e.sender.is_closed());
        let mut delivered = 0;
        for endpoint in endpoints.iter() {
            if endpoint.filters.iter().any(|f| topic_matches(f, topic)) {
                let message = Inbound { topic: topic.to_string(), payload: payload.to_vec() };
                if endpoint.sender.send(message).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Drops an endpoint, as if its process died.
    pub fn disconnect(&self, name: &str) {
        self.endpoints.lock().retain(|e| e.name != name);
    }

    pub fn subscriptions_of(&self, name: &str) -> Vec<String> {
        self.endpoints
            .lock()
            .iter()
            .filter(|e| e.name == name)
            .flat_map(|e| e.filters.clone())
            .collect()
    }
}

pub struct MemoryClient {
    bus: MemoryBus,
    name: String,
}

impl MemoryClient {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Transport for MemoryClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.bus.deliver(topic, &payload);
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        let mut endpoints = self.bus.endpoints.lock();
        let endpoint = endpoints
            .iter_mut()
            .find(|e| e.name == self.name)
            .ok_or(TransportError::Closed)?;
        if !endpoint.filters.iter().any(|f| f == filter) {
            endpoint.filters.push(filter.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        let mut endpoints = self.bus.endpoints.lock();
        let endpoint = endpoints
            .iter_mut()
            .find(|e| e.name == self.name)
            .ok_or(TransportError::Closed)?;
        endpoint.filters.retain(|f| f != filter);
        Ok(())
    }
}
