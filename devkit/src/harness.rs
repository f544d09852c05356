/*!
In-process test harness

Runs any number of peers on one [`MemoryBus`] and lets a test watch the
traffic between them without a broker.
*/

use anyhow::{bail, Context, Result};
use gridwatch_core::transport::memory::MemoryClient;
use gridwatch_core::transport::{topic_matches, Inbound, Inbox, MemoryBus, Transport};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Default wait used by [`Observer::expect`].
pub const EXPECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct TestHarness {
    bus: MemoryBus,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        init_test_tracing();
        Self { bus: MemoryBus::new() }
    }

    pub fn bus(&self) -> &MemoryBus {
        &self.bus
    }

    pub fn connect(&self, name: &str) -> (Arc<MemoryClient>, Inbox) {
        self.bus.connect(name)
    }

    /// A passive peer subscribed to `filters`.
    pub async fn observe(&self, name: &str, filters: &[&str]) -> Result<Observer> {
        let (client, inbox) = self.bus.connect(name);
        for filter in filters {
            client
                .subscribe(filter)
                .await
                .with_context(|| format!("observer {name} cannot subscribe to {filter}"))?;
        }
        Ok(Observer { _client: client, inbox })
    }
}

pub struct Observer {
    _client: Arc<MemoryClient>,
    inbox: Inbox,
}

impl Observer {
    /// Waits for the next message on a topic matching `filter` that decodes as `T`.
    pub async fn expect<T: DeserializeOwned>(&mut self, filter: &str) -> Result<T> {
        self.expect_within(filter, EXPECT_TIMEOUT).await
    }

    pub async fn expect_within<T: DeserializeOwned>(
        &mut self,
        filter: &str,
        within: Duration,
    ) -> Result<T> {
        let wait = async {
            while let Some(message) = self.inbox.recv().await {
                if !topic_matches(filter, &message.topic) {
                    continue;
                }
                if let Ok(value) = serde_json::from_slice::<T>(&message.payload) {
                    return Ok(value);
                }
            }
            bail!("observer inbox closed")
        };
        match timeout(within, wait).await {
            Ok(result) => result,
            Err(_) => bail!("nothing matching {filter} within {within:?}"),
        }
    }

    /// Everything received so far, without waiting.
    pub fn drain(&mut self) -> Vec<Inbound> {
        let mut out = Vec::new();
        while let Ok(message) = self.inbox.try_recv() {
            out.push(message);
        }
        out
    }
}

/// Plain fmt subscriber writing through the test capture. Repeated calls are no-ops.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
