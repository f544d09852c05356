/**
 * MONITOR RUNTIME - pieces shared by the Local and Neighborhood Monitor loops
 *
 * ROLE: identity of a monitor on the bus, the outbound event channels it
 * publishes on (heartbeat, violations, logs, usage, data), registration with
 * the C2 and the RPC request/reply plumbing.
 *
 * LOG FORWARDING: records captured by the tracing layer stay in the local
 * queue until the C2 announces `isRegistered` for this monitor, since before
 * that nobody listens to the log channel.
 */

use gridwatch_core::contracts::{
    rpc_topic, Channel, ControlEvent, DataChanged, Heartbeat, LogEvent, ReqViolationEvent, Role,
    UsageData,
};
use gridwatch_core::requirements::Violation;
use gridwatch_core::rpc::{self, RpcClient, RpcMethod, RpcRequest, RpcResponse};
use gridwatch_core::telemetry::LogQueue;
use gridwatch_core::transport::{publish_json, SharedTransport};
use gridwatch_core::{RpcError, TransportError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CYCLE_PERIOD: Duration = Duration::from_secs(1);
pub const REGISTER_RETRY: Duration = Duration::from_secs(5);
pub const VIOLATION_CAPACITY: usize = 1024;
pub const HEARTBEAT_MESSAGE: &str = "Still alive";

#[derive(Debug, Clone)]
pub struct Identity {
    pub id: Uuid,
    pub role: Role,
    /// Topic prefix of this monitor.
    pub address: String,
    pub c2_address: String,
}

impl Identity {
    pub fn rpc_topic(&self) -> String {
        rpc_topic(&self.address)
    }

    pub fn control_topic(&self) -> String {
        Channel::Control.topic(&self.c2_address)
    }
}

/// Outbound event channels of one monitor.
pub struct Publisher {
    identity: Identity,
    transport: SharedTransport,
    logs: LogQueue,
    forward_logs: AtomicBool,
}

impl Publisher {
    pub fn new(identity: Identity, transport: SharedTransport, logs: LogQueue) -> Self {
        Self { identity, transport, logs, forward_logs: AtomicBool::new(false) }
    }

    fn topic(&self, channel: Channel) -> String {
        channel.topic(&self.identity.address)
    }

    pub async fn heartbeat(&self) -> Result<(), TransportError> {
        let beat = Heartbeat {
            sender: self.identity.id.to_string(),
            message: HEARTBEAT_MESSAGE.to_string(),
        };
        publish_json(self.transport.as_ref(), &self.topic(Channel::Heartbeat), &beat).await
    }

    pub async fn data_changed(&self) -> Result<(), TransportError> {
        let event = DataChanged { address: self.identity.address.clone() };
        publish_json(self.transport.as_ref(), &self.topic(Channel::Data), &event).await
    }

    /// Publishes every violation in order. Stops at the first transport failure.
    pub async fn violations(&self, violations: &[Violation]) -> Result<(), TransportError> {
        let topic = self.topic(Channel::Violation);
        for violation in violations {
            let event = ReqViolationEvent::from(violation);
            publish_json(self.transport.as_ref(), &topic, &event).await?;
        }
        Ok(())
    }

    pub async fn usage(&self, usage: &UsageData) -> Result<(), TransportError> {
        publish_json(self.transport.as_ref(), &self.topic(Channel::Usage), usage).await
    }

    pub fn enable_log_forwarding(&self) {
        if !self.forward_logs.swap(true, Ordering::SeqCst) {
            info!(id = %self.identity.id, "C2 subscribed to our events, forwarding logs");
        }
    }

    pub fn forwards_logs(&self) -> bool {
        self.forward_logs.load(Ordering::SeqCst)
    }

    /// Drains the log queue onto the log channel. Returns the number of records sent.
    pub async fn forward_logs(&self) -> Result<usize, TransportError> {
        if !self.forwards_logs() {
            return Ok(0);
        }
        let records = self.logs.lock().drain();
        let topic = self.topic(Channel::Log);
        let uuid = self.identity.id.to_string();
        for record in &records {
            let event = LogEvent {
                uuid: uuid.clone(),
                kind: self.identity.role,
                severity: record.severity.clone(),
                message: record.message.clone(),
                time: record.time.clone(),
            };
            publish_json(self.transport.as_ref(), &topic, &event).await?;
        }
        Ok(records.len())
    }

    /// Applies a C2 broadcast that concerns every monitor. Returns the event for
    /// role-specific handling.
    pub fn on_control(&self, payload: &[u8]) -> Option<ControlEvent> {
        match serde_json::from_slice::<ControlEvent>(payload) {
            Ok(event) => {
                if event == (ControlEvent::IsRegistered { id: self.identity.id }) {
                    self.enable_log_forwarding();
                }
                Some(event)
            }
            Err(e) => {
                warn!(error = %e, "malformed control event");
                None
            }
        }
    }
}

/// Registers with the C2, retrying every `retry` while it cannot be reached.
/// A refusal is final.
pub async fn register_with_retry(
    rpc: &RpcClient,
    c2_address: &str,
    method: RpcMethod,
    retry: Duration,
) -> Result<(), RpcError> {
    loop {
        match rpc.call_ok(c2_address, method.clone()).await {
            Ok(_) => return Ok(()),
            Err(e @ RpcError::Rejected { .. }) => return Err(e),
            Err(e) => warn!(c2 = %c2_address, error = %e, "C2 unreachable, retrying registration"),
        }
        tokio::time::sleep(retry).await;
    }
}

/// Decodes a request, answers it with `answer` and publishes the reply.
pub async fn serve_request(
    transport: &SharedTransport,
    payload: &[u8],
    answer: impl FnOnce(&RpcRequest) -> RpcResponse,
) {
    let request = match RpcRequest::decode(payload) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "malformed rpc request");
            return;
        }
    };
    let response = answer(&request);
    debug!(method = request.method.name(), status = %response.status, "rpc answered");
    if let Err(e) = rpc::reply(transport.as_ref(), &request, response).await {
        error!(method = request.method.name(), error = %e, "failed to send rpc reply");
    }
}
