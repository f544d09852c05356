/**
 * RPC - request/response over the pub/sub transport
 *
 * ROLE: a caller publishes an `RpcRequest` on `{target}/rpc@v1` naming its own
 * reply topic; the callee answers on that topic with the same `request_id`.
 * Pending calls wait on a oneshot keyed by request id, bounded by a timeout.
 *
 * The process dispatcher feeds every message arriving on the reply topic to
 * `RpcClient::handle_response`; handlers must never block the dispatcher on
 * an outbound call (spawn instead), or the reply can never be delivered.
 */

use crate::contracts::{rpc_reply_topic, rpc_topic};
use crate::error::{RpcError, TransportError};
use crate::state::{new_state, Shared};
use crate::transport::{publish_json, SharedTransport, Transport};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RpcMethod {
    RegisterLm { id: Uuid, address: String, topology_config: String },
    RegisterNm { id: Uuid, address: String },
    GetAssignment { id: Uuid },
    /// LM side of "register NM": give the NM a slot.
    AttachNm { id: Uuid },
    DetachNm { id: Uuid },
    ReadSnapshot,
    Ping,
}

impl RpcMethod {
    pub fn name(&self) -> &'static str {
        match self {
            RpcMethod::RegisterLm { .. } => "register_lm",
            RpcMethod::RegisterNm { .. } => "register_nm",
            RpcMethod::GetAssignment { .. } => "get_assignment",
            RpcMethod::AttachNm { .. } => "attach_nm",
            RpcMethod::DetachNm { .. } => "detach_nm",
            RpcMethod::ReadSnapshot => "read_snapshot",
            RpcMethod::Ping => "ping",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub request_id: String,
    pub reply_to: String,
    #[serde(flatten)]
    pub method: RpcMethod,
}

impl RpcRequest {
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcStatus {
    Good,
    BadInvalidArgument,
    BadTooManyMonitors,
    BadUnknownMonitor,
    BadNoData,
    BadUnsupported,
    BadInternal,
}

impl RpcStatus {
    pub fn is_good(self) -> bool {
        self == RpcStatus::Good
    }
}

impl fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RpcStatus::Good => "Good",
            RpcStatus::BadInvalidArgument => "BadInvalidArgument",
            RpcStatus::BadTooManyMonitors => "BadTooManyMonitors",
            RpcStatus::BadUnknownMonitor => "BadUnknownMonitor",
            RpcStatus::BadNoData => "BadNoData",
            RpcStatus::BadUnsupported => "BadUnsupported",
            RpcStatus::BadInternal => "BadInternal",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub request_id: String,
    pub status: RpcStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl RpcResponse {
    pub fn status(request: &RpcRequest, status: RpcStatus) -> Self {
        Self { request_id: request.request_id.clone(), status, payload: None }
    }

    pub fn good(request: &RpcRequest, payload: Option<Value>) -> Self {
        Self { request_id: request.request_id.clone(), status: RpcStatus::Good, payload }
    }
}

/// Publishes `response` on the reply topic named by `request`.
pub async fn reply(
    transport: &dyn Transport,
    request: &RpcRequest,
    response: RpcResponse,
) -> Result<(), TransportError> {
    publish_json(transport, &request.reply_to, &response).await
}

pub struct RpcClient {
    transport: SharedTransport,
    reply_topic: String,
    pending: Shared<HashMap<String, oneshot::Sender<RpcResponse>>>,
    timeout: Duration,
}

impl RpcClient {
    /// `own_address` is the caller's topic prefix; replies come back on its reply topic.
    pub fn new(transport: SharedTransport, own_address: &str) -> Self {
        Self {
            transport,
            reply_topic: rpc_reply_topic(own_address),
            pending: new_state(HashMap::new()),
            timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn reply_topic(&self) -> &str {
        &self.reply_topic
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    /// Routes a message received on the reply topic to its waiting caller.
    /// Returns false for late or unknown replies.
    pub fn handle_response(&self, payload: &[u8]) -> bool {
        let response: RpcResponse = match serde_json::from_slice(payload) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "malformed rpc reply");
                return false;
            }
        };
        let waiter = self.pending.lock().remove(&response.request_id);
        match waiter {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                debug!(request_id = %response.request_id, "reply for unknown request");
                false
            }
        }
    }

    /// Sends `method` to the peer at `target` and waits for its response,
    /// whatever the status.
    pub async fn call(&self, target: &str, method: RpcMethod) -> Result<RpcResponse, RpcError> {
        let request_id = Uuid::new_v4().to_string();
        let request = RpcRequest {
            request_id: request_id.clone(),
            reply_to: self.reply_topic.clone(),
            method,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        if let Err(e) = publish_json(self.transport.as_ref(), &rpc_topic(target), &request).await {
            self.pending.lock().remove(&request_id);
            return Err(e.into());
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.lock().remove(&request_id);
                Err(RpcError::Cancelled)
            }
            Err(_) => {
                self.pending.lock().remove(&request_id);
                let timeout_ms = self.timeout.as_millis();
                Err(RpcError::Timeout { target: target.to_string(), timeout_ms })
            }
        }
    }

    /// Like [`call`](Self::call) but any status other than `Good` is an error.
    pub async fn call_ok(
        &self,
        target: &str,
        method: RpcMethod,
    ) -> Result<Option<Value>, RpcError> {
        let response = self.call(target, method).await?;
        if !response.status.is_good() {
            return Err(RpcError::Rejected { target: target.to_string(), status: response.status });
        }
        Ok(response.payload)
    }

    /// Calls and decodes the payload of a `Good` response.
    pub async fn call_expect<T: DeserializeOwned>(
        &self,
        target: &str,
        method: RpcMethod,
    ) -> Result<T, RpcError> {
        let payload = self.call_ok(target, method).await?.unwrap_or(Value::Null);
        serde_json::from_value(payload).map_err(RpcError::Payload)
    }
}
