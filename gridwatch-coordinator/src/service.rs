//! C2 process wiring
//!
//! One dispatcher task reads the inbox: replies to our own RPC calls go to the
//! [`RpcClient`], requests are answered inline, monitor events feed the
//! liveness tracker, the report log and the console. Anything that waits on
//! another peer (handshakes, detach calls) runs in its own task so the
//! dispatcher is always free to route replies.

use crate::console::ConsoleSink;
use crate::coordinator::{Coordinator, CoordinatorStatus, ReconfigurePlan, Removal, RemovalCause};
use crate::error::CoordinatorError;
use crate::liveness;
use crate::peers;
use crate::reports::ReportLog;
use futures::future::join_all;
use gridwatch_core::contracts::{
    rpc_topic, Channel, ControlEvent, Heartbeat, LogEvent, ReqViolationEvent,
};
use gridwatch_core::rpc::{self, RpcClient, RpcMethod, RpcRequest, RpcResponse, RpcStatus};
use gridwatch_core::state::{new_state, Shared};
use gridwatch_core::transport::{publish_json, Inbound, Inbox, SharedTransport, Transport};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CONTROL_PERIOD: Duration = Duration::from_secs(2);

pub struct C2Context {
    pub address: String,
    pub transport: SharedTransport,
    pub rpc: RpcClient,
    pub coordinator: Shared<Coordinator>,
    pub reports: Shared<ReportLog>,
    pub console: Shared<ConsoleSink>,
    pub heartbeat_grace: Duration,
    pub link_retry: Duration,
}

pub type SharedContext = Arc<C2Context>;

impl C2Context {
    pub fn new(address: impl Into<String>, transport: SharedTransport) -> SharedContext {
        let address = address.into();
        Arc::new(Self {
            rpc: RpcClient::new(transport.clone(), &address),
            address,
            transport,
            coordinator: new_state(Coordinator::new()),
            reports: new_state(ReportLog::new()),
            console: new_state(ConsoleSink::new()),
            heartbeat_grace: liveness::HEARTBEAT_GRACE,
            link_retry: peers::LINK_RETRY,
        })
    }

    pub fn control_topic(&self) -> String {
        Channel::Control.topic(&self.address)
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.coordinator.lock().status()
    }
}

/// Subscribes to the C2's own topics, starts the background tasks and
/// dispatches the inbox until it closes.
pub async fn run(ctx: SharedContext, mut inbox: Inbox) -> anyhow::Result<()> {
    ctx.transport.subscribe(&rpc_topic(&ctx.address)).await?;
    ctx.transport.subscribe(ctx.rpc.reply_topic()).await?;
    info!(address = %ctx.address, "C2 listening");

    let sweeper = liveness::spawn_sweeper(ctx.clone());
    let control = spawn_control_loop(ctx.clone());

    while let Some(message) = inbox.recv().await {
        dispatch(&ctx, message).await;
    }

    sweeper.abort();
    control.abort();
    warn!("inbox closed, C2 stopping");
    Ok(())
}

/// Reconfigures every 2 s when a membership change is pending.
pub fn spawn_control_loop(ctx: SharedContext) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(CONTROL_PERIOD);
        loop {
            tick.tick().await;
            let plan = ctx.coordinator.lock().reconfigure_if_needed();
            if let Some(plan) = plan {
                broadcast_plan(&ctx, &plan).await;
            }
        }
    })
}

async fn dispatch(ctx: &SharedContext, message: Inbound) {
    if message.topic == ctx.rpc.reply_topic() {
        ctx.rpc.handle_response(&message.payload);
        return;
    }
    if message.topic == rpc_topic(&ctx.address) {
        handle_request(ctx, &message.payload).await;
        return;
    }
    match Channel::parse(&message.topic) {
        Some((_, Channel::Heartbeat)) => {
            match serde_json::from_slice::<Heartbeat>(&message.payload) {
                Ok(hb) => match Uuid::parse_str(&hb.sender) {
                    Ok(id) => liveness::on_heartbeat(ctx, id).await,
                    Err(_) => debug!(sender = %hb.sender, "heartbeat from non-uuid sender"),
                },
                Err(e) => warn!(topic = %message.topic, error = %e, "malformed heartbeat"),
            }
        }
        Some((_, Channel::Violation)) => {
            match serde_json::from_slice::<ReqViolationEvent>(&message.payload) {
                Ok(event) => {
                    info!(
                        requirement = %event.requirement_id(),
                        component = %event.component_id,
                        "violation reported"
                    );
                    ctx.reports.lock().record(&event, OffsetDateTime::now_utc());
                }
                Err(e) => warn!(topic = %message.topic, error = %e, "malformed violation event"),
            }
        }
        Some((_, Channel::Log)) => match serde_json::from_slice::<LogEvent>(&message.payload) {
            Ok(event) => {
                ctx.console.lock().print(&event);
            }
            Err(e) => warn!(topic = %message.topic, error = %e, "malformed log event"),
        },
        _ => debug!(topic = %message.topic, "ignored message"),
    }
}

async fn handle_request(ctx: &SharedContext, payload: &[u8]) {
    let request = match RpcRequest::decode(payload) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "malformed rpc request");
            return;
        }
    };
    let response = answer(ctx, &request).await;
    if let Err(e) = rpc::reply(ctx.transport.as_ref(), &request, response).await {
        error!(method = request.method.name(), error = %e, "failed to send rpc reply");
    }
}

async fn answer(ctx: &SharedContext, request: &RpcRequest) -> RpcResponse {
    match &request.method {
        RpcMethod::RegisterLm { id, address, topology_config } => {
            let previous = previous_address(ctx, *id);
            let outcome = ctx.coordinator.lock().register_lm(*id, address.clone(), topology_config);
            registration_response(ctx, request, *id, address, previous, outcome).await
        }
        RpcMethod::RegisterNm { id, address } => {
            let previous = previous_address(ctx, *id);
            let outcome = ctx.coordinator.lock().register_nm(*id, address.clone());
            registration_response(ctx, request, *id, address, previous, outcome).await
        }
        RpcMethod::GetAssignment { id } => {
            let assignment = ctx.coordinator.lock().assignment(*id);
            match serde_json::to_value(assignment.as_ref()) {
                Ok(value) => RpcResponse::good(request, Some(value)),
                Err(e) => {
                    error!(error = %e, "cannot encode assignment");
                    RpcResponse::status(request, RpcStatus::BadInternal)
                }
            }
        }
        RpcMethod::Ping => RpcResponse::good(request, None),
        other => {
            debug!(method = other.name(), "unsupported on the C2");
            RpcResponse::status(request, RpcStatus::BadUnsupported)
        }
    }
}

fn previous_address(ctx: &SharedContext, id: Uuid) -> Option<String> {
    ctx.coordinator.lock().registry().get(id).map(|r| r.address.clone())
}

async fn registration_response(
    ctx: &SharedContext,
    request: &RpcRequest,
    id: Uuid,
    address: &str,
    previous: Option<String>,
    outcome: Result<crate::coordinator::Registration, CoordinatorError>,
) -> RpcResponse {
    match outcome {
        Ok(registration) => {
            if let Some(old) = previous.filter(|old| old != address) {
                unsubscribe_events(ctx, &old).await;
            }
            peers::spawn_link(ctx.clone(), id, registration.incarnation);
            RpcResponse::good(request, None)
        }
        Err(e) => {
            warn!(%id, error = %e, "registration refused");
            RpcResponse::status(request, RpcStatus::BadInvalidArgument)
        }
    }
}

/// Removes a monitor on request and carries out the consequences.
pub async fn remove_monitor(ctx: &SharedContext, id: Uuid) -> bool {
    let removal = ctx.coordinator.lock().delete_monitor(id, RemovalCause::Requested);
    match removal {
        Some(removal) => {
            apply_removal(ctx, removal).await;
            true
        }
        None => false,
    }
}

/// I/O following [`Coordinator::delete_monitor`]: stop listening to the
/// monitor, ask the LMs to release a removed NM, announce the new layout.
pub async fn apply_removal(ctx: &SharedContext, removal: Removal) {
    unsubscribe_events(ctx, &removal.record.address).await;
    if !removal.detach_from.is_empty() {
        let ctx = ctx.clone();
        let nm = removal.record.id;
        let targets = removal.detach_from;
        tokio::spawn(async move {
            let calls = targets.iter().map(|lm| ctx.rpc.call(lm, RpcMethod::DetachNm { id: nm }));
            for (lm, result) in targets.iter().zip(join_all(calls).await) {
                if let Err(e) = result {
                    warn!(%lm, %nm, error = %e, "detach request failed");
                }
            }
        });
    }
    if let Some(plan) = removal.plan {
        broadcast_plan(ctx, &plan).await;
    }
}

pub async fn broadcast_plan(ctx: &SharedContext, plan: &ReconfigurePlan) {
    let event = ControlEvent::Reconfigure { generation: plan.generation };
    match publish_json(ctx.transport.as_ref(), &ctx.control_topic(), &event).await {
        Ok(()) => {
            let nms = plan.assignments.len();
            info!(generation = plan.generation, nms, "reconfigure broadcast");
        }
        Err(e) => error!(error = %e, "failed to broadcast reconfigure"),
    }
}

pub(crate) const EVENT_CHANNELS: [Channel; 3] =
    [Channel::Log, Channel::Violation, Channel::Heartbeat];

async fn unsubscribe_events(ctx: &SharedContext, address: &str) {
    for channel in EVENT_CHANNELS {
        if let Err(e) = ctx.transport.unsubscribe(&channel.topic(address)).await {
            debug!(%address, error = %e, "unsubscribe failed");
        }
    }
}
