//! Local Monitor
//!
//! Owns one substation topology. Every cycle it polls its sensor source,
//! applies the snapshot to the topology, runs the local requirement engine
//! and publishes what it found. Neighborhood Monitors attach to it (at most
//! two at a time) and pull the latest snapshot over RPC.

use crate::runtime::{self, Identity, Publisher, CYCLE_PERIOD, REGISTER_RETRY, VIOLATION_CAPACITY};
use crate::sensors::SensorSource;
use crate::usage::UsageSampler;
use anyhow::Context;
use gridwatch_core::contracts::{Channel, Role};
use gridwatch_core::queue::BoundedQueue;
use gridwatch_core::requirements::{RequirementEngine, Violation};
use gridwatch_core::rpc::{RpcClient, RpcMethod, RpcRequest, RpcResponse, RpcStatus};
use gridwatch_core::snapshot::Snapshot;
use gridwatch_core::state::{new_state, Shared};
use gridwatch_core::telemetry::LogQueue;
use gridwatch_core::transport::{Inbound, Inbox, SharedTransport, Transport};
use gridwatch_core::{Topology, TopologyError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const MAX_NM_SLOTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("no free NM slot")]
    Full,
    #[error("NM is not attached")]
    Unknown,
}

impl SlotError {
    pub fn status(self) -> RpcStatus {
        match self {
            SlotError::Full => RpcStatus::BadTooManyMonitors,
            SlotError::Unknown => RpcStatus::BadUnknownMonitor,
        }
    }
}

/// NMs currently attached to this LM, in attach order.
#[derive(Debug, Default)]
pub struct NmSlots {
    attached: Vec<Uuid>,
}

impl NmSlots {
    /// Returns `Ok(false)` if `id` already holds a slot.
    pub fn attach(&mut self, id: Uuid) -> Result<bool, SlotError> {
        if self.attached.contains(&id) {
            return Ok(false);
        }
        if self.attached.len() >= MAX_NM_SLOTS {
            return Err(SlotError::Full);
        }
        self.attached.push(id);
        Ok(true)
    }

    pub fn detach(&mut self, id: Uuid) -> Result<(), SlotError> {
        let before = self.attached.len();
        self.attached.retain(|a| *a != id);
        if self.attached.len() == before {
            return Err(SlotError::Unknown);
        }
        Ok(())
    }

    pub fn ids(&self) -> &[Uuid] {
        &self.attached
    }
}

struct LmState {
    topology: Topology,
    engine: RequirementEngine<Topology>,
    latest: Option<Arc<Snapshot>>,
    slots: NmSlots,
    violations: BoundedQueue<Violation>,
}

pub struct LocalMonitor {
    identity: Identity,
    topology_document: String,
    transport: SharedTransport,
    rpc: RpcClient,
    publisher: Publisher,
    state: Shared<LmState>,
    register_retry: Duration,
}

impl LocalMonitor {
    /// `topology_document` is validated here and sent verbatim to the C2.
    pub fn new(
        id: Uuid,
        address: impl Into<String>,
        c2_address: impl Into<String>,
        topology_document: String,
        engine: RequirementEngine<Topology>,
        transport: SharedTransport,
        logs: LogQueue,
    ) -> Result<Arc<Self>, TopologyError> {
        let topology = Topology::from_json(&topology_document)?;
        let identity = Identity {
            id,
            role: Role::Lm,
            address: address.into(),
            c2_address: c2_address.into(),
        };
        Ok(Arc::new(Self {
            rpc: RpcClient::new(transport.clone(), &identity.address),
            publisher: Publisher::new(identity.clone(), transport.clone(), logs),
            identity,
            topology_document,
            transport,
            state: new_state(LmState {
                topology,
                engine,
                latest: None,
                slots: NmSlots::default(),
                violations: BoundedQueue::new(VIOLATION_CAPACITY),
            }),
            register_retry: REGISTER_RETRY,
        }))
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn attached_nms(&self) -> Vec<Uuid> {
        self.state.lock().slots.ids().to_vec()
    }

    pub fn latest_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.state.lock().latest.clone()
    }

    /// Runs until the inbox closes.
    pub async fn run(
        self: Arc<Self>,
        inbox: Inbox,
        mut source: Box<dyn SensorSource>,
    ) -> anyhow::Result<()> {
        let topics = [
            self.identity.rpc_topic(),
            self.rpc.reply_topic().to_string(),
            self.identity.control_topic(),
        ];
        for topic in topics {
            self.transport
                .subscribe(&topic)
                .await
                .with_context(|| format!("failed to subscribe to {topic}"))?;
        }
        info!(
            id = %self.identity.id,
            address = %self.identity.address,
            source = %source.describe(),
            "LM started"
        );

        let mut dispatcher = tokio::spawn(self.clone().dispatch_loop(inbox));
        let registration = tokio::spawn(self.clone().register());
        let mut usage = UsageSampler::new();
        let mut tick = tokio::time::interval(CYCLE_PERIOD);

        loop {
            tokio::select! {
                _ = tick.tick() => self.cycle(source.as_mut(), &mut usage).await,
                _ = &mut dispatcher => break,
            }
        }

        registration.abort();
        warn!("inbox closed, LM stopping");
        Ok(())
    }

    async fn register(self: Arc<Self>) {
        let method = RpcMethod::RegisterLm {
            id: self.identity.id,
            address: self.identity.address.clone(),
            topology_config: self.topology_document.clone(),
        };
        let c2 = &self.identity.c2_address;
        match runtime::register_with_retry(&self.rpc, c2, method, self.register_retry).await {
            Ok(()) => info!(c2 = %self.identity.c2_address, "registered with C2"),
            Err(e) => error!(error = %e, "C2 refused registration"),
        }
    }

    /// One monitoring cycle. Failures are logged per step; the next step still runs.
    pub async fn cycle(&self, source: &mut dyn SensorSource, usage: &mut UsageSampler) {
        if let Err(e) = self.publisher.heartbeat().await {
            warn!(error = %e, "heartbeat not sent");
        }

        match source.read_snapshot().await {
            Ok(snapshot) => {
                let found = self.ingest(snapshot);
                if found > 0 {
                    debug!(found, "local requirements violated");
                }
                if let Err(e) = self.publisher.data_changed().await {
                    warn!(error = %e, "data change not announced");
                }
            }
            Err(e) => {
                let described = source.describe();
                warn!(source = %described, error = %e, "sensor poll failed, resetting source");
                if let Err(e) = source.reset().await {
                    error!(source = %source.describe(), error = %e, "sensor reset failed");
                }
            }
        }

        let violations = self.state.lock().violations.drain();
        if let Err(e) = self.publisher.violations(&violations).await {
            warn!(error = %e, count = violations.len(), "violations not published");
        }
        if let Err(e) = self.publisher.forward_logs().await {
            warn!(error = %e, "log records not forwarded");
        }
        if let Err(e) = self.publisher.usage(&usage.sample()).await {
            warn!(error = %e, "usage not published");
        }
    }

    /// Applies `snapshot` and evaluates the local requirements against it.
    /// Returns the number of violations queued.
    pub fn ingest(&self, snapshot: Snapshot) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.topology.apply_snapshot(&snapshot);
        state.latest = Some(Arc::new(snapshot));
        state.engine.evaluate_into(&state.topology, &mut state.violations)
    }

    async fn dispatch_loop(self: Arc<Self>, mut inbox: Inbox) {
        while let Some(message) = inbox.recv().await {
            self.dispatch(message).await;
        }
    }

    async fn dispatch(&self, message: Inbound) {
        if message.topic == self.rpc.reply_topic() {
            self.rpc.handle_response(&message.payload);
        } else if message.topic == self.identity.rpc_topic() {
            let answer = |request: &RpcRequest| self.answer(request);
            runtime::serve_request(&self.transport, &message.payload, answer).await;
        } else if let Some((_, Channel::Control)) = Channel::parse(&message.topic) {
            self.publisher.on_control(&message.payload);
        } else {
            debug!(topic = %message.topic, "ignored message");
        }
    }

    pub fn answer(&self, request: &RpcRequest) -> RpcResponse {
        match &request.method {
            RpcMethod::AttachNm { id } => {
                let outcome = self.state.lock().slots.attach(*id);
                match outcome {
                    Ok(true) => {
                        info!(nm = %id, "NM attached");
                        RpcResponse::good(request, None)
                    }
                    Ok(false) => RpcResponse::good(request, None),
                    Err(e) => {
                        warn!(nm = %id, error = %e, "NM attach refused");
                        RpcResponse::status(request, e.status())
                    }
                }
            }
            RpcMethod::DetachNm { id } => {
                let outcome = self.state.lock().slots.detach(*id);
                match outcome {
                    Ok(()) => {
                        info!(nm = %id, "NM detached");
                        RpcResponse::good(request, None)
                    }
                    Err(e) => RpcResponse::status(request, e.status()),
                }
            }
            RpcMethod::ReadSnapshot => match self.latest_snapshot() {
                Some(snapshot) => match serde_json::to_value(snapshot.as_ref()) {
                    Ok(value) => RpcResponse::good(request, Some(value)),
                    Err(e) => {
                        error!(error = %e, "cannot encode snapshot");
                        RpcResponse::status(request, RpcStatus::BadInternal)
                    }
                },
                None => RpcResponse::status(request, RpcStatus::BadNoData),
            },
            RpcMethod::Ping => RpcResponse::good(request, None),
            other => {
                debug!(method = other.name(), "unsupported on an LM");
                RpcResponse::status(request, RpcStatus::BadUnsupported)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::StaticSource;
    use gridwatch_core::contracts::{DataChanged, ReqViolationEvent};
    use gridwatch_core::requirements::{local_engine, CheckParams, RequirementId, DEFAULT_PROFILE};
    use gridwatch_core::telemetry::new_log_queue;
    use gridwatch_core::transport::{MemoryBus, Transport};
    use gridwatch_devkit::fixtures;

    fn request(method: RpcMethod) -> RpcRequest {
        RpcRequest {
            request_id: Uuid::new_v4().to_string(),
            reply_to: "test/rpc-reply@v1".into(),
            method,
        }
    }

    fn monitor(bus: &MemoryBus) -> Arc<LocalMonitor> {
        let (transport, _inbox) = bus.connect("lm");
        let id = Uuid::new_v4();
        LocalMonitor::new(
            id,
            format!("gridwatch/lm/{id}"),
            "gridwatch/c2",
            fixtures::substation_a_json(),
            local_engine(DEFAULT_PROFILE, &CheckParams::default()).unwrap(),
            transport,
            new_log_queue(),
        )
        .unwrap()
    }

    #[test]
    fn at_most_two_nms_hold_a_slot() {
        let mut slots = NmSlots::default();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(slots.attach(a), Ok(true));
        assert_eq!(slots.attach(a), Ok(false));
        assert_eq!(slots.attach(b), Ok(true));
        assert_eq!(slots.attach(c), Err(SlotError::Full));
        assert_eq!(slots.detach(c), Err(SlotError::Unknown));
        slots.detach(a).unwrap();
        assert_eq!(slots.attach(c), Ok(true));
        assert_eq!(slots.ids(), &[b, c]);
    }

    #[test]
    fn slot_errors_map_to_rpc_statuses() {
        let lm = monitor(&MemoryBus::new());
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids[..2] {
            let attach = request(RpcMethod::AttachNm { id: *id });
            assert_eq!(lm.answer(&attach).status, RpcStatus::Good);
        }
        assert_eq!(lm.answer(&request(RpcMethod::AttachNm { id: ids[0] })).status, RpcStatus::Good);
        let third = request(RpcMethod::AttachNm { id: ids[2] });
        assert_eq!(lm.answer(&third).status, RpcStatus::BadTooManyMonitors);
        let stranger = request(RpcMethod::DetachNm { id: ids[2] });
        assert_eq!(lm.answer(&stranger).status, RpcStatus::BadUnknownMonitor);
        assert_eq!(lm.attached_nms(), ids[..2].to_vec());
    }

    #[test]
    fn read_snapshot_needs_a_first_poll() {
        let lm = monitor(&MemoryBus::new());
        assert_eq!(lm.answer(&request(RpcMethod::ReadSnapshot)).status, RpcStatus::BadNoData);

        lm.ingest(fixtures::healthy_a().build());
        let response = lm.answer(&request(RpcMethod::ReadSnapshot));
        assert_eq!(response.status, RpcStatus::Good);
        let snapshot: Snapshot = serde_json::from_value(response.payload.unwrap()).unwrap();
        assert_eq!(snapshot.meter_reading("M1").unwrap().current, 100.0);

        let register = RpcMethod::RegisterNm { id: Uuid::new_v4(), address: "x".into() };
        assert_eq!(lm.answer(&request(register)).status, RpcStatus::BadUnsupported);
    }

    #[tokio::test]
    async fn cycle_publishes_data_and_violations() {
        let bus = MemoryBus::new();
        let lm = monitor(&bus);
        let address = lm.identity().address.clone();
        let (observer, mut observed) = bus.connect("observer");
        observer.subscribe(&format!("{address}/events/#")).await.unwrap();

        // 600 A into A1 but only 100 A out, and above the 550 A safety limit.
        let source = StaticSource::with(fixtures::healthy_a().current("M1", 600.0).build());
        let mut usage = UsageSampler::new();
        lm.cycle(&mut source.clone(), &mut usage).await;

        let mut violations = Vec::new();
        let mut data_changed = false;
        while let Ok(message) = observed.try_recv() {
            match Channel::parse(&message.topic) {
                Some((_, Channel::Violation)) => {
                    let event: ReqViolationEvent =
                        serde_json::from_slice(&message.payload).unwrap();
                    violations.push((event.requirement_id(), event.component_id));
                }
                Some((_, Channel::Data)) => {
                    let event: DataChanged = serde_json::from_slice(&message.payload).unwrap();
                    assert_eq!(event.address, address);
                    data_changed = true;
                }
                _ => {}
            }
        }
        assert!(data_changed);
        assert!(violations.contains(&(RequirementId::BUS_CURRENT_BALANCE, "A1".to_string())));
        assert!(violations.contains(&(RequirementId::SAFETY_CURRENT, "M1".to_string())));
    }

    #[tokio::test]
    async fn failed_poll_resets_the_source_and_keeps_the_last_snapshot() {
        let bus = MemoryBus::new();
        let lm = monitor(&bus);
        let (observer, mut observed) = bus.connect("observer");
        observer.subscribe(&Channel::Data.topic(&lm.identity().address)).await.unwrap();

        let source = StaticSource::with(fixtures::healthy_a().build());
        let mut usage = UsageSampler::new();
        lm.cycle(&mut source.clone(), &mut usage).await;
        assert!(observed.try_recv().is_ok());

        source.clear();
        lm.cycle(&mut source.clone(), &mut usage).await;
        assert_eq!(source.resets(), 1);
        assert!(observed.try_recv().is_err());
        assert!(lm.latest_snapshot().is_some());
    }
}
