//! Neighborhood Monitor
//!
//! Holds the border regions the C2 assigned to it. It attaches to every LM
//! on either side of a non-empty region, listens to their data channel and,
//! each cycle, evaluates the regions whose LMs published new data, using a
//! fresh snapshot pulled from both sides. Checks addressing sensors by id run
//! once per cycle over all snapshots pulled in it.

use crate::runtime::{
    self, Identity, Publisher, CYCLE_PERIOD, REGISTER_RETRY, VIOLATION_CAPACITY,
};
use crate::usage::UsageSampler;
use anyhow::Context;
use futures::future::join_all;
use gridwatch_core::contracts::{BorderRegionRecord, Channel, ControlEvent, NmAssignment, Role};
use gridwatch_core::queue::BoundedQueue;
use gridwatch_core::requirements::{
    NeighborhoodEngine, NeighborhoodView, SensorView, SideSnapshot, Violation,
};
use gridwatch_core::rpc::{RpcClient, RpcMethod, RpcRequest, RpcResponse, RpcStatus};
use gridwatch_core::snapshot::Snapshot;
use gridwatch_core::state::{new_state, Shared};
use gridwatch_core::telemetry::LogQueue;
use gridwatch_core::transport::{Inbound, Inbox, SharedTransport, Transport};
use gridwatch_core::RpcError;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct NmState {
    assignment: Arc<NmAssignment>,
    /// LM addresses that granted us a slot.
    attached: Vec<String>,
    /// LM addresses that announced new data since the last evaluation.
    pending: HashSet<String>,
    engine: NeighborhoodEngine,
    violations: BoundedQueue<Violation>,
    registered: bool,
}

pub struct NeighborhoodMonitor {
    identity: Identity,
    transport: SharedTransport,
    rpc: RpcClient,
    publisher: Publisher,
    state: Shared<NmState>,
    /// Serializes assignment refreshes and attach rounds.
    reconcile: tokio::sync::Mutex<()>,
    retry: Duration,
}

impl NeighborhoodMonitor {
    pub fn new(
        id: Uuid,
        address: impl Into<String>,
        c2_address: impl Into<String>,
        engine: NeighborhoodEngine,
        transport: SharedTransport,
        logs: LogQueue,
    ) -> Arc<Self> {
        let identity = Identity {
            id,
            role: Role::Nm,
            address: address.into(),
            c2_address: c2_address.into(),
        };
        Arc::new(Self {
            rpc: RpcClient::new(transport.clone(), &identity.address),
            publisher: Publisher::new(identity.clone(), transport.clone(), logs),
            state: new_state(NmState {
                assignment: Arc::new(NmAssignment { uuid: id, ..NmAssignment::default() }),
                attached: Vec::new(),
                pending: HashSet::new(),
                engine,
                violations: BoundedQueue::new(VIOLATION_CAPACITY),
                registered: false,
            }),
            identity,
            transport,
            reconcile: tokio::sync::Mutex::new(()),
            retry: REGISTER_RETRY,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn assignment(&self) -> Arc<NmAssignment> {
        self.state.lock().assignment.clone()
    }

    pub fn attached_lms(&self) -> Vec<String> {
        self.state.lock().attached.clone()
    }

    /// Runs until the inbox closes.
    pub async fn run(self: Arc<Self>, inbox: Inbox) -> anyhow::Result<()> {
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
        info!(id = %self.identity.id, address = %self.identity.address, "NM started");

        let mut dispatcher = tokio::spawn(self.clone().dispatch_loop(inbox));
        let registration = tokio::spawn(self.clone().register());
        let retries = tokio::spawn(self.clone().attach_retry_loop());
        let mut usage = UsageSampler::new();
        let mut tick = tokio::time::interval(CYCLE_PERIOD);

        loop {
            tokio::select! {
                _ = tick.tick() => self.cycle(&mut usage).await,
                _ = &mut dispatcher => break,
            }
        }

        registration.abort();
        retries.abort();
        warn!("inbox closed, NM stopping");
        Ok(())
    }

    async fn register(self: Arc<Self>) {
        let method = RpcMethod::RegisterNm {
            id: self.identity.id,
            address: self.identity.address.clone(),
        };
        let c2 = &self.identity.c2_address;
        if let Err(e) = runtime::register_with_retry(&self.rpc, c2, method, self.retry).await {
            error!(error = %e, "C2 refused registration");
            return;
        }
        info!(c2 = %self.identity.c2_address, "registered with C2");
        self.state.lock().registered = true;
        if let Err(e) = self.refresh().await {
            warn!(error = %e, "initial assignment not available");
        }
    }

    /// Re-attempts attaching to LMs that refused or did not answer.
    async fn attach_retry_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.retry);
        loop {
            tick.tick().await;
            let registered = self.state.lock().registered;
            if registered {
                self.reconcile().await;
            }
        }
    }

    /// Pulls the current assignment from the C2 and attaches/detaches to match it.
    pub async fn refresh(&self) -> Result<(), RpcError> {
        let _round = self.reconcile.lock().await;
        let method = RpcMethod::GetAssignment { id: self.identity.id };
        let assignment: NmAssignment =
            self.rpc.call_expect(&self.identity.c2_address, method).await?;
        let (generation, regions) = (assignment.generation, assignment.regions.len());
        {
            let mut state = self.state.lock();
            if generation < state.assignment.generation {
                let current = state.assignment.generation;
                debug!(generation, current, "stale assignment ignored");
                return Ok(());
            }
            state.assignment = Arc::new(assignment);
        }
        info!(generation, regions, "assignment updated");
        self.reconcile_locked().await;
        Ok(())
    }

    pub async fn reconcile(&self) {
        let _round = self.reconcile.lock().await;
        self.reconcile_locked().await;
    }

    async fn reconcile_locked(&self) {
        let (wanted, attached) = {
            let state = self.state.lock();
            (state.assignment.lm_addresses(), state.attached.clone())
        };
        for lm in attached.iter().filter(|lm| !wanted.contains(lm)) {
            self.detach(lm).await;
        }
        let missing: Vec<&String> = wanted.iter().filter(|lm| !attached.contains(lm)).collect();
        join_all(missing.into_iter().map(|lm| self.attach(lm))).await;
    }

    async fn attach(&self, lm: &str) -> bool {
        if let Err(e) = self.transport.subscribe(&Channel::Data.topic(lm)).await {
            warn!(%lm, error = %e, "cannot subscribe to LM data");
            return false;
        }
        match self.rpc.call_ok(lm, RpcMethod::AttachNm { id: self.identity.id }).await {
            Ok(_) => {
                let mut state = self.state.lock();
                if !state.attached.iter().any(|a| a == lm) {
                    state.attached.push(lm.to_string());
                }
                state.pending.insert(lm.to_string());
                drop(state);
                info!(%lm, "attached to LM");
                true
            }
            Err(e) => {
                warn!(%lm, error = %e, "attach failed, will retry");
                false
            }
        }
    }

    async fn detach(&self, lm: &str) {
        {
            let mut state = self.state.lock();
            state.attached.retain(|a| a != lm);
            state.pending.remove(lm);
        }
        if let Err(e) = self.transport.unsubscribe(&Channel::Data.topic(lm)).await {
            debug!(%lm, error = %e, "unsubscribe failed");
        }
        match self.rpc.call_ok(lm, RpcMethod::DetachNm { id: self.identity.id }).await {
            Ok(_) => info!(%lm, "detached from LM"),
            Err(e) => debug!(%lm, error = %e, "detach not acknowledged"),
        }
    }

    /// One monitoring cycle. Failures are logged per step; the next step still runs.
    pub async fn cycle(&self, usage: &mut UsageSampler) {
        if let Err(e) = self.publisher.heartbeat().await {
            warn!(error = %e, "heartbeat not sent");
        }

        let evaluated = self.evaluate_pending().await;
        if evaluated > 0 {
            debug!(evaluated, "border regions evaluated");
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

    /// Evaluates every non-empty region with at least one LM that published new
    /// data, then runs the sensor checks once over every snapshot pulled.
    /// Snapshots are pulled concurrently, once per LM; a region with a missing
    /// side is skipped. A violation found twice in one cycle is queued once.
    /// Returns the number of regions evaluated.
    pub async fn evaluate_pending(&self) -> usize {
        let (assignment, pending) = {
            let mut state = self.state.lock();
            (state.assignment.clone(), std::mem::take(&mut state.pending))
        };
        if pending.is_empty() {
            return 0;
        }

        let due: Vec<&BorderRegionRecord> = assignment
            .regions
            .iter()
            .filter(|r| !r.region.is_empty())
            .filter(|r| pending.contains(&r.lm_1_address) || pending.contains(&r.lm_2_address))
            .collect();
        let mut sources: Vec<(&str, Uuid)> = Vec::new();
        for record in &due {
            for (address, id) in [
                (record.lm_1_address.as_str(), record.lm_1_id),
                (record.lm_2_address.as_str(), record.lm_2_id),
            ] {
                if !sources.iter().any(|(known, _)| *known == address) {
                    sources.push((address, id));
                }
            }
        }
        let pulled = join_all(
            sources
                .iter()
                .map(|(lm, id)| async move { (*lm, *id, self.read_snapshot(lm).await) }),
        )
        .await;
        let sides: Vec<(&str, SideSnapshot)> = pulled
            .into_iter()
            .filter_map(|(lm, id, snapshot)| {
                snapshot.map(|snapshot| (lm, SideSnapshot { lm_id: id.to_string(), snapshot }))
            })
            .collect();
        let side_of = |address: &str| {
            sides
                .iter()
                .find(|(lm, _)| *lm == address)
                .map(|(_, side)| side.clone())
        };

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut found = Vec::new();
        let mut regions = Vec::with_capacity(due.len());
        let mut evaluated = 0;
        for record in due {
            let region = Arc::new(record.region.clone());
            regions.push(region.clone());
            let (Some(first), Some(second)) =
                (side_of(&record.lm_1_address), side_of(&record.lm_2_address))
            else {
                debug!(region = %record.uuid, "snapshot missing, region skipped");
                continue;
            };
            let view = NeighborhoodView { region, sides: [first, second] };
            found.extend(state.engine.regions.evaluate(&view));
            evaluated += 1;
        }
        if !sides.is_empty() && !state.engine.sensors.is_empty() {
            let view = SensorView {
                regions,
                sides: sides.into_iter().map(|(_, side)| side).collect(),
            };
            found.extend(state.engine.sensors.evaluate(&view));
        }

        let mut seen = HashSet::new();
        for violation in found {
            if seen.insert((violation.requirement, violation.component_id.clone())) {
                state.violations.push(violation);
            }
        }
        evaluated
    }

    async fn read_snapshot(&self, lm: &str) -> Option<Arc<Snapshot>> {
        match self.rpc.call_expect::<Snapshot>(lm, RpcMethod::ReadSnapshot).await {
            Ok(snapshot) => Some(Arc::new(snapshot)),
            Err(RpcError::Rejected { status: RpcStatus::BadNoData, .. }) => {
                debug!(%lm, "LM has no data yet");
                None
            }
            Err(e) => {
                warn!(%lm, error = %e, "snapshot pull failed");
                None
            }
        }
    }

    async fn dispatch_loop(self: Arc<Self>, mut inbox: Inbox) {
        while let Some(message) = inbox.recv().await {
            self.dispatch(message).await;
        }
    }

    async fn dispatch(self: &Arc<Self>, message: Inbound) {
        if message.topic == self.rpc.reply_topic() {
            self.rpc.handle_response(&message.payload);
            return;
        }
        if message.topic == self.identity.rpc_topic() {
            let answer = |request: &RpcRequest| self.answer(request);
            runtime::serve_request(&self.transport, &message.payload, answer).await;
            return;
        }
        match Channel::parse(&message.topic) {
            Some((_, Channel::Control)) => {
                let event = self.publisher.on_control(&message.payload);
                if let Some(ControlEvent::Reconfigure { generation }) = event {
                    debug!(generation, "reconfigure announced");
                    let nm = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = nm.refresh().await {
                            warn!(error = %e, "assignment refresh failed");
                        }
                    });
                }
            }
            Some((lm, Channel::Data)) => {
                let mut state = self.state.lock();
                if state.attached.iter().any(|a| a == lm) {
                    state.pending.insert(lm.to_string());
                }
            }
            _ => debug!(topic = %message.topic, "ignored message"),
        }
    }

    pub fn answer(&self, request: &RpcRequest) -> RpcResponse {
        match &request.method {
            RpcMethod::Ping => RpcResponse::good(request, None),
            other => {
                debug!(method = other.name(), "unsupported on an NM");
                RpcResponse::status(request, RpcStatus::BadUnsupported)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalMonitor;
    use gridwatch_core::border_region;
    use gridwatch_core::contracts::ReqViolationEvent;
    use gridwatch_core::requirements::domain::{CableEndsParams, CablePair};
    use gridwatch_core::requirements::{
        local_engine, neighborhood_engine, CheckParams, RequirementId, DEFAULT_PROFILE,
    };
    use gridwatch_core::telemetry::new_log_queue;
    use gridwatch_core::topology::Topology;
    use gridwatch_core::transport::MemoryBus;
    use gridwatch_devkit::fixtures;

    struct Pair {
        bus: MemoryBus,
        nm: Arc<NeighborhoodMonitor>,
        lms: [Arc<LocalMonitor>; 2],
    }

    fn local(bus: &MemoryBus, document: String) -> Arc<LocalMonitor> {
        let id = Uuid::new_v4();
        let (transport, _inbox) = bus.connect(format!("lm-{id}"));
        let engine = local_engine(DEFAULT_PROFILE, &CheckParams::default()).unwrap();
        let address = format!("gridwatch/lm/{id}");
        LocalMonitor::new(id, address, "gridwatch/c2", document, engine, transport, new_log_queue())
            .unwrap()
    }

    /// Answers the LM's RPCs without running its cycle, so tests drive the snapshots.
    async fn serve(bus: &MemoryBus, lm: &Arc<LocalMonitor>) {
        let (endpoint, mut inbox) = bus.connect(format!("serve-{}", lm.identity().id));
        endpoint.subscribe(&lm.identity().rpc_topic()).await.unwrap();
        let reply: SharedTransport = endpoint;
        let server = lm.clone();
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                runtime::serve_request(&reply, &message.payload, |r| server.answer(r)).await;
            }
        });
    }

    /// An NM on endpoint "nm" whose inbox is routed, without cycle or registration.
    async fn monitor(bus: &MemoryBus, engine: NeighborhoodEngine) -> Arc<NeighborhoodMonitor> {
        let nm_id = Uuid::new_v4();
        let (transport, mut inbox) = bus.connect("nm");
        let address = format!("gridwatch/nm/{nm_id}");
        let nm = NeighborhoodMonitor::new(
            nm_id,
            address,
            "gridwatch/c2",
            engine,
            transport.clone(),
            new_log_queue(),
        );
        transport.subscribe(nm.rpc.reply_topic()).await.unwrap();
        let router = nm.clone();
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                router.dispatch(message).await;
            }
        });
        nm
    }

    fn record(
        nm: Uuid,
        (lm_1, topology_1): (&LocalMonitor, &Topology),
        (lm_2, topology_2): (&LocalMonitor, &Topology),
    ) -> BorderRegionRecord {
        let (id_1, id_2) = (lm_1.identity().id, lm_2.identity().id);
        BorderRegionRecord {
            uuid: Uuid::new_v4(),
            lm_1_id: id_1,
            lm_2_id: id_2,
            lm_1_address: lm_1.identity().address.clone(),
            lm_2_address: lm_2.identity().address.clone(),
            owner_nm: nm,
            region: border_region::compute(
                &id_1.to_string(),
                topology_1,
                &id_2.to_string(),
                topology_2,
            ),
        }
    }

    fn assign(nm: &NeighborhoodMonitor, generation: u64, regions: Vec<BorderRegionRecord>) {
        let uuid = nm.identity().id;
        nm.state.lock().assignment = Arc::new(NmAssignment { uuid, generation, regions });
    }

    /// LMs A and B, and an NM whose assignment holds their border region.
    async fn pair() -> Pair {
        let bus = MemoryBus::new();
        let lms = [
            local(&bus, fixtures::substation_a_json()),
            local(&bus, fixtures::substation_b_json()),
        ];
        for lm in &lms {
            serve(&bus, lm).await;
        }
        let engine = neighborhood_engine(DEFAULT_PROFILE, &CheckParams::default()).unwrap();
        let nm = monitor(&bus, engine).await;

        let a = fixtures::substation_a().build().unwrap();
        let b = fixtures::substation_b().build().unwrap();
        let region = record(nm.identity().id, (&lms[0], &a), (&lms[1], &b));
        assign(&nm, 1, vec![region]);
        Pair { bus, nm, lms }
    }

    #[tokio::test]
    async fn attaches_to_both_sides_of_its_region() {
        let Pair { nm, lms, bus } = pair().await;
        nm.reconcile().await;
        assert_eq!(nm.attached_lms().len(), 2);
        for lm in &lms {
            assert_eq!(lm.attached_nms(), vec![nm.identity().id]);
            let data = Channel::Data.topic(&lm.identity().address);
            assert!(bus.subscriptions_of("nm").contains(&data));
        }

        assign(&nm, 2, vec![]);
        nm.reconcile().await;
        assert!(nm.attached_lms().is_empty());
        for lm in &lms {
            assert!(lm.attached_nms().is_empty());
        }
    }

    #[tokio::test]
    async fn region_is_evaluated_only_when_both_snapshots_exist() {
        let Pair { nm, lms, bus } = pair().await;
        nm.reconcile().await;

        // Only A has data: the region is due but skipped.
        lms[0].ingest(fixtures::healthy_a().build());
        assert_eq!(nm.evaluate_pending().await, 0);

        // Nothing new since: nothing is due.
        assert_eq!(nm.evaluate_pending().await, 0);

        // B's side of L7 reads 10 A against A's 40 A.
        lms[1].ingest(fixtures::healthy_b().current("M7B", 10.0).build());
        nm.state.lock().pending.insert(lms[1].identity().address.clone());
        let (observer, mut observed) = bus.connect("observer");
        let violations = Channel::Violation.topic(&nm.identity().address);
        observer.subscribe(&violations).await.unwrap();
        assert_eq!(nm.evaluate_pending().await, 1);
        nm.cycle(&mut UsageSampler::new()).await;

        let message = observed.recv().await.unwrap();
        let event: ReqViolationEvent = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(event.requirement_id(), RequirementId::LINE_UNIFORMITY);
        assert_eq!(event.component_id, "L7");
    }

    #[tokio::test]
    async fn middle_lm_of_a_chain_is_pulled_and_reported_once() {
        let bus = MemoryBus::new();
        let lms: Vec<Arc<LocalMonitor>> = [
            fixtures::substation_a_json(),
            fixtures::substation_b_json(),
            fixtures::substation_c_json(),
        ]
        .into_iter()
        .map(|document| local(&bus, document))
        .collect();
        for lm in &lms {
            serve(&bus, lm).await;
        }

        // L3 is metered at both ends inside B, so both regions see the pair.
        let params = CheckParams {
            enable: vec!["cable_ends".into()],
            cable_ends: Some(CableEndsParams {
                pairs: vec![CablePair {
                    cable: "L3".into(),
                    end_a: "M3".into(),
                    end_b: "M3X".into(),
                }],
                limit: 2.0,
            }),
            ..Default::default()
        };
        let nm = monitor(&bus, neighborhood_engine(DEFAULT_PROFILE, &params).unwrap()).await;
        let a = fixtures::substation_a().build().unwrap();
        let b = fixtures::substation_b().build().unwrap();
        let c = fixtures::substation_c().build().unwrap();
        let nm_id = nm.identity().id;
        let regions = vec![
            record(nm_id, (&lms[0], &a), (&lms[1], &b)),
            record(nm_id, (&lms[1], &b), (&lms[2], &c)),
        ];
        assign(&nm, 1, regions);
        nm.reconcile().await;
        assert_eq!(nm.attached_lms().len(), 3);

        lms[0].ingest(fixtures::healthy_a().build());
        lms[1].ingest(fixtures::healthy_b().current("M3X", 25.0).build());
        lms[2].ingest(fixtures::healthy_c().build());
        assert_eq!(nm.evaluate_pending().await, 2);
        assert_eq!(nm.state.lock().violations.len(), 0);

        // Both of B's border lines drift and the far end of L3 drops.
        let (observer, mut requests) = bus.connect("observer");
        observer.subscribe(&lms[1].identity().rpc_topic()).await.unwrap();
        let drifted = fixtures::healthy_b()
            .current("M7B", 10.0)
            .current("M9B", 5.0)
            .current("M3X", 5.0)
            .build();
        lms[1].ingest(drifted);
        nm.state.lock().pending.insert(lms[1].identity().address.clone());
        assert_eq!(nm.evaluate_pending().await, 2);

        let mut pulls = 0;
        while let Ok(message) = requests.try_recv() {
            let request = RpcRequest::decode(&message.payload).unwrap();
            if matches!(request.method, RpcMethod::ReadSnapshot) {
                pulls += 1;
            }
        }
        assert_eq!(pulls, 1);

        let mut found: Vec<(i32, String)> = nm
            .state
            .lock()
            .violations
            .drain()
            .into_iter()
            .map(|v| (v.requirement.0, v.component_id))
            .collect();
        found.sort();
        let expected = [(4, "L7"), (4, "L9"), (22, "L3")];
        assert_eq!(found, expected.map(|(id, c)| (id, c.to_string())).to_vec());
    }

    #[tokio::test]
    async fn data_from_unattached_lms_is_ignored() {
        let Pair { nm, lms, .. } = pair().await;
        let stranger = Inbound {
            topic: Channel::Data.topic(&lms[0].identity().address),
            payload: b"{}".to_vec(),
        };
        nm.dispatch(stranger).await;
        assert!(nm.state.lock().pending.is_empty());
    }
}
