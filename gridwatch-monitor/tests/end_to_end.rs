//! C2, two LMs and two NMs wired over the in-memory bus.

use gridwatch_coordinator::{service, C2Context, CoordinatorStatus, SharedContext};
use gridwatch_core::contracts::{lm_address, nm_address, Channel, ControlEvent, Role};
use gridwatch_core::requirements::{
    local_engine, neighborhood_engine, CheckParams, RequirementId, DEFAULT_PROFILE,
};
use gridwatch_core::telemetry::new_log_queue;
use gridwatch_devkit::{fixtures, TestHarness};
use gridwatch_monitor::{LocalMonitor, NeighborhoodMonitor, StaticSource};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const C2: &str = "gridwatch/c2";

struct Grid {
    harness: TestHarness,
    c2: SharedContext,
    lms: Vec<Arc<LocalMonitor>>,
    sources: Vec<StaticSource>,
    nms: Vec<Arc<NeighborhoodMonitor>>,
}

fn start_c2(harness: &TestHarness) -> SharedContext {
    let (transport, inbox) = harness.connect("c2");
    let ctx = C2Context::new(C2, transport);
    tokio::spawn(service::run(ctx.clone(), inbox));
    ctx
}

fn start_lm(harness: &TestHarness, document: String, source: StaticSource) -> Arc<LocalMonitor> {
    let id = Uuid::new_v4();
    let (transport, inbox) = harness.connect(&format!("lm-{id}"));
    let engine = local_engine(DEFAULT_PROFILE, &CheckParams::default()).unwrap();
    let lm = LocalMonitor::new(id, lm_address(id), C2, document, engine, transport, new_log_queue())
        .unwrap();
    tokio::spawn(lm.clone().run(inbox, Box::new(source)));
    lm
}

fn start_nm(harness: &TestHarness) -> Arc<NeighborhoodMonitor> {
    let id = Uuid::new_v4();
    let (transport, inbox) = harness.connect(&format!("nm-{id}"));
    let engine = neighborhood_engine(DEFAULT_PROFILE, &CheckParams::default()).unwrap();
    let nm = NeighborhoodMonitor::new(id, nm_address(id), C2, engine, transport, new_log_queue());
    tokio::spawn(nm.clone().run(inbox));
    nm
}

async fn start_grid() -> Grid {
    let harness = TestHarness::new();
    let c2 = start_c2(&harness);
    let sources = vec![
        StaticSource::with(fixtures::healthy_a().build()),
        StaticSource::with(fixtures::healthy_b().build()),
    ];
    let lms = vec![
        start_lm(&harness, fixtures::substation_a_json(), sources[0].clone()),
        start_lm(&harness, fixtures::substation_b_json(), sources[1].clone()),
    ];
    let nms = vec![start_nm(&harness), start_nm(&harness)];
    Grid { harness, c2, lms, sources, nms }
}

#[tokio::test(start_paused = true)]
async fn monitors_register_and_nms_attach_to_both_lms() {
    let grid = start_grid().await;
    let topic = Channel::Control.topic(C2);
    let mut control = grid.harness.observe("control", &[topic.as_str()]).await.unwrap();

    let first: ControlEvent = control.expect(&topic).await.unwrap();
    assert!(matches!(first, ControlEvent::Reconfigure { .. } | ControlEvent::IsRegistered { .. }));
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(grid.c2.status(), CoordinatorStatus::Running);
    {
        let c2 = grid.c2.coordinator.lock();
        assert_eq!(c2.registry().count(Role::Lm), 2);
        assert_eq!(c2.registry().count(Role::Nm), 2);
        assert_eq!(c2.reconfigurations(), 1);
    }
    let nm_ids: Vec<Uuid> = grid.nms.iter().map(|nm| nm.identity().id).collect();
    for nm in &grid.nms {
        let assignment = nm.assignment();
        assert_eq!(assignment.generation, 1);
        assert_eq!(assignment.regions.len(), 1);
        assert_eq!(assignment.regions[0].region.power_lines[0].id, "L7");
        assert_eq!(nm.attached_lms().len(), 2);
    }
    for lm in &grid.lms {
        let mut attached = lm.attached_nms();
        attached.sort();
        let mut expected = nm_ids.clone();
        expected.sort();
        assert_eq!(attached, expected);
    }
    // Healthy readings on both sides: nothing reported.
    assert!(grid.c2.reports.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn border_mismatch_reaches_the_c2_report_log() {
    let grid = start_grid().await;
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(grid.c2.status(), CoordinatorStatus::Running);

    // B now sees 10 A on L7 where A sends 40 A.
    grid.sources[1].set(fixtures::healthy_b().current("M7B", 10.0).build());
    tokio::time::sleep(Duration::from_secs(5)).await;

    let reports = grid.c2.reports.lock().newer_than(0.0);
    let border: Vec<_> = reports
        .iter()
        .filter(|r| r.requirement == RequirementId::LINE_UNIFORMITY.0 && r.component_id == "L7")
        .collect();
    assert!(!border.is_empty());
    // B's own bus no longer balances either.
    assert!(reports
        .iter()
        .any(|r| r.requirement == RequirementId::BUS_CURRENT_BALANCE.0 && r.component_id == "B1"));
}

#[tokio::test(start_paused = true)]
async fn silent_nm_is_removed_and_released_by_the_lms() {
    let grid = start_grid().await;
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(grid.c2.status(), CoordinatorStatus::Running);

    let dead = grid.nms[0].identity().id;
    let survivor = grid.nms[1].identity().id;
    grid.harness.bus().disconnect(&format!("nm-{dead}"));
    tokio::time::sleep(Duration::from_secs(20)).await;

    {
        let c2 = grid.c2.coordinator.lock();
        assert!(c2.registry().get(dead).is_none());
        assert_eq!(c2.registry().count(Role::Nm), 1);
        assert_eq!(c2.status(), CoordinatorStatus::WaitingForNm);
    }
    for lm in &grid.lms {
        assert_eq!(lm.attached_nms(), vec![survivor]);
    }
}
