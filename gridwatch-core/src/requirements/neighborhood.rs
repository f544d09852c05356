//! Invariants checked by a Neighborhood Monitor across a border region.
//!
//! Readings for region components live in the snapshots of the two LMs that
//! share the region. A component is resolved against the snapshot of the LM
//! that declared it first and against the other one second, so an id present
//! in both snapshots is counted once.

use super::local::{readings_disagree, LINE_TOLERANCE};
use super::{Check, RequirementId, Violation};
use crate::border_region::{BorderRegion, RegionMeter, RegionSwitch};
use crate::snapshot::Snapshot;
use crate::topology::{MeterReading, SwitchState};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SideSnapshot {
    pub lm_id: String,
    pub snapshot: Arc<Snapshot>,
}

/// Input of the neighborhood scope: one region plus the latest snapshot of each side.
#[derive(Debug, Clone)]
pub struct NeighborhoodView {
    pub region: Arc<BorderRegion>,
    pub sides: [SideSnapshot; 2],
}

impl NeighborhoodView {
    fn ordered_for<'a>(&'a self, source_id: &'a str) -> impl Iterator<Item = &'a Snapshot> + 'a {
        let (own, other): (Vec<_>, Vec<_>) = self.sides.iter().partition(|s| s.lm_id == source_id);
        own.into_iter().chain(other).map(|s| s.snapshot.as_ref())
    }

    pub fn meter_reading(&self, meter: &RegionMeter) -> Option<MeterReading> {
        self.ordered_for(&meter.source_id)
            .find_map(|snapshot| snapshot.meter_reading(&meter.meter.id))
    }

    pub fn switch_state(&self, switch: &RegionSwitch) -> Option<SwitchState> {
        self.ordered_for(&switch.source_id)
            .find_map(|snapshot| snapshot.switch_state(&switch.switch.id))
    }

}

/// Input of the checks configured by sensor id: every snapshot an NM pulled
/// in one cycle, together with the regions they were pulled for.
///
/// Evaluated once per cycle, so a sensor seen through two regions sharing an
/// LM is checked once and stateful checks observe one reading per cycle.
#[derive(Debug, Clone, Default)]
pub struct SensorView {
    pub regions: Vec<Arc<BorderRegion>>,
    pub sides: Vec<SideSnapshot>,
}

impl SensorView {
    /// Reading of a meter id. A meter tagged by one of the regions is read from
    /// the LM that declared it first; other ids from the first side holding them.
    pub fn reading(&self, meter_id: &str) -> Option<MeterReading> {
        let tagged = self
            .regions
            .iter()
            .flat_map(|region| region.meters.iter())
            .find(|m| m.meter.id == meter_id);
        let own = tagged.and_then(|m| {
            self.sides
                .iter()
                .filter(|side| side.lm_id == m.source_id)
                .find_map(|side| side.snapshot.meter_reading(meter_id))
        });
        own.or_else(|| {
            self.sides
                .iter()
                .find_map(|side| side.snapshot.meter_reading(meter_id))
        })
    }
}

pub struct BorderOpenSwitch;

impl Check<NeighborhoodView> for BorderOpenSwitch {
    fn id(&self) -> RequirementId {
        RequirementId::OPEN_SWITCH_ZERO_CURRENT
    }

    fn name(&self) -> &'static str {
        "open_switch_zero_current"
    }

    fn evaluate(&mut self, view: &NeighborhoodView) -> Vec<Violation> {
        let region = &view.region;
        region
            .power_lines
            .iter()
            .filter(|line| {
                region
                    .switches_on_line(&line.id)
                    .any(|s| view.switch_state(s) == Some(SwitchState::Open))
            })
            .filter(|line| {
                region
                    .meters_on_line(&line.id)
                    .filter_map(|m| view.meter_reading(m))
                    .any(|r| r.current != 0.0)
            })
            .map(|line| Violation::new(self.id(), &line.id))
            .collect()
    }
}

pub struct BorderLineUniformity {
    pub tolerance: f64,
}

impl Default for BorderLineUniformity {
    fn default() -> Self {
        Self { tolerance: LINE_TOLERANCE }
    }
}

impl Check<NeighborhoodView> for BorderLineUniformity {
    fn id(&self) -> RequirementId {
        RequirementId::LINE_UNIFORMITY
    }

    fn name(&self) -> &'static str {
        "line_uniformity"
    }

    fn evaluate(&mut self, view: &NeighborhoodView) -> Vec<Violation> {
        let mut violations = Vec::new();
        for line in &view.region.power_lines {
            let readings: Option<Vec<(f64, f64)>> = view
                .region
                .meters_on_line(&line.id)
                .map(|m| view.meter_reading(m).map(|r| (r.current, r.voltage)))
                .collect();
            let Some(readings) = readings else { continue };
            if readings_disagree(&readings, self.tolerance) {
                violations.push(Violation::new(self.id(), &line.id));
            }
        }
        violations
    }
}
