//! Deployment-specific checks.
//!
//! These address individual sensors by id, so every one of them needs a
//! parameter section in [`CheckParams`](super::CheckParams). Thresholds depend
//! on the installation and have no default: a section without them does not
//! parse.
//!
//! The neighborhood ones run once per NM cycle over a [`SensorView`].
//!
//! Some probes reuse the meter value slots: battery meters report their state
//! of charge in `voltage` and their charge rate in `current` (positive while
//! charging); THD probes report distortion in percent in `current`.

use super::{Check, RequirementId, SensorView, Violation};
use crate::topology::{MeterReading, Topology};
use serde::{Deserialize, Serialize};

fn reading_of(topology: &Topology, id: &str) -> Option<MeterReading> {
    topology.meter(id).and_then(|m| m.reading)
}

/// Violations for every listed meter whose reading satisfies `breached`.
fn flag_meters(
    requirement: RequirementId,
    ids: &[String],
    mut lookup: impl FnMut(&str) -> Option<MeterReading>,
    breached: impl Fn(MeterReading) -> bool,
) -> Vec<Violation> {
    ids.iter()
        .filter(|id| lookup(id.as_str()).is_some_and(&breached))
        .map(|id| Violation::new(requirement, id))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryParams {
    pub meters: Vec<String>,
    pub soc_min: f64,
    pub soc_max: f64,
    pub max_rate: f64,
}

/// State of charge stays in bounds. A full battery does not charge and an
/// empty one does not discharge.
pub struct BatteryStateOfCharge(pub BatteryParams);

impl Check<Topology> for BatteryStateOfCharge {
    fn id(&self) -> RequirementId {
        RequirementId::BATTERY_STATE_OF_CHARGE
    }

    fn name(&self) -> &'static str {
        "battery_state_of_charge"
    }

    fn evaluate(&mut self, topology: &Topology) -> Vec<Violation> {
        let p = &self.0;
        flag_meters(self.id(), &p.meters, |id| reading_of(topology, id), |r| {
            let (soc, rate) = (r.voltage, r.current);
            soc < p.soc_min
                || soc > p.soc_max
                || (soc >= p.soc_max && rate > 0.0)
                || (soc <= p.soc_min && rate < 0.0)
        })
    }
}

pub struct BatteryRate(pub BatteryParams);

impl Check<Topology> for BatteryRate {
    fn id(&self) -> RequirementId {
        RequirementId::BATTERY_RATE
    }

    fn name(&self) -> &'static str {
        "battery_rate"
    }

    fn evaluate(&mut self, topology: &Topology) -> Vec<Violation> {
        let max = self.0.max_rate;
        flag_meters(self.id(), &self.0.meters, |id| reading_of(topology, id), |r| {
            r.current.abs() > max
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedInParams {
    /// Meters allowed to push power back into the grid.
    pub generators: Vec<String>,
}

/// Negative current (feed-in) only on generator connections.
pub struct FeedInGenerators(pub FeedInParams);

impl Check<Topology> for FeedInGenerators {
    fn id(&self) -> RequirementId {
        RequirementId::FEED_IN_GENERATORS
    }

    fn name(&self) -> &'static str {
        "feed_in_generators"
    }

    fn evaluate(&mut self, topology: &Topology) -> Vec<Violation> {
        topology
            .meters()
            .iter()
            .filter(|m| m.current().is_some_and(|c| c < 0.0))
            .filter(|m| !self.0.generators.contains(&m.id))
            .map(|m| Violation::new(self.id(), &m.id))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolarParams {
    pub meters: Vec<String>,
}

/// A solar plant never reports a negative voltage.
pub struct SolarSanity(pub SolarParams);

impl Check<Topology> for SolarSanity {
    fn id(&self) -> RequirementId {
        RequirementId::SOLAR_SANITY
    }

    fn name(&self) -> &'static str {
        "solar_sanity"
    }

    fn evaluate(&mut self, topology: &Topology) -> Vec<Violation> {
        flag_meters(self.id(), &self.0.meters, |id| reading_of(topology, id), |r| r.voltage < 0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerCurrentParams {
    pub lv_meters: Vec<String>,
    pub lv_limit: f64,
    pub mv_meters: Vec<String>,
    pub mv_limit: f64,
}

pub struct TransformerCurrent(pub TransformerCurrentParams);

impl Check<Topology> for TransformerCurrent {
    fn id(&self) -> RequirementId {
        RequirementId::TRANSFORMER_CURRENT
    }

    fn name(&self) -> &'static str {
        "transformer_current"
    }

    fn evaluate(&mut self, topology: &Topology) -> Vec<Violation> {
        let p = &self.0;
        let lookup = |id: &str| reading_of(topology, id);
        let mut found = flag_meters(self.id(), &p.lv_meters, lookup, |r| r.current > p.lv_limit);
        found.extend(flag_meters(self.id(), &p.mv_meters, lookup, |r| {
            r.current > p.mv_limit
        }));
        found
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThdParams {
    pub meters: Vec<String>,
    /// Percent.
    pub limit: f64,
}

pub struct HarmonicDistortion(pub ThdParams);

impl Check<Topology> for HarmonicDistortion {
    fn id(&self) -> RequirementId {
        RequirementId::HARMONIC_DISTORTION
    }

    fn name(&self) -> &'static str {
        "total_harmonic_distortion"
    }

    fn evaluate(&mut self, topology: &Topology) -> Vec<Violation> {
        let limit = self.0.limit;
        flag_meters(self.id(), &self.0.meters, |id| reading_of(topology, id), |r| r.current > limit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerVoltageParams {
    pub lv_meters: Vec<String>,
    pub lv_min: f64,
    pub lv_max: f64,
    pub mv_meters: Vec<String>,
    pub mv_min: f64,
    pub mv_max: f64,
}

pub struct TransformerVoltage(pub TransformerVoltageParams);

impl Check<Topology> for TransformerVoltage {
    fn id(&self) -> RequirementId {
        RequirementId::TRANSFORMER_VOLTAGE
    }

    fn name(&self) -> &'static str {
        "transformer_voltage"
    }

    fn evaluate(&mut self, topology: &Topology) -> Vec<Violation> {
        let p = &self.0;
        let lookup = |id: &str| reading_of(topology, id);
        let mut found = flag_meters(self.id(), &p.lv_meters, lookup, |r| {
            r.voltage < p.lv_min || r.voltage > p.lv_max
        });
        found.extend(flag_meters(self.id(), &p.mv_meters, lookup, |r| {
            r.voltage < p.mv_min || r.voltage > p.mv_max
        }));
        found
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoilRatioParams {
    pub mv_meter: String,
    /// One meter per low-voltage phase.
    pub lv_meters: Vec<String>,
    pub min_ratio: f64,
    pub max_ratio: f64,
}

fn rms(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v * v, n + 1));
    (n > 0).then(|| (sum / n as f64).sqrt())
}

/// Across a transformer the voltage ratio is the inverse of the current ratio.
/// The check compares `(v_mv / v_lv) / (i_lv / i_mv)` against
/// `[min_ratio, max_ratio]`, low-voltage values being the RMS over the phases.
pub struct CoilRatio(pub CoilRatioParams);

impl Check<SensorView> for CoilRatio {
    fn id(&self) -> RequirementId {
        RequirementId::COIL_RATIO
    }

    fn name(&self) -> &'static str {
        "coil_ratio"
    }

    fn evaluate(&mut self, view: &SensorView) -> Vec<Violation> {
        let p = &self.0;
        let Some(mv) = view.reading(&p.mv_meter) else {
            return Vec::new();
        };
        let phases: Option<Vec<MeterReading>> =
            p.lv_meters.iter().map(|id| view.reading(id)).collect();
        let Some(phases) = phases else { return Vec::new() };
        let (Some(i_lv), Some(v_lv)) = (
            rms(phases.iter().map(|r| r.current)),
            rms(phases.iter().map(|r| r.voltage)),
        ) else {
            return Vec::new();
        };
        if mv.current == 0.0 || i_lv == 0.0 || v_lv == 0.0 {
            return Vec::new();
        }
        let ratio = (mv.voltage / v_lv) / (i_lv / mv.current);
        if ratio < p.min_ratio || ratio > p.max_ratio {
            vec![Violation::new(self.id(), &p.mv_meter)]
        } else {
            Vec::new()
        }
    }
}

fn default_max_step() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TapPositionParams {
    /// Meter on the medium-voltage side of the tap changer.
    pub meter: String,
    /// Medium-voltage level of each tap position, in order.
    pub positions: Vec<f64>,
    pub tolerance: f64,
    #[serde(default = "default_max_step")]
    pub max_step: usize,
}

/// A tap changer moves one position at a time. Remembers the last position seen.
pub struct TapPositionHistory {
    params: TapPositionParams,
    last: Option<usize>,
}

impl TapPositionHistory {
    pub fn new(params: TapPositionParams) -> Self {
        Self { params, last: None }
    }

    fn position_of(&self, voltage: f64) -> Option<usize> {
        self.params
            .positions
            .iter()
            .enumerate()
            .filter(|(_, p)| (voltage - **p).abs() <= self.params.tolerance)
            .min_by(|(_, a), (_, b)| {
                (voltage - **a).abs().total_cmp(&(voltage - **b).abs())
            })
            .map(|(i, _)| i)
    }
}

impl Check<SensorView> for TapPositionHistory {
    fn id(&self) -> RequirementId {
        RequirementId::TAP_POSITION
    }

    fn name(&self) -> &'static str {
        "tap_position_history"
    }

    fn evaluate(&mut self, view: &SensorView) -> Vec<Violation> {
        let Some(reading) = view.reading(&self.params.meter) else {
            return Vec::new();
        };
        let Some(position) = self.position_of(reading.voltage) else {
            return Vec::new();
        };
        let previous = self.last.replace(position);
        match previous {
            Some(before) if before.abs_diff(position) > self.params.max_step => {
                vec![Violation::new(self.id(), &self.params.meter)]
            }
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CablePair {
    /// Component id reported on violation, usually the power line.
    pub cable: String,
    pub end_a: String,
    pub end_b: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CableEndsParams {
    pub pairs: Vec<CablePair>,
    pub limit: f64,
}

/// The two ends of one cable carry the same current.
pub struct CableEnds(pub CableEndsParams);

impl Check<SensorView> for CableEnds {
    fn id(&self) -> RequirementId {
        RequirementId::CABLE_ENDS
    }

    fn name(&self) -> &'static str {
        "cable_ends"
    }

    fn evaluate(&mut self, view: &SensorView) -> Vec<Violation> {
        let limit = self.0.limit;
        self.0
            .pairs
            .iter()
            .filter(|pair| match (view.reading(&pair.end_a), view.reading(&pair.end_b)) {
                (Some(a), Some(b)) => (a.current - b.current).abs() > limit,
                _ => false,
            })
            .map(|pair| Violation::new(self.id(), &pair.cable))
            .collect()
    }
}
