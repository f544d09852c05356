//! Deployment profiles
//!
//! A profile names an ordered list of checks per scope. Checks are looked up
//! by name in a registry of constructors, so a deployment adds or removes a
//! check through its parameter file without touching the engine.
//!
//! The neighborhood scope has two registries: checks over one border region
//! and checks addressing sensors by id, which an NM runs once per cycle.

use super::domain::{
    BatteryParams, BatteryRate, BatteryStateOfCharge, CableEnds, CableEndsParams, CoilRatio,
    CoilRatioParams, FeedInGenerators, FeedInParams, HarmonicDistortion, SolarParams, SolarSanity,
    TapPositionHistory, TapPositionParams, ThdParams, TransformerCurrent, TransformerCurrentParams,
    TransformerVoltage, TransformerVoltageParams,
};
use super::local::{
    BusCurrentBalance, BusVoltageConsistency, LineUniformity, OpenSwitchZeroCurrent, SafetyCurrent,
    SafetyVoltage,
};
use super::neighborhood::{BorderLineUniformity, BorderOpenSwitch};
use super::{Check, NeighborhoodView, RequirementEngine, SensorView};
use crate::error::RequirementError;
use crate::topology::Topology;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PROFILE: &str = "grid";

/// Parameters of the deployment-specific checks, usually read from YAML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckParams {
    /// Checks appended to the profile's list.
    #[serde(default)]
    pub enable: Vec<String>,
    /// Checks removed from the profile's list.
    #[serde(default)]
    pub disable: Vec<String>,
    pub battery: Option<BatteryParams>,
    pub feed_in: Option<FeedInParams>,
    pub solar: Option<SolarParams>,
    pub transformer_current: Option<TransformerCurrentParams>,
    pub thd: Option<ThdParams>,
    pub transformer_voltage: Option<TransformerVoltageParams>,
    pub coil_ratio: Option<CoilRatioParams>,
    pub tap_position: Option<TapPositionParams>,
    pub cable_ends: Option<CableEndsParams>,
}

impl CheckParams {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }
}

type Factory<I> = fn(&CheckParams) -> Result<Box<dyn Check<I>>, RequirementError>;

fn section<T: Clone>(
    value: &Option<T>,
    check: &'static str,
    name: &'static str,
) -> Result<T, RequirementError> {
    value.clone().ok_or(RequirementError::MissingParams { check, section: name })
}

const LOCAL_CHECKS: &[(&str, Factory<Topology>)] = &[
    ("bus_current_balance", |_| Ok(Box::new(BusCurrentBalance::default()))),
    ("bus_voltage_consistency", |_| {
        Ok(Box::new(BusVoltageConsistency::default()))
    }),
    ("open_switch_zero_current", |_| Ok(Box::new(OpenSwitchZeroCurrent))),
    ("line_uniformity", |_| Ok(Box::new(LineUniformity::default()))),
    ("safety_current", |_| Ok(Box::new(SafetyCurrent))),
    ("safety_voltage", |_| Ok(Box::new(SafetyVoltage))),
    ("battery_state_of_charge", |p| {
        let params = section(&p.battery, "battery_state_of_charge", "battery")?;
        Ok(Box::new(BatteryStateOfCharge(params)))
    }),
    ("battery_rate", |p| {
        Ok(Box::new(BatteryRate(section(&p.battery, "battery_rate", "battery")?)))
    }),
    ("feed_in_generators", |p| {
        let params = section(&p.feed_in, "feed_in_generators", "feed_in")?;
        Ok(Box::new(FeedInGenerators(params)))
    }),
    ("solar_sanity", |p| {
        Ok(Box::new(SolarSanity(section(&p.solar, "solar_sanity", "solar")?)))
    }),
    ("transformer_current", |p| {
        Ok(Box::new(TransformerCurrent(section(
            &p.transformer_current,
            "transformer_current",
            "transformer_current",
        )?)))
    }),
    ("total_harmonic_distortion", |p| {
        let params = section(&p.thd, "total_harmonic_distortion", "thd")?;
        Ok(Box::new(HarmonicDistortion(params)))
    }),
    ("transformer_voltage", |p| {
        Ok(Box::new(TransformerVoltage(section(
            &p.transformer_voltage,
            "transformer_voltage",
            "transformer_voltage",
        )?)))
    }),
];

const REGION_CHECKS: &[(&str, Factory<NeighborhoodView>)] = &[
    ("open_switch_zero_current", |_| Ok(Box::new(BorderOpenSwitch))),
    ("line_uniformity", |_| Ok(Box::new(BorderLineUniformity::default()))),
];

const SENSOR_CHECKS: &[(&str, Factory<SensorView>)] = &[
    ("coil_ratio", |p| {
        Ok(Box::new(CoilRatio(section(&p.coil_ratio, "coil_ratio", "coil_ratio")?)))
    }),
    ("tap_position_history", |p| {
        Ok(Box::new(TapPositionHistory::new(section(
            &p.tap_position,
            "tap_position_history",
            "tap_position",
        )?)))
    }),
    ("cable_ends", |p| {
        Ok(Box::new(CableEnds(section(&p.cable_ends, "cable_ends", "cable_ends")?)))
    }),
];

const GRID_LOCAL: &[&str] = &[
    "bus_current_balance",
    "bus_voltage_consistency",
    "open_switch_zero_current",
    "line_uniformity",
    "safety_current",
    "safety_voltage",
];
const GRID_NEIGHBORHOOD: &[&str] = &["open_switch_zero_current", "line_uniformity"];

type ProfileLists = (Vec<&'static str>, Vec<&'static str>);

fn profile_lists(profile: &str) -> Result<ProfileLists, RequirementError> {
    let (extra_local, extra_neighborhood): (&[&str], &[&str]) = match profile {
        "grid" => (&[], &[]),
        "demkit" => (&["battery_state_of_charge", "battery_rate", "feed_in_generators"], &[]),
        "coteq" => (
            &[
                "solar_sanity",
                "transformer_current",
                "total_harmonic_distortion",
                "transformer_voltage",
            ],
            &["coil_ratio", "tap_position_history", "cable_ends"],
        ),
        other => return Err(RequirementError::UnknownProfile(other.to_string())),
    };
    Ok((
        GRID_LOCAL.iter().chain(extra_local).copied().collect(),
        GRID_NEIGHBORHOOD.iter().chain(extra_neighborhood).copied().collect(),
    ))
}

fn build<I>(
    registry: &[(&str, Factory<I>)],
    names: Vec<&'static str>,
    params: &CheckParams,
) -> Result<RequirementEngine<I>, RequirementError> {
    let mut names: Vec<String> = names.into_iter().map(str::to_string).collect();
    for extra in &params.enable {
        if registry.iter().any(|(name, _)| *name == extra.as_str()) && !names.contains(extra) {
            names.push(extra.clone());
        }
    }
    names.retain(|name| !params.disable.contains(name));

    let mut engine = RequirementEngine::new();
    for name in &names {
        let factory = registry
            .iter()
            .find(|(candidate, _)| *candidate == name.as_str())
            .map(|(_, factory)| factory)
            .ok_or_else(|| RequirementError::UnknownCheck(name.clone()))?;
        engine.push(factory(params)?);
    }
    Ok(engine)
}

fn registered<I>(registry: &[(&str, Factory<I>)], name: &str) -> bool {
    registry.iter().any(|(n, _)| *n == name)
}

fn ensure_known(params: &CheckParams) -> Result<(), RequirementError> {
    let known = |name: &String| {
        registered(LOCAL_CHECKS, name)
            || registered(REGION_CHECKS, name)
            || registered(SENSOR_CHECKS, name)
    };
    match params.enable.iter().chain(&params.disable).find(|name| !known(*name)) {
        Some(unknown) => Err(RequirementError::UnknownCheck(unknown.clone())),
        None => Ok(()),
    }
}

/// Engine run by an LM against its own topology.
pub fn local_engine(
    profile: &str,
    params: &CheckParams,
) -> Result<RequirementEngine<Topology>, RequirementError> {
    ensure_known(params)?;
    let (local, _) = profile_lists(profile)?;
    build(LOCAL_CHECKS, local, params)
}

/// The checks of an NM.
pub struct NeighborhoodEngine {
    /// Run once per due border region.
    pub regions: RequirementEngine<NeighborhoodView>,
    /// Run once per cycle over every snapshot pulled in that cycle.
    pub sensors: RequirementEngine<SensorView>,
}

impl NeighborhoodEngine {
    pub fn check_names(&self) -> Vec<&'static str> {
        let mut names = self.regions.check_names();
        names.extend(self.sensors.check_names());
        names
    }

    pub fn len(&self) -> usize {
        self.regions.len() + self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn neighborhood_engine(
    profile: &str,
    params: &CheckParams,
) -> Result<NeighborhoodEngine, RequirementError> {
    ensure_known(params)?;
    let (_, neighborhood) = profile_lists(profile)?;
    let (regions, sensors): (Vec<&'static str>, Vec<&'static str>) =
        neighborhood.into_iter().partition(|name| registered(REGION_CHECKS, name));
    Ok(NeighborhoodEngine {
        regions: build(REGION_CHECKS, regions, params)?,
        sensors: build(SENSOR_CHECKS, sensors, params)?,
    })
}
