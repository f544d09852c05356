//! Substation topology model
//!
//! A topology is loaded once from a JSON document and never changes shape.
//! Only the live values (switch states, meter readings) move, and only through
//! [`Topology::apply_snapshot`].

use crate::error::TopologyError;
use crate::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bus {
    pub id: String,
    #[serde(default, alias = "power_lines_in")]
    pub incoming_line_ids: Vec<String>,
    #[serde(default, alias = "power_lines_out")]
    pub outgoing_line_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerLine {
    pub id: String,
    pub i_max: f64,
    pub v_ref: f64,
    /// True iff the line crosses the boundary to a neighbouring substation.
    #[serde(default)]
    pub is_border: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwitchState {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Switch {
    pub id: String,
    pub bus_id: String,
    pub power_line_id: String,
    /// Unknown until the first snapshot carrying this switch.
    #[serde(skip)]
    pub state: Option<SwitchState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeterReading {
    pub current: f64,
    pub voltage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meter {
    pub id: String,
    pub bus_id: String,
    pub power_line_id: String,
    /// Static safety thresholds.
    pub s_current: f64,
    pub s_voltage: f64,
    #[serde(skip)]
    pub reading: Option<MeterReading>,
}

impl Meter {
    pub fn current(&self) -> Option<f64> {
        self.reading.map(|r| r.current)
    }

    pub fn voltage(&self) -> Option<f64> {
        self.reading.map(|r| r.voltage)
    }
}

/// Declarative form of a topology, as found in the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub buses: Vec<Bus>,
    #[serde(default)]
    pub power_lines: Vec<PowerLine>,
    #[serde(default)]
    pub switches: Vec<Switch>,
    #[serde(default)]
    pub meters: Vec<Meter>,
}

/// Validated topology with lookup indexes.
#[derive(Debug, Clone)]
pub struct Topology {
    config: TopologyConfig,
    line_index: HashMap<String, usize>,
    switch_index: HashMap<String, usize>,
    meter_index: HashMap<String, usize>,
}

impl Topology {
    pub fn from_json(document: &str) -> Result<Self, TopologyError> {
        let config: TopologyConfig = serde_json::from_str(document)?;
        Self::new(config)
    }

    pub fn new(config: TopologyConfig) -> Result<Self, TopologyError> {
        let bus_ids = unique_ids("bus", config.buses.iter().map(|b| b.id.as_str()))?;
        let line_index = index_of("power line", config.power_lines.iter().map(|l| l.id.as_str()))?;
        let switch_index = index_of("switch", config.switches.iter().map(|s| s.id.as_str()))?;
        let meter_index = index_of("meter", config.meters.iter().map(|m| m.id.as_str()))?;

        for bus in &config.buses {
            for line in bus.incoming_line_ids.iter().chain(&bus.outgoing_line_ids) {
                if !line_index.contains_key(line) {
                    return Err(TopologyError::UnknownLine {
                        kind: "bus",
                        id: bus.id.clone(),
                        line: line.clone(),
                    });
                }
            }
        }

        let attachments = config
            .switches
            .iter()
            .map(|s| ("switch", &s.id, &s.bus_id, &s.power_line_id))
            .chain(config.meters.iter().map(|m| ("meter", &m.id, &m.bus_id, &m.power_line_id)));
        for (kind, id, bus, line) in attachments {
            if !line_index.contains_key(line) {
                return Err(TopologyError::UnknownLine { kind, id: id.clone(), line: line.clone() });
            }
            if !bus_ids.contains(bus.as_str()) {
                return Err(TopologyError::UnknownBus { kind, id: id.clone(), bus: bus.clone() });
            }
        }

        Ok(Self { config, line_index, switch_index, meter_index })
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    pub fn buses(&self) -> &[Bus] {
        &self.config.buses
    }

    pub fn power_lines(&self) -> &[PowerLine] {
        &self.config.power_lines
    }

    pub fn switches(&self) -> &[Switch] {
        &self.config.switches
    }

    pub fn meters(&self) -> &[Meter] {
        &self.config.meters
    }

    pub fn power_line(&self, id: &str) -> Option<&PowerLine> {
        self.line_index.get(id).map(|&i| &self.config.power_lines[i])
    }

    pub fn switch(&self, id: &str) -> Option<&Switch> {
        self.switch_index.get(id).map(|&i| &self.config.switches[i])
    }

    pub fn meter(&self, id: &str) -> Option<&Meter> {
        self.meter_index.get(id).map(|&i| &self.config.meters[i])
    }

    /// Meters installed on `line_id`, in declaration order.
    pub fn meters_on_line<'a>(&'a self, line_id: &'a str) -> impl Iterator<Item = &'a Meter> + 'a {
        self.config.meters.iter().filter(move |m| m.power_line_id == line_id)
    }

    pub fn switches_on_line<'a>(
        &'a self,
        line_id: &'a str,
    ) -> impl Iterator<Item = &'a Switch> + 'a {
        self.config.switches.iter().filter(move |s| s.power_line_id == line_id)
    }

    pub fn meters_at_bus<'a>(&'a self, bus_id: &'a str) -> impl Iterator<Item = &'a Meter> + 'a {
        self.config.meters.iter().filter(move |m| m.bus_id == bus_id)
    }

    /// The meter measuring `line_id` at the `bus_id` end, if one is installed there.
    pub fn meter_at(&self, line_id: &str, bus_id: &str) -> Option<&Meter> {
        self.config
            .meters
            .iter()
            .find(|m| m.power_line_id == line_id && m.bus_id == bus_id)
    }

    /// Overwrites live values with the content of `snapshot`.
    ///
    /// Components missing from the snapshot lose their previous value so checks
    /// skip them instead of evaluating stale data.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) {
        for switch in &mut self.config.switches {
            switch.state = snapshot.switch_state(&switch.id);
        }
        for meter in &mut self.config.meters {
            meter.reading = snapshot.meter_reading(&meter.id);
        }
    }

    pub fn to_json(&self) -> Result<String, TopologyError> {
        Ok(serde_json::to_string(&self.config)?)
    }
}

fn unique_ids<'a>(
    kind: &'static str,
    ids: impl Iterator<Item = &'a str>,
) -> Result<HashSet<&'a str>, TopologyError> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(TopologyError::DuplicateId { kind, id: id.to_string() });
        }
    }
    Ok(seen)
}

fn index_of<'a>(
    kind: &'static str,
    ids: impl Iterator<Item = &'a str>,
) -> Result<HashMap<String, usize>, TopologyError> {
    let mut index = HashMap::new();
    for (position, id) in ids.enumerate() {
        if index.insert(id.to_string(), position).is_some() {
            return Err(TopologyError::DuplicateId { kind, id: id.to_string() });
        }
    }
    Ok(index)
}
