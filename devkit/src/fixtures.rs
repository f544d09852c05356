/*!
Topology and snapshot fixtures

Three small substations wired in a chain:

```text
  A (bus A1) --L7-- B (bus B1) --L9-- C (bus C1)
```

`L7` and `L9` are border lines declared identically on both sides. Every
line carries a meter at each end the substation owns; `L2` and both border
lines carry a switch.
*/

use gridwatch_core::snapshot::{MeterSample, Snapshot, SwitchSample};
use gridwatch_core::topology::{Bus, Meter, PowerLine, Switch, SwitchState, TopologyConfig};
use gridwatch_core::{Topology, TopologyError};

pub const SAFE_CURRENT: f64 = 550.0;
pub const SAFE_VOLTAGE: f64 = 250.0;
pub const NOMINAL_VOLTAGE: f64 = 230.0;

/// Fluent builder for topology documents.
#[derive(Debug, Default, Clone)]
pub struct TopologyBuilder {
    config: TopologyConfig,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bus(mut self, id: &str, incoming: &[&str], outgoing: &[&str]) -> Self {
        self.config.buses.push(Bus {
            id: id.to_string(),
            incoming_line_ids: incoming.iter().map(|s| s.to_string()).collect(),
            outgoing_line_ids: outgoing.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    pub fn line(self, id: &str) -> Self {
        self.line_with(id, 400.0, false)
    }

    pub fn border_line(self, id: &str) -> Self {
        self.line_with(id, 400.0, true)
    }

    pub fn line_with(mut self, id: &str, i_max: f64, is_border: bool) -> Self {
        self.config.power_lines.push(PowerLine {
            id: id.to_string(),
            i_max,
            v_ref: NOMINAL_VOLTAGE,
            is_border,
        });
        self
    }

    pub fn meter(mut self, id: &str, bus: &str, line: &str) -> Self {
        self.config.meters.push(Meter {
            id: id.to_string(),
            bus_id: bus.to_string(),
            power_line_id: line.to_string(),
            s_current: SAFE_CURRENT,
            s_voltage: SAFE_VOLTAGE,
            reading: None,
        });
        self
    }

    pub fn switch(mut self, id: &str, bus: &str, line: &str) -> Self {
        self.config.switches.push(Switch {
            id: id.to_string(),
            bus_id: bus.to_string(),
            power_line_id: line.to_string(),
            state: None,
        });
        self
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    /// JSON document as an LM sends it on registration.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.config).unwrap_or_default()
    }

    pub fn build(self) -> Result<Topology, TopologyError> {
        Topology::new(self.config)
    }
}

/// Fluent builder for sensor snapshots.
#[derive(Debug, Default, Clone)]
pub struct SnapshotBuilder {
    switches: Vec<SwitchSample>,
    meters: Vec<MeterSample>,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn closed(self, id: &str) -> Self {
        self.switch(id, SwitchState::Closed)
    }

    pub fn open(self, id: &str) -> Self {
        self.switch(id, SwitchState::Open)
    }

    pub fn switch(mut self, id: &str, state: SwitchState) -> Self {
        self.switches.retain(|s| s.id != id);
        self.switches.push(SwitchSample { id: id.to_string(), state });
        self
    }

    /// Reading at nominal voltage.
    pub fn current(self, id: &str, current: f64) -> Self {
        self.meter(id, current, NOMINAL_VOLTAGE)
    }

    pub fn meter(mut self, id: &str, current: f64, voltage: f64) -> Self {
        self.meters.retain(|m| m.id != id);
        self.meters.push(MeterSample { id: id.to_string(), current, voltage });
        self
    }

    pub fn build(self) -> Snapshot {
        Snapshot::stamped_now(self.switches, self.meters)
    }
}

pub fn substation_a() -> TopologyBuilder {
    TopologyBuilder::new()
        .line("L1")
        .line("L2")
        .border_line("L7")
        .bus("A1", &["L1"], &["L2", "L7"])
        .meter("M1", "A1", "L1")
        .meter("M2", "A1", "L2")
        .meter("M7A", "A1", "L7")
        .switch("S2", "A1", "L2")
        .switch("S7A", "A1", "L7")
}

pub fn substation_b() -> TopologyBuilder {
    TopologyBuilder::new()
        .border_line("L7")
        .line("L3")
        .border_line("L9")
        .bus("B1", &["L7"], &["L3", "L9"])
        .meter("M7B", "B1", "L7")
        .meter("M3", "B1", "L3")
        .meter("M9B", "B1", "L9")
        .switch("S7B", "B1", "L7")
        .switch("S9B", "B1", "L9")
}

pub fn substation_c() -> TopologyBuilder {
    TopologyBuilder::new()
        .border_line("L9")
        .line("L4")
        .bus("C1", &["L9"], &["L4"])
        .meter("M9C", "C1", "L9")
        .meter("M4", "C1", "L4")
}

pub fn substation_a_json() -> String {
    substation_a().to_json()
}

pub fn substation_b_json() -> String {
    substation_b().to_json()
}

pub fn substation_c_json() -> String {
    substation_c().to_json()
}

/// 100 A in on L1, split 60/40 between L2 and the border line.
pub fn healthy_a() -> SnapshotBuilder {
    SnapshotBuilder::new()
        .closed("S2")
        .closed("S7A")
        .current("M1", 100.0)
        .current("M2", 60.0)
        .current("M7A", 40.0)
}

/// The 40 A arriving over L7 leave as 25 A on L3 and 15 A on L9.
pub fn healthy_b() -> SnapshotBuilder {
    SnapshotBuilder::new()
        .closed("S7B")
        .closed("S9B")
        .current("M7B", 40.0)
        .current("M3", 25.0)
        .current("M9B", 15.0)
}

pub fn healthy_c() -> SnapshotBuilder {
    SnapshotBuilder::new().current("M9C", 15.0).current("M4", 15.0)
}
