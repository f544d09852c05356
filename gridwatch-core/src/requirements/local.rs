//! Grid invariants checked by a Local Monitor against its own topology.
//!
//! Line-level checks skip border lines: those are evaluated once per
//! neighborhood by the NM that holds both ends.

use super::{within, Check, RequirementId, Violation};
use crate::topology::{Bus, SwitchState, Topology};

pub const BUS_CURRENT_TOLERANCE: f64 = 0.1;
pub const VOLTAGE_TOLERANCE: f64 = 0.05;
pub const LINE_TOLERANCE: f64 = 0.05;

/// Kirchhoff: what flows into a bus flows out of it.
pub struct BusCurrentBalance {
    pub tolerance: f64,
}

impl Default for BusCurrentBalance {
    fn default() -> Self {
        Self { tolerance: BUS_CURRENT_TOLERANCE }
    }
}

/// Sum of the currents measured at `bus`'s end of `lines`.
/// `None` if an installed meter has no reading this cycle.
fn current_sum(topology: &Topology, bus: &Bus, lines: &[String]) -> Option<f64> {
    let mut sum = 0.0;
    for line in lines {
        if let Some(meter) = topology.meter_at(line, &bus.id) {
            sum += meter.current()?;
        }
    }
    Some(sum)
}

impl Check<Topology> for BusCurrentBalance {
    fn id(&self) -> RequirementId {
        RequirementId::BUS_CURRENT_BALANCE
    }

    fn name(&self) -> &'static str {
        "bus_current_balance"
    }

    fn evaluate(&mut self, topology: &Topology) -> Vec<Violation> {
        topology
            .buses()
            .iter()
            .filter_map(|bus| {
                let incoming = current_sum(topology, bus, &bus.incoming_line_ids)?;
                let outgoing = current_sum(topology, bus, &bus.outgoing_line_ids)?;
                (!within(incoming, outgoing, self.tolerance))
                    .then(|| Violation::new(self.id(), &bus.id))
            })
            .collect()
    }
}

/// Every meter on a bus sees the same voltage as the first one.
pub struct BusVoltageConsistency {
    pub tolerance: f64,
}

impl Default for BusVoltageConsistency {
    fn default() -> Self {
        Self { tolerance: VOLTAGE_TOLERANCE }
    }
}

impl Check<Topology> for BusVoltageConsistency {
    fn id(&self) -> RequirementId {
        RequirementId::BUS_VOLTAGE_CONSISTENCY
    }

    fn name(&self) -> &'static str {
        "bus_voltage_consistency"
    }

    fn evaluate(&mut self, topology: &Topology) -> Vec<Violation> {
        let mut violations = Vec::new();
        for bus in topology.buses() {
            let voltages: Option<Vec<f64>> =
                topology.meters_at_bus(&bus.id).map(|m| m.voltage()).collect();
            let Some(voltages) = voltages else { continue };
            let Some((&reference, rest)) = voltages.split_first() else { continue };
            if rest.iter().any(|&v| !within(v, reference, self.tolerance)) {
                violations.push(Violation::new(self.id(), &bus.id));
            }
        }
        violations
    }
}

/// An open switch means no current on its line. Compared exactly.
pub struct OpenSwitchZeroCurrent;

impl Check<Topology> for OpenSwitchZeroCurrent {
    fn id(&self) -> RequirementId {
        RequirementId::OPEN_SWITCH_ZERO_CURRENT
    }

    fn name(&self) -> &'static str {
        "open_switch_zero_current"
    }

    fn evaluate(&mut self, topology: &Topology) -> Vec<Violation> {
        topology
            .power_lines()
            .iter()
            .filter(|line| !line.is_border)
            .filter(|line| {
                topology
                    .switches_on_line(&line.id)
                    .any(|s| s.state == Some(SwitchState::Open))
            })
            .filter(|line| {
                topology
                    .meters_on_line(&line.id)
                    .filter_map(|m| m.current())
                    .any(|current| current != 0.0)
            })
            .map(|line| Violation::new(self.id(), &line.id))
            .collect()
    }
}

/// All meters of a line agree on current and voltage with the first one.
pub struct LineUniformity {
    pub tolerance: f64,
}

impl Default for LineUniformity {
    fn default() -> Self {
        Self { tolerance: LINE_TOLERANCE }
    }
}

/// Shared by the local and the neighborhood variants.
pub(crate) fn readings_disagree(readings: &[(f64, f64)], tolerance: f64) -> bool {
    let Some((&(ref_current, ref_voltage), rest)) = readings.split_first() else {
        return false;
    };
    rest.iter().any(|&(current, voltage)| {
        !within(current, ref_current, tolerance) || !within(voltage, ref_voltage, tolerance)
    })
}

impl Check<Topology> for LineUniformity {
    fn id(&self) -> RequirementId {
        RequirementId::LINE_UNIFORMITY
    }

    fn name(&self) -> &'static str {
        "line_uniformity"
    }

    fn evaluate(&mut self, topology: &Topology) -> Vec<Violation> {
        let mut violations = Vec::new();
        for line in topology.power_lines().iter().filter(|l| !l.is_border) {
            let readings: Option<Vec<(f64, f64)>> = topology
                .meters_on_line(&line.id)
                .map(|m| m.reading.map(|r| (r.current, r.voltage)))
                .collect();
            let Some(readings) = readings else { continue };
            if readings_disagree(&readings, self.tolerance) {
                violations.push(Violation::new(self.id(), &line.id));
            }
        }
        violations
    }
}

/// Every meter's current stays strictly below its `s_current`.
pub struct SafetyCurrent;

impl Check<Topology> for SafetyCurrent {
    fn id(&self) -> RequirementId {
        RequirementId::SAFETY_CURRENT
    }

    fn name(&self) -> &'static str {
        "safety_current"
    }

    fn evaluate(&mut self, topology: &Topology) -> Vec<Violation> {
        topology
            .meters()
            .iter()
            .filter(|m| m.current().is_some_and(|c| c >= m.s_current))
            .map(|m| Violation::new(self.id(), &m.id))
            .collect()
    }
}

/// Every meter's voltage stays strictly below its `s_voltage`.
pub struct SafetyVoltage;

impl Check<Topology> for SafetyVoltage {
    fn id(&self) -> RequirementId {
        RequirementId::SAFETY_VOLTAGE
    }

    fn name(&self) -> &'static str {
        "safety_voltage"
    }

    fn evaluate(&mut self, topology: &Topology) -> Vec<Violation> {
        topology
            .meters()
            .iter()
            .filter(|m| m.voltage().is_some_and(|v| v >= m.s_voltage))
            .map(|m| Violation::new(self.id(), &m.id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{MeterSample, Snapshot, SwitchSample};
    use crate::topology::{Meter, PowerLine, Switch, TopologyConfig};

    fn meter(id: &str, bus: &str, line: &str) -> Meter {
        Meter {
            id: id.into(),
            bus_id: bus.into(),
            power_line_id: line.into(),
            s_current: 550.0,
            s_voltage: 250.0,
            reading: None,
        }
    }

    fn line(id: &str) -> PowerLine {
        PowerLine { id: id.into(), i_max: 600.0, v_ref: 230.0, is_border: false }
    }

    /// B1 fed by L1 and L2, draining into L3. The far end of L3 carries a second
    /// meter and a switch on B2, which lists no lines of its own.
    fn substation() -> Topology {
        Topology::new(TopologyConfig {
            buses: vec![
                Bus {
                    id: "B1".into(),
                    incoming_line_ids: vec!["L1".into(), "L2".into()],
                    outgoing_line_ids: vec!["L3".into()],
                },
                Bus { id: "B2".into(), incoming_line_ids: vec![], outgoing_line_ids: vec![] },
            ],
            power_lines: vec![line("L1"), line("L2"), line("L3")],
            switches: vec![Switch {
                id: "S3".into(),
                bus_id: "B2".into(),
                power_line_id: "L3".into(),
                state: None,
            }],
            meters: vec![
                meter("M1", "B1", "L1"),
                meter("M2", "B1", "L2"),
                meter("M3", "B1", "L3"),
                meter("M3b", "B2", "L3"),
            ],
        })
        .unwrap()
    }

    fn sample(id: &str, current: f64, voltage: f64) -> MeterSample {
        MeterSample { id: id.into(), current, voltage }
    }

    fn with_readings(meters: Vec<MeterSample>, switches: Vec<SwitchSample>) -> Topology {
        let mut topology = substation();
        topology.apply_snapshot(&Snapshot { taken_at: 0.0, switches, meters });
        topology
    }

    fn closed() -> Vec<SwitchSample> {
        vec![SwitchSample { id: "S3".into(), state: SwitchState::Closed }]
    }

    #[test]
    fn bus_balance_within_tolerance_passes() {
        let topology = with_readings(
            vec![
                sample("M1", 10.0, 230.0),
                sample("M2", 5.0, 230.0),
                sample("M3", 14.95, 230.0),
                sample("M3b", 14.95, 230.0),
            ],
            closed(),
        );
        assert!(BusCurrentBalance::default().evaluate(&topology).is_empty());
    }

    #[test]
    fn bus_balance_beyond_tolerance_flags_the_bus_once() {
        let topology = with_readings(
            vec![
                sample("M1", 10.0, 230.0),
                sample("M2", 5.0, 230.0),
                sample("M3", 14.8, 230.0),
                sample("M3b", 14.8, 230.0),
            ],
            closed(),
        );
        let violations = BusCurrentBalance::default().evaluate(&topology);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].requirement, RequirementId::BUS_CURRENT_BALANCE);
        assert_eq!(violations[0].component_id, "B1");
    }

    #[test]
    fn bus_balance_skips_bus_with_missing_reading() {
        let topology = with_readings(
            vec![sample("M1", 10.0, 230.0), sample("M3", 1.0, 230.0)],
            closed(),
        );
        assert!(BusCurrentBalance::default().evaluate(&topology).is_empty());
    }

    #[test]
    fn bus_voltage_uses_first_meter_as_reference() {
        let topology = with_readings(
            vec![
                sample("M1", 10.0, 230.0),
                sample("M2", 5.0, 230.05),
                sample("M3", 15.0, 229.8),
                sample("M3b", 15.0, 229.8),
            ],
            closed(),
        );
        let violations = BusVoltageConsistency::default().evaluate(&topology);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].component_id, "B1");
    }

    #[test]
    fn open_switch_with_current_flags_the_line_once() {
        let topology = with_readings(
            vec![sample("M3", 0.0, 230.0), sample("M3b", 2.5, 230.0)],
            vec![SwitchSample { id: "S3".into(), state: SwitchState::Open }],
        );
        let violations = OpenSwitchZeroCurrent.evaluate(&topology);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].requirement, RequirementId::OPEN_SWITCH_ZERO_CURRENT);
        assert_eq!(violations[0].component_id, "L3");
    }

    #[test]
    fn open_switch_with_zero_current_is_fine() {
        let topology = with_readings(
            vec![sample("M3", 0.0, 230.0), sample("M3b", 0.0, 230.0)],
            vec![SwitchSample { id: "S3".into(), state: SwitchState::Open }],
        );
        assert!(OpenSwitchZeroCurrent.evaluate(&topology).is_empty());
    }

    #[test]
    fn line_uniformity_honours_the_tolerance_band() {
        let agreeing = with_readings(
            vec![sample("M3", 14.0, 230.0), sample("M3b", 14.05, 229.95)],
            closed(),
        );
        assert!(LineUniformity::default().evaluate(&agreeing).is_empty());

        let drifting = with_readings(
            vec![sample("M3", 14.0, 230.0), sample("M3b", 14.06, 230.0)],
            closed(),
        );
        let violations = LineUniformity::default().evaluate(&drifting);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].component_id, "L3");
    }

    #[test]
    fn safety_threshold_flags_the_meter() {
        let topology = with_readings(vec![sample("M1", 551.0, 230.0)], closed());
        let violations = SafetyCurrent.evaluate(&topology);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].requirement, RequirementId::SAFETY_CURRENT);
        assert_eq!(violations[0].component_id, "M1");
        assert!(SafetyVoltage.evaluate(&topology).is_empty());
    }

    #[test]
    fn border_lines_are_left_to_the_neighborhood() {
        let mut config = substation().config().clone();
        config.power_lines[2].is_border = true;
        let mut topology = Topology::new(config).unwrap();
        topology.apply_snapshot(&Snapshot {
            taken_at: 0.0,
            switches: vec![SwitchSample { id: "S3".into(), state: SwitchState::Open }],
            meters: vec![sample("M3", 4.0, 230.0), sample("M3b", 9.0, 230.0)],
        });
        assert!(OpenSwitchZeroCurrent.evaluate(&topology).is_empty());
        assert!(LineUniformity::default().evaluate(&topology).is_empty());
    }
}
