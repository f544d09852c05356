//! Border region computation
//!
//! The border region of two substations is the set of boundary-crossing power
//! lines both topologies declare identically, plus every switch and meter that
//! either side has installed on those lines.

use crate::topology::{Meter, PowerLine, Switch, Topology};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSwitch {
    #[serde(flatten)]
    pub switch: Switch,
    /// Id of the LM whose topology declared this switch.
    pub source_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionMeter {
    #[serde(flatten)]
    pub meter: Meter,
    pub source_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BorderRegion {
    pub power_lines: Vec<PowerLine>,
    pub switches: Vec<RegionSwitch>,
    pub meters: Vec<RegionMeter>,
}

impl BorderRegion {
    pub fn is_empty(&self) -> bool {
        self.power_lines.is_empty()
    }

    pub fn meters_on_line<'a>(
        &'a self,
        line_id: &'a str,
    ) -> impl Iterator<Item = &'a RegionMeter> + 'a {
        self.meters.iter().filter(move |m| m.meter.power_line_id == line_id)
    }

    pub fn switches_on_line<'a>(
        &'a self,
        line_id: &'a str,
    ) -> impl Iterator<Item = &'a RegionSwitch> + 'a {
        self.switches.iter().filter(move |s| s.switch.power_line_id == line_id)
    }
}

/// Computes the border region between topology `a` (owned by LM `a_id`) and
/// topology `b` (owned by LM `b_id`).
///
/// Never fails: topologies without a common border line yield an empty region.
/// Every collection in the result is sorted by id.
pub fn compute(a_id: &str, a: &Topology, b_id: &str, b: &Topology) -> BorderRegion {
    let mut power_lines: Vec<PowerLine> = a
        .power_lines()
        .iter()
        .filter(|line| line.is_border)
        .filter(|line| b.power_line(&line.id) == Some(*line))
        .cloned()
        .collect();
    power_lines.sort_by(|x, y| x.id.cmp(&y.id));

    let shared: HashSet<&str> = power_lines.iter().map(|l| l.id.as_str()).collect();

    let mut seen = HashSet::new();
    let mut switches: Vec<RegionSwitch> = [(a_id, a), (b_id, b)]
        .into_iter()
        .flat_map(|(source, topology)| topology.switches().iter().map(move |s| (source, s)))
        .filter(|(_, s)| shared.contains(s.power_line_id.as_str()))
        .filter(|(_, s)| seen.insert(s.id.clone()))
        .map(|(source, s)| RegionSwitch {
            switch: Switch { state: None, ..s.clone() },
            source_id: source.to_string(),
        })
        .collect();
    switches.sort_by(|x, y| x.switch.id.cmp(&y.switch.id));

    let mut seen = HashSet::new();
    let mut meters: Vec<RegionMeter> = [(a_id, a), (b_id, b)]
        .into_iter()
        .flat_map(|(source, topology)| topology.meters().iter().map(move |m| (source, m)))
        .filter(|(_, m)| shared.contains(m.power_line_id.as_str()))
        .filter(|(_, m)| seen.insert(m.id.clone()))
        .map(|(source, m)| RegionMeter {
            meter: Meter { reading: None, ..m.clone() },
            source_id: source.to_string(),
        })
        .collect();
    meters.sort_by(|x, y| x.meter.id.cmp(&y.meter.id));

    BorderRegion { power_lines, switches, meters }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{Bus, TopologyConfig};

    fn line(id: &str, is_border: bool) -> PowerLine {
        PowerLine { id: id.into(), i_max: 100.0, v_ref: 230.0, is_border }
    }

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

    fn switch(id: &str, bus: &str, line: &str) -> Switch {
        Switch { id: id.into(), bus_id: bus.into(), power_line_id: line.into(), state: None }
    }

    fn substation(
        bus: &str,
        lines: Vec<PowerLine>,
        switches: Vec<Switch>,
        meters: Vec<Meter>,
    ) -> Topology {
        Topology::new(TopologyConfig {
            buses: vec![Bus {
                id: bus.into(),
                incoming_line_ids: lines.iter().map(|l| l.id.clone()).collect(),
                outgoing_line_ids: vec![],
            }],
            power_lines: lines,
            switches,
            meters,
        })
        .unwrap()
    }

    fn west() -> Topology {
        substation(
            "BW",
            vec![line("L1", false), line("L7", true), line("L8", true), line("L9", true)],
            vec![switch("SW7", "BW", "L7"), switch("SW1", "BW", "L1")],
            vec![meter("MW7", "BW", "L7"), meter("MW1", "BW", "L1"), meter("MW9", "BW", "L9")],
        )
    }

    fn east() -> Topology {
        let mut l9 = line("L9", true);
        l9.i_max = 50.0;
        substation(
            "BE",
            vec![line("L2", false), line("L7", true), line("L1", false), l9],
            vec![switch("SE7", "BE", "L7")],
            vec![meter("ME7", "BE", "L7"), meter("ME2", "BE", "L2")],
        )
    }

    #[test]
    fn shared_line_brings_instrumentation_from_both_sides() {
        let region = compute("lm-w", &west(), "lm-e", &east());

        let ids: Vec<_> = region.power_lines.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["L7"]);

        let switches: Vec<_> = region
            .switches
            .iter()
            .map(|s| (s.switch.id.as_str(), s.source_id.as_str()))
            .collect();
        assert_eq!(switches, vec![("SE7", "lm-e"), ("SW7", "lm-w")]);

        let meters: Vec<_> = region
            .meters
            .iter()
            .map(|m| (m.meter.id.as_str(), m.source_id.as_str()))
            .collect();
        assert_eq!(meters, vec![("ME7", "lm-e"), ("MW7", "lm-w")]);
    }

    #[test]
    fn order_independent_and_members_exist_on_both_sides() {
        let (w, e) = (west(), east());
        let ab = compute("lm-w", &w, "lm-e", &e);
        let ba = compute("lm-e", &e, "lm-w", &w);
        assert_eq!(ab.power_lines, ba.power_lines);
        for l in &ab.power_lines {
            assert_eq!(w.power_line(&l.id), Some(l));
            assert_eq!(e.power_line(&l.id), Some(l));
        }
    }

    #[test]
    fn local_lines_never_enter_a_region() {
        // L1 is declared identically on both sides but is not a border line.
        let region = compute("lm-w", &west(), "lm-e", &east());
        assert!(region.power_lines.iter().all(|l| l.is_border));
        assert!(region.meters.iter().all(|m| m.meter.power_line_id != "L1"));
        assert!(region.switches.iter().all(|s| s.switch.power_line_id != "L1"));
    }

    #[test]
    fn differing_line_declarations_are_not_shared() {
        let region = compute("lm-w", &west(), "lm-e", &east());
        assert!(region.power_lines.iter().all(|l| l.id != "L9"));
    }

    #[test]
    fn disjoint_topologies_give_empty_region() {
        let a = substation("BA", vec![line("LA", true)], vec![], vec![]);
        let b = substation("BB", vec![line("LB", true)], vec![], vec![]);
        let region = compute("a", &a, "b", &b);
        assert!(region.is_empty());
        assert!(region.switches.is_empty() && region.meters.is_empty());
    }

    #[test]
    fn shared_instrumentation_is_deduplicated() {
        let a = substation("BX", vec![line("L7", true)], vec![], vec![meter("M7", "BX", "L7")]);
        let b = substation("BX", vec![line("L7", true)], vec![], vec![meter("M7", "BX", "L7")]);
        let region = compute("a", &a, "b", &b);
        assert_eq!(region.meters.len(), 1);
        assert_eq!(region.meters[0].source_id, "a");
    }
}
