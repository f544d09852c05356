//! Typed sensor snapshot exchanged between sensor sources, LMs and NMs.

use crate::topology::{MeterReading, SwitchState};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchSample {
    pub id: String,
    pub state: SwitchState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterSample {
    pub id: String,
    pub current: f64,
    pub voltage: f64,
}

/// One poll of a substation's instrumentation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Unix seconds at which the values were read.
    #[serde(default)]
    pub taken_at: f64,
    #[serde(default)]
    pub switches: Vec<SwitchSample>,
    #[serde(default)]
    pub meters: Vec<MeterSample>,
}

impl Snapshot {
    pub fn stamped_now(switches: Vec<SwitchSample>, meters: Vec<MeterSample>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            taken_at: now.unix_timestamp_nanos() as f64 / 1e9,
            switches,
            meters,
        }
    }

    pub fn switch_state(&self, id: &str) -> Option<SwitchState> {
        self.switches.iter().find(|s| s.id == id).map(|s| s.state)
    }

    pub fn meter_reading(&self, id: &str) -> Option<MeterReading> {
        self.meters
            .iter()
            .find(|m| m.id == id)
            .map(|m| MeterReading { current: m.current, voltage: m.voltage })
    }
}
