/**
 * CONTRACTS - topic naming and event payloads exchanged over the bus
 *
 * ROLE: single place where topic strings and message schemas are defined, so
 * C2, LM and NM agree on them. Topics are versioned with an `@v1` suffix.
 *
 * LAYOUT: every peer owns a topic prefix (its "address"):
 *   {address}/rpc@v1                 requests addressed to the peer
 *   {address}/rpc-reply@v1           replies to requests the peer issued
 *   {address}/events/{channel}@v1    events the peer publishes
 */

use crate::border_region::BorderRegion;
use crate::requirements::{RequirementId, Violation};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub const DEFAULT_C2_ADDRESS: &str = "gridwatch/c2";

pub fn rpc_topic(address: &str) -> String {
    format!("{address}/rpc@v1")
}

pub fn rpc_reply_topic(address: &str) -> String {
    format!("{address}/rpc-reply@v1")
}

pub fn lm_address(id: Uuid) -> String {
    format!("gridwatch/lm/{id}")
}

pub fn nm_address(id: Uuid) -> String {
    format!("gridwatch/nm/{id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Heartbeat,
    Log,
    Violation,
    /// "this LM published new data"
    Data,
    Usage,
    /// C2 broadcasts
    Control,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Heartbeat => "heartbeat",
            Channel::Log => "log",
            Channel::Violation => "violation",
            Channel::Data => "data",
            Channel::Usage => "usage",
            Channel::Control => "control",
        }
    }

    pub fn topic(self, address: &str) -> String {
        format!("{address}/events/{}@v1", self.as_str())
    }

    /// Recognizes `{address}/events/{channel}@v1`, returning the address and channel.
    pub fn parse(topic: &str) -> Option<(&str, Channel)> {
        let body = topic.strip_suffix("@v1")?;
        let (address, name) = body.rsplit_once("/events/")?;
        let channel = [
            Channel::Heartbeat,
            Channel::Log,
            Channel::Violation,
            Channel::Data,
            Channel::Usage,
            Channel::Control,
        ]
        .into_iter()
        .find(|c| c.as_str() == name)?;
        Some((address, channel))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Lm,
    Nm,
    C2,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Lm => "LM",
            Role::Nm => "NM",
            Role::C2 => "C2",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub sender: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub uuid: String,
    #[serde(rename = "type")]
    pub kind: Role,
    pub severity: String,
    pub message: String,
    /// RFC 3339 time at which the record was emitted.
    #[serde(default)]
    pub time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReqViolationEvent {
    pub requirement: i32,
    pub component_id: String,
}

impl From<&Violation> for ReqViolationEvent {
    fn from(v: &Violation) -> Self {
        Self { requirement: v.requirement.0, component_id: v.component_id.clone() }
    }
}

impl ReqViolationEvent {
    pub fn requirement_id(&self) -> RequirementId {
        RequirementId(self.requirement)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataChanged {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageData {
    pub cpu_load: f32,
    pub memory_load: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "camelCase")]
pub enum ControlEvent {
    /// Border regions were recomputed; NMs re-pull their assignment.
    Reconfigure { generation: u64 },
    /// The C2 is subscribed to this peer's events.
    IsRegistered { id: Uuid },
}

/// One border region as distributed to NMs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BorderRegionRecord {
    pub uuid: Uuid,
    pub lm_1_id: Uuid,
    pub lm_2_id: Uuid,
    pub lm_1_address: String,
    pub lm_2_address: String,
    /// NM assigned to `lm_1`.
    pub owner_nm: Uuid,
    pub region: BorderRegion,
}

impl BorderRegionRecord {
    /// The unordered LM pair identifying the region.
    pub fn key(&self) -> (Uuid, Uuid) {
        if self.lm_1_id <= self.lm_2_id {
            (self.lm_1_id, self.lm_2_id)
        } else {
            (self.lm_2_id, self.lm_1_id)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NmAssignment {
    pub uuid: Uuid,
    pub generation: u64,
    pub regions: Vec<BorderRegionRecord>,
}

impl NmAssignment {
    /// Addresses of the LMs this NM has to pull from, deduplicated, in region order.
    pub fn lm_addresses(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for record in self.regions.iter().filter(|r| !r.region.is_empty()) {
            for address in [&record.lm_1_address, &record.lm_2_address] {
                if !out.contains(address) {
                    out.push(address.clone());
                }
            }
        }
        out
    }
}
