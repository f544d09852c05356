/**
 * COORDINATOR - status machine, registrations and border-region distribution
 *
 * ROLE: owns the monitor registry and the per-NM assignments. Every mutation
 * here is synchronous; the service layer calls in under a lock and performs
 * the resulting I/O (broadcasts, detach calls) after releasing it.
 *
 * STATES: WAITING_FOR_LM -> SHOULD_RECONFIGURE once two LMs are known,
 * WAITING_FOR_NM -> SHOULD_RECONFIGURE once NMs >= LMs, RUNNING ->
 * SHOULD_RECONFIGURE on any membership change. ERROR is terminal.
 */

use crate::error::CoordinatorError;
use crate::registry::{MonitorRecord, Registry};
use gridwatch_core::border_region;
use gridwatch_core::contracts::{BorderRegionRecord, NmAssignment, Role};
use gridwatch_core::Topology;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoordinatorStatus {
    Error,
    Running,
    WaitingForNm,
    WaitingForLm,
    ShouldReconfigure,
}

impl fmt::Display for CoordinatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CoordinatorStatus::Error => "ERROR",
            CoordinatorStatus::Running => "RUNNING",
            CoordinatorStatus::WaitingForNm => "WAITING_FOR_NM",
            CoordinatorStatus::WaitingForLm => "WAITING_FOR_LM",
            CoordinatorStatus::ShouldReconfigure => "SHOULD_RECONFIGURE",
        })
    }
}

/// Result of a successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub incarnation: u64,
    pub replaced: bool,
}

/// What a reconfiguration produced; the caller broadcasts `generation`.
#[derive(Debug, Clone)]
pub struct ReconfigurePlan {
    pub generation: u64,
    pub assignments: Vec<(Uuid, Arc<NmAssignment>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    HeartbeatTimeout,
    Requested,
}

impl fmt::Display for RemovalCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RemovalCause::HeartbeatTimeout => "heartbeat timeout",
            RemovalCause::Requested => "requested",
        })
    }
}

/// Effects of removing a monitor that the service still has to carry out.
#[derive(Debug)]
pub struct Removal {
    pub record: MonitorRecord,
    /// Addresses of the remaining LMs that must drop the removed NM.
    pub detach_from: Vec<String>,
    pub plan: Option<ReconfigurePlan>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatSeen {
    First,
    Again,
    Unknown,
}

#[derive(Debug)]
pub struct Coordinator {
    status: CoordinatorStatus,
    registry: Registry,
    assignments: HashMap<Uuid, Arc<NmAssignment>>,
    generation: u64,
    reconfigurations: u64,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            status: CoordinatorStatus::WaitingForLm,
            registry: Registry::default(),
            assignments: HashMap::new(),
            generation: 0,
            reconfigurations: 0,
        }
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.status
    }

    /// Puts the coordinator in the terminal `ERROR` state.
    pub fn fail(&mut self, reason: &str) {
        error!(%reason, "coordinator entering ERROR state");
        self.status = CoordinatorStatus::Error;
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn reconfigurations(&self) -> u64 {
        self.reconfigurations
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn register_lm(
        &mut self,
        id: Uuid,
        address: String,
        topology_config: &str,
    ) -> Result<Registration, CoordinatorError> {
        let topology = Topology::from_json(topology_config)
            .map_err(|source| CoordinatorError::InvalidTopology { id, source })?;
        self.ensure_role(id, Role::Lm)?;
        let record = MonitorRecord::new(id, address, Role::Lm, Some(Arc::new(topology)));
        let (incarnation, replaced) = self.registry.upsert(record);
        info!(%id, replaced, "LM registered");

        let lms = self.registry.count(Role::Lm);
        self.status = match self.status {
            CoordinatorStatus::WaitingForLm if lms >= 2 => CoordinatorStatus::ShouldReconfigure,
            CoordinatorStatus::Running | CoordinatorStatus::ShouldReconfigure => {
                CoordinatorStatus::ShouldReconfigure
            }
            other => other,
        };
        Ok(Registration { incarnation, replaced })
    }

    pub fn register_nm(
        &mut self,
        id: Uuid,
        address: String,
    ) -> Result<Registration, CoordinatorError> {
        self.ensure_role(id, Role::Nm)?;
        let (incarnation, replaced) =
            self.registry.upsert(MonitorRecord::new(id, address, Role::Nm, None));
        info!(%id, replaced, "NM registered");

        let lms = self.registry.count(Role::Lm);
        let nms = self.registry.count(Role::Nm);
        self.status = match self.status {
            CoordinatorStatus::WaitingForNm if nms >= lms => CoordinatorStatus::ShouldReconfigure,
            CoordinatorStatus::Running | CoordinatorStatus::ShouldReconfigure => {
                CoordinatorStatus::ShouldReconfigure
            }
            other => other,
        };
        Ok(Registration { incarnation, replaced })
    }

    fn ensure_role(&self, id: Uuid, role: Role) -> Result<(), CoordinatorError> {
        match self.registry.get(id) {
            Some(existing) if existing.role != role => Err(CoordinatorError::RoleConflict(id)),
            _ => Ok(()),
        }
    }

    /// Recomputes every border region and replaces every NM's assignment.
    ///
    /// LM `i` (registration order) goes to NM `i mod N`; each region is handed
    /// to the NMs of both of its LMs, once per NM.
    pub fn configure_network(&mut self) -> Result<ReconfigurePlan, CoordinatorError> {
        if self.status == CoordinatorStatus::Error {
            return Err(CoordinatorError::Halted);
        }
        let lms: Vec<&MonitorRecord> = self.registry.with_role(Role::Lm).collect();
        let nms: Vec<Uuid> = self.registry.with_role(Role::Nm).map(|r| r.id).collect();
        if lms.len() < 2 {
            warn!(lms = lms.len(), "not enough LMs to compute border regions");
            self.status = CoordinatorStatus::WaitingForLm;
            return Err(CoordinatorError::NotEnoughLms(lms.len()));
        }
        if nms.len() < lms.len() {
            warn!(lms = lms.len(), nms = nms.len(), "not enough NMs to cover every LM");
            self.status = CoordinatorStatus::WaitingForNm;
            return Err(CoordinatorError::NotEnoughNms { lms: lms.len(), nms: nms.len() });
        }

        let nm_of: Vec<Uuid> = (0..lms.len()).map(|i| nms[i % nms.len()]).collect();
        let mut buckets: HashMap<Uuid, Vec<BorderRegionRecord>> =
            nms.iter().map(|id| (*id, Vec::new())).collect();

        for i in 0..lms.len() {
            for j in (i + 1)..lms.len() {
                let (lm_1, lm_2) = (lms[i], lms[j]);
                let (Some(topo_1), Some(topo_2)) = (&lm_1.topology, &lm_2.topology) else {
                    continue;
                };
                let (id_1, id_2) = (lm_1.id.to_string(), lm_2.id.to_string());
                let region = border_region::compute(&id_1, topo_1, &id_2, topo_2);
                let record = BorderRegionRecord {
                    uuid: Uuid::new_v4(),
                    lm_1_id: lm_1.id,
                    lm_2_id: lm_2.id,
                    lm_1_address: lm_1.address.clone(),
                    lm_2_address: lm_2.address.clone(),
                    owner_nm: nm_of[i],
                    region,
                };
                if nm_of[j] != nm_of[i] {
                    buckets.entry(nm_of[j]).or_default().push(record.clone());
                }
                buckets.entry(nm_of[i]).or_default().push(record);
            }
        }

        self.generation += 1;
        let generation = self.generation;
        self.assignments.clear();
        let mut assignments = Vec::with_capacity(nms.len());
        for nm in nms {
            let regions = buckets.remove(&nm).unwrap_or_default();
            let assignment = Arc::new(NmAssignment { uuid: nm, generation, regions });
            self.assignments.insert(nm, assignment.clone());
            assignments.push((nm, assignment));
        }

        self.reconfigurations += 1;
        self.status = CoordinatorStatus::Running;
        info!(generation, "network reconfigured");
        Ok(ReconfigurePlan { generation, assignments })
    }

    /// Reconfigures if a membership change is pending.
    pub fn reconfigure_if_needed(&mut self) -> Option<ReconfigurePlan> {
        if self.status != CoordinatorStatus::ShouldReconfigure {
            return None;
        }
        self.configure_network().ok()
    }

    /// The current assignment of `nm`; an empty one for NMs without regions.
    pub fn assignment(&self, nm: Uuid) -> Arc<NmAssignment> {
        self.assignments.get(&nm).cloned().unwrap_or_else(|| {
            Arc::new(NmAssignment { uuid: nm, generation: self.generation, regions: Vec::new() })
        })
    }

    /// Removes a monitor and runs exactly one reconfiguration.
    pub fn delete_monitor(&mut self, id: Uuid, cause: RemovalCause) -> Option<Removal> {
        let record = self.registry.remove(id)?;
        error!(%id, role = %record.role, %cause, "monitor removed, reconfiguring");
        self.assignments.remove(&id);

        let detach_from = if record.role == Role::Nm {
            self.registry.with_role(Role::Lm).map(|r| r.address.clone()).collect()
        } else {
            Vec::new()
        };
        if self.status != CoordinatorStatus::Error {
            self.status = CoordinatorStatus::ShouldReconfigure;
        }
        let plan = self.reconfigure_if_needed();
        Some(Removal { record, detach_from, plan })
    }

    pub fn record_heartbeat(&mut self, id: Uuid, now: Instant) -> HeartbeatSeen {
        match self.registry.get_mut(id) {
            None => HeartbeatSeen::Unknown,
            Some(record) => {
                let first = record.last_heartbeat.is_none();
                record.last_heartbeat = Some(now);
                if first {
                    info!(%id, "first heartbeat");
                    HeartbeatSeen::First
                } else {
                    HeartbeatSeen::Again
                }
            }
        }
    }

    /// Monitors whose last heartbeat is older than `grace`.
    pub fn silent_since(&self, now: Instant, grace: Duration) -> Vec<Uuid> {
        self.registry
            .iter()
            .filter(|r| {
                r.last_heartbeat
                    .is_some_and(|seen| now.saturating_duration_since(seen) > grace)
            })
            .map(|r| r.id)
            .collect()
    }

    pub fn mark_linked(&mut self, id: Uuid, incarnation: u64) -> bool {
        match self.registry.get_mut(id) {
            Some(record) if record.incarnation == incarnation => {
                record.link = crate::registry::LinkState::Linked;
                true
            }
            _ => false,
        }
    }
}
