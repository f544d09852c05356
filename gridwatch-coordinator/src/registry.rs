//! Bookkeeping of registered monitors, in registration order.

use gridwatch_core::contracts::Role;
use gridwatch_core::Topology;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Handshake not completed yet; the link task keeps retrying.
    Connecting,
    /// Subscribed to the monitor's log, violation and heartbeat channels.
    Linked,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::Connecting => "connecting",
            LinkState::Linked => "linked",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorRecord {
    pub id: Uuid,
    pub address: String,
    pub role: Role,
    /// LMs only.
    pub topology: Option<Arc<Topology>>,
    pub link: LinkState,
    /// `None` until the first heartbeat arrives.
    pub last_heartbeat: Option<Instant>,
    pub registered_at: OffsetDateTime,
    /// Bumped when a registration replaces the record; link tasks compare it
    /// to notice they are stale.
    pub incarnation: u64,
}

impl MonitorRecord {
    pub fn new(id: Uuid, address: String, role: Role, topology: Option<Arc<Topology>>) -> Self {
        Self {
            id,
            address,
            role,
            topology,
            link: LinkState::Connecting,
            last_heartbeat: None,
            registered_at: OffsetDateTime::now_utc(),
            incarnation: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    records: Vec<MonitorRecord>,
    incarnations: u64,
}

impl Registry {
    /// Inserts or replaces by id. A replaced record keeps its position.
    /// Returns the incarnation assigned to the stored record and whether it replaced one.
    pub fn upsert(&mut self, mut record: MonitorRecord) -> (u64, bool) {
        self.incarnations += 1;
        record.incarnation = self.incarnations;
        let incarnation = record.incarnation;
        match self.records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => {
                record.registered_at = existing.registered_at;
                *existing = record;
                (incarnation, true)
            }
            None => {
                self.records.push(record);
                (incarnation, false)
            }
        }
    }

    pub fn remove(&mut self, id: Uuid) -> Option<MonitorRecord> {
        let pos = self.records.iter().position(|r| r.id == id)?;
        Some(self.records.remove(pos))
    }

    pub fn get(&self, id: Uuid) -> Option<&MonitorRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut MonitorRecord> {
        self.records.iter_mut().find(|r| r.id == id)
    }

    /// The record only if it is still the given incarnation.
    pub fn current(&self, id: Uuid, incarnation: u64) -> Option<&MonitorRecord> {
        self.get(id).filter(|r| r.incarnation == incarnation)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MonitorRecord> {
        self.records.iter()
    }

    pub fn with_role(&self, role: Role) -> impl Iterator<Item = &MonitorRecord> {
        self.records.iter().filter(move |r| r.role == role)
    }

    pub fn count(&self, role: Role) -> usize {
        self.with_role(role).count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reregistration_keeps_position_and_bumps_incarnation() {
        let mut registry = Registry::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let nm = |id, address: &str| MonitorRecord::new(id, address.into(), Role::Nm, None);
        let (first, replaced) = registry.upsert(nm(a, "old"));
        assert!(!replaced);
        registry.upsert(nm(b, "b"));
        let (second, replaced) = registry.upsert(nm(a, "new"));
        assert!(replaced);
        assert!(second > first);

        let ids: Vec<Uuid> = registry.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![a, b]);
        assert_eq!(registry.get(a).unwrap().address, "new");
        assert!(registry.current(a, first).is_none());
        assert!(registry.current(a, second).is_some());
    }

    #[test]
    fn counts_by_role() {
        let mut registry = Registry::default();
        registry.upsert(MonitorRecord::new(Uuid::new_v4(), "l".into(), Role::Lm, None));
        registry.upsert(MonitorRecord::new(Uuid::new_v4(), "n".into(), Role::Nm, None));
        registry.upsert(MonitorRecord::new(Uuid::new_v4(), "n2".into(), Role::Nm, None));
        assert_eq!(registry.count(Role::Lm), 1);
        assert_eq!(registry.count(Role::Nm), 2);
        assert_eq!(registry.len(), 3);
    }
}
