//! Heartbeat supervision: monitors silent for longer than the grace window are removed.

use crate::coordinator::{Coordinator, HeartbeatSeen, Removal, RemovalCause};
use crate::service::{apply_removal, SharedContext};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error};
use uuid::Uuid;

pub const HEARTBEAT_GRACE: Duration = Duration::from_secs(10);
pub const SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// Deletes every monitor whose last heartbeat is older than `grace`.
pub fn expire(coordinator: &mut Coordinator, now: Instant, grace: Duration) -> Vec<Removal> {
    coordinator
        .silent_since(now, grace)
        .into_iter()
        .filter_map(|id| {
            error!(%id, grace_secs = grace.as_secs(), "no heartbeat within grace window");
            coordinator.delete_monitor(id, RemovalCause::HeartbeatTimeout)
        })
        .collect()
}

pub async fn on_heartbeat(ctx: &SharedContext, id: Uuid) {
    let removals = {
        let mut coordinator = ctx.coordinator.lock();
        let now = Instant::now();
        if coordinator.record_heartbeat(id, now) == HeartbeatSeen::Unknown {
            debug!(%id, "heartbeat from unregistered monitor");
        }
        expire(&mut coordinator, now, ctx.heartbeat_grace)
    };
    for removal in removals {
        apply_removal(ctx, removal).await;
    }
}

pub fn spawn_sweeper(ctx: SharedContext) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_PERIOD);
        loop {
            tick.tick().await;
            let removals = expire(&mut ctx.coordinator.lock(), Instant::now(), ctx.heartbeat_grace);
            for removal in removals {
                apply_removal(&ctx, removal).await;
            }
        }
    })
}
