//! One link task per registered monitor: handshake, then event subscription.

use crate::service::{SharedContext, EVENT_CHANNELS};
use gridwatch_core::contracts::ControlEvent;
use gridwatch_core::rpc::RpcMethod;
use gridwatch_core::transport::{publish_json, Transport};
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

pub const LINK_RETRY: Duration = Duration::from_secs(5);

pub fn spawn_link(ctx: SharedContext, id: Uuid, incarnation: u64) -> tokio::task::JoinHandle<()> {
    tokio::spawn(link(ctx, id, incarnation))
}

/// Address of the monitor if the record is still the one this task was started for.
fn current_address(ctx: &SharedContext, id: Uuid, incarnation: u64) -> Option<String> {
    ctx.coordinator.lock().registry().current(id, incarnation).map(|r| r.address.clone())
}

async fn link(ctx: SharedContext, id: Uuid, incarnation: u64) {
    let address = loop {
        let Some(address) = current_address(&ctx, id, incarnation) else {
            debug!(%id, "monitor gone or re-registered, link task exits");
            return;
        };
        match ctx.rpc.call_ok(&address, RpcMethod::Ping).await {
            Ok(_) => match subscribe_events(&ctx, &address).await {
                Ok(()) => break address,
                Err(e) => error!(%id, %address, error = %e, "event subscription failed, retrying"),
            },
            Err(e) => error!(%id, %address, error = %e, "cannot reach monitor, retrying"),
        }
        tokio::time::sleep(ctx.link_retry).await;
    };

    if !ctx.coordinator.lock().mark_linked(id, incarnation) {
        debug!(%id, "monitor removed during handshake");
        return;
    }
    info!(%id, %address, "linked to monitor");
    let announcement = ControlEvent::IsRegistered { id };
    let topic = ctx.control_topic();
    if let Err(e) = publish_json(ctx.transport.as_ref(), &topic, &announcement).await {
        error!(%id, error = %e, "failed to announce registration");
    }
}

async fn subscribe_events(
    ctx: &SharedContext,
    address: &str,
) -> Result<(), gridwatch_core::TransportError> {
    for channel in EVENT_CHANNELS {
        ctx.transport.subscribe(&channel.topic(address)).await?;
    }
    Ok(())
}
