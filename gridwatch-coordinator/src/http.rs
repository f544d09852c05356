/**
 * HTTP SURFACE - read-only views of the C2 and the report sink socket
 *
 * ROUTES:
 *   GET /health     liveness probe
 *   GET /status     coordinator status, monitor counts, reconfiguration counter
 *   GET /monitors   registered monitors in registration order
 *   GET /reports    WebSocket; answers {"type":"query","timestamp":T} with the
 *                   reports newer than T (no answer when there are none)
 */

use crate::coordinator::{Coordinator, CoordinatorStatus};
use crate::service::SharedContext;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use gridwatch_core::contracts::Role;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
pub struct StatusView {
    pub status: CoordinatorStatus,
    pub local_monitors: usize,
    pub neighborhood_monitors: usize,
    pub generation: u64,
    pub reconfigurations: u64,
    pub reports: usize,
}

#[derive(Debug, Serialize)]
pub struct MonitorView {
    pub id: String,
    pub address: String,
    pub role: Role,
    pub link: &'static str,
    pub registered_at: String,
    /// Milliseconds since the last heartbeat, if one was seen.
    pub heartbeat_age_ms: Option<u128>,
}

pub fn status_view(c2: &Coordinator, reports: usize) -> StatusView {
    StatusView {
        status: c2.status(),
        local_monitors: c2.registry().count(Role::Lm),
        neighborhood_monitors: c2.registry().count(Role::Nm),
        generation: c2.generation(),
        reconfigurations: c2.reconfigurations(),
        reports,
    }
}

pub fn monitor_views(c2: &Coordinator, now: Instant) -> Vec<MonitorView> {
    c2.registry()
        .iter()
        .map(|r| MonitorView {
            id: r.id.to_string(),
            address: r.address.clone(),
            role: r.role,
            link: r.link.as_str(),
            registered_at: r.registered_at.format(&Rfc3339).unwrap_or_default(),
            heartbeat_age_ms: r
                .last_heartbeat
                .map(|seen| now.saturating_duration_since(seen).as_millis()),
        })
        .collect()
}

pub fn build_router(ctx: SharedContext) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/status", get(get_status))
        .route("/monitors", get(get_monitors))
        .route("/reports", get(reports_socket))
        .with_state(ctx)
}

async fn get_status(State(ctx): State<SharedContext>) -> Json<StatusView> {
    let reports = ctx.reports.lock().len();
    let view = status_view(&ctx.coordinator.lock(), reports);
    Json(view)
}

async fn get_monitors(State(ctx): State<SharedContext>) -> Json<Vec<MonitorView>> {
    let views = monitor_views(&ctx.coordinator.lock(), Instant::now());
    Json(views)
}

async fn reports_socket(ws: WebSocketUpgrade, State(ctx): State<SharedContext>) -> Response {
    ws.on_upgrade(move |socket| serve_reports(socket, ctx))
}

async fn serve_reports(mut socket: WebSocket, ctx: SharedContext) {
    info!("report sink connected");
    while let Some(message) = socket.recv().await {
        match message {
            Ok(Message::Text(text)) => {
                let answer = ctx.reports.lock().answer(text.as_str());
                if let Some(json) = answer {
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "report socket error");
                break;
            }
        }
    }
    info!("report sink disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridwatch_devkit::fixtures;
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn status_and_monitor_views() {
        let mut c2 = Coordinator::new();
        let lm = Uuid::new_v4();
        c2.register_lm(lm, "gridwatch/lm/a".into(), &fixtures::substation_a_json()).unwrap();
        c2.register_nm(Uuid::new_v4(), "gridwatch/nm/a".into()).unwrap();
        let t0 = Instant::now();
        c2.record_heartbeat(lm, t0);

        let status = status_view(&c2, 3);
        assert_eq!(status.status, CoordinatorStatus::WaitingForLm);
        let counts = (status.local_monitors, status.neighborhood_monitors, status.reports);
        assert_eq!(counts, (1, 1, 3));
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "WAITING_FOR_LM");

        let views = monitor_views(&c2, t0 + Duration::from_millis(1500));
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].heartbeat_age_ms, Some(1500));
        assert_eq!(views[0].link, "connecting");
        assert_eq!(views[1].heartbeat_age_ms, None);
    }
}
