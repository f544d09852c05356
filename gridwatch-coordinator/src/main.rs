/**
 * GRIDWATCH C2 - entry point of the coordinator
 *
 * ROLE: loads configuration, connects to the broker with the C2 certificate,
 * serves the HTTP surface and runs the dispatcher until the broker
 * connection is dropped.
 *
 * EXIT: 78 on configuration errors, 1 on any other startup failure.
 */

use anyhow::Context;
use gridwatch_coordinator::config::C2Config;
use gridwatch_coordinator::{http, service, C2Context};
use gridwatch_core::config::{load_dotenv, EXIT_CONFIG};
use gridwatch_core::telemetry::init_tracing;
use gridwatch_core::transport::MqttTransport;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    init_tracing(None);

    let cfg = match C2Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let settings = cfg.broker.settings(format!("gridwatch-c2-{}", uuid::Uuid::new_v4()));
    let (transport, inbox) = match MqttTransport::connect(&settings, Some(&cfg.broker.tls)) {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "cannot set up broker connection");
            std::process::exit(EXIT_CONFIG);
        }
    };
    let ctx = C2Context::new(cfg.address.clone(), transport);

    let listener = match TcpListener::bind(cfg.http_bind).await {
        Ok(listener) => listener,
        Err(e) => {
            ctx.coordinator.lock().fail("http listener unavailable");
            return Err(e).with_context(|| format!("binding {}", cfg.http_bind));
        }
    };
    info!(addr = %cfg.http_bind, "HTTP surface listening");
    let app = http::build_router(ctx.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "HTTP server stopped");
        }
    });

    service::run(ctx, inbox).await
}
