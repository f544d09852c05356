/**
 * GRIDWATCH NM - entry point of a Neighborhood Monitor
 *
 * ROLE: connects to the broker with the NM certificate, registers with the
 * C2 and evaluates the border regions it is assigned.
 *
 * EXIT: 78 on configuration errors.
 */

use gridwatch_core::config::{load_dotenv, BrokerConfig};
use gridwatch_core::requirements::neighborhood_engine;
use gridwatch_core::telemetry::{init_tracing, new_log_queue};
use gridwatch_core::transport::MqttTransport;
use gridwatch_monitor::config::NmConfig;
use gridwatch_monitor::{or_exit_config, NeighborhoodMonitor};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    let logs = new_log_queue();
    init_tracing(Some(logs.clone()));

    let cfg = or_exit_config(NmConfig::from_env(), "invalid NM configuration");
    let broker = or_exit_config(BrokerConfig::from_env(), "invalid broker configuration");
    let params = or_exit_config(cfg.common.load_check_params(), "cannot load check parameters");
    let engine = or_exit_config(
        neighborhood_engine(&cfg.common.profile, &params),
        "cannot build requirement engine",
    );

    let settings = broker.settings(format!("gridwatch-nm-{}", cfg.id));
    let (transport, inbox) = or_exit_config(
        MqttTransport::connect(&settings, Some(&broker.tls)),
        "cannot set up broker connection",
    );

    let monitor = NeighborhoodMonitor::new(
        cfg.id,
        cfg.address.clone(),
        cfg.common.c2_address.clone(),
        engine,
        transport,
        logs,
    );
    monitor.run(inbox).await
}
