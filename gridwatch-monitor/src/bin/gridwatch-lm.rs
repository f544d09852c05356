/**
 * GRIDWATCH LM - entry point of a Local Monitor
 *
 * ROLE: loads the substation topology and check parameters, connects to the
 * broker with the LM certificate and runs the monitoring loop against the
 * sensor snapshot file.
 *
 * EXIT: 78 on configuration errors.
 */

use gridwatch_core::config::{load_dotenv, BrokerConfig};
use gridwatch_core::requirements::local_engine;
use gridwatch_core::telemetry::{init_tracing, new_log_queue};
use gridwatch_core::transport::MqttTransport;
use gridwatch_monitor::config::LmConfig;
use gridwatch_monitor::{or_exit_config, JsonFileSource, LocalMonitor};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    let logs = new_log_queue();
    init_tracing(Some(logs.clone()));

    let cfg = or_exit_config(LmConfig::from_env(), "invalid LM configuration");
    let broker = or_exit_config(BrokerConfig::from_env(), "invalid broker configuration");
    let (document, _) = or_exit_config(cfg.load_topology(), "cannot load topology");
    let params = or_exit_config(cfg.common.load_check_params(), "cannot load check parameters");
    let engine = or_exit_config(
        local_engine(&cfg.common.profile, &params),
        "cannot build requirement engine",
    );

    let settings = broker.settings(format!("gridwatch-lm-{}", cfg.id));
    let (transport, inbox) = or_exit_config(
        MqttTransport::connect(&settings, Some(&broker.tls)),
        "cannot set up broker connection",
    );

    let monitor = or_exit_config(
        LocalMonitor::new(
            cfg.id,
            cfg.address.clone(),
            cfg.common.c2_address.clone(),
            document,
            engine,
            transport,
            logs,
        ),
        "invalid topology",
    );
    let source = Box::new(JsonFileSource::new(cfg.sensor_file.clone()));
    monitor.run(inbox, source).await
}
