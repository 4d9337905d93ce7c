//! OPC-UA sampling loop bootstrap: one task per configured client, each
//! reading its tag map on a timer and publishing telemetry (and, where
//! thresholds are configured, alert) envelopes.

mod config;
mod opcua_client;

use std::sync::Arc;

use plantbus_core::area::AreaRegistry;
use plantbus_core::broker::{ConnectionSupervisor, Publisher};
use plantbus_core::config::{default_recipients, env_var, env_var_parse_or, BrokerConfig};
use plantbus_core::opcua::{OpcUaClient, SamplingLoop};
use plantbus_core::shutdown::GracefulShutdown;
use tracing::{error, info, warn};

use config::load_clients;
use opcua_client::RealOpcUaClient;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    if let Err(err) = run().await {
        error!(error = %err, "collector exited with error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), plantbus_core::CoreError> {
    let cfg = BrokerConfig::from_env()?;
    let registry = Arc::new(AreaRegistry::new(&cfg.sites, AreaRegistry::default_aliases()));
    let supervisor = ConnectionSupervisor::new(cfg.clone());
    let publisher = Arc::new(Publisher::new(supervisor, &cfg, true).await?);

    let config_path = env_var("OPCUA_CLIENTS_CONFIG_PATH")?;
    let clients = load_clients(&config_path)?;
    let alert_suppress_secs: u64 = env_var_parse_or("ALERT_SUPPRESS_WINDOW_SECS", 60);
    let recipients = default_recipients();

    if clients.is_empty() {
        warn!("no OPC-UA clients configured, collector has nothing to sample");
    }

    let shutdown = GracefulShutdown::new();
    let mut tasks = Vec::new();

    for configured in clients {
        let opc_client: Arc<dyn OpcUaClient> =
            match RealOpcUaClient::connect(&configured.endpoint_url, &configured.setup.client_id) {
                Ok(client) => Arc::new(client),
                Err(err) => {
                    error!(client_id = %configured.setup.client_id, error = %err, "failed to connect OPC-UA client, skipping");
                    continue;
                }
            };

        let interval_ms = configured.setup.interval_ms;
        let sampling = SamplingLoop::new(
            opc_client,
            publisher.clone(),
            cfg.clone(),
            registry.clone(),
            configured.setup,
            recipients.clone(),
            std::time::Duration::from_secs(alert_suppress_secs),
        );

        let mut token = shutdown.token();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(err) = sampling.run_once().await {
                            error!(error = %err, "sampling cycle failed");
                        }
                    }
                }
            }
        }));
    }

    info!(clients = tasks.len(), "collector bootstrap complete");

    shutdown.wait_for_os_signal().await;
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}
