//! Per-area consumer worker bootstrap: connects to the broker, declares
//! topology, runs telemetry/alert consume loops for the configured areas,
//! and drives the notification scheduler.

mod handlers;
mod recent_alerts;

use std::sync::Arc;

use dashmap::DashMap;
use plantbus_core::area::{derive, AreaRegistry};
use plantbus_core::broker::{ConnectionSupervisor, ConsumerWorker, MessageHandler, Publisher, TopologyManager};
use plantbus_core::config::{area_db_targets_from_env, env_var_or, scheduler_interval, BrokerConfig};
use plantbus_core::alerts::{AlertStore, NotificationMode, SchedulerDeduper};
use plantbus_core::shutdown::GracefulShutdown;
use plantbus_core::rate_meter::RateMeter;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

use handlers::{AlertHandler, TelemetryHandler};
use recent_alerts::{LoggingNotifier, PostgresRecentAlertsSource};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    if let Err(err) = run().await {
        error!(error = %err, "consumer exited with error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), plantbus_core::CoreError> {
    let cfg = BrokerConfig::from_env()?;
    let registry = AreaRegistry::new(&cfg.sites, AreaRegistry::default_aliases());
    let targets = area_db_targets_from_env(
        &registry.areas().iter().map(|a| a.slug.clone()).collect::<Vec<_>>(),
    );

    let supervisor = ConnectionSupervisor::new(cfg.clone());
    let channel = supervisor.get_channel().await?;
    TopologyManager::new(&channel, &cfg).declare_all(&registry).await?;

    let shutdown = GracefulShutdown::new();
    let rate_meter = Arc::new(RateMeter::new());
    let active_clients: Arc<DashMap<String, ()>> = Arc::new(DashMap::new());

    let areas: Vec<_> = match &cfg.consumer_area_slug {
        Some(slug) => registry
            .find_by_slug(slug)
            .into_iter()
            .cloned()
            .collect::<Vec<_>>(),
        None => registry.areas().to_vec(),
    };
    if areas.is_empty() {
        warn!(slug = ?cfg.consumer_area_slug, "no matching configured area, consumer has nothing to do");
    }

    let mut tasks = Vec::new();
    let mut stores_by_slug: Vec<(String, Arc<AlertStore>)> = Vec::new();

    for area in &areas {
        let routing = derive(&area.slug, &cfg);
        let target = targets.iter().find(|t| t.slug == area.slug).cloned();

        let pool = match &target {
            Some(target) => match PgPoolOptions::new().max_connections(5).connect(&target.connection_string()).await {
                Ok(pool) => Some(pool),
                Err(err) => {
                    error!(area = %area.slug, error = %err, "failed to connect to area database, alert consumer disabled for this area");
                    None
                }
            },
            None => {
                warn!(area = %area.slug, "no database target configured, alert consumer disabled for this area");
                None
            }
        };

        let telemetry_handlers: Vec<Arc<dyn MessageHandler>> =
            vec![Arc::new(TelemetryHandler { rate_meter: rate_meter.clone() })];
        let telemetry_worker = ConsumerWorker::new(
            supervisor.clone(),
            cfg.exchange.clone(),
            routing.queue.clone(),
            routing.retry_routing_key.clone(),
            cfg.max_retries,
            telemetry_handlers,
            format!("telemetry-{}", area.slug),
        );
        let token = shutdown.token();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = telemetry_worker.run(token).await {
                error!(error = %err, "telemetry consumer exited");
            }
        }));

        if let Some(pool) = pool {
            let store = Arc::new(AlertStore::new(pool));
            stores_by_slug.push((area.slug.clone(), store.clone()));

            let alert_handlers: Vec<Arc<dyn MessageHandler>> = vec![Arc::new(AlertHandler {
                store,
                active_clients: active_clients.clone(),
            })];
            let alert_worker = ConsumerWorker::new(
                supervisor.clone(),
                cfg.exchange.clone(),
                routing.alert_queue.clone(),
                routing.alert_retry_routing_key.clone(),
                cfg.max_retries,
                alert_handlers,
                format!("alert-{}", area.slug),
            );
            let token = shutdown.token();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = alert_worker.run(token).await {
                    error!(error = %err, "alert consumer exited");
                }
            }));
        }
    }

    if let Some((_, store)) = stores_by_slug.first() {
        let source = Arc::new(PostgresRecentAlertsSource::new(store.clone()));
        let notifier = Arc::new(LoggingNotifier);
        let mode = if env_var_or("ALERT_NOTIFY_OBSERVE_ONLY", "false").eq_ignore_ascii_case("true") {
            NotificationMode::ObserveOnly
        } else {
            NotificationMode::NotifyAndRecord
        };
        let deduper = Arc::new(SchedulerDeduper::new(source, notifier, mode, scheduler_interval()));
        let interval = scheduler_interval();
        let active_clients = active_clients.clone();
        let mut token = shutdown.token();

        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let clients: Vec<String> = active_clients.iter().map(|e| e.key().clone()).collect();
                        deduper.tick(&clients).await;
                    }
                }
            }
        }));
    }

    info!(areas = areas.len(), "consumer bootstrap complete");

    shutdown.wait_for_os_signal().await;
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}
