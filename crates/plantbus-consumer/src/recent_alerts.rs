//! Postgres-backed [`RecentAlertsSource`] and a log-only [`Notifier`].
//!
//! The legacy file-log recent-alerts source and the real email/WhatsApp
//! delivery integrations are out of scope here; this binary ships the
//! Postgres-backed read path and a logging stand-in for delivery.

use std::sync::Arc;

use plantbus_core::alerts::{AlertFilters, AlertStore, Notifier, RecentAlertsSource};
use plantbus_core::envelope::AlertSample;
use plantbus_core::error::CoreError;
use tracing::info;

pub struct PostgresRecentAlertsSource {
    store: Arc<AlertStore>,
}

impl PostgresRecentAlertsSource {
    pub fn new(store: Arc<AlertStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl RecentAlertsSource for PostgresRecentAlertsSource {
    async fn recent_alerts(&self, client_id: &str) -> Result<Vec<AlertSample>, CoreError> {
        let filters = AlertFilters {
            client_id: client_id.to_string(),
            limit: Some(100),
            ..Default::default()
        };
        self.store.find_by_filters(&filters).await
    }
}

pub struct LoggingNotifier;

#[async_trait::async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, client_id: &str, alert: &AlertSample) -> Result<(), CoreError> {
        info!(
            client_id,
            tag = %alert.tag_name,
            desvio = alert.desvio.as_str(),
            recipients = ?alert.recipients,
            "notification dispatched"
        );
        Ok(())
    }
}
