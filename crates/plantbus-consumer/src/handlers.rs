//! Per-area message handlers wired into [`plantbus_core::broker::ConsumerWorker`].

use std::sync::Arc;

use dashmap::DashMap;
use plantbus_core::alerts::{process_alert, AlertStore};
use plantbus_core::broker::{DispatchOutcome, MessageHandler};
use plantbus_core::envelope::{AlertPayload, TelemetryPayload};
use plantbus_core::error::CoreError;
use plantbus_core::rate_meter::RateMeter;
use tracing::{info, warn};

pub struct TelemetryHandler {
    pub rate_meter: Arc<RateMeter>,
}

#[async_trait::async_trait]
impl MessageHandler for TelemetryHandler {
    fn kind(&self) -> &str {
        "telemetry"
    }

    fn version(&self) -> u32 {
        1
    }

    async fn handle(&self, payload_json: &serde_json::Value) -> DispatchOutcome {
        match serde_json::from_value::<TelemetryPayload>(payload_json.clone()) {
            Ok(payload) => {
                self.rate_meter.record_inserts(&payload.client_id, payload.tags.len() as i64);
                info!(client_id = %payload.client_id, tags = payload.tags.len(), "telemetry received");
                DispatchOutcome::Success
            }
            Err(err) => DispatchOutcome::Fatal(format!("malformed telemetry payload: {err}")),
        }
    }
}

pub struct AlertHandler {
    pub store: Arc<AlertStore>,
    pub active_clients: Arc<DashMap<String, ()>>,
}

#[async_trait::async_trait]
impl MessageHandler for AlertHandler {
    fn kind(&self) -> &str {
        "alert"
    }

    fn version(&self) -> u32 {
        1
    }

    async fn handle(&self, payload_json: &serde_json::Value) -> DispatchOutcome {
        let payload: AlertPayload = match serde_json::from_value(payload_json.clone()) {
            Ok(payload) => payload,
            Err(err) => return DispatchOutcome::Fatal(format!("malformed alert payload: {err}")),
        };

        self.active_clients.insert(payload.client_id.clone(), ());

        match process_alert(&self.store, &payload).await {
            Ok(outcome) => {
                info!(client_id = %payload.client_id, saved = outcome.saved, "alert processed");
                DispatchOutcome::Success
            }
            Err(CoreError::Validation(msg)) => DispatchOutcome::Fatal(msg),
            Err(err) => {
                warn!(error = %err, "alert processing failed, will retry");
                DispatchOutcome::Retryable(err.to_string())
            }
        }
    }
}
