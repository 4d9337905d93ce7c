//! Publisher (C4).
//!
//! Publishes versioned envelopes with persistent delivery and, when the
//! channel is in confirm mode, waits for the broker's ack before returning.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::BasicProperties;
use serde::Serialize;
use tracing::debug;

use crate::broker::supervisor::ConnectionSupervisor;
use crate::config::BrokerConfig;
use crate::error::CoreError;

pub struct Publisher {
    supervisor: Arc<ConnectionSupervisor>,
    exchange: String,
    confirm: bool,
}

impl Publisher {
    pub async fn new(
        supervisor: Arc<ConnectionSupervisor>,
        cfg: &BrokerConfig,
        publish_confirm: bool,
    ) -> Result<Self, CoreError> {
        if publish_confirm {
            let channel = supervisor.get_channel().await?;
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await?;
        }
        Ok(Self {
            supervisor,
            exchange: cfg.exchange.clone(),
            confirm: publish_confirm,
        })
    }

    /// Serialize `envelope` as JSON and publish to the main exchange with
    /// the given routing key. Returns whether the broker accepted the
    /// publish without backpressure (and, in confirm mode, acked it).
    pub async fn publish<T: Serialize>(&self, routing_key: &str, envelope: &T) -> Result<bool, CoreError> {
        let body = serde_json::to_vec(envelope)
            .map_err(|e| CoreError::Validation(format!("envelope serialize: {e}")))?;

        let channel = self.supervisor.get_channel().await?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2)
            .with_timestamp(timestamp);

        let confirm = channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?;

        if self.confirm {
            let confirmation = confirm.await?;
            let accepted = !confirmation.is_nack();
            debug!(routing_key, accepted, "publish confirmed");
            Ok(accepted)
        } else {
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Dummy {
        value: u32,
    }

    #[test]
    fn envelope_serializes_to_json_bytes() {
        let body = serde_json::to_vec(&Dummy { value: 1 }).unwrap();
        assert_eq!(body, br#"{"value":1}"#);
    }
}
