//! Consumer Workers (C5).
//!
//! One consume loop per area per stream (telemetry, alerts). Each message
//! is decoded, dispatched to a handler keyed by `(type, version)`, and
//! acked/nacked/republished per the protocol in §4.5.

use std::sync::Arc;

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions};
use lapin::types::ShortString;
use lapin::types::{AMQPValue, FieldTable};
use lapin::Channel;
use tracing::{error, info, warn};

use crate::broker::retry::{retry_count, retry_policy, RetryDecision};
use crate::broker::supervisor::ConnectionSupervisor;
use crate::envelope::Envelope;
use crate::error::CoreError;
use crate::shutdown::ShutdownToken;

pub type ConsumeStream = lapin::Consumer;

/// Outcome of dispatching one decoded envelope to its handler.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Processed successfully.
    Success,
    /// Fatal validation error: ack and discard, never retry.
    Fatal(String),
    /// Infrastructure-ish failure: worth a retry.
    Retryable(String),
}

/// Implemented once per (stream, version) pair the worker needs to
/// understand. `kind`/`version` identify which envelopes this handler
/// accepts; unrecognized envelopes are a `Fatal` dispatch outcome.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    fn kind(&self) -> &str;
    fn version(&self) -> u32;
    async fn handle(&self, payload_json: &serde_json::Value) -> DispatchOutcome;
}

/// Drives one area/stream's consume loop against a set of handlers.
pub struct ConsumerWorker {
    supervisor: Arc<ConnectionSupervisor>,
    exchange: String,
    queue: String,
    retry_routing_key: String,
    max_retries: u32,
    handlers: Vec<Arc<dyn MessageHandler>>,
    consumer_tag: String,
}

impl ConsumerWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        exchange: String,
        queue: String,
        retry_routing_key: String,
        max_retries: u32,
        handlers: Vec<Arc<dyn MessageHandler>>,
        consumer_tag: impl Into<String>,
    ) -> Self {
        Self {
            supervisor,
            exchange,
            queue,
            retry_routing_key,
            max_retries,
            handlers,
            consumer_tag: consumer_tag.into(),
        }
    }

    /// Run the consume loop until `shutdown` is signaled. Re-establishes
    /// the consumer subscription if the underlying channel drops.
    pub async fn run(&self, mut shutdown: ShutdownToken) -> Result<(), CoreError> {
        loop {
            if shutdown.is_shutdown() {
                return Ok(());
            }

            let channel = self.supervisor.get_channel().await?;
            let mut consumer = channel
                .basic_consume(
                    &self.queue,
                    &self.consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;

            info!(queue = %self.queue, "consumer subscribed");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!(queue = %self.queue, "consumer draining on shutdown");
                        return Ok(());
                    }
                    next = consumer.next() => {
                        match next {
                            Some(Ok(delivery)) => {
                                if let Err(err) = self.process(&channel, delivery).await {
                                    error!(queue = %self.queue, error = %err, "failed to process delivery");
                                }
                            }
                            Some(Err(err)) => {
                                warn!(queue = %self.queue, error = %err, "consumer stream error, reconnecting");
                                break;
                            }
                            None => {
                                warn!(queue = %self.queue, "consumer stream ended, reconnecting");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn process(&self, channel: &Channel, delivery: Delivery) -> Result<(), CoreError> {
        let outcome = match serde_json::from_slice::<Envelope<serde_json::Value>>(&delivery.data) {
            Ok(envelope) => self.dispatch(&envelope).await,
            Err(err) => {
                // Bad payloads recycle forever if nacked/requeued: ack and
                // log instead, per §4.5 step 1.
                warn!(queue = %self.queue, error = %err, "undecodable envelope, acking and discarding");
                delivery.ack(BasicAckOptions::default()).await?;
                return Ok(());
            }
        };

        match outcome {
            DispatchOutcome::Success => {
                delivery.ack(BasicAckOptions::default()).await?;
            }
            DispatchOutcome::Fatal(reason) => {
                warn!(queue = %self.queue, reason, "fatal dispatch error, acking and discarding");
                delivery.ack(BasicAckOptions::default()).await?;
            }
            DispatchOutcome::Retryable(reason) => {
                let current = retry_count(&delivery);
                match retry_policy(current, self.max_retries) {
                    RetryDecision::RepublishWithRetryCount(next) => {
                        warn!(queue = %self.queue, reason, next_retry = next, "retryable error, republishing to retry queue");
                        self.republish_with_retry(channel, &delivery, next).await?;
                        delivery.ack(BasicAckOptions::default()).await?;
                    }
                    RetryDecision::Escalate => {
                        warn!(queue = %self.queue, reason, "retries exhausted, routing to DLQ");
                        delivery
                            .nack(BasicNackOptions {
                                multiple: false,
                                requeue: false,
                            })
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&self, envelope: &Envelope<serde_json::Value>) -> DispatchOutcome {
        match self
            .handlers
            .iter()
            .find(|h| h.kind() == envelope.kind && h.version() == envelope.version)
        {
            Some(handler) => handler.handle(&envelope.payload).await,
            None => DispatchOutcome::Fatal(format!(
                "unrecognized envelope type={} version={}",
                envelope.kind, envelope.version
            )),
        }
    }

    async fn republish_with_retry(
        &self,
        channel: &Channel,
        delivery: &Delivery,
        next_retry: i64,
    ) -> Result<(), CoreError> {
        let mut headers = delivery
            .properties
            .headers()
            .clone()
            .unwrap_or_default();
        headers.insert(
            ShortString::from("x-retry"),
            AMQPValue::LongLongInt(next_retry),
        );

        let properties = delivery
            .properties
            .clone()
            .with_headers(headers);

        channel
            .basic_publish(
                &self.exchange,
                &self.retry_routing_key,
                BasicPublishOptions::default(),
                &delivery.data,
                properties,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct EchoHandler;

    #[async_trait]
    impl MessageHandler for EchoHandler {
        fn kind(&self) -> &str {
            "telemetry"
        }
        fn version(&self) -> u32 {
            1
        }
        async fn handle(&self, _payload_json: &serde_json::Value) -> DispatchOutcome {
            DispatchOutcome::Success
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl MessageHandler for FailingHandler {
        fn kind(&self) -> &str {
            "alert"
        }
        fn version(&self) -> u32 {
            1
        }
        async fn handle(&self, _payload_json: &serde_json::Value) -> DispatchOutcome {
            DispatchOutcome::Retryable("db down".into())
        }
    }

    #[tokio::test]
    async fn unrecognized_type_version_dispatches_fatal() {
        let handlers: Vec<Arc<dyn MessageHandler>> = vec![Arc::new(EchoHandler)];
        let envelope = Envelope::new("unknown-type", 99, serde_json::json!({}));
        let matched = handlers
            .iter()
            .find(|h| h.kind() == envelope.kind && h.version() == envelope.version);
        assert!(matched.is_none());
    }

    #[tokio::test]
    async fn recognized_envelope_dispatches_to_matching_handler() {
        let handler = EchoHandler;
        let outcome = handler.handle(&serde_json::json!({})).await;
        assert!(matches!(outcome, DispatchOutcome::Success));

        let failing = FailingHandler;
        let outcome = failing.handle(&serde_json::json!({})).await;
        assert!(matches!(outcome, DispatchOutcome::Retryable(_)));
    }
}
