//! Connection Supervisor (C3).
//!
//! Owns the single AMQP connection and its one shared channel. Reconnects
//! on loss with linear, capped backoff; single-flights concurrent
//! reconnect attempts so only one caller dials the broker at a time.
//!
//! The backoff shape mirrors the teacher's `RetryConfig::calculate_interval`
//! (`resilience/retry.rs`), generalized from exponential-with-jitter to the
//! linear-capped-at-30s curve the connection supervisor contract requires.

use std::sync::Arc;
use std::time::Duration;

use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::BrokerConfig;
use crate::error::CoreError;

/// Observable connection state, per §4.3's state table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSupervisorState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

/// Linear backoff capped at 30 seconds: `min(attempt * step, cap)`.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    pub step: Duration,
    pub cap: Duration,
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self {
            step: Duration::from_secs(1),
            cap: Duration::from_secs(30),
        }
    }
}

impl LinearBackoff {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.step.saturating_mul(attempt.max(1));
        scaled.min(self.cap)
    }
}

struct Inner {
    connection: Option<Connection>,
    channel: Option<Channel>,
    state: ConnectionSupervisorState,
    attempt: u32,
}

/// Single long-lived connection/channel pair, shared across the publisher
/// and every consumer worker via `get_channel`.
pub struct ConnectionSupervisor {
    cfg: BrokerConfig,
    backoff: LinearBackoff,
    inner: Mutex<Inner>,
}

impl ConnectionSupervisor {
    pub fn new(cfg: BrokerConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            backoff: LinearBackoff::default(),
            inner: Mutex::new(Inner {
                connection: None,
                channel: None,
                state: ConnectionSupervisorState::Disconnected,
                attempt: 0,
            }),
        })
    }

    /// Return a live channel, reconnecting (with backoff) if necessary.
    /// Concurrent callers single-flight on the same `Mutex`-guarded
    /// reconnect attempt rather than dialing in parallel.
    pub async fn get_channel(&self) -> Result<Channel, CoreError> {
        let mut guard = self.inner.lock().await;

        if let Some(channel) = &guard.channel {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
            // Channel/connection died: invalidate the cache and reconnect.
            guard.channel = None;
            guard.connection = None;
            guard.state = ConnectionSupervisorState::Disconnected;
        }

        loop {
            guard.state = ConnectionSupervisorState::Connecting;
            match self.dial().await {
                Ok((connection, channel)) => {
                    guard.attempt = 0;
                    guard.state = ConnectionSupervisorState::Connected;
                    guard.connection = Some(connection);
                    guard.channel = Some(channel.clone());
                    return Ok(channel);
                }
                Err(err) => {
                    guard.attempt += 1;
                    guard.state = ConnectionSupervisorState::Backoff;
                    let delay = self.backoff.delay_for_attempt(guard.attempt);
                    warn!(attempt = guard.attempt, ?delay, error = %err, "broker connect failed, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn dial(&self) -> Result<(Connection, Channel), CoreError> {
        let props = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        let connection = if self.cfg.tls_enabled() {
            self.dial_tls(props).await?
        } else {
            Connection::connect(&self.cfg.url, props)
                .await
                .map_err(CoreError::from)?
        };
        let channel = connection.create_channel().await.map_err(CoreError::from)?;
        if self.cfg.prefetch > 0 {
            channel
                .basic_qos(self.cfg.prefetch, lapin::options::BasicQosOptions::default())
                .await
                .map_err(CoreError::from)?;
        }
        info!(vhost = %self.cfg.vhost, "broker connection established");
        Ok((connection, channel))
    }

    /// Dial over TLS, optionally presenting a client certificate (mTLS) and
    /// trusting a custom CA, per §4.3.
    async fn dial_tls(&self, props: ConnectionProperties) -> Result<Connection, CoreError> {
        use lapin::tcp::{AMQPUriTcpExt, NativeTlsConnector};

        let tls = self.cfg.tls.clone();
        let mut builder = native_tls::TlsConnector::builder();

        if let Some(ca_path) = &tls.ca_cert_path {
            let pem = std::fs::read(ca_path)
                .map_err(|e| CoreError::Infrastructure(format!("reading TLS CA cert {ca_path}: {e}")))?;
            let ca_cert = native_tls::Certificate::from_pem(&pem)
                .map_err(|e| CoreError::Infrastructure(format!("parsing TLS CA cert {ca_path}: {e}")))?;
            builder.add_root_certificate(ca_cert);
        }
        if tls.is_mutual() {
            let cert_path = tls.client_cert_path.as_deref().unwrap();
            let key_path = tls.client_key_path.as_deref().unwrap();
            let cert_pem = std::fs::read(cert_path)
                .map_err(|e| CoreError::Infrastructure(format!("reading TLS client cert {cert_path}: {e}")))?;
            let key_pem = std::fs::read(key_path)
                .map_err(|e| CoreError::Infrastructure(format!("reading TLS client key {key_path}: {e}")))?;
            let identity = native_tls::Identity::from_pkcs8(&cert_pem, &key_pem)
                .map_err(|e| CoreError::Infrastructure(format!("building TLS client identity: {e}")))?;
            builder.identity(identity);
        }

        let mut connector: NativeTlsConnector = builder
            .build()
            .map_err(|e| CoreError::Infrastructure(format!("building TLS connector: {e}")))?;
        let domain_override = tls.domain.clone();

        Connection::connect_with(
            &self.cfg.url,
            props,
            Box::new(move |uri, tcp_options| {
                let domain = domain_override.clone().unwrap_or_else(|| uri.authority.host.clone());
                uri.connect(tcp_options)?.into_native_tls(&mut connector, &domain)
            }),
        )
        .await
        .map_err(CoreError::from)
    }

    pub async fn state(&self) -> ConnectionSupervisorState {
        self.inner.lock().await.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_linear_and_capped_at_thirty_seconds() {
        let backoff = LinearBackoff::default();
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(100), Duration::from_secs(30));
    }

    #[test]
    fn backoff_treats_attempt_zero_as_attempt_one() {
        let backoff = LinearBackoff::default();
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(1));
    }
}
