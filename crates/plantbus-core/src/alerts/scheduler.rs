//! Scheduler Notification Deduper (C9).
//!
//! Walks active clients on a timer, reads each client's recent alerts from
//! an abstract source, and notifies at most once per `(client, tag-desvio)`
//! pair within the scheduler interval.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::envelope::AlertSample;
use crate::error::CoreError;

/// Where the scheduler reads a client's recent alert history from. The
/// only shipped implementation is Postgres-backed, reusing C7's filtered
/// read path; a file-log-backed source is a documented alternative this
/// workspace does not implement.
#[async_trait::async_trait]
pub trait RecentAlertsSource: Send + Sync {
    async fn recent_alerts(&self, client_id: &str) -> Result<Vec<AlertSample>, CoreError>;
}

/// External delivery collaborator (email, WhatsApp, etc).
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, client_id: &str, alert: &AlertSample) -> Result<(), CoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationMode {
    /// Deliver through the notifier and record the dedup timestamp.
    NotifyAndRecord,
    /// Log the would-be notification only; never calls the notifier.
    ObserveOnly,
}

struct RateState {
    value: f64,
    at_ms: i64,
}

/// Dedupes per-(client, tag-desvio) notifications across ticks, and keeps
/// a derivative rate-of-change helper per arbitrary key.
pub struct SchedulerDeduper {
    source: Arc<dyn RecentAlertsSource>,
    notifier: Arc<dyn Notifier>,
    mode: NotificationMode,
    interval: chrono::Duration,
    last_sent: DashMap<(String, String), DateTime<Utc>>,
    rate_state: DashMap<String, RateState>,
}

impl SchedulerDeduper {
    pub fn new(
        source: Arc<dyn RecentAlertsSource>,
        notifier: Arc<dyn Notifier>,
        mode: NotificationMode,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            source,
            notifier,
            mode,
            interval: chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::seconds(300)),
            last_sent: DashMap::new(),
            rate_state: DashMap::new(),
        }
    }

    /// One scheduler pass over `clients`.
    pub async fn tick(&self, clients: &[String]) {
        for client_id in clients {
            let alerts = match self.source.recent_alerts(client_id).await {
                Ok(alerts) => alerts,
                Err(err) => {
                    error!(client_id, error = %err, "failed to read recent alerts for notification pass");
                    continue;
                }
            };

            for alert in &alerts {
                self.consider(client_id, alert).await;
            }
        }
    }

    async fn consider(&self, client_id: &str, alert: &AlertSample) {
        let dedup_key = format!("{}-{}", alert.tag_name, alert.desvio.as_str());
        let now = Utc::now();
        let key = (client_id.to_string(), dedup_key);

        let should_notify = match self.last_sent.get(&key) {
            Some(entry) => now - *entry >= self.interval,
            None => true,
        };
        if !should_notify {
            return;
        }

        match self.mode {
            NotificationMode::ObserveOnly => {
                info!(client_id, tag = %alert.tag_name, desvio = alert.desvio.as_str(), "would notify (observe-only)");
                self.last_sent.insert(key, now);
            }
            NotificationMode::NotifyAndRecord => match self.notifier.notify(client_id, alert).await {
                Ok(()) => {
                    self.last_sent.insert(key, now);
                }
                Err(err) => {
                    warn!(client_id, error = %err, "notification delivery failed, will retry next tick");
                }
            },
        }
    }

    /// `(current - prev.value) / ((now - prev.t) / 1000)` when both deltas
    /// are non-negative and time actually advanced; zero otherwise, zero on
    /// first observation. State is a single `(value, t)` pair per key and
    /// is never pruned.
    pub fn rate_per_sec(&self, key: &str, current: f64, now_ms: i64) -> f64 {
        let rate = match self.rate_state.get(key) {
            Some(prev) => {
                let dt_ms = now_ms - prev.at_ms;
                let dv = current - prev.value;
                if dt_ms > 0 && dv >= 0.0 {
                    dv / (dt_ms as f64 / 1000.0)
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.rate_state.insert(
            key.to_string(),
            RateState {
                value: current,
                at_ms: now_ms,
            },
        );
        rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource(Vec<AlertSample>);

    #[async_trait::async_trait]
    impl RecentAlertsSource for FixedSource {
        async fn recent_alerts(&self, _client_id: &str) -> Result<Vec<AlertSample>, CoreError> {
            Ok(self.0.clone())
        }
    }

    struct CountingNotifier {
        count: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Notifier for CountingNotifier {
        async fn notify(&self, _client_id: &str, _alert: &AlertSample) -> Result<(), CoreError> {
            self.count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    fn sample() -> AlertSample {
        AlertSample {
            id: uuid::Uuid::new_v4(),
            client_id: "plant-A".into(),
            site: None,
            timestamp: Utc::now(),
            tag_name: "TEMP_01".into(),
            value: 90.0,
            desvio: crate::envelope::DeviationLevel::High,
            alerts_count: 1,
            unidade: "C".into(),
            recipients: vec![],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn second_tick_within_interval_does_not_renotify() {
        let notifier = Arc::new(CountingNotifier {
            count: std::sync::atomic::AtomicUsize::new(0),
        });
        let source = Arc::new(FixedSource(vec![sample()]));
        let deduper = SchedulerDeduper::new(
            source,
            notifier.clone(),
            NotificationMode::NotifyAndRecord,
            std::time::Duration::from_secs(300),
        );

        deduper.tick(&["plant-A".to_string()]).await;
        deduper.tick(&["plant-A".to_string()]).await;

        assert_eq!(notifier.count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn rate_per_sec_is_zero_on_first_observation() {
        let deduper = SchedulerDeduper::new(
            Arc::new(FixedSource(vec![])),
            Arc::new(CountingNotifier {
                count: std::sync::atomic::AtomicUsize::new(0),
            }),
            NotificationMode::ObserveOnly,
            std::time::Duration::from_secs(300),
        );
        assert_eq!(deduper.rate_per_sec("k", 10.0, 1_000), 0.0);
        assert_eq!(deduper.rate_per_sec("k", 20.0, 2_000), 10.0);
    }

    #[test]
    fn rate_per_sec_is_zero_on_negative_delta() {
        let deduper = SchedulerDeduper::new(
            Arc::new(FixedSource(vec![])),
            Arc::new(CountingNotifier {
                count: std::sync::atomic::AtomicUsize::new(0),
            }),
            NotificationMode::ObserveOnly,
            std::time::Duration::from_secs(300),
        );
        deduper.rate_per_sec("k", 10.0, 1_000);
        assert_eq!(deduper.rate_per_sec("k", 5.0, 2_000), 0.0);
    }
}
