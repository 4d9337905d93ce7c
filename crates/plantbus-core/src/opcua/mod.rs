//! OPC-UA Sampling Loop (C12).
//!
//! The loop itself only depends on a narrow read-only client trait, so it
//! can be driven in tests against a fake without a live OPC-UA server. The
//! real binary wires this to the `opcua` crate's client session.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::area::{alert_routing_key, telemetry_routing_key, AreaRegistry};
use crate::broker::Publisher;
use crate::config::BrokerConfig;
use crate::envelope::{AlertPayload, DeviationLevel, EnrichedTag, Envelope, TelemetryPayload};
use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadQuality {
    Good,
    Uncertain,
    Bad,
}

impl ReadQuality {
    pub fn classify(status_code: &str) -> Self {
        let upper = status_code.to_uppercase();
        if upper.contains("BAD") {
            ReadQuality::Bad
        } else if upper.contains("UNCERTAIN") {
            ReadQuality::Uncertain
        } else {
            ReadQuality::Good
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeRead {
    pub value: Option<f64>,
    pub raw_value: serde_json::Value,
    pub browse_name: String,
    pub display_name: String,
    pub description: String,
    pub data_type: String,
    pub status_code: String,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub server_timestamp: Option<DateTime<Utc>>,
}

/// The subset of an OPC-UA session the sampling loop actually needs: one
/// attribute round-trip per node.
#[async_trait::async_trait]
pub trait OpcUaClient: Send + Sync {
    async fn read_node(&self, node_id: &str) -> Result<NodeRead, CoreError>;
}

/// Per-tag alarm thresholds and display metadata, position-indexed within
/// a client's `map_memory`.
#[derive(Debug, Clone)]
pub struct TagSetup {
    pub node_id: String,
    pub friendly_name: Option<String>,
    pub unidade: String,
    pub sp_alarm_ll: Option<f64>,
    pub sp_alarm_l: Option<f64>,
    pub sp_alarm_h: Option<f64>,
    pub sp_alarm_hh: Option<f64>,
}

/// Static per-client configuration: which nodes to read, at what cadence,
/// and under what identity to publish.
#[derive(Debug, Clone)]
pub struct ClientSetup {
    pub client_id: String,
    pub site: String,
    pub line: String,
    pub host_id: String,
    pub interval_ms: u64,
    pub map_memory: Vec<TagSetup>,
}

/// Resolve a tag's published name: the configured friendly name, or
/// `Tag_NN` (1-based position, zero-padded to two digits) as fallback.
pub fn tag_name(setup: &TagSetup, position: usize) -> String {
    setup
        .friendly_name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| format!("Tag_{:02}", position + 1))
}

/// Classify a numeric value against a tag's alarm thresholds. `None` means
/// no deviation; ties prefer the more severe (LL/HH) classification.
pub fn classify_deviation(value: f64, setup: &TagSetup) -> Option<DeviationLevel> {
    if let Some(ll) = setup.sp_alarm_ll {
        if value <= ll {
            return Some(DeviationLevel::LowLow);
        }
    }
    if let Some(hh) = setup.sp_alarm_hh {
        if value >= hh {
            return Some(DeviationLevel::HighHigh);
        }
    }
    if let Some(l) = setup.sp_alarm_l {
        if value <= l {
            return Some(DeviationLevel::Low);
        }
    }
    if let Some(h) = setup.sp_alarm_h {
        if value >= h {
            return Some(DeviationLevel::High);
        }
    }
    None
}

/// Per-read latency/outcome counters for one sampling cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub reads: u64,
    pub good: u64,
    pub uncertain: u64,
    pub bad: u64,
    pub failed: u64,
}

/// Drives one client's sampling loop: read every configured node, build a
/// telemetry envelope, publish it, and optionally evaluate the legacy
/// alert side-effect.
pub struct SamplingLoop {
    client: Arc<dyn OpcUaClient>,
    publisher: Arc<Publisher>,
    broker_cfg: BrokerConfig,
    registry: Arc<AreaRegistry>,
    setup: ClientSetup,
    default_recipients: Vec<String>,
    alert_suppress: DashMap<(String, &'static str), DateTime<Utc>>,
    alert_suppress_window: chrono::Duration,
}

impl SamplingLoop {
    pub fn new(
        client: Arc<dyn OpcUaClient>,
        publisher: Arc<Publisher>,
        broker_cfg: BrokerConfig,
        registry: Arc<AreaRegistry>,
        setup: ClientSetup,
        default_recipients: Vec<String>,
        alert_suppress_window: std::time::Duration,
    ) -> Self {
        Self {
            client,
            publisher,
            broker_cfg,
            registry,
            setup,
            default_recipients,
            alert_suppress: DashMap::new(),
            alert_suppress_window: chrono::Duration::from_std(alert_suppress_window)
                .unwrap_or(chrono::Duration::seconds(60)),
        }
    }

    /// Run one read-build-publish cycle. Node read failures are localized:
    /// the tag is published with a null value and the cycle continues.
    pub async fn run_once(&self) -> Result<CycleStats, CoreError> {
        let mut stats = CycleStats::default();
        let mut tags: HashMap<String, EnrichedTag> = HashMap::new();

        for (position, tag_setup) in self.setup.map_memory.iter().enumerate() {
            stats.reads += 1;
            let name = tag_name(tag_setup, position);

            match self.client.read_node(&tag_setup.node_id).await {
                Ok(read) => {
                    match ReadQuality::classify(&read.status_code) {
                        ReadQuality::Good => stats.good += 1,
                        ReadQuality::Uncertain => stats.uncertain += 1,
                        ReadQuality::Bad => stats.bad += 1,
                    }

                    tags.insert(
                        name.clone(),
                        EnrichedTag {
                            value: read.raw_value.clone(),
                            browse_name: read.browse_name.clone(),
                            display_name: read.display_name.clone(),
                            description: read.description.clone(),
                            data_type: read.data_type.clone(),
                            status_code: read.status_code.clone(),
                            source_timestamp: read.source_timestamp,
                            server_timestamp: read.server_timestamp,
                            min_value: tag_setup.sp_alarm_ll.or(tag_setup.sp_alarm_l),
                            max_value: tag_setup.sp_alarm_hh.or(tag_setup.sp_alarm_h),
                        },
                    );

                    if let Some(value) = read.value {
                        self.maybe_publish_alert(tag_setup, &name, value).await;
                    }
                }
                Err(_) => {
                    stats.failed += 1;
                    tags.insert(
                        name.clone(),
                        EnrichedTag {
                            value: serde_json::Value::Null,
                            browse_name: tag_setup.node_id.clone(),
                            display_name: name,
                            description: String::new(),
                            data_type: "Unknown".to_string(),
                            status_code: "Bad".to_string(),
                            source_timestamp: None,
                            server_timestamp: None,
                            min_value: None,
                            max_value: None,
                        },
                    );
                }
            }
        }

        let area = self.registry.resolve_area_by_site(&self.setup.site);
        let payload = TelemetryPayload {
            msg_id: Uuid::new_v4(),
            ts: Utc::now(),
            site: self.setup.site.clone(),
            line: self.setup.line.clone(),
            host_id: self.setup.host_id.clone(),
            client_id: self.setup.client_id.clone(),
            tags,
        };
        let envelope = Envelope::new("telemetry", 1, payload);
        let routing_key = telemetry_routing_key(&self.broker_cfg, &area.slug, &self.setup.client_id);
        self.publisher.publish(&routing_key, &envelope).await?;

        Ok(stats)
    }

    async fn maybe_publish_alert(&self, tag_setup: &TagSetup, tag_name: &str, value: f64) {
        let Some(desvio) = classify_deviation(value, tag_setup) else {
            return;
        };

        let key = (tag_name.to_string(), desvio.as_str());
        let now = Utc::now();
        if let Some(last) = self.alert_suppress.get(&key) {
            if now - *last < self.alert_suppress_window {
                return;
            }
        }
        self.alert_suppress.insert(key, now);

        let area = self.registry.resolve_area_by_site(&self.setup.site);
        let payload = AlertPayload {
            msg_id: Uuid::new_v4(),
            ts: now,
            site: Some(self.setup.site.clone()),
            client_id: self.setup.client_id.clone(),
            tag_name: tag_name.to_string(),
            value,
            desvio,
            alerts_count: 1,
            unidade: tag_setup.unidade.clone(),
            recipients: self.default_recipients.clone(),
            dedup_window_ms: None,
        };
        let envelope = Envelope::new("alert", 1, payload);
        let routing_key = alert_routing_key(&area.slug, &self.setup.client_id);
        let _ = self.publisher.publish(&routing_key, &envelope).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(ll: Option<f64>, l: Option<f64>, h: Option<f64>, hh: Option<f64>) -> TagSetup {
        TagSetup {
            node_id: "ns=2;s=Tag1".into(),
            friendly_name: None,
            unidade: "C".into(),
            sp_alarm_ll: ll,
            sp_alarm_l: l,
            sp_alarm_h: h,
            sp_alarm_hh: hh,
        }
    }

    #[test]
    fn tag_name_falls_back_to_positional_zero_padded_name() {
        let s = setup(None, None, None, None);
        assert_eq!(tag_name(&s, 0), "Tag_01");
        assert_eq!(tag_name(&s, 8), "Tag_09");
    }

    #[test]
    fn tag_name_prefers_friendly_name_when_present() {
        let mut s = setup(None, None, None, None);
        s.friendly_name = Some("Temperatura".into());
        assert_eq!(tag_name(&s, 0), "Temperatura");
    }

    #[test]
    fn classify_deviation_picks_most_severe_bound() {
        let s = setup(Some(0.0), Some(10.0), Some(90.0), Some(100.0));
        assert_eq!(classify_deviation(-1.0, &s), Some(DeviationLevel::LowLow));
        assert_eq!(classify_deviation(5.0, &s), Some(DeviationLevel::Low));
        assert_eq!(classify_deviation(50.0, &s), None);
        assert_eq!(classify_deviation(95.0, &s), Some(DeviationLevel::High));
        assert_eq!(classify_deviation(101.0, &s), Some(DeviationLevel::HighHigh));
    }

    #[test]
    fn classify_deviation_with_no_thresholds_never_triggers() {
        let s = setup(None, None, None, None);
        assert_eq!(classify_deviation(1_000_000.0, &s), None);
    }
}
