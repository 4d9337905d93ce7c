//! Wire types: the versioned envelope and the two payload shapes it carries.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The versioned wrapper around any broker message. `type` + `version`
/// together identify the payload schema; a consumer unable to recognize
/// the pair fails the message as non-retryable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: u32,
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(kind: impl Into<String>, version: u32, payload: T) -> Self {
        Self {
            kind: kind.into(),
            version,
            payload,
        }
    }
}

/// OPC-UA-sourced value plus its protocol metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedTag {
    pub value: serde_json::Value,
    #[serde(rename = "browseName")]
    pub browse_name: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub description: String,
    #[serde(rename = "dataType")]
    pub data_type: String,
    #[serde(rename = "statusCode")]
    pub status_code: String,
    #[serde(rename = "sourceTimestamp")]
    pub source_timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "serverTimestamp")]
    pub server_timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "minValue")]
    pub min_value: Option<f64>,
    #[serde(rename = "maxValue")]
    pub max_value: Option<f64>,
}

/// Telemetry payload, §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryPayload {
    #[serde(rename = "msgId")]
    pub msg_id: Uuid,
    pub ts: DateTime<Utc>,
    pub site: String,
    pub line: String,
    #[serde(rename = "hostId")]
    pub host_id: String,
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub tags: HashMap<String, EnrichedTag>,
}

/// Deviation level, a closed set. `LL`/`HH` are critical, `L`/`H` are
/// warnings, `Unknown` is the fallback for unrecognized input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviationLevel {
    #[serde(rename = "LL")]
    LowLow,
    #[serde(rename = "L")]
    Low,
    #[serde(rename = "H")]
    High,
    #[serde(rename = "HH")]
    HighHigh,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl DeviationLevel {
    pub fn is_critical(&self) -> bool {
        matches!(self, DeviationLevel::LowLow | DeviationLevel::HighHigh)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviationLevel::LowLow => "LL",
            DeviationLevel::Low => "L",
            DeviationLevel::High => "H",
            DeviationLevel::HighHigh => "HH",
            DeviationLevel::Unknown => "UNKNOWN",
        }
    }

    /// Parse from a free-form string (case-insensitive), falling back to
    /// `Unknown` for anything not in the closed set — never an error, per
    /// §3.1's "or UNKNOWN" escape hatch.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "LL" => DeviationLevel::LowLow,
            "L" => DeviationLevel::Low,
            "H" => DeviationLevel::High,
            "HH" => DeviationLevel::HighHigh,
            _ => DeviationLevel::Unknown,
        }
    }
}

/// Alert payload as published on the broker, §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertPayload {
    #[serde(rename = "msgId")]
    pub msg_id: Uuid,
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "tagName")]
    pub tag_name: String,
    pub value: f64,
    pub desvio: DeviationLevel,
    #[serde(rename = "alertsCount")]
    pub alerts_count: i64,
    pub unidade: String,
    pub recipients: Vec<String>,
    #[serde(rename = "dedupWindowMs", skip_serializing_if = "Option::is_none")]
    pub dedup_window_ms: Option<i64>,
}

/// Persisted alert row — `AlertPayload` plus storage-assigned fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSample {
    pub id: Uuid,
    pub client_id: String,
    pub site: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub tag_name: String,
    pub value: f64,
    pub desvio: DeviationLevel,
    pub alerts_count: i64,
    pub unidade: String,
    pub recipients: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-client aggregate summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSummary {
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub total: i64,
    #[serde(rename = "byLevel")]
    pub by_level: HashMap<String, i64>,
    #[serde(rename = "byTag")]
    pub by_tag: HashMap<String, i64>,
    #[serde(rename = "lastTimestamp")]
    pub last_timestamp: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let env = Envelope::new(
            "alert",
            1,
            AlertPayload {
                msg_id: Uuid::nil(),
                ts: Utc::now(),
                site: Some("Pasteurizacao".into()),
                client_id: "plant-A".into(),
                tag_name: "TEMP_01".into(),
                value: 211.0,
                desvio: DeviationLevel::HighHigh,
                alerts_count: 1,
                unidade: "C".into(),
                recipients: vec!["ops@example.invalid".into()],
                dedup_window_ms: Some(300_000),
            },
        );
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope<AlertPayload> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, "alert");
        assert_eq!(back.version, 1);
        assert_eq!(back.payload.client_id, "plant-A");
        assert_eq!(back.payload.desvio, DeviationLevel::HighHigh);
    }

    #[test]
    fn deviation_level_parses_leniently_to_unknown() {
        assert_eq!(DeviationLevel::parse_lenient("hh"), DeviationLevel::HighHigh);
        assert_eq!(DeviationLevel::parse_lenient("weird"), DeviationLevel::Unknown);
        assert_eq!(DeviationLevel::parse_lenient(""), DeviationLevel::Unknown);
    }

    #[test]
    fn critical_levels_are_ll_and_hh_only() {
        assert!(DeviationLevel::LowLow.is_critical());
        assert!(DeviationLevel::HighHigh.is_critical());
        assert!(!DeviationLevel::Low.is_critical());
        assert!(!DeviationLevel::High.is_critical());
        assert!(!DeviationLevel::Unknown.is_critical());
    }
}
