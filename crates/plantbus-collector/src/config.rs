//! On-disk client/tag configuration for the sampling loop.
//!
//! `OPCUA_CLIENTS_CONFIG_PATH` points at a JSON file: an array of per-client
//! setups, each carrying its ordered `mapMemory` (the OPC-UA node list read
//! every cycle). Tag names fall back to `Tag_NN` when `friendlyName` is
//! absent, per [`plantbus_core::opcua::tag_name`].

use plantbus_core::error::CoreError;
use plantbus_core::opcua::{ClientSetup, TagSetup};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct TagSetupDto {
    #[serde(rename = "nodeId")]
    node_id: String,
    #[serde(rename = "friendlyName")]
    friendly_name: Option<String>,
    #[serde(default)]
    unidade: String,
    #[serde(rename = "spAlarmLL")]
    sp_alarm_ll: Option<f64>,
    #[serde(rename = "spAlarmL")]
    sp_alarm_l: Option<f64>,
    #[serde(rename = "spAlarmH")]
    sp_alarm_h: Option<f64>,
    #[serde(rename = "spAlarmHH")]
    sp_alarm_hh: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ClientSetupDto {
    #[serde(rename = "clientId")]
    client_id: String,
    site: String,
    #[serde(default)]
    line: String,
    #[serde(rename = "hostId", default)]
    host_id: String,
    #[serde(rename = "endpointUrl")]
    endpoint_url: String,
    #[serde(rename = "intervalMs", default = "default_interval_ms")]
    interval_ms: u64,
    #[serde(rename = "mapMemory")]
    map_memory: Vec<TagSetupDto>,
}

fn default_interval_ms() -> u64 {
    2000
}

pub struct ConfiguredClient {
    pub endpoint_url: String,
    pub setup: ClientSetup,
}

pub fn load_clients(path: &str) -> Result<Vec<ConfiguredClient>, CoreError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| CoreError::Infrastructure(format!("reading {path}: {e}")))?;
    let dtos: Vec<ClientSetupDto> = serde_json::from_str(&raw)
        .map_err(|e| CoreError::Infrastructure(format!("parsing {path}: {e}")))?;

    Ok(dtos
        .into_iter()
        .map(|dto| ConfiguredClient {
            endpoint_url: dto.endpoint_url,
            setup: ClientSetup {
                client_id: dto.client_id,
                site: dto.site,
                line: dto.line,
                host_id: dto.host_id,
                interval_ms: dto.interval_ms,
                map_memory: dto
                    .map_memory
                    .into_iter()
                    .map(|tag| TagSetup {
                        node_id: tag.node_id,
                        friendly_name: tag.friendly_name,
                        unidade: tag.unidade,
                        sp_alarm_ll: tag.sp_alarm_ll,
                        sp_alarm_l: tag.sp_alarm_l,
                        sp_alarm_h: tag.sp_alarm_h,
                        sp_alarm_hh: tag.sp_alarm_hh,
                    })
                    .collect(),
            },
        })
        .collect())
}
