//! Real OPC-UA client backing [`plantbus_core::opcua::OpcUaClient`].
//!
//! The core sampling loop only needs one attribute round-trip per node; this
//! wraps the `opcua` crate's session behind that narrow trait so the loop
//! itself stays testable without a live server.

use std::str::FromStr;
use std::sync::Arc;

use opcua::client::prelude::{
    AttributeId, Client, ClientBuilder, IdentityToken, NodeId, ReadValueId, Session,
    TimestampsToReturn,
};
use opcua::types::DataValue;
use parking_lot::RwLock;
use plantbus_core::error::CoreError;
use plantbus_core::opcua::{NodeRead, OpcUaClient};

pub struct RealOpcUaClient {
    session: Arc<RwLock<Session>>,
}

impl RealOpcUaClient {
    /// Connect and activate a session against `endpoint_url`, identified
    /// anonymously unless credentials are supplied via environment (left to
    /// the caller to plumb through `ClientBuilder` as deployment requires).
    pub fn connect(endpoint_url: &str, application_name: &str) -> Result<Self, CoreError> {
        let mut client = ClientBuilder::new()
            .application_name(application_name)
            .application_uri("urn:plantbus-collector")
            .session_retry_limit(3)
            .client()
            .ok_or_else(|| CoreError::OpcUa("failed to build OPC-UA client".into()))?;

        let session = client
            .connect_to_endpoint_id(endpoint_url, IdentityToken::Anonymous)
            .map_err(|e| CoreError::OpcUa(format!("connect failed: {e}")))?;

        Ok(Self { session })
    }
}

#[async_trait::async_trait]
impl OpcUaClient for RealOpcUaClient {
    async fn read_node(&self, node_id: &str) -> Result<NodeRead, CoreError> {
        let node =
            NodeId::from_str(node_id).map_err(|_| CoreError::OpcUa(format!("invalid node id: {node_id}")))?;
        let session = self.session.clone();
        let node_for_task = node.clone();

        let values = tokio::task::spawn_blocking(move || -> Result<Vec<DataValue>, String> {
            let attrs = [
                AttributeId::Value,
                AttributeId::BrowseName,
                AttributeId::DisplayName,
                AttributeId::Description,
                AttributeId::DataType,
            ];
            let nodes_to_read: Vec<ReadValueId> = attrs
                .iter()
                .map(|attribute| ReadValueId::from((node_for_task.clone(), *attribute)))
                .collect();

            let session = session.read();
            session
                .read(&nodes_to_read, TimestampsToReturn::Both, 0.0)
                .map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| CoreError::OpcUa(format!("read task panicked: {e}")))?
        .map_err(CoreError::OpcUa)?;

        build_node_read(&values)
    }
}

fn build_node_read(values: &[DataValue]) -> Result<NodeRead, CoreError> {
    if values.len() < 5 {
        return Err(CoreError::OpcUa("short read result".into()));
    }

    let value = &values[0];
    let status_code = value
        .status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "Bad".to_string());

    let raw_value = value
        .value
        .as_ref()
        .map(variant_to_json)
        .unwrap_or(serde_json::Value::Null);
    let numeric_value = raw_value.as_f64();

    Ok(NodeRead {
        value: numeric_value,
        raw_value,
        browse_name: values[1]
            .value
            .as_ref()
            .map(variant_to_string)
            .unwrap_or_default(),
        display_name: values[2]
            .value
            .as_ref()
            .map(variant_to_string)
            .unwrap_or_default(),
        description: values[3]
            .value
            .as_ref()
            .map(variant_to_string)
            .unwrap_or_default(),
        data_type: values[4]
            .value
            .as_ref()
            .map(variant_to_string)
            .unwrap_or_default(),
        status_code,
        source_timestamp: value
            .source_timestamp
            .and_then(|ts| chrono::DateTime::parse_from_rfc3339(&ts.to_string()).ok())
            .map(|ts| ts.with_timezone(&chrono::Utc)),
        server_timestamp: value
            .server_timestamp
            .and_then(|ts| chrono::DateTime::parse_from_rfc3339(&ts.to_string()).ok())
            .map(|ts| ts.with_timezone(&chrono::Utc)),
    })
}

fn variant_to_string(variant: &opcua::types::Variant) -> String {
    variant.to_string()
}

fn variant_to_json(variant: &opcua::types::Variant) -> serde_json::Value {
    match variant {
        opcua::types::Variant::Boolean(v) => serde_json::Value::Bool(*v),
        opcua::types::Variant::Byte(v) => serde_json::Value::from(*v),
        opcua::types::Variant::SByte(v) => serde_json::Value::from(*v),
        opcua::types::Variant::Int16(v) => serde_json::Value::from(*v),
        opcua::types::Variant::UInt16(v) => serde_json::Value::from(*v),
        opcua::types::Variant::Int32(v) => serde_json::Value::from(*v),
        opcua::types::Variant::UInt32(v) => serde_json::Value::from(*v),
        opcua::types::Variant::Int64(v) => serde_json::Value::from(*v),
        opcua::types::Variant::UInt64(v) => serde_json::Value::from(*v),
        opcua::types::Variant::Float(v) => serde_json::Value::from(*v),
        opcua::types::Variant::Double(v) => serde_json::Value::from(*v),
        opcua::types::Variant::String(v) => serde_json::Value::String(v.to_string()),
        other => serde_json::Value::String(other.to_string()),
    }
}
