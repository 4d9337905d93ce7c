//! Shared domain logic for the telemetry and alerting backbone: area
//! routing, broker topology/connection/publish/consume/retry, alert
//! persistence and processing, the notification scheduler, the multi-DB
//! read fan-out, the insert-rate meter, and the OPC-UA sampling loop.

pub mod alerts;
pub mod area;
pub mod broker;
pub mod config;
pub mod envelope;
pub mod error;
pub mod opcua;
pub mod rate_meter;
pub mod shutdown;

pub use error::CoreError;
