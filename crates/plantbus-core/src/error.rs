//! Domain-level error kinds shared across every component.
//!
//! Mirrors the eight kinds from the error handling design: each carries
//! whether it is retryable and, for the HTTP read surface, the status code
//! it maps to. Components never invent ad-hoc `String` errors for anything
//! that crosses a component boundary.

use serde::Serialize;

/// A domain-level error kind, shared by the broker, alert, and HTTP paths.
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    /// Input payload malformed. Not retryable.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Requested entity absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique-key violation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Database infrastructure failure. Often retryable.
    #[error("database error: {0}")]
    Database(String),

    /// Broker channel/connection failure. Retryable via reconnect.
    #[error("broker error: {0}")]
    Broker(String),

    /// OPC-UA read/connection failure. Retryable, localized to one node.
    #[error("opc-ua error: {0}")]
    OpcUa(String),

    /// Config/secret/IO failure. Rarely retryable, usually fatal at boot.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    /// Uncategorized.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl CoreError {
    /// Whether a caller should attempt this operation again (republish to
    /// the retry queue, reconnect, etc.) rather than discard it.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Validation(_) => false,
            CoreError::NotFound(_) => false,
            CoreError::Conflict(_) => false,
            CoreError::Database(_) => true,
            CoreError::Broker(_) => true,
            CoreError::OpcUa(_) => true,
            CoreError::Infrastructure(_) => false,
            CoreError::Unknown(_) => false,
        }
    }

    /// Category name, as carried in the HTTP error body.
    pub fn category(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "VALIDATION",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::Conflict(_) => "CONFLICT",
            CoreError::Database(_) => "DATABASE",
            CoreError::Broker(_) => "BROKER",
            CoreError::OpcUa(_) => "OPCUA",
            CoreError::Infrastructure(_) => "INFRASTRUCTURE",
            CoreError::Unknown(_) => "UNKNOWN",
        }
    }

    /// HTTP status code this error kind maps to on the read surface.
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::Validation(_) => 400,
            CoreError::NotFound(_) => 404,
            CoreError::Conflict(_) => 409,
            CoreError::Database(_) => 503,
            CoreError::Broker(_) => 503,
            CoreError::OpcUa(_) => 503,
            CoreError::Infrastructure(_) => 500,
            CoreError::Unknown(_) => 500,
        }
    }

    /// Build the HTTP-facing error body.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            error: ErrorDetail {
                name: self.category().to_string(),
                message: self.to_string(),
                category: self.category().to_string(),
                retryable: self.is_retryable(),
                is_operational: !matches!(self, CoreError::Unknown(_)),
                timestamp: chrono::Utc::now().to_rfc3339(),
                details: None,
            },
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            // Postgres 42P01 = undefined_table; callers that care (C10)
            // check this directly rather than via the generic From.
            if db_err.code().as_deref() == Some("42P01") {
                return CoreError::NotFound(format!("relation missing: {db_err}"));
            }
        }
        CoreError::Database(err.to_string())
    }
}

impl From<lapin::Error> for CoreError {
    fn from(err: lapin::Error) -> Self {
        CoreError::Broker(err.to_string())
    }
}

/// HTTP error response body, per the external interface contract.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub name: String,
    pub message: String,
    pub category: String,
    pub retryable: bool,
    #[serde(rename = "isOperational")]
    pub is_operational: bool,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_errors_are_retryable_validation_is_not() {
        assert!(CoreError::Database("x".into()).is_retryable());
        assert!(!CoreError::Validation("x".into()).is_retryable());
        assert!(!CoreError::Infrastructure("x".into()).is_retryable());
    }

    #[test]
    fn status_codes_match_the_mapping_table() {
        assert_eq!(CoreError::Validation("x".into()).status_code(), 400);
        assert_eq!(CoreError::NotFound("x".into()).status_code(), 404);
        assert_eq!(CoreError::Conflict("x".into()).status_code(), 409);
    }
}
