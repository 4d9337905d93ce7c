//! Alert Processing Use Case (C8).

use crate::alerts::persistence::AlertStore;
use crate::config::default_dedup_window_ms;
use crate::envelope::{AlertPayload, AlertSample};
use crate::error::CoreError;

#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub saved: bool,
    pub alert: Option<AlertSample>,
}

/// Validate then persist. Validation failures accumulate into a single
/// message rather than failing on the first bad field.
pub async fn process_alert(store: &AlertStore, payload: &AlertPayload) -> Result<ProcessOutcome, CoreError> {
    validate(payload)?;

    let dedup_window_ms = payload
        .dedup_window_ms
        .unwrap_or_else(default_dedup_window_ms);

    let alert = store
        .insert_if_not_recent(payload, dedup_window_ms)
        .await
        .map_err(|e| match e {
            CoreError::Validation(_) => e,
            other => CoreError::Database(other.to_string()),
        })?;

    Ok(ProcessOutcome {
        saved: alert.is_some(),
        alert,
    })
}

fn validate(payload: &AlertPayload) -> Result<(), CoreError> {
    let mut problems = Vec::new();

    if payload.client_id.trim().is_empty() {
        problems.push("clientId must not be empty");
    }
    if payload.tag_name.trim().is_empty() {
        problems.push("tagName must not be empty");
    }
    if payload.desvio.as_str().is_empty() {
        problems.push("desvio must not be empty");
    }
    if !payload.value.is_finite() {
        problems.push("value must be a finite number");
    }
    if !(payload.alerts_count as f64).is_finite() {
        problems.push("alertsCount must be a finite number");
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(CoreError::Validation(problems.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::DeviationLevel;
    use chrono::Utc;
    use uuid::Uuid;

    fn valid_payload() -> AlertPayload {
        AlertPayload {
            msg_id: Uuid::new_v4(),
            ts: Utc::now(),
            site: Some("Pasteurizacao".into()),
            client_id: "plant-A".into(),
            tag_name: "TEMP_01".into(),
            value: 211.0,
            desvio: DeviationLevel::HighHigh,
            alerts_count: 1,
            unidade: "C".into(),
            recipients: vec!["ops@example.invalid".into()],
            dedup_window_ms: None,
        }
    }

    #[test]
    fn empty_client_id_fails_validation() {
        let mut payload = valid_payload();
        payload.client_id = "  ".into();
        assert!(validate(&payload).is_err());
    }

    #[test]
    fn non_finite_value_fails_validation() {
        let mut payload = valid_payload();
        payload.value = f64::NAN;
        assert!(validate(&payload).is_err());
    }

    #[test]
    fn valid_payload_passes() {
        assert!(validate(&valid_payload()).is_ok());
    }
}
