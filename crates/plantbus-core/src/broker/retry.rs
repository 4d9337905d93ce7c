//! Retry/DLQ State Machine helpers (C6).
//!
//! Redelivery itself is broker-native (TTL + DLX, declared by
//! [`crate::broker::topology`]); this module is the small policy decision
//! the consumer worker makes on each retryable failure: read `x-retry`,
//! decide whether to republish to the retry queue or escalate to the DLQ,
//! and build the next `x-retry` value.

use lapin::message::Delivery;
use lapin::types::AMQPValue;

/// What the consumer should do next for a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Republish to the retry queue with `x-retry` set to this value.
    RepublishWithRetryCount(i64),
    /// Exhausted: nack with no requeue so the broker DLXes it.
    Escalate,
}

/// Read the current `x-retry` header value (0 if absent or malformed).
pub fn retry_count(delivery: &Delivery) -> i64 {
    delivery
        .properties
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get("x-retry"))
        .and_then(amqp_value_as_i64)
        .unwrap_or(0)
}

fn amqp_value_as_i64(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(*v as i64),
        AMQPValue::ShortInt(v) => Some(*v as i64),
        AMQPValue::LongInt(v) => Some(*v as i64),
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::ShortShortUInt(v) => Some(*v as i64),
        AMQPValue::ShortUInt(v) => Some(*v as i64),
        AMQPValue::LongUInt(v) => Some(*v as i64),
        _ => None,
    }
}

/// Decide the next action for a retryable failure, per the policy table:
/// `x-retry < max_retries` republishes with an incremented counter;
/// `x-retry >= max_retries` escalates straight to the DLQ.
pub fn retry_policy(current_retry: i64, max_retries: u32) -> RetryDecision {
    if current_retry < max_retries as i64 {
        RetryDecision::RepublishWithRetryCount(current_retry + 1)
    } else {
        RetryDecision::Escalate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_max_retries_republishes_with_incremented_counter() {
        assert_eq!(retry_policy(0, 5), RetryDecision::RepublishWithRetryCount(1));
        assert_eq!(retry_policy(4, 5), RetryDecision::RepublishWithRetryCount(5));
    }

    #[test]
    fn at_or_above_max_retries_escalates() {
        assert_eq!(retry_policy(5, 5), RetryDecision::Escalate);
        assert_eq!(retry_policy(9, 5), RetryDecision::Escalate);
    }

    #[test]
    fn scenario_s4_five_retries_then_dlq() {
        let mut retry = 0i64;
        let mut republished = Vec::new();
        loop {
            match retry_policy(retry, 5) {
                RetryDecision::RepublishWithRetryCount(next) => {
                    republished.push(next);
                    retry = next;
                }
                RetryDecision::Escalate => break,
            }
        }
        assert_eq!(republished, vec![1, 2, 3, 4, 5]);
    }
}
