//! Broker subsystem: topology (C2), connection supervision (C3), the
//! publisher (C4), consumer workers (C5), and retry/DLQ escalation (C6).

pub mod consumer;
pub mod publisher;
pub mod retry;
pub mod supervisor;
pub mod topology;

pub use consumer::{ConsumeStream, ConsumerWorker, DispatchOutcome, MessageHandler};
pub use publisher::Publisher;
pub use retry::{retry_count, retry_policy, RetryDecision};
pub use supervisor::{ConnectionSupervisor, ConnectionSupervisorState};
pub use topology::TopologyManager;
