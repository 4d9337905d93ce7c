//! Alert subsystem: persistence (C7), the processing use case (C8), the
//! scheduler notification deduper (C9), and the multi-DB read fan-out (C10).

pub mod fanout;
pub mod persistence;
pub mod processing;
pub mod scheduler;

pub use fanout::{get_alerts_from_all_areas, summarize_from_all_areas, AlertQuery};
pub use persistence::{AlertFilters, AlertStore};
pub use processing::{process_alert, ProcessOutcome};
pub use scheduler::{NotificationMode, Notifier, RecentAlertsSource, SchedulerDeduper};
