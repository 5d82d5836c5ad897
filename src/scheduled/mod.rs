//! Scheduled messages: authoring (create/list/cancel) and the delivery
//! engine that advances due items.

pub mod engine;
pub mod service;

use std::time::Duration;

use chrono::{DateTime, Utc};

pub use engine::{BatchReport, DeliveryEngine, EngineConfig, ItemOutcome, ItemResult};
pub use service::{ContactSummary, CreateScheduledRequest, ScheduleService, ScheduledMessageView};

/// Claims taken before this instant are considered abandoned.
pub fn lease_cutoff(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_sub_signed(lease))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
