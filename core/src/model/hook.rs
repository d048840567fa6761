use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Event;

/// Hook execution identifier.
pub type HookExecutionId = i64;

/// Delivery state of a durable event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookStatus {
    /// Awaiting (re)delivery.
    Pending,
    /// Delivered.
    Succeeded,
    /// Retries exhausted.
    Failed,
}

/// Record of delivering one event to one durable subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookExecution {
    /// Identifier.
    #[serde(default)]
    pub id: HookExecutionId,
    /// Subscriber name.
    pub subscriber: String,
    /// The event.
    pub event: Event,
    /// Delivery state.
    pub status: HookStatus,
    /// Attempts made.
    pub attempts: u32,
    /// Earliest time of the next attempt.
    pub next_attempt: DateTime<Utc>,
    /// Last delivery error.
    pub last_error: Option<String>,
}
