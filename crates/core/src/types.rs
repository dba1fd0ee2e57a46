use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of events published by the outreach engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    InstanceEnrolled,
    InstanceStatusChanged,
    StepStatusChanged,
    StepDispatched,
    DeliveryFailed,
    EngagementRecorded,
}

/// Event published to UI subscribers and analytics sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutreachEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub instance_id: Uuid,
    pub lead_id: Option<String>,
    /// Set for step-level events.
    pub step_ordinal: Option<u32>,
    pub from_status: Option<String>,
    pub to_status: Option<String>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl OutreachEvent {
    pub fn with_step(mut self, ordinal: u32) -> Self {
        self.step_ordinal = Some(ordinal);
        self
    }

    pub fn with_transition(mut self, from: impl ToString, to: impl ToString) -> Self {
        self.from_status = Some(from.to_string());
        self.to_status = Some(to.to_string());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Stamps the event with the caller's clock instead of the wall clock.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}
