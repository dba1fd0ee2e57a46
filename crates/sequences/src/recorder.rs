//! Execution recorder — applies one delivery or engagement event to exactly
//! one step execution.
//!
//! Step lifecycle: `pending -> in_progress -> {completed, failed}`. A send is
//! the fulfilling action; delivery and engagement signals arrive afterwards
//! as enrichments and never revert a step's status. Every function validates
//! first, so a rejected event leaves the step untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use outreach_core::{OutreachError, OutreachResult};

use crate::state_machine::step_can_transition;
use crate::types::{InstanceState, StepAnalytics, StepExecution, StepStatus};

/// A delivery or engagement signal for one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event", content = "value")]
pub enum StepEvent {
    Sent,
    Delivered(bool),
    Opened(bool),
    Clicked(bool),
    Replied(bool),
    Bounced(bool),
    Unsubscribed(bool),
    /// The delivery provider reported a failure or never answered.
    Failed(String),
}

impl StepEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StepEvent::Sent => "sent",
            StepEvent::Delivered(_) => "delivered",
            StepEvent::Opened(_) => "opened",
            StepEvent::Clicked(_) => "clicked",
            StepEvent::Replied(_) => "replied",
            StepEvent::Bounced(_) => "bounced",
            StepEvent::Unsubscribed(_) => "unsubscribed",
            StepEvent::Failed(_) => "failed",
        }
    }
}

/// Status movement caused by an event. `from == to` for pure enrichments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepChange {
    pub ordinal: u32,
    pub from: StepStatus,
    pub to: StepStatus,
}

impl StepChange {
    pub fn status_changed(&self) -> bool {
        self.from != self.to
    }
}

fn rejected(step: &StepExecution, event: &str) -> OutreachError {
    OutreachError::InvalidStepState {
        ordinal: step.ordinal,
        status: step.status.to_string(),
        event: event.to_string(),
    }
}

fn transition(step: &mut StepExecution, to: StepStatus, event: &str) -> OutreachResult<StepChange> {
    let from = step.status;
    if !step_can_transition(from, to) {
        return Err(rejected(step, event));
    }
    step.status = to;
    Ok(StepChange {
        ordinal: step.ordinal,
        from,
        to,
    })
}

/// Hands a pending step to delivery once it is due on an active instance.
pub fn mark_due(
    step: &mut StepExecution,
    instance_state: &InstanceState,
    now: DateTime<Utc>,
) -> OutreachResult<StepChange> {
    if *instance_state != InstanceState::Active {
        return Err(OutreachError::InvalidStateTransition {
            from: instance_state.status().to_string(),
            command: format!("mark step {} due", step.ordinal),
        });
    }
    if step.status != StepStatus::Pending {
        return Err(rejected(step, "mark_due"));
    }
    if now < step.scheduled_at {
        return Err(rejected(
            step,
            &format!("mark_due before {}", step.scheduled_at.to_rfc3339()),
        ));
    }
    transition(step, StepStatus::InProgress, "mark_due")
}

pub fn record_sent(step: &mut StepExecution, now: DateTime<Utc>) -> OutreachResult<StepChange> {
    let change = transition(step, StepStatus::Completed, "sent")?;
    step.executed_at = Some(now);
    step.analytics.sent = true;
    Ok(change)
}

/// Sets `bounced`. A bounce fails a step still waiting on its send; any
/// other accepted signal keeps the step's status.
pub fn record_bounced(
    step: &mut StepExecution,
    flag: bool,
    now: DateTime<Utc>,
) -> OutreachResult<StepChange> {
    match (step.status, flag) {
        (StepStatus::InProgress, true) => {
            let change = transition(step, StepStatus::Failed, "bounced")?;
            step.executed_at = Some(now);
            step.failure_reason = Some("bounced".to_string());
            step.analytics.bounced = Some(true);
            Ok(change)
        }
        (StepStatus::InProgress, false) | (StepStatus::Completed, _) => {
            step.analytics.bounced = Some(flag);
            Ok(unchanged(step))
        }
        _ => Err(rejected(step, "bounced")),
    }
}

pub fn record_failure(
    step: &mut StepExecution,
    reason: &str,
    now: DateTime<Utc>,
) -> OutreachResult<StepChange> {
    let change = transition(step, StepStatus::Failed, "failed")?;
    step.executed_at = Some(now);
    step.failure_reason = Some(reason.to_string());
    Ok(change)
}

pub fn record_delivered(step: &mut StepExecution, flag: bool) -> OutreachResult<StepChange> {
    enrich(step, "delivered", |a| a.delivered = Some(flag))
}

pub fn record_opened(step: &mut StepExecution, flag: bool) -> OutreachResult<StepChange> {
    enrich(step, "opened", |a| a.opened = Some(flag))
}

pub fn record_clicked(step: &mut StepExecution, flag: bool) -> OutreachResult<StepChange> {
    enrich(step, "clicked", |a| a.clicked = Some(flag))
}

pub fn record_replied(step: &mut StepExecution, flag: bool) -> OutreachResult<StepChange> {
    enrich(step, "replied", |a| a.replied = Some(flag))
}

pub fn record_unsubscribed(step: &mut StepExecution, flag: bool) -> OutreachResult<StepChange> {
    enrich(step, "unsubscribed", |a| a.unsubscribed = Some(flag))
}

/// Engagement only makes sense for a step that was actually sent.
fn enrich(
    step: &mut StepExecution,
    event: &str,
    set: impl FnOnce(&mut StepAnalytics),
) -> OutreachResult<StepChange> {
    if step.status != StepStatus::Completed {
        return Err(rejected(step, event));
    }
    set(&mut step.analytics);
    Ok(unchanged(step))
}

fn unchanged(step: &StepExecution) -> StepChange {
    StepChange {
        ordinal: step.ordinal,
        from: step.status,
        to: step.status,
    }
}

/// Dispatches a [`StepEvent`] to the matching recorder function.
pub fn apply_event(
    step: &mut StepExecution,
    event: &StepEvent,
    now: DateTime<Utc>,
) -> OutreachResult<StepChange> {
    match event {
        StepEvent::Sent => record_sent(step, now),
        StepEvent::Delivered(flag) => record_delivered(step, *flag),
        StepEvent::Opened(flag) => record_opened(step, *flag),
        StepEvent::Clicked(flag) => record_clicked(step, *flag),
        StepEvent::Replied(flag) => record_replied(step, *flag),
        StepEvent::Bounced(flag) => record_bounced(step, *flag, now),
        StepEvent::Unsubscribed(flag) => record_unsubscribed(step, *flag),
        StepEvent::Failed(reason) => record_failure(step, reason, now),
    }
}
