//! Due-time computation and the lifecycle commands that reshape a schedule.
//!
//! Every function here is synchronous and operates on a value the caller
//! already holds under the per-instance lock. Commands validate before they
//! mutate, so a rejected command leaves the instance untouched.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use outreach_core::{OutreachError, OutreachResult};

use crate::recorder::StepChange;
use crate::state_machine::{LifecycleCommand, LifecycleStateMachine};
use crate::types::{
    CampaignDefinition, InstanceState, InstanceStatus, LeadCampaignInstance, StepExecution,
    StepStatus, StepTemplate,
};

/// Result of applying a lifecycle command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleOutcome {
    pub command: LifecycleCommand,
    pub from: InstanceStatus,
    pub to: InstanceStatus,
    /// Steps moved to `skipped` by this command.
    pub skipped: Vec<StepChange>,
    /// False when the command was an idempotent no-op.
    pub changed: bool,
}

impl LifecycleOutcome {
    fn unchanged(command: LifecycleCommand, status: InstanceStatus) -> Self {
        Self {
            command,
            from: status,
            to: status,
            skipped: Vec::new(),
            changed: false,
        }
    }
}

/// `scheduled[0] = start`, `scheduled[i] = scheduled[i-1] + steps[i].delay_days`.
/// Fails when a due time falls outside the representable calendar.
pub fn compute_schedule(
    start: DateTime<Utc>,
    steps: &[StepTemplate],
) -> OutreachResult<Vec<DateTime<Utc>>> {
    let mut schedule = Vec::with_capacity(steps.len());
    let mut cursor = start;
    for (idx, step) in steps.iter().enumerate() {
        if idx > 0 {
            cursor = cursor
                .checked_add_signed(Duration::days(i64::from(step.delay_days)))
                .ok_or_else(|| {
                    OutreachError::InvalidDefinition(format!(
                        "step {} falls outside the supported date range",
                        step.ordinal
                    ))
                })?;
        }
        schedule.push(cursor);
    }
    Ok(schedule)
}

/// Builds a fresh, active enrollment with every step pending.
pub fn instantiate(
    definition: &CampaignDefinition,
    lead_id: &str,
    advisor_id: &str,
    start_date: DateTime<Utc>,
) -> OutreachResult<LeadCampaignInstance> {
    let step_executions = definition
        .steps
        .iter()
        .zip(compute_schedule(start_date, &definition.steps)?)
        .map(|(template, at)| StepExecution::pending(template.ordinal, at))
        .collect();

    Ok(LeadCampaignInstance {
        id: Uuid::new_v4(),
        campaign_definition_id: definition.id,
        lead_id: lead_id.to_string(),
        advisor_id: advisor_id.to_string(),
        state: InstanceState::Active,
        start_date,
        updated_at: start_date,
        step_executions,
    })
}

/// Ordinals of pending steps whose time has come. Empty unless the
/// instance is active.
pub fn due_steps(instance: &LeadCampaignInstance, now: DateTime<Utc>) -> Vec<u32> {
    if instance.state != InstanceState::Active {
        return Vec::new();
    }
    instance
        .step_executions
        .iter()
        .filter(|s| s.status == StepStatus::Pending && s.scheduled_at <= now)
        .map(|s| s.ordinal)
        .collect()
}

/// Ordinals of steps already marked in progress on an active instance.
pub fn in_progress_steps(instance: &LeadCampaignInstance) -> Vec<u32> {
    if instance.state != InstanceState::Active {
        return Vec::new();
    }
    instance
        .step_executions
        .iter()
        .filter(|s| s.status == StepStatus::InProgress)
        .map(|s| s.ordinal)
        .collect()
}

/// Earliest `scheduled_at` among pending steps of an active instance.
pub fn next_due_at(instance: &LeadCampaignInstance) -> Option<DateTime<Utc>> {
    if instance.state != InstanceState::Active {
        return None;
    }
    instance
        .step_executions
        .iter()
        .filter(|s| s.status == StepStatus::Pending)
        .map(|s| s.scheduled_at)
        .min()
}

pub fn pause(instance: &mut LeadCampaignInstance, now: DateTime<Utc>) -> OutreachResult<LifecycleOutcome> {
    let from = instance.status();
    let to = LifecycleStateMachine::new().check(from, LifecycleCommand::Pause)?;

    instance.state = InstanceState::Paused { paused_at: now };
    instance.updated_at = now;

    Ok(LifecycleOutcome {
        command: LifecycleCommand::Pause,
        from,
        to,
        skipped: Vec::new(),
        changed: true,
    })
}

/// Shifts every pending step forward by the time spent paused so the gaps
/// between steps survive the pause.
pub fn resume(instance: &mut LeadCampaignInstance, now: DateTime<Utc>) -> OutreachResult<LifecycleOutcome> {
    let from = instance.status();
    let to = LifecycleStateMachine::new().check(from, LifecycleCommand::Resume)?;

    // Only a paused instance passes the check above.
    let paused_at = instance.state.paused_at().unwrap_or(now);
    let paused_for = (now - paused_at).max(Duration::zero());

    // Shift into a copy first so an out-of-range date rejects the resume
    // without touching the schedule.
    let mut shifted = Vec::new();
    for (idx, step) in instance.step_executions.iter().enumerate() {
        if step.status != StepStatus::Pending {
            continue;
        }
        let at = step.scheduled_at.checked_add_signed(paused_for).ok_or_else(|| {
            OutreachError::InvalidStepState {
                ordinal: step.ordinal,
                status: step.status.to_string(),
                event: "resume past the supported date range".to_string(),
            }
        })?;
        shifted.push((idx, at));
    }
    for (idx, at) in shifted {
        instance.step_executions[idx].scheduled_at = at;
    }

    instance.state = InstanceState::Active;
    instance.updated_at = now;

    Ok(LifecycleOutcome {
        command: LifecycleCommand::Resume,
        from,
        to,
        skipped: Vec::new(),
        changed: true,
    })
}

pub fn stop(instance: &mut LeadCampaignInstance, now: DateTime<Utc>) -> OutreachResult<LifecycleOutcome> {
    terminate(
        instance,
        now,
        LifecycleCommand::Stop,
        InstanceState::Stopped { stopped_at: now },
    )
}

pub fn unsubscribe(instance: &mut LeadCampaignInstance, now: DateTime<Utc>) -> OutreachResult<LifecycleOutcome> {
    terminate(
        instance,
        now,
        LifecycleCommand::Unsubscribe,
        InstanceState::Unsubscribed { unsubscribed_at: now },
    )
}

fn terminate(
    instance: &mut LeadCampaignInstance,
    now: DateTime<Utc>,
    command: LifecycleCommand,
    next: InstanceState,
) -> OutreachResult<LifecycleOutcome> {
    let from = instance.status();
    if from.is_terminal() {
        return Ok(LifecycleOutcome::unchanged(command, from));
    }
    let to = LifecycleStateMachine::new().check(from, command)?;

    let mut skipped = Vec::new();
    for step in instance
        .step_executions
        .iter_mut()
        .filter(|s| matches!(s.status, StepStatus::Pending | StepStatus::InProgress))
    {
        skipped.push(StepChange {
            ordinal: step.ordinal,
            from: step.status,
            to: StepStatus::Skipped,
        });
        step.status = StepStatus::Skipped;
    }

    instance.state = next;
    instance.updated_at = now;

    Ok(LifecycleOutcome {
        command,
        from,
        to,
        skipped,
        changed: true,
    })
}

/// Moves an active instance to `Completed` once no step can make progress.
pub fn complete_if_finished(
    instance: &mut LeadCampaignInstance,
    now: DateTime<Utc>,
) -> Option<LifecycleOutcome> {
    if instance.state != InstanceState::Active || instance.has_open_steps() {
        return None;
    }
    let from = instance.status();
    let to = LifecycleStateMachine::new()
        .target(from, LifecycleCommand::Complete)?;

    instance.state = InstanceState::Completed { completed_at: now };
    instance.updated_at = now;

    Some(LifecycleOutcome {
        command: LifecycleCommand::Complete,
        from,
        to,
        skipped: Vec::new(),
        changed: true,
    })
}
