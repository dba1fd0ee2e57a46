use std::fmt;

use serde::{Deserialize, Serialize};

use outreach_core::{OutreachError, OutreachResult};

use crate::types::{InstanceStatus, StepStatus};

/// Commands that move an enrollment through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleCommand {
    Pause,
    Resume,
    Stop,
    Unsubscribe,
    Complete,
}

impl LifecycleCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleCommand::Pause => "pause",
            LifecycleCommand::Resume => "resume",
            LifecycleCommand::Stop => "stop",
            LifecycleCommand::Unsubscribe => "unsubscribe",
            LifecycleCommand::Complete => "complete",
        }
    }
}

impl fmt::Display for LifecycleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Describes a single valid lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleTransition {
    pub from: InstanceStatus,
    pub command: LifecycleCommand,
    pub to: InstanceStatus,
}

/// Guards the enrollment lifecycle by enforcing a finite set of valid
/// transitions.
#[derive(Debug, Clone)]
pub struct LifecycleStateMachine {
    pub transitions: Vec<LifecycleTransition>,
}

impl LifecycleStateMachine {
    pub fn new() -> Self {
        use InstanceStatus::*;
        use LifecycleCommand as C;

        let table = [
            // Active ->
            (Active, C::Pause, Paused),
            (Active, C::Stop, Stopped),
            (Active, C::Unsubscribe, Unsubscribed),
            (Active, C::Complete, Completed),
            // Paused ->
            (Paused, C::Resume, Active),
            (Paused, C::Stop, Stopped),
            (Paused, C::Unsubscribe, Unsubscribed),
        ];

        Self {
            transitions: table
                .into_iter()
                .map(|(from, command, to)| LifecycleTransition { from, command, to })
                .collect(),
        }
    }

    /// Status reached by applying `command` from `from`, if allowed.
    pub fn target(&self, from: InstanceStatus, command: LifecycleCommand) -> Option<InstanceStatus> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.command == command)
            .map(|t| t.to)
    }

    pub fn check(&self, from: InstanceStatus, command: LifecycleCommand) -> OutreachResult<InstanceStatus> {
        self.target(from, command)
            .ok_or_else(|| OutreachError::InvalidStateTransition {
                from: from.to_string(),
                command: command.to_string(),
            })
    }
}

impl Default for LifecycleStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Allowed step status moves. Terminal statuses have no outgoing edges.
pub fn step_can_transition(from: StepStatus, to: StepStatus) -> bool {
    use StepStatus::*;
    matches!(
        (from, to),
        (Pending, InProgress)
            | (Pending, Skipped)
            | (InProgress, Completed)
            | (InProgress, Failed)
            | (InProgress, Skipped)
    )
}
