use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use outreach_core::{OutreachError, OutreachResult};

/// Delivery channel of a single touch. Channel-specific fields live on the
/// variant that needs them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StepChannel {
    Email { subject: Option<String> },
    Sms,
    Call,
    Task,
}

impl StepChannel {
    pub fn label(&self) -> &'static str {
        match self {
            StepChannel::Email { .. } => "email",
            StepChannel::Sms => "sms",
            StepChannel::Call => "call",
            StepChannel::Task => "task",
        }
    }
}

/// One touch in a campaign definition. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTemplate {
    pub ordinal: u32,
    pub channel: StepChannel,
    pub title: String,
    pub content: String,
    /// Days after the previous step. Ignored for the first step.
    pub delay_days: u32,
}

/// Longest span a definition may cover from its first to its last step.
pub const MAX_CAMPAIGN_DAYS: u64 = 3_650;

/// An ordered campaign sequence shared read-only by every enrolled lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignDefinition {
    pub id: Uuid,
    pub name: String,
    pub audience: Option<String>,
    pub budget: Option<f64>,
    pub steps: Vec<StepTemplate>,
    pub created_at: DateTime<Utc>,
}

impl CampaignDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<StepTemplate>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            audience: None,
            budget: None,
            steps,
            created_at: Utc::now(),
        }
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub fn with_budget(mut self, budget: f64) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Ordinals must run 1, 2, 3, ... with no gaps, and there must be at
    /// least one step.
    pub fn validate(&self) -> OutreachResult<()> {
        if self.name.trim().is_empty() {
            return Err(OutreachError::InvalidDefinition(
                "campaign name must not be empty".into(),
            ));
        }
        if self.steps.is_empty() {
            return Err(OutreachError::InvalidDefinition(format!(
                "campaign {} has no steps",
                self.id
            )));
        }
        for (idx, step) in self.steps.iter().enumerate() {
            let expected = idx as u32 + 1;
            if step.ordinal != expected {
                return Err(OutreachError::InvalidDefinition(format!(
                    "step at position {} has ordinal {}, expected {}",
                    idx, step.ordinal, expected
                )));
            }
        }
        let total_days = self.total_duration_days();
        if total_days > MAX_CAMPAIGN_DAYS {
            return Err(OutreachError::InvalidDefinition(format!(
                "campaign spans {} days, the limit is {}",
                total_days, MAX_CAMPAIGN_DAYS
            )));
        }
        if let Some(budget) = self.budget {
            if !budget.is_finite() || budget < 0.0 {
                return Err(OutreachError::InvalidDefinition(format!(
                    "budget must be a non-negative amount, got {}",
                    budget
                )));
            }
        }
        Ok(())
    }

    /// Sum of the delays between steps, in days.
    pub fn total_duration_days(&self) -> u64 {
        self.steps
            .iter()
            .skip(1)
            .map(|s| u64::from(s.delay_days))
            .sum()
    }

    pub fn step(&self, ordinal: u32) -> Option<&StepTemplate> {
        self.steps.iter().find(|s| s.ordinal == ordinal)
    }
}

/// Flat lifecycle status, used for counting and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Active,
    Paused,
    Completed,
    Stopped,
    Unsubscribed,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Stopped | InstanceStatus::Unsubscribed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Active => "active",
            InstanceStatus::Paused => "paused",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Unsubscribed => "unsubscribed",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an enrollment. Each non-active status carries the
/// moment it was entered, so at most one lifecycle timestamp can exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum InstanceState {
    Active,
    Paused { paused_at: DateTime<Utc> },
    Completed { completed_at: DateTime<Utc> },
    Stopped { stopped_at: DateTime<Utc> },
    Unsubscribed { unsubscribed_at: DateTime<Utc> },
}

impl InstanceState {
    pub fn status(&self) -> InstanceStatus {
        match self {
            InstanceState::Active => InstanceStatus::Active,
            InstanceState::Paused { .. } => InstanceStatus::Paused,
            InstanceState::Completed { .. } => InstanceStatus::Completed,
            InstanceState::Stopped { .. } => InstanceStatus::Stopped,
            InstanceState::Unsubscribed { .. } => InstanceStatus::Unsubscribed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn paused_at(&self) -> Option<DateTime<Utc>> {
        match self {
            InstanceState::Paused { paused_at } => Some(*paused_at),
            _ => None,
        }
    }
}

/// Status of a single step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery and engagement flags. Everything but `sent` stays `None` until
/// the corresponding signal is observed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepAnalytics {
    pub sent: bool,
    pub delivered: Option<bool>,
    pub opened: Option<bool>,
    pub clicked: Option<bool>,
    pub replied: Option<bool>,
    pub bounced: Option<bool>,
    pub unsubscribed: Option<bool>,
}

/// Mutable progress record of one step for one enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub ordinal: u32,
    pub status: StepStatus,
    pub scheduled_at: DateTime<Utc>,
    /// Set iff status is `Completed` or `Failed`.
    pub executed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub analytics: StepAnalytics,
}

impl StepExecution {
    pub fn pending(ordinal: u32, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            ordinal,
            status: StepStatus::Pending,
            scheduled_at,
            executed_at: None,
            failure_reason: None,
            analytics: StepAnalytics::default(),
        }
    }
}

/// A lead's enrollment in a campaign definition. Owns its step executions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadCampaignInstance {
    pub id: Uuid,
    pub campaign_definition_id: Uuid,
    pub lead_id: String,
    pub advisor_id: String,
    pub state: InstanceState,
    pub start_date: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub step_executions: Vec<StepExecution>,
}

impl LeadCampaignInstance {
    pub fn status(&self) -> InstanceStatus {
        self.state.status()
    }

    pub fn step(&self, ordinal: u32) -> Option<&StepExecution> {
        self.step_executions.iter().find(|s| s.ordinal == ordinal)
    }

    pub fn step_mut(&mut self, ordinal: u32) -> OutreachResult<&mut StepExecution> {
        let id = self.id;
        self.step_executions
            .iter_mut()
            .find(|s| s.ordinal == ordinal)
            .ok_or_else(|| OutreachError::not_found("step", format!("{}#{}", id, ordinal)))
    }

    /// True while any step can still make progress.
    pub fn has_open_steps(&self) -> bool {
        self.step_executions
            .iter()
            .any(|s| matches!(s.status, StepStatus::Pending | StepStatus::InProgress))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(ordinal: u32, delay_days: u32) -> StepTemplate {
        StepTemplate {
            ordinal,
            channel: StepChannel::Sms,
            title: format!("Touch {}", ordinal),
            content: "Hi".to_string(),
            delay_days,
        }
    }

    #[test]
    fn test_definition_validation() {
        let ok = CampaignDefinition::new("Welcome", vec![template(1, 0), template(2, 3)]);
        assert!(ok.validate().is_ok());
        assert_eq!(ok.total_duration_days(), 3);

        let empty = CampaignDefinition::new("Empty", vec![]);
        assert!(matches!(
            empty.validate(),
            Err(OutreachError::InvalidDefinition(_))
        ));

        let gap = CampaignDefinition::new("Gap", vec![template(1, 0), template(3, 1)]);
        assert!(gap.validate().is_err());

        let zero_based = CampaignDefinition::new("Zero", vec![template(0, 0)]);
        assert!(zero_based.validate().is_err());

        let negative = CampaignDefinition::new("Budget", vec![template(1, 0)]).with_budget(-5.0);
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_oversized_delays_rejected() {
        let runaway = CampaignDefinition::new("Runaway", vec![template(1, 0), template(2, u32::MAX)]);
        assert!(matches!(
            runaway.validate(),
            Err(OutreachError::InvalidDefinition(_))
        ));

        let at_limit = CampaignDefinition::new(
            "Decade",
            vec![template(1, 0), template(2, MAX_CAMPAIGN_DAYS as u32)],
        );
        assert!(at_limit.validate().is_ok());
        let over = CampaignDefinition::new(
            "Decade and a day",
            vec![template(1, 0), template(2, 3_000), template(3, 651)],
        );
        assert!(over.validate().is_err());
    }

    #[test]
    fn test_first_delay_not_counted_in_duration() {
        let def = CampaignDefinition::new("Odd", vec![template(1, 9), template(2, 2)]);
        assert_eq!(def.total_duration_days(), 2);
    }

    #[test]
    fn test_state_serializes_as_tagged_union() {
        let at = Utc::now();
        let json = serde_json::to_value(InstanceState::Paused { paused_at: at }).unwrap();
        assert_eq!(json["status"], "paused");
        assert!(json.get("paused_at").is_some());

        let json = serde_json::to_value(InstanceState::Active).unwrap();
        assert_eq!(json, serde_json::json!({"status": "active"}));
    }

    #[test]
    fn test_channel_serialization() {
        let email = StepChannel::Email {
            subject: Some("Intro".into()),
        };
        let json = serde_json::to_value(&email).unwrap();
        assert_eq!(json["type"], "email");
        assert_eq!(json["subject"], "Intro");
        assert_eq!(email.label(), "email");

        let task: StepChannel = serde_json::from_str(r#"{"type": "task"}"#).unwrap();
        assert_eq!(task, StepChannel::Task);
    }
}
