//! Read-only analytics, recomputed from step executions on every call.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{InstanceStatus, LeadCampaignInstance, StepAnalytics, StepStatus};

/// Per-enrollment analytics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceAnalytics {
    pub instance_id: Uuid,
    pub status: InstanceStatus,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub pending_steps: usize,
    pub in_progress_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub sent_count: usize,
    pub delivery_rate: f64,
    pub open_rate: f64,
    pub click_rate: f64,
    pub response_rate: f64,
    pub bounce_rate: f64,
    pub unsubscribe_rate: f64,
}

/// Analytics across every enrollment of one campaign definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetAnalytics {
    pub campaign_definition_id: Uuid,
    pub total_leads: usize,
    /// Mean response rate across enrollments.
    pub average_conversion: f64,
    pub average_open_rate: f64,
    pub by_status: HashMap<InstanceStatus, usize>,
}

impl FleetAnalytics {
    pub fn count(&self, status: InstanceStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

/// `numerator / denominator`, defined as 0 for an empty denominator and
/// kept within [0, 1].
fn rate(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    (numerator as f64 / denominator as f64).clamp(0.0, 1.0)
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

pub fn instance_analytics(instance: &LeadCampaignInstance) -> InstanceAnalytics {
    let steps = &instance.step_executions;
    let count_status = |status: StepStatus| steps.iter().filter(|s| s.status == status).count();

    let sent = steps.iter().filter(|s| s.analytics.sent).count();
    let observed = |pick: fn(&StepAnalytics) -> Option<bool>| {
        steps
            .iter()
            .filter(|s| s.analytics.sent && pick(&s.analytics) == Some(true))
            .count()
    };

    InstanceAnalytics {
        instance_id: instance.id,
        status: instance.status(),
        total_steps: steps.len(),
        completed_steps: count_status(StepStatus::Completed),
        pending_steps: count_status(StepStatus::Pending),
        in_progress_steps: count_status(StepStatus::InProgress),
        failed_steps: count_status(StepStatus::Failed),
        skipped_steps: count_status(StepStatus::Skipped),
        sent_count: sent,
        delivery_rate: rate(observed(|a| a.delivered), sent),
        open_rate: rate(observed(|a| a.opened), sent),
        click_rate: rate(observed(|a| a.clicked), sent),
        response_rate: rate(observed(|a| a.replied), sent),
        bounce_rate: rate(observed(|a| a.bounced), sent),
        unsubscribe_rate: if instance.status() == InstanceStatus::Unsubscribed {
            1.0
        } else {
            0.0
        },
    }
}

pub fn fleet_analytics(
    campaign_definition_id: Uuid,
    instances: &[LeadCampaignInstance],
) -> FleetAnalytics {
    let members: Vec<&LeadCampaignInstance> = instances
        .iter()
        .filter(|i| i.campaign_definition_id == campaign_definition_id)
        .collect();
    let per_instance: Vec<InstanceAnalytics> =
        members.iter().map(|i| instance_analytics(i)).collect();

    let mut by_status: HashMap<InstanceStatus, usize> = HashMap::new();
    for inst in &members {
        *by_status.entry(inst.status()).or_insert(0) += 1;
    }

    FleetAnalytics {
        campaign_definition_id,
        total_leads: members.len(),
        average_conversion: mean(per_instance.iter().map(|a| a.response_rate)),
        average_open_rate: mean(per_instance.iter().map(|a| a.open_rate)),
        by_status,
    }
}
