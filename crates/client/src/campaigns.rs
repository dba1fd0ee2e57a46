//! Campaign store — the client's view of enrollments, with optimistic
//! lifecycle commands and reconciliation from engine events.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use outreach_core::types::{EventType, OutreachEvent};
use outreach_core::{OutreachError, OutreachResult};
use outreach_sequences::{
    InstanceStatus, LeadCampaignInstance, LifecycleCommand, LifecycleStateMachine, OutreachEngine,
    StepStatus,
};

use crate::errors::ErrorChannel;
use crate::optimistic::OptimisticStore;

pub const STORE_NAME: &str = "campaigns";

/// Row shown for one enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignView {
    pub id: Uuid,
    pub campaign_definition_id: Uuid,
    pub lead_id: String,
    pub status: InstanceStatus,
    pub total_steps: usize,
    pub completed_steps: usize,
    /// Ordinals counted in `completed_steps`; a replayed completion event
    /// finds its ordinal already here.
    pub completed_ordinals: BTreeSet<u32>,
    pub updated_at: DateTime<Utc>,
}

impl From<&LeadCampaignInstance> for CampaignView {
    fn from(instance: &LeadCampaignInstance) -> Self {
        let completed_ordinals: BTreeSet<u32> = instance
            .step_executions
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.ordinal)
            .collect();
        Self {
            id: instance.id,
            campaign_definition_id: instance.campaign_definition_id,
            lead_id: instance.lead_id.clone(),
            status: instance.status(),
            total_steps: instance.step_executions.len(),
            completed_steps: completed_ordinals.len(),
            completed_ordinals,
            updated_at: instance.updated_at,
        }
    }
}

/// Remote side of lifecycle commands.
#[async_trait]
pub trait CampaignCommands: Send + Sync {
    async fn execute(&self, id: Uuid, command: LifecycleCommand) -> OutreachResult<()>;
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Sends commands straight to an in-process engine.
pub struct EngineCommands {
    engine: OutreachEngine,
    clock: Clock,
}

impl EngineCommands {
    pub fn new(engine: OutreachEngine) -> Self {
        Self {
            engine,
            clock: Arc::new(Utc::now),
        }
    }

    /// Overrides the wall clock, e.g. for simulated time.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }
}

#[async_trait]
impl CampaignCommands for EngineCommands {
    async fn execute(&self, id: Uuid, command: LifecycleCommand) -> OutreachResult<()> {
        let now = (self.clock)();
        match command {
            LifecycleCommand::Pause => self.engine.pause(id, now).await?,
            LifecycleCommand::Resume => self.engine.resume(id, now).await?,
            LifecycleCommand::Stop => self.engine.stop(id, now).await?,
            LifecycleCommand::Unsubscribe => self.engine.unsubscribe(id, now).await?,
            LifecycleCommand::Complete => {
                return Err(OutreachError::InvalidStateTransition {
                    from: "client".into(),
                    command: command.to_string(),
                })
            }
        };
        Ok(())
    }
}

pub struct CampaignStore {
    store: OptimisticStore<Uuid, CampaignView>,
    remote: Arc<dyn CampaignCommands>,
    lifecycle: LifecycleStateMachine,
}

impl CampaignStore {
    pub fn new(remote: Arc<dyn CampaignCommands>, errors: Arc<ErrorChannel>) -> Self {
        Self {
            store: OptimisticStore::new(STORE_NAME, errors),
            remote,
            lifecycle: LifecycleStateMachine::new(),
        }
    }

    /// Replaces local rows with server state.
    pub fn refresh(&self, instances: &[LeadCampaignInstance]) {
        for instance in instances {
            self.store.upsert(instance.id, CampaignView::from(instance));
        }
        debug!(count = instances.len(), "Campaign store refreshed");
    }

    pub fn get(&self, id: Uuid) -> Option<CampaignView> {
        self.store.get(&id)
    }

    /// Rows sorted by lead id.
    pub fn list(&self) -> Vec<CampaignView> {
        let mut rows = self.store.values();
        rows.sort_by(|a, b| a.lead_id.cmp(&b.lead_id).then(a.id.cmp(&b.id)));
        rows
    }

    pub fn errors(&self) -> &Arc<ErrorChannel> {
        self.store.errors()
    }

    pub async fn pause(&self, id: Uuid) -> OutreachResult<()> {
        self.command(id, LifecycleCommand::Pause).await
    }

    pub async fn resume(&self, id: Uuid) -> OutreachResult<()> {
        self.command(id, LifecycleCommand::Resume).await
    }

    pub async fn stop(&self, id: Uuid) -> OutreachResult<()> {
        self.command(id, LifecycleCommand::Stop).await
    }

    pub async fn unsubscribe(&self, id: Uuid) -> OutreachResult<()> {
        self.command(id, LifecycleCommand::Unsubscribe).await
    }

    async fn command(&self, id: Uuid, command: LifecycleCommand) -> OutreachResult<()> {
        let current = self
            .store
            .get(&id)
            .ok_or_else(|| OutreachError::not_found(STORE_NAME, id))?;

        let terminating = matches!(command, LifecycleCommand::Stop | LifecycleCommand::Unsubscribe);
        if terminating && current.status.is_terminal() {
            return Ok(());
        }
        let target = self.lifecycle.check(current.status, command)?;

        let remote = self.remote.clone();
        self.store
            .apply(
                &id,
                |view| {
                    view.status = target;
                    view.updated_at = Utc::now();
                },
                |_| async move { remote.execute(id, command).await },
            )
            .await?;
        info!(instance_id = %id, command = %command, "Lifecycle command confirmed");
        Ok(())
    }

    /// Folds an engine event into the local view. Returns true if a row
    /// changed.
    pub fn apply_event(&self, event: &OutreachEvent) -> bool {
        match event.event_type {
            EventType::InstanceStatusChanged => {
                let Some(status) = event.to_status.as_deref().and_then(parse_status) else {
                    return false;
                };
                self.store.update_local(&event.instance_id, |view| {
                    view.status = status;
                    view.updated_at = event.timestamp;
                })
            }
            EventType::StepStatusChanged if event.to_status.as_deref() == Some("completed") => {
                let Some(ordinal) = event.step_ordinal else {
                    return false;
                };
                let mut counted = false;
                self.store.update_local(&event.instance_id, |view| {
                    if view.completed_ordinals.insert(ordinal) {
                        view.completed_steps = view.completed_ordinals.len();
                        view.updated_at = event.timestamp;
                        counted = true;
                    }
                });
                counted
            }
            _ => false,
        }
    }
}

fn parse_status(raw: &str) -> Option<InstanceStatus> {
    serde_json::from_value(serde_json::Value::String(raw.to_string())).ok()
}
