//! Persistence boundary for definitions and enrollments.
//!
//! Production deployments back this with a transactional store; the
//! in-memory implementation serves development and tests with the same API.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use outreach_core::{OutreachError, OutreachResult};

use crate::types::{CampaignDefinition, InstanceState, LeadCampaignInstance};

/// Storage collaborator. `save_instance` must replace the whole instance
/// atomically.
#[async_trait]
pub trait CampaignRepository: Send + Sync {
    async fn load_definition(&self, id: Uuid) -> OutreachResult<CampaignDefinition>;
    async fn save_definition(&self, definition: &CampaignDefinition) -> OutreachResult<()>;

    async fn load_instance(&self, id: Uuid) -> OutreachResult<LeadCampaignInstance>;
    async fn save_instance(&self, instance: &LeadCampaignInstance) -> OutreachResult<()>;

    /// All enrollments, optionally limited to one definition.
    async fn list_instances(
        &self,
        campaign_definition_id: Option<Uuid>,
    ) -> OutreachResult<Vec<LeadCampaignInstance>>;

    /// Enrollments that are neither paused nor terminal. The due-step scan
    /// only ever looks at these.
    async fn list_active_instances(&self) -> OutreachResult<Vec<LeadCampaignInstance>>;
}

/// Thread-safe in-memory repository backed by DashMap.
#[derive(Default)]
pub struct InMemoryRepository {
    definitions: DashMap<Uuid, CampaignDefinition>,
    instances: DashMap<Uuid, LeadCampaignInstance>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

#[async_trait]
impl CampaignRepository for InMemoryRepository {
    async fn load_definition(&self, id: Uuid) -> OutreachResult<CampaignDefinition> {
        self.definitions
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or_else(|| OutreachError::not_found("campaign definition", id))
    }

    async fn save_definition(&self, definition: &CampaignDefinition) -> OutreachResult<()> {
        self.definitions.insert(definition.id, definition.clone());
        Ok(())
    }

    async fn load_instance(&self, id: Uuid) -> OutreachResult<LeadCampaignInstance> {
        self.instances
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or_else(|| OutreachError::not_found("instance", id))
    }

    async fn save_instance(&self, instance: &LeadCampaignInstance) -> OutreachResult<()> {
        debug!(instance_id = %instance.id, status = %instance.status(), "Saving instance");
        self.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn list_instances(
        &self,
        campaign_definition_id: Option<Uuid>,
    ) -> OutreachResult<Vec<LeadCampaignInstance>> {
        let mut instances: Vec<LeadCampaignInstance> = self
            .instances
            .iter()
            .filter(|r| {
                campaign_definition_id
                    .map_or(true, |id| r.value().campaign_definition_id == id)
            })
            .map(|r| r.value().clone())
            .collect();
        instances.sort_by(|a, b| a.start_date.cmp(&b.start_date).then(a.id.cmp(&b.id)));
        Ok(instances)
    }

    async fn list_active_instances(&self) -> OutreachResult<Vec<LeadCampaignInstance>> {
        let mut instances: Vec<LeadCampaignInstance> = self
            .instances
            .iter()
            .filter(|r| r.value().state == InstanceState::Active)
            .map(|r| r.value().clone())
            .collect();
        instances.sort_by(|a, b| a.start_date.cmp(&b.start_date).then(a.id.cmp(&b.id)));
        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler;
    use crate::types::{StepChannel, StepTemplate};
    use chrono::Utc;

    fn definition() -> CampaignDefinition {
        CampaignDefinition::new(
            "Repo",
            vec![StepTemplate {
                ordinal: 1,
                channel: StepChannel::Task,
                title: "Prepare".into(),
                content: "Research the lead".into(),
                delay_days: 0,
            }],
        )
    }

    #[tokio::test]
    async fn test_round_trip_and_not_found() {
        let repo = InMemoryRepository::new();
        let def = definition();
        repo.save_definition(&def).await.unwrap();
        assert_eq!(repo.load_definition(def.id).await.unwrap().name, "Repo");

        let inst = scheduler::instantiate(&def, "lead-9", "adv-2", Utc::now()).unwrap();
        repo.save_instance(&inst).await.unwrap();
        assert_eq!(repo.load_instance(inst.id).await.unwrap(), inst);

        let missing = repo.load_instance(Uuid::new_v4()).await;
        assert!(matches!(missing, Err(OutreachError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_list_filters_by_definition() {
        let repo = InMemoryRepository::new();
        let a = definition();
        let b = definition();
        for (def, lead) in [(&a, "l1"), (&a, "l2"), (&b, "l3")] {
            let inst = scheduler::instantiate(def, lead, "adv", Utc::now()).unwrap();
            repo.save_instance(&inst).await.unwrap();
        }
        assert_eq!(repo.list_instances(Some(a.id)).await.unwrap().len(), 2);
        assert_eq!(repo.list_instances(Some(b.id)).await.unwrap().len(), 1);
        assert_eq!(repo.list_instances(None).await.unwrap().len(), 3);
        assert_eq!(repo.instance_count(), 3);
    }

    #[tokio::test]
    async fn test_list_active_skips_paused_and_terminal() {
        let repo = InMemoryRepository::new();
        let def = definition();
        let now = Utc::now();
        let mut ids = Vec::new();
        for lead in ["active", "paused", "stopped"] {
            let inst = scheduler::instantiate(&def, lead, "adv", now).unwrap();
            ids.push(inst.id);
            repo.save_instance(&inst).await.unwrap();
        }
        let mut paused = repo.load_instance(ids[1]).await.unwrap();
        scheduler::pause(&mut paused, now).unwrap();
        repo.save_instance(&paused).await.unwrap();
        let mut stopped = repo.load_instance(ids[2]).await.unwrap();
        scheduler::stop(&mut stopped, now).unwrap();
        repo.save_instance(&stopped).await.unwrap();

        let active = repo.list_active_instances().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, ids[0]);
        assert_eq!(repo.list_instances(None).await.unwrap().len(), 3);
    }
}
