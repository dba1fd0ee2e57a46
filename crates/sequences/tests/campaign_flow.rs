//! End-to-end flows through the public engine API with an in-memory store.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use outreach_core::event_bus::capture_sink;
use outreach_core::types::EventType;
use outreach_core::{OutreachError, OutreachResult};
use outreach_sequences::{
    CampaignDefinition, CampaignRepository, DeliveryOutcome, DeliveryProvider, DeliveryRequest,
    InMemoryRepository, InstanceStatus, LeadCampaignInstance, OutreachEngine, StepChannel,
    StepEvent, StepStatus, StepTemplate,
};

struct AlwaysDelivers;

#[async_trait]
impl DeliveryProvider for AlwaysDelivers {
    async fn send(&self, _request: &DeliveryRequest) -> DeliveryOutcome {
        DeliveryOutcome::delivered()
    }
}

/// In-memory store that can be told to fail one definition load or one
/// instance save.
#[derive(Default)]
struct FlakyRepository {
    inner: InMemoryRepository,
    failing_definition: Mutex<Option<Uuid>>,
    /// Saves to let through before the next one fails.
    save_failure: Mutex<Option<usize>>,
}

impl FlakyRepository {
    fn fail_definition_once(&self, id: Uuid) {
        *self.failing_definition.lock().unwrap() = Some(id);
    }

    fn fail_save_after(&self, successes: usize) {
        *self.save_failure.lock().unwrap() = Some(successes);
    }
}

#[async_trait]
impl CampaignRepository for FlakyRepository {
    async fn load_definition(&self, id: Uuid) -> OutreachResult<CampaignDefinition> {
        let fail = {
            let mut failing = self.failing_definition.lock().unwrap();
            if *failing == Some(id) {
                *failing = None;
                true
            } else {
                false
            }
        };
        if fail {
            return Err(OutreachError::Remote("definition store timed out".into()));
        }
        self.inner.load_definition(id).await
    }

    async fn save_definition(&self, definition: &CampaignDefinition) -> OutreachResult<()> {
        self.inner.save_definition(definition).await
    }

    async fn load_instance(&self, id: Uuid) -> OutreachResult<LeadCampaignInstance> {
        self.inner.load_instance(id).await
    }

    async fn save_instance(&self, instance: &LeadCampaignInstance) -> OutreachResult<()> {
        let fail = {
            let mut armed = self.save_failure.lock().unwrap();
            match *armed {
                Some(0) => {
                    *armed = None;
                    true
                }
                Some(n) => {
                    *armed = Some(n - 1);
                    false
                }
                None => false,
            }
        };
        if fail {
            return Err(OutreachError::Remote("instance store unavailable".into()));
        }
        self.inner.save_instance(instance).await
    }

    async fn list_instances(
        &self,
        campaign_definition_id: Option<Uuid>,
    ) -> OutreachResult<Vec<LeadCampaignInstance>> {
        self.inner.list_instances(campaign_definition_id).await
    }

    async fn list_active_instances(&self) -> OutreachResult<Vec<LeadCampaignInstance>> {
        self.inner.list_active_instances().await
    }
}

fn day(n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 2, 14, 0, 0).unwrap() + Duration::days(n)
}

fn three_step_definition() -> CampaignDefinition {
    let touches = [
        (StepChannel::Email { subject: Some("Welcome aboard".into()) }, 0),
        (StepChannel::Sms, 2),
        (StepChannel::Task, 3),
    ];
    let steps = touches
        .into_iter()
        .enumerate()
        .map(|(idx, (channel, delay_days))| StepTemplate {
            ordinal: idx as u32 + 1,
            channel,
            title: format!("Touch {}", idx + 1),
            content: "Checking in".into(),
            delay_days,
        })
        .collect();
    CampaignDefinition::new("Advisor intro", steps)
        .with_audience("inbound leads")
        .with_budget(1500.0)
}

async fn engine_with_definition() -> (OutreachEngine, Uuid) {
    let engine = OutreachEngine::new(Arc::new(InMemoryRepository::new()), Arc::new(AlwaysDelivers));
    let def_id = engine
        .register_definition(three_step_definition())
        .await
        .unwrap();
    (engine, def_id)
}

fn scheduled(instance: &LeadCampaignInstance) -> Vec<DateTime<Utc>> {
    instance
        .step_executions
        .iter()
        .map(|s| s.scheduled_at)
        .collect()
}

#[tokio::test]
async fn pause_and_resume_shift_remaining_steps() {
    let (engine, def_id) = engine_with_definition().await;
    let id = engine.enroll(def_id, "lead-42", "adv-7", day(0)).await.unwrap();

    let inst = engine.get_instance(id).await.unwrap();
    assert_eq!(scheduled(&inst), vec![day(0), day(2), day(5)]);

    // First touch goes out on day 0.
    let report = engine.run_due_cycle(day(0)).await.unwrap();
    assert_eq!(report.sent, 1);

    engine.pause(id, day(1)).await.unwrap();
    // Nothing fires while paused, even past the original due dates.
    assert_eq!(engine.run_due_cycle(day(4)).await.unwrap().marked, 0);

    let inst = engine.resume(id, day(5)).await.unwrap();
    assert_eq!(inst.status(), InstanceStatus::Active);
    assert_eq!(scheduled(&inst), vec![day(0), day(6), day(9)]);
    assert_eq!(inst.step_executions[0].status, StepStatus::Completed);
    assert_eq!(inst.step_executions[0].executed_at, Some(day(0)));

    assert_eq!(engine.run_due_cycle(day(5)).await.unwrap().marked, 0);
    assert_eq!(engine.run_due_cycle(day(6)).await.unwrap().sent, 1);
    assert_eq!(engine.run_due_cycle(day(9)).await.unwrap().sent, 1);

    let inst = engine.get_instance(id).await.unwrap();
    assert_eq!(inst.status(), InstanceStatus::Completed);
}

#[tokio::test]
async fn analytics_reflect_mixed_step_outcomes() {
    let (engine, def_id) = engine_with_definition().await;
    let id = engine.enroll(def_id, "lead-1", "adv-1", day(0)).await.unwrap();

    engine.run_due_cycle(day(0)).await.unwrap();
    engine
        .record_event(id, 1, StepEvent::Opened(true), day(0) + Duration::hours(2))
        .await
        .unwrap();

    // Step 2 is handed to delivery but bounces before the send is confirmed.
    let requests = engine.scan_due(day(2)).await.unwrap();
    assert_eq!(requests.len(), 1);
    let failed = engine
        .record_event(id, 2, StepEvent::Bounced(true), day(2))
        .await
        .unwrap();
    assert_eq!(failed.status, StepStatus::Failed);

    let analytics = engine.get_analytics(id).await.unwrap();
    assert_eq!(analytics.open_rate, 1.0);
    assert_eq!(analytics.completed_steps, 1);
    assert_eq!(analytics.failed_steps, 1);
    assert_eq!(analytics.pending_steps, 1);
    assert_eq!(analytics.unsubscribe_rate, 0.0);
}

#[tokio::test]
async fn stop_and_unsubscribe_are_terminal_and_idempotent() {
    let (engine, def_id) = engine_with_definition().await;
    let sink = capture_sink();
    let engine = engine.with_event_sink(sink.clone());

    let stopped = engine.enroll(def_id, "lead-a", "adv", day(0)).await.unwrap();
    let unsubscribed = engine.enroll(def_id, "lead-b", "adv", day(0)).await.unwrap();

    let once = engine.stop(stopped, day(1)).await.unwrap();
    let twice = engine.stop(stopped, day(2)).await.unwrap();
    assert_eq!(once, twice);
    assert!(once
        .step_executions
        .iter()
        .all(|s| s.status == StepStatus::Skipped));

    let once = engine.unsubscribe(unsubscribed, day(1)).await.unwrap();
    let twice = engine.unsubscribe(unsubscribed, day(3)).await.unwrap();
    assert_eq!(once, twice);

    // Terminal instances reject pause and resume.
    for id in [stopped, unsubscribed] {
        assert!(matches!(
            engine.pause(id, day(4)).await,
            Err(OutreachError::InvalidStateTransition { .. })
        ));
        assert!(engine.resume(id, day(4)).await.is_err());
    }

    let fleet = engine.get_fleet_analytics(def_id).await.unwrap();
    assert_eq!(fleet.total_leads, 2);
    assert_eq!(fleet.count(InstanceStatus::Stopped), 1);
    assert_eq!(fleet.count(InstanceStatus::Unsubscribed), 1);
    assert_eq!(fleet.average_conversion, 0.0);

    assert_eq!(sink.count_type(EventType::InstanceEnrolled), 2);
    assert_eq!(sink.count_type(EventType::InstanceStatusChanged), 2);
    assert_eq!(sink.count_type(EventType::StepStatusChanged), 6);
}

#[tokio::test]
async fn concurrent_commands_on_many_instances() {
    let (engine, def_id) = engine_with_definition().await;
    let mut ids = Vec::new();
    for n in 0..20 {
        ids.push(
            engine
                .enroll(def_id, &format!("lead-{}", n), "adv", day(0))
                .await
                .unwrap(),
        );
    }

    let mut handles = Vec::new();
    for (n, id) in ids.iter().copied().enumerate() {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            if n % 2 == 0 {
                engine.pause(id, day(1)).await.map(|_| ())
            } else {
                engine.stop(id, day(1)).await.map(|_| ())
            }
        }));
    }
    // A scan racing with the commands must not corrupt any instance.
    engine.run_due_cycle(day(0)).await.unwrap();
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let fleet = engine.get_fleet_analytics(def_id).await.unwrap();
    assert_eq!(fleet.total_leads, 20);
    assert_eq!(fleet.count(InstanceStatus::Paused), 10);
    assert_eq!(fleet.count(InstanceStatus::Stopped), 10);

    for id in ids {
        let inst = engine.get_instance(id).await.unwrap();
        for step in &inst.step_executions {
            let executed = matches!(step.status, StepStatus::Completed | StepStatus::Failed);
            assert_eq!(step.executed_at.is_some(), executed);
        }
    }
}

#[tokio::test]
async fn store_failures_never_strand_steps() {
    let repository = Arc::new(FlakyRepository::default());
    let engine = OutreachEngine::new(repository.clone(), Arc::new(AlwaysDelivers));
    let def_a = engine.register_definition(three_step_definition()).await.unwrap();
    let def_b = engine.register_definition(three_step_definition()).await.unwrap();
    let first = engine.enroll(def_a, "lead-a", "adv", day(0)).await.unwrap();
    let second = engine
        .enroll(def_b, "lead-b", "adv", day(0) + Duration::hours(1))
        .await
        .unwrap();
    let now = day(0) + Duration::hours(2);

    // The second candidate's definition cannot be loaded; the first
    // candidate's marked step is still sent.
    repository.fail_definition_once(def_b);
    let report = engine.run_due_cycle(now).await.unwrap();
    assert_eq!((report.marked, report.sent), (1, 1));
    let inst = engine.get_instance(first).await.unwrap();
    assert_eq!(inst.step_executions[0].status, StepStatus::Completed);
    let inst = engine.get_instance(second).await.unwrap();
    assert_eq!(inst.step_executions[0].status, StepStatus::Pending);

    // Marking succeeds but recording the send result does not.
    repository.fail_save_after(1);
    let report = engine.run_due_cycle(now).await.unwrap();
    assert_eq!((report.marked, report.rejected), (1, 1));
    let inst = engine.get_instance(second).await.unwrap();
    assert_eq!(inst.step_executions[0].status, StepStatus::InProgress);

    // The next cycle offers the stranded step again.
    let report = engine.run_due_cycle(now).await.unwrap();
    assert_eq!(report.sent, 1);

    engine.run_due_cycle(day(6)).await.unwrap();
    for id in [first, second] {
        let inst = engine.get_instance(id).await.unwrap();
        assert_eq!(inst.status(), InstanceStatus::Completed);
        assert!(inst
            .step_executions
            .iter()
            .all(|s| s.status == StepStatus::Completed));
    }
}

#[tokio::test]
async fn concurrent_events_on_one_instance_are_all_kept() {
    let (engine, def_id) = engine_with_definition().await;
    let sink = capture_sink();
    let engine = engine.with_event_sink(sink.clone());
    let id = engine.enroll(def_id, "lead-1", "adv-1", day(0)).await.unwrap();

    // All three steps in progress at once.
    let requests = engine.scan_due(day(5)).await.unwrap();
    assert_eq!(requests.len(), 3);

    let mut handles = Vec::new();
    for ordinal in 1..=3 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.record_event(id, ordinal, StepEvent::Sent, day(5)).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let mut handles = Vec::new();
    for ordinal in 1..=3 {
        for event in [StepEvent::Opened(true), StepEvent::Clicked(true), StepEvent::Replied(ordinal == 2)] {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine.record_event(id, ordinal, event, day(5) + Duration::hours(1)).await
            }));
        }
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let inst = engine.get_instance(id).await.unwrap();
    assert_eq!(inst.status(), InstanceStatus::Completed);
    for step in &inst.step_executions {
        assert_eq!(step.status, StepStatus::Completed);
        assert!(step.analytics.sent);
        assert_eq!(step.analytics.opened, Some(true));
        assert_eq!(step.analytics.clicked, Some(true));
        assert_eq!(step.analytics.replied, Some(step.ordinal == 2));
    }

    let completions = sink
        .events()
        .into_iter()
        .filter(|e| {
            e.event_type == EventType::InstanceStatusChanged
                && e.to_status.as_deref() == Some("completed")
        })
        .count();
    assert_eq!(completions, 1);
}
