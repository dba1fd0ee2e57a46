//! Day-stepped simulation of one demo campaign against the in-memory stack.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{info, warn};
use uuid::Uuid;

use outreach_client::{CampaignStore, EngineCommands, ErrorChannel, StoreError};
use outreach_core::config::AppConfig;
use outreach_core::event_bus::BroadcastSink;
use outreach_core::types::OutreachEvent;
use outreach_sequences::{
    CampaignDefinition, CampaignRepository, CycleReport, FleetAnalytics, InMemoryRepository,
    InstanceStatus, OutreachEngine, SimulatedDelivery, StepChannel, StepEvent, StepStatus,
    StepTemplate,
};

const EVENT_CAPACITY: usize = 4096;

pub struct SimulationOptions {
    pub days: u32,
    pub leads: usize,
    pub seed: u64,
}

#[derive(Debug, Serialize)]
pub struct SimulationSummary {
    pub definition_id: Uuid,
    pub definition_name: String,
    pub days: u32,
    pub leads: usize,
    pub cycles: CycleReport,
    pub engagements: usize,
    pub fleet: FleetAnalytics,
    /// Status counts as seen by the client store after event reconciliation.
    pub client_view: HashMap<InstanceStatus, usize>,
    pub client_errors: Vec<StoreError>,
}

/// Five touches over two weeks: intro email, text nudge, discovery call,
/// resources email, advisor review task.
pub fn demo_definition() -> CampaignDefinition {
    let touches = [
        (
            StepChannel::Email {
                subject: Some("Planning your next financial milestone".into()),
            },
            "Introduction",
            "Introduce the advisor and offer a short consultation.",
            0,
        ),
        (
            StepChannel::Sms,
            "Quick nudge",
            "Short text checking whether the intro email landed.",
            2,
        ),
        (
            StepChannel::Call,
            "Discovery call",
            "Call to understand goals and timeline.",
            3,
        ),
        (
            StepChannel::Email {
                subject: Some("Resources we discussed".into()),
            },
            "Resources",
            "Send the retirement planning guide and booking link.",
            4,
        ),
        (
            StepChannel::Task,
            "Review engagement",
            "Advisor reviews engagement and decides on next steps.",
            5,
        ),
    ];
    let steps = touches
        .into_iter()
        .enumerate()
        .map(|(idx, (channel, title, content, delay_days))| StepTemplate {
            ordinal: idx as u32 + 1,
            channel,
            title: title.to_string(),
            content: content.to_string(),
            delay_days,
        })
        .collect();
    CampaignDefinition::new("Advisor introduction", steps)
        .with_audience("new inbound leads")
        .with_budget(2500.0)
}

/// Simulated time shared with the client's command path.
#[derive(Clone)]
struct SimClock(Arc<RwLock<DateTime<Utc>>>);

impl SimClock {
    fn new(start: DateTime<Utc>) -> Self {
        Self(Arc::new(RwLock::new(start)))
    }

    fn set(&self, now: DateTime<Utc>) {
        *self.0.write() = now;
    }

    fn now(&self) -> DateTime<Utc> {
        *self.0.read()
    }
}

pub async fn simulate(config: &AppConfig, options: &SimulationOptions) -> anyhow::Result<SimulationSummary> {
    let repository = Arc::new(InMemoryRepository::new());
    let delivery = Arc::new(SimulatedDelivery::new(&config.delivery));
    let sink = Arc::new(BroadcastSink::new(EVENT_CAPACITY));
    let mut events = sink.subscribe();
    let engine = OutreachEngine::new(repository.clone(), delivery)
        .with_config(&config.scheduler, &config.delivery)
        .with_event_sink(sink);

    let start = Utc::now();
    let clock = SimClock::new(start);
    let commands = {
        let clock = clock.clone();
        EngineCommands::new(engine.clone()).with_clock(move || clock.now())
    };
    let store = CampaignStore::new(Arc::new(commands), Arc::new(ErrorChannel::new()));

    let definition = demo_definition();
    let definition_name = definition.name.clone();
    let def_id = engine.register_definition(definition).await?;

    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut ids = Vec::with_capacity(options.leads);
    for n in 0..options.leads {
        // Enrollments trickle in over the first three days.
        let offset = Duration::hours(rng.gen_range(0..72));
        let id = engine
            .enroll(
                def_id,
                &format!("lead-{:04}", n + 1),
                &format!("adv-{}", n % 3 + 1),
                start + offset,
            )
            .await?;
        ids.push(id);
    }
    store.refresh(&repository.list_instances(Some(def_id)).await?);
    drain_events(&mut events, &store, repository.as_ref(), def_id).await?;

    let mut cycles = CycleReport::default();
    let mut engagements = 0;
    for day in 0..=options.days {
        let now = start + Duration::days(i64::from(day));
        clock.set(now);

        let report = engine.run_due_cycle(now).await?;
        cycles.marked += report.marked;
        cycles.sent += report.sent;
        cycles.failed += report.failed;
        cycles.rejected += report.rejected;

        engagements += record_engagement(&engine, repository.as_ref(), def_id, now, &mut rng).await?;
        advisor_actions(&store, &ids, day).await;
        let reconciled = drain_events(&mut events, &store, repository.as_ref(), def_id).await?;

        info!(
            day,
            marked = report.marked,
            sent = report.sent,
            failed = report.failed,
            reconciled,
            "Simulated day"
        );
    }

    let fleet = engine.get_fleet_analytics(def_id).await?;
    let mut client_view = HashMap::new();
    for row in store.list() {
        *client_view.entry(row.status).or_insert(0) += 1;
    }

    Ok(SimulationSummary {
        definition_id: def_id,
        definition_name,
        days: options.days,
        leads: options.leads,
        cycles,
        engagements,
        fleet,
        client_view,
        client_errors: store.errors().all(),
    })
}

/// Rolls lead reactions for every step sent at `now`.
async fn record_engagement(
    engine: &OutreachEngine,
    repository: &InMemoryRepository,
    def_id: Uuid,
    now: DateTime<Utc>,
    rng: &mut StdRng,
) -> anyhow::Result<usize> {
    let mut recorded = 0;
    for instance in repository.list_instances(Some(def_id)).await? {
        let sent_now: Vec<u32> = instance
            .step_executions
            .iter()
            .filter(|s| s.status == StepStatus::Completed && s.executed_at == Some(now))
            .map(|s| s.ordinal)
            .collect();

        for ordinal in sent_now {
            let mut reactions = Vec::new();
            if rng.gen_bool(0.04) {
                reactions.push(StepEvent::Bounced(true));
            } else {
                reactions.push(StepEvent::Delivered(true));
                if rng.gen_bool(0.55) {
                    reactions.push(StepEvent::Opened(true));
                    if rng.gen_bool(0.35) {
                        reactions.push(StepEvent::Clicked(true));
                    }
                }
                if rng.gen_bool(0.12) {
                    reactions.push(StepEvent::Replied(true));
                }
                if rng.gen_bool(0.015) {
                    reactions.push(StepEvent::Unsubscribed(true));
                }
            }

            for event in reactions {
                match engine.record_event(instance.id, ordinal, event, now).await {
                    Ok(_) => recorded += 1,
                    Err(e) => warn!(instance_id = %instance.id, ordinal, error = %e, "Engagement not recorded"),
                }
            }
        }
    }
    Ok(recorded)
}

/// Scripted advisor interventions through the client store.
async fn advisor_actions(store: &CampaignStore, ids: &[Uuid], day: u32) {
    let action = match (day, ids) {
        (1, [first, ..]) => store.pause(*first).await,
        (3, [_, second, ..]) => store.stop(*second).await,
        (4, [first, ..]) => store.resume(*first).await,
        _ => return,
    };
    if let Err(e) = action {
        // The store has already rolled back and reported the failure.
        warn!(day, error = %e, "Advisor action rejected");
    }
}

/// Applies queued engine events to the client store. Falls back to a full
/// refresh when the feed lagged.
async fn drain_events(
    events: &mut broadcast::Receiver<OutreachEvent>,
    store: &CampaignStore,
    repository: &InMemoryRepository,
    def_id: Uuid,
) -> anyhow::Result<usize> {
    let mut applied = 0;
    loop {
        match events.try_recv() {
            Ok(event) => {
                if store.apply_event(&event) {
                    applied += 1;
                }
            }
            Err(TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "Event feed lagged, refreshing client store");
                store.refresh(&repository.list_instances(Some(def_id)).await?);
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
    Ok(applied)
}
