use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use outreach_core::config::{DeliveryConfig, SchedulerConfig};
use outreach_core::event_bus::{make_event, EventSink};
use outreach_core::types::EventType;
use outreach_core::{OutreachError, OutreachResult};

use crate::aggregator::{self, FleetAnalytics, InstanceAnalytics};
use crate::delivery::{DeliveryProvider, DeliveryRequest};
use crate::locks::KeyedLocks;
use crate::recorder::{self, StepChange, StepEvent};
use crate::repository::CampaignRepository;
use crate::scheduler::{self, LifecycleOutcome};
use crate::types::{CampaignDefinition, LeadCampaignInstance, StepExecution, StepStatus};

/// Summary of one due-step cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Steps moved from pending to in progress.
    pub marked: usize,
    pub sent: usize,
    pub failed: usize,
    /// Delivery results that could not be applied, e.g. because the
    /// instance was stopped while the send was in flight.
    pub rejected: usize,
}

/// Orchestrates enrollments: lifecycle commands, event recording, due-step
/// scanning and dispatch. All mutations of one instance are serialized
/// through a per-instance lock; the delivery provider is always called
/// outside that lock.
#[derive(Clone)]
pub struct OutreachEngine {
    repository: Arc<dyn CampaignRepository>,
    delivery: Arc<dyn DeliveryProvider>,
    locks: Arc<KeyedLocks>,
    /// Steps handed to a dispatch that has not reported back yet.
    in_flight: Arc<DashSet<(Uuid, u32)>>,
    event_sink: Arc<dyn EventSink>,
    max_dispatch_per_cycle: usize,
    send_timeout: Duration,
}

impl std::fmt::Debug for OutreachEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutreachEngine")
            .field("locks", &self.locks.len())
            .field("in_flight", &self.in_flight.len())
            .field("max_dispatch_per_cycle", &self.max_dispatch_per_cycle)
            .field("send_timeout", &self.send_timeout)
            .finish()
    }
}

impl OutreachEngine {
    pub fn new(
        repository: Arc<dyn CampaignRepository>,
        delivery: Arc<dyn DeliveryProvider>,
    ) -> Self {
        let scheduler = SchedulerConfig::default();
        let delivery_config = DeliveryConfig::default();
        Self {
            repository,
            delivery,
            locks: Arc::new(KeyedLocks::new()),
            in_flight: Arc::new(DashSet::new()),
            event_sink: outreach_core::event_bus::noop_sink(),
            max_dispatch_per_cycle: scheduler.max_dispatch_per_cycle,
            send_timeout: Duration::from_millis(delivery_config.send_timeout_ms),
        }
    }

    /// Attach an event sink for publishing status changes.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn with_config(mut self, scheduler: &SchedulerConfig, delivery: &DeliveryConfig) -> Self {
        self.max_dispatch_per_cycle = scheduler.max_dispatch_per_cycle.max(1);
        self.send_timeout = Duration::from_millis(delivery.send_timeout_ms);
        self
    }

    // ─── Definitions ───────────────────────────────────────────────────────

    /// Validates and stores a definition; returns its id.
    pub async fn register_definition(&self, definition: CampaignDefinition) -> OutreachResult<Uuid> {
        definition.validate()?;
        info!(
            definition_id = %definition.id,
            name = %definition.name,
            steps = definition.steps.len(),
            duration_days = definition.total_duration_days(),
            "Registering campaign definition"
        );
        self.repository.save_definition(&definition).await?;
        Ok(definition.id)
    }

    pub async fn get_definition(&self, id: Uuid) -> OutreachResult<CampaignDefinition> {
        self.repository.load_definition(id).await
    }

    // ─── Enrollment ────────────────────────────────────────────────────────

    pub async fn enroll(
        &self,
        campaign_definition_id: Uuid,
        lead_id: &str,
        advisor_id: &str,
        start_date: DateTime<Utc>,
    ) -> OutreachResult<Uuid> {
        let definition = self.repository.load_definition(campaign_definition_id).await?;
        let instance = scheduler::instantiate(&definition, lead_id, advisor_id, start_date)?;
        let instance_id = instance.id;

        self.repository.save_instance(&instance).await?;

        info!(
            instance_id = %instance_id,
            definition_id = %campaign_definition_id,
            lead_id = %lead_id,
            advisor_id = %advisor_id,
            "Lead enrolled in campaign"
        );
        self.event_sink.emit(
            make_event(
                EventType::InstanceEnrolled,
                instance_id,
                Some(lead_id.to_string()),
            )
            .at(instance.updated_at),
        );

        Ok(instance_id)
    }

    pub async fn get_instance(&self, id: Uuid) -> OutreachResult<LeadCampaignInstance> {
        self.repository.load_instance(id).await
    }

    // ─── Lifecycle commands ────────────────────────────────────────────────

    pub async fn pause(&self, id: Uuid, now: DateTime<Utc>) -> OutreachResult<LeadCampaignInstance> {
        self.lifecycle(id, now, scheduler::pause).await
    }

    pub async fn resume(&self, id: Uuid, now: DateTime<Utc>) -> OutreachResult<LeadCampaignInstance> {
        self.lifecycle(id, now, scheduler::resume).await
    }

    /// Idempotent: stopping a terminal instance returns it unchanged.
    pub async fn stop(&self, id: Uuid, now: DateTime<Utc>) -> OutreachResult<LeadCampaignInstance> {
        self.lifecycle(id, now, scheduler::stop).await
    }

    /// Idempotent: unsubscribing a terminal instance returns it unchanged.
    pub async fn unsubscribe(&self, id: Uuid, now: DateTime<Utc>) -> OutreachResult<LeadCampaignInstance> {
        self.lifecycle(id, now, scheduler::unsubscribe).await
    }

    async fn lifecycle(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        command: fn(&mut LeadCampaignInstance, DateTime<Utc>) -> OutreachResult<LifecycleOutcome>,
    ) -> OutreachResult<LeadCampaignInstance> {
        let (instance, outcome) = self
            .mutate(id, |inst| {
                let outcome = command(inst, now)?;
                Ok((outcome.changed, outcome))
            })
            .await?;

        metrics::counter!(
            "outreach.lifecycle_commands",
            "command" => outcome.command.as_str()
        )
        .increment(1);

        if outcome.changed {
            info!(
                instance_id = %id,
                command = %outcome.command,
                from = %outcome.from,
                to = %outcome.to,
                skipped = outcome.skipped.len(),
                "Instance lifecycle changed"
            );
            self.release_steps(id, outcome.skipped.iter().map(|c| c.ordinal));
            self.emit_lifecycle(&instance, &outcome, now);
        } else {
            debug!(instance_id = %id, command = %outcome.command, status = %outcome.to, "Lifecycle command was a no-op");
        }
        Ok(instance)
    }

    // ─── Event recording ───────────────────────────────────────────────────

    /// Applies one delivery/engagement event to one step. A step that
    /// records an unsubscribe unsubscribes the whole instance.
    pub async fn record_event(
        &self,
        id: Uuid,
        ordinal: u32,
        event: StepEvent,
        now: DateTime<Utc>,
    ) -> OutreachResult<StepExecution> {
        let (instance, (change, lifecycle)) = self
            .mutate(id, |inst| {
                let change = recorder::apply_event(inst.step_mut(ordinal)?, &event, now)?;
                let mut lifecycle = Vec::new();
                if event == StepEvent::Unsubscribed(true) {
                    lifecycle.push(scheduler::unsubscribe(inst, now)?);
                }
                lifecycle.extend(scheduler::complete_if_finished(inst, now));
                inst.updated_at = now;
                Ok((true, (change, lifecycle)))
            })
            .await?;

        debug!(
            instance_id = %id,
            ordinal,
            event = event.name(),
            from = %change.from,
            to = %change.to,
            "Step event recorded"
        );
        if change.from == StepStatus::InProgress && change.to != StepStatus::InProgress {
            self.release_steps(id, [ordinal]);
        }
        self.emit_step_change(&instance, &change, Some(event.name()), now);
        if !change.status_changed() {
            self.event_sink.emit(
                make_event(EventType::EngagementRecorded, id, Some(instance.lead_id.clone()))
                    .with_step(ordinal)
                    .with_detail(event.name())
                    .at(now),
            );
        }
        for outcome in lifecycle.iter().filter(|o| o.changed) {
            info!(instance_id = %id, command = %outcome.command, to = %outcome.to, "Instance lifecycle changed");
            self.release_steps(id, outcome.skipped.iter().map(|c| c.ordinal));
            self.emit_lifecycle(&instance, outcome, now);
        }

        instance
            .step(ordinal)
            .cloned()
            .ok_or_else(|| OutreachError::not_found("step", format!("{}#{}", id, ordinal)))
    }

    // ─── Analytics ─────────────────────────────────────────────────────────

    pub async fn get_analytics(&self, id: Uuid) -> OutreachResult<InstanceAnalytics> {
        let instance = self.repository.load_instance(id).await?;
        Ok(aggregator::instance_analytics(&instance))
    }

    pub async fn get_fleet_analytics(&self, campaign_definition_id: Uuid) -> OutreachResult<FleetAnalytics> {
        // Surfaces NotFound for unknown definitions.
        self.repository.load_definition(campaign_definition_id).await?;
        let instances = self
            .repository
            .list_instances(Some(campaign_definition_id))
            .await?;
        Ok(aggregator::fleet_analytics(campaign_definition_id, &instances))
    }

    // ─── Due-step scanning and dispatch ────────────────────────────────────

    /// Marks every due step of every active instance as in progress and
    /// returns the delivery requests to hand to the provider. Paused and
    /// terminal instances are never considered.
    ///
    /// A step left in progress by a dispatch that never reported back is
    /// offered again. An instance whose definition or state cannot be loaded
    /// is skipped for this cycle; requests already marked are still returned.
    pub async fn scan_due(&self, now: DateTime<Utc>) -> OutreachResult<Vec<DeliveryRequest>> {
        let candidates: Vec<LeadCampaignInstance> = self
            .repository
            .list_active_instances()
            .await?
            .into_iter()
            .filter(|inst| !scheduler::due_steps(inst, now).is_empty() || self.has_stranded(inst))
            .collect();

        let mut definitions: HashMap<Uuid, CampaignDefinition> = HashMap::new();
        let mut requests = Vec::new();

        for candidate in candidates {
            let budget = self.max_dispatch_per_cycle.saturating_sub(requests.len());
            if budget == 0 {
                debug!("Dispatch budget exhausted for this cycle");
                break;
            }
            let def_id = candidate.campaign_definition_id;
            if !definitions.contains_key(&def_id) {
                match self.repository.load_definition(def_id).await {
                    Ok(definition) => {
                        definitions.insert(def_id, definition);
                    }
                    Err(err) => {
                        warn!(
                            instance_id = %candidate.id,
                            definition_id = %def_id,
                            error = %err,
                            "Skipping due instance, definition unavailable"
                        );
                        continue;
                    }
                }
            }
            let Some(definition) = definitions.get(&def_id) else {
                continue;
            };

            // The candidate list is a snapshot; re-check under the lock.
            let mut offered = Vec::new();
            let marked = self
                .mutate(candidate.id, |inst| {
                    for ordinal in scheduler::in_progress_steps(inst) {
                        if offered.len() < budget && self.in_flight.insert((inst.id, ordinal)) {
                            warn!(instance_id = %inst.id, ordinal, "Re-offering step left in progress");
                            offered.push(ordinal);
                        }
                    }
                    let room = budget.saturating_sub(offered.len());
                    let mut changes = Vec::new();
                    for ordinal in scheduler::due_steps(inst, now).into_iter().take(room) {
                        let state = inst.state;
                        changes.push(recorder::mark_due(inst.step_mut(ordinal)?, &state, now)?);
                        self.in_flight.insert((inst.id, ordinal));
                        offered.push(ordinal);
                    }
                    if !changes.is_empty() {
                        inst.updated_at = now;
                    }
                    Ok((!changes.is_empty(), changes))
                })
                .await;

            let (instance, changes) = match marked {
                Ok(marked) => marked,
                Err(err) => {
                    self.release_steps(candidate.id, offered);
                    warn!(instance_id = %candidate.id, error = %err, "Skipping due instance");
                    continue;
                }
            };

            for change in &changes {
                self.emit_step_change(&instance, change, Some("due"), now);
            }
            for ordinal in offered {
                match definition.step(ordinal) {
                    Some(template) => requests.push(DeliveryRequest::new(
                        instance.id,
                        &instance.lead_id,
                        &instance.advisor_id,
                        template,
                    )),
                    None => warn!(
                        instance_id = %instance.id,
                        ordinal,
                        "Step has no template in its definition"
                    ),
                }
            }
        }

        if !requests.is_empty() {
            info!(due = requests.len(), "Due steps marked in progress");
        }
        Ok(requests)
    }

    /// Sends one in-progress step and applies the result. A failed or timed
    /// out send is recorded as a failed step rather than returned as an
    /// error.
    pub async fn dispatch(
        &self,
        request: DeliveryRequest,
        now: DateTime<Utc>,
    ) -> OutreachResult<StepExecution> {
        let channel = request.channel.label();
        metrics::counter!("outreach.steps_dispatched", "channel" => channel).increment(1);

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.send_timeout, self.delivery.send(&request)).await;
        metrics::histogram!("outreach.send_latency_ms", "channel" => channel)
            .record(started.elapsed().as_millis() as f64);

        let failure = match outcome {
            Ok(outcome) if outcome.delivered => None,
            Ok(outcome) => Some(
                OutreachError::DeliveryFailure(
                    outcome.reason.unwrap_or_else(|| "provider reported failure".to_string()),
                ),
            ),
            Err(_) => Some(OutreachError::DeliveryFailure(format!(
                "send timed out after {} ms",
                self.send_timeout.as_millis()
            ))),
        };

        let event = match &failure {
            None => StepEvent::Sent,
            Some(err) => {
                warn!(
                    instance_id = %request.instance_id,
                    ordinal = request.ordinal,
                    channel,
                    error = %err,
                    "Delivery failed"
                );
                metrics::counter!("outreach.delivery_failures", "channel" => channel).increment(1);
                self.event_sink.emit(
                    make_event(
                        EventType::DeliveryFailed,
                        request.instance_id,
                        Some(request.lead_id.clone()),
                    )
                    .with_step(request.ordinal)
                    .with_detail(err.to_string())
                    .at(now),
                );
                StepEvent::Failed(err.to_string())
            }
        };

        let recorded = self
            .record_event(request.instance_id, request.ordinal, event, now)
            .await;
        self.release_steps(request.instance_id, [request.ordinal]);
        let step = recorded?;
        self.event_sink.emit(
            make_event(
                EventType::StepDispatched,
                request.instance_id,
                Some(request.lead_id.clone()),
            )
            .with_step(request.ordinal)
            .with_detail(channel)
            .at(now),
        );
        Ok(step)
    }

    /// One pass of the recurring scheduler: mark due steps, then send them
    /// concurrently.
    pub async fn run_due_cycle(&self, now: DateTime<Utc>) -> OutreachResult<CycleReport> {
        let requests = self.scan_due(now).await?;
        let mut report = CycleReport {
            marked: requests.len(),
            ..CycleReport::default()
        };

        let mut tasks = JoinSet::new();
        for request in requests {
            let engine = self.clone();
            tasks.spawn(async move { engine.dispatch(request, now).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(step)) if step.executed_at.is_some() && step.analytics.sent => report.sent += 1,
                Ok(Ok(_)) => report.failed += 1,
                Ok(Err(err)) => {
                    warn!(error = %err, "Delivery result rejected");
                    report.rejected += 1;
                }
                Err(err) => {
                    warn!(error = %err, "Dispatch task aborted");
                    report.rejected += 1;
                }
            }
        }

        self.locks.prune();
        if report.marked > 0 {
            info!(
                marked = report.marked,
                sent = report.sent,
                failed = report.failed,
                rejected = report.rejected,
                "Due cycle finished"
            );
        }
        Ok(report)
    }

    // ─── Internals ─────────────────────────────────────────────────────────

    /// Loads the instance under its lock, runs `f` on a working copy and
    /// saves it when `f` reports a change. A failing `f` leaves the stored
    /// instance untouched.
    async fn mutate<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut LeadCampaignInstance) -> OutreachResult<(bool, T)>,
    ) -> OutreachResult<(LeadCampaignInstance, T)> {
        let _guard = self.locks.lock(id).await;
        let mut instance = self.repository.load_instance(id).await?;
        let (changed, value) = f(&mut instance)?;
        if changed {
            self.repository.save_instance(&instance).await?;
        }
        Ok((instance, value))
    }

    fn has_stranded(&self, instance: &LeadCampaignInstance) -> bool {
        scheduler::in_progress_steps(instance)
            .into_iter()
            .any(|ordinal| !self.in_flight.contains(&(instance.id, ordinal)))
    }

    fn release_steps(&self, id: Uuid, ordinals: impl IntoIterator<Item = u32>) {
        for ordinal in ordinals {
            self.in_flight.remove(&(id, ordinal));
        }
    }

    fn emit_step_change(
        &self,
        instance: &LeadCampaignInstance,
        change: &StepChange,
        detail: Option<&str>,
        now: DateTime<Utc>,
    ) {
        if !change.status_changed() {
            return;
        }
        let mut event = make_event(
            EventType::StepStatusChanged,
            instance.id,
            Some(instance.lead_id.clone()),
        )
        .with_step(change.ordinal)
        .with_transition(change.from, change.to)
        .at(now);
        if let Some(detail) = detail {
            event = event.with_detail(detail);
        }
        self.event_sink.emit(event);
    }

    fn emit_lifecycle(&self, instance: &LeadCampaignInstance, outcome: &LifecycleOutcome, now: DateTime<Utc>) {
        self.event_sink.emit(
            make_event(
                EventType::InstanceStatusChanged,
                instance.id,
                Some(instance.lead_id.clone()),
            )
            .with_transition(outcome.from, outcome.to)
            .with_detail(outcome.command.as_str())
            .at(now),
        );
        for change in &outcome.skipped {
            self.emit_step_change(instance, change, Some(outcome.command.as_str()), now);
        }
    }
}
