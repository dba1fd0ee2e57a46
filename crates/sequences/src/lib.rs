//! Outreach sequences — enrolls leads in timed, multi-channel campaign
//! sequences, advances each touch through its lifecycle, and derives
//! delivery/engagement analytics.

pub mod aggregator;
pub mod delivery;
pub mod engine;
pub mod locks;
pub mod recorder;
pub mod repository;
pub mod scheduler;
pub mod state_machine;
pub mod types;

pub use aggregator::{FleetAnalytics, InstanceAnalytics};
pub use delivery::{DeliveryOutcome, DeliveryProvider, DeliveryRequest, SimulatedDelivery};
pub use engine::{CycleReport, OutreachEngine};
pub use recorder::StepEvent;
pub use state_machine::{LifecycleCommand, LifecycleStateMachine};
pub use repository::{CampaignRepository, InMemoryRepository};
pub use types::{
    CampaignDefinition, InstanceState, InstanceStatus, LeadCampaignInstance, StepChannel,
    StepExecution, StepStatus, StepTemplate,
};
