//! Client-side stores that mirror remote-owned state. Every mutation goes
//! through [`OptimisticStore::apply`]: the change is visible locally at once
//! and rolled back to an exact snapshot if the remote call fails.

pub mod activities;
pub mod campaigns;
pub mod conversations;
pub mod errors;
pub mod optimistic;

pub use activities::{Activity, ActivityBackend, ActivityStatus, ActivityStore};
pub use campaigns::{CampaignCommands, CampaignStore, CampaignView, EngineCommands};
pub use conversations::{Conversation, ConversationBackend, ConversationStore, Message};
pub use errors::{ErrorChannel, StoreError};
pub use optimistic::OptimisticStore;
