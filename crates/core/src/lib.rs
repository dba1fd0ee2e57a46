//! Shared building blocks for the outreach campaign engine: configuration,
//! the error taxonomy, and the event bus used to publish lifecycle changes.

pub mod config;
pub mod error;
pub mod event_bus;
pub mod types;

pub use config::AppConfig;
pub use error::{OutreachError, OutreachResult};
