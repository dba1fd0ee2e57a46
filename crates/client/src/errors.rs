//! Shared error channel. Failures are attached to the store and entity they
//! concern and cleared independently; nothing here ever panics the caller.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreError {
    pub store: String,
    pub entity_id: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
pub struct ErrorChannel {
    errors: DashMap<(String, String), StoreError>,
}

impl ErrorChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the latest error for an entity, replacing any earlier one.
    pub fn report(&self, store: &str, entity_id: &str, message: impl Into<String>) {
        let error = StoreError {
            store: store.to_string(),
            entity_id: entity_id.to_string(),
            message: message.into(),
            at: Utc::now(),
        };
        self.errors
            .insert((store.to_string(), entity_id.to_string()), error);
    }

    pub fn get(&self, store: &str, entity_id: &str) -> Option<StoreError> {
        self.errors
            .get(&(store.to_string(), entity_id.to_string()))
            .map(|r| r.value().clone())
    }

    pub fn clear(&self, store: &str, entity_id: &str) -> bool {
        self.errors
            .remove(&(store.to_string(), entity_id.to_string()))
            .is_some()
    }

    pub fn clear_store(&self, store: &str) {
        self.errors.retain(|(s, _), _| s != store);
    }

    /// All current errors, oldest first.
    pub fn all(&self) -> Vec<StoreError> {
        let mut errors: Vec<StoreError> = self.errors.iter().map(|r| r.value().clone()).collect();
        errors.sort_by(|a, b| a.at.cmp(&b.at));
        errors
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}
