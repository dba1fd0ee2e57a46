//! Optimistic update coordinator — applies a mutation locally, awaits the
//! remote call, and restores the pre-mutation snapshot when the remote fails.
//!
//! Rollback restores the whole entity. A second update to the same entity
//! issued while the first is in flight is allowed but logged, since a failed
//! first call will also discard the second's local change.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use outreach_core::{OutreachError, OutreachResult};

use crate::errors::ErrorChannel;

pub struct OptimisticStore<K, V> {
    name: &'static str,
    entities: RwLock<HashMap<K, V>>,
    /// Remote calls still pending per key.
    in_flight: Mutex<HashMap<K, usize>>,
    errors: Arc<ErrorChannel>,
}

/// Holds one in-flight slot for a key; releases it on drop so a cancelled
/// update does not leave the key marked forever.
struct InFlightSlot<'a, K: Eq + Hash> {
    counts: &'a Mutex<HashMap<K, usize>>,
    key: K,
}

impl<K: Eq + Hash> Drop for InFlightSlot<'_, K> {
    fn drop(&mut self) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&self.key);
            }
        }
    }
}

impl<K, V> OptimisticStore<K, V>
where
    K: Eq + Hash + Clone + Display,
    V: Clone,
{
    pub fn new(name: &'static str, errors: Arc<ErrorChannel>) -> Self {
        Self {
            name,
            entities: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            errors,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn errors(&self) -> &Arc<ErrorChannel> {
        &self.errors
    }

    /// Replaces local state with server-confirmed data.
    pub fn upsert(&self, key: K, value: V) {
        self.entities.write().insert(key, value);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entities.write().remove(key)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entities.read().get(key).cloned()
    }

    pub fn values(&self) -> Vec<V> {
        self.entities.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    /// Mutates `key` without a remote round trip. Returns false if the key is
    /// unknown.
    pub fn update_local(&self, key: &K, mutate: impl FnOnce(&mut V)) -> bool {
        match self.entities.write().get_mut(key) {
            Some(value) => {
                mutate(value);
                true
            }
            None => false,
        }
    }

    /// Applies `mutate` locally, then runs `remote` with the updated value.
    /// On remote failure the entity is restored to its exact prior state and
    /// the error is reported on the shared channel before being returned.
    pub async fn apply<T, M, R, Fut>(&self, key: &K, mutate: M, remote: R) -> OutreachResult<T>
    where
        M: FnOnce(&mut V),
        R: FnOnce(V) -> Fut,
        Fut: Future<Output = OutreachResult<T>>,
    {
        let (snapshot, updated) = {
            let mut entities = self.entities.write();
            let value = entities
                .get_mut(key)
                .ok_or_else(|| OutreachError::not_found(self.name, key))?;
            let snapshot = value.clone();
            mutate(value);
            (snapshot, value.clone())
        };

        let pending = {
            let mut counts = self.in_flight.lock();
            let count = counts.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if pending > 1 {
            warn!(
                store = self.name,
                key = %key,
                pending,
                "Update issued while another is in flight; a rollback will discard both"
            );
        }
        let slot = InFlightSlot {
            counts: &self.in_flight,
            key: key.clone(),
        };

        let result = remote(updated).await;
        drop(slot);

        match result {
            Ok(value) => {
                debug!(store = self.name, key = %key, "Remote confirmed optimistic update");
                Ok(value)
            }
            Err(e) => {
                self.entities.write().insert(key.clone(), snapshot);
                self.errors.report(self.name, &key.to_string(), e.to_string());
                metrics::counter!("outreach.optimistic_rollbacks", "store" => self.name)
                    .increment(1);
                warn!(store = self.name, key = %key, error = %e, "Optimistic update rolled back");
                Err(e)
            }
        }
    }
}
