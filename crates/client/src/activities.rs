//! Advisor activity board. Status moves are optimistic.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use outreach_core::{OutreachError, OutreachResult};

use crate::errors::ErrorChannel;
use crate::optimistic::OptimisticStore;

pub const STORE_NAME: &str = "activities";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Todo,
    InProgress,
    Done,
}

impl fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActivityStatus::Todo => "todo",
            ActivityStatus::InProgress => "in_progress",
            ActivityStatus::Done => "done",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: Uuid,
    pub lead_id: String,
    pub title: String,
    pub status: ActivityStatus,
    pub due_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Activity {
    pub fn new(lead_id: &str, title: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead_id: lead_id.to_string(),
            title: title.to_string(),
            status: ActivityStatus::Todo,
            due_at: None,
            updated_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ActivityBackend: Send + Sync {
    async fn update_status(&self, id: Uuid, status: ActivityStatus) -> OutreachResult<()>;
}

pub struct ActivityStore {
    store: OptimisticStore<Uuid, Activity>,
    remote: Arc<dyn ActivityBackend>,
}

impl ActivityStore {
    pub fn new(remote: Arc<dyn ActivityBackend>, errors: Arc<ErrorChannel>) -> Self {
        Self {
            store: OptimisticStore::new(STORE_NAME, errors),
            remote,
        }
    }

    pub fn load(&self, activities: Vec<Activity>) {
        for activity in activities {
            self.store.upsert(activity.id, activity);
        }
    }

    pub fn get(&self, id: Uuid) -> Option<Activity> {
        self.store.get(&id)
    }

    /// One board column, soonest due first; undated items last.
    pub fn column(&self, status: ActivityStatus) -> Vec<Activity> {
        let mut items: Vec<Activity> = self
            .store
            .values()
            .into_iter()
            .filter(|a| a.status == status)
            .collect();
        items.sort_by(|a, b| match (a.due_at, b.due_at) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.title.cmp(&b.title),
        });
        items
    }

    pub async fn move_to(&self, id: Uuid, status: ActivityStatus) -> OutreachResult<()> {
        let current = self
            .store
            .get(&id)
            .ok_or_else(|| OutreachError::not_found(STORE_NAME, id))?;
        if current.status == status {
            return Ok(());
        }

        let remote = self.remote.clone();
        self.store
            .apply(
                &id,
                |activity| {
                    activity.status = status;
                    activity.updated_at = Utc::now();
                },
                |_| async move { remote.update_status(id, status).await },
            )
            .await?;
        info!(activity_id = %id, from = %current.status, to = %status, "Activity moved");
        Ok(())
    }

    pub fn errors(&self) -> &Arc<ErrorChannel> {
        self.store.errors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FlakyBackend {
        fail: Mutex<bool>,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl ActivityBackend for FlakyBackend {
        async fn update_status(&self, _id: Uuid, _status: ActivityStatus) -> OutreachResult<()> {
            *self.calls.lock() += 1;
            if *self.fail.lock() {
                Err(OutreachError::Remote("timeout".into()))
            } else {
                Ok(())
            }
        }
    }

    fn board() -> (ActivityStore, Arc<FlakyBackend>, Vec<Activity>) {
        let backend = Arc::new(FlakyBackend::default());
        let store = ActivityStore::new(backend.clone(), Arc::new(ErrorChannel::new()));
        let mut call = Activity::new("lead-1", "Call back");
        call.due_at = Some(Utc::now() + Duration::days(2));
        let mut email = Activity::new("lead-2", "Send brochure");
        email.due_at = Some(Utc::now() + Duration::days(1));
        let note = Activity::new("lead-3", "Update notes");
        let items = vec![call, email, note];
        store.load(items.clone());
        (store, backend, items)
    }

    #[test]
    fn test_column_ordering() {
        let (store, _, items) = board();
        let todo: Vec<Uuid> = store
            .column(ActivityStatus::Todo)
            .iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(todo, vec![items[1].id, items[0].id, items[2].id]);
        assert!(store.column(ActivityStatus::Done).is_empty());
    }

    #[tokio::test]
    async fn test_move_and_rollback() {
        let (store, backend, items) = board();
        let id = items[0].id;

        store.move_to(id, ActivityStatus::InProgress).await.unwrap();
        assert_eq!(store.column(ActivityStatus::InProgress).len(), 1);

        *backend.fail.lock() = true;
        let before = store.get(id).unwrap();
        assert!(store.move_to(id, ActivityStatus::Done).await.is_err());
        assert_eq!(store.get(id).unwrap(), before);
        assert!(store.column(ActivityStatus::Done).is_empty());
        assert!(store.errors().get(STORE_NAME, &id.to_string()).is_some());

        // Moving to the current column does not reach the backend.
        store.move_to(id, ActivityStatus::InProgress).await.unwrap();
        assert_eq!(*backend.calls.lock(), 2);
    }
}
