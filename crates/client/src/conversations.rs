//! Conversation threads with leads. Outgoing messages appear in the thread
//! immediately and disappear again if the send fails.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use outreach_core::{OutreachError, OutreachResult};

use crate::errors::ErrorChannel;
use crate::optimistic::OptimisticStore;

pub const STORE_NAME: &str = "conversations";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub body: String,
    pub from_advisor: bool,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub lead_id: String,
    pub messages: Vec<Message>,
    pub unread: u32,
}

impl Conversation {
    pub fn new(lead_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead_id: lead_id.to_string(),
            messages: Vec::new(),
            unread: 0,
        }
    }
}

#[async_trait]
pub trait ConversationBackend: Send + Sync {
    async fn send_message(&self, conversation_id: Uuid, message: &Message) -> OutreachResult<()>;
    async fn mark_read(&self, conversation_id: Uuid) -> OutreachResult<()>;
}

pub struct ConversationStore {
    store: OptimisticStore<Uuid, Conversation>,
    remote: Arc<dyn ConversationBackend>,
}

impl ConversationStore {
    pub fn new(remote: Arc<dyn ConversationBackend>, errors: Arc<ErrorChannel>) -> Self {
        Self {
            store: OptimisticStore::new(STORE_NAME, errors),
            remote,
        }
    }

    pub fn load(&self, conversation: Conversation) {
        self.store.upsert(conversation.id, conversation);
    }

    pub fn get(&self, id: Uuid) -> Option<Conversation> {
        self.store.get(&id)
    }

    /// Appends an inbound message from the lead.
    pub fn receive(&self, id: Uuid, body: &str) -> OutreachResult<()> {
        let message = Message {
            id: Uuid::new_v4(),
            body: body.to_string(),
            from_advisor: false,
            sent_at: Utc::now(),
        };
        let found = self.store.update_local(&id, |c| {
            c.messages.push(message);
            c.unread += 1;
        });
        if found {
            Ok(())
        } else {
            Err(OutreachError::not_found(STORE_NAME, id))
        }
    }

    pub async fn send_message(&self, id: Uuid, body: &str) -> OutreachResult<Message> {
        if body.trim().is_empty() {
            return Err(OutreachError::InvalidInput("message body is empty".into()));
        }
        let message = Message {
            id: Uuid::new_v4(),
            body: body.to_string(),
            from_advisor: true,
            sent_at: Utc::now(),
        };

        let remote = self.remote.clone();
        let local = message.clone();
        let outgoing = message.clone();
        self.store
            .apply(
                &id,
                move |c| c.messages.push(local),
                |_| async move { remote.send_message(id, &outgoing).await },
            )
            .await?;
        debug!(conversation_id = %id, message_id = %message.id, "Message sent");
        Ok(message)
    }

    pub async fn mark_read(&self, id: Uuid) -> OutreachResult<()> {
        let remote = self.remote.clone();
        self.store
            .apply(&id, |c| c.unread = 0, |_| async move { remote.mark_read(id).await })
            .await
    }

    pub fn errors(&self) -> &Arc<ErrorChannel> {
        self.store.errors()
    }
}
