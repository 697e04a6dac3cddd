//! In-process provider fake for orchestrator and scheduler tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{Result, SyncError};
use crate::providers::{Page, ProviderClient};

#[derive(Default)]
pub struct FakeProvider {
    pub accounts: Vec<Value>,
    pub chats: Vec<Value>,
    pub messages: HashMap<String, Vec<Value>>,
    pub attendees: HashMap<String, Vec<Value>>,
    /// Chats whose message listing fails with a transient error.
    pub failing_chats: HashSet<String>,
    /// Number of upcoming `list_attendees` calls that fail transiently.
    pub attendee_failures: AtomicUsize,
    /// Conversation page cursor whose listing fails transiently.
    pub failing_cursor: Option<String>,
    pub auth_failure: bool,
    /// Delay applied to `list_accounts`, to hold a run open.
    pub delay: Option<Duration>,
    pub conversation_pages: AtomicUsize,
    pub message_calls: AtomicUsize,
}

impl FakeProvider {
    /// Two accounts, `acc_a` holding one chat of three messages (one without
    /// an id) and a self-only attendee list.
    pub fn scenario() -> Self {
        let mut fake = FakeProvider {
            accounts: vec![linkedin_account("acc_a"), linkedin_account("acc_b")],
            chats: vec![chat("chat_1", "Ada Lovelace", "2024-03-01T12:05:00Z")],
            ..Default::default()
        };
        fake.messages.insert(
            "chat_1".into(),
            vec![
                json!({"id": "msg_2", "text": "Second", "timestamp": "2024-03-01T12:02:00Z", "is_sender": 1}),
                json!({"id": "msg_1", "text": "First", "timestamp": "2024-03-01T12:01:00Z", "is_sender": 0}),
                json!({"text": "No id here", "timestamp": "2024-03-01T12:03:00Z", "is_sender": 0}),
            ],
        );
        fake.attendees.insert(
            "chat_1".into(),
            vec![json!({"id": "att_self", "name": "Sam Seller", "is_self": 1})],
        );
        fake
    }

    pub fn with_chat(mut self, id: &str, name: &str, timestamp: &str, messages: Vec<Value>) -> Self {
        self.chats.push(chat(id, name, timestamp));
        self.messages.insert(id.to_string(), messages);
        self
    }
}

pub fn linkedin_account(id: &str) -> Value {
    json!({
        "id": id,
        "name": format!("Account {}", id),
        "type": "LINKEDIN",
        "sources": [{"id": format!("{}_MESSAGING", id), "status": "OK"}]
    })
}

pub fn chat(id: &str, name: &str, timestamp: &str) -> Value {
    json!({
        "id": id,
        "account_id": "acc_a",
        "name": name,
        "timestamp": timestamp,
        "unread_count": 0,
        "archived": 0
    })
}

#[async_trait]
impl ProviderClient for FakeProvider {
    fn name(&self) -> &'static str {
        "linkedin"
    }

    async fn list_accounts(&self) -> Result<Vec<Value>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.auth_failure {
            return Err(SyncError::Auth("401: invalid api key".into()));
        }
        Ok(self.accounts.clone())
    }

    async fn list_conversations(
        &self,
        _account_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page> {
        self.conversation_pages.fetch_add(1, Ordering::SeqCst);
        if cursor.is_some() && cursor == self.failing_cursor.as_deref() {
            return Err(SyncError::Unavailable("503 after retries".into()));
        }
        let start = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        let end = (start + limit.max(1)).min(self.chats.len());
        let items = self.chats.get(start..end).map(<[Value]>::to_vec).unwrap_or_default();
        let cursor = (end < self.chats.len()).then(|| end.to_string());
        Ok(Page { items, cursor })
    }

    async fn list_messages(
        &self,
        _account_id: &str,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Value>> {
        self.message_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_chats.contains(conversation_id) {
            return Err(SyncError::Unavailable("503: upstream timeout".into()));
        }
        let mut items = self.messages.get(conversation_id).cloned().unwrap_or_default();
        items.truncate(limit);
        Ok(items)
    }

    async fn list_attendees(&self, conversation_id: &str) -> Result<Vec<Value>> {
        let pending = self
            .attendee_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            return Err(SyncError::Unavailable("502: bad gateway".into()));
        }
        Ok(self.attendees.get(conversation_id).cloned().unwrap_or_default())
    }
}
