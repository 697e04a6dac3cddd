//! Provider access for the sync pipeline.
//!
//! This module provides:
//! - `ProviderClient` trait the orchestrator pulls data through
//! - `UnipileClient`, the REST implementation for LinkedIn via Unipile
//! - `RetryPolicy` / `Throttle` shared by every outgoing request
//!
//! Clients return raw provider JSON. Turning an item into an entity is the
//! mapper's job, so one malformed item never fails a whole page.

pub mod retry;
mod unipile;

pub use retry::{with_retry, RetryPolicy, Throttle};
pub use unipile::{UnipileClient, UnipileOptions};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<Value>,
    /// Opaque cursor for the next page. `None` when the listing is exhausted.
    pub cursor: Option<String>,
}

impl Page {
    pub fn is_last(&self) -> bool {
        self.items.is_empty() || self.cursor.is_none()
    }
}

/// Read-only access to a messaging provider.
///
/// Every call is independently retryable and has no side effects at the
/// provider.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Provider identifier stored on every row (e.g. "linkedin").
    fn name(&self) -> &'static str;

    async fn list_accounts(&self) -> Result<Vec<Value>>;

    /// List chats for an account. The caller drives pagination until an
    /// empty page or a missing cursor.
    async fn list_conversations(
        &self,
        account_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page>;

    /// List messages of a chat. Order is provider dependent.
    async fn list_messages(
        &self,
        account_id: &str,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Value>>;

    /// Chat attendees, possibly including the account owner (`is_self`).
    async fn list_attendees(&self, conversation_id: &str) -> Result<Vec<Value>>;
}
