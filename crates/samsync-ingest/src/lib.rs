//! Workspace-scoped entities and idempotent stores for samsync.
//!
//! Everything the sync pipeline persists flows through the [`SyncStore`]
//! trait. Two backends are provided:
//!
//! - [`SqliteStore`]: local SQLite database with `sqlx` migrations.
//! - [`SupabaseStore`]: PostgREST upserts against a Supabase project.
//!
//! Every write takes an explicit workspace id; no backend relies on an
//! implicit session to scope rows.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod sqlite;
pub mod supabase;

pub use sqlite::SqliteStore;
pub use supabase::SupabaseStore;

/// Errors raised by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A constraint violation the upsert did not resolve.
    #[error("constraint conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store returned {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("invalid store url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation()
                || db_err.is_foreign_key_violation()
                || db_err.is_check_violation()
            {
                return StoreError::Conflict(db_err.message().to_string());
            }
        }
        StoreError::Database(err)
    }
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Connection state of an external messaging identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Connected,
    CredentialsRequired,
    Disconnected,
    Unknown,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Connected => "connected",
            AccountStatus::CredentialsRequired => "credentials_required",
            AccountStatus::Disconnected => "disconnected",
            AccountStatus::Unknown => "unknown",
        }
    }
}

/// One connected messaging identity (e.g. a LinkedIn login) owned by a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub external_id: String,
    pub provider: String,
    pub display_name: Option<String>,
    pub status: AccountStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Archived,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Archived => "archived",
        }
    }
}

/// A thread between the account owner and one external participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub external_id: String,
    pub account_id: String,
    pub provider: String,
    pub participant_name: String,
    pub participant_first_name: String,
    pub participant_last_name: Option<String>,
    pub participant_company: Option<String>,
    pub participant_profile_id: Option<String>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub status: ConversationStatus,
    pub unread_count: i64,
}

impl Conversation {
    /// Stable text key for this conversation inside a workspace.
    pub fn canonical_id(&self, workspace_id: &str) -> String {
        format!("conv:{}:{}:{}", workspace_id, self.provider, self.external_id)
    }
}

/// One item within a conversation.
///
/// `external_id` is always populated: it is either the provider's id or a
/// key synthesized from the conversation, timestamp and body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub external_id: String,
    pub provider_message_id: Option<String>,
    pub id_synthesized: bool,
    pub is_sender: bool,
    pub body: String,
    pub sent_at: Option<DateTime<Utc>>,
    pub sender_external_id: Option<String>,
}

/// A distinct external participant derived from chat attendees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub external_id: String,
    pub provider: String,
    pub first_name: String,
    pub last_name: Option<String>,
    pub full_name: Option<String>,
    pub company: Option<String>,
    pub title: Option<String>,
    pub headline: Option<String>,
    pub profile_url: Option<String>,
    pub picture_url: Option<String>,
}

/// Progress marker for one (workspace, account, sync type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncWatermark {
    pub workspace_id: String,
    pub account_id: String,
    pub sync_type: String,
    /// Start time of the last pass that completed without failures.
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_attempt_at: DateTime<Utc>,
    pub processed: i64,
    pub created: i64,
    pub failed: i64,
    pub last_error: Option<String>,
}

/// Result of a single-row upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upserted {
    pub id: String,
    pub created: bool,
}

/// Row-level outcome of a batch upsert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    /// Failed rows that hit a constraint conflict. Retrying them later
    /// gives the same result; the other failures are transient.
    pub conflicts: usize,
    pub errors: Vec<String>,
}

impl BatchOutcome {
    pub fn record(&mut self, result: StoreResult<bool>, key: &str) {
        match result {
            Ok(true) => self.created += 1,
            Ok(false) => self.updated += 1,
            Err(err) => {
                self.failed += 1;
                if err.is_conflict() {
                    self.conflicts += 1;
                }
                self.errors.push(format!("{}: {}", key, err));
            }
        }
    }
}

/// Row counts for one workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkspaceCounts {
    pub accounts: i64,
    pub conversations: i64,
    pub messages: i64,
    pub contacts: i64,
}

/// Idempotent persistence scoped to a workspace.
///
/// Calling any upsert twice with identical input never produces duplicate
/// rows or an error. Upserts of rows that already exist refresh their
/// mutable fields (message body, conversation and contact details).
/// Account, conversation and contact upserts create the workspace row if
/// it is missing. Batch writes are
/// row-level: one failing row is reported in [`BatchOutcome`] and does not
/// block the others.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Upsert an account, creating the workspace row if needed.
    async fn upsert_account(&self, workspace_id: &str, account: &Account) -> StoreResult<()>;

    /// Upsert a conversation keyed on (workspace, provider, external id).
    async fn upsert_conversation(
        &self,
        workspace_id: &str,
        conversation: &Conversation,
    ) -> StoreResult<Upserted>;

    /// Upsert messages keyed on (conversation id, external id).
    async fn upsert_messages(
        &self,
        workspace_id: &str,
        conversation_id: &str,
        messages: &[Message],
    ) -> StoreResult<BatchOutcome>;

    /// Upsert a contact keyed on (workspace, provider, external id).
    async fn upsert_contact(&self, workspace_id: &str, contact: &Contact) -> StoreResult<Upserted>;

    async fn get_watermark(
        &self,
        workspace_id: &str,
        account_id: &str,
        sync_type: &str,
    ) -> StoreResult<Option<SyncWatermark>>;

    async fn put_watermark(&self, watermark: &SyncWatermark) -> StoreResult<()>;

    async fn list_watermarks(&self, workspace_id: &str) -> StoreResult<Vec<SyncWatermark>>;

    async fn workspace_counts(&self, workspace_id: &str) -> StoreResult<WorkspaceCounts>;
}

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
pub fn format_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let early = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 11, 2, 3, 4, 5).unwrap();
        assert!(format_ts(&early) < format_ts(&late));
        assert_eq!(parse_ts(&format_ts(&early)), Some(early));
        assert_eq!(parse_ts("not a date"), None);
    }

    #[test]
    fn test_batch_outcome_record() {
        let mut outcome = BatchOutcome::default();
        outcome.record(Ok(true), "a");
        outcome.record(Ok(false), "b");
        outcome.record(Err(StoreError::Conflict("dup".into())), "c");
        outcome.record(Err(StoreError::Remote { status: 503, body: "busy".into() }), "d");
        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.failed, 2);
        assert_eq!(outcome.conflicts, 1);
        assert!(outcome.errors[0].starts_with("c:"));
        assert!(outcome.errors[1].starts_with("d:"));
    }
}
