//! SQLite-backed [`SyncStore`].
//!
//! Used for local runs and tests. The schema is owned by the ordered
//! migrations in `migrations/`, applied at open.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use crate::{
    format_ts, parse_ts, Account, BatchOutcome, Contact, Conversation, Message, StoreResult,
    SyncStore, SyncWatermark, Upserted, WorkspaceCounts,
};

type WatermarkRow = (
    String,
    String,
    String,
    Option<String>,
    String,
    i64,
    i64,
    i64,
    Option<String>,
);

/// A stored message row, as read back for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub external_id: String,
    pub id_synthesized: bool,
    pub is_sender: bool,
    pub body: String,
    pub sent_at: Option<String>,
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database file and apply migrations.
    pub async fn new(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::from_str("sqlite:")?
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and apply migrations.
    pub async fn from_pool(pool: SqlitePool) -> StoreResult<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database on a single connection.
    pub async fn in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[instrument(skip_all)]
    async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn ensure_workspace(&self, workspace_id: &str) -> StoreResult<()> {
        sqlx::query("INSERT INTO workspaces (id, created_at) VALUES (?1, ?2) ON CONFLICT(id) DO NOTHING")
            .bind(workspace_id)
            .bind(format_ts(&Utc::now()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_message(
        &self,
        workspace_id: &str,
        conversation_id: &str,
        message: &Message,
    ) -> StoreResult<bool> {
        let sent_at = message.sent_at.as_ref().map(format_ts);
        let inserted: Option<i64> = sqlx::query_scalar(
            "INSERT INTO messages (workspace_id, conversation_id, external_id, provider_message_id, \
                id_synthesized, is_sender, body, sent_at, sender_external_id, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
             ON CONFLICT(conversation_id, external_id) DO NOTHING \
             RETURNING id",
        )
        .bind(workspace_id)
        .bind(conversation_id)
        .bind(&message.external_id)
        .bind(&message.provider_message_id)
        .bind(message.id_synthesized)
        .bind(message.is_sender)
        .bind(&message.body)
        .bind(&sent_at)
        .bind(&message.sender_external_id)
        .bind(format_ts(&Utc::now()))
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            return Ok(true);
        }

        sqlx::query(
            "UPDATE messages SET \
                body = ?1, \
                sent_at = COALESCE(?2, sent_at), \
                sender_external_id = COALESCE(?3, sender_external_id) \
             WHERE conversation_id = ?4 AND external_id = ?5 AND workspace_id = ?6",
        )
        .bind(&message.body)
        .bind(&sent_at)
        .bind(&message.sender_external_id)
        .bind(conversation_id)
        .bind(&message.external_id)
        .bind(workspace_id)
        .execute(&self.pool)
        .await?;
        Ok(false)
    }

    /// Messages of one conversation in timestamp order.
    pub async fn messages_for_conversation(
        &self,
        workspace_id: &str,
        conversation_id: &str,
    ) -> StoreResult<Vec<StoredMessage>> {
        let rows = sqlx::query_as::<_, (String, bool, bool, String, Option<String>)>(
            "SELECT external_id, id_synthesized, is_sender, body, sent_at FROM messages \
             WHERE workspace_id = ?1 AND conversation_id = ?2 \
             ORDER BY sent_at ASC, id ASC",
        )
        .bind(workspace_id)
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(external_id, id_synthesized, is_sender, body, sent_at)| StoredMessage {
                external_id,
                id_synthesized,
                is_sender,
                body,
                sent_at,
            })
            .collect())
    }
}

fn watermark_from_row(row: WatermarkRow) -> SyncWatermark {
    let (
        workspace_id,
        account_id,
        sync_type,
        last_synced_at,
        last_attempt_at,
        processed,
        created,
        failed,
        last_error,
    ) = row;
    SyncWatermark {
        workspace_id,
        account_id,
        sync_type,
        last_synced_at: last_synced_at.as_deref().and_then(parse_ts),
        last_attempt_at: parse_ts(&last_attempt_at).unwrap_or_else(Utc::now),
        processed,
        created,
        failed,
        last_error,
    }
}

#[async_trait]
impl SyncStore for SqliteStore {
    #[instrument(skip(self, account), fields(account = %account.external_id))]
    async fn upsert_account(&self, workspace_id: &str, account: &Account) -> StoreResult<()> {
        self.ensure_workspace(workspace_id).await?;
        sqlx::query(
            "INSERT INTO accounts (workspace_id, provider, external_id, display_name, status, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(workspace_id, provider, external_id) DO UPDATE SET \
                display_name = COALESCE(excluded.display_name, accounts.display_name), \
                status = excluded.status, \
                updated_at = excluded.updated_at",
        )
        .bind(workspace_id)
        .bind(&account.provider)
        .bind(&account.external_id)
        .bind(&account.display_name)
        .bind(account.status.as_str())
        .bind(format_ts(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, conversation), fields(conversation = %conversation.external_id))]
    async fn upsert_conversation(
        &self,
        workspace_id: &str,
        conversation: &Conversation,
    ) -> StoreResult<Upserted> {
        self.ensure_workspace(workspace_id).await?;
        let id = conversation.canonical_id(workspace_id);
        let now = format_ts(&Utc::now());
        let last_activity = conversation.last_activity_at.as_ref().map(format_ts);

        let inserted: Option<String> = sqlx::query_scalar(
            "INSERT INTO conversations (id, workspace_id, provider, external_id, account_id, \
                participant_name, participant_first_name, participant_last_name, participant_company, \
                participant_profile_id, last_activity_at, status, unread_count, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14) \
             ON CONFLICT(workspace_id, provider, external_id) DO NOTHING \
             RETURNING id",
        )
        .bind(&id)
        .bind(workspace_id)
        .bind(&conversation.provider)
        .bind(&conversation.external_id)
        .bind(&conversation.account_id)
        .bind(&conversation.participant_name)
        .bind(&conversation.participant_first_name)
        .bind(&conversation.participant_last_name)
        .bind(&conversation.participant_company)
        .bind(&conversation.participant_profile_id)
        .bind(&last_activity)
        .bind(conversation.status.as_str())
        .bind(conversation.unread_count)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = inserted {
            return Ok(Upserted { id, created: true });
        }

        let id: String = sqlx::query_scalar(
            "UPDATE conversations SET \
                participant_name = ?1, \
                participant_first_name = ?2, \
                participant_last_name = ?3, \
                participant_company = COALESCE(?4, participant_company), \
                participant_profile_id = COALESCE(?5, participant_profile_id), \
                last_activity_at = COALESCE(?6, last_activity_at), \
                status = ?7, \
                unread_count = ?8, \
                updated_at = ?9 \
             WHERE workspace_id = ?10 AND provider = ?11 AND external_id = ?12 \
             RETURNING id",
        )
        .bind(&conversation.participant_name)
        .bind(&conversation.participant_first_name)
        .bind(&conversation.participant_last_name)
        .bind(&conversation.participant_company)
        .bind(&conversation.participant_profile_id)
        .bind(&last_activity)
        .bind(conversation.status.as_str())
        .bind(conversation.unread_count)
        .bind(&now)
        .bind(workspace_id)
        .bind(&conversation.provider)
        .bind(&conversation.external_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Upserted { id, created: false })
    }

    #[instrument(skip(self, messages), fields(count = messages.len()))]
    async fn upsert_messages(
        &self,
        workspace_id: &str,
        conversation_id: &str,
        messages: &[Message],
    ) -> StoreResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for message in messages {
            let result = self.upsert_message(workspace_id, conversation_id, message).await;
            outcome.record(result, &message.external_id);
        }
        debug!(
            "messages upserted into {}: {} created, {} updated, {} failed",
            conversation_id, outcome.created, outcome.updated, outcome.failed
        );
        Ok(outcome)
    }

    #[instrument(skip(self, contact), fields(contact = %contact.external_id))]
    async fn upsert_contact(&self, workspace_id: &str, contact: &Contact) -> StoreResult<Upserted> {
        self.ensure_workspace(workspace_id).await?;
        let now = format_ts(&Utc::now());

        let inserted: Option<i64> = sqlx::query_scalar(
            "INSERT INTO contacts (workspace_id, provider, external_id, first_name, last_name, full_name, \
                company, title, headline, profile_url, picture_url, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12) \
             ON CONFLICT(workspace_id, provider, external_id) DO NOTHING \
             RETURNING id",
        )
        .bind(workspace_id)
        .bind(&contact.provider)
        .bind(&contact.external_id)
        .bind(&contact.first_name)
        .bind(&contact.last_name)
        .bind(&contact.full_name)
        .bind(&contact.company)
        .bind(&contact.title)
        .bind(&contact.headline)
        .bind(&contact.profile_url)
        .bind(&contact.picture_url)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = inserted {
            return Ok(Upserted {
                id: id.to_string(),
                created: true,
            });
        }

        let id: i64 = sqlx::query_scalar(
            "UPDATE contacts SET \
                first_name = ?1, \
                last_name = ?2, \
                full_name = COALESCE(?3, full_name), \
                company = COALESCE(?4, company), \
                title = COALESCE(?5, title), \
                headline = COALESCE(?6, headline), \
                profile_url = COALESCE(?7, profile_url), \
                picture_url = COALESCE(?8, picture_url), \
                updated_at = ?9 \
             WHERE workspace_id = ?10 AND provider = ?11 AND external_id = ?12 \
             RETURNING id",
        )
        .bind(&contact.first_name)
        .bind(&contact.last_name)
        .bind(&contact.full_name)
        .bind(&contact.company)
        .bind(&contact.title)
        .bind(&contact.headline)
        .bind(&contact.profile_url)
        .bind(&contact.picture_url)
        .bind(&now)
        .bind(workspace_id)
        .bind(&contact.provider)
        .bind(&contact.external_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Upserted {
            id: id.to_string(),
            created: false,
        })
    }

    async fn get_watermark(
        &self,
        workspace_id: &str,
        account_id: &str,
        sync_type: &str,
    ) -> StoreResult<Option<SyncWatermark>> {
        let row = sqlx::query_as::<_, WatermarkRow>(
            "SELECT workspace_id, account_id, sync_type, last_synced_at, last_attempt_at, \
                processed, created, failed, last_error \
             FROM sync_watermarks WHERE workspace_id = ?1 AND account_id = ?2 AND sync_type = ?3",
        )
        .bind(workspace_id)
        .bind(account_id)
        .bind(sync_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(watermark_from_row))
    }

    async fn put_watermark(&self, watermark: &SyncWatermark) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO sync_watermarks (workspace_id, account_id, sync_type, last_synced_at, \
                last_attempt_at, processed, created, failed, last_error) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(workspace_id, account_id, sync_type) DO UPDATE SET \
                last_synced_at = excluded.last_synced_at, \
                last_attempt_at = excluded.last_attempt_at, \
                processed = excluded.processed, \
                created = excluded.created, \
                failed = excluded.failed, \
                last_error = excluded.last_error",
        )
        .bind(&watermark.workspace_id)
        .bind(&watermark.account_id)
        .bind(&watermark.sync_type)
        .bind(watermark.last_synced_at.as_ref().map(format_ts))
        .bind(format_ts(&watermark.last_attempt_at))
        .bind(watermark.processed)
        .bind(watermark.created)
        .bind(watermark.failed)
        .bind(&watermark.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_watermarks(&self, workspace_id: &str) -> StoreResult<Vec<SyncWatermark>> {
        let rows = sqlx::query_as::<_, WatermarkRow>(
            "SELECT workspace_id, account_id, sync_type, last_synced_at, last_attempt_at, \
                processed, created, failed, last_error \
             FROM sync_watermarks WHERE workspace_id = ?1 ORDER BY account_id, sync_type",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(watermark_from_row).collect())
    }

    async fn workspace_counts(&self, workspace_id: &str) -> StoreResult<WorkspaceCounts> {
        let (accounts, conversations, messages, contacts) =
            sqlx::query_as::<_, (i64, i64, i64, i64)>(
                "SELECT \
                    (SELECT COUNT(*) FROM accounts WHERE workspace_id = ?1), \
                    (SELECT COUNT(*) FROM conversations WHERE workspace_id = ?1), \
                    (SELECT COUNT(*) FROM messages WHERE workspace_id = ?1), \
                    (SELECT COUNT(*) FROM contacts WHERE workspace_id = ?1)",
            )
            .bind(workspace_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(WorkspaceCounts {
            accounts,
            conversations,
            messages,
            contacts,
        })
    }
}
