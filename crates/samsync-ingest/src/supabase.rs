//! Supabase (PostgREST) [`SyncStore`].
//!
//! Rows are written through `POST /rest/v1/{table}?on_conflict=...` with a
//! `Prefer` resolution header. Row-level security in the project scopes
//! reads and writes; every row still carries an explicit `workspace_id`.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};
use url::Url;

use crate::{
    format_ts, parse_ts, Account, BatchOutcome, Contact, Conversation, Message, StoreError,
    StoreResult, SyncStore, SyncWatermark, Upserted, WorkspaceCounts,
};

const MERGE: &str = "resolution=merge-duplicates,return=minimal";
const MERGE_RETURNING: &str = "resolution=merge-duplicates,return=representation";
const INSERT_ONLY: &str = "resolution=ignore-duplicates,return=representation";

#[derive(Clone)]
pub struct SupabaseStore {
    rest_url: Url,
    service_key: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct IdRow {
    id: Value,
}

#[derive(Debug, Deserialize)]
struct WatermarkRecord {
    workspace_id: String,
    account_id: String,
    sync_type: String,
    last_synced_at: Option<String>,
    last_attempt_at: String,
    #[serde(default)]
    processed: i64,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    failed: i64,
    last_error: Option<String>,
}

impl From<WatermarkRecord> for SyncWatermark {
    fn from(record: WatermarkRecord) -> Self {
        SyncWatermark {
            workspace_id: record.workspace_id,
            account_id: record.account_id,
            sync_type: record.sync_type,
            last_synced_at: record.last_synced_at.as_deref().and_then(parse_ts),
            last_attempt_at: parse_ts(&record.last_attempt_at).unwrap_or_else(Utc::now),
            processed: record.processed,
            created: record.created,
            failed: record.failed,
            last_error: record.last_error,
        }
    }
}

impl SupabaseStore {
    /// `project_url` is the project root, e.g. `https://xyz.supabase.co`.
    pub fn new(project_url: &str, service_key: String, http: Client) -> StoreResult<Self> {
        let mut base = Url::parse(project_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let rest_url = base.join("rest/v1/")?;
        Ok(Self {
            rest_url,
            service_key,
            http,
        })
    }

    fn table(&self, table: &str) -> StoreResult<Url> {
        Ok(self.rest_url.join(table)?)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn post(
        &self,
        table: &str,
        on_conflict: &str,
        prefer: &str,
        body: &Value,
    ) -> StoreResult<Response> {
        let url = self.table(table)?;
        let response = self
            .authed(self.http.post(url))
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", prefer)
            .json(body)
            .send()
            .await?;
        check(response).await
    }

    async fn patch(&self, table: &str, filters: &[(&str, String)], body: &Value) -> StoreResult<()> {
        let url = self.table(table)?;
        let response = self
            .authed(self.http.patch(url))
            .query(filters)
            .header("Prefer", "return=minimal")
            .json(body)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn select(&self, table: &str, filters: &[(&str, String)]) -> StoreResult<Vec<Value>> {
        let url = self.table(table)?;
        let response = self
            .authed(self.http.get(url))
            .query(filters)
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    async fn count(&self, table: &str, workspace_id: &str) -> StoreResult<i64> {
        let url = self.table(table)?;
        let response = self
            .authed(self.http.get(url))
            .query(&[
                ("select", "workspace_id".to_string()),
                ("workspace_id", format!("eq.{}", workspace_id)),
                ("limit", "1".to_string()),
            ])
            .header("Prefer", "count=exact")
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .unwrap_or(0))
    }

    async fn ensure_workspace(&self, workspace_id: &str) -> StoreResult<()> {
        let row = json!({ "id": workspace_id, "created_at": format_ts(&Utc::now()) });
        self.post(
            "workspaces",
            "id",
            "resolution=ignore-duplicates,return=minimal",
            &row,
        )
        .await?;
        Ok(())
    }

    async fn insert_message(
        &self,
        workspace_id: &str,
        conversation_id: &str,
        message: &Message,
    ) -> StoreResult<bool> {
        let row = json!({
            "workspace_id": workspace_id,
            "conversation_id": conversation_id,
            "external_id": message.external_id,
            "provider_message_id": message.provider_message_id,
            "id_synthesized": message.id_synthesized,
            "is_sender": message.is_sender,
            "body": message.body,
            "sent_at": message.sent_at.as_ref().map(format_ts),
            "sender_external_id": message.sender_external_id,
        });
        let response = self
            .post("messages", "conversation_id,external_id", INSERT_ONLY, &row)
            .await?;
        let inserted: Vec<Value> = response.json().await?;
        if !inserted.is_empty() {
            return Ok(true);
        }

        // Existing row: refresh the body, keep known timestamp and sender.
        let mut changes = json!({ "body": message.body });
        if let Some(sent_at) = &message.sent_at {
            changes["sent_at"] = json!(format_ts(sent_at));
        }
        if let Some(sender) = &message.sender_external_id {
            changes["sender_external_id"] = json!(sender);
        }
        self.patch(
            "messages",
            &[
                ("workspace_id", format!("eq.{}", workspace_id)),
                ("conversation_id", format!("eq.{}", conversation_id)),
                ("external_id", format!("eq.{}", message.external_id)),
            ],
            &changes,
        )
        .await?;
        Ok(false)
    }
}

async fn check(response: Response) -> StoreResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status.as_u16() == 409 {
        return Err(StoreError::Conflict(body));
    }
    Err(StoreError::Remote {
        status: status.as_u16(),
        body,
    })
}

/// `0-0/42` or `*/0` -> total row count.
fn parse_content_range_total(value: &str) -> Option<i64> {
    value.rsplit('/').next()?.parse().ok()
}

fn id_to_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl SyncStore for SupabaseStore {
    #[instrument(skip(self, account), fields(account = %account.external_id))]
    async fn upsert_account(&self, workspace_id: &str, account: &Account) -> StoreResult<()> {
        self.ensure_workspace(workspace_id).await?;
        let row = json!({
            "workspace_id": workspace_id,
            "provider": account.provider,
            "external_id": account.external_id,
            "display_name": account.display_name,
            "status": account.status.as_str(),
            "updated_at": format_ts(&Utc::now()),
        });
        self.post("accounts", "workspace_id,provider,external_id", MERGE, &row)
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
        let existing = self
            .select(
                "conversations",
                &[
                    ("select", "id".to_string()),
                    ("workspace_id", format!("eq.{}", workspace_id)),
                    ("provider", format!("eq.{}", conversation.provider)),
                    ("external_id", format!("eq.{}", conversation.external_id)),
                ],
            )
            .await?;

        let row = json!({
            "workspace_id": workspace_id,
            "provider": conversation.provider,
            "external_id": conversation.external_id,
            "account_id": conversation.account_id,
            "participant_name": conversation.participant_name,
            "participant_first_name": conversation.participant_first_name,
            "participant_last_name": conversation.participant_last_name,
            "participant_company": conversation.participant_company,
            "participant_profile_id": conversation.participant_profile_id,
            "last_activity_at": conversation.last_activity_at.as_ref().map(format_ts),
            "status": conversation.status.as_str(),
            "unread_count": conversation.unread_count,
            "updated_at": format_ts(&Utc::now()),
        });
        let response = self
            .post(
                "conversations",
                "workspace_id,provider,external_id",
                MERGE_RETURNING,
                &row,
            )
            .await?;
        let rows: Vec<IdRow> = response.json().await?;
        let id = rows
            .first()
            .map(|r| id_to_string(&r.id))
            .ok_or_else(|| StoreError::Remote {
                status: 200,
                body: "conversation upsert returned no row".to_string(),
            })?;

        Ok(Upserted {
            id,
            created: existing.is_empty(),
        })
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
            let result = self
                .insert_message(workspace_id, conversation_id, message)
                .await;
            outcome.record(result, &message.external_id);
        }
        debug!(
            "messages upserted into {}: {} created, {} existing, {} failed",
            conversation_id, outcome.created, outcome.updated, outcome.failed
        );
        Ok(outcome)
    }

    #[instrument(skip(self, contact), fields(contact = %contact.external_id))]
    async fn upsert_contact(&self, workspace_id: &str, contact: &Contact) -> StoreResult<Upserted> {
        self.ensure_workspace(workspace_id).await?;
        let row = json!({
            "workspace_id": workspace_id,
            "provider": contact.provider,
            "external_id": contact.external_id,
            "first_name": contact.first_name,
            "last_name": contact.last_name,
            "full_name": contact.full_name,
            "company": contact.company,
            "title": contact.title,
            "headline": contact.headline,
            "profile_url": contact.profile_url,
            "picture_url": contact.picture_url,
            "updated_at": format_ts(&Utc::now()),
        });
        let on_conflict = "workspace_id,provider,external_id";

        let inserted: Vec<IdRow> = self
            .post("contacts", on_conflict, INSERT_ONLY, &row)
            .await?
            .json()
            .await?;
        if let Some(first) = inserted.first() {
            return Ok(Upserted {
                id: id_to_string(&first.id),
                created: true,
            });
        }

        // Already present: refresh the mutable profile fields.
        let merged: Vec<IdRow> = self
            .post("contacts", on_conflict, MERGE_RETURNING, &row)
            .await?
            .json()
            .await?;
        let id = merged
            .first()
            .map(|r| id_to_string(&r.id))
            .unwrap_or_else(|| contact.external_id.clone());
        Ok(Upserted { id, created: false })
    }

    async fn get_watermark(
        &self,
        workspace_id: &str,
        account_id: &str,
        sync_type: &str,
    ) -> StoreResult<Option<SyncWatermark>> {
        let rows = self
            .select(
                "sync_watermarks",
                &[
                    ("select", "*".to_string()),
                    ("workspace_id", format!("eq.{}", workspace_id)),
                    ("account_id", format!("eq.{}", account_id)),
                    ("sync_type", format!("eq.{}", sync_type)),
                ],
            )
            .await?;

        match rows.into_iter().next() {
            Some(row) => {
                let record: WatermarkRecord = serde_json::from_value(row)?;
                Ok(Some(record.into()))
            }
            None => Ok(None),
        }
    }

    async fn put_watermark(&self, watermark: &SyncWatermark) -> StoreResult<()> {
        let row = json!({
            "workspace_id": watermark.workspace_id,
            "account_id": watermark.account_id,
            "sync_type": watermark.sync_type,
            "last_synced_at": watermark.last_synced_at.as_ref().map(format_ts),
            "last_attempt_at": format_ts(&watermark.last_attempt_at),
            "processed": watermark.processed,
            "created": watermark.created,
            "failed": watermark.failed,
            "last_error": watermark.last_error,
        });
        self.post(
            "sync_watermarks",
            "workspace_id,account_id,sync_type",
            MERGE,
            &row,
        )
        .await?;
        Ok(())
    }

    async fn list_watermarks(&self, workspace_id: &str) -> StoreResult<Vec<SyncWatermark>> {
        let rows = self
            .select(
                "sync_watermarks",
                &[
                    ("select", "*".to_string()),
                    ("workspace_id", format!("eq.{}", workspace_id)),
                    ("order", "account_id.asc,sync_type.asc".to_string()),
                ],
            )
            .await?;

        rows.into_iter()
            .map(|row| {
                let record: WatermarkRecord = serde_json::from_value(row)?;
                Ok(record.into())
            })
            .collect()
    }

    async fn workspace_counts(&self, workspace_id: &str) -> StoreResult<WorkspaceCounts> {
        Ok(WorkspaceCounts {
            accounts: self.count("accounts", workspace_id).await?,
            conversations: self.count("conversations", workspace_id).await?,
            messages: self.count("messages", workspace_id).await?,
            contacts: self.count("contacts", workspace_id).await?,
        })
    }
}
