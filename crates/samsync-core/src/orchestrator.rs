//! One sync pass for a (workspace, account) pair.
//!
//! A pass walks `ListingAccounts -> ListingConversations ->
//! ProcessingConversation -> Writing -> Idle`. At most one pass runs per
//! pair; errors local to a conversation or a record are counted and the
//! pass moves on, while credential failures end it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use samsync_ingest::{Account, Contact, Conversation, Message, SyncStore, SyncWatermark};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SyncError};
use crate::mapper;
use crate::progress::{emit_error, emit_progress, emit_result};
use crate::providers::ProviderClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    Incremental,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
        }
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(SyncMode::Full),
            "incremental" => Ok(SyncMode::Incremental),
            other => Err(format!("unknown sync mode `{}` (expected full or incremental)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncScope {
    Messages,
    Contacts,
    Both,
}

impl SyncScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncScope::Messages => "messages",
            SyncScope::Contacts => "contacts",
            SyncScope::Both => "both",
        }
    }

    pub fn includes_messages(&self) -> bool {
        matches!(self, SyncScope::Messages | SyncScope::Both)
    }

    pub fn includes_contacts(&self) -> bool {
        matches!(self, SyncScope::Contacts | SyncScope::Both)
    }
}

impl FromStr for SyncScope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "messages" => Ok(SyncScope::Messages),
            "contacts" => Ok(SyncScope::Contacts),
            "both" => Ok(SyncScope::Both),
            other => Err(format!(
                "unknown sync scope `{}` (expected messages, contacts or both)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub workspace_id: String,
    pub account_id: String,
    pub mode: SyncMode,
    pub scope: SyncScope,
    /// Fetch and map only; nothing is written.
    pub preview: bool,
    /// Emit `SAMSYNC_PROGRESS` lines while running.
    pub report_progress: bool,
}

impl SyncRequest {
    pub fn new(workspace_id: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            account_id: account_id.into(),
            mode: SyncMode::Incremental,
            scope: SyncScope::Both,
            preview: false,
            report_progress: false,
        }
    }

    pub fn mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn scope(mut self, scope: SyncScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn preview(mut self, preview: bool) -> Self {
        self.preview = preview;
        self
    }
}

/// Counts for one pass.
///
/// `processed` counts conversations handled without error; `created` counts
/// newly inserted message and contact rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub processed: usize,
    pub created: usize,
    pub failed: usize,
    pub messages_created: usize,
    pub contacts_created: usize,
    /// Records that would have been written in preview mode.
    pub previewed: usize,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncResult {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            processed: 0,
            created: 0,
            failed: 0,
            messages_created: 0,
            contacts_created: 0,
            previewed: 0,
            cancelled: false,
            started_at,
            finished_at: started_at,
        }
    }
}

/// Caps applied to a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    pub page_size: usize,
    pub message_limit: usize,
    pub max_conversations: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            page_size: 50,
            message_limit: 100,
            max_conversations: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    ListingAccounts,
    ListingConversations,
    ProcessingConversation,
    Writing,
    Idle,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::ListingAccounts => "listing_accounts",
            Phase::ListingConversations => "listing_conversations",
            Phase::ProcessingConversation => "processing_conversation",
            Phase::Writing => "writing",
            Phase::Idle => "idle",
        };
        f.write_str(name)
    }
}

/// Watermarks are stored at millisecond precision.
fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

type RunKey = (String, String);
type RunTable = Mutex<HashMap<RunKey, Arc<AtomicBool>>>;

/// Removes the pair from the run table on every exit path.
struct RunGuard<'a> {
    table: &'a RunTable,
    key: RunKey,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.remove(&self.key);
    }
}

/// Mutable state of a pass in flight.
struct Pass<'a> {
    request: &'a SyncRequest,
    since: Option<DateTime<Utc>>,
    cancel: &'a AtomicBool,
    result: SyncResult,
    /// Failures a later pass must retry. Any of them holds the watermark.
    incomplete: usize,
    last_error: Option<String>,
}

impl Pass<'_> {
    fn record_failure(&mut self, context: &str, err: &SyncError) {
        warn!("{}: {}", context, err);
        self.result.failed += 1;
        if !err.is_record_level() {
            self.incomplete += 1;
        }
        self.last_error = Some(format!("{}: {}", context, err));
    }

    fn cancelled(&mut self) -> bool {
        if self.cancel.load(Ordering::SeqCst) {
            self.result.cancelled = true;
        }
        self.result.cancelled
    }
}

pub struct SyncOrchestrator {
    provider: Arc<dyn ProviderClient>,
    store: Arc<dyn SyncStore>,
    options: SyncOptions,
    running: RunTable,
}

impl SyncOrchestrator {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        store: Arc<dyn SyncStore>,
        options: SyncOptions,
    ) -> Self {
        Self {
            provider,
            store,
            options,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn provider(&self) -> &Arc<dyn ProviderClient> {
        &self.provider
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    pub fn is_running(&self, workspace_id: &str, account_id: &str) -> bool {
        let table = self.running.lock().unwrap_or_else(|e| e.into_inner());
        table.contains_key(&(workspace_id.to_string(), account_id.to_string()))
    }

    /// Ask a running pass to stop before its next conversation.
    ///
    /// Returns false when no pass is running for the pair.
    pub fn cancel(&self, workspace_id: &str, account_id: &str) -> bool {
        let table = self.running.lock().unwrap_or_else(|e| e.into_inner());
        match table.get(&(workspace_id.to_string(), account_id.to_string())) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Cancel every running pass.
    pub fn cancel_all(&self) -> usize {
        let table = self.running.lock().unwrap_or_else(|e| e.into_inner());
        for flag in table.values() {
            flag.store(true, Ordering::SeqCst);
        }
        table.len()
    }

    fn acquire(&self, request: &SyncRequest) -> Result<(RunGuard<'_>, Arc<AtomicBool>)> {
        let key = (request.workspace_id.clone(), request.account_id.clone());
        let mut table = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if table.contains_key(&key) {
            return Err(SyncError::AlreadyRunning {
                workspace_id: request.workspace_id.clone(),
                account_id: request.account_id.clone(),
            });
        }
        let flag = Arc::new(AtomicBool::new(false));
        table.insert(key.clone(), flag.clone());
        Ok((
            RunGuard {
                table: &self.running,
                key,
            },
            flag,
        ))
    }

    /// Run one pass. A second call for a pair that is already running is
    /// rejected with [`SyncError::AlreadyRunning`].
    #[instrument(skip_all, fields(workspace_id = %request.workspace_id, account_id = %request.account_id))]
    pub async fn run_sync(&self, request: SyncRequest) -> Result<SyncResult> {
        let (_guard, cancel) = self.acquire(&request)?;
        let started_at = now_millis();
        let sync_type = request.scope.as_str();
        info!(
            "Starting {} sync (scope: {}, preview: {})",
            request.mode.as_str(),
            sync_type,
            request.preview
        );

        let previous = self
            .store
            .get_watermark(&request.workspace_id, &request.account_id, sync_type)
            .await?;
        let since = match request.mode {
            SyncMode::Incremental => previous.as_ref().and_then(|w| w.last_synced_at),
            SyncMode::Full => None,
        };
        if request.mode == SyncMode::Incremental && since.is_none() {
            debug!("No watermark yet, walking everything");
        }

        let mut pass = Pass {
            request: &request,
            since,
            cancel: &cancel,
            result: SyncResult::new(started_at),
            incomplete: 0,
            last_error: None,
        };

        let outcome = self.walk(&mut pass).await;
        pass.result.finished_at = Utc::now();
        pass.result.created = pass.result.messages_created + pass.result.contacts_created;

        if let Err(err) = outcome {
            warn!("Sync aborted: {}", err);
            if !request.preview {
                let watermark = SyncWatermark {
                    workspace_id: request.workspace_id.clone(),
                    account_id: request.account_id.clone(),
                    sync_type: sync_type.to_string(),
                    last_synced_at: previous.and_then(|w| w.last_synced_at),
                    last_attempt_at: started_at,
                    processed: pass.result.processed as i64,
                    created: pass.result.created as i64,
                    failed: pass.result.failed as i64,
                    last_error: Some(err.to_string()),
                };
                if let Err(store_err) = self.store.put_watermark(&watermark).await {
                    warn!("Failed to record aborted sync: {}", store_err);
                }
            }
            if request.report_progress {
                emit_error(&request.account_id, &err.to_string());
                emit_result("sync", "error", serde_json::json!({ "error": err.to_string() }));
            }
            return Err(err);
        }

        let Pass {
            result,
            incomplete,
            last_error,
            ..
        } = pass;

        if !request.preview {
            debug!(phase = %Phase::Writing, "Recording watermark");
            let clean = incomplete == 0 && !result.cancelled;
            let watermark = SyncWatermark {
                workspace_id: request.workspace_id.clone(),
                account_id: request.account_id.clone(),
                sync_type: sync_type.to_string(),
                last_synced_at: if clean {
                    Some(started_at)
                } else {
                    previous.and_then(|w| w.last_synced_at)
                },
                last_attempt_at: started_at,
                processed: result.processed as i64,
                created: result.created as i64,
                failed: result.failed as i64,
                last_error,
            };
            self.store.put_watermark(&watermark).await?;
        }

        info!(
            phase = %Phase::Idle,
            "Sync finished: {} processed, {} created, {} failed{}",
            result.processed,
            result.created,
            result.failed,
            if result.cancelled { " (cancelled)" } else { "" }
        );
        if request.report_progress {
            let status = if result.cancelled { "cancelled" } else { "complete" };
            emit_result(
                "sync",
                status,
                serde_json::to_value(&result).unwrap_or(serde_json::Value::Null),
            );
        }
        Ok(result)
    }

    async fn walk(&self, pass: &mut Pass<'_>) -> Result<()> {
        let request = pass.request;
        debug!(phase = %Phase::ListingAccounts, "Listing provider accounts");
        let account = self.find_account(&request.account_id).await?;
        if !request.preview {
            self.store
                .upsert_account(&request.workspace_id, &account)
                .await?;
        }

        debug!(phase = %Phase::ListingConversations, "Listing conversations");
        let mut cursor: Option<String> = None;
        let mut walked = 0usize;
        'pages: loop {
            if pass.cancelled() {
                break;
            }
            let page = match self
                .provider
                .list_conversations(&request.account_id, cursor.as_deref(), self.options.page_size)
                .await
            {
                Ok(page) => page,
                Err(err) if err.is_account_fatal() => return Err(err),
                Err(err) => {
                    pass.record_failure("listing conversations", &err);
                    break;
                }
            };
            let mut page_entirely_older = !page.items.is_empty();

            for item in &page.items {
                if walked >= self.options.max_conversations {
                    info!("Reached max_conversations ({})", self.options.max_conversations);
                    break 'pages;
                }
                if pass.cancelled() {
                    break 'pages;
                }

                let conversation = match mapper::map_conversation(
                    &request.account_id,
                    &account.provider,
                    item,
                ) {
                    Ok(c) => c,
                    Err(err) => {
                        page_entirely_older = false;
                        pass.record_failure("skipping conversation", &err);
                        continue;
                    }
                };

                if let (Some(since), Some(activity)) = (pass.since, conversation.last_activity_at) {
                    if activity <= since {
                        debug!("Conversation {} unchanged since watermark", conversation.external_id);
                        continue;
                    }
                }
                page_entirely_older = false;
                walked += 1;

                let external_id = conversation.external_id.clone();
                debug!(phase = %Phase::ProcessingConversation, conversation = %external_id);
                match self.sync_conversation(pass, conversation).await {
                    Ok(()) => pass.result.processed += 1,
                    Err(err) if err.is_account_fatal() => return Err(err),
                    Err(err) => {
                        pass.record_failure(&format!("conversation {}", external_id), &err);
                    }
                }

                if request.report_progress {
                    emit_progress(
                        &request.account_id,
                        "syncing",
                        &format!("Synced conversation {}", external_id),
                        Some(pass.result.processed),
                    );
                }
            }

            if page.is_last() {
                break;
            }
            if pass.since.is_some() && page_entirely_older {
                debug!("Reached conversations older than the watermark");
                break;
            }
            cursor = page.cursor;
        }

        if pass.result.cancelled {
            info!("Sync cancelled after {} conversations", pass.result.processed);
            if request.report_progress {
                emit_progress(&request.account_id, "cancelled", "Sync cancelled", Some(pass.result.processed));
            }
        }
        Ok(())
    }

    async fn find_account(&self, account_id: &str) -> Result<Account> {
        let accounts = self.provider.list_accounts().await?;
        for item in &accounts {
            match mapper::map_account(self.provider.name(), item) {
                Ok(account) if account.external_id == account_id => return Ok(account),
                Ok(_) => {}
                Err(err) => warn!("Skipping malformed account: {}", err),
            }
        }
        Err(SyncError::AccountNotFound(account_id.to_string()))
    }

    async fn fetch_contacts(&self, pass: &mut Pass<'_>, conversation_id: &str, provider: &str) -> Result<Vec<Contact>> {
        let attendees = match self.provider.list_attendees(conversation_id).await {
            Ok(attendees) => attendees,
            Err(err) if err.is_account_fatal() => return Err(err),
            Err(err) => {
                pass.record_failure(&format!("attendees of {}", conversation_id), &err);
                return Ok(Vec::new());
            }
        };

        let mut contacts = Vec::new();
        for attendee in &attendees {
            match mapper::map_contact(provider, attendee) {
                Ok(Some(contact)) => contacts.push(contact),
                Ok(None) => {}
                Err(err) => pass.record_failure("skipping attendee", &err),
            }
        }
        Ok(contacts)
    }

    async fn fetch_messages(&self, pass: &mut Pass<'_>, conversation_id: &str) -> Result<Vec<Message>> {
        let raw = self
            .provider
            .list_messages(&pass.request.account_id, conversation_id, self.options.message_limit)
            .await?;

        let mut messages = Vec::with_capacity(raw.len());
        for item in &raw {
            match mapper::map_message(conversation_id, item) {
                Ok(message) => messages.push(message),
                Err(err) => pass.record_failure("skipping message", &err),
            }
        }

        let mut messages = mapper::normalize_messages(messages);
        if let Some(since) = pass.since {
            messages.retain(|m| m.sent_at.map_or(true, |t| t > since));
        }
        Ok(messages)
    }

    async fn sync_conversation(&self, pass: &mut Pass<'_>, mut conversation: Conversation) -> Result<()> {
        let request = pass.request;
        let contacts = if request.scope.includes_contacts() {
            self.fetch_contacts(pass, &conversation.external_id, &conversation.provider)
                .await?
        } else {
            Vec::new()
        };
        if let Some(participant) = contacts.first() {
            mapper::enrich_conversation(&mut conversation, participant);
        }

        let messages = if request.scope.includes_messages() {
            self.fetch_messages(pass, &conversation.external_id).await?
        } else {
            Vec::new()
        };

        if request.preview {
            pass.result.previewed += 1 + contacts.len() + messages.len();
            return Ok(());
        }

        let workspace_id = &request.workspace_id;
        let upserted = self.store.upsert_conversation(workspace_id, &conversation).await?;

        for contact in &contacts {
            match self.store.upsert_contact(workspace_id, contact).await {
                Ok(row) if row.created => pass.result.contacts_created += 1,
                Ok(_) => {}
                Err(err) if err.is_conflict() => {
                    pass.record_failure(&format!("contact {}", contact.external_id), &err.into());
                }
                Err(err) => return Err(err.into()),
            }
        }

        if !messages.is_empty() {
            let outcome = self
                .store
                .upsert_messages(workspace_id, &upserted.id, &messages)
                .await?;
            pass.result.messages_created += outcome.created;
            pass.result.failed += outcome.failed;
            pass.incomplete += outcome.failed.saturating_sub(outcome.conflicts);
            if let Some(err) = outcome.errors.last() {
                warn!("{} messages of {} failed: {}", outcome.failed, conversation.external_id, err);
                pass.last_error = Some(err.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{chat, FakeProvider};
    use samsync_ingest::SqliteStore;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    async fn setup(provider: FakeProvider) -> (Arc<SyncOrchestrator>, SqliteStore) {
        let (_, orchestrator, store) = setup_with(provider, SyncOptions::default()).await;
        (orchestrator, store)
    }

    /// Keeps a handle on the fake so tests can read its call counters.
    async fn setup_with(
        provider: FakeProvider,
        options: SyncOptions,
    ) -> (Arc<FakeProvider>, Arc<SyncOrchestrator>, SqliteStore) {
        let provider = Arc::new(provider);
        let store = SqliteStore::in_memory().await.unwrap();
        let orchestrator = SyncOrchestrator::new(provider.clone(), Arc::new(store.clone()), options);
        (provider, Arc::new(orchestrator), store)
    }

    async fn watermark(store: &SqliteStore, account: &str) -> SyncWatermark {
        store
            .get_watermark("ws_1", account, "both")
            .await
            .unwrap()
            .unwrap()
    }

    fn full(account: &str) -> SyncRequest {
        SyncRequest::new("ws_1", account).mode(SyncMode::Full)
    }

    #[tokio::test]
    async fn test_end_to_end_scenario() {
        let (orchestrator, store) = setup(FakeProvider::scenario()).await;

        let result = orchestrator.run_sync(full("acc_a")).await.unwrap();
        assert_eq!(result.processed, 1);
        assert_eq!(result.created, 3);
        assert_eq!(result.failed, 0);
        assert_eq!(result.contacts_created, 0);

        let rows = store
            .messages_for_conversation("ws_1", "conv:ws_1:linkedin:chat_1")
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].external_id, "msg_1");
        assert_eq!(rows[1].external_id, "msg_2");
        assert!(rows[2].id_synthesized);

        let counts = store.workspace_counts("ws_1").await.unwrap();
        assert_eq!(counts.contacts, 0);
        assert_eq!(counts.conversations, 1);
    }

    #[tokio::test]
    async fn test_second_run_creates_nothing() {
        let (orchestrator, store) = setup(FakeProvider::scenario()).await;

        orchestrator.run_sync(full("acc_a")).await.unwrap();
        let second = orchestrator.run_sync(full("acc_a")).await.unwrap();

        assert_eq!(second.created, 0);
        assert_eq!(second.processed, 1);
        assert_eq!(store.workspace_counts("ws_1").await.unwrap().messages, 3);
    }

    #[tokio::test]
    async fn test_failed_conversation_does_not_block_others() {
        let mut provider = FakeProvider::scenario()
            .with_chat(
                "chat_2",
                "Bob Broken",
                "2024-03-01T12:06:00Z",
                vec![json!({"id": "b1", "text": "never stored"})],
            )
            .with_chat(
                "chat_3",
                "Carol Clean",
                "2024-03-01T12:07:00Z",
                vec![json!({"id": "c1", "text": "hello", "timestamp": "2024-03-01T12:07:00Z"})],
            );
        provider.failing_chats.insert("chat_2".into());
        let (provider, orchestrator, store) = setup_with(provider, SyncOptions::default()).await;

        let result = orchestrator.run_sync(full("acc_a")).await.unwrap();
        assert_eq!(result.processed, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.messages_created, 4);
        assert_eq!(provider.message_calls.load(Ordering::SeqCst), 3);

        let counts = store.workspace_counts("ws_1").await.unwrap();
        assert_eq!(counts.messages, 4);

        let watermark = store
            .get_watermark("ws_1", "acc_a", "both")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(watermark.last_synced_at, None);
        assert_eq!(watermark.failed, 1);
        assert!(watermark.last_error.unwrap().contains("chat_2"));
    }

    #[tokio::test]
    async fn test_transient_attendee_failure_is_retried_next_pass() {
        let mut provider = FakeProvider::scenario();
        provider.attendees.insert(
            "chat_1".into(),
            vec![json!({"id": "att_1", "provider_id": "ACoAda", "name": "Ada Lovelace"})],
        );
        provider.attendee_failures.store(1, Ordering::SeqCst);
        let (orchestrator, store) = setup(provider).await;

        let first = orchestrator
            .run_sync(SyncRequest::new("ws_1", "acc_a"))
            .await
            .unwrap();
        assert_eq!(first.failed, 1);
        assert_eq!(first.contacts_created, 0);
        assert_eq!(first.messages_created, 3);
        assert_eq!(watermark(&store, "acc_a").await.last_synced_at, None);

        let second = orchestrator
            .run_sync(SyncRequest::new("ws_1", "acc_a"))
            .await
            .unwrap();
        assert_eq!(second.processed, 1);
        assert_eq!(second.failed, 0);
        assert_eq!(second.contacts_created, 1);
        assert_eq!(store.workspace_counts("ws_1").await.unwrap().contacts, 1);
        assert_eq!(
            watermark(&store, "acc_a").await.last_synced_at,
            Some(second.started_at)
        );
    }

    #[tokio::test]
    async fn test_malformed_message_does_not_hold_watermark() {
        let mut provider = FakeProvider::scenario();
        if let Some(messages) = provider.messages.get_mut("chat_1") {
            messages.push(json!({"id": "msg_bad", "text": ["not", "text"]}));
        }
        let (orchestrator, store) = setup(provider).await;

        let result = orchestrator
            .run_sync(SyncRequest::new("ws_1", "acc_a"))
            .await
            .unwrap();
        assert_eq!(result.failed, 1);
        assert_eq!(result.messages_created, 3);

        let watermark = watermark(&store, "acc_a").await;
        assert_eq!(watermark.last_synced_at, Some(result.started_at));
        assert!(watermark.last_error.unwrap().contains("skipping message"));
    }

    #[tokio::test]
    async fn test_listing_failure_keeps_counts_of_earlier_pages() {
        let mut provider = FakeProvider::scenario();
        for i in 2..=5 {
            provider = provider.with_chat(
                &format!("chat_{}", i),
                "Page Walker",
                "2024-03-01T12:00:00Z",
                vec![json!({"id": format!("m{}", i), "text": "hi"})],
            );
        }
        provider.failing_cursor = Some("2".into());
        let options = SyncOptions {
            page_size: 2,
            ..SyncOptions::default()
        };
        let (provider, orchestrator, store) = setup_with(provider, options).await;

        let result = orchestrator.run_sync(full("acc_a")).await.unwrap();
        assert_eq!(result.processed, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.messages_created, 4);
        assert_eq!(provider.conversation_pages.load(Ordering::SeqCst), 2);
        assert_eq!(store.workspace_counts("ws_1").await.unwrap().conversations, 2);

        let watermark = watermark(&store, "acc_a").await;
        assert_eq!(watermark.last_synced_at, None);
        assert_eq!(watermark.processed, 2);
        assert!(watermark.last_error.unwrap().contains("listing conversations"));
    }

    #[tokio::test]
    async fn test_self_attendee_never_becomes_contact() {
        let mut provider = FakeProvider::scenario();
        provider.attendees.insert(
            "chat_1".into(),
            vec![
                json!({"id": "att_self", "name": "Sam Seller", "is_self": true}),
                json!({"id": "att_1", "provider_id": "ACoAda", "name": "Ada Lovelace",
                       "specifics": {"occupation": "Analyst at Engines Ltd"}}),
            ],
        );
        let (orchestrator, store) = setup(provider).await;

        let result = orchestrator.run_sync(full("acc_a")).await.unwrap();
        assert_eq!(result.contacts_created, 1);
        assert_eq!(result.created, 4);
        assert_eq!(store.workspace_counts("ws_1").await.unwrap().contacts, 1);
    }

    #[tokio::test]
    async fn test_concurrent_run_is_rejected() {
        let mut provider = FakeProvider::scenario();
        provider.delay = Some(Duration::from_millis(200));
        let (orchestrator, _store) = setup(provider).await;

        let first = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.run_sync(full("acc_a")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(orchestrator.is_running("ws_1", "acc_a"));

        let second = orchestrator.run_sync(full("acc_a")).await;
        assert!(matches!(second, Err(SyncError::AlreadyRunning { .. })));

        assert!(first.await.unwrap().is_ok());
        assert!(!orchestrator.is_running("ws_1", "acc_a"));
        assert!(orchestrator.run_sync(full("acc_a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_account_is_reported() {
        let (orchestrator, store) = setup(FakeProvider::scenario()).await;
        let err = orchestrator.run_sync(full("acc_missing")).await.unwrap_err();
        assert!(matches!(err, SyncError::AccountNotFound(_)));

        let watermark = store
            .get_watermark("ws_1", "acc_missing", "both")
            .await
            .unwrap()
            .unwrap();
        assert!(watermark.last_error.is_some());
        assert!(!orchestrator.is_running("ws_1", "acc_missing"));
    }

    #[tokio::test]
    async fn test_auth_failure_aborts_and_is_recorded() {
        let mut provider = FakeProvider::scenario();
        provider.auth_failure = true;
        let (orchestrator, store) = setup(provider).await;

        let err = orchestrator.run_sync(full("acc_a")).await.unwrap_err();
        assert!(matches!(err, SyncError::Auth(_)));
        let watermark = store
            .get_watermark("ws_1", "acc_a", "both")
            .await
            .unwrap()
            .unwrap();
        assert!(watermark.last_error.unwrap().contains("authentication"));
        assert_eq!(watermark.last_synced_at, None);
    }

    #[tokio::test]
    async fn test_incremental_uses_watermark() {
        let (orchestrator, store) = setup(FakeProvider::scenario()).await;

        // No watermark yet: behaves as full.
        let first = orchestrator
            .run_sync(SyncRequest::new("ws_1", "acc_a"))
            .await
            .unwrap();
        assert_eq!(first.created, 3);

        let watermark = store
            .get_watermark("ws_1", "acc_a", "both")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(watermark.last_synced_at, Some(first.started_at));

        // Chat activity (2024) is older than the watermark: nothing is touched.
        let second = orchestrator
            .run_sync(SyncRequest::new("ws_1", "acc_a"))
            .await
            .unwrap();
        assert_eq!(second.processed, 0);
        assert_eq!(second.created, 0);
    }

    #[tokio::test]
    async fn test_incremental_stops_at_older_page() {
        let mut provider = FakeProvider::scenario();
        for i in 0..120 {
            provider.chats.push(chat(&format!("old_{}", i), "Old Chat", "2020-01-01T00:00:00Z"));
        }
        let provider = Arc::new(provider);
        let store = SqliteStore::in_memory().await.unwrap();
        let orchestrator = SyncOrchestrator::new(
            provider.clone(),
            Arc::new(store.clone()),
            SyncOptions::default(),
        );

        store
            .put_watermark(&SyncWatermark {
                workspace_id: "ws_1".into(),
                account_id: "acc_a".into(),
                sync_type: "both".into(),
                last_synced_at: Some("2023-06-01T00:00:00Z".parse().unwrap()),
                last_attempt_at: Utc::now(),
                processed: 0,
                created: 0,
                failed: 0,
                last_error: None,
            })
            .await
            .unwrap();

        let result = orchestrator
            .run_sync(SyncRequest::new("ws_1", "acc_a"))
            .await
            .unwrap();
        assert_eq!(result.processed, 1);
        // Page one has chat_1 plus old chats, page two is entirely older.
        assert_eq!(provider.conversation_pages.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_preview_writes_nothing() {
        let (orchestrator, store) = setup(FakeProvider::scenario()).await;

        let result = orchestrator
            .run_sync(full("acc_a").preview(true))
            .await
            .unwrap();
        assert_eq!(result.created, 0);
        assert_eq!(result.previewed, 4);

        let counts = store.workspace_counts("ws_1").await.unwrap();
        assert_eq!(counts.messages, 0);
        assert_eq!(counts.accounts, 0);
        assert!(store
            .get_watermark("ws_1", "acc_a", "both")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_full_mode_respects_caps() {
        let mut provider = FakeProvider::scenario();
        for i in 0..5 {
            provider.chats.push(chat(&format!("extra_{}", i), "Extra", "2024-01-01T00:00:00Z"));
        }
        let store = SqliteStore::in_memory().await.unwrap();
        let orchestrator = SyncOrchestrator::new(
            Arc::new(provider),
            Arc::new(store.clone()),
            SyncOptions {
                page_size: 2,
                message_limit: 2,
                max_conversations: 3,
            },
        );

        let result = orchestrator.run_sync(full("acc_a")).await.unwrap();
        assert_eq!(result.processed, 3);
        // chat_1 has three messages but only two are fetched.
        assert_eq!(result.messages_created, 2);
    }

    #[tokio::test]
    async fn test_cancel_stops_between_conversations() {
        let mut provider = FakeProvider::scenario();
        provider.delay = Some(Duration::from_millis(100));
        let (orchestrator, store) = setup(provider).await;

        assert!(!orchestrator.cancel("ws_1", "acc_a"));
        let run = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.run_sync(full("acc_a")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(orchestrator.cancel("ws_1", "acc_a"));

        let result = run.await.unwrap().unwrap();
        assert!(result.cancelled);
        assert_eq!(result.processed, 0);

        let watermark = store
            .get_watermark("ws_1", "acc_a", "both")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(watermark.last_synced_at, None);
    }

    #[test]
    fn test_mode_and_scope_parse() {
        assert_eq!("FULL".parse::<SyncMode>().unwrap(), SyncMode::Full);
        assert!("sideways".parse::<SyncMode>().is_err());
        assert_eq!("contacts".parse::<SyncScope>().unwrap(), SyncScope::Contacts);
        assert!(SyncScope::Both.includes_messages() && SyncScope::Both.includes_contacts());
        assert!(!SyncScope::Messages.includes_contacts());
    }
}
