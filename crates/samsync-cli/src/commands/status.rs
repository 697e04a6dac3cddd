use anyhow::Result;
use samsync_core::{open_store, SamsyncConfig, SamsyncPaths, SyncWatermark, WorkspaceCounts};
use serde::Serialize;

use crate::ui;

#[derive(Serialize)]
struct Status {
    workspace_id: String,
    counts: WorkspaceCounts,
    watermarks: Vec<WatermarkStatus>,
}

#[derive(Serialize)]
struct WatermarkStatus {
    account_id: String,
    sync_type: String,
    last_synced_at: Option<String>,
    last_attempt_at: String,
    processed: i64,
    created: i64,
    failed: i64,
    last_error: Option<String>,
}

impl From<SyncWatermark> for WatermarkStatus {
    fn from(w: SyncWatermark) -> Self {
        Self {
            account_id: w.account_id,
            sync_type: w.sync_type,
            last_synced_at: w.last_synced_at.map(|t| t.to_rfc3339()),
            last_attempt_at: w.last_attempt_at.to_rfc3339(),
            processed: w.processed,
            created: w.created,
            failed: w.failed,
            last_error: w.last_error,
        }
    }
}

pub async fn run(config: SamsyncConfig, paths: &SamsyncPaths, workspace: &str, json: bool) -> Result<()> {
    let store = open_store(&config.store, paths).await?;
    let counts = store.workspace_counts(workspace).await?;
    let watermarks = store.list_watermarks(workspace).await?;

    let status = Status {
        workspace_id: workspace.to_string(),
        counts,
        watermarks: watermarks.into_iter().map(WatermarkStatus::from).collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    ui::header(&format!("Workspace {}", status.workspace_id));
    ui::row("Accounts", &status.counts.accounts.to_string());
    ui::row("Conversations", &status.counts.conversations.to_string());
    ui::row("Messages", &status.counts.messages.to_string());
    ui::row("Contacts", &status.counts.contacts.to_string());
    println!();

    if status.watermarks.is_empty() {
        ui::info("No syncs recorded yet. Run one with:");
        println!("    samsync sync --workspace {} --account <ACCOUNT_ID>", status.workspace_id);
        println!();
        return Ok(());
    }

    for w in &status.watermarks {
        let label = format!("{} ({})", w.account_id, w.sync_type);
        let synced = w.last_synced_at.as_deref().unwrap_or("never");
        match &w.last_error {
            Some(err) => ui::warn(&format!(
                "{}: last clean sync {}, last attempt {} failed {} ({})",
                label, synced, w.last_attempt_at, w.failed, err
            )),
            None => ui::success(&format!(
                "{}: synced {} ({} processed, {} created)",
                label, synced, w.processed, w.created
            )),
        }
    }
    println!();
    Ok(())
}
