use anyhow::Result;
use samsync_core::mapper::map_account;
use samsync_core::{build_provider, ProviderClient, SamsyncConfig};
use serde::Serialize;

use crate::ui;

#[derive(Serialize)]
struct AccountRow {
    id: String,
    provider: String,
    name: Option<String>,
    status: String,
}

pub async fn run(config: SamsyncConfig, json: bool) -> Result<()> {
    let client = build_provider(&config)?;
    let pb = (!json).then(|| ui::spinner("Listing provider accounts"));
    let raw = client.list_accounts().await;
    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }

    let mut rows = Vec::new();
    for item in raw? {
        match map_account(client.name(), &item) {
            Ok(account) => rows.push(AccountRow {
                id: account.external_id,
                provider: account.provider,
                name: account.display_name,
                status: account.status.as_str().to_string(),
            }),
            Err(e) => tracing::warn!("Skipping malformed account: {}", e),
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        ui::info("No accounts connected at the provider.");
        return Ok(());
    }

    ui::header("Accounts");
    for row in &rows {
        let line = format!(
            "{}  {}  {}",
            row.id,
            row.provider,
            row.name.as_deref().unwrap_or("-")
        );
        if row.status == "connected" {
            ui::success(&line);
        } else {
            ui::warn(&format!("{} ({})", line, row.status));
        }
    }
    println!();
    Ok(())
}
