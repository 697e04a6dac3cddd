use anyhow::{Context, Result};
use indicatif::ProgressBar;
use samsync_core::{
    Engine, SamsyncConfig, SamsyncPaths, SyncMode, SyncRequest, SyncResult, SyncScope,
};

use crate::ui;

pub struct SyncArgs {
    pub workspace: String,
    pub account: String,
    pub mode: SyncMode,
    pub scope: SyncScope,
    pub preview: bool,
    pub progress: bool,
    pub json: bool,
}

pub async fn run(config: SamsyncConfig, paths: &SamsyncPaths, args: SyncArgs) -> Result<()> {
    let engine = Engine::build(config, paths).await?;

    let mut request = SyncRequest::new(&args.workspace, &args.account)
        .mode(args.mode)
        .scope(args.scope)
        .preview(args.preview);
    request.report_progress = args.progress;

    let pb = if args.json || args.progress {
        ProgressBar::hidden()
    } else {
        ui::spinner(&format!(
            "Syncing {} into {} ({})",
            args.account,
            args.workspace,
            args.mode.as_str()
        ))
    };

    let orchestrator = engine.orchestrator.clone();
    let run = orchestrator.run_sync(request);
    tokio::pin!(run);

    let outcome = tokio::select! {
        outcome = &mut run => outcome,
        _ = tokio::signal::ctrl_c() => {
            pb.set_message("Cancelling after the current conversation...");
            engine.orchestrator.cancel(&args.workspace, &args.account);
            run.await
        }
    };

    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            pb.abandon_with_message("Failed");
            return Err(e).with_context(|| format!("sync of {} failed", args.account));
        }
    };
    pb.finish_and_clear();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if !args.progress {
        print_summary(&args, &result);
    }
    Ok(())
}

fn print_summary(args: &SyncArgs, result: &SyncResult) {
    let elapsed = result.finished_at - result.started_at;
    let label = format!("{} / {}", args.workspace, args.account);

    if args.preview {
        ui::success(&format!(
            "{}: preview of {} conversations, {} records would be written",
            label, result.processed, result.previewed
        ));
    } else if result.created > 0 {
        ui::success(&format!(
            "{}: {} conversations, {} new messages, {} new contacts",
            label, result.processed, result.messages_created, result.contacts_created
        ));
    } else {
        ui::success(&format!("{}: up to date ({} conversations)", label, result.processed));
    }

    if result.failed > 0 {
        ui::warn(&format!("{} records failed; see logs for details", result.failed));
    }
    if result.cancelled {
        ui::warn("Cancelled before all conversations were synced");
    }
    ui::info(&format!("Finished in {:.1}s", elapsed.num_milliseconds() as f64 / 1000.0));
}
