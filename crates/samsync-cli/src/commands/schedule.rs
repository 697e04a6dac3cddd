use anyhow::{bail, Result};
use samsync_core::{Engine, SamsyncConfig, SamsyncPaths, TargetOutcome};

use crate::ui;

pub async fn run(config: SamsyncConfig, paths: &SamsyncPaths) -> Result<()> {
    if config.scheduler.targets.is_empty() {
        bail!("no [[scheduler.targets]] configured in {}", paths.config_path.display());
    }

    let engine = Engine::build(config, paths).await?;
    let scheduler_config = engine.config.scheduler_config();
    ui::header("Scheduler");
    ui::row("Targets", &scheduler_config.targets.len().to_string());
    ui::row("Interval", &format!("{}s", scheduler_config.interval.as_secs()));
    ui::row("Mode", scheduler_config.mode.as_str());
    ui::row("Scope", scheduler_config.scope.as_str());
    println!();
    ui::info("Press Ctrl-C to stop.");

    let handle = engine.scheduler().start();
    tokio::signal::ctrl_c().await?;
    ui::info("Stopping, cancelling running syncs...");
    let stats = handle.stop().await;

    println!();
    ui::success(&format!("Stopped after {} cycles", stats.cycles));
    let mut outcomes: Vec<_> = stats.last_outcomes.into_iter().collect();
    outcomes.sort_by(|a, b| a.0.cmp(&b.0));
    for (target, outcome) in outcomes {
        match outcome {
            TargetOutcome::Completed(result) => ui::info(&format!(
                "{}: {} processed, {} created, {} failed{}",
                target,
                result.processed,
                result.created,
                result.failed,
                if result.cancelled { " (cancelled)" } else { "" }
            )),
            TargetOutcome::Skipped => ui::info(&format!("{}: skipped (already running)", target)),
            TargetOutcome::Failed { error } => ui::error(&format!("{}: {}", target, error)),
        }
    }
    Ok(())
}
