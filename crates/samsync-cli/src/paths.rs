//! Config and data directory resolution shared by all commands.

use std::path::PathBuf;

use anyhow::Result;
use samsync_core::{SamsyncConfig, SamsyncPaths};
use tracing::debug;

/// Resolve the data directory and load the config file.
///
/// An explicit `--config` wins over `$SAMSYNC_DATA_DIR/samsync.toml`.
pub fn load(config_override: Option<PathBuf>) -> Result<(SamsyncConfig, SamsyncPaths)> {
    let paths = SamsyncPaths::from_env();
    paths.ensure_dirs()?;
    let config_path = config_override.unwrap_or_else(|| paths.config_path.clone());
    debug!("Loading config from {}", config_path.display());
    let config = SamsyncConfig::load(&config_path)?;
    Ok((config, paths))
}
