//! Sync engine: pulls LinkedIn messaging data through a provider client and
//! writes it, scoped per workspace, into a [`SyncStore`].

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

pub mod config;
pub mod error;
pub mod mapper;
pub mod orchestrator;
pub mod progress;
pub mod providers;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{SamsyncConfig, StoreSettings, CONFIG_FILE_NAME};
pub use error::SyncError;
pub use orchestrator::{SyncMode, SyncOptions, SyncOrchestrator, SyncRequest, SyncResult, SyncScope};
pub use progress::{emit_error, emit_progress, emit_result};
pub use providers::{Page, ProviderClient, RetryPolicy, UnipileClient, UnipileOptions};
pub use scheduler::{SchedulerConfig, SchedulerHandle, SchedulerStats, SyncScheduler, SyncTarget, TargetOutcome};

pub use samsync_auth::{CredentialSource, Secret};
pub use samsync_ingest::{SqliteStore, SupabaseStore, SyncStore, SyncWatermark, WorkspaceCounts};

#[derive(Debug, Clone)]
pub struct SamsyncPaths {
    pub base_dir: PathBuf,
    pub config_path: PathBuf,
    pub db_path: PathBuf,
}

impl SamsyncPaths {
    /// `SAMSYNC_DATA_DIR`, else the platform data directory.
    pub fn from_env() -> Self {
        if let Some(dir) = std::env::var_os("SAMSYNC_DATA_DIR") {
            return Self::from_base(PathBuf::from(dir));
        }
        if let Some(dirs) = directories::ProjectDirs::from("dev", "samsync", "samsync") {
            return Self::from_base(dirs.data_dir().to_path_buf());
        }
        Self::from_base(PathBuf::from(".samsync"))
    }

    pub fn from_base(base_dir: PathBuf) -> Self {
        let config_path = base_dir.join(CONFIG_FILE_NAME);
        let db_path = base_dir.join("samsync.db");
        Self {
            base_dir,
            config_path,
            db_path,
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)
            .with_context(|| format!("failed to create {}", self.base_dir.display()))?;
        Ok(())
    }
}

/// Wired provider, store and orchestrator.
#[derive(Clone)]
pub struct Engine {
    pub config: SamsyncConfig,
    pub provider: Arc<dyn ProviderClient>,
    pub store: Arc<dyn SyncStore>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl Engine {
    /// Resolve credentials and open the configured store.
    pub async fn build(config: SamsyncConfig, paths: &SamsyncPaths) -> Result<Self> {
        let provider: Arc<dyn ProviderClient> = Arc::new(build_provider(&config)?);
        let store = open_store(&config.store, paths).await?;
        Ok(Self::from_parts(config, provider, store))
    }

    pub fn from_parts(
        config: SamsyncConfig,
        provider: Arc<dyn ProviderClient>,
        store: Arc<dyn SyncStore>,
    ) -> Self {
        let orchestrator = Arc::new(SyncOrchestrator::new(
            provider.clone(),
            store.clone(),
            config.sync.clone(),
        ));
        Self {
            config,
            provider,
            store,
            orchestrator,
        }
    }

    pub fn scheduler(&self) -> SyncScheduler {
        SyncScheduler::new(self.config.scheduler_config(), self.orchestrator.clone())
    }
}

/// Unipile client with the configured API key resolved.
pub fn build_provider(config: &SamsyncConfig) -> Result<UnipileClient> {
    let api_key = config.provider.api_key.resolve().with_context(|| {
        format!(
            "failed to resolve provider API key from {}",
            config.provider.api_key.describe()
        )
    })?;
    Ok(UnipileClient::new(config.unipile_options(), api_key)?)
}

pub async fn open_store(settings: &StoreSettings, paths: &SamsyncPaths) -> Result<Arc<dyn SyncStore>> {
    match settings {
        StoreSettings::Sqlite { path } => {
            let path = path.clone().unwrap_or_else(|| paths.db_path.clone());
            info!("Opening SQLite store at {}", path.display());
            let store = SqliteStore::new(&path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            Ok(Arc::new(store))
        }
        StoreSettings::Supabase { url, service_key } => {
            let key = service_key.resolve().with_context(|| {
                format!("failed to resolve Supabase key from {}", service_key.describe())
            })?;
            info!("Using Supabase store at {}", url);
            let store = SupabaseStore::new(url, key.expose().to_string(), reqwest::Client::new())
                .context("invalid Supabase URL")?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_from_base() {
        let paths = SamsyncPaths::from_base(PathBuf::from("/tmp/samsync-test"));
        assert_eq!(paths.config_path, PathBuf::from("/tmp/samsync-test/samsync.toml"));
        assert_eq!(paths.db_path, PathBuf::from("/tmp/samsync-test/samsync.db"));
    }

    #[tokio::test]
    async fn test_engine_opens_sqlite_store() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SamsyncPaths::from_base(dir.path().to_path_buf());
        let store = open_store(&StoreSettings::default(), &paths).await.unwrap();
        let counts = store.workspace_counts("ws_1").await.unwrap();
        assert_eq!(counts, WorkspaceCounts::default());
        assert!(paths.db_path.exists());
    }

    #[tokio::test]
    async fn test_engine_requires_api_key() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SamsyncPaths::from_base(dir.path().to_path_buf());
        let mut config = SamsyncConfig::default();
        config.provider.api_key = CredentialSource::env("SAMSYNC_TEST_KEY_THAT_IS_NEVER_SET");
        let err = Engine::build(config, &paths).await.err().unwrap();
        assert!(format!("{:#}", err).contains("SAMSYNC_TEST_KEY_THAT_IS_NEVER_SET"));
    }
}
