//! Configuration schema and loading.
//!
//! samsync reads a TOML file (default `$SAMSYNC_DATA_DIR/samsync.toml`).
//! Every section is optional. Secrets are never stored in the file: the
//! provider key and the Supabase service key are credential sources
//! resolved at startup.
//!
//! ```toml
//! [provider]
//! base_url = "https://api1.unipile.com:13111/api/v1"
//! api_key = { type = "env", var = "UNIPILE_API_KEY" }
//!
//! [store]
//! backend = "supabase"
//! url = "https://project.supabase.co"
//! service_key = { type = "keyring", account = "supabase_service_key" }
//!
//! [[scheduler.targets]]
//! workspace_id = "ws_1"
//! account_id = "acc_a"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use samsync_auth::CredentialSource;
use serde::Deserialize;

use crate::orchestrator::{SyncMode, SyncOptions, SyncScope};
use crate::providers::{RetryPolicy, UnipileOptions};
use crate::scheduler::{SchedulerConfig, SyncTarget};

pub const CONFIG_FILE_NAME: &str = "samsync.toml";
pub const DEFAULT_API_KEY_VAR: &str = "UNIPILE_API_KEY";

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamsyncConfig {
    pub provider: ProviderSettings,
    pub store: StoreSettings,
    pub sync: SyncOptions,
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub base_url: String,
    pub api_key: CredentialSource,
    pub timeout_secs: u64,
    pub min_request_interval_ms: u64,
    pub max_in_flight: usize,
    pub retry: RetrySettings,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        let defaults = UnipileOptions::default();
        Self {
            base_url: defaults.base_url,
            api_key: CredentialSource::env(DEFAULT_API_KEY_VAR),
            timeout_secs: defaults.timeout.as_secs(),
            min_request_interval_ms: defaults.min_request_interval.as_millis() as u64,
            max_in_flight: defaults.max_in_flight,
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub rate_limit_cooldown_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            rate_limit_cooldown_secs: 5,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        RetryPolicy {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            rate_limit_cooldown: Duration::from_secs(settings.rate_limit_cooldown_secs),
        }
    }
}

/// Persistence backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreSettings {
    /// Local SQLite file. Defaults to `samsync.db` in the data directory.
    Sqlite {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    /// Supabase project (PostgREST).
    Supabase {
        url: String,
        service_key: CredentialSource,
    },
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings::Sqlite { path: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub interval_secs: u64,
    pub max_concurrent: usize,
    pub mode: SyncMode,
    pub scope: SyncScope,
    pub targets: Vec<SyncTarget>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            interval_secs: defaults.interval.as_secs(),
            max_concurrent: defaults.max_concurrent,
            mode: defaults.mode,
            scope: defaults.scope,
            targets: defaults.targets,
        }
    }
}

impl SamsyncConfig {
    /// Load from `path` and apply environment overrides.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Self::from_toml(&content).with_context(|| format!("invalid config {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse TOML")
    }

    /// Apply `SAMSYNC_*` overrides from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup("SAMSYNC_PROVIDER_BASE_URL") {
            self.provider.base_url = url;
        }
        if let Some(limit) = lookup("SAMSYNC_MESSAGE_LIMIT") {
            self.sync.message_limit = limit
                .trim()
                .parse()
                .with_context(|| format!("SAMSYNC_MESSAGE_LIMIT is not a number: {}", limit))?;
        }
        if let Some(max) = lookup("SAMSYNC_MAX_CONVERSATIONS") {
            self.sync.max_conversations = max
                .trim()
                .parse()
                .with_context(|| format!("SAMSYNC_MAX_CONVERSATIONS is not a number: {}", max))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let base = &self.provider.base_url;
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            bail!("provider.base_url must be an http(s) URL, got {:?}", base);
        }
        if self.provider.timeout_secs == 0 {
            bail!("provider.timeout_secs must be positive");
        }
        if self.sync.page_size == 0 || self.sync.message_limit == 0 {
            bail!("sync.page_size and sync.message_limit must be positive");
        }
        if self.scheduler.interval_secs == 0 {
            bail!("scheduler.interval_secs must be positive");
        }
        if let StoreSettings::Supabase { url, .. } = &self.store {
            if !url.starts_with("https://") && !url.starts_with("http://") {
                bail!("store.url must be an http(s) URL, got {:?}", url);
            }
        }
        Ok(())
    }

    pub fn unipile_options(&self) -> UnipileOptions {
        UnipileOptions {
            base_url: self.provider.base_url.clone(),
            timeout: Duration::from_secs(self.provider.timeout_secs),
            min_request_interval: Duration::from_millis(self.provider.min_request_interval_ms),
            max_in_flight: self.provider.max_in_flight,
            retry: RetryPolicy::from(&self.provider.retry),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(self.scheduler.interval_secs),
            targets: self.scheduler.targets.clone(),
            mode: self.scheduler.mode,
            scope: self.scheduler.scope,
            max_concurrent: self.scheduler.max_concurrent,
        }
    }
}
