//! Error taxonomy for the sync pipeline.

use std::time::Duration;

use samsync_auth::CredentialError;
use samsync_ingest::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Bad or expired provider credentials. Never retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Provider answered 429.
    #[error("rate limited by provider (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Network failure, timeout or 5xx.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// A non-retryable 4xx other than auth.
    #[error("provider rejected request ({status}): {message}")]
    Request { status: u16, message: String },

    /// Malformed provider payload; the record is skipped.
    #[error("could not map provider payload: {0}")]
    Mapping(String),

    /// Persistence constraint the upsert did not resolve; the record is skipped.
    #[error("store conflict: {0}")]
    Conflict(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("account {0} is not connected at the provider")]
    AccountNotFound(String),

    #[error("a sync for workspace {workspace_id} / account {account_id} is already running")]
    AlreadyRunning {
        workspace_id: String,
        account_id: String,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether the provider call that produced this error may be repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::RateLimited { .. } | SyncError::Unavailable(_))
    }

    /// Permanent problems with a single record. Retrying later yields the
    /// same result, so they never hold back the watermark.
    pub fn is_record_level(&self) -> bool {
        matches!(self, SyncError::Mapping(_) | SyncError::Conflict(_))
    }

    /// Errors that end the pass for the whole account.
    pub fn is_account_fatal(&self) -> bool {
        matches!(self, SyncError::Auth(_) | SyncError::AccountNotFound(_))
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => SyncError::Conflict(msg),
            other => SyncError::Store(other.to_string()),
        }
    }
}

impl From<CredentialError> for SyncError {
    fn from(err: CredentialError) -> Self {
        SyncError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(SyncError::Unavailable("503".into()).is_retryable());
        assert!(SyncError::RateLimited { retry_after: None }.is_retryable());
        assert!(!SyncError::Auth("401".into()).is_retryable());
        assert!(!SyncError::Request { status: 404, message: "missing".into() }.is_retryable());
        assert!(SyncError::Auth("401".into()).is_account_fatal());
        assert!(!SyncError::Mapping("bad".into()).is_account_fatal());
    }

    #[test]
    fn test_record_level_errors() {
        assert!(SyncError::Mapping("bad".into()).is_record_level());
        assert!(SyncError::Conflict("dup".into()).is_record_level());
        assert!(!SyncError::Unavailable("503".into()).is_record_level());
        assert!(!SyncError::Store("locked".into()).is_record_level());
    }

    #[test]
    fn test_store_conflict_maps_to_conflict() {
        let err: SyncError = StoreError::Conflict("unique".into()).into();
        assert!(matches!(err, SyncError::Conflict(_)));
        let err: SyncError = StoreError::Remote { status: 500, body: "boom".into() }.into();
        assert!(matches!(err, SyncError::Store(_)));
    }
}
