//! Unipile REST client (LinkedIn messaging).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::{StatusCode, Url};
use samsync_auth::Secret;
use serde_json::Value;
use tracing::debug;

use super::retry::{with_retry, RetryPolicy, Throttle};
use super::{Page, ProviderClient};
use crate::error::{Result, SyncError};

const API_KEY_HEADER: &str = "X-API-KEY";

/// Connection and pacing settings for [`UnipileClient`].
#[derive(Debug, Clone)]
pub struct UnipileOptions {
    /// API root including the version prefix, e.g. `https://api1.unipile.com:13111/api/v1`.
    pub base_url: String,
    pub timeout: Duration,
    pub min_request_interval: Duration,
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
}

impl Default for UnipileOptions {
    fn default() -> Self {
        Self {
            base_url: "https://api1.unipile.com:13111/api/v1".to_string(),
            timeout: Duration::from_secs(20),
            min_request_interval: Duration::from_millis(250),
            max_in_flight: 2,
            retry: RetryPolicy::default(),
        }
    }
}

/// Cheap to clone; clones share the HTTP pool and the throttle.
#[derive(Clone)]
pub struct UnipileClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: Secret,
    throttle: Throttle,
    retry: RetryPolicy,
}

impl UnipileClient {
    pub fn new(options: UnipileOptions, api_key: Secret) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {}", e)))?;
        let base_url = Url::parse(options.base_url.trim_end_matches('/')).map_err(|e| {
            SyncError::Config(format!("invalid provider base URL {}: {}", options.base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::Config(format!(
                "provider base URL {} cannot carry a path",
                options.base_url
            )));
        }
        Ok(Self {
            http,
            base_url,
            api_key,
            throttle: Throttle::new(options.min_request_interval, options.max_in_flight),
            retry: options.retry,
        })
    }

    /// Base URL plus `segments`, each percent-encoded as one path segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::Config(format!("invalid provider base URL {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get(&self, segments: &[&str], query: &[(&str, String)]) -> Result<Value> {
        let url = self.endpoint(segments)?;
        with_retry(&self.retry, "unipile", || self.get_once(&url, query)).await
    }

    async fn get_once(&self, url: &Url, query: &[(&str, String)]) -> Result<Value> {
        let _permit = self.throttle.acquire().await?;
        debug!("GET {} {:?}", url, query);

        let response = self
            .http
            .get(url.clone())
            .header(API_KEY_HEADER, self.api_key.expose())
            .header(ACCEPT, "application/json")
            .query(query)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<Value>()
                .await
                .map_err(|e| SyncError::Mapping(format!("invalid JSON from {}: {}", url, e)));
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, retry_after, body))
    }
}

fn transport_error(err: reqwest::Error) -> SyncError {
    if err.is_timeout() {
        SyncError::Unavailable(format!("request timed out: {}", err))
    } else {
        SyncError::Unavailable(err.to_string())
    }
}

fn status_error(status: StatusCode, retry_after: Option<Duration>, body: String) -> SyncError {
    match status.as_u16() {
        401 | 403 => SyncError::Auth(format!("{}: {}", status, body)),
        429 => SyncError::RateLimited { retry_after },
        s if status.is_server_error() => SyncError::Unavailable(format!("{}: {}", s, body)),
        s => SyncError::Request {
            status: s,
            message: body,
        },
    }
}

/// Accepts `{ "items": [...], "cursor": ... }` or a bare array.
fn parse_page(value: Value) -> Result<Page> {
    match value {
        Value::Array(items) => Ok(Page {
            items,
            cursor: None,
        }),
        Value::Object(mut obj) => {
            let items = match obj.remove("items") {
                Some(Value::Array(items)) => items,
                None | Some(Value::Null) => Vec::new(),
                Some(other) => {
                    return Err(SyncError::Mapping(format!(
                        "expected items array, got {}",
                        other
                    )))
                }
            };
            let cursor = match obj.remove("cursor") {
                Some(Value::String(s)) if !s.is_empty() => Some(s),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            };
            Ok(Page { items, cursor })
        }
        other => Err(SyncError::Mapping(format!(
            "unexpected list response: {}",
            other
        ))),
    }
}

#[async_trait]
impl ProviderClient for UnipileClient {
    fn name(&self) -> &'static str {
        "linkedin"
    }

    async fn list_accounts(&self) -> Result<Vec<Value>> {
        let value = self.get(&["accounts"], &[]).await?;
        Ok(parse_page(value)?.items)
    }

    async fn list_conversations(
        &self,
        account_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page> {
        let mut query = vec![
            ("account_id", account_id.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        parse_page(self.get(&["chats"], &query).await?)
    }

    async fn list_messages(
        &self,
        account_id: &str,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Value>> {
        let query = [
            ("account_id", account_id.to_string()),
            ("chat_id", conversation_id.to_string()),
            ("limit", limit.to_string()),
        ];
        Ok(parse_page(self.get(&["messages"], &query).await?)?.items)
    }

    async fn list_attendees(&self, conversation_id: &str) -> Result<Vec<Value>> {
        let segments = ["chats", conversation_id, "attendees"];
        Ok(parse_page(self.get(&segments, &[]).await?)?.items)
    }
}
