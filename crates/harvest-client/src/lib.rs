//! Upstream API access: identity rotation, single-item fetch and batched fan-out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use harvest_core::{FailureReason, ItemId, RawRecord};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub mod coordinator;
pub mod rotator;

pub use coordinator::{BatchFetchCoordinator, BatchFetchOutcome, CoordinatorConfig, FetchFailure};
pub use rotator::{
    BrowserFamily, BrowserProfile, DetectionRisk, IdentityRotator, RotatorError, RotatorStats,
};

pub const CRATE_NAME: &str = "harvest-client";

pub const DEFAULT_BASE_URL: &str = "https://www.dlsite.com/maniax/api/=/product.json";

/// Expected "no data" outcomes. Never retried by the hot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftMissKind {
    NotFound,
    EmptyPayload,
    MalformedJson,
    NotAnArray,
    MissingIdentifier,
}

impl SoftMissKind {
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            SoftMissKind::NotFound => FailureReason::NotFound,
            SoftMissKind::EmptyPayload => FailureReason::RegionRestriction,
            SoftMissKind::MalformedJson
            | SoftMissKind::NotAnArray
            | SoftMissKind::MissingIdentifier => FailureReason::ValidationError,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            SoftMissKind::NotFound => "item not found (404)",
            SoftMissKind::EmptyPayload => "empty product array",
            SoftMissKind::MalformedJson => "malformed json body",
            SoftMissKind::NotAnArray => "response body is not an array",
            SoftMissKind::MissingIdentifier => "payload has no workno or product_id",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Found(RawRecord),
    SoftMiss(SoftMissKind),
}

impl FetchOutcome {
    pub fn into_record(self) -> Option<RawRecord> {
        match self {
            FetchOutcome::Found(record) => Some(record),
            FetchOutcome::SoftMiss(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("access denied (403) for {item_id}")]
    AccessDenied { item_id: ItemId },
    #[error("http status {status} for {item_id}")]
    HttpStatus { status: u16, item_id: ItemId },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Identity(#[from] RotatorError),
}

impl FetchError {
    pub fn is_access_denied(&self) -> bool {
        matches!(self, FetchError::AccessDenied { .. })
    }

    pub fn failure_reason(&self) -> FailureReason {
        match self {
            FetchError::AccessDenied { .. } => FailureReason::AccessDenied,
            FetchError::HttpStatus { status: 408 | 504, .. } => FailureReason::Timeout,
            FetchError::HttpStatus { .. } => FailureReason::Unknown,
            FetchError::Transport(err) if err.is_timeout() => FailureReason::Timeout,
            FetchError::Transport(_) | FetchError::Identity(_) => FailureReason::Unknown,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            FetchError::Transport(err) => {
                classify_reqwest_error(err) == RetryDisposition::Retryable
            }
            FetchError::AccessDenied { .. } | FetchError::Identity(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Interprets a 2xx body: the first array element carrying an identifier, or a soft miss.
pub fn classify_body(body: &[u8]) -> FetchOutcome {
    let value: JsonValue = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => return FetchOutcome::SoftMiss(SoftMissKind::MalformedJson),
    };
    let JsonValue::Array(items) = value else {
        return FetchOutcome::SoftMiss(SoftMissKind::NotAnArray);
    };
    let Some(first) = items.into_iter().next() else {
        return FetchOutcome::SoftMiss(SoftMissKind::EmptyPayload);
    };
    match serde_json::from_value::<RawRecord>(first) {
        Ok(record) if record.has_identifier() => FetchOutcome::Found(record),
        Ok(_) => FetchOutcome::SoftMiss(SoftMissKind::MissingIdentifier),
        Err(_) => FetchOutcome::SoftMiss(SoftMissKind::MalformedJson),
    }
}

#[async_trait]
pub trait ItemFetcher: Send + Sync {
    async fn fetch_outcome(&self, item_id: &ItemId) -> Result<FetchOutcome, FetchError>;

    /// `None` for every soft miss.
    async fn fetch(&self, item_id: &ItemId) -> Result<Option<RawRecord>, FetchError> {
        Ok(self.fetch_outcome(item_id).await?.into_record())
    }
}

#[derive(Debug, Clone)]
pub struct FetchClientConfig {
    pub base_url: String,
    pub id_param: String,
    pub timeout: Duration,
    pub referer: Option<String>,
}

impl Default for FetchClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            id_param: "workno".to_string(),
            timeout: Duration::from_secs(30),
            referer: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchClient {
    http: reqwest::Client,
    config: FetchClientConfig,
    rotator: Arc<IdentityRotator>,
}

impl FetchClient {
    pub fn new(
        config: FetchClientConfig,
        rotator: Arc<IdentityRotator>,
    ) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self { http, config, rotator })
    }

    pub fn rotator(&self) -> &Arc<IdentityRotator> {
        &self.rotator
    }
}

#[async_trait]
impl ItemFetcher for FetchClient {
    async fn fetch_outcome(&self, item_id: &ItemId) -> Result<FetchOutcome, FetchError> {
        let headers = self.rotator.next_headers(self.config.referer.as_deref())?;
        let span = info_span!("item_fetch", item_id = %item_id);

        async {
            let resp = self
                .http
                .get(&self.config.base_url)
                .query(&[(self.config.id_param.as_str(), item_id.as_str())])
                .headers(headers)
                .send()
                .await?;

            let status = resp.status();
            if status == StatusCode::NOT_FOUND {
                debug!("soft miss: not found");
                return Ok(FetchOutcome::SoftMiss(SoftMissKind::NotFound));
            }
            if status == StatusCode::FORBIDDEN {
                warn!("access denied; possible anti-bot lockout");
                return Err(FetchError::AccessDenied {
                    item_id: item_id.clone(),
                });
            }
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    item_id: item_id.clone(),
                });
            }

            let body = resp.bytes().await?;
            let outcome = classify_body(&body);
            if let FetchOutcome::SoftMiss(kind) = &outcome {
                debug!(kind = kind.describe(), "soft miss");
            }
            Ok(outcome)
        }
        .instrument(span)
        .await
    }
}

pub type RetryPredicate = fn(&Result<FetchOutcome, FetchError>) -> bool;

/// Bounded retry for the slow recovery tier.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub delay: Duration,
    pub retryable: RetryPredicate,
}

impl RetryPolicy {
    pub fn manual() -> Self {
        Self {
            max_retries: 2,
            delay: Duration::from_secs(1),
            retryable: transient_or_malformed,
        }
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::manual()
        }
    }

    pub fn should_retry(&self, attempt: usize, result: &Result<FetchOutcome, FetchError>) -> bool {
        attempt < self.max_retries && (self.retryable)(result)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::manual()
    }
}

/// 429/5xx, timeouts, connect errors and malformed bodies. Never 403 or 404.
pub fn transient_or_malformed(result: &Result<FetchOutcome, FetchError>) -> bool {
    match result {
        Ok(FetchOutcome::SoftMiss(SoftMissKind::MalformedJson)) => true,
        Ok(_) => false,
        Err(err) => err.is_transient(),
    }
}

pub struct RetryingFetcher<F> {
    inner: F,
    policy: RetryPolicy,
}

impl<F: ItemFetcher> RetryingFetcher<F> {
    pub fn new(inner: F, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<F: ItemFetcher> ItemFetcher for RetryingFetcher<F> {
    async fn fetch_outcome(&self, item_id: &ItemId) -> Result<FetchOutcome, FetchError> {
        let mut attempt = 0;
        loop {
            let result = self.inner.fetch_outcome(item_id).await;
            if !self.policy.should_retry(attempt, &result) {
                return result;
            }
            attempt += 1;
            debug!(item_id = %item_id, attempt, "retrying fetch");
            tokio::time::sleep(self.policy.delay).await;
        }
    }
}
