use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Applies to each attempt separately.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrent_fetches: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            max_concurrent_fetches: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("empty response body from {url}")]
    EmptyBody { url: String },
    #[error("unexpected content type {content_type:?} from {url}")]
    UnexpectedContentType { content_type: String, url: String },
    #[error("no content type sent by {url}")]
    MissingContentType { url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::EmptyBody { .. } => RetryDisposition::Retryable,
            FetchError::UnexpectedContentType { .. }
            | FetchError::MissingContentType { .. }
            | FetchError::Closed => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.max_concurrent_fetches.max(1))),
            backoff: config.backoff,
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// GET `url`, retrying transient failures with capped exponential backoff.
    ///
    /// A success must carry a non-empty body and, when `accepted_types` is
    /// non-empty, a `Content-Type` naming one of those media types. Nothing
    /// is kept between attempts.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        category: &str,
        url: &str,
        accepted_types: &[String],
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", %run_id, category, url);
        async {
            let mut attempt = 0;
            loop {
                let err = match self.attempt(url, accepted_types).await {
                    Ok(response) => return Ok(response),
                    Err(err) => err,
                };
                if err.disposition() == RetryDisposition::NonRetryable
                    || attempt >= self.backoff.max_retries
                {
                    return Err(err);
                }
                let delay = self.backoff.delay_for_attempt(attempt);
                warn!(attempt, ?delay, error = %err, "transient fetch failure; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt(
        &self,
        url: &str,
        accepted_types: &[String],
    ) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        match &content_type {
            Some(content_type) if !content_type_accepted(content_type, accepted_types) => {
                return Err(FetchError::UnexpectedContentType {
                    content_type: content_type.clone(),
                    url: final_url,
                });
            }
            None if !accepted_types.is_empty() => {
                return Err(FetchError::MissingContentType { url: final_url });
            }
            _ => {}
        }

        let body = resp.bytes().await?.to_vec();
        if body.is_empty() {
            return Err(FetchError::EmptyBody { url: final_url });
        }

        Ok(FetchedResponse {
            status,
            final_url,
            content_type,
            body,
        })
    }
}

fn content_type_accepted(content_type: &str, accepted: &[String]) -> bool {
    if accepted.is_empty() {
        return true;
    }
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    accepted
        .iter()
        .any(|a| a.trim().eq_ignore_ascii_case(&media_type))
}
