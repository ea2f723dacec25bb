use std::{future::Future, time::Duration};

use bytes::Bytes;
use reqwest::{Response, StatusCode, Url};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{HozonError, HozonResult},
    util::http::HttpClient,
};

/// How many times a request is attempted and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Delay before the second attempt. Doubles after every failure.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }

    /// Delay after the failed attempt `attempt`, which starts at 0.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Performs GET requests with bounded retry, aborting as soon as the token is cancelled.
#[derive(Clone)]
pub struct SegmentFetcher {
    client: HttpClient,
    retry: RetryPolicy,
}

impl SegmentFetcher {
    pub fn new(client: HttpClient, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    /// Fetch the whole body as bytes.
    pub async fn fetch_bytes(&self, url: &Url, cancel: &CancellationToken) -> HozonResult<Bytes> {
        self.with_retry(url, cancel, || async move {
            let response = self.send(url).await?;
            Ok(response.bytes().await?)
        })
        .await
    }

    /// Fetch the whole body decoded as text.
    pub async fn fetch_text(&self, url: &Url, cancel: &CancellationToken) -> HozonResult<String> {
        self.with_retry(url, cancel, || async move {
            let response = self.send(url).await?;
            Ok(response.text().await?)
        })
        .await
    }

    /// Open a successful response without reading its body, for streaming.
    pub async fn open(&self, url: &Url, cancel: &CancellationToken) -> HozonResult<Response> {
        self.with_retry(url, cancel, || self.send(url)).await
    }

    async fn send(&self, url: &Url) -> HozonResult<Response> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(HozonError::HttpError(status));
        }
        Ok(response)
    }

    async fn with_retry<T, F, Fut>(
        &self,
        url: &Url,
        cancel: &CancellationToken,
        request: F,
    ) -> HozonResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = HozonResult<T>>,
    {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(HozonError::Cancelled);
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(HozonError::Cancelled),
                result = request() => result,
            };
            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if attempt + 1 >= attempts {
                tracing::error!("Fetching {url} failed after {attempts} attempt(s): {error}");
                return Err(error);
            }

            let delay = self.retry.delay(attempt);
            tracing::warn!(
                "Fetching {url} failed, retry in {:.1}s. {error}",
                delay.as_secs_f32()
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(HozonError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
