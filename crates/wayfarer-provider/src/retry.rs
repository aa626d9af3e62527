use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time;

use crate::{LlmProvider, LlmRequest, LlmResponse};

const BASE_BACKOFF_MS: u64 = 500;

pub(crate) fn is_retryable(err: &anyhow::Error) -> bool {
    err.to_string().contains("[retryable]")
}

/// Wraps a provider and retries failures tagged `[retryable]` with
/// exponential backoff. Non-retryable failures are returned immediately.
pub struct RetryingProvider<P> {
    inner: P,
    max_retries: u32,
    base_backoff: Duration,
}

impl<P: LlmProvider> RetryingProvider<P> {
    pub fn new(inner: P, max_retries: u32) -> Self {
        Self {
            inner,
            max_retries,
            base_backoff: Duration::from_millis(BASE_BACKOFF_MS),
        }
    }

    pub fn with_base_backoff(mut self, base: Duration) -> Self {
        self.base_backoff = base;
        self
    }
}

#[async_trait]
impl<P: LlmProvider> LlmProvider for RetryingProvider<P> {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        let mut attempts = 0u32;
        loop {
            match self.inner.chat(request.clone()).await {
                Ok(resp) => return Ok(resp),
                Err(err) if is_retryable(&err) && attempts < self.max_retries => {
                    attempts += 1;
                    let backoff = self.base_backoff * (1 << (attempts - 1));
                    tracing::warn!(
                        attempt = attempts,
                        max_retries = self.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "provider retryable error, backing off: {err}"
                    );
                    time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn health(&self) -> Result<()> {
        self.inner.health().await
    }
}
