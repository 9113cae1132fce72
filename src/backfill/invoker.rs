// ABOUTME: Batch invoker: one remote batch call under a timeout with connection retries
// ABOUTME: Refreshes the bearer token between attempts so long waits never reuse a stale one

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::retry::ConnectionRetryPolicy;
use crate::auth::TokenProvider;
use crate::error::InvokeError;
use crate::remote::BatchResult;

/// A remote processor that handles one batch per call.
#[async_trait]
pub trait BatchEndpoint: Send + Sync {
    async fn invoke(
        &self,
        function: &str,
        body: &Value,
        token: &str,
    ) -> Result<BatchResult, InvokeError>;
}

#[derive(Debug, Clone, Copy)]
pub struct InvokeOptions {
    pub timeout: Duration,
    pub retry: ConnectionRetryPolicy,
}

pub struct BatchInvoker {
    endpoint: Arc<dyn BatchEndpoint>,
    tokens: Arc<dyn TokenProvider>,
}

impl BatchInvoker {
    pub fn new(endpoint: Arc<dyn BatchEndpoint>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self { endpoint, tokens }
    }

    /// Invoke `function` once, retrying transient failures.
    ///
    /// `token` is replaced in place whenever a retry obtains a fresher one, so
    /// the caller keeps using the newest token for later batches.
    pub async fn invoke(
        &self,
        function: &str,
        body: &Value,
        token: &mut String,
        options: &InvokeOptions,
    ) -> Result<BatchResult, InvokeError> {
        let mut attempt = 0;

        loop {
            let call = self.endpoint.invoke(function, body, token.as_str());
            let result = match timeout(options.timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(InvokeError::Timeout(options.timeout)),
            };

            let err = match result {
                Ok(batch) => return Ok(batch),
                Err(err) => err,
            };
            if !options.retry.should_retry(attempt, &err) {
                return Err(err);
            }

            let delay = options.retry.delay(attempt);
            warn!(
                function,
                attempt = attempt + 1,
                max_retries = options.retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Batch call failed, retrying: {}",
                err
            );
            sleep(delay).await;

            match self.tokens.fresh_token().await {
                Some(fresh) => *token = fresh,
                None => debug!("Token refresh before retry failed, keeping current token"),
            }
            attempt += 1;
        }
    }
}
