use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Failure of a call to an external embedding or language-model provider.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("transport error: {message}")]
    Transport { message: String, transient: bool },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Timeouts, connection failures, 429 and 5xx may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Transport { transient, .. } => *transient,
            ProviderError::Timeout(_) => true,
            ProviderError::Status { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Malformed(_) => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return ProviderError::Malformed(err.to_string());
        }
        ProviderError::Transport {
            transient: err.is_timeout() || err.is_connect(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after the first one; zero means fail fast.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Deadline for a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize, attempt_timeout: Duration) -> Self {
        Self { max_retries, attempt_timeout, ..Self::default() }
    }

    /// Runs `operation` under the per-attempt timeout, retrying transient failures
    /// with exponential backoff and jitter.
    pub async fn run<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let outcome = match timeout(self.attempt_timeout, operation()).await {
                Ok(res) => res,
                Err(_) => Err(ProviderError::Timeout(self.attempt_timeout)),
            };
            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = operation_name, attempt, "provider call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt <= self.max_retries => {
                    let delay = self.delay_for(attempt);
                    warn!(operation = operation_name, attempt, error = %err, ?delay, "transient provider failure, retrying");
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exp = self.base_delay.as_millis() as f64 * 2f64.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        // +/-25% jitter
        let jitter = (rand::random::<f64>() - 0.5) * 0.5 * capped;
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}
