use std::{future::Future, time::Duration};

use tracing::warn;

use crate::{error::ControllerError, state::Operation};

/// Attempts per remote call. The default is a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    pub fn attempts(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

/// Runs `call` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are spent.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: Operation,
    mut call: F,
) -> Result<T, ControllerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ControllerError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < max_attempts && error.is_transient() => {
                warn!(
                    operation = operation.as_str(),
                    attempt,
                    max_attempts,
                    %error,
                    "transient failure; retrying"
                );
                tokio::time::sleep(policy.backoff).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
