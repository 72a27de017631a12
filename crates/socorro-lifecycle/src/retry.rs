use crate::config::RetryPolicy;
use crate::error::{LifecycleError, LifecycleResult};
use socorro_store::StoreResult;
use std::future::Future;

/// Runs `call` until it succeeds, fails permanently, or the policy is exhausted.
///
/// Only errors classified transient by the store are retried.
pub(crate) async fn with_store_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut call: F,
) -> LifecycleResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_after(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient record store failure; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(LifecycleError::from_store(error, attempt)),
        }
    }
}
