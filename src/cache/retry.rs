//! Bounded retry with exponential back-off and full jitter
//!
//! Read paths (cache, DB, analytics pulls) retry a fixed number of
//! times; write paths never do, since idempotency keys make client
//! retries safe.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::{Error, Result};

/// Run `op` up to `attempts` times, sleeping an exponentially growing
/// jittered delay between failures
///
/// # Errors
///
/// Returns `Error::FetchFailed` carrying the last failure once attempts
/// are exhausted
pub async fn with_retries<T, Fut, Op>(
    label: &str,
    attempts: usize,
    base_delay: Duration,
    mut op: Op,
) -> Result<T>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut last_error = String::new();

    for attempt in 0..attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_error = e.to_string();
                if attempt + 1 < attempts {
                    let delay = jittered(base_delay, attempt);
                    tracing::warn!(
                        op = label,
                        attempt = attempt + 1,
                        error = %last_error,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(Error::FetchFailed(format!(
        "{label}: {attempts} attempts exhausted: {last_error}"
    )))
}

/// Full jitter over an exponential ceiling: `rand(0..=base * 2^attempt)`
fn jittered(base: Duration, attempt: usize) -> Duration {
    let ceiling = base.saturating_mul(1u32 << attempt.min(16));
    let millis = ceiling.as_millis().max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_first_success_returns_immediately() {
        let calls = AtomicUsize::new(0);
        let result = with_retries("test", 3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, Error>(42) }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let calls = AtomicUsize::new(0);
        let result = with_retries("test", 3, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Cache("transient".to_string()))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_fetch_failed() {
        let err = with_retries("test", 2, Duration::from_millis(1), || async {
            Err::<(), _>(Error::Cache("down".to_string()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::FetchFailed(_)));
        assert!(err.to_string().contains("down"));
    }
}
