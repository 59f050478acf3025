use std::time::Duration;

use tracing::{error, warn};

use banter_db::StoreError;

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Run a blocking storage closure off the async runtime.
pub async fn run_blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StoreError::Poisoned
    })?
}

/// Retry an operation on transient storage contention. The backoff doubles
/// per attempt and the attempt count is bounded, so contention degrades to
/// an error instead of livelocking. Non-transient errors return at once.
pub async fn with_backoff<T, Fut, F>(mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut delay = INITIAL_BACKOFF;
    let mut attempt = 1;

    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                warn!(
                    "Transient storage error (attempt {}/{}): {}",
                    attempt, MAX_ATTEMPTS, e
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let attempts = AtomicU32::new(0);

        let result = with_backoff(|| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StoreError::Busy)
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bounded_attempts() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), _> = with_backoff(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Busy) }
        })
        .await;

        assert!(matches!(result, Err(StoreError::Busy)));
        assert_eq!(attempts.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn non_transient_errors_fail_fast() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), _> = with_backoff(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Duplicate) }
        })
        .await;

        assert!(matches!(result, Err(StoreError::Duplicate)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
