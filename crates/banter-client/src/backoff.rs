use std::time::Duration;

use tracing::warn;

const MAX_ATTEMPTS: u32 = 4;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Retry an operation with bounded exponential backoff. The attempt count
/// is capped so a dead relay degrades to an error instead of livelocking;
/// the final error is returned unchanged.
pub async fn with_backoff<T, E, Fut, F>(op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_backoff_if(op, |_| true).await
}

/// Like [`with_backoff`], but only errors matching `retryable` are retried;
/// anything else surfaces immediately.
pub async fn with_backoff_if<T, E, Fut, F, P>(mut op: F, retryable: P) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut delay = INITIAL_BACKOFF;
    let mut attempt = 1;

    loop {
        match op().await {
            Err(e) if retryable(&e) && attempt < MAX_ATTEMPTS => {
                warn!("Attempt {}/{} failed: {}", attempt, MAX_ATTEMPTS, e);
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
    async fn succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);

        let result: Result<u32, String> = with_backoff(|| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("not yet".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn is_bounded() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), String> = with_backoff(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err("still down".to_string()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn non_retryable_errors_surface_immediately() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), String> = with_backoff_if(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal".to_string()) }
            },
            |e| e != "fatal",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
