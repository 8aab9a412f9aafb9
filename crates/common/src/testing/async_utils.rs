//! Polling helper for async tests

use std::future::Future;
use std::time::Duration;

/// Poll an async condition until it returns true or times out
///
/// Uses the tokio clock, so it also works under `tokio::time::pause()`.
pub async fn poll_until<F, Fut>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();

    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }

    condition().await
}

#[cfg(test)]
mod tests {
    //! Unit tests for testing::async_utils.
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;

    /// Validates the poll until succeeds scenario.
    #[tokio::test(start_paused = true)]
    async fn test_poll_until_succeeds() {
        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = Arc::clone(&flag);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag_clone.store(true, Ordering::SeqCst);
        });

        let result = poll_until(Duration::from_secs(1), Duration::from_millis(10), || {
            let flag = Arc::clone(&flag);
            async move { flag.load(Ordering::SeqCst) }
        })
        .await;

        assert!(result);
    }

    /// Validates the poll until gives up scenario.
    #[tokio::test(start_paused = true)]
    async fn test_poll_until_times_out() {
        let result =
            poll_until(Duration::from_millis(50), Duration::from_millis(10), || async { false })
                .await;
        assert!(!result);
    }
}
