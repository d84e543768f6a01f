//! Cancellation and operation deadlines.
//!
//! Every pipeline operation receives a [`CancellationToken`]. Suspension
//! points are wrapped with [`with_deadline`] so a cancelled token or an
//! expired deadline drops the in-flight future, which aborts HTTP calls and
//! rolls back uncommitted transactions.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, AppResult};

/// Race `future` against `token` and a `timeout_ms` deadline.
pub async fn with_deadline<F, T, E>(
    token: &CancellationToken,
    timeout_ms: u64,
    future: F,
) -> AppResult<T>
where
    F: Future<Output = Result<T, E>>,
    AppError: From<E>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(AppError::Cancelled),
        result = tokio::time::timeout(Duration::from_millis(timeout_ms), future) => match result {
            Ok(inner) => inner.map_err(AppError::from),
            Err(_) => Err(AppError::Timeout { timeout_ms }),
        },
    }
}

/// Race `future` against `token` only.
pub async fn cancellable<F, T, E>(token: &CancellationToken, future: F) -> AppResult<T>
where
    F: Future<Output = Result<T, E>>,
    AppError: From<E>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(AppError::Cancelled),
        result = future => result.map_err(AppError::from),
    }
}

/// Sleep for `delay`, returning early with `Cancelled` if the token fires.
pub async fn sleep(token: &CancellationToken, delay: Duration) -> AppResult<()> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(AppError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let token = CancellationToken::new();
        let result: AppResult<()> = with_deadline(&token, 60_000, async {
            tokio::time::sleep(Duration::from_secs(61)).await;
            Ok::<_, LlmError>(())
        })
        .await;
        assert!(matches!(result, Err(AppError::Timeout { timeout_ms: 60_000 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_wins_over_pending_future() {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            child.cancel();
        });
        let result: AppResult<()> = with_deadline(&token, 60_000, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, LlmError>(())
        })
        .await;
        assert!(matches!(result, Err(AppError::Cancelled)));
    }

    #[tokio::test]
    async fn test_inner_error_is_converted() {
        let token = CancellationToken::new();
        let result: AppResult<()> = cancellable(&token, async {
            Err(LlmError::SchemaValidation {
                message: "bad".into(),
            })
        })
        .await;
        assert!(matches!(
            result,
            Err(AppError::Llm(LlmError::SchemaValidation { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes() {
        let token = CancellationToken::new();
        assert!(sleep(&token, Duration::from_millis(500)).await.is_ok());
        token.cancel();
        assert!(matches!(
            sleep(&token, Duration::from_secs(5)).await,
            Err(AppError::Cancelled)
        ));
    }
}
