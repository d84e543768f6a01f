//! Per-session locks.
//!
//! Clarify rounds and plan generation read a session, await the model and
//! write the session back. Holding the session's lock across that span keeps
//! concurrent calls on one session from overwriting each other.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{AppError, AppResult};

/// Guard held while a session is being changed.
pub type SessionGuard = OwnedMutexGuard<()>;

/// Async locks keyed by clarify session id, shared by cloning.
#[derive(Debug, Clone, Default)]
pub struct SessionLocks {
    locks: Arc<Mutex<HashMap<String, Weak<Mutex<()>>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `session_id`, or fail with `Cancelled`.
    pub async fn acquire(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> AppResult<SessionGuard> {
        let lock = self.lock_for(session_id).await;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AppError::Cancelled),
            guard = lock.lock_owned() => {
                debug!(session_id = %session_id, "Session lock acquired");
                Ok(guard)
            }
        }
    }

    async fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        // Entries die with their last guard.
        locks.retain(|_, lock| lock.strong_count() > 0);
        if let Some(lock) = locks.get(session_id).and_then(Weak::upgrade) {
            return lock;
        }
        let lock = Arc::new(Mutex::new(()));
        locks.insert(session_id.to_string(), Arc::downgrade(&lock));
        lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn live(locks: &SessionLocks) -> usize {
        let map = locks.locks.lock().await;
        map.values().filter(|l| l.strong_count() > 0).count()
    }

    #[tokio::test]
    async fn test_same_session_is_exclusive() {
        let locks = SessionLocks::new();
        let cancel = CancellationToken::new();

        let guard = locks.acquire("s1", &cancel).await.unwrap();
        let waiting = tokio::time::timeout(Duration::from_millis(20), locks.acquire("s1", &cancel));
        assert!(waiting.await.is_err());

        drop(guard);
        assert!(locks.acquire("s1", &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_other_sessions_are_independent() {
        let locks = SessionLocks::new();
        let cancel = CancellationToken::new();

        let _a = locks.acquire("a", &cancel).await.unwrap();
        let _b = locks.acquire("b", &cancel).await.unwrap();
        assert_eq!(live(&locks).await, 2);
    }

    #[tokio::test]
    async fn test_released_locks_are_pruned() {
        let locks = SessionLocks::new();
        let cancel = CancellationToken::new();

        drop(locks.acquire("a", &cancel).await.unwrap());
        assert_eq!(live(&locks).await, 0);
    }

    #[tokio::test]
    async fn test_cancelled_wait() {
        let locks = SessionLocks::new();
        let cancel = CancellationToken::new();
        let _held = locks.acquire("a", &cancel).await.unwrap();

        let waiter = CancellationToken::new();
        waiter.cancel();
        let err = locks.acquire("a", &waiter).await.unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
    }
}
