//! Named advisory locks.
//!
//! Locks are keyed by caller-chosen names such as `klines:BTCUSDT:1h` and only
//! exclude holders of the same name. They are independent of step claims and
//! exist to serialize side effects on external systems.

use async_trait::async_trait;
use skein_core::{CoreError, CoreResult};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Named, timeout-bounded mutual exclusion
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Take `name`, waiting at most `timeout`
    ///
    /// Returns `false` if the lock is still held when the timeout elapses.
    async fn acquire(&self, name: &str, timeout: Duration) -> CoreResult<bool>;

    /// Release `name`; returns whether it was held
    fn release(&self, name: &str) -> CoreResult<bool>;
}

/// Process-local lock table
#[derive(Default)]
pub struct InMemoryLocks {
    held: Mutex<HashSet<String>>,
    released: Notify,
}

impl InMemoryLocks {
    /// Create an empty lock table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn try_take(&self, name: &str) -> CoreResult<bool> {
        let mut held = self.held.lock().map_err(|_| CoreError::Internal {
            message: "lock table poisoned".to_string(),
        })?;
        Ok(held.insert(name.to_string()))
    }

    /// Whether `name` is currently held
    #[must_use]
    pub fn is_held(&self, name: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(name))
            .unwrap_or(false)
    }
}

#[async_trait]
impl LockManager for InMemoryLocks {
    async fn acquire(&self, name: &str, timeout: Duration) -> CoreResult<bool> {
        // No deadline when the timeout reaches past what an Instant can hold.
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        loop {
            // Register interest before checking, so a release between the
            // check and the wait is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_take(name)? {
                debug!(lock = name, "lock acquired");
                return Ok(true);
            }

            let timed_out = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, notified).await.is_err(),
                None => {
                    notified.await;
                    false
                }
            };
            if timed_out {
                let taken = self.try_take(name)?;
                if !taken {
                    debug!(lock = name, ?timeout, "lock wait timed out");
                }
                return Ok(taken);
            }
        }
    }

    fn release(&self, name: &str) -> CoreResult<bool> {
        let removed = {
            let mut held = self.held.lock().map_err(|_| CoreError::Internal {
                message: "lock table poisoned".to_string(),
            })?;
            held.remove(name)
        };
        if removed {
            debug!(lock = name, "lock released");
            self.released.notify_waiters();
        }
        Ok(removed)
    }
}

/// Scoped hold on a named lock; released on drop
pub struct LockGuard {
    manager: Arc<dyn LockManager>,
    name: String,
    released: bool,
}

impl LockGuard {
    /// Lock name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release now instead of at drop
    ///
    /// # Errors
    ///
    /// Returns error if the lock table is unavailable
    pub fn release(mut self) -> CoreResult<()> {
        self.released = true;
        self.manager.release(&self.name).map(|_| ())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = self.manager.release(&self.name) {
                warn!(lock = %self.name, error = %err, "failed to release lock");
            }
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("name", &self.name).finish()
    }
}

/// Take `name` as a scoped guard
///
/// `Ok(None)` means the wait timed out.
///
/// # Errors
///
/// Returns error if the lock backend fails
pub async fn lock(
    manager: &Arc<dyn LockManager>,
    name: &str,
    timeout: Duration,
) -> CoreResult<Option<LockGuard>> {
    if manager.acquire(name, timeout).await? {
        Ok(Some(LockGuard {
            manager: Arc::clone(manager),
            name: name.to_string(),
            released: false,
        }))
    } else {
        Ok(None)
    }
}

/// Run `body` while holding `name`
///
/// The lock is released on every exit path, including an error from `body`.
///
/// # Errors
///
/// Returns `LockTimeout` if the lock could not be taken, otherwise whatever
/// `body` returns
pub async fn with_lock<F, T>(
    manager: &Arc<dyn LockManager>,
    name: &str,
    timeout: Duration,
    body: F,
) -> Result<T, crate::unit::UnitError>
where
    F: Future<Output = Result<T, crate::unit::UnitError>>,
{
    let guard = lock(manager, name, timeout)
        .await?
        .ok_or_else(|| crate::unit::UnitError::LockTimeout {
            name: name.to_string(),
            timeout,
        })?;
    let out = body.await;
    drop(guard);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::UnitError;

    fn manager() -> Arc<dyn LockManager> {
        Arc::new(InMemoryLocks::new())
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let locks = InMemoryLocks::new();
        assert!(locks.acquire("K", Duration::from_millis(10)).await.unwrap());
        assert!(locks.is_held("K"));
        assert!(locks.release("K").unwrap());
        assert!(!locks.is_held("K"));
        assert!(!locks.release("K").unwrap());
    }

    #[tokio::test]
    async fn test_unbounded_timeout() {
        let locks = Arc::new(InMemoryLocks::new());
        assert!(locks.acquire("K", Duration::MAX).await.unwrap());

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire("K", Duration::MAX).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        locks.release("K").unwrap();

        assert!(waiter.await.unwrap().unwrap());
        assert!(locks.is_held("K"));
    }

    #[tokio::test]
    async fn test_unrelated_keys_do_not_block() {
        let locks = InMemoryLocks::new();
        assert!(locks.acquire("klines:BTCUSDT:1h", Duration::ZERO).await.unwrap());
        assert!(locks.acquire("klines:BTCUSDT:4h", Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn test_second_acquire_times_out() {
        let locks = InMemoryLocks::new();
        assert!(locks.acquire("K", Duration::ZERO).await.unwrap());
        assert!(!locks.acquire("K", Duration::from_millis(20)).await.unwrap());
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let locks = Arc::new(InMemoryLocks::new());
        assert!(locks.acquire("K", Duration::ZERO).await.unwrap());

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire("K", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        locks.release("K").unwrap();

        assert!(waiter.await.unwrap().unwrap());
        assert!(locks.is_held("K"));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_is_exclusive() {
        let locks = Arc::new(InMemoryLocks::new());
        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                tokio::spawn(async move { locks.acquire("K", Duration::ZERO).await.unwrap() })
            })
            .collect();

        let mut winners = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let locks = manager();
        {
            let guard = lock(&locks, "K", Duration::ZERO).await.unwrap();
            assert!(guard.is_some());
            assert!(lock(&locks, "K", Duration::ZERO).await.unwrap().is_none());
        }
        assert!(lock(&locks, "K", Duration::ZERO).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let locks = manager();
        let result: Result<(), UnitError> = with_lock(&locks, "K", Duration::ZERO, async {
            Err(UnitError::msg("exchange rejected order"))
        })
        .await;
        assert!(result.is_err());
        assert!(locks.acquire("K", Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn test_with_lock_timeout() {
        let locks = manager();
        assert!(locks.acquire("K", Duration::ZERO).await.unwrap());
        let result = with_lock(&locks, "K", Duration::from_millis(5), async { Ok(1) }).await;
        assert!(matches!(result, Err(UnitError::LockTimeout { .. })));
    }
}
