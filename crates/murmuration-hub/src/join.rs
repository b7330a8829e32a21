use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;

/// Default window an Edge gets between receiving a granted token and
/// confirming it; a lock nobody confirms in time is released automatically.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(60);
/// How long a queued `requestJoin` call will wait for the lock ahead of it
/// to free up before giving up.
pub const QUEUE_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Serializes cluster joins: at most one Edge holds the lock at a time.
/// Concurrent `requestJoin` calls queue FIFO behind it; a held lock that
/// times out (or is explicitly released on confirm/cancel) hands itself to
/// the next waiter.
pub struct JoinCoordinator {
    next_token: AtomicU64,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    holder: Option<u64>,
    waiters: VecDeque<oneshot::Sender<u64>>,
}

#[derive(Debug)]
pub enum JoinError {
    /// Timed out waiting in the queue for the lock to free up.
    QueueTimedOut,
}

impl JoinCoordinator {
    pub fn new() -> Self {
        Self {
            next_token: AtomicU64::new(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Acquire the join lock, queuing behind the current holder if any.
    /// Resolves to the token the caller must present to [`release`] (via
    /// `confirmJoin`) before [`JOIN_TIMEOUT`] elapses.
    pub async fn acquire(&self) -> Result<u64, JoinError> {
        let rx = {
            let mut inner = self.inner.lock().await;
            if inner.holder.is_none() {
                let token = self.next_token.fetch_add(1, Ordering::SeqCst);
                inner.holder = Some(token);
                return Ok(token);
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(tx);
            rx
        };

        match timeout(QUEUE_WAIT_TIMEOUT, rx).await {
            Ok(Ok(token)) => Ok(token),
            _ => Err(JoinError::QueueTimedOut),
        }
    }

    /// Release the lock if `token` is still the current holder, and grant
    /// it to the next queued waiter. A no-op if `token` already lost the
    /// lock (e.g. the join timeout fired first) — safe to call from both
    /// `confirmJoin` and the timeout watchdog without coordinating between
    /// them.
    pub async fn release(&self, token: u64) {
        let mut inner = self.inner.lock().await;
        if inner.holder != Some(token) {
            return;
        }
        loop {
            let Some(waiter) = inner.waiters.pop_front() else {
                inner.holder = None;
                return;
            };
            let next_token = self.next_token.fetch_add(1, Ordering::SeqCst);
            if waiter.send(next_token).is_ok() {
                inner.holder = Some(next_token);
                return;
            }
            // Waiter's own queue wait already timed out; try the next one.
        }
    }
}

impl Default for JoinCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_queues_until_release() {
        let coord = std::sync::Arc::new(JoinCoordinator::new());
        let first = coord.acquire().await.unwrap();

        let coord2 = std::sync::Arc::clone(&coord);
        let second = tokio::spawn(async move { coord2.acquire().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        coord.release(first).await;
        let second_token = second.await.unwrap().unwrap();
        assert_ne!(first, second_token);
    }

    #[tokio::test]
    async fn release_of_stale_token_is_a_no_op() {
        let coord = JoinCoordinator::new();
        let first = coord.acquire().await.unwrap();
        coord.release(first).await;
        // Releasing the same token again must not resurrect a holder.
        coord.release(first).await;
        // The lock should be free: a fresh acquire grants immediately.
        assert!(coord.acquire().await.is_ok());
    }
}
