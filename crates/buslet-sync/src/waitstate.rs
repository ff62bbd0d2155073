//! Versioned state register with predicate waits.
//!
//! Every [`WaitState::set`] bumps a monotonic update counter and releases
//! all waiters, which re-evaluate their predicate against the new value.

use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError<T> {
    #[error("wait state is closed")]
    Closed,
    /// The caller's cancellation token fired. Carries the last observed
    /// count and value so the caller can resume from where it left off.
    #[error("wait cancelled")]
    Cancelled { count: u64, value: T },
}

struct Inner<T> {
    value: T,
    update_count: u64,
    closed: bool,
}

/// A value cell whose updates can be awaited.
pub struct WaitState<T> {
    inner: Mutex<Inner<T>>,
    update: Notify,
}

impl<T: Clone> WaitState<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Mutex::new(Inner {
                value: initial,
                update_count: 0,
                closed: false,
            }),
            update: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs a new value, increments the update counter and releases all
    /// waiters.
    pub fn set(&self, value: T) {
        let mut inner = self.lock();
        inner.value = value;
        inner.update_count += 1;
        drop(inner);
        self.update.notify_waiters();
    }

    /// Marks the state closed and releases all waiters with
    /// [`WaitError::Closed`].
    pub fn close(&self) {
        self.lock().closed = true;
        self.update.notify_waiters();
    }

    /// Waits until `check(count, value)` holds and returns that observation.
    ///
    /// The check runs against the current state first, so a condition that
    /// already holds returns without suspending.
    pub async fn get<F>(
        &self,
        cancel: &CancellationToken,
        check: F,
    ) -> Result<(u64, T), WaitError<T>>
    where
        F: Fn(u64, &T) -> bool,
    {
        loop {
            let notified = self.update.notified();
            tokio::pin!(notified);

            let (count, value) = {
                let inner = self.lock();
                if inner.closed {
                    return Err(WaitError::Closed);
                }

                if check(inner.update_count, &inner.value) {
                    return Ok((inner.update_count, inner.value.clone()));
                }

                // Register before releasing the lock so a concurrent set()
                // cannot complete unseen.
                notified.as_mut().enable();
                (inner.update_count, inner.value.clone())
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(WaitError::Cancelled { count, value });
                }
                _ = &mut notified => {}
            }
        }
    }

    /// Returns the current `(count, value)` without waiting on a predicate.
    pub async fn get_current(&self, cancel: &CancellationToken) -> Result<(u64, T), WaitError<T>> {
        self.get(cancel, |_, _| true).await
    }

    /// Waits for any update newer than `last_count`.
    pub async fn get_newer(
        &self,
        cancel: &CancellationToken,
        last_count: u64,
    ) -> Result<(u64, T), WaitError<T>> {
        self.get(cancel, |count, _| count > last_count).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn set_increments_count() {
        let ws = WaitState::new(0u32);
        let cancel = CancellationToken::new();

        let (count, value) = ws.get_current(&cancel).await.unwrap();
        assert_eq!((count, value), (0, 0));

        ws.set(5);
        let (count, value) = ws.get_current(&cancel).await.unwrap();
        assert_eq!((count, value), (1, 5));

        ws.set(7);
        ws.set(7);
        let (count, value) = ws.get_current(&cancel).await.unwrap();
        assert_eq!((count, value), (3, 7));
    }

    #[tokio::test]
    async fn get_newer_wakes_on_update() {
        let ws = Arc::new(WaitState::new(String::from("idle")));
        let cancel = CancellationToken::new();

        let (count, _) = ws.get_current(&cancel).await.unwrap();

        let setter = Arc::clone(&ws);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            setter.set(String::from("armed"));
        });

        let (new_count, value) = ws.get_newer(&cancel, count).await.unwrap();
        assert!(new_count > count);
        assert_eq!(value, "armed");
    }

    #[tokio::test]
    async fn predicate_sees_every_observation_monotonically() {
        let ws = Arc::new(WaitState::new(0u32));
        let cancel = CancellationToken::new();

        let setter = Arc::clone(&ws);
        tokio::spawn(async move {
            for i in 1..=10u32 {
                setter.set(i);
                tokio::task::yield_now().await;
            }
        });

        let mut last_count = 0;
        loop {
            let (count, value) = ws.get_newer(&cancel, last_count).await.unwrap();
            assert!(count > last_count);
            last_count = count;
            if value == 10 {
                break;
            }
        }
    }

    #[tokio::test]
    async fn close_releases_waiters() {
        let ws = Arc::new(WaitState::new(0u32));
        let cancel = CancellationToken::new();

        let waiter_ws = Arc::clone(&ws);
        let waiter = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            waiter_ws.get(&cancel, |_, v| *v == 99).await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        ws.close();

        assert_eq!(waiter.await.unwrap(), Err(WaitError::Closed));
        assert_eq!(ws.get_current(&cancel).await, Err(WaitError::Closed));
    }

    #[tokio::test]
    async fn cancel_returns_last_observation() {
        let ws = WaitState::new(3u32);
        ws.set(4);

        let cancel = CancellationToken::new();
        cancel.cancel();

        match ws.get(&cancel, |_, _| false).await {
            Err(WaitError::Cancelled { count, value }) => {
                assert_eq!(count, 1);
                assert_eq!(value, 4);
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
    }
}
