//! Idempotent triggered handler with join semantics.
//!
//! The handler runs at most once per `reset` cycle, no matter how many
//! tasks call [`Once::wait`] or [`Once::trigger`] concurrently. All waiters
//! observe completion before returning.

use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OnceError {
    #[error("wait cancelled")]
    Cancelled,
}

#[derive(Default)]
struct State {
    running: bool,
    done: bool,
}

/// A run-once gate around a handler function.
pub struct Once {
    handler: Box<dyn Fn() + Send + Sync>,
    state: Mutex<State>,
    done_notify: Notify,
}

impl Once {
    pub fn new(handler: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            state: Mutex::new(State::default()),
            done_notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs the handler with the lock released, then marks completion and
    /// wakes everyone parked in `wait`.
    fn run_handler(&self) {
        (self.handler)();

        let mut state = self.lock();
        state.running = false;
        state.done = true;
        drop(state);

        self.done_notify.notify_waiters();
    }

    /// Waits for the handler to have completed, starting it if nobody has.
    ///
    /// The caller that finds the handler idle executes it in place; everyone
    /// else suspends until that execution finishes.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), OnceError> {
        let notified = self.done_notify.notified();
        tokio::pin!(notified);

        {
            let mut state = self.lock();
            if state.done {
                return Ok(());
            }

            if !state.running {
                state.running = true;
                drop(state);
                self.run_handler();
                return Ok(());
            }

            notified.as_mut().enable();
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(OnceError::Cancelled),
            _ = &mut notified => Ok(()),
        }
    }

    /// Starts the handler if it is not already running. Does not wait for
    /// other runners; returns once this call's own work (if any) is done.
    pub fn trigger(&self) {
        let mut state = self.lock();
        if state.running {
            return;
        }
        state.running = true;
        drop(state);
        self.run_handler();
    }

    /// Rearms the gate: the next `wait` or `trigger` executes the handler
    /// again.
    pub fn reset(&self) {
        self.lock().done = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_once() -> (Arc<Once>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let handler_count = Arc::clone(&count);
        let once = Arc::new(Once::new(move || {
            handler_count.fetch_add(1, Ordering::SeqCst);
        }));
        (once, count)
    }

    #[tokio::test]
    async fn wait_runs_handler_once() {
        let (once, count) = counting_once();
        let cancel = CancellationToken::new();

        once.wait(&cancel).await.unwrap();
        once.wait(&cancel).await.unwrap();
        once.wait(&cancel).await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reset_rearms() {
        let (once, count) = counting_once();
        let cancel = CancellationToken::new();

        once.wait(&cancel).await.unwrap();
        once.reset();
        once.wait(&cancel).await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn trigger_runs_when_idle() {
        let (once, count) = counting_once();

        once.trigger();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Trigger ignores the done flag; only `running` gates it.
        once.trigger();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_waiters_observe_single_run() {
        let count = Arc::new(AtomicUsize::new(0));
        let handler_count = Arc::clone(&count);
        let once = Arc::new(Once::new(move || {
            // Make the window in which others can pile up observable.
            std::thread::sleep(std::time::Duration::from_millis(20));
            handler_count.fetch_add(1, Ordering::SeqCst);
        }));

        let observed = Arc::clone(&count);
        let mut waiters = Vec::new();
        for _ in 0..8 {
            let once = Arc::clone(&once);
            let observed = Arc::clone(&observed);
            waiters.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                once.wait(&cancel).await.unwrap();
                // Completion must be visible to every waiter on return.
                assert_eq!(observed.load(Ordering::SeqCst), 1);
            }));
        }

        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_wait_returns_cancelled() {
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let once = Arc::new(Once::new(move || {
            started_tx.send(()).ok();
            std::thread::sleep(std::time::Duration::from_millis(50));
        }));

        // Occupy the handler so the second waiter has to park.
        let runner = Arc::clone(&once);
        let running = tokio::task::spawn_blocking(move || {
            runner.trigger();
        });
        tokio::task::spawn_blocking(move || started_rx.recv().unwrap())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(once.wait(&cancel).await, Err(OnceError::Cancelled));

        running.await.unwrap();
    }
}
