//! Elastic token circulation queue.
//!
//! Tokens circulate between an *available* channel (handed to producers)
//! and a *committed* channel (handed to the processor). A third *discard*
//! channel parks tokens that are out of circulation, either because the
//! target capacity was lowered or because the queue closed while a user
//! still held them. Each channel holds `max` tokens, so `commit` and
//! `release` can never block.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A unit of admission. `cleanup` runs exactly once, when the queue closes.
pub trait Token: Send + 'static {
    fn cleanup(&mut self);
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
    #[error("wait cancelled")]
    Cancelled,
    #[error("invalid capacity {requested} (maximum {max})")]
    InvalidCapacity { requested: usize, max: usize },
    #[error("token factory failed")]
    Factory,
}

struct State {
    closed: bool,
    target: usize,
    current: usize,
}

/// A queue of `max` tokens of which `target` circulate at any time.
pub struct Queue<T: Token> {
    state: Mutex<State>,
    max: usize,
    closed_token: CancellationToken,

    available_tx: mpsc::Sender<T>,
    available_rx: tokio::sync::Mutex<mpsc::Receiver<T>>,
    committed_tx: mpsc::Sender<T>,
    committed_rx: tokio::sync::Mutex<mpsc::Receiver<T>>,
    discard_tx: mpsc::Sender<T>,
    discard_rx: tokio::sync::Mutex<mpsc::Receiver<T>>,
}

impl<T: Token> Queue<T> {
    /// Creates a queue holding exactly `max` tokens from `factory`, with
    /// `initial` of them in circulation. A factory returning `None` aborts
    /// construction.
    pub fn new(
        max: usize,
        initial: usize,
        mut factory: impl FnMut() -> Option<T>,
    ) -> Result<Self, QueueError> {
        if max == 0 {
            return Err(QueueError::InvalidCapacity {
                requested: max,
                max: 0,
            });
        }

        let (available_tx, available_rx) = mpsc::channel(max);
        let (committed_tx, committed_rx) = mpsc::channel(max);
        let (discard_tx, discard_rx) = mpsc::channel(max);

        for _ in 0..max {
            let token = factory().ok_or(QueueError::Factory)?;
            if discard_tx.try_send(token).is_err() {
                unreachable!("discard channel is sized to hold every token");
            }
        }

        let queue = Self {
            state: Mutex::new(State {
                closed: false,
                target: 0,
                current: 0,
            }),
            max,
            closed_token: CancellationToken::new(),
            available_tx,
            available_rx: tokio::sync::Mutex::new(available_rx),
            committed_tx,
            committed_rx: tokio::sync::Mutex::new(committed_rx),
            discard_tx,
            discard_rx: tokio::sync::Mutex::new(discard_rx),
        };

        queue.set_capacity(initial)?;
        Ok(queue)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_capacity(&self) -> usize {
        self.max
    }

    async fn recv_from(
        &self,
        rx: &tokio::sync::Mutex<mpsc::Receiver<T>>,
        cancel: &CancellationToken,
    ) -> Result<T, QueueError> {
        let mut guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            _ = self.closed_token.cancelled() => return Err(QueueError::Closed),
            guard = rx.lock() => guard,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(QueueError::Cancelled),
            _ = self.closed_token.cancelled() => Err(QueueError::Closed),
            token = guard.recv() => token.ok_or(QueueError::Closed),
        }
    }

    /// Fetches a token for a free slot, discarding surplus tokens when the
    /// target capacity was lowered.
    pub async fn get_available(&self, cancel: &CancellationToken) -> Result<T, QueueError> {
        loop {
            let token = self.recv_from(&self.available_rx, cancel).await?;

            let mut state = self.lock();
            if state.current > state.target {
                state.current -= 1;
                drop(state);
                if self.discard_tx.try_send(token).is_err() {
                    unreachable!("discard channel is sized to hold every token");
                }
                continue;
            }
            return Ok(token);
        }
    }

    /// Fetches the next committed token, in commit order.
    pub async fn get_committed(&self, cancel: &CancellationToken) -> Result<T, QueueError> {
        self.recv_from(&self.committed_rx, cancel).await
    }

    fn send_to(&self, tx: &mpsc::Sender<T>, token: T) -> Result<(), QueueError> {
        let state = self.lock();
        // Never blocks: every channel can hold the full token population.
        // When closed, tokens go to the discard channel for reclamation.
        if !state.closed {
            if tx.try_send(token).is_err() {
                unreachable!("circulation channels are sized to hold every token");
            }
            return Ok(());
        }

        if self.discard_tx.try_send(token).is_err() {
            unreachable!("discard channel is sized to hold every token");
        }
        Err(QueueError::Closed)
    }

    /// Puts a token obtained from `get_available` into the committed channel.
    pub fn commit(&self, token: T) -> Result<(), QueueError> {
        self.send_to(&self.committed_tx, token)
    }

    /// Returns a token obtained from `get_committed` to the available pool.
    pub fn release(&self, token: T) -> Result<(), QueueError> {
        self.send_to(&self.available_tx, token)
    }

    /// Changes how many tokens circulate. Lowering the target trims lazily
    /// inside `get_available`; raising it moves parked tokens back into the
    /// available channel immediately.
    pub fn set_capacity(&self, amount: usize) -> Result<(), QueueError> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if amount > self.max {
            return Err(QueueError::InvalidCapacity {
                requested: amount,
                max: self.max,
            });
        }

        state.target = amount;

        while state.current < state.target {
            // Safe: close() only touches the discard receiver after marking
            // the queue closed, which we just ruled out under the state lock.
            let mut discard = self
                .discard_rx
                .try_lock()
                .expect("discard receiver is uncontended while open");
            let token = discard
                .try_recv()
                .expect("discard channel holds every token out of circulation");
            drop(discard);

            if self.available_tx.try_send(token).is_err() {
                unreachable!("available channel is sized to hold every token");
            }
            state.current += 1;
        }

        Ok(())
    }

    /// Spawns a reader task yielding available tokens until cancellation or
    /// closure. A token the receiver no longer wants is put back.
    pub fn available_stream(self: &Arc<Self>, cancel: CancellationToken) -> mpsc::Receiver<T> {
        self.stream(cancel, true)
    }

    /// Spawns a reader task yielding committed tokens until cancellation or
    /// closure.
    pub fn committed_stream(self: &Arc<Self>, cancel: CancellationToken) -> mpsc::Receiver<T> {
        self.stream(cancel, false)
    }

    fn stream(self: &Arc<Self>, cancel: CancellationToken, available: bool) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(1);
        let queue = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                let token = if available {
                    queue.get_available(&cancel).await
                } else {
                    queue.get_committed(&cancel).await
                };
                let Ok(token) = token else { break };

                if let Err(mpsc::error::SendError(token)) = tx.send(token).await {
                    // Receiver dropped: put the token back in circulation.
                    let _ = if available {
                        queue.release(token)
                    } else {
                        queue.commit(token)
                    };
                    break;
                }
            }
        });

        rx
    }

    /// Closes the queue and reclaims every token, running `cleanup` on each
    /// exactly once. Tokens still held by users are collected from the
    /// discard channel as they are committed or released.
    pub async fn close(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.closed_token.cancel();

        let mut cleaned = 0;
        cleaned += Self::drain_now(&mut *self.available_rx.lock().await);
        cleaned += Self::drain_now(&mut *self.committed_rx.lock().await);

        let mut discard = self.discard_rx.lock().await;
        while cleaned < self.max {
            let mut token = discard
                .recv()
                .await
                .expect("queue holds a discard sender for its own lifetime");
            token.cleanup();
            cleaned += 1;
        }

        tracing::debug!(cleaned, max = self.max, "token queue closed");
    }

    fn drain_now(rx: &mut mpsc::Receiver<T>) -> usize {
        let mut count = 0;
        while let Ok(mut token) = rx.try_recv() {
            token.cleanup();
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug)]
    struct TestToken {
        id: usize,
        cleaned: AtomicBool,
        total_cleaned: Arc<AtomicUsize>,
    }

    impl Token for TestToken {
        fn cleanup(&mut self) {
            assert!(
                !self.cleaned.swap(true, Ordering::SeqCst),
                "token cleaned twice"
            );
            self.total_cleaned.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_queue(
        max: usize,
        initial: usize,
    ) -> (Arc<Queue<TestToken>>, Arc<AtomicUsize>) {
        let total_cleaned = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&total_cleaned);
        let mut next_id = 0;
        let queue = Queue::new(max, initial, move || {
            let token = TestToken {
                id: next_id,
                cleaned: AtomicBool::new(false),
                total_cleaned: Arc::clone(&counter),
            };
            next_id += 1;
            Some(token)
        })
        .unwrap();
        (Arc::new(queue), total_cleaned)
    }

    fn expiring_cancel(after: Duration) -> CancellationToken {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            trigger.cancel();
        });
        cancel
    }

    async fn measure_capacity(queue: &Arc<Queue<TestToken>>) -> usize {
        let mut count = 0;
        loop {
            let cancel = expiring_cancel(Duration::from_millis(50));
            match queue.get_available(&cancel).await {
                Ok(token) => {
                    queue.commit(token).unwrap();
                    count += 1;
                }
                Err(_) => break,
            }
        }

        let cancel = CancellationToken::new();
        for _ in 0..count {
            let token = queue.get_committed(&cancel).await.unwrap();
            queue.release(token).unwrap();
        }

        count
    }

    #[tokio::test(start_paused = true)]
    async fn circulation_and_close_reclaims_all() {
        let (queue, cleaned) = test_queue(3, 3);
        let cancel = CancellationToken::new();

        let a = queue.get_available(&cancel).await.unwrap();
        let b = queue.get_available(&cancel).await.unwrap();
        let c = queue.get_available(&cancel).await.unwrap();

        // A fourth request runs dry and times out via its cancel token.
        let expiring = expiring_cancel(Duration::from_millis(50));
        assert_eq!(
            queue.get_available(&expiring).await.unwrap_err(),
            QueueError::Cancelled
        );

        // Commit two; the processor sees them in commit order.
        let (id_a, id_b) = (a.id, b.id);
        queue.commit(a).unwrap();
        queue.commit(b).unwrap();
        let a = queue.get_committed(&cancel).await.unwrap();
        assert_eq!(a.id, id_a);
        let b = queue.get_committed(&cancel).await.unwrap();
        assert_eq!(b.id, id_b);

        // Close while all three tokens are still in user hands. They are
        // routed into the discard channel when handed back and reclaimed
        // there.
        let closer = Arc::clone(&queue);
        let close_task = tokio::spawn(async move { closer.close().await });
        // Let the close task mark the queue closed before handing back.
        tokio::task::yield_now().await;

        assert_eq!(queue.release(a).unwrap_err(), QueueError::Closed);
        assert_eq!(queue.commit(b).unwrap_err(), QueueError::Closed);
        assert_eq!(queue.release(c).unwrap_err(), QueueError::Closed);

        close_task.await.unwrap();
        assert_eq!(cleaned.load(Ordering::SeqCst), 3);

        // Closing again is a no-op.
        queue.close().await;
        assert_eq!(cleaned.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unused_queue_cleans_everything() {
        let (queue, cleaned) = test_queue(10, 10);
        queue.close().await;
        assert_eq!(cleaned.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn factory_failure_aborts_construction() {
        let result = Queue::<TestToken>::new(5, 5, || None);
        assert_eq!(result.err().unwrap(), QueueError::Factory);
    }

    #[tokio::test(start_paused = true)]
    async fn get_committed_observes_cancel() {
        let (queue, _) = test_queue(1, 1);
        let cancel = expiring_cancel(Duration::from_millis(50));
        assert_eq!(
            queue.get_committed(&cancel).await.unwrap_err(),
            QueueError::Cancelled
        );
        queue.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_tracks_target() {
        let (queue, _) = test_queue(10, 10);

        assert_eq!(measure_capacity(&queue).await, 10);

        for target in [10usize, 8, 3, 2, 7, 1, 10, 0, 7] {
            queue.set_capacity(target).unwrap();
            assert_eq!(measure_capacity(&queue).await, target, "target {target}");
        }

        assert_eq!(
            queue.set_capacity(11).unwrap_err(),
            QueueError::InvalidCapacity {
                requested: 11,
                max: 10
            }
        );

        queue.close().await;
        assert_eq!(queue.set_capacity(5).unwrap_err(), QueueError::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn streams_yield_tokens_until_cancelled() {
        let (queue, cleaned) = test_queue(2, 2);
        let cancel = CancellationToken::new();

        let mut available = queue.available_stream(cancel.clone());
        let token = available.recv().await.unwrap();
        queue.commit(token).unwrap();

        let mut committed = queue.committed_stream(cancel.clone());
        let token = committed.recv().await.unwrap();
        queue.release(token).unwrap();

        // Stop the reader tasks and put every in-flight token back into
        // circulation before closing.
        cancel.cancel();
        while let Some(token) = available.recv().await {
            queue.release(token).unwrap();
        }
        while let Some(token) = committed.recv().await {
            queue.commit(token).unwrap();
        }

        queue.close().await;
        assert_eq!(cleaned.load(Ordering::SeqCst), 2);
    }
}
