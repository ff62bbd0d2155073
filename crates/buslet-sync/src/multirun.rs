//! Multi-component lifecycle coordinator.
//!
//! Components register in start order. [`MultiRun::run`] launches each
//! component's `run` and waits for its readiness signal (or a group close)
//! before starting the next; [`MultiRun::close`] stops components in
//! reverse order, joining each started `run` before stepping back. When
//! `close` returns, every previously started `run` has returned.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::closeflag::{CloseError, CloseFlag};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MultiRunError {
    #[error("multirun was closed")]
    Closed,
}

/// Idempotent readiness signal handed to a component's `run`.
#[derive(Clone)]
pub struct Ready {
    tx: mpsc::Sender<()>,
}

impl Ready {
    /// Signals that the component finished initializing. Extra calls are
    /// harmless.
    pub fn notify(&self) {
        let _ = self.tx.try_send(());
    }
}

/// A component with a blocking `run` that signals readiness, and a `close`
/// that makes `run` return.
#[async_trait]
pub trait Runnable: Send + Sync {
    async fn run(&self, ready: Ready) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
}

/// A component whose `run` is ready as soon as it starts.
#[async_trait]
pub trait SimpleRunnable: Send + Sync {
    async fn run(&self) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
}

struct SimpleAdapter<R: SimpleRunnable>(R);

#[async_trait]
impl<R: SimpleRunnable> Runnable for SimpleAdapter<R> {
    async fn run(&self, ready: Ready) -> anyhow::Result<()> {
        ready.notify();
        self.0.run().await
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.0.close().await
    }
}

type InitFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Adapts a pair of plain callbacks. `run_cb` initializes and returns;
/// readiness is signalled on success, and `close_cb` fires on close only if
/// the initialization succeeded.
struct FuncAdapter {
    run_cb: Mutex<Option<InitFn>>,
    close_cb: Mutex<Option<InitFn>>,
    do_close: Mutex<bool>,
}

#[async_trait]
impl Runnable for FuncAdapter {
    async fn run(&self, ready: Ready) -> anyhow::Result<()> {
        let run_cb = self
            .run_cb
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .expect("run callback invoked twice");

        run_cb()?;

        *self.do_close.lock().unwrap_or_else(PoisonError::into_inner) = true;
        ready.notify();
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        let armed = {
            let mut do_close = self.do_close.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *do_close)
        };
        if !armed {
            return Ok(());
        }

        let close_cb = self
            .close_cb
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match close_cb {
            Some(cb) => cb(),
            None => Ok(()),
        }
    }
}

struct Inner {
    items: Vec<Arc<dyn Runnable>>,
    running: Option<Vec<bool>>,
    first_error: Option<anyhow::Error>,
}

/// Ordered start / reverse-ordered stop coordinator.
pub struct MultiRun {
    inner: Mutex<Inner>,
    finished_rx: tokio::sync::Mutex<Option<mpsc::Receiver<usize>>>,
    closed: CloseFlag,
}

impl Default for MultiRun {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiRun {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: Vec::new(),
                running: None,
                first_error: None,
            }),
            finished_rx: tokio::sync::Mutex::new(None),
            closed: CloseFlag::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a component. Registration must happen before `run`.
    pub fn register(&self, item: Arc<dyn Runnable>) {
        self.lock().items.push(item);
    }

    /// Appends a component without a readiness argument; it is considered
    /// ready the moment its `run` starts.
    pub fn register_simple(&self, item: impl SimpleRunnable + 'static) {
        self.register(Arc::new(SimpleAdapter(item)));
    }

    /// Appends a callback pair: `run_cb` initializes and returns, `close_cb`
    /// tears down (only if initialization succeeded).
    pub fn register_fn(
        &self,
        run_cb: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
        close_cb: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
    ) {
        self.register(Arc::new(FuncAdapter {
            run_cb: Mutex::new(Some(Box::new(run_cb))),
            close_cb: Mutex::new(Some(Box::new(close_cb))),
            do_close: Mutex::new(false),
        }));
    }

    /// Token cancelled when the group is closed.
    pub fn close_chan(&self) -> CancellationToken {
        self.closed.chan()
    }

    /// Starts every registered component in order and waits for all of them
    /// to finish. The outer `ready` fires once each component has signalled
    /// its own readiness. If any component errors, the others are closed and
    /// the first error is returned; if the group is closed externally,
    /// [`MultiRunError::Closed`] is returned instead.
    pub async fn run(
        self: &Arc<Self>,
        ready: Option<Box<dyn FnOnce() + Send>>,
    ) -> anyhow::Result<()> {
        if self.closed.is_closed() {
            return Err(MultiRunError::Closed.into());
        }

        let items: Vec<Arc<dyn Runnable>> = {
            let mut inner = self.lock();
            if inner.running.is_none() {
                inner.running = Some(vec![false; inner.items.len()]);
            }
            inner.items.clone()
        };

        let (finished_tx, finished_rx) = mpsc::channel(items.len().max(1));
        *self.finished_rx.lock().await = Some(finished_rx);

        let (ready_tx, mut ready_rx) = mpsc::channel(1);
        let item_ready = Ready { tx: ready_tx };

        let close_token = self.closed.chan();
        let mut handles = Vec::with_capacity(items.len());

        for (index, item) in items.iter().enumerate() {
            {
                let mut inner = self.lock();
                if let Some(running) = inner.running.as_mut() {
                    running[index] = true;
                }
            }

            let item = Arc::clone(item);
            let ready = item_ready.clone();
            let finished = finished_tx.clone();
            let group = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let result = item.run(ready).await;
                let _ = finished.send(index).await;

                if let Err(err) = result {
                    tracing::warn!(index, error = %err, "component run failed");
                    {
                        let mut inner = group.lock();
                        if inner.first_error.is_none() {
                            inner.first_error = Some(err);
                        }
                    }
                    let _ = group.close().await;
                }
            }));

            tokio::select! {
                _ = close_token.cancelled() => break,
                _ = ready_rx.recv() => {}
            }
        }

        if !self.closed.is_closed() {
            if let Some(ready) = ready {
                ready();
            }
        }

        for handle in handles {
            let _ = handle.await;
        }

        let mut inner = self.lock();
        if let Some(err) = inner.first_error.take() {
            return Err(err);
        }
        if self.closed.is_closed() {
            return Err(MultiRunError::Closed.into());
        }
        Ok(())
    }

    /// Closes the group: components are closed in reverse registration
    /// order, and each started `run` is joined before moving to the
    /// previous component. Returns the first close error.
    pub async fn close(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut result = match self.closed.close() {
            Ok(()) => Ok(()),
            Err(CloseError::AlreadyClosed) => return Err(MultiRunError::Closed.into()),
            Err(CloseError::Hook(err)) => Err(err),
        };

        let items: Vec<Arc<dyn Runnable>> = self.lock().items.clone();
        let mut finished_rx = self.finished_rx.lock().await;

        for index in (0..items.len()).rev() {
            if let Err(err) = items[index].close().await {
                tracing::warn!(index, error = %err, "component close failed");
                if result.is_ok() {
                    result = Err(err);
                }
            }

            // Join this component's run before stepping to the previous one.
            loop {
                let still_running = {
                    let inner = self.lock();
                    match inner.running.as_ref() {
                        Some(running) => running[index],
                        None => false,
                    }
                };
                if !still_running {
                    break;
                }

                let Some(rx) = finished_rx.as_mut() else { break };
                let Some(done_index) = rx.recv().await else {
                    break;
                };
                let mut inner = self.lock();
                if let Some(running) = inner.running.as_mut() {
                    running[done_index] = false;
                }
            }
        }

        result
    }
}
