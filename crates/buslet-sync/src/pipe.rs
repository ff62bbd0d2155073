//! Bounded byte pipe.
//!
//! What is written into a [`BoundedPipe`] comes out of its reads, in order,
//! with a configurable buffer in between. Write behaviour on a full pipe is
//! selectable: suspend until capacity frees up (default), fail outright, or
//! truncate to whatever fits.
//!
//! [`duplex`] crosses two pipes into a pair of in-memory serial-port-like
//! endpoints, which the protocol crates use as their loopback test double.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipeWriteError {
    /// The pipe was closed. `written` bytes of this call made it in before
    /// the close was observed.
    #[error("pipe is closed")]
    Closed { written: usize },
    /// Non-blocking write did not fit and truncation is not allowed.
    #[error("write ignored due to full buffer")]
    Full,
    /// Non-blocking write was cut short; `written` bytes made it in.
    #[error("write truncated after {written} bytes")]
    Truncated { written: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipeReadError {
    /// The pipe was closed and the buffer is exhausted.
    #[error("pipe is closed")]
    Closed,
}

struct Inner {
    buf: BytesMut,
    closed: bool,
}

/// One-producer/one-consumer byte pipe with a maximum capacity.
///
/// A capacity of zero means unbounded.
pub struct BoundedPipe {
    inner: Mutex<Inner>,
    can_read: Notify,
    can_write: Notify,
    capacity: usize,
    blocking: bool,
    allow_truncate: bool,
}

impl BoundedPipe {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: BytesMut::new(),
                closed: false,
            }),
            can_read: Notify::new(),
            can_write: Notify::new(),
            capacity,
            blocking: true,
            allow_truncate: false,
        }
    }

    /// Selects whether writes suspend on a full pipe (default) or fail.
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// Allows non-blocking writes to truncate instead of failing outright.
    pub fn allow_truncate(mut self, allow: bool) -> Self {
        self.allow_truncate = allow;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remaining_locked(&self, inner: &Inner) -> usize {
        if self.capacity == 0 {
            return 0;
        }
        self.capacity
            .checked_sub(inner.buf.len())
            .expect("pipe buffer exceeded its capacity")
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes that can be written right now without suspending or truncating.
    pub fn remaining(&self) -> usize {
        let inner = self.lock();
        self.remaining_locked(&inner)
    }

    pub fn len(&self) -> usize {
        self.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discards all buffered bytes.
    pub fn clear(&self) {
        self.lock().buf.clear();
        self.can_write.notify_one();
    }

    /// Closes the pipe. Reads drain what is buffered and then fail
    /// [`PipeReadError::Closed`]; writes fail immediately.
    pub fn close(&self) {
        self.lock().closed = true;
        self.can_read.notify_waiters();
        self.can_write.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn write_non_blocking(&self, data: &[u8]) -> Result<usize, PipeWriteError> {
        let (written, truncated) = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(PipeWriteError::Closed { written: 0 });
            }

            let mut chunk = data;
            let mut truncated = false;
            if self.capacity > 0 {
                let remaining = self.remaining_locked(&inner);
                if chunk.len() > remaining {
                    if !self.allow_truncate {
                        return Err(PipeWriteError::Full);
                    }
                    chunk = &chunk[..remaining];
                    truncated = true;
                }
            }

            inner.buf.extend_from_slice(chunk);
            (chunk.len(), truncated)
        };

        self.can_read.notify_one();

        if truncated {
            Err(PipeWriteError::Truncated { written })
        } else {
            Ok(written)
        }
    }

    async fn write_blocking(&self, mut data: &[u8]) -> Result<usize, PipeWriteError> {
        let mut total = 0;

        loop {
            let notified = self.can_write.notified();
            tokio::pin!(notified);

            let mut wrote_partial = false;
            {
                let mut inner = self.lock();
                if inner.closed {
                    self.can_write.notify_one();
                    return Err(PipeWriteError::Closed { written: total });
                }

                let remaining = self.remaining_locked(&inner);
                if self.capacity == 0 || remaining >= data.len() {
                    inner.buf.extend_from_slice(data);
                    total += data.len();
                    let has_space = self.capacity == 0 || inner.buf.len() < self.capacity;
                    drop(inner);

                    self.can_read.notify_one();
                    if has_space {
                        // Another writer can potentially also make progress.
                        self.can_write.notify_one();
                    }
                    return Ok(total);
                }

                if remaining > 0 {
                    inner.buf.extend_from_slice(&data[..remaining]);
                    data = &data[remaining..];
                    total += remaining;
                    wrote_partial = true;
                }

                // Register for the wake-up while still holding the lock so a
                // racing read cannot slip between the check and the await.
                notified.as_mut().enable();
            }

            if wrote_partial {
                self.can_read.notify_one();
            }
            notified.await;
        }
    }

    /// Writes `data` according to the configured policy. A zero-length write
    /// returns `Ok(0)` unconditionally.
    pub async fn write(&self, data: &[u8]) -> Result<usize, PipeWriteError> {
        if data.is_empty() {
            return Ok(0);
        }
        if self.blocking {
            self.write_blocking(data).await
        } else {
            self.write_non_blocking(data)
        }
    }

    /// Reads into `buf`, returning immediately if any bytes are buffered and
    /// suspending otherwise. A zero-length read returns `Ok(0)`.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, PipeReadError> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let notified = self.can_read.notified();
            tokio::pin!(notified);

            {
                let mut inner = self.lock();
                if !inner.buf.is_empty() {
                    let n = buf.len().min(inner.buf.len());
                    buf[..n].copy_from_slice(&inner.buf[..n]);
                    inner.buf.advance(n);
                    let more = !inner.buf.is_empty();
                    drop(inner);

                    if more {
                        // Another reader can potentially also make progress.
                        self.can_read.notify_one();
                    }
                    self.can_write.notify_one();
                    return Ok(n);
                }

                if inner.closed {
                    self.can_read.notify_one();
                    return Err(PipeReadError::Closed);
                }

                notified.as_mut().enable();
            }

            notified.await;
        }
    }
}

/// One endpoint of an in-memory duplex link: reads from one pipe, writes
/// into the other.
pub struct PipeEnd {
    rx: Arc<BoundedPipe>,
    tx: Arc<BoundedPipe>,
}

impl PipeEnd {
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, PipeReadError> {
        self.rx.read(buf).await
    }

    pub async fn write(&self, data: &[u8]) -> Result<usize, PipeWriteError> {
        self.tx.write(data).await
    }

    /// Closes both directions of this endpoint.
    pub fn close(&self) {
        self.rx.close();
        self.tx.close();
    }
}

/// Creates two cross-connected endpoints: what one writes, the other reads.
/// Each underlying pipe carries `capacity` bytes (0 means unbounded) and
/// uses blocking writes.
pub fn duplex(capacity: usize) -> (PipeEnd, PipeEnd) {
    let a = Arc::new(BoundedPipe::new(capacity));
    let b = Arc::new(BoundedPipe::new(capacity));

    (
        PipeEnd {
            rx: Arc::clone(&a),
            tx: Arc::clone(&b),
        },
        PipeEnd { rx: b, tx: a },
    )
}
