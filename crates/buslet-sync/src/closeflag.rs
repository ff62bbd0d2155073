//! One-shot close broadcast.
//!
//! A `CloseFlag` can be closed many times, but only the first close takes
//! effect: it cancels the broadcast token and runs the optional hook. Later
//! calls return [`CloseError::AlreadyClosed`], which is harmless and lets
//! callers fold shutdown paths together without tracking who closed first.

use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

type CloseHook = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

#[derive(Debug, Error)]
pub enum CloseError {
    /// The flag was already closed. This is harmless.
    #[error("already closed")]
    AlreadyClosed,
    /// The close hook failed.
    #[error(transparent)]
    Hook(#[from] anyhow::Error),
}

#[derive(Default)]
struct State {
    closed: bool,
    hook: Option<CloseHook>,
}

/// A monotonic open → closed flag with a broadcast channel and an optional
/// one-shot hook.
#[derive(Default)]
pub struct CloseFlag {
    state: Mutex<State>,
    token: CancellationToken,
}

impl CloseFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a flag whose hook runs exactly once, on the first `close`.
    ///
    /// The hook runs outside the internal lock, so it may call `close`
    /// again without deadlocking.
    pub fn with_hook(hook: impl FnOnce() -> anyhow::Result<()> + Send + 'static) -> Self {
        Self {
            state: Mutex::new(State {
                closed: false,
                hook: Some(Box::new(hook)),
            }),
            token: CancellationToken::new(),
        }
    }

    /// Returns a token that is cancelled once the flag has been closed.
    /// May be obtained any number of times, before or after closing.
    pub fn chan(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    /// Closes the flag. Safe to call multiple times; only the first call
    /// broadcasts and runs the hook.
    pub fn close(&self) -> Result<(), CloseError> {
        let hook = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return Err(CloseError::AlreadyClosed);
            }
            state.closed = true;
            state.hook.take()
        };

        self.token.cancel();

        if let Some(hook) = hook {
            hook()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn close_is_idempotent() {
        let flag = CloseFlag::new();
        assert!(!flag.is_closed());
        assert!(flag.close().is_ok());
        assert!(flag.is_closed());
        assert!(matches!(flag.close(), Err(CloseError::AlreadyClosed)));
        assert!(matches!(flag.close(), Err(CloseError::AlreadyClosed)));
    }

    #[test]
    fn hook_runs_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let hook_count = Arc::clone(&count);
        let flag = CloseFlag::with_hook(move || {
            hook_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        flag.close().unwrap();
        let _ = flag.close();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_error_is_returned() {
        let flag = CloseFlag::with_hook(|| Err(anyhow::anyhow!("port refused to close")));
        assert!(matches!(flag.close(), Err(CloseError::Hook(_))));
        // Second close is still the benign sentinel.
        assert!(matches!(flag.close(), Err(CloseError::AlreadyClosed)));
    }

    #[test]
    fn hook_may_reenter_close() {
        let flag = Arc::new(CloseFlag::new());
        // A hook on a second flag that closes the first is the common shape;
        // re-entering the same flag must not deadlock either.
        let inner = Arc::clone(&flag);
        let outer = CloseFlag::with_hook(move || {
            let _ = inner.close();
            Ok(())
        });
        outer.close().unwrap();
        assert!(flag.is_closed());
    }

    #[tokio::test]
    async fn chan_is_released_on_close() {
        let flag = Arc::new(CloseFlag::new());
        let token = flag.chan();

        let closer = Arc::clone(&flag);
        let waiter = tokio::spawn(async move {
            token.cancelled().await;
        });
        closer.close().unwrap();
        waiter.await.unwrap();

        // A token obtained after closing is already cancelled.
        assert!(flag.chan().is_cancelled());
    }
}
