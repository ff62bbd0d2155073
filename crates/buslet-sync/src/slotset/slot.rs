//! A slot: a reusable correlation handle tying a request to the task that
//! will be woken when its reply (or error) arrives.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{SetState, Shared, SlotSetError, SlotState};

/// One-shot signal cell. Holds at most one posted outcome; later posts
/// coalesce into the value already present.
pub(super) struct Cell<E> {
    pub(super) value: Option<Option<E>>,
    pub(super) closed: bool,
}

pub(super) struct SlotCore<T, E> {
    pub(super) id: usize,
    pub(super) data: Mutex<T>,
    pub(super) cell: Mutex<Cell<E>>,
    pub(super) signal: Notify,
}

impl<T, E> SlotCore<T, E> {
    pub(super) fn new(id: usize, data: T) -> Self {
        Self {
            id,
            data: Mutex::new(data),
            cell: Mutex::new(Cell {
                value: None,
                closed: false,
            }),
            signal: Notify::new(),
        }
    }

    pub(super) fn lock_cell(&self) -> MutexGuard<'_, Cell<E>> {
        self.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A held slot, borrowed from a [`SlotSet`](super::SlotSet) between `get`
/// and `put`.
pub struct Slot<T, E> {
    pub(super) core: Arc<SlotCore<T, E>>,
    pub(super) set: Arc<Shared<T, E>>,
}

impl<T, E> std::fmt::Debug for Slot<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot").field("id", &self.core.id).finish_non_exhaustive()
    }
}

impl<T, E> Slot<T, E> {
    /// Stable identity of this slot within its set.
    pub fn id(&self) -> usize {
        self.core.id
    }

    /// Accesses the user payload.
    pub fn with_data<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut data = self
            .core
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut data)
    }

    /// Held → Active. Panics on any other state.
    pub fn activate(&self) {
        let mut state = self.set.lock_state();
        assert_eq!(
            state.slot_states[self.core.id],
            SlotState::Held,
            "slot could not be activated"
        );
        state.slot_states[self.core.id] = SlotState::Active;
    }

    /// Held/Active → Held. Panics on any other state.
    pub fn deactivate(&self) {
        let mut state = self.set.lock_state();
        let s = state.slot_states[self.core.id];
        assert!(
            matches!(s, SlotState::Held | SlotState::Active),
            "slot could not be deactivated"
        );
        state.slot_states[self.core.id] = SlotState::Held;
    }

    /// Delivers an outcome to the slot's signal cell. `None` means success.
    pub fn post(&self, outcome: Option<E>) {
        let mut state = self.set.lock_state();
        self.set.post_locked(&mut state, self.core.id, outcome);
    }

    /// Waits for a posted outcome. Fails `Closed` when the owning set shuts
    /// down, or `Cancelled` when the caller's token fires.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<Option<E>, SlotSetError> {
        loop {
            let notified = self.core.signal.notified();
            tokio::pin!(notified);

            {
                let mut cell = self.core.lock_cell();
                if let Some(outcome) = cell.value.take() {
                    return Ok(outcome);
                }
                if cell.closed {
                    return Err(SlotSetError::Closed);
                }
                notified.as_mut().enable();
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SlotSetError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }
}

/// View of a slot in state Active or PendingPost, handed to
/// [`SlotSet::iterate_active`](super::SlotSet::iterate_active) callbacks.
/// Posting through it reuses the already-held set lock.
pub struct ActiveSlot<'a, T, E> {
    pub(super) shared: &'a Shared<T, E>,
    pub(super) state: &'a mut SetState,
    pub(super) id: usize,
}

impl<T, E> ActiveSlot<'_, T, E> {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut data = self.shared.slots[self.id]
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut data)
    }

    /// Posts an outcome without re-taking the set lock.
    pub fn post(self, outcome: Option<E>) {
        self.shared.post_locked(self.state, self.id, outcome);
    }
}
