//! Fixed-cardinality pool of signalable slots.
//!
//! A [`SlotSet`] owns `N` slots for its whole lifetime. Users borrow a slot
//! with [`SlotSet::get`], mark it [`Slot::activate`]d while a request is in
//! flight, and hand it back with [`SlotSet::put`]. A responder delivers the
//! outcome with [`Slot::post`] — directly or via
//! [`SlotSet::iterate_active`] when it only knows the slot id.
//!
//! Lifecycle per slot: Free → Held (get), Held ↔ Active
//! (activate/deactivate), Active → PendingPost (put while active, repooled
//! once the post arrives), Held → Free (put), Active → Held (post),
//! PendingPost → Free (post). Invalid transitions are programming errors
//! and panic.

mod slot;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub use slot::{ActiveSlot, Slot};
use slot::SlotCore;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotSetError {
    #[error("slot set is closed")]
    Closed,
    #[error("wait cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum IterateError<E> {
    #[error("slot set is closed")]
    Closed,
    #[error("iteration callback failed")]
    Callback(E),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    Free,
    Held,
    Active,
    PendingPost,
}

pub(crate) struct SetState {
    slot_states: Vec<SlotState>,
    free: VecDeque<usize>,
    closed: bool,
}

pub(crate) struct Shared<T, E> {
    state: Mutex<SetState>,
    slots: Vec<Arc<SlotCore<T, E>>>,
    free_notify: Notify,
    closed_token: CancellationToken,
}

impl<T, E> Shared<T, E> {
    fn lock_state(&self) -> MutexGuard<'_, SetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn post_locked(&self, state: &mut SetState, id: usize, outcome: Option<E>) {
        if state.closed {
            return;
        }

        let s = state.slot_states[id];
        assert!(
            matches!(s, SlotState::Held | SlotState::Active | SlotState::PendingPost),
            "slot could not be posted"
        );

        if s == SlotState::PendingPost {
            state.slot_states[id] = SlotState::Free;
            state.free.push_back(id);
            assert!(
                state.free.len() <= self.slots.len(),
                "too many slots were returned"
            );
            self.free_notify.notify_one();
            return;
        }

        state.slot_states[id] = SlotState::Held;

        let core = &self.slots[id];
        let mut cell = core.lock_cell();
        if cell.value.is_none() {
            cell.value = Some(outcome);
        }
        drop(cell);
        core.signal.notify_one();
    }
}

/// A pool of `N` reusable request-correlation slots.
pub struct SlotSet<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for SlotSet<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, E> SlotSet<T, E> {
    /// Creates a set of `count` slots; `init` produces each slot's payload.
    pub fn new(count: usize, mut init: impl FnMut(usize) -> T) -> Self {
        let slots: Vec<_> = (0..count)
            .map(|id| Arc::new(SlotCore::new(id, init(id))))
            .collect();

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SetState {
                    slot_states: vec![SlotState::Free; count],
                    free: (0..count).collect(),
                    closed: false,
                }),
                slots,
                free_notify: Notify::new(),
                closed_token: CancellationToken::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.slots.is_empty()
    }

    /// Borrows a free slot, suspending until one is available. Fails
    /// `Closed` if the set shuts down first, or `Cancelled` on the caller's
    /// token.
    pub async fn get(&self, cancel: &CancellationToken) -> Result<Slot<T, E>, SlotSetError> {
        loop {
            let notified = self.shared.free_notify.notified();
            tokio::pin!(notified);

            {
                let mut state = self.shared.lock_state();
                if state.closed {
                    return Err(SlotSetError::Closed);
                }

                if let Some(id) = state.free.pop_front() {
                    assert_eq!(
                        state.slot_states[id],
                        SlotState::Free,
                        "slot was already given out"
                    );
                    state.slot_states[id] = SlotState::Held;

                    // Drop any stale outcome from the previous borrow.
                    self.shared.slots[id].lock_cell().value = None;

                    return Ok(Slot {
                        core: Arc::clone(&self.shared.slots[id]),
                        set: Arc::clone(&self.shared),
                    });
                }

                notified.as_mut().enable();
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SlotSetError::Cancelled),
                _ = self.shared.closed_token.cancelled() => return Err(SlotSetError::Closed),
                _ = &mut notified => {}
            }
        }
    }

    /// Returns a borrowed slot. A slot still Active moves to PendingPost
    /// and is repooled only when its post arrives; otherwise it is repooled
    /// immediately.
    ///
    /// Panics if the slot belongs to a different set.
    pub fn put(&self, slot: Slot<T, E>) {
        assert!(
            Arc::ptr_eq(&slot.set, &self.shared),
            "slot belongs to a different slot set"
        );

        let mut state = self.shared.lock_state();
        let id = slot.core.id;
        let s = state.slot_states[id];
        assert!(s != SlotState::Free, "slot was not given out");

        if s == SlotState::Active {
            state.slot_states[id] = SlotState::PendingPost;
            return;
        }

        state.slot_states[id] = SlotState::Free;
        if !state.closed {
            state.free.push_back(id);
            assert!(
                state.free.len() <= self.shared.slots.len(),
                "too many slots were returned"
            );
            self.shared.free_notify.notify_one();
        }
    }

    /// Calls `f` for every slot in state Active or PendingPost, under the
    /// set lock. Iteration stops when `f` returns `Ok(false)` or an error.
    pub fn iterate_active<F, Er>(&self, mut f: F) -> Result<(), IterateError<Er>>
    where
        F: FnMut(ActiveSlot<'_, T, E>) -> Result<bool, Er>,
    {
        let mut state = self.shared.lock_state();
        if state.closed {
            return Err(IterateError::Closed);
        }

        for id in 0..self.shared.slots.len() {
            let s = state.slot_states[id];
            if matches!(s, SlotState::Active | SlotState::PendingPost) {
                let view = ActiveSlot {
                    shared: &self.shared,
                    state: &mut *state,
                    id,
                };
                match f(view) {
                    Ok(true) => {}
                    Ok(false) => return Ok(()),
                    Err(err) => return Err(IterateError::Callback(err)),
                }
            }
        }

        Ok(())
    }

    /// Closes the set: pending and future `get`s fail `Closed`, and every
    /// outstanding `wait` is released with `Closed`.
    pub fn close(&self) -> Result<(), SlotSetError> {
        {
            let mut state = self.shared.lock_state();
            if state.closed {
                return Err(SlotSetError::Closed);
            }
            state.closed = true;

            for core in &self.shared.slots {
                core.lock_cell().closed = true;
                core.signal.notify_waiters();
            }
        }

        self.shared.closed_token.cancel();
        self.shared.free_notify.notify_waiters();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock_state().closed
    }
}
