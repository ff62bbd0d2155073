//! buslet-sync: concurrency primitives for device-control services.
//!
//! These building blocks are shared by the protocol engines in the `buslet`
//! crate but have no protocol knowledge of their own:
//!
//! - [`CloseFlag`] — one-shot close broadcast with an optional hook
//! - [`BoundedPipe`] — bounded byte pipe with blocking/truncating writes
//! - [`SlotSet`] — fixed pool of signalable request-correlation slots
//! - [`TokenQueue`] — elastic token circulation (available → committed)
//! - [`WaitState`] — versioned value cell with predicate waits
//! - [`Once`] — idempotent triggered handler with join semantics
//! - [`MultiRun`] — ordered start / reverse-ordered stop coordinator

pub mod closeflag;
pub mod multirun;
pub mod once;
pub mod pipe;
pub mod slotset;
pub mod tokenqueue;
pub mod waitstate;

pub use closeflag::{CloseError, CloseFlag};
pub use multirun::{MultiRun, MultiRunError, Ready, Runnable, SimpleRunnable};
pub use once::{Once, OnceError};
pub use pipe::{BoundedPipe, PipeEnd, PipeReadError, PipeWriteError};
pub use slotset::{ActiveSlot, IterateError, Slot, SlotSet, SlotSetError};
pub use tokenqueue::{Queue, QueueError, Token};
pub use waitstate::{WaitError, WaitState};
