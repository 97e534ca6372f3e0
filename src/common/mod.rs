//! Small building blocks shared by the transport session and the dashboard.
//!
//! - [`ring_buffer`] keeps the most recent telemetry points
//! - [`emitter`] fans events out to registered handlers

pub mod emitter;
pub mod ring_buffer;

pub use emitter::{Emitter, Subscription};
pub use ring_buffer::RingBuffer;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
