//! Small synchronization helpers shared by the buffer pool and the page
//! allocator.

mod permits;

pub use permits::{Permit, PermitPool};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, ignoring poisoning.  A panicking worker is reported
/// through the runtime's panic hook; the protected data is still usable by
/// the remaining threads.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
