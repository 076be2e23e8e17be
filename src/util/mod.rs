use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod timers;

/// Lock a mutex, ignoring poisoning: none of the guarded state can be left inconsistent by a
///  panic halfway through an update.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock()
        .unwrap_or_else(PoisonError::into_inner)
}
