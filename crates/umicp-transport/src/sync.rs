//! Small locking helper shared by the transport components.

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering from poisoning.
///
/// Registry state is only mutated in short critical sections that cannot
/// panic halfway, so a poisoned lock still holds a consistent value.
pub(crate) fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}
