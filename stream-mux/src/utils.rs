use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock `mutex`, ignoring poisoning.
///
/// The protected state is only mutated by short critical sections that do not
/// call user code, so a poisoned lock still holds consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
