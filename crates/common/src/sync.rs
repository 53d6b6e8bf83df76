//! Lock helpers

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Lock a mutex, recovering the guard if a previous holder panicked
///
/// Every structure guarded in this workspace is consistent between
/// statements, so a poisoned lock still holds valid data.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wait on `cond` until `done` returns true or `timeout` elapses
///
/// Returns the guard and whether the condition was met.
pub fn wait_until<'a, T, F>(
    cond: &Condvar,
    mut guard: MutexGuard<'a, T>,
    timeout: Duration,
    mut done: F,
) -> (MutexGuard<'a, T>, bool)
where
    F: FnMut(&mut T) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if done(&mut *guard) {
            return (guard, true);
        }
        let now = Instant::now();
        if now >= deadline {
            return (guard, false);
        }
        guard = match cond.wait_timeout(guard, deadline - now) {
            Ok((g, _)) => g,
            Err(poisoned) => poisoned.into_inner().0,
        };
    }
}
