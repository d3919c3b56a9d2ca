// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::fmt::Debug;
use std::sync::Condvar as StdCondvar;
use std::sync::MutexGuard;
use std::time::Duration;

use crate::BigLockGuard;

static CONDVAR_POISONED: &str = "condvar is poisoned";

/// A Condition Variable.
///
/// Besides the standard guards it can also wait with a [`BigLockGuard`], in which case the big
/// lock is released for the duration of the wait and held again when the wait returns.
#[derive(Default)]
pub struct Condvar {
    std: StdCondvar,
}

impl Condvar {
    /// Creates a new condvar that is ready to be waited on.
    pub const fn new() -> Condvar {
        Condvar {
            std: StdCondvar::new(),
        }
    }

    /// Waits on a condvar, blocking the current thread until it is notified.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.std.wait(guard).expect(CONDVAR_POISONED)
    }

    /// Blocks until notified while `condition` holds.
    pub fn wait_while<'a, T, F>(&self, guard: MutexGuard<'a, T>, condition: F) -> MutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        self.std
            .wait_while(guard, condition)
            .expect(CONDVAR_POISONED)
    }

    /// Like `wait_while`, giving up after `dur`. The returned flag is true on timeout.
    pub fn wait_timeout_while<'a, T, F>(
        &self,
        guard: MutexGuard<'a, T>,
        dur: Duration,
        condition: F,
    ) -> (MutexGuard<'a, T>, bool)
    where
        F: FnMut(&mut T) -> bool,
    {
        let (guard, result) = self
            .std
            .wait_timeout_while(guard, dur, condition)
            .expect(CONDVAR_POISONED);
        (guard, result.timed_out())
    }

    /// Waits for a notification with the big lock released.
    ///
    /// Spurious wakeups are possible; callers re-check their predicate in a loop.
    pub fn wait_big<T>(&self, guard: &mut BigLockGuard<T>) {
        let std_guard = guard.take_std();
        let std_guard = self.std.wait(std_guard).expect(CONDVAR_POISONED);
        guard.restore_std(std_guard);
    }

    /// Waits with the big lock released for at most `dur`. Returns true on timeout.
    pub fn wait_big_timeout<T>(&self, guard: &mut BigLockGuard<T>, dur: Duration) -> bool {
        let std_guard = guard.take_std();
        let (std_guard, result) = self
            .std
            .wait_timeout(std_guard, dur)
            .expect(CONDVAR_POISONED);
        guard.restore_std(std_guard);
        result.timed_out()
    }

    /// Notifies one thread blocked by this condvar.
    pub fn notify_one(&self) {
        self.std.notify_one();
    }

    /// Notifies all threads blocked by this condvar.
    pub fn notify_all(&self) {
        self.std.notify_all();
    }
}

impl Debug for Condvar {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.std, formatter)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::big_lock_held;
    use crate::BigLock;

    #[test]
    fn wait_big_reacquires() {
        let shared = Arc::new((BigLock::new(false), Condvar::new()));
        let waker = Arc::clone(&shared);
        let mut guard = shared.0.lock();
        let handle = thread::spawn(move || {
            let (lock, cvar) = &*waker;
            *lock.lock() = true;
            cvar.notify_all();
        });
        while !*guard {
            shared.1.wait_big(&mut guard);
            assert!(big_lock_held());
        }
        drop(guard);
        handle.join().unwrap();
    }

    #[test]
    fn wait_big_timeout_expires() {
        let lock = BigLock::new(());
        let cvar = Condvar::new();
        let mut guard = lock.lock();
        assert!(cvar.wait_big_timeout(&mut guard, Duration::from_millis(5)));
        assert!(big_lock_held());
    }
}
