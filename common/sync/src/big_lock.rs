// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The global execution lock.
//!
//! A `BigLock` serializes every mutation of guest-visible state. It is a plain mutex plus a
//! per-thread record of whether the calling thread currently holds a big lock, which makes the
//! "lock is held here" invariant checkable at runtime with [`big_lock_held`].
//!
//! The guard can be given up for the duration of a closure with [`BigLockGuard::unlocked`]. That
//! is the only sanctioned way of running code without the lock once it has been taken, and it is
//! meant for the guest execution quantum and the replay critical section.

use std::cell::Cell;
use std::fmt;
use std::fmt::Debug;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;

static BIG_LOCK_POISONED: &str = "big lock is poisoned";
static GUARD_RELEASED: &str = "big lock guard used while released";

thread_local! {
    static BIG_LOCK_HELD: Cell<bool> = const { Cell::new(false) };
}

fn set_held(held: bool) {
    BIG_LOCK_HELD.with(|h| h.set(held));
}

/// Returns true if the calling thread holds a big lock.
pub fn big_lock_held() -> bool {
    BIG_LOCK_HELD.with(|h| h.get())
}

/// Panics unless the calling thread holds a big lock.
#[track_caller]
pub fn assert_big_lock_held() {
    assert!(big_lock_held(), "big lock is not held by this thread");
}

/// The lock that serializes all guest-visible state.
#[derive(Default)]
pub struct BigLock<T> {
    std: StdMutex<T>,
}

impl<T> BigLock<T> {
    pub const fn new(value: T) -> BigLock<T> {
        BigLock {
            std: StdMutex::new(value),
        }
    }

    /// Acquires the lock, blocking until it is available.
    ///
    /// The lock is not recursive: taking it again from a thread that already holds it is a bug
    /// and panics instead of deadlocking.
    #[track_caller]
    pub fn lock(&self) -> BigLockGuard<T> {
        if big_lock_held() {
            panic!("big lock acquired recursively");
        }
        let guard = self.std.lock().expect(BIG_LOCK_POISONED);
        set_held(true);
        BigLockGuard {
            lock: self,
            guard: Some(guard),
        }
    }

    pub fn into_inner(self) -> T {
        self.std.into_inner().expect(BIG_LOCK_POISONED)
    }
}

impl<T: Debug> Debug for BigLock<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.std, formatter)
    }
}

/// Scoped ownership of a [`BigLock`]. The lock is released when the guard is dropped.
pub struct BigLockGuard<'a, T> {
    lock: &'a BigLock<T>,
    guard: Option<MutexGuard<'a, T>>,
}

impl<'a, T> BigLockGuard<'a, T> {
    /// Releases the lock, runs `f`, and takes the lock again before returning `f`'s result.
    ///
    /// The guard is mutably borrowed for the whole call, so `f` cannot reach the protected data.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let guard = self.take_std();
        drop(guard);
        let ret = f();
        let guard = self.lock.std.lock().expect(BIG_LOCK_POISONED);
        self.restore_std(guard);
        ret
    }

    pub(crate) fn take_std(&mut self) -> MutexGuard<'a, T> {
        let guard = self.guard.take().expect(GUARD_RELEASED);
        set_held(false);
        guard
    }

    pub(crate) fn restore_std(&mut self, guard: MutexGuard<'a, T>) {
        self.guard = Some(guard);
        set_held(true);
    }
}

impl<'a, T> Deref for BigLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_deref().expect(GUARD_RELEASED)
    }
}

impl<'a, T> DerefMut for BigLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_deref_mut().expect(GUARD_RELEASED)
    }
}

impl<'a, T> Drop for BigLockGuard<'a, T> {
    fn drop(&mut self) {
        if self.guard.take().is_some() {
            set_held(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn held_flag_follows_guard() {
        let lock = BigLock::new(0u32);
        assert!(!big_lock_held());
        {
            let mut guard = lock.lock();
            assert!(big_lock_held());
            *guard += 1;
        }
        assert!(!big_lock_held());
        assert_eq!(lock.into_inner(), 1);
    }

    #[test]
    fn unlocked_releases_for_other_threads() {
        let lock = Arc::new(BigLock::new(Vec::new()));
        let mut guard = lock.lock();
        guard.push(1);
        let other = Arc::clone(&lock);
        guard.unlocked(|| {
            assert!(!big_lock_held());
            thread::spawn(move || other.lock().push(2)).join().unwrap();
        });
        assert!(big_lock_held());
        guard.push(3);
        assert_eq!(*guard, vec![1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "recursively")]
    fn recursive_lock_panics() {
        let lock = BigLock::new(());
        let _guard = lock.lock();
        let _again = lock.lock();
    }

    #[test]
    #[should_panic(expected = "not held")]
    fn assert_without_lock_panics() {
        assert_big_lock_held();
    }
}
