// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::fmt::Debug;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;

static MUTEX_POISONED: &str = "mutex is poisoned";

/// A lock for state that lives outside the big lock, such as accelerator bookkeeping that a
/// vCPU thread must reach without blocking on the machine.
#[derive(Default)]
pub struct Mutex<T: ?Sized> {
    std: StdMutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Mutex<T> {
        Mutex {
            std: StdMutex::new(value),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the lock, blocking the current thread until it is able to do so.
    ///
    /// Panics if a previous holder panicked.
    pub fn lock(&self) -> MutexGuard<T> {
        self.std.lock().expect(MUTEX_POISONED)
    }
}

impl<T: ?Sized + Debug> Debug for Mutex<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.std, formatter)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn shared_counter() {
        let count = Arc::new(Mutex::new(0u32));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let count = count.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        *count.lock() += 1;
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*count.lock(), 400);
    }

    #[test]
    fn poisoned_lock_panics() {
        let m = Arc::new(Mutex::new(()));
        let held = m.clone();
        let _ = thread::spawn(move || {
            let _guard = held.lock();
            panic!("holder died");
        })
        .join();
        let result = thread::spawn(move || {
            let _guard = m.lock();
        })
        .join();
        assert!(result.is_err());
    }
}
