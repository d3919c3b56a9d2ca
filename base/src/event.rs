// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;
use std::time::Duration;

use sync::Condvar;
use sync::Mutex;

/// A one-bit inter-thread notification.
///
/// `signal` sets the event, `wait` blocks until it is set and then clears it. Clones share the same
/// underlying state, so one clone can be handed to a worker thread while another is kept to signal
/// it.
#[derive(Clone, Debug, Default)]
pub struct Event {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

/// The result of a timed wait on an [`Event`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventWaitResult {
    /// The event was signaled.
    Signaled,
    /// The timeout elapsed before the event was signaled.
    TimedOut,
}

impl Event {
    pub fn new() -> Event {
        Event::default()
    }

    /// Sets the event and wakes every waiter.
    pub fn signal(&self) {
        let (signaled, cvar) = &*self.inner;
        *signaled.lock() = true;
        cvar.notify_all();
    }

    /// Blocks until the event is signaled, then clears it.
    pub fn wait(&self) {
        let (signaled, cvar) = &*self.inner;
        let mut guard = cvar.wait_while(signaled.lock(), |s| !*s);
        *guard = false;
    }

    /// Blocks until the event is signaled or `timeout` elapses. A signaled event is cleared.
    pub fn wait_timeout(&self, timeout: Duration) -> EventWaitResult {
        let (signaled, cvar) = &*self.inner;
        let (mut guard, timed_out) = cvar.wait_timeout_while(signaled.lock(), timeout, |s| !*s);
        if timed_out {
            EventWaitResult::TimedOut
        } else {
            *guard = false;
            EventWaitResult::Signaled
        }
    }

    /// Clears the event without waiting.
    pub fn reset(&self) {
        *self.inner.0.lock() = false;
    }

    /// Returns true if `self` and `other` share the same state.
    pub fn same_as(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn try_clone(&self) -> Event {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn signal_then_wait() {
        let evt = Event::new();
        evt.signal();
        evt.wait();
        assert_eq!(
            evt.wait_timeout(Duration::from_millis(1)),
            EventWaitResult::TimedOut
        );
    }

    #[test]
    fn signal_from_other_thread() {
        let evt = Event::new();
        let clone = evt.try_clone();
        let handle = thread::spawn(move || clone.signal());
        assert_eq!(
            evt.wait_timeout(Duration::from_secs(10)),
            EventWaitResult::Signaled
        );
        handle.join().unwrap();
    }

    #[test]
    fn reset_clears() {
        let evt = Event::new();
        evt.signal();
        evt.reset();
        assert_eq!(
            evt.wait_timeout(Duration::from_millis(1)),
            EventWaitResult::TimedOut
        );
    }
}
