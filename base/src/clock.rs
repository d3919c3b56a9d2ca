// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

// Clock objects representing the host's notion of time, a fake clock for tests, and a cloneable
// source that can be backed by either.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use sync::Mutex;

use crate::Event;

/// The host monotonic clock, measured from the moment the clock was created.
#[derive(Debug, Copy, Clone)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            epoch: Instant::now(),
        }
    }

    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Nanoseconds elapsed since this clock was created.
    pub fn nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// A fake clock that can be used in tests to give exact control over the time.
#[derive(Debug)]
pub struct FakeClock {
    epoch: Instant,
    ns_since_epoch: u64,
    deadlines: Vec<(u64, Event)>,
}

impl FakeClock {
    pub fn new() -> Self {
        FakeClock {
            epoch: Instant::now(),
            ns_since_epoch: 0,
            deadlines: Vec::new(),
        }
    }

    /// Get the current time, according to this clock.
    pub fn now(&self) -> Instant {
        self.epoch + Duration::from_nanos(self.ns_since_epoch)
    }

    ///  Get the current time in ns, according to this clock.
    pub fn nanos(&self) -> u64 {
        self.ns_since_epoch
    }

    /// Register `event` to be signaled when the clock reaches `deadline_ns`.
    /// Drops any deadline previously registered for the same event.
    pub fn add_event(&mut self, deadline_ns: u64, event: Event) {
        self.deadlines.retain(|(_, old)| !old.same_as(&event));
        self.deadlines.push((deadline_ns, event));
    }

    pub fn add_ns(&mut self, ns: u64) {
        self.ns_since_epoch += ns;
        let time = self.ns_since_epoch;
        self.deadlines.retain(|(ns, event)| {
            let expired = *ns <= time;
            if expired {
                event.signal();
            }
            !expired
        });
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

/// A cloneable handle to either the host clock or a shared fake clock.
#[derive(Debug, Clone)]
pub enum ClockSource {
    Host(Clock),
    Fake(Arc<Mutex<FakeClock>>),
}

impl ClockSource {
    pub fn host() -> Self {
        ClockSource::Host(Clock::new())
    }

    pub fn nanos(&self) -> u64 {
        match self {
            ClockSource::Host(clock) => clock.nanos(),
            ClockSource::Fake(clock) => clock.lock().nanos(),
        }
    }
}

impl Default for ClockSource {
    fn default() -> Self {
        ClockSource::host()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventWaitResult;

    #[test]
    fn fake_clock_signals_expired_deadlines() {
        let mut clock = FakeClock::new();
        let evt = Event::new();
        clock.add_event(100, evt.try_clone());
        clock.add_ns(99);
        assert_eq!(
            evt.wait_timeout(Duration::from_millis(1)),
            EventWaitResult::TimedOut
        );
        clock.add_ns(1);
        assert_eq!(
            evt.wait_timeout(Duration::from_millis(1)),
            EventWaitResult::Signaled
        );
    }

    #[test]
    fn fake_source_follows_clock() {
        let fake = Arc::new(Mutex::new(FakeClock::new()));
        let source = ClockSource::Fake(Arc::clone(&fake));
        assert_eq!(source.nanos(), 0);
        fake.lock().add_ns(1_000);
        assert_eq!(source.nanos(), 1_000);
    }
}
