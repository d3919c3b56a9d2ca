// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Worker thread abstraction

use std::panic;
use std::thread;
use std::thread::JoinHandle;
use std::thread::Thread;
use std::time::Duration;

use crate::Event;
use crate::EventWaitResult;

/// Wrapper object for creating a worker thread that can be stopped by signaling an event.
pub struct WorkerThread<T: Send + 'static> {
    worker: Option<(Event, JoinHandle<T>)>,
}

impl<T: Send + 'static> WorkerThread<T> {
    /// Starts a worker thread named `thread_name` running the `thread_func` function.
    ///
    /// The `thread_func` implementation must monitor the provided `Event` and return from the
    /// thread when it is signaled.
    ///
    /// Call [`stop()`](Self::stop) to stop the thread.
    pub fn start<F>(thread_name: impl Into<String>, thread_func: F) -> Self
    where
        F: FnOnce(Event) -> T + Send + 'static,
    {
        let stop_event = Event::new();
        let thread_stop_event = stop_event.try_clone();

        let thread_handle = thread::Builder::new()
            .name(thread_name.into())
            .spawn(move || thread_func(thread_stop_event))
            .expect("thread spawn failed");

        WorkerThread {
            worker: Some((stop_event, thread_handle)),
        }
    }

    /// Stops the worker thread.
    ///
    /// Returns the value returned by the function running in the thread.
    pub fn stop(mut self) -> T {
        // The only time the internal `Option` should be `None` is in a `drop` after `stop`.
        self.stop_internal().expect("invalid worker state")
    }

    fn stop_internal(&mut self) -> Option<T> {
        self.worker.take().map(|(stop_event, thread_handle)| {
            stop_event.signal();
            match thread_handle.join() {
                Ok(v) => v,
                Err(e) => panic::resume_unwind(e),
            }
        })
    }

    /// Signal thread's stop event without waiting for the thread to exit.
    pub fn signal(&self) {
        if let Some((event, _)) = &self.worker {
            event.signal();
        }
    }

    /// Returns a handle to the running thread.
    pub fn thread(&self) -> Option<&Thread> {
        self.worker.as_ref().map(|(_, handle)| handle.thread())
    }
}

impl WorkerThread<()> {
    /// Starts a worker thread that calls `tick` every `period` until it is stopped.
    pub fn start_periodic<F>(thread_name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self::start(thread_name, move |stop_event| loop {
            match stop_event.wait_timeout(period) {
                EventWaitResult::Signaled => break,
                EventWaitResult::TimedOut => tick(),
            }
        })
    }
}

impl<T: Send + 'static> Drop for WorkerThread<T> {
    /// Stops the thread if the `WorkerThread` is dropped without calling [`stop()`](Self::stop).
    fn drop(&mut self) {
        let _ = self.stop_internal();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn stop_returns_value() {
        let worker = WorkerThread::start("test-worker", |evt| {
            evt.wait();
            42
        });
        assert_eq!(worker.stop(), 42);
    }

    #[test]
    fn periodic_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let worker = WorkerThread::start_periodic("ticker", Duration::from_millis(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        while ticks.load(Ordering::SeqCst) < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        worker.stop();
        let after = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(5));
        assert_eq!(after, ticks.load(Ordering::SeqCst));
    }
}
