// Copyright 2017 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared plumbing for the workspace: logging, inter-thread events, worker threads and clocks.

mod clock;
mod event;
pub mod syslog;
mod worker_thread;

pub use clock::Clock;
pub use clock::ClockSource;
pub use clock::FakeClock;
pub use event::Event;
pub use event::EventWaitResult;
pub use log::debug;
pub use log::error;
pub use log::info;
pub use log::trace;
pub use log::warn;
pub use worker_thread::WorkerThread;
