// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sync primitive types whose methods panic rather than returning error in case of poison.
//!
//! The Mutex/Condvar types in this crate wrap the standard library versions and mirror the same
//! methods, except that they panic where the standard library would return an Error. Releases are
//! built with panic=abort so poisoning never occurs; a panic while a lock is held takes down the
//! whole process, and code does not have to consider the possibility of poison.
//!
//! The crate also provides [`BigLock`], the single lock that serializes guest-visible state across
//! vCPU threads, the VM control loop and the debug server.

mod big_lock;
mod condvar;
mod mutex;

pub use crate::big_lock::assert_big_lock_held;
pub use crate::big_lock::big_lock_held;
pub use crate::big_lock::BigLock;
pub use crate::big_lock::BigLockGuard;
pub use crate::condvar::Condvar;
pub use crate::mutex::Mutex;
