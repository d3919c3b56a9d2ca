// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use base::ClockSource;

use crate::Machine;
use crate::Vm;

/// Runs with the big lock held when its deadline passes.
pub type TimerCallback = Box<dyn FnOnce(&Vm, &mut Machine) + Send>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

struct Timer {
    id: TimerId,
    deadline: u64,
    callback: TimerCallback,
}

/// Guest virtual time.
///
/// Without instruction counting the clock follows the host clock while enabled and freezes while
/// disabled. With instruction counting (`icount_shift`), every executed guest instruction is worth
/// `2^shift` nanoseconds and the clock only moves as instructions retire or when idle time is
/// skipped with [`warp_to_deadline`](Self::warp_to_deadline).
pub struct VirtualClock {
    source: ClockSource,
    icount_shift: Option<u32>,
    instructions: Arc<AtomicU64>,
    enabled: bool,
    frozen_ns: u64,
    host_base: u64,
    warp_ns: u64,
    timers: Vec<Timer>,
    next_id: u64,
}

impl VirtualClock {
    /// The clock starts disabled at time zero.
    pub fn new(source: ClockSource, icount_shift: Option<u32>) -> VirtualClock {
        VirtualClock {
            source,
            icount_shift,
            instructions: Arc::new(AtomicU64::new(0)),
            enabled: false,
            frozen_ns: 0,
            host_base: 0,
            warp_ns: 0,
            timers: Vec::new(),
            next_id: 0,
        }
    }

    pub fn icount_enabled(&self) -> bool {
        self.icount_shift.is_some()
    }

    pub fn icount_shift(&self) -> Option<u32> {
        self.icount_shift
    }

    /// Counter of retired guest instructions, updated by vCPU threads without the big lock.
    pub fn instruction_counter(&self) -> Arc<AtomicU64> {
        self.instructions.clone()
    }

    pub fn executed_instructions(&self) -> u64 {
        self.instructions.load(Ordering::Acquire)
    }

    pub fn now_ns(&self) -> u64 {
        match self.icount_shift {
            Some(shift) => (self.executed_instructions() << shift) + self.warp_ns,
            None if self.enabled => self.source.nanos().saturating_sub(self.host_base),
            None => self.frozen_ns,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self) {
        if !self.enabled {
            self.host_base = self.source.nanos().saturating_sub(self.frozen_ns);
            self.enabled = true;
        }
    }

    pub fn disable(&mut self) {
        if self.enabled {
            self.frozen_ns = self.now_ns();
            self.enabled = false;
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled {
            self.enable();
        } else {
            self.disable();
        }
    }

    /// Arms a timer at absolute virtual time `deadline`.
    pub fn add_timer(&mut self, deadline: u64, callback: TimerCallback) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.timers.push(Timer {
            id,
            deadline,
            callback,
        });
        id
    }

    pub fn del_timer(&mut self, id: TimerId) -> bool {
        let before = self.timers.len();
        self.timers.retain(|t| t.id != id);
        self.timers.len() != before
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Nanoseconds until the next timer fires, `None` if there is no timer or the clock is
    /// disabled.
    pub fn deadline_ns(&self) -> Option<u64> {
        if !self.enabled {
            return None;
        }
        let now = self.now_ns();
        self.timers
            .iter()
            .map(|t| t.deadline.saturating_sub(now))
            .min()
    }

    /// Removes the expired timers and returns their callbacks in deadline order.
    pub fn take_expired(&mut self) -> Vec<TimerCallback> {
        if !self.enabled {
            return Vec::new();
        }
        let now = self.now_ns();
        let (mut expired, pending): (Vec<Timer>, Vec<Timer>) = std::mem::take(&mut self.timers)
            .into_iter()
            .partition(|t| t.deadline <= now);
        self.timers = pending;
        expired.sort_by_key(|t| (t.deadline, t.id));
        expired.into_iter().map(|t| t.callback).collect()
    }

    /// Converts nanoseconds into an instruction count, rounding up.
    pub fn icount_round(&self, ns: u64) -> u64 {
        let shift = self.icount_shift.unwrap_or(0);
        (ns + (1 << shift) - 1) >> shift
    }

    /// Skips idle time up to the next timer. Only meaningful with instruction counting.
    pub fn warp_to_deadline(&mut self) {
        if self.icount_enabled() {
            if let Some(d) = self.deadline_ns() {
                self.warp_ns += d;
            }
        }
    }
}

/// Fires every expired virtual timer.
pub fn run_expired_timers(vm: &Vm, m: &mut Machine) {
    for callback in m.clock.take_expired() {
        callback(vm, m);
    }
}
