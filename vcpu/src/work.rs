// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::Cpu;
use crate::CpuState;

/// A closure run on a CPU's own thread with the big lock held.
pub type WorkFn = Box<dyn FnOnce(&Cpu, &mut CpuState) + Send>;

pub struct WorkItem {
    func: WorkFn,
    done: Option<Arc<AtomicBool>>,
}

impl WorkItem {
    /// Creates a work item that nobody waits for.
    pub fn detached(func: WorkFn) -> WorkItem {
        WorkItem { func, done: None }
    }

    /// Creates a work item along with the flag that is set once it has run.
    pub fn waited(func: WorkFn) -> (WorkItem, Arc<AtomicBool>) {
        let done = Arc::new(AtomicBool::new(false));
        (
            WorkItem {
                func,
                done: Some(done.clone()),
            },
            done,
        )
    }

    pub fn run(self, cpu: &Cpu, state: &mut CpuState) {
        (self.func)(cpu, state);
        if let Some(done) = self.done {
            done.store(true, Ordering::Release);
        }
    }
}

/// FIFO of pending work for one CPU.
#[derive(Default)]
pub struct WorkQueue {
    items: VecDeque<WorkItem>,
}

impl WorkQueue {
    pub fn push(&mut self, item: WorkItem) {
        self.items.push_back(item);
    }

    pub fn pop(&mut self) -> Option<WorkItem> {
        self.items.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}
