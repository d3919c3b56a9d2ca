// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! HAX flavor of the hardware accelerator. No guest debugging; kicks always force an exit.

use std::sync::Arc;

use sync::BigLockGuard;
use vcpu::Cpu;
use vcpu::InterruptRequest;

use super::start_vcpu_thread;
use super::synchronize_pre_loadvm;
use super::synchronize_put;
use super::synchronize_state;
use super::HwBackend;
use crate::cpus_kick_thread;
use crate::generic_handle_interrupt;
use crate::AccelOps;
use crate::KickOps;
use crate::Machine;
use crate::Result;
use crate::SyncOps;
use crate::Vm;

pub struct HaxAccel {
    backend: Arc<dyn HwBackend>,
}

impl HaxAccel {
    pub fn new(backend: Arc<dyn HwBackend>) -> HaxAccel {
        HaxAccel { backend }
    }
}

impl AccelOps for HaxAccel {
    fn name(&self) -> &'static str {
        "hax"
    }

    fn create_vcpu_thread(&self, vm: &Arc<Vm>, _m: &mut Machine, cpu: &Arc<Cpu>) -> Result<()> {
        start_vcpu_thread(vm, &self.backend, self.name(), cpu)
    }

    fn handle_interrupt(&self, vm: &Vm, cpu: &Cpu, mask: InterruptRequest) {
        generic_handle_interrupt(vm, cpu, mask);
    }

    fn kick(&self) -> Option<&dyn KickOps> {
        Some(self)
    }

    fn sync(&self) -> Option<&dyn SyncOps> {
        Some(self)
    }
}

impl KickOps for HaxAccel {
    fn kick_vcpu_thread(&self, _vm: &Vm, cpu: &Cpu) {
        // The exit request must be visible even if an earlier kick is still being coalesced.
        cpu.exit();
        cpus_kick_thread(cpu);
    }
}

impl SyncOps for HaxAccel {
    fn synchronize_post_reset(&self, vm: &Vm, m: &mut BigLockGuard<Machine>, index: usize) {
        synchronize_put(vm, m, index);
    }

    fn synchronize_post_init(&self, vm: &Vm, m: &mut BigLockGuard<Machine>, index: usize) {
        synchronize_put(vm, m, index);
    }

    fn synchronize_state(&self, vm: &Vm, m: &mut BigLockGuard<Machine>, index: usize) {
        synchronize_state(vm, m, index);
    }

    fn synchronize_pre_loadvm(&self, vm: &Vm, m: &mut BigLockGuard<Machine>, index: usize) {
        synchronize_pre_loadvm(vm, m, index);
    }
}
