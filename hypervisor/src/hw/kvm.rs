// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! KVM flavor of the hardware accelerator.

use std::sync::Arc;

use sync::BigLockGuard;
use vcpu::Cpu;
use vcpu::CpuState;
use vcpu::GdbBreakpointType;
use vcpu::InterruptRequest;
use vcpu::SstepFlags;

use super::start_vcpu_thread;
use super::synchronize_pre_loadvm;
use super::synchronize_put;
use super::synchronize_state;
use super::HwBackend;
use crate::clear_gdb_breakpoints_all;
use crate::generic_handle_interrupt;
use crate::insert_gdb_breakpoint_all;
use crate::remove_gdb_breakpoint_all;
use crate::AccelOps;
use crate::GuestDebugOps;
use crate::IdleOps;
use crate::Machine;
use crate::ResetOps;
use crate::Result;
use crate::SyncOps;
use crate::Vm;

pub struct KvmAccel {
    backend: Arc<dyn HwBackend>,
    halt_in_kernel: bool,
    guest_state_protected: bool,
}

impl KvmAccel {
    pub fn new(backend: Arc<dyn HwBackend>) -> KvmAccel {
        KvmAccel {
            backend,
            halt_in_kernel: false,
            guest_state_protected: false,
        }
    }

    /// The kernel handles guest halts itself, so a halted vCPU thread never sleeps in userspace.
    pub fn halt_in_kernel(mut self, enable: bool) -> KvmAccel {
        self.halt_in_kernel = enable;
        self
    }

    /// Guest register state is encrypted and CPUs cannot be reset from the host.
    pub fn guest_state_protected(mut self, protected: bool) -> KvmAccel {
        self.guest_state_protected = protected;
        self
    }

    fn update_all(&self, vm: &Vm, m: &mut Machine) -> Result<()> {
        for index in m.cpu_indices() {
            super::update_guest_debug(vm, m, index)?;
        }
        Ok(())
    }
}

impl AccelOps for KvmAccel {
    fn name(&self) -> &'static str {
        "kvm"
    }

    fn create_vcpu_thread(&self, vm: &Arc<Vm>, _m: &mut Machine, cpu: &Arc<Cpu>) -> Result<()> {
        start_vcpu_thread(vm, &self.backend, self.name(), cpu)
    }

    fn handle_interrupt(&self, vm: &Vm, cpu: &Cpu, mask: InterruptRequest) {
        generic_handle_interrupt(vm, cpu, mask);
    }

    fn idle(&self) -> Option<&dyn IdleOps> {
        Some(self)
    }

    fn reset(&self) -> Option<&dyn ResetOps> {
        Some(self)
    }

    fn sync(&self) -> Option<&dyn SyncOps> {
        Some(self)
    }

    fn guest_debug(&self) -> Option<&dyn GuestDebugOps> {
        Some(self)
    }

    fn supported_sstep_flags(&self) -> SstepFlags {
        SstepFlags::ENABLE | SstepFlags::NOIRQ
    }
}

impl IdleOps for KvmAccel {
    fn cpu_thread_is_idle(&self, _cpu: &Cpu, _state: &CpuState) -> bool {
        !self.halt_in_kernel
    }
}

impl ResetOps for KvmAccel {
    fn cpus_are_resettable(&self) -> bool {
        !self.guest_state_protected
    }
}

impl SyncOps for KvmAccel {
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

impl GuestDebugOps for KvmAccel {
    fn supports_guest_debug(&self) -> bool {
        true
    }

    fn insert_breakpoint(
        &self,
        vm: &Vm,
        m: &mut Machine,
        _index: usize,
        ty: GdbBreakpointType,
        addr: u64,
        len: u64,
    ) -> Result<()> {
        insert_gdb_breakpoint_all(m, ty, addr, len)?;
        self.update_all(vm, m)
    }

    fn remove_breakpoint(
        &self,
        vm: &Vm,
        m: &mut Machine,
        _index: usize,
        ty: GdbBreakpointType,
        addr: u64,
        len: u64,
    ) -> Result<()> {
        remove_gdb_breakpoint_all(m, ty, addr, len)?;
        self.update_all(vm, m)
    }

    fn remove_all_breakpoints(&self, vm: &Vm, m: &mut Machine, _index: usize) {
        clear_gdb_breakpoints_all(m);
        if let Err(e) = self.update_all(vm, m) {
            base::error!("kvm: failed to clear guest debug state: {}", e);
        }
    }

    fn update_guest_debug(&self, vm: &Vm, m: &mut Machine, index: usize) -> Result<()> {
        super::update_guest_debug(vm, m, index)
    }
}
