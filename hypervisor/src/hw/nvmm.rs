// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! NVMM flavor of the hardware accelerator. Same capability set as HAX.

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

pub struct NvmmAccel {
    backend: Arc<dyn HwBackend>,
}

impl NvmmAccel {
    pub fn new(backend: Arc<dyn HwBackend>) -> NvmmAccel {
        NvmmAccel { backend }
    }
}

impl AccelOps for NvmmAccel {
    fn name(&self) -> &'static str {
        "nvmm"
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

impl KickOps for NvmmAccel {
    fn kick_vcpu_thread(&self, _vm: &Vm, cpu: &Cpu) {
        // The exit request must be visible even if an earlier kick is still being coalesced.
        cpu.exit();
        cpus_kick_thread(cpu);
    }
}

impl SyncOps for NvmmAccel {
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

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use vcpu::micro::Asm;
    use vcpu::micro::MicroCpu;

    use super::*;
    use crate::cpu_remove_sync;
    use crate::hw::EmulatedBackend;
    use crate::vm::tests::test_vm;
    use crate::vm_start;

    #[test]
    fn vcpus_live_as_long_as_their_threads() {
        let backend = Arc::new(EmulatedBackend::new());
        let vm = test_vm(Box::new(NvmmAccel::new(backend.clone())), 2);
        {
            let m = vm.lock();
            let prog = Asm::new().movi(2, 3).dec(2).jnz(2, 4).inc(0).hlt().bytes();
            m.memory.write(0, &prog).unwrap();
        }
        vm.realize_cpus().unwrap();
        assert_eq!(backend.live_vcpus(), 2);
        {
            let m = vm.lock();
            for cpu in m.cpus() {
                let name = cpu.thread().and_then(|t| t.name().map(str::to_owned));
                assert_eq!(name, Some(format!("CPU {}/NVMM", cpu.index())));
            }
        }
        vm_start(&vm, &mut vm.lock());

        loop {
            let m = vm.lock();
            if m.slots().all(|s| s.state.halted) {
                break;
            }
            drop(m);
            thread::sleep(Duration::from_millis(1));
        }

        let mut m = vm.lock();
        for index in 0..2 {
            // The backend holds the program counter, the generic copy is refreshed on sync.
            crate::cpu_synchronize_state(&vm, &mut m, index);
            let micro = m.state_mut(index).unwrap().arch::<MicroCpu>().unwrap();
            assert_eq!(micro.reg(0), 1);
            assert_eq!(micro.reg(2), 0);
            cpu_remove_sync(&vm, &mut m, index).unwrap();
        }
        assert_eq!(backend.live_vcpus(), 0);
    }
}
