// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware virtualization accelerators.
//!
//! KVM, HAX and NVMM all run one host thread per vCPU around an opaque backend that creates,
//! runs and destroys vCPUs. The flavors only differ in the optional capabilities they offer, so
//! the thread loop and the register synchronization live here and the flavor modules just pick
//! which pieces to expose.
//!
//! Register state has two copies: the generic one in [`CpuState`] and the backend's private one.
//! The `dirty` flag of [`HwVcpuSlot`] records that the generic copy is newer and must be pushed
//! down before the vCPU runs again.

pub mod hax;
pub mod kvm;
pub mod nvmm;

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use base::debug;
use base::error;
use downcast_rs::impl_downcast;
use downcast_rs::Downcast;
use sync::BigLockGuard;
use sync::Condvar;
use vcpu::mark_vcpu_thread;
use vcpu::set_current_cpu;
use vcpu::AccelVcpu;
use vcpu::Cpu;
use vcpu::CpuArch;
use vcpu::CpuState;
use vcpu::ExecControl;
use vcpu::QuantumExit;
use vcpu::SstepFlags;

use crate::async_run_on_cpu;
use crate::cpu_can_run;
use crate::cpu_handle_guest_debug;
use crate::quantum::checkout;
use crate::quantum::execute;
use crate::quantum::finish;
use crate::run_on_cpu;
use crate::wait_io_event;
use crate::Error;
use crate::Machine;
use crate::Result;
use crate::Vm;

/// Why [`HwVcpu::run`] returned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VcpuExit {
    /// Interrupted by a kick, an exit request or the end of the time slice.
    Intr,
    /// The guest halted.
    Hlt,
    /// A breakpoint, watchpoint or single step fired.
    Debug,
}

/// A vCPU created by a hardware backend.
pub trait HwVcpu: Downcast + Send {
    /// Runs guest code until an exit. `ctl` carries the exit request, pending interrupts and
    /// debug state just like it does for software execution.
    fn run(&mut self, env: &mut dyn CpuArch, ctl: &mut ExecControl) -> Result<VcpuExit>;

    /// Copies the backend's register state into `env`.
    fn get_registers(&mut self, _env: &mut dyn CpuArch) {}

    /// Loads the register state of `env` into the backend.
    fn put_registers(&mut self, _env: &dyn CpuArch) {}

    fn set_guest_debug(&mut self, _enable: bool, _singlestep: SstepFlags) -> Result<()> {
        Ok(())
    }
}
impl_downcast!(HwVcpu);

/// The opaque init/destroy half of a hardware backend.
pub trait HwBackend: Send + Sync {
    fn init_vcpu(&self, index: usize) -> Result<Box<dyn HwVcpu>>;

    fn destroy_vcpu(&self, _vcpu: Box<dyn HwVcpu>) {}
}

/// Per-CPU accelerator state of the hardware flavors.
pub struct HwVcpuSlot {
    pub vcpu: Box<dyn HwVcpu>,
    /// The generic register state is newer than the backend's.
    pub dirty: bool,
}

impl AccelVcpu for HwVcpuSlot {}

/// Runs `f` with the hardware vCPU of `state` and its architecture state. Does nothing if the
/// CPU has no hardware vCPU yet.
pub fn with_hw_vcpu<F>(state: &mut CpuState, f: F)
where
    F: FnOnce(&mut HwVcpuSlot, &mut dyn CpuArch),
{
    let Some(accel) = state.take_accel() else {
        return;
    };
    match accel.downcast::<HwVcpuSlot>() {
        Ok(mut slot) => {
            if let Some(env) = state.env_mut() {
                f(&mut slot, env);
            }
            state.set_accel(slot);
        }
        Err(other) => state.set_accel(other),
    }
}

/// Backend that runs guest code through the architecture's own interpreter.
///
/// It stands in for the host hypervisor interface: the program counter is kept privately and only
/// exchanged with the generic state through [`HwVcpu::get_registers`] and
/// [`HwVcpu::put_registers`], which makes missing synchronization visible.
#[derive(Default)]
pub struct EmulatedBackend {
    live: Arc<AtomicUsize>,
}

impl EmulatedBackend {
    pub fn new() -> EmulatedBackend {
        Default::default()
    }

    /// Number of vCPUs created and not yet destroyed.
    pub fn live_vcpus(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

impl HwBackend for EmulatedBackend {
    fn init_vcpu(&self, index: usize) -> Result<Box<dyn HwVcpu>> {
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(EmulatedVcpu {
            index,
            pc: 0,
            guest_debug: false,
        }))
    }

    fn destroy_vcpu(&self, vcpu: Box<dyn HwVcpu>) {
        drop(vcpu);
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct EmulatedVcpu {
    index: usize,
    pc: u64,
    guest_debug: bool,
}

impl EmulatedVcpu {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn guest_debug(&self) -> bool {
        self.guest_debug
    }
}

impl HwVcpu for EmulatedVcpu {
    fn run(&mut self, env: &mut dyn CpuArch, ctl: &mut ExecControl) -> Result<VcpuExit> {
        env.set_pc(self.pc);
        let exit = loop {
            match env.exec(ctl) {
                // Hardware runs atomics natively.
                QuantumExit::AtomicRetry => {
                    let before = ctl.executed;
                    env.step_atomic(ctl);
                    let stepped = ctl.singlestep.contains(SstepFlags::ENABLE) && ctl.executed > before;
                    if stepped || ctl.watch_hit.is_some() {
                        break QuantumExit::DebugTrap;
                    }
                }
                exit => break exit,
            }
        };
        self.pc = env.pc();
        Ok(match exit {
            QuantumExit::DebugTrap => VcpuExit::Debug,
            QuantumExit::Halted => VcpuExit::Hlt,
            QuantumExit::Normal | QuantumExit::AtomicRetry => VcpuExit::Intr,
        })
    }

    fn get_registers(&mut self, env: &mut dyn CpuArch) {
        env.set_pc(self.pc);
    }

    fn put_registers(&mut self, env: &dyn CpuArch) {
        self.pc = env.pc();
    }

    fn set_guest_debug(&mut self, enable: bool, _singlestep: SstepFlags) -> Result<()> {
        self.guest_debug = enable;
        Ok(())
    }
}

/// Starts the thread of `cpu` for the hardware accelerator `name`.
pub(crate) fn start_vcpu_thread(
    vm: &Arc<Vm>,
    backend: &Arc<dyn HwBackend>,
    name: &'static str,
    cpu: &Arc<Cpu>,
) -> Result<()> {
    cpu.set_halt_cond(Arc::new(Condvar::new()));
    let thread_vm = vm.clone();
    let thread_backend = backend.clone();
    let thread_cpu = cpu.clone();
    let handle = thread::Builder::new()
        .name(format!("CPU {}/{}", cpu.index(), name.to_uppercase()))
        .spawn(move || hw_cpu_thread_fn(thread_vm, thread_backend, name, thread_cpu))
        .map_err(Error::SpawnThread)?;
    cpu.set_join_handle(handle);
    Ok(())
}

fn hw_cpu_thread_fn(vm: Arc<Vm>, backend: Arc<dyn HwBackend>, name: &'static str, cpu: Arc<Cpu>) {
    let index = cpu.index();
    mark_vcpu_thread();
    set_current_cpu(Some(cpu.clone()));

    let mut m = vm.lock();
    cpu.bind_current_thread();
    cpu.set_can_do_io(true);
    let vcpu = match backend.init_vcpu(index) {
        Ok(vcpu) => vcpu,
        Err(e) => panic!("{}: failed to create vcpu {}: {}", name, index, e),
    };
    if let Some(state) = m.state_mut(index) {
        state.set_accel(Box::new(HwVcpuSlot { vcpu, dirty: true }));
        state.created = true;
    }
    vm.cpu_cond.notify_all();
    debug!("{}: cpu {} thread started", name, index);

    loop {
        if m.state(index).is_some_and(cpu_can_run) {
            match hw_vcpu_exec(&vm, &mut m, &cpu) {
                Ok(VcpuExit::Debug) => cpu_handle_guest_debug(&vm, &mut m, index),
                Ok(VcpuExit::Intr) | Ok(VcpuExit::Hlt) => {}
                Err(e) => panic!("{}: cpu {} failed to run: {}", name, index, e),
            }
        }
        wait_io_event(&vm, &mut m, &cpu);
        match m.state(index) {
            None => break,
            Some(state) if state.unplug && !cpu_can_run(state) => break,
            Some(_) => {}
        }
    }

    if let Some(state) = m.state_mut(index) {
        if let Some(accel) = state.take_accel() {
            if let Ok(slot) = accel.downcast::<HwVcpuSlot>() {
                backend.destroy_vcpu(slot.vcpu);
            }
        }
        state.created = false;
    }
    vm.cpu_cond.notify_all();
    drop(m);
    set_current_cpu(None);
    debug!("{}: cpu {} thread exited", name, index);
}

/// Runs the hardware vCPU of `cpu` once, with the big lock released around the run.
fn hw_vcpu_exec(vm: &Vm, m: &mut BigLockGuard<Machine>, cpu: &Arc<Cpu>) -> Result<VcpuExit> {
    let index = cpu.index();
    let backend_error = |reason: &str| Error::Backend {
        accel: vm.accel().name(),
        index,
        reason: reason.to_string(),
    };
    let state = m.state_mut(index).ok_or(Error::NoSuchCpu(index))?;
    let mut slot = state
        .take_accel()
        .and_then(|a| a.downcast::<HwVcpuSlot>().ok())
        .ok_or_else(|| backend_error("vcpu not initialized"))?;
    if slot.dirty {
        let Some(env) = state.env() else {
            state.set_accel(slot);
            return Err(vcpu::Error::EnvCheckedOut.into());
        };
        slot.vcpu.put_registers(env);
        slot.dirty = false;
    }

    let co = checkout(m, index);
    let mut result = Ok(VcpuExit::Intr);
    let (env, mut outcome) = m.unlocked(|| {
        let _quantum = vm.start_quantum();
        execute(cpu, co, None, |env, ctl| {
            result = slot.vcpu.run(env, ctl);
            match result {
                Ok(VcpuExit::Debug) => QuantumExit::DebugTrap,
                Ok(VcpuExit::Hlt) => QuantumExit::Halted,
                Ok(VcpuExit::Intr) | Err(_) => QuantumExit::Normal,
            }
        })
    });
    finish(vm, m, cpu, env, &mut outcome);
    if let Some(state) = m.state_mut(index) {
        state.set_accel(slot);
    }
    cpu.clear_exit_request();
    result
}

pub(crate) fn synchronize_state(vm: &Vm, m: &mut BigLockGuard<Machine>, index: usize) {
    let res = run_on_cpu(vm, m, index, |_, state| {
        with_hw_vcpu(state, |slot, env| {
            if !slot.dirty {
                slot.vcpu.get_registers(env);
                slot.dirty = true;
            }
        })
    });
    if let Err(e) = res {
        error!("failed to synchronize cpu {}: {}", index, e);
    }
}

/// Pushes the generic register state down after reset or init.
pub(crate) fn synchronize_put(vm: &Vm, m: &mut BigLockGuard<Machine>, index: usize) {
    let res = run_on_cpu(vm, m, index, |_, state| {
        with_hw_vcpu(state, |slot, env| {
            slot.vcpu.put_registers(env);
            slot.dirty = false;
        })
    });
    if let Err(e) = res {
        error!("failed to load registers of cpu {}: {}", index, e);
    }
}

pub(crate) fn synchronize_pre_loadvm(vm: &Vm, m: &mut BigLockGuard<Machine>, index: usize) {
    let res = run_on_cpu(vm, m, index, |_, state| {
        with_hw_vcpu(state, |slot, _| slot.dirty = true)
    });
    if let Err(e) = res {
        error!("failed to prepare cpu {} for loadvm: {}", index, e);
    }
}

/// Pushes breakpoints and single-step state of CPU `index` to its hardware vCPU.
pub(crate) fn update_guest_debug(vm: &Vm, m: &mut Machine, index: usize) -> Result<()> {
    async_run_on_cpu(vm, m, index, |cpu, state| {
        let singlestep = state.singlestep;
        let enable = !state.breakpoints.is_empty() || singlestep.contains(SstepFlags::ENABLE);
        with_hw_vcpu(state, |slot, _| {
            if let Err(e) = slot.vcpu.set_guest_debug(enable, singlestep) {
                error!("cpu {}: failed to update guest debug: {}", cpu.index(), e);
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use vcpu::micro::Asm;
    use vcpu::micro::MicroCpu;
    use vcpu::InterruptRequest;

    use super::*;
    use crate::cpu_interrupt;
    use crate::cpu_remove_sync;
    use crate::cpu_synchronize_state;
    use crate::hw::kvm::KvmAccel;
    use crate::vm::tests::test_vm;
    use crate::vm_start;

    fn wait_for(vm: &Vm, mut cond: impl FnMut(&mut Machine) -> bool) {
        loop {
            let mut m = vm.lock();
            if cond(&mut *m) {
                return;
            }
            drop(m);
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn reg(m: &mut Machine, index: usize, n: usize) -> Option<u64> {
        m.state_mut(index)?.arch::<MicroCpu>().map(|c| c.reg(n))
    }

    #[test]
    fn emulated_backend_counts_vcpus() {
        let backend = EmulatedBackend::new();
        let vcpu = backend.init_vcpu(3).unwrap();
        assert_eq!(backend.live_vcpus(), 1);
        assert_eq!(vcpu.downcast_ref::<EmulatedVcpu>().unwrap().index(), 3);
        backend.destroy_vcpu(vcpu);
        assert_eq!(backend.live_vcpus(), 0);
    }

    #[test]
    fn register_writes_need_synchronization() {
        let backend = Arc::new(EmulatedBackend::new());
        let vm = test_vm(Box::new(KvmAccel::new(backend.clone())), 1);
        {
            let m = vm.lock();
            m.memory.write(0, &Asm::new().movi(1, 1).hlt().bytes()).unwrap();
            m.memory.write(0x20, &Asm::new().inc(3).hlt().bytes()).unwrap();
        }
        vm.realize_cpus().unwrap();
        assert_eq!(backend.live_vcpus(), 1);
        vm_start(&vm, &mut vm.lock());
        wait_for(&vm, |m| m.state(0).unwrap().halted);

        let mut m = vm.lock();
        assert_eq!(reg(&mut m, 0, 1), Some(1));
        cpu_synchronize_state(&vm, &mut m, 0);
        let state = m.state_mut(0).unwrap();
        assert!(state.accel::<HwVcpuSlot>().unwrap().dirty);
        state.env_mut().unwrap().set_pc(0x20);
        let cpu = m.cpu(0).unwrap();
        cpu_interrupt(&vm, &cpu, InterruptRequest::HARD);
        drop(m);

        wait_for(&vm, |m| reg(m, 0, 3) == Some(1) && m.state(0).unwrap().halted);
        let mut m = vm.lock();
        cpu_remove_sync(&vm, &mut m, 0).unwrap();
        assert_eq!(backend.live_vcpus(), 0);
    }

    #[test]
    fn failed_run_keeps_the_vcpu() {
        let backend = Arc::new(EmulatedBackend::new());
        let vm = test_vm(Box::new(KvmAccel::new(backend.clone())), 1);
        let mut m = vm.lock();
        let vcpu = backend.init_vcpu(0).unwrap();
        let state = m.state_mut(0).unwrap();
        state.set_accel(Box::new(HwVcpuSlot { vcpu, dirty: true }));
        let env = state.checkout_env().unwrap();

        let cpu = m.cpu(0).unwrap();
        assert!(matches!(
            hw_vcpu_exec(&vm, &mut m, &cpu),
            Err(Error::Vcpu(vcpu::Error::EnvCheckedOut))
        ));
        let state = m.state_mut(0).unwrap();
        assert!(state.accel::<HwVcpuSlot>().unwrap().dirty);
        assert_eq!(backend.live_vcpus(), 1);
        state.return_env(env);
    }

    #[test]
    fn guest_debug_reaches_the_vcpu() {
        let backend = Arc::new(EmulatedBackend::new());
        let vm = test_vm(Box::new(KvmAccel::new(backend.clone())), 1);
        let mut m = vm.lock();
        let vcpu = backend.init_vcpu(0).unwrap();
        m.state_mut(0).unwrap().set_accel(Box::new(HwVcpuSlot { vcpu, dirty: false }));

        crate::insert_breakpoint(&vm, &mut m, 0, 0, 0x10, 1).unwrap();
        crate::process_queued_cpu_work(&vm, &mut m, 0);
        let enabled = |m: &mut Machine| {
            m.state_mut(0)
                .unwrap()
                .accel::<HwVcpuSlot>()
                .unwrap()
                .vcpu
                .downcast_ref::<EmulatedVcpu>()
                .unwrap()
                .guest_debug()
        };
        assert!(enabled(&mut m));
        crate::remove_breakpoint(&vm, &mut m, 0, 0, 0x10, 1).unwrap();
        crate::process_queued_cpu_work(&vm, &mut m, 0);
        assert!(!enabled(&mut m));
    }
}
