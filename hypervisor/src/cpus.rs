// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! vCPU lifecycle helpers shared by every accelerator: kicking, halting, pausing and resuming,
//! hot-unplug and whole-VM stop/start.
//!
//! Functions that may sleep take the big lock guard itself so they can wait with the lock
//! released. Everything else takes `&mut Machine`.

use std::sync::Arc;

use base::debug;
use base::error;
use sync::BigLockGuard;
use vcpu::current_cpu;
use vcpu::in_vcpu_thread;
use vcpu::Cpu;
use vcpu::CpuState;
use vcpu::HostCall;
use vcpu::HostCallArg;
use vcpu::InterruptRequest;
use vcpu::SstepFlags;

use crate::accel_cpu_thread_is_idle;
use crate::accel_kick_vcpu_thread;
use crate::cpu_synchronize_post_init;
use crate::cpu_synchronize_post_reset;
use crate::cpu_synchronize_pre_loadvm;
use crate::cpu_synchronize_pre_resume;
use crate::cpu_synchronize_state;
use crate::cpus_are_resettable;
use crate::process_queued_cpu_work;
use crate::supports_guest_debug;
use crate::update_guest_debug;
use crate::Error;
use crate::Machine;
use crate::Result;
use crate::RunState;
use crate::StateChange;
use crate::Vm;
use crate::VmRequest;

/// Whether the scheduler may run guest code on this CPU.
pub fn cpu_can_run(state: &CpuState) -> bool {
    !state.stop && !state.stopped
}

/// Whether the thread of `cpu` may sleep on its halt condition.
pub fn cpu_thread_is_idle(vm: &Vm, cpu: &Cpu, state: &CpuState) -> bool {
    if state.stop || !state.work.is_empty() {
        return false;
    }
    if state.stopped {
        return true;
    }
    if !state.halted || state.has_work(cpu) {
        return false;
    }
    accel_cpu_thread_is_idle(vm, cpu, state)
}

pub fn all_cpu_threads_idle(vm: &Vm, m: &Machine) -> bool {
    m.slots()
        .all(|s| cpu_thread_is_idle(vm, &s.cpu, &s.state))
}

pub fn all_vcpus_paused(m: &Machine) -> bool {
    m.slots().all(|s| s.state.stopped)
}

/// Generic kick: make the CPU leave its current quantum. Redundant kicks are coalesced until the
/// thread passes through its event wait.
pub fn cpus_kick_thread(cpu: &Cpu) {
    if !cpu.mark_kicked() {
        cpu.exit();
    }
}

/// Wakes `cpu` from halt and forces it out of guest code.
pub fn cpu_kick(vm: &Vm, cpu: &Cpu) {
    if let Some(cond) = cpu.halt_cond() {
        cond.notify_all();
    }
    if !accel_kick_vcpu_thread(vm, cpu) {
        cpus_kick_thread(cpu);
    }
}

pub fn cpu_kick_self() {
    if let Some(cpu) = current_cpu() {
        cpus_kick_thread(&cpu);
    }
}

/// Delivers interrupt bits through the accelerator.
pub fn cpu_interrupt(vm: &Vm, cpu: &Cpu, mask: InterruptRequest) {
    vm.accel().handle_interrupt(vm, cpu, mask);
}

pub fn cpu_reset_interrupt(cpu: &Cpu, mask: InterruptRequest) {
    cpu.clear_interrupt(mask);
}

/// Interrupt delivery for accelerators without a special path: raise the bits and wake the CPU
/// unless the caller is that CPU.
pub fn generic_handle_interrupt(vm: &Vm, cpu: &Cpu, mask: InterruptRequest) {
    cpu.raise_interrupt(mask);
    if !cpu.is_self() {
        cpu_kick(vm, cpu);
    }
}

/// Stops the calling CPU. Only valid on the CPU's own thread.
pub fn cpu_stop(vm: &Vm, m: &mut Machine, index: usize, exit: bool) {
    let Some(slot) = m.slot_mut(index) else {
        return;
    };
    assert!(slot.cpu.is_self(), "cpu {} stopped from a foreign thread", index);
    slot.state.stop = false;
    slot.state.stopped = true;
    if exit {
        slot.cpu.exit();
    }
    vm.pause_cond.notify_all();
}

/// Asks the CPU running on this thread to stop after the current quantum.
pub fn cpu_stop_current(m: &mut Machine) {
    if let Some(cpu) = current_cpu() {
        if let Some(state) = m.state_mut(cpu.index()) {
            state.stop = true;
        }
        cpu.exit();
    }
}

/// Common tail of every vCPU event wait: acknowledge kicks, honor stop requests and run queued
/// work.
pub fn wait_io_event_common(vm: &Vm, m: &mut Machine, cpu: &Cpu) {
    cpu.clear_kicked();
    let index = cpu.index();
    if let Some(state) = m.state_mut(index) {
        if state.stop {
            state.stop = false;
            state.stopped = true;
            vm.pause_cond.notify_all();
        }
    }
    process_queued_cpu_work(vm, m, index);
}

/// Sleeps while the CPU is idle, then runs [`wait_io_event_common`].
pub fn wait_io_event(vm: &Vm, m: &mut BigLockGuard<Machine>, cpu: &Arc<Cpu>) {
    while let Some(slot) = m.slot(cpu.index()) {
        if !cpu_thread_is_idle(vm, &slot.cpu, &slot.state) {
            break;
        }
        match cpu.halt_cond() {
            Some(cond) => cond.wait_big(m),
            None => break,
        }
    }
    wait_io_event_common(vm, m, cpu);
}

/// Stops every CPU and waits until all of them are stopped.
pub fn pause_all_vcpus(vm: &Vm, m: &mut BigLockGuard<Machine>) {
    m.clock.disable();
    for cpu in m.cpus() {
        if cpu.is_self() {
            cpu_stop(vm, m, cpu.index(), true);
        } else {
            if let Some(state) = m.state_mut(cpu.index()) {
                state.stop = true;
            }
            cpu_kick(vm, &cpu);
        }
    }

    while !all_vcpus_paused(m) {
        vm.pause_cond.wait_big(m);
        for cpu in m.cpus() {
            cpu_kick(vm, &cpu);
        }
    }
}

pub fn cpu_resume(vm: &Vm, m: &mut Machine, index: usize) {
    let Some(slot) = m.slot_mut(index) else {
        return;
    };
    slot.state.stop = false;
    slot.state.stopped = false;
    let cpu = slot.cpu.clone();
    cpu_kick(vm, &cpu);
}

/// Lets every CPU run again. Does nothing unless the machine is in the running state.
pub fn resume_all_vcpus(vm: &Vm, m: &mut Machine) {
    if !m.is_running() {
        return;
    }
    m.clock.enable();
    for index in m.cpu_indices() {
        cpu_resume(vm, m, index);
    }
}

/// Hot-unplugs CPU `index`: stops it, waits for its thread to let go and removes it.
pub fn cpu_remove_sync(vm: &Vm, m: &mut BigLockGuard<Machine>, index: usize) -> Result<()> {
    let cpu = {
        let slot = m.slot_mut(index).ok_or(Error::NoSuchCpu(index))?;
        slot.state.stop = true;
        slot.state.unplug = true;
        slot.cpu.clone()
    };
    cpu_kick(vm, &cpu);

    while m.state(index).is_some_and(|s| s.created) {
        vm.cpu_cond.wait_big(m);
    }
    if let Some(handle) = cpu.take_join_handle() {
        if m.unlocked(|| handle.join()).is_err() {
            error!("vcpu thread of cpu {} panicked", index);
        }
    }
    m.remove_cpu(index);
    // A shared scheduler thread may be sleeping on the removed CPU's halt condition.
    if let Some(cond) = cpu.halt_cond() {
        cond.notify_all();
    }
    debug!("cpu {} removed", index);
    Ok(())
}

fn do_vm_stop(vm: &Vm, m: &mut BigLockGuard<Machine>, state: RunState) {
    if m.is_running() {
        m.set_run_state(state);
        pause_all_vcpus(vm, m);
        m.notify(StateChange::Stopped(state));
    }
}

/// Stops the machine in `state`.
///
/// From a vCPU thread the stop is only requested; the main loop performs it and the calling CPU
/// leaves guest code right away.
pub fn vm_stop(vm: &Vm, m: &mut BigLockGuard<Machine>, state: RunState) {
    if in_vcpu_thread() {
        m.request_vmstop(state);
        vm.request(VmRequest::Wakeup);
        cpu_stop_current(m);
        return;
    }
    do_vm_stop(vm, m, state);
}

/// Moves the machine into the running state without resuming CPUs. Returns false if it already
/// was running.
pub fn vm_prepare_start(vm: &Vm, m: &mut Machine, step_pending: bool) -> bool {
    // A stop requested before this start is obsolete.
    m.take_vmstop_request();
    if m.is_running() {
        return false;
    }
    cpu_synchronize_pre_resume(vm, m, step_pending);
    m.clock.enable();
    m.set_run_state(RunState::Running);
    m.notify(StateChange::Running);
    true
}

pub fn vm_start(vm: &Vm, m: &mut Machine) {
    if vm_prepare_start(vm, m, false) {
        resume_all_vcpus(vm, m);
    }
}

/// Debug exit of CPU `index`: stop it and ask the main loop for a debug stop of the machine.
pub fn cpu_handle_guest_debug(vm: &Vm, m: &mut Machine, index: usize) {
    m.debug_stop_cpu = Some(index);
    m.request_debug();
    if let Some(state) = m.state_mut(index) {
        state.stopped = true;
    }
    vm.request(VmRequest::Wakeup);
}

/// Changes the single-step flags of CPU `index` and tells the accelerator.
pub fn cpu_single_step(vm: &Vm, m: &mut Machine, index: usize, flags: SstepFlags) -> Result<()> {
    let state = m.state_mut(index).ok_or(Error::NoSuchCpu(index))?;
    if state.singlestep != flags {
        state.singlestep = flags;
        if supports_guest_debug(vm) {
            update_guest_debug(vm, m, index)?;
        }
    }
    Ok(())
}

/// Resets the architecture state of CPU `index`. Returns false if the accelerator refuses.
pub fn cpu_reset(vm: &Vm, m: &mut BigLockGuard<Machine>, index: usize) -> Result<bool> {
    if !cpus_are_resettable(vm) {
        return Ok(false);
    }
    let state = m.state_mut(index).ok_or(Error::NoSuchCpu(index))?;
    state.env_mut().ok_or(vcpu::Error::EnvCheckedOut)?.reset();
    state.halted = false;
    state.watchpoint_hit = None;
    if let Some(cpu) = m.cpu(index) {
        cpu.clear_interrupt(InterruptRequest::all());
    }
    cpu_synchronize_post_reset(vm, m, index);
    Ok(true)
}

/// Handles a host call raised by CPU `index`.
///
/// With a debugger attached the call is forwarded to it and the machine stops until the reply
/// arrives. Otherwise `write` is served locally on the machine console and anything else fails
/// with `ENOSYS`.
pub fn handle_host_call(vm: &Vm, m: &mut BigLockGuard<Machine>, index: usize, call: HostCall) {
    if m.debugger_attached {
        m.pending_host_call = Some((index, call));
        vm_stop(vm, m, RunState::Debug);
        return;
    }

    const ENOSYS: u64 = 38;
    const EIO: u64 = 5;
    let (ret, errno) = match (call.name, call.args.as_slice()) {
        ("write", [HostCallArg::Int(_fd), HostCallArg::Buffer { addr, len }]) => {
            // The length comes from the guest; anything larger than RAM cannot be read anyway.
            let mut buf = match usize::try_from(*len) {
                Ok(n) if n <= m.memory.size() => vec![0u8; n],
                _ => Vec::new(),
            };
            let res = buf.len() as u64 == *len
                && match m.state_mut(index) {
                    Some(state) => state.memory_rw_debug(*addr, &mut buf, false).is_ok(),
                    None => false,
                };
            if res && m.console.write_all(&buf).is_ok() {
                (*len, 0)
            } else {
                (u64::MAX, EIO)
            }
        }
        _ => {
            debug!("unhandled host call {} from cpu {}", call.name, index);
            (u64::MAX, ENOSYS)
        }
    };
    if let Some(env) = m.state_mut(index).and_then(|s| s.env_mut()) {
        env.complete_host_call(ret, errno);
    }
}

/// Guest-initiated shutdown of the whole machine.
pub fn guest_shutdown(vm: &Vm, m: &mut Machine, code: i32) {
    vm.request(VmRequest::Shutdown(code));
    cpu_stop_current(m);
}

pub fn cpu_synchronize_all_states(vm: &Vm, m: &mut BigLockGuard<Machine>) {
    for index in m.cpu_indices() {
        cpu_synchronize_state(vm, m, index);
    }
}

pub fn cpu_synchronize_all_post_reset(vm: &Vm, m: &mut BigLockGuard<Machine>) {
    for index in m.cpu_indices() {
        cpu_synchronize_post_reset(vm, m, index);
    }
}

pub fn cpu_synchronize_all_post_init(vm: &Vm, m: &mut BigLockGuard<Machine>) {
    for index in m.cpu_indices() {
        cpu_synchronize_post_init(vm, m, index);
    }
}

pub fn cpu_synchronize_all_pre_loadvm(vm: &Vm, m: &mut BigLockGuard<Machine>) {
    for index in m.cpu_indices() {
        cpu_synchronize_pre_loadvm(vm, m, index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::tests::test_vm;
    use crate::vm::tests::NullAccel;

    #[test]
    fn can_run_and_idle() {
        let vm = test_vm(Box::new(NullAccel), 1);
        let mut m = vm.lock();
        let cpu = m.cpu(0).unwrap();
        {
            let state = m.state_mut(0).unwrap();
            assert!(!cpu_can_run(state));
            state.stopped = false;
            assert!(cpu_can_run(state));
        }
        let state = m.state(0).unwrap();
        assert!(!cpu_thread_is_idle(&vm, &cpu, state));
        m.state_mut(0).unwrap().halted = true;
        assert!(all_cpu_threads_idle(&vm, &m));
        cpu.raise_interrupt(InterruptRequest::HARD);
        assert!(!all_cpu_threads_idle(&vm, &m));
        cpu.clear_interrupt(InterruptRequest::HARD);
        m.state_mut(0).unwrap().stop = true;
        assert!(!all_cpu_threads_idle(&vm, &m));
    }

    #[test]
    fn kicks_coalesce() {
        let vm = test_vm(Box::new(NullAccel), 1);
        let cpu = vm.lock().cpu(0).unwrap();
        cpu_kick(&vm, &cpu);
        assert!(cpu.exit_requested());
        cpu.clear_exit_request();
        cpu_kick(&vm, &cpu);
        assert!(!cpu.exit_requested());
        let mut m = vm.lock();
        wait_io_event_common(&vm, &mut m, &cpu);
        cpu_kick(&vm, &cpu);
        assert!(cpu.exit_requested());
    }

    #[test]
    fn stop_request_is_honored_at_event_wait() {
        let vm = test_vm(Box::new(NullAccel), 1);
        let mut m = vm.lock();
        let cpu = m.cpu(0).unwrap();
        m.state_mut(0).unwrap().stopped = false;
        m.state_mut(0).unwrap().stop = true;
        wait_io_event_common(&vm, &mut m, &cpu);
        let state = m.state(0).unwrap();
        assert!(state.stopped && !state.stop);
    }

    #[test]
    fn vm_start_and_stop_from_main_thread() {
        let vm = test_vm(Box::new(NullAccel), 2);
        let (tx, rx) = std::sync::mpsc::channel();
        let mut m = vm.lock();
        m.add_state_listener(tx);
        // Both CPUs are bound to this thread, so pausing stops them synchronously.
        for cpu in m.cpus() {
            cpu.bind_current_thread();
        }
        vm_start(&vm, &mut m);
        assert!(m.is_running());
        assert!(m.clock.is_enabled());
        assert!(m.slots().all(|s| cpu_can_run(&s.state)));
        assert!(!vm_prepare_start(&vm, &mut m, false));

        vm_stop(&vm, &mut m, RunState::Paused);
        assert_eq!(m.run_state(), RunState::Paused);
        assert!(all_vcpus_paused(&m));
        assert!(!m.clock.is_enabled());
        resume_all_vcpus(&vm, &mut m);
        assert!(all_vcpus_paused(&m));
        assert_eq!(rx.try_recv().unwrap(), StateChange::Running);
        assert_eq!(
            rx.try_recv().unwrap(),
            StateChange::Stopped(RunState::Paused)
        );
    }

    #[test]
    fn guest_debug_records_stop_cpu() {
        let vm = test_vm(Box::new(NullAccel), 1);
        let mut m = vm.lock();
        cpu_handle_guest_debug(&vm, &mut m, 0);
        assert_eq!(m.debug_stop_cpu, Some(0));
        assert!(m.take_debug_request());
        assert!(m.state(0).unwrap().stopped);
    }

    #[test]
    fn single_step_without_debug_support() {
        let vm = test_vm(Box::new(NullAccel), 1);
        let mut m = vm.lock();
        cpu_single_step(&vm, &mut m, 0, SstepFlags::ENABLE).unwrap();
        assert_eq!(m.state(0).unwrap().singlestep, SstepFlags::ENABLE);
        assert!(cpu_single_step(&vm, &mut m, 3, SstepFlags::ENABLE).is_err());
    }

    #[test]
    fn local_write_host_call() {
        use std::io::Write;
        use std::sync::Mutex as StdMutex;

        #[derive(Clone, Default)]
        struct Shared(Arc<StdMutex<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let vm = test_vm(Box::new(NullAccel), 1);
        let mut m = vm.lock();
        let out = Shared::default();
        m.console = Box::new(out.clone());
        m.memory.write(0x10, b"hi").unwrap();
        let call = HostCall {
            name: "write",
            args: vec![HostCallArg::Int(1), HostCallArg::Buffer { addr: 0x10, len: 2 }],
        };
        handle_host_call(&vm, &mut m, 0, call);
        assert_eq!(out.0.lock().unwrap().as_slice(), b"hi");
        let cpu = m
            .state_mut(0)
            .unwrap()
            .arch::<vcpu::micro::MicroCpu>()
            .unwrap();
        assert_eq!(cpu.reg(0), 2);
    }

    #[test]
    fn oversized_host_write_fails_with_eio() {
        let vm = test_vm(Box::new(NullAccel), 1);
        let mut m = vm.lock();
        for len in [u64::MAX, m.memory.size() as u64 + 1] {
            let call = HostCall {
                name: "write",
                args: vec![HostCallArg::Int(1), HostCallArg::Buffer { addr: 0x10, len }],
            };
            handle_host_call(&vm, &mut m, 0, call);
            let cpu = m
                .state_mut(0)
                .unwrap()
                .arch::<vcpu::micro::MicroCpu>()
                .unwrap();
            assert_eq!(cpu.reg(0), u64::MAX);
            assert_eq!(cpu.reg(1), 5);
        }
    }

    #[test]
    fn reset_clears_halt() {
        let vm = test_vm(Box::new(NullAccel), 1);
        let mut m = vm.lock();
        m.state_mut(0).unwrap().halted = true;
        assert!(cpu_reset(&vm, &mut m, 0).unwrap());
        assert!(!m.state(0).unwrap().halted);
    }
}
