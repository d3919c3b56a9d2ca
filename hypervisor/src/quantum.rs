// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Moving CPU state out of the big lock for one quantum and back in.

use base::error;
use sync::BigLockGuard;
use vcpu::BreakpointSet;
use vcpu::Cpu;
use vcpu::CpuArch;
use vcpu::ExecControl;
use vcpu::HostCall;
use vcpu::QuantumExit;
use vcpu::SstepFlags;
use vcpu::WatchHit;

use crate::cpus::guest_shutdown;
use crate::cpus::handle_host_call;
use crate::Machine;
use crate::Vm;

/// What a quantum needs from the locked CPU state.
pub(crate) struct Checkout {
    env: Box<dyn CpuArch>,
    breakpoints: BreakpointSet,
    singlestep: SstepFlags,
    halted: bool,
}

/// What a quantum reports back.
pub(crate) struct Outcome {
    pub exit: QuantumExit,
    pub executed: u64,
    halted: bool,
    watch_hit: Option<WatchHit>,
    host_call: Option<HostCall>,
    shutdown: Option<i32>,
}

/// Takes the architecture state of CPU `index` out of the machine.
///
/// Panics if the CPU is missing or its state is already checked out: only the CPU's own thread
/// runs quanta and CPUs are removed only after that thread let go of them.
pub(crate) fn checkout(m: &mut Machine, index: usize) -> Checkout {
    let state = match m.state_mut(index) {
        Some(s) => s,
        None => panic!("cpu {} vanished while its thread was running", index),
    };
    let env = match state.checkout_env() {
        Ok(env) => env,
        Err(e) => panic!("cpu {}: {}", index, e),
    };
    Checkout {
        env,
        breakpoints: state.breakpoints.clone(),
        singlestep: state.singlestep,
        halted: state.halted,
    }
}

/// Runs `f` against the checked-out state. Call with the big lock released.
pub(crate) fn execute<F>(
    cpu: &Cpu,
    checkout: Checkout,
    budget: Option<u64>,
    f: F,
) -> (Box<dyn CpuArch>, Outcome)
where
    F: FnOnce(&mut dyn CpuArch, &mut ExecControl) -> QuantumExit,
{
    let Checkout {
        mut env,
        breakpoints,
        singlestep,
        halted,
    } = checkout;
    let mut ctl = ExecControl::new(
        cpu.exit_request_flag(),
        cpu.interrupt_request_flag(),
        &breakpoints,
    );
    ctl.singlestep = singlestep;
    ctl.budget = budget;
    ctl.halted = halted;
    let exit = f(env.as_mut(), &mut ctl);
    let outcome = Outcome {
        exit,
        executed: ctl.executed,
        halted: ctl.halted,
        watch_hit: ctl.watch_hit.take(),
        host_call: ctl.host_call.take(),
        shutdown: ctl.shutdown.take(),
    };
    (env, outcome)
}

/// Returns the architecture state and applies the side effects of the quantum.
pub(crate) fn finish(
    vm: &Vm,
    m: &mut BigLockGuard<Machine>,
    cpu: &Cpu,
    env: Box<dyn CpuArch>,
    outcome: &mut Outcome,
) {
    let index = cpu.index();
    cpu.record_quantum();
    let Some(state) = m.state_mut(index) else {
        error!("cpu {} removed during its quantum", index);
        return;
    };
    state.return_env(env);
    state.halted = outcome.halted;
    if let Some(hit) = outcome.watch_hit.take() {
        state.watchpoint_hit = Some(hit);
    }
    if let Some(call) = outcome.host_call.take() {
        handle_host_call(vm, m, index, call);
    }
    if let Some(code) = outcome.shutdown.take() {
        guest_shutdown(vm, m, code);
    }
}

#[cfg(test)]
mod tests {
    use vcpu::micro::Asm;

    use super::*;
    use crate::vm::tests::test_vm;
    use crate::vm::tests::NullAccel;

    #[test]
    fn checkout_execute_finish() {
        let vm = test_vm(Box::new(NullAccel), 1);
        let mut m = vm.lock();
        let prog = Asm::new().inc(0).inc(0).hlt().bytes();
        m.memory.write(0, &prog).unwrap();
        let cpu = m.cpu(0).unwrap();

        let co = checkout(&mut m, 0);
        assert!(m.state(0).unwrap().env().is_none());
        let (env, mut outcome) = m.unlocked(|| execute(&cpu, co, None, |env, ctl| env.exec(ctl)));
        assert_eq!(outcome.exit, QuantumExit::Halted);
        assert_eq!(outcome.executed, 3);
        finish(&vm, &mut m, &cpu, env, &mut outcome);
        assert!(m.state(0).unwrap().halted);
        assert_eq!(cpu.quanta(), 1);
        let micro = m
            .state_mut(0)
            .unwrap()
            .arch::<vcpu::micro::MicroCpu>()
            .unwrap();
        assert_eq!(micro.reg(0), 2);
    }

    #[test]
    #[should_panic(expected = "vanished")]
    fn checkout_of_missing_cpu_is_fatal() {
        let vm = test_vm(Box::new(NullAccel), 0);
        let mut m = vm.lock();
        checkout(&mut m, 0);
    }
}
