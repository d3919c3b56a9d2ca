// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Multi-threaded TCG: every vCPU gets its own host thread.

use std::sync::Arc;
use std::thread;

use base::debug;
use sync::Condvar;
use vcpu::mark_vcpu_thread;
use vcpu::set_current_cpu;
use vcpu::Cpu;
use vcpu::QuantumExit;

use super::tcg_cpu_exec;
use super::tcg_step_atomic;
use crate::cpu_can_run;
use crate::cpu_handle_guest_debug;
use crate::wait_io_event;
use crate::Error;
use crate::Result;
use crate::Vm;

pub(crate) fn start_vcpu_thread(vm: &Arc<Vm>, cpu: &Arc<Cpu>) -> Result<()> {
    cpu.set_halt_cond(Arc::new(Condvar::new()));
    let thread_vm = vm.clone();
    let thread_cpu = cpu.clone();
    let handle = thread::Builder::new()
        .name(format!("CPU {}/TCG", cpu.index()))
        .spawn(move || mttcg_cpu_thread_fn(thread_vm, thread_cpu))
        .map_err(Error::SpawnThread)?;
    cpu.set_join_handle(handle);
    Ok(())
}

fn mttcg_cpu_thread_fn(vm: Arc<Vm>, cpu: Arc<Cpu>) {
    let index = cpu.index();
    mark_vcpu_thread();
    set_current_cpu(Some(cpu.clone()));

    let mut m = vm.lock();
    cpu.bind_current_thread();
    cpu.set_can_do_io(true);
    if let Some(state) = m.state_mut(index) {
        state.created = true;
    }
    vm.cpu_cond.notify_all();
    debug!("cpu {} thread started", index);

    loop {
        let runnable = m.state(index).is_some_and(cpu_can_run);
        if runnable {
            let (exit, _) = tcg_cpu_exec(&vm, &mut m, &cpu, None);
            match exit {
                QuantumExit::DebugTrap => cpu_handle_guest_debug(&vm, &mut m, index),
                QuantumExit::AtomicRetry => {
                    if tcg_step_atomic(&vm, &mut m, &cpu) == QuantumExit::DebugTrap {
                        cpu_handle_guest_debug(&vm, &mut m, index);
                    }
                }
                QuantumExit::Normal | QuantumExit::Halted => {}
            }
        }

        cpu.clear_exit_request();
        wait_io_event(&vm, &mut m, &cpu);
        match m.state(index) {
            None => break,
            Some(state) if state.unplug && !cpu_can_run(state) => break,
            Some(_) => {}
        }
    }

    if let Some(state) = m.state_mut(index) {
        state.created = false;
    }
    vm.cpu_cond.notify_all();
    drop(m);
    set_current_cpu(None);
    debug!("cpu {} thread exited", index);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use vcpu::micro::Asm;
    use vcpu::micro::MicroCpu;

    use crate::cpu_remove_sync;
    use crate::tcg::TcgAccel;
    use crate::tcg::TcgConfig;
    use crate::vm::tests::test_vm;
    use crate::vm_start;

    #[test]
    fn threads_run_to_halt_and_unplug() {
        let vm = test_vm(Box::new(TcgAccel::new(TcgConfig::default())), 2);
        {
            let m = vm.lock();
            let prog = Asm::new().movi(1, 5).dec(1).jnz(1, 4).hlt().bytes();
            m.memory.write(0, &prog).unwrap();
        }
        vm.realize_cpus().unwrap();
        {
            let m = vm.lock();
            for cpu in m.cpus() {
                assert!(cpu.thread().is_some());
                assert!(!cpu.is_self());
            }
        }
        vm_start(&vm, &mut vm.lock());

        loop {
            let m = vm.lock();
            if m.slots().all(|s| s.state.halted) {
                break;
            }
            drop(m);
            std::thread::sleep(Duration::from_millis(1));
        }

        let mut m = vm.lock();
        for index in 0..2 {
            let micro = m.state_mut(index).unwrap().arch::<MicroCpu>().unwrap();
            assert_eq!(micro.reg(1), 0);
            cpu_remove_sync(&vm, &mut m, index).unwrap();
        }
        assert_eq!(m.num_cpus(), 0);
    }
}
