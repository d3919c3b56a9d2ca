// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::atomic::Ordering;

use sync::BigLockGuard;
use vcpu::Cpu;
use vcpu::CpuState;
use vcpu::WorkItem;

use crate::cpus::cpu_kick;
use crate::Error;
use crate::Machine;
use crate::Result;
use crate::Vm;

/// Runs `func` on the thread of CPU `index` and waits for it to finish.
///
/// When called from that thread the closure runs right away. Otherwise it is queued, the CPU is
/// kicked and the caller sleeps on the work condition with the big lock released.
pub fn run_on_cpu<F>(vm: &Vm, m: &mut BigLockGuard<Machine>, index: usize, func: F) -> Result<()>
where
    F: FnOnce(&Cpu, &mut CpuState) + Send + 'static,
{
    let slot = m.slot_mut(index).ok_or(Error::NoSuchCpu(index))?;
    if slot.cpu.is_self() {
        func(&slot.cpu, &mut slot.state);
        return Ok(());
    }

    let cpu = slot.cpu.clone();
    let (item, done) = WorkItem::waited(Box::new(func));
    slot.state.work.push(item);
    cpu_kick(vm, &cpu);

    while !done.load(Ordering::Acquire) {
        if m.slot(index).is_none() {
            return Err(Error::NoSuchCpu(index));
        }
        vm.work_cond.wait_big(m);
    }
    Ok(())
}

/// Queues `func` on the thread of CPU `index` without waiting for it.
pub fn async_run_on_cpu<F>(vm: &Vm, m: &mut Machine, index: usize, func: F) -> Result<()>
where
    F: FnOnce(&Cpu, &mut CpuState) + Send + 'static,
{
    let slot = m.slot_mut(index).ok_or(Error::NoSuchCpu(index))?;
    slot.state.work.push(WorkItem::detached(Box::new(func)));
    let cpu = slot.cpu.clone();
    cpu_kick(vm, &cpu);
    Ok(())
}

/// Drains the work queue of CPU `index`. Must run on that CPU's thread.
pub fn process_queued_cpu_work(vm: &Vm, m: &mut Machine, index: usize) {
    let Some(slot) = m.slot_mut(index) else {
        return;
    };
    if slot.state.work.is_empty() {
        return;
    }
    while let Some(item) = slot.state.work.pop() {
        item.run(&slot.cpu, &mut slot.state);
    }
    vm.work_cond.notify_all();
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::vm::tests::test_vm;
    use crate::vm::tests::NullAccel;

    #[test]
    fn run_on_self_is_immediate() {
        let vm = test_vm(Box::new(NullAccel), 1);
        let mut m = vm.lock();
        m.cpu(0).unwrap().bind_current_thread();
        run_on_cpu(&vm, &mut m, 0, |_, state| state.halted = true).unwrap();
        assert!(m.state(0).unwrap().halted);
        assert!(matches!(
            run_on_cpu(&vm, &mut m, 7, |_, _| {}),
            Err(Error::NoSuchCpu(7))
        ));
    }

    #[test]
    fn run_on_other_thread_waits() {
        let vm = test_vm(Box::new(NullAccel), 1);
        let worker_vm = Arc::clone(&vm);
        let (tx, rx) = std::sync::mpsc::channel();
        let worker = thread::spawn(move || {
            let mut m = worker_vm.lock();
            m.cpu(0).unwrap().bind_current_thread();
            tx.send(()).unwrap();
            loop {
                process_queued_cpu_work(&worker_vm, &mut m, 0);
                if m.state(0).unwrap().unplug {
                    break;
                }
                worker_vm.work_cond.wait_big_timeout(&mut m, std::time::Duration::from_millis(5));
            }
        });
        rx.recv().unwrap();

        let mut m = vm.lock();
        run_on_cpu(&vm, &mut m, 0, |cpu, state| {
            assert!(cpu.is_self());
            state.icount_extra = 42;
        })
        .unwrap();
        assert_eq!(m.state(0).unwrap().icount_extra, 42);
        async_run_on_cpu(&vm, &mut m, 0, |_, state| state.unplug = true).unwrap();
        drop(m);
        worker.join().unwrap();
    }
}
