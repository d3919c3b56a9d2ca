// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Round-robin TCG: a single host thread time-slices every vCPU.
//!
//! A periodic kick forces the running vCPU out of guest code so the next one gets its turn. The
//! kick only runs while there is more than one vCPU and at least one of them has something to do.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use base::debug;
use base::error;
use base::WorkerThread;
use sync::BigLockGuard;
use sync::Condvar;
use sync::Mutex;
use vcpu::mark_vcpu_thread;
use vcpu::set_current_cpu;
use vcpu::Cpu;
use vcpu::QuantumExit;
use vcpu::SstepFlags;

use super::icount::icount_get_limit;
use super::icount::icount_handle_deadline;
use super::icount::icount_percpu_budget;
use super::tcg_cpu_exec;
use super::tcg_step_atomic;
use crate::all_cpu_threads_idle;
use crate::cpu_can_run;
use crate::cpu_handle_guest_debug;
use crate::cpu_thread_is_idle;
use crate::wait_io_event_common;
use crate::Error;
use crate::Machine;
use crate::ReplayMode;
use crate::Result;
use crate::Vm;
use crate::VmRequest;

type KickTimer = Option<WorkerThread<()>>;

/// State shared between the scheduler thread, the kick timer and kickers on other threads.
struct RrShared {
    /// The vCPU currently in guest code.
    current: Mutex<Option<Arc<Cpu>>>,
    /// Halt condition of every vCPU.
    halt_cond: Arc<Condvar>,
    kick_armed: AtomicBool,
    /// Cleared with the big lock held when the scheduler thread gives up.
    alive: AtomicBool,
    /// Number of vCPUs, tagged with the CPU list generation it was counted at.
    cpu_count: Mutex<(u64, usize)>,
    kick_period: Duration,
    split_budget: bool,
}

/// Instruction budget of one round-robin pass, handed out CPU by CPU.
struct PassBudget {
    limit: u64,
    runnable: usize,
    handed_out: usize,
}

impl PassBudget {
    fn next_share(&mut self) -> u64 {
        let share = icount_percpu_budget(self.limit, self.runnable, self.handed_out);
        self.handed_out += 1;
        share
    }
}

pub(crate) struct RoundRobin {
    shared: Arc<RrShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

fn same_cpu(a: &Option<Arc<Cpu>>, b: &Option<Arc<Cpu>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

impl RoundRobin {
    pub fn new(kick_period: Duration, split_budget: bool) -> RoundRobin {
        RoundRobin {
            shared: Arc::new(RrShared {
                current: Mutex::new(None),
                halt_cond: Arc::new(Condvar::new()),
                kick_armed: AtomicBool::new(false),
                alive: AtomicBool::new(false),
                cpu_count: Mutex::new((u64::MAX, 0)),
                kick_period,
                split_budget,
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn kick_timer_armed(&self) -> bool {
        self.shared.kick_armed.load(Ordering::Acquire)
    }

    /// Forces whichever vCPU is running out of guest code.
    pub fn kick_next_cpu(&self) {
        self.shared.kick_next_cpu();
    }

    /// Attaches `cpu` to the scheduler thread, starting the thread for the first vCPU.
    pub fn start_vcpu_thread(&self, vm: &Arc<Vm>, m: &mut Machine, cpu: &Arc<Cpu>) -> Result<()> {
        let mut thread = self.thread.lock();
        cpu.set_halt_cond(self.shared.halt_cond.clone());

        if self.shared.alive.load(Ordering::Acquire) {
            if let Some(handle) = thread.as_ref() {
                cpu.set_thread_id(handle.thread().id());
                cpu.set_can_do_io(true);
                if let Some(state) = m.state_mut(cpu.index()) {
                    state.created = true;
                }
                vm.cpu_cond.notify_all();
                return Ok(());
            }
        }

        // The previous scheduler ran out of vCPUs and is exiting.
        if let Some(old) = thread.take() {
            if old.join().is_err() {
                error!("round-robin vcpu thread panicked");
            }
        }
        let thread_vm = vm.clone();
        let shared = self.shared.clone();
        let first = cpu.clone();
        let handle = thread::Builder::new()
            .name("ALL CPUs/TCG".to_string())
            .spawn(move || rr_cpu_thread_fn(thread_vm, shared, first))
            .map_err(Error::SpawnThread)?;
        cpu.set_thread_id(handle.thread().id());
        self.shared.alive.store(true, Ordering::Release);
        *thread = Some(handle);
        Ok(())
    }

    /// Waits for the scheduler thread to exit. Every vCPU must have been removed.
    pub fn destroy(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("round-robin vcpu thread panicked");
            }
        }
    }
}

impl RrShared {
    fn kick_next_cpu(&self) {
        // The running vCPU may change under us; kick until the one kicked is still current.
        loop {
            let cpu = self.current.lock().clone();
            if let Some(cpu) = &cpu {
                cpu.exit();
            }
            if same_cpu(&cpu, &self.current.lock()) {
                break;
            }
        }
    }

    fn set_current(&self, cpu: Option<Arc<Cpu>>) {
        *self.current.lock() = cpu;
    }

    /// Number of vCPUs, recounted only when the CPU list changes.
    fn cpu_count(&self, m: &Machine) -> usize {
        let mut cache = self.cpu_count.lock();
        let generation = m.cpu_list_generation();
        if cache.0 != generation {
            *cache = (generation, m.slots().count());
        }
        cache.1
    }

    fn start_kick_timer(self: &Arc<Self>, m: &Machine, timer: &mut KickTimer) {
        if timer.is_some() || self.cpu_count(m) < 2 {
            return;
        }
        let shared = self.clone();
        *timer = Some(WorkerThread::start_periodic(
            "tcg kick",
            self.kick_period,
            move || shared.kick_next_cpu(),
        ));
        self.kick_armed.store(true, Ordering::Release);
    }

    fn stop_kick_timer(&self, timer: &mut KickTimer) {
        if let Some(timer) = timer.take() {
            timer.stop();
            self.kick_armed.store(false, Ordering::Release);
        }
    }

    /// Lets the thread of one unplugged vCPU go.
    fn deal_with_unplugged(&self, vm: &Vm, m: &mut Machine) {
        let unplugged = m
            .slots_mut()
            .find(|s| s.state.unplug && s.state.created && !cpu_can_run(&s.state));
        if let Some(slot) = unplugged {
            slot.state.created = false;
            debug!("cpu {} left the round-robin thread", slot.cpu.index());
            vm.cpu_cond.notify_all();
        }
    }

    fn wait_io_event_common_all(&self, vm: &Vm, m: &mut Machine) {
        for cpu in m.cpus() {
            set_current_cpu(Some(cpu.clone()));
            wait_io_event_common(vm, m, &cpu);
        }
    }

    /// Sleeps until the machine is started. Returns false if every vCPU went away first.
    fn wait_for_kickoff(&self, vm: &Vm, m: &mut BigLockGuard<Machine>) -> bool {
        loop {
            self.deal_with_unplugged(vm, m);
            let Some(first) = m.first_cpu() else {
                return false;
            };
            if !m.state(first.index()).is_some_and(|s| s.stopped) {
                return true;
            }
            self.halt_cond.wait_big(m);
            self.wait_io_event_common_all(vm, m);
        }
    }

    fn wait_io_event(
        self: &Arc<Self>,
        vm: &Vm,
        m: &mut BigLockGuard<Machine>,
        timer: &mut KickTimer,
    ) {
        while self.cpu_count(m) > 0 && all_cpu_threads_idle(vm, m) {
            self.stop_kick_timer(timer);
            self.halt_cond.wait_big(m);
        }
        self.start_kick_timer(m, timer);
        self.wait_io_event_common_all(vm, m);
    }

    /// Instruction budget of the next pass, `None` for "each vCPU up to the next deadline".
    fn pass_budget(&self, vm: &Vm, m: &mut BigLockGuard<Machine>) -> Option<PassBudget> {
        let _replay = m.unlocked(|| vm.replay_lock());
        icount_handle_deadline(vm, m);
        if !self.split_budget || m.replay.mode() == ReplayMode::Play {
            return None;
        }
        let runnable = if self.cpu_count(m) == 1 {
            1
        } else {
            m.slots()
                .filter(|s| cpu_can_run(&s.state) && !cpu_thread_is_idle(vm, &s.cpu, &s.state))
                .count()
        };
        Some(PassBudget {
            limit: icount_get_limit(vm, m),
            runnable,
            handed_out: 0,
        })
    }

    fn run(self: &Arc<Self>, vm: &Vm, m: &mut BigLockGuard<Machine>, timer: &mut KickTimer) {
        self.start_kick_timer(m, timer);
        let mut cur = m.first_cpu();
        // Process pending work before the first pass.
        if let Some(cpu) = &cur {
            cpu.exit();
        }

        loop {
            let icount = m.clock.icount_enabled();
            let mut budget = if icount { self.pass_budget(vm, m) } else { None };

            if cur.is_none() {
                cur = m.first_cpu();
            }
            while let Some(cpu) = cur.clone() {
                let index = cpu.index();
                let Some(state) = m.state(index) else {
                    cur = None;
                    break;
                };
                if !state.work.is_empty() || cpu.exit_requested() {
                    break;
                }
                let runnable = cpu_can_run(state);
                let idle = cpu_thread_is_idle(vm, &cpu, state);
                let (stop, unplug) = (state.stop, state.unplug);
                let timers = !state.singlestep.contains(SstepFlags::NOTIMER);

                self.set_current(Some(cpu.clone()));
                set_current_cpu(Some(cpu.clone()));
                if m.is_running() {
                    m.clock.set_enabled(timers);
                }

                if runnable {
                    // Idle vCPUs only check for wakeups and take no share of the pass.
                    let share = budget
                        .as_mut()
                        .map(|b| if idle { 0 } else { b.next_share() });
                    let (exit, _) = tcg_cpu_exec(vm, m, &cpu, share);
                    match exit {
                        QuantumExit::DebugTrap => {
                            cpu_handle_guest_debug(vm, m, index);
                            break;
                        }
                        QuantumExit::AtomicRetry => {
                            if tcg_step_atomic(vm, m, &cpu) == QuantumExit::DebugTrap {
                                cpu_handle_guest_debug(vm, m, index);
                            }
                            break;
                        }
                        QuantumExit::Normal | QuantumExit::Halted => {}
                    }
                } else if stop {
                    if unplug {
                        cur = m.next_cpu(index);
                    }
                    break;
                }
                cur = m.next_cpu(index);
            }

            self.set_current(None);
            if let Some(cpu) = &cur {
                cpu.clear_exit_request();
            }
            if icount && all_cpu_threads_idle(vm, m) {
                // Every vCPU sleeps; the main loop has to move virtual time forward.
                vm.request(VmRequest::Wakeup);
            }
            self.wait_io_event(vm, m, timer);
            self.deal_with_unplugged(vm, m);
            if self.cpu_count(m) == 0 {
                break;
            }
        }
    }
}

fn rr_cpu_thread_fn(vm: Arc<Vm>, shared: Arc<RrShared>, first: Arc<Cpu>) {
    mark_vcpu_thread();
    let mut m = vm.lock();
    first.bind_current_thread();
    first.set_can_do_io(true);
    if let Some(state) = m.state_mut(first.index()) {
        state.created = true;
    }
    vm.cpu_cond.notify_all();
    debug!("round-robin vcpu thread started");

    let mut timer = None;
    if shared.wait_for_kickoff(&vm, &mut m) {
        shared.run(&vm, &mut m, &mut timer);
    }
    shared.stop_kick_timer(&mut timer);
    shared.alive.store(false, Ordering::Release);
    drop(m);
    set_current_cpu(None);
    debug!("round-robin vcpu thread exited");
}

#[cfg(test)]
mod tests {
    use vcpu::micro::Asm;
    use vcpu::micro::MicroCpu;

    use super::*;
    use crate::cpu_remove_sync;
    use crate::tcg::TcgAccel;
    use crate::tcg::TcgConfig;
    use crate::tcg::TcgThreadMode;
    use crate::vm::tests::test_machine;
    use crate::vm::tests::test_vm;
    use crate::vm_start;
    use crate::vm_stop;
    use crate::RunState;

    fn rr_vm(n: usize, kick_period: Duration) -> Arc<Vm> {
        let accel = TcgAccel::new(TcgConfig {
            thread_mode: TcgThreadMode::RoundRobin,
            kick_period,
            ..Default::default()
        });
        test_vm(Box::new(accel), n)
    }

    /// Snapshot taken when the first counted pass is over: instructions retired by the machine
    /// and `r0` of every vCPU.
    type PassSnapshot = Arc<Mutex<Option<(u64, Vec<u64>)>>>;

    /// Runs three vCPUs spinning on `inc r0` under instruction counting, with a timer `limit`
    /// instructions away, and returns what the first pass retired.
    fn counted_pass(limit: u64, halted: &[usize]) -> (u64, Vec<u64>) {
        let accel = TcgAccel::new(TcgConfig {
            thread_mode: TcgThreadMode::RoundRobin,
            kick_period: Duration::from_secs(10),
            icount: true,
            ..Default::default()
        });
        let vm = Vm::new(test_machine(3, Some(0)), Box::new(accel));
        let snapshot: PassSnapshot = Arc::new(Mutex::new(None));
        {
            let mut m = vm.lock();
            m.memory.write(0, &Asm::new().inc(0).jmp(0).bytes()).unwrap();
            for &index in halted {
                m.state_mut(index).unwrap().halted = true;
            }
            let snap = snapshot.clone();
            m.clock.add_timer(
                limit,
                Box::new(move |_, m| {
                    let regs = m
                        .slots_mut()
                        .map(|s| s.state.arch::<MicroCpu>().map_or(0, |c| c.reg(0)))
                        .collect();
                    *snap.lock() = Some((m.clock.executed_instructions(), regs));
                }),
            );
        }
        vm.realize_cpus().unwrap();
        vm_start(&vm, &mut vm.lock());
        let result = loop {
            if let Some(result) = snapshot.lock().clone() {
                break result;
            }
            thread::sleep(Duration::from_millis(1));
        };

        let mut m = vm.lock();
        vm_stop(&vm, &mut m, RunState::Paused);
        for index in 0..3 {
            cpu_remove_sync(&vm, &mut m, index).unwrap();
        }
        drop(m);
        vm.accel().destroy();
        result
    }

    #[test]
    fn counted_pass_splits_the_budget() {
        let (executed, regs) = counted_pass(300, &[]);
        assert!(executed <= 300, "{} instructions in one pass", executed);
        // Every loop iteration is two instructions.
        assert_eq!(regs, vec![50, 50, 50]);
    }

    #[test]
    fn halted_cpus_take_no_share() {
        let (executed, regs) = counted_pass(300, &[2]);
        assert!(executed <= 300, "{} instructions in one pass", executed);
        assert_eq!(regs, vec![75, 75, 0]);
    }

    #[test]
    fn cpu_count_follows_the_cpu_list() {
        let vm = rr_vm(3, Duration::from_secs(10));
        let rr = RrShared {
            current: Mutex::new(None),
            halt_cond: Arc::new(Condvar::new()),
            kick_armed: AtomicBool::new(false),
            alive: AtomicBool::new(false),
            cpu_count: Mutex::new((u64::MAX, 0)),
            kick_period: Duration::from_secs(10),
            split_budget: true,
        };
        let mut m = vm.lock();
        assert_eq!(rr.cpu_count(&m), 3);
        assert_eq!(rr.cpu_count.lock().0, m.cpu_list_generation());
        assert!(m.remove_cpu(1).is_some());
        assert_eq!(rr.cpu_count(&m), 2);
    }

    fn tcg(vm: &Vm) -> &TcgAccel {
        vm.accel().downcast_ref::<TcgAccel>().unwrap()
    }

    fn wait_until(vm: &Vm, mut cond: impl FnMut(&Machine) -> bool) {
        loop {
            if cond(&vm.lock()) {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn kick_without_running_cpu() {
        let rr = RoundRobin::new(Duration::from_millis(1), true);
        rr.kick_next_cpu();
        let cpu = Cpu::new(0, None);
        rr.shared.set_current(Some(cpu.clone()));
        rr.kick_next_cpu();
        assert!(cpu.exit_requested());
        assert!(!rr.kick_timer_armed());
    }

    #[test]
    fn cpus_share_one_thread() {
        let vm = rr_vm(3, Duration::from_secs(10));
        vm.realize_cpus().unwrap();
        let m = vm.lock();
        let cpus = m.cpus();
        let id = cpus[0].thread_id();
        assert!(id.is_some());
        for cpu in &cpus {
            assert_eq!(cpu.thread_id(), id);
            assert!(Arc::ptr_eq(
                cpu.halt_cond().unwrap(),
                cpus[0].halt_cond().unwrap()
            ));
        }
        // Not started yet, so nothing needs to be kicked.
        assert!(!tcg(&vm).kick_timer_armed());
    }

    #[test]
    fn kick_timer_time_slices_spinning_cpus() {
        let vm = rr_vm(2, Duration::from_millis(1));
        {
            let m = vm.lock();
            m.memory.write(0, &Asm::new().inc(0).jmp(0).bytes()).unwrap();
        }
        vm.realize_cpus().unwrap();
        vm_start(&vm, &mut vm.lock());
        wait_until(&vm, |m| m.cpus().iter().all(|c| c.quanta() >= 3));
        assert!(tcg(&vm).kick_timer_armed());

        let mut m = vm.lock();
        vm_stop(&vm, &mut m, RunState::Paused);
        for slot in m.slots_mut() {
            assert!(slot.state.stopped);
            assert!(slot.state.arch::<MicroCpu>().unwrap().reg(0) > 0);
        }
        drop(m);
        // Every vCPU is idle now, so the timer is disarmed.
        wait_until(&vm, |_| !tcg(&vm).kick_timer_armed());

        let mut m = vm.lock();
        for index in 0..2 {
            cpu_remove_sync(&vm, &mut m, index).unwrap();
        }
        drop(m);
        vm.accel().destroy();
    }

    #[test]
    fn single_cpu_is_never_kicked() {
        let vm = rr_vm(1, Duration::from_millis(1));
        {
            let m = vm.lock();
            m.memory
                .write(0, &Asm::new().movi(1, 50).dec(1).jnz(1, 4).hlt().bytes())
                .unwrap();
        }
        vm.realize_cpus().unwrap();
        vm_start(&vm, &mut vm.lock());
        wait_until(&vm, |m| m.state(0).unwrap().halted);
        assert!(!tcg(&vm).kick_timer_armed());
        let mut m = vm.lock();
        cpu_remove_sync(&vm, &mut m, 0).unwrap();
        drop(m);
        vm.accel().destroy();
    }
}
