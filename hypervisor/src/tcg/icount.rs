// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Instruction counting: quanta are bounded by the next virtual timer deadline and every retired
//! instruction advances the virtual clock.

use std::sync::atomic::Ordering;

use sync::BigLockGuard;

use crate::run_expired_timers;
use crate::Machine;
use crate::ReplayMode;
use crate::Vm;
use crate::VmRequest;

/// Instructions handed to the CPU at once; the rest of the budget is refilled from the extra.
pub(crate) const ICOUNT_CHUNK: u64 = 0xffff;

/// Upper bound of one budget, in nanoseconds of virtual time.
const MAX_DEADLINE_NS: u64 = i32::MAX as u64;

/// Instructions that may run before the next timer must fire.
pub(crate) fn icount_get_limit(vm: &Vm, m: &Machine) -> u64 {
    let replay = &m.replay;
    if replay.mode() == ReplayMode::Play && replay.position() < replay.quanta().len() {
        return replay.instructions();
    }
    let deadline = m.clock.deadline_ns();
    if deadline == Some(0) {
        // A timer is due; let the main loop run it.
        vm.request(VmRequest::Wakeup);
    }
    let deadline = deadline.unwrap_or(MAX_DEADLINE_NS).min(MAX_DEADLINE_NS);
    m.clock.icount_round(deadline)
}

/// Share of `limit` for the CPU at `position` among the `cpu_count` CPUs of a round-robin pass.
///
/// The shares of one pass never add up to more than `limit`. When there are fewer instructions
/// than CPUs, the first `limit` CPUs get one each.
pub(crate) fn icount_percpu_budget(limit: u64, cpu_count: usize, position: usize) -> u64 {
    let cpu_count = cpu_count.max(1);
    if position >= cpu_count {
        return 0;
    }
    match limit / cpu_count as u64 {
        0 => u64::from((position as u64) < limit),
        timeslice => timeslice,
    }
}

/// Runs the virtual timers whose deadline has been reached.
pub(crate) fn icount_handle_deadline(vm: &Vm, m: &mut Machine) {
    if m.clock.deadline_ns() == Some(0) {
        run_expired_timers(vm, m);
    }
}

/// Installs `budget` on CPU `index`. Returns the first chunk to execute and the remainder.
pub(crate) fn icount_prepare_for_run(
    vm: &Vm,
    m: &mut BigLockGuard<Machine>,
    index: usize,
    budget: u64,
) -> (u64, u64) {
    let chunk = budget.min(ICOUNT_CHUNK);
    if let Some(state) = m.state_mut(index) {
        assert!(
            state.icount_budget == 0 && state.icount_extra == 0,
            "cpu {} entered a quantum with a stale instruction budget",
            index
        );
        state.icount_budget = budget as i64;
        state.icount_extra = (budget - chunk) as i64;
    }
    if budget == 0 {
        let _replay = m.unlocked(|| vm.replay_lock());
        icount_handle_deadline(vm, m);
    }
    (chunk, budget - chunk)
}

/// Accounts the instructions retired by a quantum of CPU `index`.
pub(crate) fn icount_process_data(
    vm: &Vm,
    m: &mut BigLockGuard<Machine>,
    index: usize,
    executed: u64,
) {
    let _replay = m.unlocked(|| vm.replay_lock());
    m.clock
        .instruction_counter()
        .fetch_add(executed, Ordering::AcqRel);
    if let Some(state) = m.state_mut(index) {
        state.icount_budget = 0;
        state.icount_extra = 0;
    }
    m.replay.account_executed(executed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::tests::test_machine;
    use crate::vm::tests::NullAccel;
    use crate::Replay;

    fn icount_vm(n: usize) -> std::sync::Arc<Vm> {
        Vm::new(test_machine(n, Some(0)), Box::new(NullAccel))
    }

    #[test]
    fn percpu_budget() {
        assert_eq!(icount_percpu_budget(300, 3, 0), 100);
        assert_eq!(icount_percpu_budget(301, 3, 2), 100);
        assert_eq!(icount_percpu_budget(10, 0, 0), 10);
        // CPUs that became runnable after the pass was sized get nothing.
        assert_eq!(icount_percpu_budget(300, 3, 3), 0);
        for (limit, cpus) in [(2, 3), (0, 3), (5, 4), (7, 7), (1, 1)] {
            let shares: Vec<u64> = (0..cpus + 2)
                .map(|pos| icount_percpu_budget(limit, cpus, pos))
                .collect();
            assert!(shares.iter().sum::<u64>() <= limit, "{:?}", shares);
        }
        let shares: Vec<u64> = (0..3).map(|pos| icount_percpu_budget(2, 3, pos)).collect();
        assert_eq!(shares, vec![1, 1, 0]);
    }

    #[test]
    fn limit_follows_deadline() {
        let vm = icount_vm(1);
        let mut m = vm.lock();
        m.clock.enable();
        assert_eq!(icount_get_limit(&vm, &m), i32::MAX as u64);
        m.clock.add_timer(500, Box::new(|_, _| {}));
        assert_eq!(icount_get_limit(&vm, &m), 500);
        m.replay = Replay::play(vec![7, 9]);
        assert_eq!(icount_get_limit(&vm, &m), 7);
    }

    #[test]
    fn budget_is_split_in_chunks() {
        let vm = icount_vm(1);
        let mut m = vm.lock();
        let (chunk, extra) = icount_prepare_for_run(&vm, &mut m, 0, 0x10005);
        assert_eq!((chunk, extra), (0xffff, 6));
        assert_eq!(m.state(0).unwrap().icount_extra, 6);
        icount_process_data(&vm, &mut m, 0, 0x10005);
        assert_eq!(m.clock.executed_instructions(), 0x10005);
        assert_eq!(m.state(0).unwrap().icount_budget, 0);
    }

    #[test]
    fn zero_budget_runs_due_timers() {
        let vm = icount_vm(1);
        let mut m = vm.lock();
        m.clock.enable();
        m.clock.add_timer(0, Box::new(|_, m| m.exit_code = Some(4)));
        icount_prepare_for_run(&vm, &mut m, 0, 0);
        assert_eq!(m.exit_code, Some(4));
    }
}
