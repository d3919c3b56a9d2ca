// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The software translation accelerator.
//!
//! Guest code runs through [`CpuArch::exec`](vcpu::CpuArch::exec) either on one thread per vCPU
//! ([`TcgThreadMode::Multi`]) or on a single thread that time-slices all vCPUs
//! ([`TcgThreadMode::RoundRobin`]). Instruction counting layers on top of both.

mod icount;
mod mttcg;
mod rr;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use sync::BigLockGuard;
use vcpu::Cpu;
use vcpu::GdbBreakpointType;
use vcpu::InterruptRequest;
use vcpu::QuantumExit;
use vcpu::SstepFlags;

use crate::clear_gdb_breakpoints_all;
use crate::cpus::cpu_kick;
use crate::insert_gdb_breakpoint_all;
use crate::quantum::checkout;
use crate::quantum::execute;
use crate::quantum::finish;
use crate::remove_gdb_breakpoint_all;
use crate::AccelOps;
use crate::GuestDebugOps;
use crate::KickOps;
use crate::Machine;
use crate::Result;
use crate::Vm;
use self::icount::icount_get_limit;
use self::icount::icount_prepare_for_run;
use self::icount::icount_process_data;
use self::icount::ICOUNT_CHUNK;
use self::rr::RoundRobin;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TcgThreadMode {
    /// One host thread per vCPU.
    #[default]
    Multi,
    /// One host thread for all vCPUs.
    RoundRobin,
}

#[derive(Clone, Debug)]
pub struct TcgConfig {
    pub thread_mode: TcgThreadMode,
    /// How long the round-robin scheduler lets one vCPU run before moving on.
    pub kick_period: Duration,
    /// Split the instruction budget of a round-robin pass evenly across vCPUs. Otherwise every
    /// vCPU gets the budget up to the next timer deadline.
    pub split_budget: bool,
    /// Instruction counting is enabled on the virtual clock.
    pub icount: bool,
    /// A record or replay session is active.
    pub record_replay: bool,
}

impl Default for TcgConfig {
    fn default() -> Self {
        TcgConfig {
            thread_mode: TcgThreadMode::Multi,
            kick_period: Duration::from_millis(100),
            split_budget: true,
            icount: false,
            record_replay: false,
        }
    }
}

pub struct TcgAccel {
    config: TcgConfig,
    rr: RoundRobin,
}

impl TcgAccel {
    pub fn new(config: TcgConfig) -> TcgAccel {
        let rr = RoundRobin::new(config.kick_period, config.split_budget);
        TcgAccel { config, rr }
    }

    pub fn config(&self) -> &TcgConfig {
        &self.config
    }

    /// Whether the round-robin kick timer currently runs.
    pub fn kick_timer_armed(&self) -> bool {
        self.rr.kick_timer_armed()
    }
}

impl AccelOps for TcgAccel {
    fn name(&self) -> &'static str {
        "tcg"
    }

    fn create_vcpu_thread(&self, vm: &Arc<Vm>, m: &mut Machine, cpu: &Arc<Cpu>) -> Result<()> {
        match self.config.thread_mode {
            TcgThreadMode::Multi => mttcg::start_vcpu_thread(vm, cpu),
            TcgThreadMode::RoundRobin => self.rr.start_vcpu_thread(vm, m, cpu),
        }
    }

    fn handle_interrupt(&self, vm: &Vm, cpu: &Cpu, mask: InterruptRequest) {
        let old = cpu.raise_interrupt(mask);
        if !cpu.is_self() {
            cpu_kick(vm, cpu);
            return;
        }
        cpu.exit();
        if self.config.icount && !cpu.can_do_io() && !mask.difference(old).is_empty() {
            panic!("cpu {}: Raised interrupt while not in I/O function", cpu.index());
        }
    }

    fn kick(&self) -> Option<&dyn KickOps> {
        Some(self)
    }

    fn guest_debug(&self) -> Option<&dyn GuestDebugOps> {
        Some(self)
    }

    fn supported_sstep_flags(&self) -> SstepFlags {
        if self.config.record_replay {
            SstepFlags::ENABLE
        } else {
            SstepFlags::ENABLE | SstepFlags::NOIRQ | SstepFlags::NOTIMER
        }
    }

    fn destroy(&self) {
        self.rr.destroy();
    }
}

impl KickOps for TcgAccel {
    fn kick_vcpu_thread(&self, _vm: &Vm, cpu: &Cpu) {
        match self.config.thread_mode {
            TcgThreadMode::Multi => cpu.exit(),
            TcgThreadMode::RoundRobin => self.rr.kick_next_cpu(),
        }
    }
}

impl GuestDebugOps for TcgAccel {
    fn supports_guest_debug(&self) -> bool {
        true
    }

    fn insert_breakpoint(
        &self,
        _vm: &Vm,
        m: &mut Machine,
        _index: usize,
        ty: GdbBreakpointType,
        addr: u64,
        len: u64,
    ) -> Result<()> {
        insert_gdb_breakpoint_all(m, ty, addr, len)
    }

    fn remove_breakpoint(
        &self,
        _vm: &Vm,
        m: &mut Machine,
        _index: usize,
        ty: GdbBreakpointType,
        addr: u64,
        len: u64,
    ) -> Result<()> {
        remove_gdb_breakpoint_all(m, ty, addr, len)
    }

    fn remove_all_breakpoints(&self, _vm: &Vm, m: &mut Machine, _index: usize) {
        clear_gdb_breakpoints_all(m);
    }
}

/// Runs one quantum of `cpu`. In instruction counting mode `budget` is the number of instructions
/// to run, `None` meaning up to the next timer deadline.
///
/// Returns why the quantum ended and how many instructions retired.
pub(crate) fn tcg_cpu_exec(
    vm: &Vm,
    m: &mut BigLockGuard<Machine>,
    cpu: &Arc<Cpu>,
    budget: Option<u64>,
) -> (QuantumExit, u64) {
    let index = cpu.index();
    let icount = m.clock.icount_enabled();
    let (first, mut extra) = if icount {
        let budget = match budget {
            Some(b) => b,
            None => icount_get_limit(vm, m),
        };
        let (chunk, extra) = icount_prepare_for_run(vm, m, index, budget);
        (Some(chunk), extra)
    } else {
        (None, 0)
    };

    let co = checkout(m, index);
    cpu.set_can_do_io(!icount);
    let (env, mut outcome) = m.unlocked(|| {
        let _quantum = vm.start_quantum();
        execute(cpu, co, first, |env, ctl| loop {
            let exit = env.exec(ctl);
            let refill = exit == QuantumExit::Normal
                && extra > 0
                && ctl.budget_exhausted()
                && !ctl.exit_requested()
                && ctl.host_call.is_none()
                && ctl.shutdown.is_none();
            if !refill {
                break exit;
            }
            let chunk = extra.min(ICOUNT_CHUNK);
            extra -= chunk;
            ctl.budget = ctl.budget.map(|b| b + chunk);
        })
    });
    cpu.set_can_do_io(true);

    finish(vm, m, cpu, env, &mut outcome);
    if icount {
        icount_process_data(vm, m, index, outcome.executed);
    }
    // The exit request that ended this quantum is consumed.
    cpu.clear_exit_request();
    (outcome.exit, outcome.executed)
}

/// Runs the next instruction of `cpu` with every other vCPU out of guest code.
///
/// Returns `DebugTrap` if the CPU single-steps and should report the step.
pub(crate) fn tcg_step_atomic(
    vm: &Vm,
    m: &mut BigLockGuard<Machine>,
    cpu: &Arc<Cpu>,
) -> QuantumExit {
    let index = cpu.index();
    for other in m.cpus() {
        if other.index() != index {
            cpu_kick(vm, &other);
        }
    }
    let stepping = m
        .state(index)
        .is_some_and(|s| s.singlestep.contains(SstepFlags::ENABLE));

    let co = checkout(m, index);
    let (env, mut outcome) = m.unlocked(|| {
        let _exclusive = vm.start_exclusive();
        execute(cpu, co, None, |env, ctl| {
            env.step_atomic(ctl);
            QuantumExit::Normal
        })
    });
    finish(vm, m, cpu, env, &mut outcome);
    if m.clock.icount_enabled() {
        icount_process_data(vm, m, index, outcome.executed);
    }
    if stepping && outcome.executed > 0 {
        QuantumExit::DebugTrap
    } else {
        QuantumExit::Normal
    }
}
