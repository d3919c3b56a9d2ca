// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io;
use std::io::Write;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use vcpu::Cpu;
use vcpu::CpuState;
use vcpu::GuestMemory;
use vcpu::HostCall;

use crate::Replay;
use crate::VirtualClock;

/// Run state of the whole machine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    Prelaunch,
    Running,
    Paused,
    Debug,
    Shutdown,
    IoError,
    Watchdog,
    InternalError,
    FinishMigrate,
    SaveVm,
    RestoreVm,
}

impl RunState {
    pub fn is_running(self) -> bool {
        self == RunState::Running
    }
}

/// Notification sent to state listeners.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StateChange {
    Running,
    Stopped(RunState),
    Exited(i32),
}

/// A CPU together with the state the big lock protects.
pub struct CpuSlot {
    pub cpu: Arc<Cpu>,
    pub state: CpuState,
}

/// Everything guest-visible. Only reachable through the big lock of a [`Vm`](crate::Vm).
pub struct Machine {
    cpus: Vec<CpuSlot>,
    generation: u64,
    run_state: RunState,
    vmstop_request: Option<RunState>,
    debug_requested: bool,
    listeners: Vec<Sender<StateChange>>,
    pub clock: VirtualClock,
    pub memory: GuestMemory,
    pub replay: Replay,
    /// Host call raised by a CPU and not yet forwarded to the debugger.
    pub pending_host_call: Option<(usize, HostCall)>,
    /// CPU that caused the most recent debug stop.
    pub debug_stop_cpu: Option<usize>,
    /// Host calls are routed to the debugger while one is attached.
    pub debugger_attached: bool,
    /// Sink for guest console output from host calls handled locally.
    pub console: Box<dyn Write + Send>,
    pub exit_code: Option<i32>,
}

impl Machine {
    pub fn new(memory: GuestMemory, clock: VirtualClock) -> Machine {
        Machine {
            cpus: Vec::new(),
            generation: 0,
            run_state: RunState::Prelaunch,
            vmstop_request: None,
            debug_requested: false,
            listeners: Vec::new(),
            clock,
            memory,
            replay: Replay::default(),
            pending_host_call: None,
            debug_stop_cpu: None,
            debugger_attached: false,
            console: Box::new(io::sink()),
            exit_code: None,
        }
    }

    /// Adds a CPU, which starts out stopped and without a thread.
    pub fn add_cpu(&mut self, cpu: Arc<Cpu>, state: CpuState) {
        self.cpus.push(CpuSlot { cpu, state });
        self.generation += 1;
    }

    pub fn remove_cpu(&mut self, index: usize) -> Option<CpuSlot> {
        let pos = self.cpus.iter().position(|s| s.cpu.index() == index)?;
        self.generation += 1;
        let mut slot = self.cpus.remove(pos);
        slot.state.registers.unregister_all();
        Some(slot)
    }

    /// Incremented whenever the CPU list changes.
    pub fn cpu_list_generation(&self) -> u64 {
        self.generation
    }

    pub fn slots(&self) -> impl Iterator<Item = &CpuSlot> {
        self.cpus.iter()
    }

    pub fn slots_mut(&mut self) -> impl Iterator<Item = &mut CpuSlot> {
        self.cpus.iter_mut()
    }

    pub fn slot(&self, index: usize) -> Option<&CpuSlot> {
        self.cpus.iter().find(|s| s.cpu.index() == index)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut CpuSlot> {
        self.cpus.iter_mut().find(|s| s.cpu.index() == index)
    }

    pub fn cpu(&self, index: usize) -> Option<Arc<Cpu>> {
        self.slot(index).map(|s| s.cpu.clone())
    }

    pub fn state(&self, index: usize) -> Option<&CpuState> {
        self.slot(index).map(|s| &s.state)
    }

    pub fn state_mut(&mut self, index: usize) -> Option<&mut CpuState> {
        self.slot_mut(index).map(|s| &mut s.state)
    }

    /// Snapshot of the CPU handles in list order.
    pub fn cpus(&self) -> Vec<Arc<Cpu>> {
        self.cpus.iter().map(|s| s.cpu.clone()).collect()
    }

    pub fn cpu_indices(&self) -> Vec<usize> {
        self.cpus.iter().map(|s| s.cpu.index()).collect()
    }

    pub fn first_cpu(&self) -> Option<Arc<Cpu>> {
        self.cpus.first().map(|s| s.cpu.clone())
    }

    /// The CPU after `index` in list order, `None` at the end of the list.
    pub fn next_cpu(&self, index: usize) -> Option<Arc<Cpu>> {
        let pos = self.cpus.iter().position(|s| s.cpu.index() == index)?;
        self.cpus.get(pos + 1).map(|s| s.cpu.clone())
    }

    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn is_running(&self) -> bool {
        self.run_state.is_running()
    }

    pub fn set_run_state(&mut self, state: RunState) {
        self.run_state = state;
    }

    pub fn request_vmstop(&mut self, state: RunState) {
        self.vmstop_request = Some(state);
    }

    pub fn take_vmstop_request(&mut self) -> Option<RunState> {
        self.vmstop_request.take()
    }

    pub fn request_debug(&mut self) {
        self.debug_requested = true;
    }

    pub fn take_debug_request(&mut self) -> bool {
        std::mem::take(&mut self.debug_requested)
    }

    pub fn add_state_listener(&mut self, listener: Sender<StateChange>) {
        self.listeners.push(listener);
    }

    /// Delivers `change` to every listener, dropping the ones that went away.
    pub fn notify(&mut self, change: StateChange) {
        self.listeners.retain(|l| l.send(change).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;

    use vcpu::micro::MicroCpu;

    use super::*;

    fn machine(n: usize) -> Machine {
        let mem = GuestMemory::new(0, 64);
        let mut m = Machine::new(mem.clone(), VirtualClock::new(Default::default(), None));
        for i in 0..n {
            m.add_cpu(
                Cpu::new(i, None),
                CpuState::new(Box::new(MicroCpu::new(mem.clone()))),
            );
        }
        m
    }

    #[test]
    fn cpu_list() {
        let mut m = machine(3);
        assert_eq!(m.cpu_indices(), vec![0, 1, 2]);
        assert_eq!(m.next_cpu(0).map(|c| c.index()), Some(1));
        assert!(m.next_cpu(2).is_none());
        let gen = m.cpu_list_generation();
        assert!(m.remove_cpu(1).is_some());
        assert!(m.remove_cpu(1).is_none());
        assert_eq!(m.cpu_list_generation(), gen + 1);
        assert_eq!(m.next_cpu(0).map(|c| c.index()), Some(2));
        assert!(m.state(2).unwrap().stopped);
    }

    #[test]
    fn listeners() {
        let mut m = machine(0);
        let (tx, rx) = channel();
        let (dead, dead_rx) = channel();
        drop(dead_rx);
        m.add_state_listener(tx);
        m.add_state_listener(dead);
        m.notify(StateChange::Stopped(RunState::Paused));
        assert_eq!(rx.recv().unwrap(), StateChange::Stopped(RunState::Paused));
        assert_eq!(m.listeners.len(), 1);
    }

    #[test]
    fn requests_are_consumed() {
        let mut m = machine(0);
        m.request_vmstop(RunState::Debug);
        assert_eq!(m.take_vmstop_request(), Some(RunState::Debug));
        assert_eq!(m.take_vmstop_request(), None);
        m.request_debug();
        assert!(m.take_debug_request());
        assert!(!m.take_debug_request());
    }
}
