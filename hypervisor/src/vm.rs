// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::mpsc::channel;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;
use std::time::Duration;

use base::debug;
use base::error;
use base::info;
use sync::BigLock;
use sync::BigLockGuard;
use sync::Condvar;
use sync::Mutex;
use vcpu::Cpu;
use vcpu::CpuState;

use crate::all_cpu_threads_idle;
use crate::cpu_remove_sync;
use crate::cpu_resume;
use crate::cpu_synchronize_post_init;
use crate::pause_all_vcpus;
use crate::run_expired_timers;
use crate::vm_stop;
use crate::AccelOps;
use crate::Error;
use crate::Machine;
use crate::Result;
use crate::RunState;
use crate::StateChange;

/// Longest the main loop sleeps without looking at timers and deferred requests.
const MAX_POLL: Duration = Duration::from_millis(50);

/// Requests sent to the main loop.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VmRequest {
    /// Something changed; re-check deferred requests and timers.
    Wakeup,
    /// Shut the machine down with the given exit code.
    Shutdown(i32),
}

/// A virtual machine: the big lock with the machine behind it, the accelerator and the
/// condition variables the vCPU lifecycle waits on.
pub struct Vm {
    gel: BigLock<Machine>,
    accel: Box<dyn AccelOps>,
    /// Signalled when a CPU thread finished starting up or tearing down.
    pub(crate) cpu_cond: Condvar,
    /// Signalled when a CPU stopped.
    pub(crate) pause_cond: Condvar,
    /// Signalled when queued CPU work ran.
    pub(crate) work_cond: Condvar,
    replay_lock: Mutex<()>,
    exclusive: RwLock<()>,
    requests: Sender<VmRequest>,
    request_rx: Mutex<Option<Receiver<VmRequest>>>,
}

impl Vm {
    pub fn new(machine: Machine, accel: Box<dyn AccelOps>) -> Arc<Vm> {
        let (requests, request_rx) = channel();
        Arc::new(Vm {
            gel: BigLock::new(machine),
            accel,
            cpu_cond: Condvar::new(),
            pause_cond: Condvar::new(),
            work_cond: Condvar::new(),
            replay_lock: Mutex::new(()),
            exclusive: RwLock::new(()),
            requests,
            request_rx: Mutex::new(Some(request_rx)),
        })
    }

    /// Takes the big lock.
    pub fn lock(&self) -> BigLockGuard<Machine> {
        self.gel.lock()
    }

    pub fn accel(&self) -> &dyn AccelOps {
        self.accel.as_ref()
    }

    pub fn request(&self, request: VmRequest) {
        if self.requests.send(request).is_err() {
            debug!("main loop gone, dropping {:?}", request);
        }
    }

    /// Serializes replay accounting between vCPU threads. Must not be taken with the big lock
    /// held.
    pub(crate) fn replay_lock(&self) -> MutexGuard<()> {
        self.replay_lock.lock()
    }

    /// Held by every running quantum.
    pub(crate) fn start_quantum(&self) -> RwLockReadGuard<()> {
        self.exclusive
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Held while one CPU runs an atomic step with every other CPU out of guest code.
    pub(crate) fn start_exclusive(&self) -> RwLockWriteGuard<()> {
        self.exclusive
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates the execution threads of every CPU added so far.
    pub fn realize_cpus(self: &Arc<Self>) -> Result<()> {
        let mut m = self.lock();
        for index in m.cpu_indices() {
            self.realize_cpu(&mut m, index)?;
        }
        Ok(())
    }

    /// Starts the thread of CPU `index` and waits until it reports itself created.
    pub fn realize_cpu(self: &Arc<Self>, m: &mut BigLockGuard<Machine>, index: usize) -> Result<()> {
        let cpu = {
            let slot = m.slot_mut(index).ok_or(Error::NoSuchCpu(index))?;
            slot.state.init_registers();
            slot.cpu.clone()
        };
        self.accel.create_vcpu_thread(self, m, &cpu)?;
        while !m.state(index).is_some_and(|s| s.created) {
            self.cpu_cond.wait_big(m);
        }
        cpu_synchronize_post_init(self, m, index);
        debug!("cpu {} realized by {}", index, self.accel.name());
        Ok(())
    }

    /// Hot-plugs a CPU. It starts running right away if the machine runs.
    pub fn plug_cpu(
        self: &Arc<Self>,
        m: &mut BigLockGuard<Machine>,
        cpu: Arc<Cpu>,
        state: CpuState,
    ) -> Result<()> {
        let index = cpu.index();
        m.add_cpu(cpu, state);
        self.realize_cpu(m, index)?;
        if m.is_running() {
            cpu_resume(self, m, index);
        }
        Ok(())
    }

    /// Runs the control loop on the calling thread until the machine shuts down. Returns the exit
    /// code.
    pub fn run_main_loop(&self) -> Result<i32> {
        let rx = self
            .request_rx
            .lock()
            .take()
            .ok_or(Error::MainLoopRunning)?;
        let mut m = self.lock();
        loop {
            if m.take_debug_request() {
                vm_stop(self, &mut m, RunState::Debug);
            }
            if let Some(state) = m.take_vmstop_request() {
                vm_stop(self, &mut m, state);
            }
            if m.clock.icount_enabled() && m.is_running() && all_cpu_threads_idle(self, &m) {
                m.clock.warp_to_deadline();
            }
            run_expired_timers(self, &mut m);

            let timeout = m
                .clock
                .deadline_ns()
                .map_or(MAX_POLL, |ns| Duration::from_nanos(ns).min(MAX_POLL));
            match m.unlocked(|| rx.recv_timeout(timeout)) {
                Ok(VmRequest::Wakeup) | Err(RecvTimeoutError::Timeout) => {}
                Ok(VmRequest::Shutdown(code)) => {
                    self.shutdown(&mut m, code);
                    return Ok(code);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    error!("vm request channel closed");
                    self.shutdown(&mut m, 1);
                    return Ok(1);
                }
            }
        }
    }

    fn shutdown(&self, m: &mut BigLockGuard<Machine>, code: i32) {
        info!("shutting down with exit code {}", code);
        m.exit_code = Some(code);
        if m.is_running() {
            pause_all_vcpus(self, m);
        }
        m.set_run_state(RunState::Shutdown);
        for index in m.cpu_indices() {
            if let Err(e) = cpu_remove_sync(self, m, index) {
                error!("failed to remove cpu {}: {}", index, e);
            }
        }
        m.unlocked(|| self.accel.destroy());
        m.notify(StateChange::Exited(code));
    }
}
