// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cell::Cell;
use std::cell::RefCell;
use std::fmt;
use std::fmt::Debug;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;
use std::thread;
use std::thread::JoinHandle;
use std::thread::ThreadId;

use bitflags::bitflags;
use downcast_rs::impl_downcast;
use downcast_rs::Downcast;
use sync::Condvar;
use sync::Mutex;

use crate::BreakpointSet;
use crate::CpuArch;
use crate::Error;
use crate::RegisterFile;
use crate::Result;
use crate::SstepFlags;
use crate::WatchHit;
use crate::WorkQueue;

bitflags! {
    /// Pending interrupt bits of a CPU.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct InterruptRequest: u32 {
        const HARD = 0x0002;
        const EXITTB = 0x0004;
        const HALT = 0x0020;
        const DEBUG = 0x0080;
        const RESET = 0x0400;
    }
}

thread_local! {
    static CURRENT_CPU: RefCell<Option<Arc<Cpu>>> = const { RefCell::new(None) };
    static IN_VCPU_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// The CPU whose execution loop runs on this thread, if any.
pub fn current_cpu() -> Option<Arc<Cpu>> {
    CURRENT_CPU.with(|c| c.borrow().clone())
}

pub fn set_current_cpu(cpu: Option<Arc<Cpu>>) {
    CURRENT_CPU.with(|c| *c.borrow_mut() = cpu);
}

/// Whether this thread runs guest code. Stays true for the whole life of a vCPU thread.
pub fn in_vcpu_thread() -> bool {
    IN_VCPU_THREAD.with(|c| c.get())
}

pub fn mark_vcpu_thread() {
    IN_VCPU_THREAD.with(|c| c.set(true));
}

/// Shared handle to a virtual CPU.
///
/// Only the fields that must be reachable without the big lock live here.
pub struct Cpu {
    index: usize,
    cluster: Option<u32>,
    exit_request: AtomicBool,
    thread_kicked: AtomicBool,
    can_do_io: AtomicBool,
    interrupt_request: AtomicU32,
    quanta: AtomicU64,
    halt_cond: OnceLock<Arc<Condvar>>,
    thread_id: OnceLock<ThreadId>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Cpu {
    pub fn new(index: usize, cluster: Option<u32>) -> Arc<Cpu> {
        Arc::new(Cpu {
            index,
            cluster,
            exit_request: AtomicBool::new(false),
            thread_kicked: AtomicBool::new(false),
            can_do_io: AtomicBool::new(true),
            interrupt_request: AtomicU32::new(0),
            quanta: AtomicU64::new(0),
            halt_cond: OnceLock::new(),
            thread_id: OnceLock::new(),
            thread: Mutex::new(None),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn cluster(&self) -> Option<u32> {
        self.cluster
    }

    /// Asks the CPU to leave its execution loop at the next opportunity.
    pub fn exit(&self) {
        self.exit_request.store(true, Ordering::Release);
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_request.load(Ordering::Acquire)
    }

    pub fn clear_exit_request(&self) {
        self.exit_request.store(false, Ordering::Release);
    }

    pub fn exit_request_flag(&self) -> &AtomicBool {
        &self.exit_request
    }

    /// Marks the CPU as kicked and returns whether it already was.
    pub fn mark_kicked(&self) -> bool {
        self.thread_kicked.swap(true, Ordering::AcqRel)
    }

    pub fn clear_kicked(&self) {
        self.thread_kicked.store(false, Ordering::Release);
    }

    pub fn thread_kicked(&self) -> bool {
        self.thread_kicked.load(Ordering::Acquire)
    }

    pub fn can_do_io(&self) -> bool {
        self.can_do_io.load(Ordering::Acquire)
    }

    pub fn set_can_do_io(&self, val: bool) {
        self.can_do_io.store(val, Ordering::Release);
    }

    pub fn interrupt_request(&self) -> InterruptRequest {
        InterruptRequest::from_bits_truncate(self.interrupt_request.load(Ordering::Acquire))
    }

    pub fn interrupt_request_flag(&self) -> &AtomicU32 {
        &self.interrupt_request
    }

    /// Sets bits in the interrupt request word, returning the previous value.
    pub fn raise_interrupt(&self, mask: InterruptRequest) -> InterruptRequest {
        InterruptRequest::from_bits_truncate(
            self.interrupt_request
                .fetch_or(mask.bits(), Ordering::AcqRel),
        )
    }

    pub fn clear_interrupt(&self, mask: InterruptRequest) {
        self.interrupt_request
            .fetch_and(!mask.bits(), Ordering::AcqRel);
    }

    pub fn record_quantum(&self) {
        self.quanta.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of execution quanta this CPU went through.
    pub fn quanta(&self) -> u64 {
        self.quanta.load(Ordering::Relaxed)
    }

    /// Installs the condition variable the CPU's thread sleeps on. Returns false if one was
    /// already installed, which happens when several CPUs share a thread.
    pub fn set_halt_cond(&self, cond: Arc<Condvar>) -> bool {
        self.halt_cond.set(cond).is_ok()
    }

    pub fn halt_cond(&self) -> Option<&Arc<Condvar>> {
        self.halt_cond.get()
    }

    /// Records the thread that runs this CPU. Only the first call has an effect.
    pub fn set_thread_id(&self, id: ThreadId) {
        let _ = self.thread_id.set(id);
    }

    pub fn bind_current_thread(&self) {
        self.set_thread_id(thread::current().id());
    }

    pub fn thread_id(&self) -> Option<ThreadId> {
        self.thread_id.get().copied()
    }

    /// Whether the caller runs on this CPU's thread.
    pub fn is_self(&self) -> bool {
        self.thread_id() == Some(thread::current().id())
    }

    pub fn set_join_handle(&self, handle: JoinHandle<()>) {
        *self.thread.lock() = Some(handle);
    }

    pub fn take_join_handle(&self) -> Option<JoinHandle<()>> {
        self.thread.lock().take()
    }

    pub fn thread(&self) -> Option<thread::Thread> {
        self.thread.lock().as_ref().map(|h| h.thread().clone())
    }
}

impl Debug for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cpu")
            .field("index", &self.index)
            .field("cluster", &self.cluster)
            .finish()
    }
}

/// Accelerator-private per-CPU state.
pub trait AccelVcpu: Downcast + Send {}
impl_downcast!(AccelVcpu);

/// The part of a CPU protected by the big lock.
pub struct CpuState {
    pub halted: bool,
    pub stop: bool,
    pub stopped: bool,
    pub unplug: bool,
    pub created: bool,
    pub singlestep: SstepFlags,
    pub breakpoints: BreakpointSet,
    pub watchpoint_hit: Option<WatchHit>,
    pub icount_budget: i64,
    pub icount_extra: i64,
    pub registers: RegisterFile,
    pub work: WorkQueue,
    env: Option<Box<dyn CpuArch>>,
    accel: Option<Box<dyn AccelVcpu>>,
}

impl CpuState {
    /// A CPU starts out stopped, it only runs once the machine is started.
    pub fn new(env: Box<dyn CpuArch>) -> CpuState {
        CpuState {
            halted: false,
            stop: false,
            stopped: true,
            unplug: false,
            created: false,
            singlestep: SstepFlags::empty(),
            breakpoints: BreakpointSet::new(),
            watchpoint_hit: None,
            icount_budget: 0,
            icount_extra: 0,
            registers: RegisterFile::new(),
            work: WorkQueue::default(),
            env: Some(env),
            accel: None,
        }
    }

    pub fn env(&self) -> Option<&dyn CpuArch> {
        self.env.as_deref()
    }

    pub fn env_mut(&mut self) -> Option<&mut dyn CpuArch> {
        match self.env.as_mut() {
            Some(env) => Some(env.as_mut()),
            None => None,
        }
    }

    pub fn arch<T: CpuArch>(&mut self) -> Option<&mut T> {
        self.env.as_mut()?.downcast_mut::<T>()
    }

    /// Takes the architecture state out for a quantum run without the big lock.
    pub fn checkout_env(&mut self) -> Result<Box<dyn CpuArch>> {
        self.env.take().ok_or(Error::EnvCheckedOut)
    }

    pub fn return_env(&mut self, env: Box<dyn CpuArch>) {
        self.env = Some(env);
    }

    pub fn set_accel(&mut self, accel: Box<dyn AccelVcpu>) {
        self.accel = Some(accel);
    }

    pub fn accel<T: AccelVcpu>(&mut self) -> Option<&mut T> {
        self.accel.as_mut()?.downcast_mut::<T>()
    }

    pub fn take_accel(&mut self) -> Option<Box<dyn AccelVcpu>> {
        self.accel.take()
    }

    /// Sets up the register file from the CPU class: core feature first, then extensions.
    pub fn init_registers(&mut self) {
        if let Some(env) = self.env.as_deref() {
            self.registers.init(env);
            env.register_features(&mut self.registers);
        }
    }

    pub fn read_register(&mut self, buf: &mut Vec<u8>, index: usize) -> usize {
        match self.env.as_mut() {
            Some(env) => self.registers.read(env.as_mut(), buf, index),
            None => 0,
        }
    }

    pub fn write_register(&mut self, buf: &[u8], index: usize) -> usize {
        match self.env.as_mut() {
            Some(env) => self.registers.write(env.as_mut(), buf, index),
            None => 0,
        }
    }

    pub fn memory_rw_debug(&mut self, addr: u64, buf: &mut [u8], is_write: bool) -> Result<()> {
        self.env
            .as_mut()
            .ok_or(Error::EnvCheckedOut)?
            .memory_rw_debug(addr, buf, is_write)
    }

    /// Whether the CPU has something to do besides sleeping in halt.
    pub fn has_work(&self, cpu: &Cpu) -> bool {
        match self.env.as_ref() {
            Some(env) => env.has_work(cpu.interrupt_request()),
            None => true,
        }
    }
}
