// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use bitflags::bitflags;
use downcast_rs::impl_downcast;
use downcast_rs::Downcast;

use crate::BreakpointSet;
use crate::CoreFeature;
use crate::InterruptRequest;
use crate::RegisterFile;
use crate::Result;
use crate::WatchHit;

bitflags! {
    /// Single-step behavior requested by the debugger.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct SstepFlags: u32 {
        const ENABLE = 0x1;
        /// Do not service interrupts while stepping.
        const NOIRQ = 0x2;
        /// Do not fire timers while stepping.
        const NOTIMER = 0x4;
    }
}

/// Why an execution quantum ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QuantumExit {
    /// Budget exhausted, exit requested, or a host call or shutdown was raised.
    Normal,
    /// A breakpoint, watchpoint or single step fired.
    DebugTrap,
    /// The CPU halted and has no work.
    Halted,
    /// The next instruction must run exclusively through [`CpuArch::step_atomic`].
    AtomicRetry,
}

/// Argument of a guest host call as forwarded to the debugger.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HostCallArg {
    Int(u64),
    /// A guest buffer, sent as `addr/len`.
    Buffer { addr: u64, len: u64 },
}

/// A system call the guest asked the debugger to perform on its behalf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostCall {
    pub name: &'static str,
    pub args: Vec<HostCallArg>,
}

/// Inputs and outputs of one execution quantum.
pub struct ExecControl<'a> {
    pub exit_request: &'a AtomicBool,
    pub interrupt_request: &'a AtomicU32,
    pub breakpoints: &'a BreakpointSet,
    pub singlestep: SstepFlags,
    /// Maximum number of instructions to run, `None` for unlimited.
    pub budget: Option<u64>,
    pub executed: u64,
    /// Halt state on entry, updated on exit.
    pub halted: bool,
    pub watch_hit: Option<WatchHit>,
    pub host_call: Option<HostCall>,
    /// Exit code of a guest-requested shutdown.
    pub shutdown: Option<i32>,
}

impl<'a> ExecControl<'a> {
    pub fn new(
        exit_request: &'a AtomicBool,
        interrupt_request: &'a AtomicU32,
        breakpoints: &'a BreakpointSet,
    ) -> Self {
        ExecControl {
            exit_request,
            interrupt_request,
            breakpoints,
            singlestep: SstepFlags::empty(),
            budget: None,
            executed: 0,
            halted: false,
            watch_hit: None,
            host_call: None,
            shutdown: None,
        }
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_request.load(Ordering::Acquire)
    }

    pub fn budget_exhausted(&self) -> bool {
        matches!(self.budget, Some(b) if self.executed >= b)
    }

    pub fn pending_interrupts(&self) -> InterruptRequest {
        InterruptRequest::from_bits_truncate(self.interrupt_request.load(Ordering::Acquire))
    }

    /// Acknowledges the interrupt bits in `mask`.
    pub fn ack_interrupts(&self, mask: InterruptRequest) {
        self.interrupt_request
            .fetch_and(!mask.bits(), Ordering::AcqRel);
    }
}

/// Architecture state and instruction semantics of one CPU.
pub trait CpuArch: Downcast + Send {
    fn class_name(&self) -> &'static str;

    /// Architecture name reported in the target description.
    fn arch_name(&self) -> Option<&'static str> {
        None
    }

    /// The canonical core register feature of this CPU class.
    fn core_feature(&self) -> Option<CoreFeature>;

    /// Registers coprocessor and extension features after the core one.
    fn register_features(&self, _registers: &mut RegisterFile) {}

    fn pc(&self) -> u64;
    fn set_pc(&mut self, pc: u64);
    fn reset(&mut self);

    /// Debugger access to memory as seen by the CPU.
    fn memory_rw_debug(&mut self, addr: u64, buf: &mut [u8], is_write: bool) -> Result<()>;

    /// Whether pending `interrupts` would wake this CPU from halt.
    fn has_work(&self, interrupts: InterruptRequest) -> bool;

    fn exec(&mut self, ctl: &mut ExecControl) -> QuantumExit;

    /// Executes exactly one instruction with no other CPU running.
    fn step_atomic(&mut self, ctl: &mut ExecControl);

    /// Delivers the result of a host call completed by the debugger.
    fn complete_host_call(&mut self, ret: u64, errno: u64);
}
impl_downcast!(CpuArch);
