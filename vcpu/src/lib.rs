// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Virtual CPU building blocks shared by every accelerator.
//!
//! A vCPU is split in two. [`Cpu`] is the shared handle: identity plus the few flags that other
//! threads touch without the big lock (exit request, kick coalescing, pending interrupt bits).
//! [`CpuState`] is everything else and lives inside the big lock, including the architecture
//! state that a scheduler checks out for the duration of one execution quantum.

mod arch;
mod breakpoint;
mod cpu;
mod memory;
pub mod micro;
mod registers;
mod work;

use remain::sorted;
use thiserror::Error as ThisError;

pub use crate::arch::CpuArch;
pub use crate::arch::ExecControl;
pub use crate::arch::HostCall;
pub use crate::arch::HostCallArg;
pub use crate::arch::QuantumExit;
pub use crate::arch::SstepFlags;
pub use crate::breakpoint::BpFlags;
pub use crate::breakpoint::Breakpoint;
pub use crate::breakpoint::BreakpointSet;
pub use crate::breakpoint::GdbBreakpointType;
pub use crate::breakpoint::WatchHit;
pub use crate::breakpoint::Watchpoint;
pub use crate::cpu::current_cpu;
pub use crate::cpu::in_vcpu_thread;
pub use crate::cpu::mark_vcpu_thread;
pub use crate::cpu::set_current_cpu;
pub use crate::cpu::AccelVcpu;
pub use crate::cpu::Cpu;
pub use crate::cpu::CpuState;
pub use crate::cpu::InterruptRequest;
pub use crate::memory::GuestMemory;
pub use crate::registers::CoreFeature;
pub use crate::registers::FeatureDescriptor;
pub use crate::registers::GetRegFn;
pub use crate::registers::RegisterDesc;
pub use crate::registers::RegisterFile;
pub use crate::registers::RegisterInfo;
pub use crate::registers::SetRegFn;
pub use crate::work::WorkFn;
pub use crate::work::WorkItem;
pub use crate::work::WorkQueue;

#[sorted]
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No breakpoint matched a removal request.
    #[error("no breakpoint at {0:#x}")]
    BreakpointNotFound(u64),
    /// The architecture state is checked out by a running quantum.
    #[error("cpu state is checked out by a running quantum")]
    EnvCheckedOut,
    /// A watchpoint with an empty or wrapping range.
    #[error("invalid watchpoint at {addr:#x} length {len}")]
    InvalidWatchpoint { addr: u64, len: u64 },
    /// A guest memory access outside of guest RAM.
    #[error("guest memory access out of range: {addr:#x}+{len}")]
    MemoryOutOfRange { addr: u64, len: usize },
    /// No watchpoint matched a removal request.
    #[error("no watchpoint at {0:#x}")]
    WatchpointNotFound(u64),
}

pub type Result<T> = std::result::Result<T, Error>;
