// Copyright 2020 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Accelerator dispatch and vCPU scheduling.
//!
//! Every accelerator implements [`AccelOps`]. The rest of the system programs against that trait
//! and the lifecycle helpers in this crate (`vm_stop`, `pause_all_vcpus`, `run_on_cpu`, ...),
//! never against a concrete accelerator kind.
//!
//! All guest-visible state lives in [`Machine`], behind the big lock owned by [`Vm`]. vCPU threads
//! hold that lock except while a quantum of guest code runs.

mod accel;
mod clock;
mod cpus;
pub mod hw;
mod machine;
mod quantum;
mod replay;
pub mod tcg;
mod vm;
mod work;

use remain::sorted;
use thiserror::Error as ThisError;

pub use crate::accel::*;
pub use crate::clock::run_expired_timers;
pub use crate::clock::TimerCallback;
pub use crate::clock::TimerId;
pub use crate::clock::VirtualClock;
pub use crate::cpus::*;
pub use crate::machine::CpuSlot;
pub use crate::machine::Machine;
pub use crate::machine::RunState;
pub use crate::machine::StateChange;
pub use crate::replay::Replay;
pub use crate::replay::ReplayMode;
pub use crate::vm::Vm;
pub use crate::vm::VmRequest;
pub use crate::work::async_run_on_cpu;
pub use crate::work::process_queued_cpu_work;
pub use crate::work::run_on_cpu;

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    /// A hardware backend operation failed.
    #[error("{accel} backend failed on cpu {index}: {reason}")]
    Backend {
        accel: &'static str,
        index: usize,
        reason: String,
    },
    /// The accelerator does not offer a capability.
    #[error("accelerator {accel} does not support {capability}")]
    CapabilityMissing {
        accel: &'static str,
        capability: &'static str,
    },
    /// The main loop was started twice.
    #[error("main loop already running")]
    MainLoopRunning,
    /// No CPU has the given index.
    #[error("no cpu with index {0}")]
    NoSuchCpu(usize),
    /// Failed to spawn a vCPU thread.
    #[error("failed to spawn vcpu thread: {0}")]
    SpawnThread(std::io::Error),
    /// A breakpoint type the accelerator cannot insert.
    #[error("unsupported breakpoint type {0}")]
    UnsupportedBreakpoint(u64),
    /// Error from CPU state.
    #[error("vcpu: {0}")]
    Vcpu(vcpu::Error),
}

impl From<vcpu::Error> for Error {
    fn from(e: vcpu::Error) -> Self {
        Error::Vcpu(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
