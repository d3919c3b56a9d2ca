// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use bitflags::bitflags;
use downcast_rs::impl_downcast;
use downcast_rs::Downcast;
use sync::BigLockGuard;
use vcpu::BpFlags;
use vcpu::Cpu;
use vcpu::CpuState;
use vcpu::GdbBreakpointType;
use vcpu::InterruptRequest;
use vcpu::SstepFlags;

use crate::Error;
use crate::Machine;
use crate::Result;
use crate::Vm;

/// Operations every accelerator provides.
///
/// Optional capabilities are grouped behind the accessor methods returning `Option`. Callers go
/// through the free functions of this module, which treat an absent capability as "not offered".
pub trait AccelOps: Downcast + Send + Sync {
    fn name(&self) -> &'static str;

    /// Starts the execution thread for `cpu`. Returns once thread bookkeeping is set up, the
    /// caller waits for the thread to mark the CPU created.
    fn create_vcpu_thread(&self, vm: &Arc<Vm>, m: &mut Machine, cpu: &Arc<Cpu>) -> Result<()>;

    /// Merges `mask` into the pending interrupts of `cpu` and makes sure it notices.
    fn handle_interrupt(&self, vm: &Vm, cpu: &Cpu, mask: InterruptRequest);

    fn kick(&self) -> Option<&dyn KickOps> {
        None
    }

    fn idle(&self) -> Option<&dyn IdleOps> {
        None
    }

    fn reset(&self) -> Option<&dyn ResetOps> {
        None
    }

    fn sync(&self) -> Option<&dyn SyncOps> {
        None
    }

    fn guest_debug(&self) -> Option<&dyn GuestDebugOps> {
        None
    }

    /// Single-step modes the accelerator can honor.
    fn supported_sstep_flags(&self) -> SstepFlags {
        SstepFlags::empty()
    }

    /// Releases accelerator-wide resources after every CPU was removed. Called without the big
    /// lock.
    fn destroy(&self) {}
}
impl_downcast!(AccelOps);

pub trait KickOps {
    /// Forces an in-progress quantum of `cpu` to end promptly.
    fn kick_vcpu_thread(&self, vm: &Vm, cpu: &Cpu);
}

pub trait IdleOps {
    /// Whether a halted CPU may sleep on its halt condition.
    fn cpu_thread_is_idle(&self, cpu: &Cpu, state: &CpuState) -> bool;
}

pub trait ResetOps {
    fn cpus_are_resettable(&self) -> bool;
}

/// Register state transfer between the accelerator and the generic CPU state.
pub trait SyncOps {
    fn synchronize_post_reset(&self, _vm: &Vm, _m: &mut BigLockGuard<Machine>, _index: usize) {}
    fn synchronize_post_init(&self, _vm: &Vm, _m: &mut BigLockGuard<Machine>, _index: usize) {}
    fn synchronize_state(&self, _vm: &Vm, _m: &mut BigLockGuard<Machine>, _index: usize) {}
    fn synchronize_pre_loadvm(&self, _vm: &Vm, _m: &mut BigLockGuard<Machine>, _index: usize) {}
    /// Called before CPUs are resumed, with whether any of them will single-step.
    fn synchronize_pre_resume(&self, _vm: &Vm, _m: &mut Machine, _step_pending: bool) {}
}

pub trait GuestDebugOps {
    fn supports_guest_debug(&self) -> bool;

    fn insert_breakpoint(
        &self,
        vm: &Vm,
        m: &mut Machine,
        index: usize,
        ty: GdbBreakpointType,
        addr: u64,
        len: u64,
    ) -> Result<()>;

    fn remove_breakpoint(
        &self,
        vm: &Vm,
        m: &mut Machine,
        index: usize,
        ty: GdbBreakpointType,
        addr: u64,
        len: u64,
    ) -> Result<()>;

    fn remove_all_breakpoints(&self, vm: &Vm, m: &mut Machine, index: usize);

    /// Pushes breakpoints and single-step state of a CPU down to the accelerator.
    fn update_guest_debug(&self, _vm: &Vm, _m: &mut Machine, _index: usize) -> Result<()> {
        Ok(())
    }
}

bitflags! {
    /// Optional capabilities an accelerator offers.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct AccelCaps: u32 {
        const KICK = 1 << 0;
        const IDLE = 1 << 1;
        const RESET = 1 << 2;
        const SYNC = 1 << 3;
        const GUEST_DEBUG = 1 << 4;
    }
}

pub fn capabilities(accel: &dyn AccelOps) -> AccelCaps {
    let mut caps = AccelCaps::empty();
    caps.set(AccelCaps::KICK, accel.kick().is_some());
    caps.set(AccelCaps::IDLE, accel.idle().is_some());
    caps.set(AccelCaps::RESET, accel.reset().is_some());
    caps.set(AccelCaps::SYNC, accel.sync().is_some());
    caps.set(
        AccelCaps::GUEST_DEBUG,
        accel
            .guest_debug()
            .is_some_and(|d| d.supports_guest_debug()),
    );
    caps
}

pub fn has_capability(accel: &dyn AccelOps, cap: AccelCaps) -> bool {
    capabilities(accel).contains(cap)
}

fn missing(accel: &dyn AccelOps, capability: &'static str) -> Error {
    Error::CapabilityMissing {
        accel: accel.name(),
        capability,
    }
}

/// Accelerator kick, `false` if the accelerator has none and the caller must use the generic one.
pub fn accel_kick_vcpu_thread(vm: &Vm, cpu: &Cpu) -> bool {
    match vm.accel().kick() {
        Some(ops) => {
            ops.kick_vcpu_thread(vm, cpu);
            true
        }
        None => false,
    }
}

/// Accelerator idle predicate. A halted CPU is idle unless the accelerator says otherwise.
pub fn accel_cpu_thread_is_idle(vm: &Vm, cpu: &Cpu, state: &CpuState) -> bool {
    vm.accel()
        .idle()
        .map_or(true, |ops| ops.cpu_thread_is_idle(cpu, state))
}

pub fn cpus_are_resettable(vm: &Vm) -> bool {
    vm.accel()
        .reset()
        .map_or(true, |ops| ops.cpus_are_resettable())
}

pub fn cpu_synchronize_state(vm: &Vm, m: &mut BigLockGuard<Machine>, index: usize) {
    if let Some(ops) = vm.accel().sync() {
        ops.synchronize_state(vm, m, index);
    }
}

pub fn cpu_synchronize_post_reset(vm: &Vm, m: &mut BigLockGuard<Machine>, index: usize) {
    if let Some(ops) = vm.accel().sync() {
        ops.synchronize_post_reset(vm, m, index);
    }
}

pub fn cpu_synchronize_post_init(vm: &Vm, m: &mut BigLockGuard<Machine>, index: usize) {
    if let Some(ops) = vm.accel().sync() {
        ops.synchronize_post_init(vm, m, index);
    }
}

pub fn cpu_synchronize_pre_loadvm(vm: &Vm, m: &mut BigLockGuard<Machine>, index: usize) {
    if let Some(ops) = vm.accel().sync() {
        ops.synchronize_pre_loadvm(vm, m, index);
    }
}

pub fn cpu_synchronize_pre_resume(vm: &Vm, m: &mut Machine, step_pending: bool) {
    if let Some(ops) = vm.accel().sync() {
        ops.synchronize_pre_resume(vm, m, step_pending);
    }
}

pub fn supports_guest_debug(vm: &Vm) -> bool {
    has_capability(vm.accel(), AccelCaps::GUEST_DEBUG)
}

fn guest_debug(vm: &Vm) -> Result<&dyn GuestDebugOps> {
    match vm.accel().guest_debug() {
        Some(ops) if ops.supports_guest_debug() => Ok(ops),
        _ => Err(missing(vm.accel(), "guest debug")),
    }
}

/// Inserts a breakpoint of raw debugger type `ty` (0 software, 1 hardware, 2-4 watchpoints).
pub fn insert_breakpoint(
    vm: &Vm,
    m: &mut Machine,
    index: usize,
    ty: u64,
    addr: u64,
    len: u64,
) -> Result<()> {
    let ops = guest_debug(vm)?;
    let ty = GdbBreakpointType::from_raw(ty).ok_or(Error::UnsupportedBreakpoint(ty))?;
    ops.insert_breakpoint(vm, m, index, ty, addr, len)
}

pub fn remove_breakpoint(
    vm: &Vm,
    m: &mut Machine,
    index: usize,
    ty: u64,
    addr: u64,
    len: u64,
) -> Result<()> {
    let ops = guest_debug(vm)?;
    let ty = GdbBreakpointType::from_raw(ty).ok_or(Error::UnsupportedBreakpoint(ty))?;
    ops.remove_breakpoint(vm, m, index, ty, addr, len)
}

/// Removes every debugger breakpoint. A no-op when there are none or no debug support.
pub fn remove_all_breakpoints(vm: &Vm, m: &mut Machine, index: usize) {
    if let Ok(ops) = guest_debug(vm) {
        ops.remove_all_breakpoints(vm, m, index);
    }
}

pub fn update_guest_debug(vm: &Vm, m: &mut Machine, index: usize) -> Result<()> {
    match guest_debug(vm) {
        Ok(ops) => ops.update_guest_debug(vm, m, index),
        Err(_) => Ok(()),
    }
}

/// Inserts a debugger breakpoint or watchpoint into every CPU.
pub(crate) fn insert_gdb_breakpoint_all(
    m: &mut Machine,
    ty: GdbBreakpointType,
    addr: u64,
    len: u64,
) -> Result<()> {
    match ty.watch_flags() {
        None => {
            for slot in m.slots_mut() {
                slot.state.breakpoints.insert_breakpoint(addr, BpFlags::GDB);
            }
        }
        Some(flags) => {
            for slot in m.slots_mut() {
                slot.state
                    .breakpoints
                    .insert_watchpoint(addr, len, flags | BpFlags::GDB)?;
            }
        }
    }
    Ok(())
}

/// Removes a debugger breakpoint or watchpoint from every CPU.
pub(crate) fn remove_gdb_breakpoint_all(
    m: &mut Machine,
    ty: GdbBreakpointType,
    addr: u64,
    len: u64,
) -> Result<()> {
    for slot in m.slots_mut() {
        match ty.watch_flags() {
            None => slot.state.breakpoints.remove_breakpoint(addr, BpFlags::GDB)?,
            Some(flags) => {
                slot.state
                    .breakpoints
                    .remove_watchpoint(addr, len, flags | BpFlags::GDB)?
            }
        }
    }
    Ok(())
}

pub(crate) fn clear_gdb_breakpoints_all(m: &mut Machine) {
    for slot in m.slots_mut() {
        slot.state.breakpoints.remove_breakpoints_by_flags(BpFlags::GDB);
        slot.state.breakpoints.remove_watchpoints_by_flags(BpFlags::GDB);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcg::TcgAccel;
    use crate::tcg::TcgConfig;

    struct Bare;

    impl AccelOps for Bare {
        fn name(&self) -> &'static str {
            "bare"
        }

        fn create_vcpu_thread(&self, _: &Arc<Vm>, _: &mut Machine, _: &Arc<Cpu>) -> Result<()> {
            Ok(())
        }

        fn handle_interrupt(&self, _vm: &Vm, cpu: &Cpu, mask: InterruptRequest) {
            cpu.raise_interrupt(mask);
        }
    }

    #[test]
    fn bare_accelerator_offers_nothing() {
        assert_eq!(capabilities(&Bare), AccelCaps::empty());
        assert!(!has_capability(&Bare, AccelCaps::KICK));
    }

    #[test]
    fn tcg_capabilities() {
        let tcg = TcgAccel::new(TcgConfig::default());
        let caps = capabilities(&tcg);
        assert!(caps.contains(AccelCaps::KICK | AccelCaps::GUEST_DEBUG));
        assert!(!caps.contains(AccelCaps::IDLE));
    }

    #[test]
    fn missing_debug_is_reported() {
        let vm = crate::vm::tests::test_vm(Box::new(Bare), 1);
        let mut m = vm.lock();
        assert!(!supports_guest_debug(&vm));
        let err = insert_breakpoint(&vm, &mut m, 0, 0, 0, 1);
        assert!(matches!(err, Err(Error::CapabilityMissing { .. })));
        remove_all_breakpoints(&vm, &mut m, 0);
        assert!(update_guest_debug(&vm, &mut m, 0).is_ok());
        assert!(cpus_are_resettable(&vm));
    }
}
