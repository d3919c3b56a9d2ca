// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use bitflags::bitflags;
use enumn::N;

use crate::Error;
use crate::Result;

bitflags! {
    /// Attributes of a breakpoint or watchpoint.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BpFlags: u32 {
        const MEM_READ = 0x01;
        const MEM_WRITE = 0x02;
        const MEM_ACCESS = Self::MEM_READ.bits() | Self::MEM_WRITE.bits();
        const STOP_BEFORE_ACCESS = 0x04;
        /// Inserted on behalf of the debugger.
        const GDB = 0x10;
        /// Inserted by the guest itself.
        const CPU = 0x20;
    }
}

/// Breakpoint kinds as numbered by the GDB `Z`/`z` packets.
#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum GdbBreakpointType {
    Software = 0,
    Hardware = 1,
    WriteWatch = 2,
    ReadWatch = 3,
    AccessWatch = 4,
}

impl GdbBreakpointType {
    pub fn from_raw(ty: u64) -> Option<Self> {
        u32::try_from(ty).ok().and_then(Self::n)
    }

    /// Access flags for the watchpoint kinds, `None` for code breakpoints.
    pub fn watch_flags(self) -> Option<BpFlags> {
        match self {
            GdbBreakpointType::Software | GdbBreakpointType::Hardware => None,
            GdbBreakpointType::WriteWatch => Some(BpFlags::MEM_WRITE),
            GdbBreakpointType::ReadWatch => Some(BpFlags::MEM_READ),
            GdbBreakpointType::AccessWatch => Some(BpFlags::MEM_ACCESS),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Breakpoint {
    pub pc: u64,
    pub flags: BpFlags,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Watchpoint {
    pub addr: u64,
    pub len: u64,
    pub flags: BpFlags,
}

impl Watchpoint {
    fn overlaps(&self, addr: u64, len: u64) -> bool {
        let end = self.addr + (self.len - 1);
        let access_end = addr.saturating_add(len.saturating_sub(1));
        addr <= end && access_end >= self.addr
    }
}

/// The watchpoint that most recently triggered on a CPU.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WatchHit {
    pub addr: u64,
    pub flags: BpFlags,
}

impl WatchHit {
    /// Prefix used in a `watch` stop reply: `r` for read, `a` for access and nothing for write.
    pub fn kind_prefix(&self) -> &'static str {
        match self.flags & BpFlags::MEM_ACCESS {
            BpFlags::MEM_READ => "r",
            BpFlags::MEM_ACCESS => "a",
            _ => "",
        }
    }
}

/// Per-CPU breakpoint and watchpoint lists.
#[derive(Clone, Debug, Default)]
pub struct BreakpointSet {
    breakpoints: Vec<Breakpoint>,
    watchpoints: Vec<Watchpoint>,
}

impl BreakpointSet {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn insert_breakpoint(&mut self, pc: u64, flags: BpFlags) {
        // Debugger breakpoints take precedence over guest ones.
        let bp = Breakpoint { pc, flags };
        if flags.contains(BpFlags::GDB) {
            self.breakpoints.insert(0, bp);
        } else {
            self.breakpoints.push(bp);
        }
    }

    pub fn remove_breakpoint(&mut self, pc: u64, flags: BpFlags) -> Result<()> {
        match self
            .breakpoints
            .iter()
            .position(|bp| bp.pc == pc && bp.flags == flags)
        {
            Some(i) => {
                self.breakpoints.remove(i);
                Ok(())
            }
            None => Err(Error::BreakpointNotFound(pc)),
        }
    }

    /// Removes every breakpoint that has any of the bits in `mask`.
    pub fn remove_breakpoints_by_flags(&mut self, mask: BpFlags) {
        self.breakpoints.retain(|bp| !bp.flags.intersects(mask));
    }

    pub fn insert_watchpoint(&mut self, addr: u64, len: u64, flags: BpFlags) -> Result<()> {
        if len == 0 || addr.checked_add(len - 1).is_none() {
            return Err(Error::InvalidWatchpoint { addr, len });
        }
        let wp = Watchpoint { addr, len, flags };
        if flags.contains(BpFlags::GDB) {
            self.watchpoints.insert(0, wp);
        } else {
            self.watchpoints.push(wp);
        }
        Ok(())
    }

    pub fn remove_watchpoint(&mut self, addr: u64, len: u64, flags: BpFlags) -> Result<()> {
        match self
            .watchpoints
            .iter()
            .position(|wp| wp.addr == addr && wp.len == len && wp.flags == flags)
        {
            Some(i) => {
                self.watchpoints.remove(i);
                Ok(())
            }
            None => Err(Error::WatchpointNotFound(addr)),
        }
    }

    pub fn remove_watchpoints_by_flags(&mut self, mask: BpFlags) {
        self.watchpoints.retain(|wp| !wp.flags.intersects(mask));
    }

    pub fn breakpoint_at(&self, pc: u64) -> bool {
        self.breakpoints.iter().any(|bp| bp.pc == pc)
    }

    /// Returns the first watchpoint covering an access of `len` bytes at `addr` of kind `access`.
    pub fn check_watchpoint(&self, addr: u64, len: u64, access: BpFlags) -> Option<WatchHit> {
        self.watchpoints
            .iter()
            .find(|wp| wp.flags.intersects(access & BpFlags::MEM_ACCESS) && wp.overlaps(addr, len))
            .map(|wp| WatchHit {
                addr,
                flags: wp.flags,
            })
    }

    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    pub fn watchpoints(&self) -> &[Watchpoint] {
        &self.watchpoints
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty() && self.watchpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gdb_types() {
        assert_eq!(
            GdbBreakpointType::from_raw(0),
            Some(GdbBreakpointType::Software)
        );
        assert_eq!(
            GdbBreakpointType::from_raw(4),
            Some(GdbBreakpointType::AccessWatch)
        );
        assert_eq!(GdbBreakpointType::from_raw(5), None);
        assert_eq!(GdbBreakpointType::from_raw(1 << 40), None);
        assert_eq!(GdbBreakpointType::Hardware.watch_flags(), None);
        assert_eq!(
            GdbBreakpointType::ReadWatch.watch_flags(),
            Some(BpFlags::MEM_READ)
        );
    }

    #[test]
    fn insert_remove_breakpoints() {
        let mut set = BreakpointSet::new();
        set.insert_breakpoint(0x10, BpFlags::GDB);
        set.insert_breakpoint(0x20, BpFlags::CPU);
        assert!(set.breakpoint_at(0x10));
        assert!(set.breakpoint_at(0x20));
        assert!(!set.breakpoint_at(0x30));

        assert_eq!(
            set.remove_breakpoint(0x20, BpFlags::GDB),
            Err(Error::BreakpointNotFound(0x20))
        );
        set.remove_breakpoints_by_flags(BpFlags::GDB);
        assert!(!set.breakpoint_at(0x10));
        assert!(set.breakpoint_at(0x20));
        set.remove_breakpoint(0x20, BpFlags::CPU).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn watchpoint_ranges() {
        let mut set = BreakpointSet::new();
        assert!(set.insert_watchpoint(0x100, 0, BpFlags::MEM_WRITE).is_err());
        assert!(set.insert_watchpoint(u64::MAX, 2, BpFlags::MEM_WRITE).is_err());
        set.insert_watchpoint(0x100, 4, BpFlags::MEM_WRITE | BpFlags::GDB)
            .unwrap();

        assert_eq!(set.check_watchpoint(0x0ff, 1, BpFlags::MEM_WRITE), None);
        assert_eq!(set.check_watchpoint(0x104, 1, BpFlags::MEM_WRITE), None);
        assert_eq!(set.check_watchpoint(0x102, 1, BpFlags::MEM_READ), None);
        let hit = set.check_watchpoint(0x0ff, 2, BpFlags::MEM_WRITE).unwrap();
        assert_eq!(hit.addr, 0x0ff);
        assert_eq!(hit.kind_prefix(), "");

        set.insert_watchpoint(0x200, 1, BpFlags::MEM_ACCESS | BpFlags::GDB)
            .unwrap();
        let hit = set.check_watchpoint(0x200, 1, BpFlags::MEM_READ).unwrap();
        assert_eq!(hit.kind_prefix(), "a");

        set.remove_watchpoints_by_flags(BpFlags::GDB);
        assert!(set.watchpoints().is_empty());
    }

    #[test]
    fn watch_prefix() {
        let hit = WatchHit {
            addr: 0,
            flags: BpFlags::MEM_READ | BpFlags::GDB,
        };
        assert_eq!(hit.kind_prefix(), "r");
    }
}
