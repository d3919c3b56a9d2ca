// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A small reference instruction set used to drive the execution core.
//!
//! Every instruction starts with a one byte opcode, optionally followed by register numbers and a
//! little-endian 16-bit immediate. Addresses seen by the CPU are offset by the `seg` register
//! before they reach guest memory, so debugger accesses in virtual and physical mode differ.
//!
//! | opcode | mnemonic       | effect                                        |
//! |--------|----------------|-----------------------------------------------|
//! | 0x00   | `nop`          |                                               |
//! | 0x01   | `hlt`          | halt until an interrupt arrives               |
//! | 0x02   | `inc r`        | `r += 1`                                      |
//! | 0x03   | `xinc r`       | atomically increment the byte at `[r]`        |
//! | 0x04   | `stb a, b`     | `[b] = a`                                     |
//! | 0x05   | `ldb a, b`     | `a = [b]`                                     |
//! | 0x06   | `jmp imm`      | `pc = imm`                                    |
//! | 0x07   | `movi r, imm`  | `r = imm`                                     |
//! | 0x08   | `hcall`        | host `write(r0, r1, r2)`, result in r0 and r1 |
//! | 0x09   | `shutdown`     | power off with exit code r0                   |
//! | 0x0a   | `jnz r, imm`   | `if r != 0 { pc = imm }`                      |
//! | 0x0b   | `dec r`        | `r -= 1`                                      |

use base::warn;

use crate::BpFlags;
use crate::CoreFeature;
use crate::CpuArch;
use crate::ExecControl;
use crate::FeatureDescriptor;
use crate::GetRegFn;
use crate::GuestMemory;
use crate::HostCall;
use crate::HostCallArg;
use crate::InterruptRequest;
use crate::QuantumExit;
use crate::RegisterDesc;
use crate::RegisterFile;
use crate::Result;
use crate::SetRegFn;
use crate::SstepFlags;
use crate::WatchHit;

pub const NUM_GPRS: usize = 8;

pub mod op {
    pub const NOP: u8 = 0x00;
    pub const HLT: u8 = 0x01;
    pub const INC: u8 = 0x02;
    pub const XINC: u8 = 0x03;
    pub const STB: u8 = 0x04;
    pub const LDB: u8 = 0x05;
    pub const JMP: u8 = 0x06;
    pub const MOVI: u8 = 0x07;
    pub const HCALL: u8 = 0x08;
    pub const SHUTDOWN: u8 = 0x09;
    pub const JNZ: u8 = 0x0a;
    pub const DEC: u8 = 0x0b;
}

const fn reg64(name: &'static str, reg_type: &'static str) -> RegisterDesc {
    RegisterDesc {
        name,
        bitsize: 64,
        reg_type,
    }
}

static CORE_REGS: [RegisterDesc; NUM_GPRS + 1] = [
    reg64("r0", "int"),
    reg64("r1", "int"),
    reg64("r2", "int"),
    reg64("r3", "int"),
    reg64("r4", "int"),
    reg64("r5", "int"),
    reg64("r6", "int"),
    reg64("r7", "int"),
    reg64("pc", "code_ptr"),
];

pub static CORE_FEATURE: FeatureDescriptor = FeatureDescriptor {
    name: "org.accelvm.micro.core",
    xml_file: "micro-core.xml",
    registers: &CORE_REGS,
};

static SYS_REGS: [RegisterDesc; 2] = [reg64("seg", "data_ptr"), reg64("irqs", "int")];

pub static SYS_FEATURE: FeatureDescriptor = FeatureDescriptor {
    name: "org.accelvm.micro.sys",
    xml_file: "micro-sys.xml",
    registers: &SYS_REGS,
};

fn put64(buf: &mut Vec<u8>, val: u64) -> usize {
    buf.extend_from_slice(&val.to_le_bytes());
    8
}

fn get64(buf: &[u8]) -> Option<u64> {
    buf.get(..8)
        .and_then(|b| <[u8; 8]>::try_from(b).ok())
        .map(u64::from_le_bytes)
}

fn get_core_reg(arch: &mut dyn CpuArch, buf: &mut Vec<u8>, n: usize) -> usize {
    let Some(cpu) = arch.downcast_mut::<MicroCpu>() else {
        return 0;
    };
    match n {
        0..=7 => put64(buf, cpu.regs[n]),
        8 => put64(buf, cpu.pc),
        _ => 0,
    }
}

fn set_core_reg(arch: &mut dyn CpuArch, buf: &[u8], n: usize) -> usize {
    let (Some(cpu), Some(val)) = (arch.downcast_mut::<MicroCpu>(), get64(buf)) else {
        return 0;
    };
    match n {
        0..=7 => cpu.regs[n] = val,
        8 => cpu.pc = val,
        _ => return 0,
    }
    8
}

fn get_sys_reg(arch: &mut dyn CpuArch, buf: &mut Vec<u8>, n: usize) -> usize {
    let Some(cpu) = arch.downcast_mut::<MicroCpu>() else {
        return 0;
    };
    match n {
        0 => put64(buf, cpu.seg),
        1 => put64(buf, cpu.irqs),
        _ => 0,
    }
}

fn set_sys_reg(arch: &mut dyn CpuArch, buf: &[u8], n: usize) -> usize {
    let (Some(cpu), Some(val)) = (arch.downcast_mut::<MicroCpu>(), get64(buf)) else {
        return 0;
    };
    match n {
        0 => cpu.seg = val,
        1 => cpu.irqs = val,
        _ => return 0,
    }
    8
}

/// Accessors for the optional system register feature.
pub fn sys_feature() -> (GetRegFn, SetRegFn, &'static FeatureDescriptor) {
    (get_sys_reg, set_sys_reg, &SYS_FEATURE)
}

enum Step {
    Next,
    Exit(QuantumExit),
}

pub struct MicroCpu {
    regs: [u64; NUM_GPRS],
    pc: u64,
    seg: u64,
    irqs: u64,
    reset_pc: u64,
    mem: GuestMemory,
}

impl MicroCpu {
    pub fn new(mem: GuestMemory) -> MicroCpu {
        let reset_pc = mem.base();
        MicroCpu {
            regs: [0; NUM_GPRS],
            pc: reset_pc,
            seg: 0,
            irqs: 0,
            reset_pc,
            mem,
        }
    }

    pub fn with_entry(mem: GuestMemory, entry: u64) -> MicroCpu {
        let mut cpu = MicroCpu::new(mem);
        cpu.reset_pc = entry;
        cpu.pc = entry;
        cpu
    }

    pub fn reg(&self, n: usize) -> u64 {
        self.regs[n % NUM_GPRS]
    }

    pub fn set_reg(&mut self, n: usize, val: u64) {
        self.regs[n % NUM_GPRS] = val;
    }

    pub fn seg(&self) -> u64 {
        self.seg
    }

    pub fn set_seg(&mut self, seg: u64) {
        self.seg = seg;
    }

    /// Number of hardware interrupts serviced.
    pub fn irqs(&self) -> u64 {
        self.irqs
    }

    fn vaddr(&self, addr: u64) -> u64 {
        self.seg.wrapping_add(addr)
    }

    fn fetch(&self, off: u64) -> Option<u8> {
        self.mem.read_u8(self.vaddr(self.pc.wrapping_add(off))).ok()
    }

    fn fetch_imm(&self, off: u64) -> Option<u64> {
        let lo = self.fetch(off)?;
        let hi = self.fetch(off + 1)?;
        Some(u16::from_le_bytes([lo, hi]) as u64)
    }

    fn fetch_reg(&self, off: u64) -> Option<usize> {
        self.fetch(off).map(|r| r as usize % NUM_GPRS)
    }

    fn fault(&self, ctl: &mut ExecControl, what: &str) -> Step {
        warn!("micro cpu: {} at pc {:#x}, halting", what, self.pc);
        ctl.halted = true;
        Step::Exit(QuantumExit::Halted)
    }

    fn watch(ctl: &mut ExecControl, addr: u64, access: BpFlags) {
        if ctl.watch_hit.is_none() {
            ctl.watch_hit = ctl.breakpoints.check_watchpoint(addr, 1, access);
        }
    }

    /// Decodes and runs the instruction at `pc`. Counts it in `ctl.executed` if it retired.
    fn step(&mut self, ctl: &mut ExecControl, exclusive: bool) -> Step {
        let Some(opcode) = self.fetch(0) else {
            return self.fault(ctl, "instruction fetch out of range");
        };
        let mut exit = None;
        let next = match opcode {
            op::NOP => self.pc + 1,
            op::HLT => {
                ctl.halted = true;
                exit = Some(QuantumExit::Halted);
                self.pc + 1
            }
            op::INC | op::DEC => {
                let Some(r) = self.fetch_reg(1) else {
                    return self.fault(ctl, "truncated instruction");
                };
                self.regs[r] = if opcode == op::INC {
                    self.regs[r].wrapping_add(1)
                } else {
                    self.regs[r].wrapping_sub(1)
                };
                self.pc + 2
            }
            op::XINC => {
                if !exclusive {
                    return Step::Exit(QuantumExit::AtomicRetry);
                }
                let Some(r) = self.fetch_reg(1) else {
                    return self.fault(ctl, "truncated instruction");
                };
                let addr = self.regs[r];
                if self
                    .mem
                    .update_u8(self.vaddr(addr), |v| v.wrapping_add(1))
                    .is_err()
                {
                    return self.fault(ctl, "atomic access out of range");
                }
                Self::watch(ctl, addr, BpFlags::MEM_WRITE);
                self.pc + 2
            }
            op::STB | op::LDB => {
                let (Some(a), Some(b)) = (self.fetch_reg(1), self.fetch_reg(2)) else {
                    return self.fault(ctl, "truncated instruction");
                };
                let addr = self.regs[b];
                if opcode == op::STB {
                    if self
                        .mem
                        .write_u8(self.vaddr(addr), self.regs[a] as u8)
                        .is_err()
                    {
                        return self.fault(ctl, "store out of range");
                    }
                    Self::watch(ctl, addr, BpFlags::MEM_WRITE);
                } else {
                    match self.mem.read_u8(self.vaddr(addr)) {
                        Ok(v) => self.regs[a] = v as u64,
                        Err(_) => return self.fault(ctl, "load out of range"),
                    }
                    Self::watch(ctl, addr, BpFlags::MEM_READ);
                }
                self.pc + 3
            }
            op::JMP => match self.fetch_imm(1) {
                Some(imm) => imm,
                None => return self.fault(ctl, "truncated instruction"),
            },
            op::MOVI | op::JNZ => {
                let (Some(r), Some(imm)) = (self.fetch_reg(1), self.fetch_imm(2)) else {
                    return self.fault(ctl, "truncated instruction");
                };
                if opcode == op::MOVI {
                    self.regs[r] = imm;
                    self.pc + 4
                } else if self.regs[r] != 0 {
                    imm
                } else {
                    self.pc + 4
                }
            }
            op::HCALL => {
                ctl.host_call = Some(HostCall {
                    name: "write",
                    args: vec![
                        HostCallArg::Int(self.regs[0]),
                        HostCallArg::Buffer {
                            addr: self.regs[1],
                            len: self.regs[2],
                        },
                    ],
                });
                exit = Some(QuantumExit::Normal);
                self.pc + 1
            }
            op::SHUTDOWN => {
                ctl.shutdown = Some(self.regs[0] as i32);
                exit = Some(QuantumExit::Normal);
                self.pc + 1
            }
            _ => return self.fault(ctl, "illegal instruction"),
        };
        self.pc = next;
        ctl.executed += 1;
        if ctl.watch_hit.is_some() {
            return Step::Exit(QuantumExit::DebugTrap);
        }
        match exit {
            Some(e) => Step::Exit(e),
            None => Step::Next,
        }
    }

    fn service_interrupts(&mut self, ctl: &ExecControl) {
        let stepping_noirq = ctl
            .singlestep
            .contains(SstepFlags::ENABLE | SstepFlags::NOIRQ);
        if !stepping_noirq && ctl.pending_interrupts().contains(InterruptRequest::HARD) {
            ctl.ack_interrupts(InterruptRequest::HARD);
            self.irqs += 1;
        }
    }
}

impl CpuArch for MicroCpu {
    fn class_name(&self) -> &'static str {
        "micro"
    }

    fn arch_name(&self) -> Option<&'static str> {
        Some("micro")
    }

    fn core_feature(&self) -> Option<CoreFeature> {
        Some(CoreFeature {
            descriptor: &CORE_FEATURE,
            get: get_core_reg,
            set: set_core_reg,
            num_g_regs: CORE_REGS.len(),
        })
    }

    fn register_features(&self, registers: &mut RegisterFile) {
        registers.register_feature(get_sys_reg, set_sys_reg, &SYS_FEATURE, 0);
    }

    fn pc(&self) -> u64 {
        self.pc
    }

    fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    fn reset(&mut self) {
        self.regs = [0; NUM_GPRS];
        self.pc = self.reset_pc;
        self.seg = 0;
        self.irqs = 0;
    }

    fn memory_rw_debug(&mut self, addr: u64, buf: &mut [u8], is_write: bool) -> Result<()> {
        let addr = self.vaddr(addr);
        if is_write {
            self.mem.write(addr, buf)
        } else {
            self.mem.read(addr, buf)
        }
    }

    fn has_work(&self, interrupts: InterruptRequest) -> bool {
        interrupts.contains(InterruptRequest::HARD)
    }

    fn exec(&mut self, ctl: &mut ExecControl) -> QuantumExit {
        if ctl.halted {
            if !self.has_work(ctl.pending_interrupts()) {
                return QuantumExit::Halted;
            }
            ctl.halted = false;
        }
        loop {
            if ctl.exit_requested() || ctl.budget_exhausted() {
                return QuantumExit::Normal;
            }
            self.service_interrupts(ctl);
            if ctl.breakpoints.breakpoint_at(self.pc) {
                return QuantumExit::DebugTrap;
            }
            let before = ctl.executed;
            let step = self.step(ctl, false);
            if ctl.singlestep.contains(SstepFlags::ENABLE) && ctl.executed > before {
                return QuantumExit::DebugTrap;
            }
            if let Step::Exit(e) = step {
                return e;
            }
        }
    }

    fn step_atomic(&mut self, ctl: &mut ExecControl) {
        let _ = self.step(ctl, true);
    }

    fn complete_host_call(&mut self, ret: u64, errno: u64) {
        self.regs[0] = ret;
        self.regs[1] = errno;
    }
}

/// Assembler for the micro instruction set.
#[derive(Clone, Debug, Default)]
pub struct Asm {
    bytes: Vec<u8>,
}

impl Asm {
    pub fn new() -> Asm {
        Default::default()
    }

    /// Offset of the next instruction.
    pub fn pos(&self) -> u16 {
        self.bytes.len() as u16
    }

    fn emit(mut self, bytes: &[u8]) -> Asm {
        self.bytes.extend_from_slice(bytes);
        self
    }

    fn emit_imm(self, head: &[u8], imm: u16) -> Asm {
        let [lo, hi] = imm.to_le_bytes();
        self.emit(head).emit(&[lo, hi])
    }

    pub fn nop(self) -> Asm {
        self.emit(&[op::NOP])
    }

    pub fn hlt(self) -> Asm {
        self.emit(&[op::HLT])
    }

    pub fn inc(self, r: u8) -> Asm {
        self.emit(&[op::INC, r])
    }

    pub fn dec(self, r: u8) -> Asm {
        self.emit(&[op::DEC, r])
    }

    pub fn xinc(self, r: u8) -> Asm {
        self.emit(&[op::XINC, r])
    }

    pub fn stb(self, a: u8, b: u8) -> Asm {
        self.emit(&[op::STB, a, b])
    }

    pub fn ldb(self, a: u8, b: u8) -> Asm {
        self.emit(&[op::LDB, a, b])
    }

    pub fn jmp(self, target: u16) -> Asm {
        self.emit_imm(&[op::JMP], target)
    }

    pub fn movi(self, r: u8, imm: u16) -> Asm {
        self.emit_imm(&[op::MOVI, r], imm)
    }

    pub fn jnz(self, r: u8, target: u16) -> Asm {
        self.emit_imm(&[op::JNZ, r], target)
    }

    pub fn hcall(self) -> Asm {
        self.emit(&[op::HCALL])
    }

    pub fn shutdown(self) -> Asm {
        self.emit(&[op::SHUTDOWN])
    }

    pub fn bytes(self) -> Vec<u8> {
        self.bytes
    }
}
