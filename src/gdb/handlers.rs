// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Command tables and the handlers behind them.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use base::debug;
use base::warn;
use hypervisor::cpu_resume;
use hypervisor::cpu_single_step;
use hypervisor::cpu_synchronize_state;
use hypervisor::insert_breakpoint;
use hypervisor::remove_all_breakpoints;
use hypervisor::remove_breakpoint;
use hypervisor::vm_prepare_start;
use hypervisor::vm_start;
use hypervisor::Error as HypervisorError;
use hypervisor::Machine;
use hypervisor::ReplayMode;
use hypervisor::VmRequest;
use sync::BigLockGuard;
use vcpu::SstepFlags;

use super::cmd::find_cmd;
use super::cmd::parse_hex;
use super::cmd::parse_params;
use super::cmd::read_thread_id;
use super::cmd::CmdParam;
use super::cmd::GdbCmdParseEntry;
use super::cmd::ThreadIdKind;
use super::monitor::handle_query_rcmd;
use super::packet::escape_binary;
use super::packet::hextomem;
use super::packet::memtohex;
use super::packet::MAX_PACKET_LENGTH;
use super::session::runstate_needs_reset;
use super::session::GdbStub;
use super::session::GDB_SIGNAL_INT;
use super::session::GDB_SIGNAL_TRAP;
use super::syscall::handle_file_io;

pub type Guard<'a> = BigLockGuard<'a, Machine>;
pub type Handler = fn(&mut GdbStub, &mut Guard<'_>, &[CmdParam<'_>]);

const fn entry(
    handler: Handler,
    cmd: &'static str,
    cmd_startswith: bool,
    schema: &'static str,
    allow_stop_reply: bool,
) -> GdbCmdParseEntry<Handler> {
    GdbCmdParseEntry {
        handler,
        cmd,
        cmd_startswith,
        schema,
        allow_stop_reply,
    }
}

static GDB_PACKET_TABLE: &[GdbCmdParseEntry<Handler>] = &[
    entry(handle_extended_mode, "!", true, "", false),
    entry(handle_target_halt, "?", true, "", true),
    entry(handle_continue, "c", true, "L0", true),
    entry(handle_cont_with_sig, "C", true, "l0", true),
    entry(handle_detach, "D", true, "?.l0", false),
    entry(handle_kill, "k", true, "", false),
    entry(handle_step, "s", true, "L0", true),
    entry(handle_backward, "b", true, "o0", true),
    entry(handle_file_io, "F", true, "L,L,o0", true),
    entry(handle_read_all_regs, "g", true, "", false),
    entry(handle_write_all_regs, "G", true, "s0", false),
    entry(handle_read_mem, "m", true, "L,L0", false),
    entry(handle_write_mem, "M", true, "L,L:s0", false),
    entry(handle_get_reg, "p", true, "L0", false),
    entry(handle_set_reg, "P", true, "L?s0", false),
    entry(handle_insert_bp, "Z", true, "l?L?L0", false),
    entry(handle_remove_bp, "z", true, "l?L?L0", false),
    entry(handle_set_thread, "H", true, "o.t0", false),
    entry(handle_thread_alive, "T", true, "t0", false),
    entry(handle_v_commands, "v", true, "s0", false),
    entry(handle_gen_query, "q", true, "s0", false),
    entry(handle_gen_set, "Q", true, "s0", false),
];

static GDB_V_COMMANDS_TABLE: &[GdbCmdParseEntry<Handler>] = &[
    entry(handle_v_cont_query, "Cont?", false, "", false),
    entry(handle_v_cont, "Cont", true, "s0", true),
    entry(handle_v_attach, "Attach;", true, "l0", true),
    entry(handle_v_kill, "Kill;", true, "", false),
];

static GDB_GEN_QUERY_SET_COMMON_TABLE: &[GdbCmdParseEntry<Handler>] = &[
    entry(handle_query_qemu_sstepbits, "qemu.sstepbits", false, "", false),
    entry(handle_query_qemu_sstep, "qemu.sstep", false, "", false),
    entry(handle_set_qemu_sstep, "qemu.sstep=", true, "l0", false),
];

static GDB_GEN_QUERY_TABLE: &[GdbCmdParseEntry<Handler>] = &[
    entry(handle_query_curr_tid, "C", false, "", false),
    entry(handle_query_threads, "sThreadInfo", false, "", false),
    entry(handle_query_first_threads, "fThreadInfo", false, "", false),
    entry(handle_query_thread_extra, "ThreadExtraInfo,", true, "t0", false),
    entry(handle_query_rcmd, "Rcmd,", true, "s0", false),
    entry(handle_query_supported, "Supported", true, "s0", false),
    entry(handle_query_xfer_features, "Xfer:features:read:", true, "s:l,l0", false),
    entry(handle_query_attached, "Attached:", true, "", false),
    entry(handle_query_attached, "Attached", false, "", false),
    entry(handle_query_qemu_supported, "qemu.Supported", false, "", false),
    entry(handle_query_qemu_phy_mem_mode, "qemu.PhyMemMode", false, "", false),
];

static GDB_GEN_SET_TABLE: &[GdbCmdParseEntry<Handler>] = &[
    entry(handle_set_qemu_sstep, "qemu.sstep:", true, "l0", false),
    entry(handle_set_qemu_phy_mem_mode, "qemu.PhyMemMode:", true, "l0", false),
];

enum Dispatch {
    Done,
    Unknown,
    BadParams,
}

fn process_string_cmd(
    gdb: &mut GdbStub,
    m: &mut Guard,
    data: &[u8],
    table: &[GdbCmdParseEntry<Handler>],
) -> Dispatch {
    let Some(cmd) = find_cmd(data, table) else {
        return Dispatch::Unknown;
    };
    let params = match parse_params(&data[cmd.cmd.len()..], cmd.schema) {
        Ok(params) => params,
        Err(e) => {
            debug!("gdb: bad parameters for '{}': {}", cmd.cmd, e);
            return Dispatch::BadParams;
        }
    };
    if cmd.allow_stop_reply {
        gdb.allow_stop_reply = true;
    }
    (cmd.handler)(gdb, m, &params);
    Dispatch::Done
}

/// Runs a command table and answers whatever it could not handle.
fn run_cmd_parser(
    gdb: &mut GdbStub,
    m: &mut Guard,
    data: &[u8],
    table: &[GdbCmdParseEntry<Handler>],
) {
    match process_string_cmd(gdb, m, data, table) {
        Dispatch::Done => {}
        // Not supported.
        Dispatch::Unknown => gdb.put_str(""),
        Dispatch::BadParams => gdb.put_str("E22"),
    }
}

impl GdbStub {
    pub(super) fn handle_packet(&mut self, m: &mut Guard, line: &[u8]) {
        debug!("gdb: command='{}'", String::from_utf8_lossy(line));
        if line.is_empty() {
            self.put_str("");
            return;
        }
        run_cmd_parser(self, m, line, GDB_PACKET_TABLE);
    }

    /// Resumes the whole machine unless it can only leave its state through a reset.
    pub(super) fn gdb_continue(&mut self, m: &mut Guard) {
        if !runstate_needs_reset(m.run_state()) {
            debug!("gdb: continue");
            let vm = self.vm.clone();
            vm_start(&vm, m);
        }
    }

    /// Resumes only the CPUs with an action, stepping the ones marked for it.
    fn gdb_continue_partial(&mut self, m: &mut Guard, actions: &BTreeMap<usize, Action>) {
        if runstate_needs_reset(m.run_state()) || actions.is_empty() {
            return;
        }
        let step_requested = actions.values().any(|a| *a == Action::Step);
        let vm = self.vm.clone();
        if !vm_prepare_start(&vm, m, step_requested) {
            return;
        }
        let mut resumed = false;
        for (&index, action) in actions {
            if *action == Action::Step {
                debug!("gdb: step cpu {}", index);
                if let Err(e) = cpu_single_step(&vm, m, index, self.sstep_flags) {
                    warn!("gdb: failed to single step cpu {}: {}", index, e);
                }
            } else {
                debug!("gdb: continue cpu {}", index);
            }
            cpu_resume(&vm, m, index);
            resumed = true;
        }
        if resumed {
            m.clock.enable();
        }
    }

    fn set_cpu_pc(&mut self, m: &mut Guard, pc: u64) {
        let Some(index) = self.c_cpu else {
            return;
        };
        let vm = self.vm.clone();
        cpu_synchronize_state(&vm, m, index);
        if let Some(env) = m.state_mut(index).and_then(|s| s.env_mut()) {
            env.set_pc(pc);
        }
    }

    fn memory_rw_debug(
        &self,
        m: &mut Guard,
        index: usize,
        addr: u64,
        buf: &mut [u8],
        is_write: bool,
    ) -> bool {
        if self.phy_mem_mode {
            let res = if is_write {
                m.memory.write(addr, buf)
            } else {
                m.memory.read(addr, buf)
            };
            return res.is_ok();
        }
        match m.state_mut(index) {
            Some(state) => state.memory_rw_debug(addr, buf, is_write).is_ok(),
            None => false,
        }
    }

    fn stop_reply_for(&self, m: &Machine, index: usize) -> String {
        format!(
            "T{:02x}thread:{};",
            GDB_SIGNAL_TRAP,
            self.thread_id(m, index)
        )
    }
}

/// Maps a protocol signal number onto the guest's. Only the ones the guest cares about survive.
fn gdb_signal_to_target(sig: u64) -> u32 {
    match sig {
        2 => GDB_SIGNAL_INT,
        5 => GDB_SIGNAL_TRAP,
        _ => 0,
    }
}

fn handle_extended_mode(gdb: &mut GdbStub, _m: &mut Guard, _params: &[CmdParam]) {
    gdb.put_str("OK");
}

fn handle_target_halt(gdb: &mut GdbStub, m: &mut Guard, _params: &[CmdParam]) {
    let Some(index) = gdb.c_cpu else {
        gdb.allow_stop_reply = false;
        gdb.put_str("E22");
        return;
    };
    if gdb.allow_stop_reply {
        let reply = gdb.stop_reply_for(m, index);
        gdb.put_str(&reply);
        gdb.allow_stop_reply = false;
    }
    // The client asks this when it connects, so leftovers of an earlier session go away.
    let vm = gdb.vm.clone();
    remove_all_breakpoints(&vm, m, index);
}

fn handle_continue(gdb: &mut GdbStub, m: &mut Guard, params: &[CmdParam]) {
    if let Some(pc) = params.first() {
        gdb.set_cpu_pc(m, pc.as_int());
    }
    gdb.signal = 0;
    gdb.gdb_continue(m);
}

fn handle_cont_with_sig(gdb: &mut GdbStub, m: &mut Guard, params: &[CmdParam]) {
    gdb.signal = params.first().map_or(0, |p| gdb_signal_to_target(p.as_int()));
    gdb.gdb_continue(m);
}

fn handle_step(gdb: &mut GdbStub, m: &mut Guard, params: &[CmdParam]) {
    if let Some(pc) = params.first() {
        gdb.set_cpu_pc(m, pc.as_int());
    }
    if let Some(index) = gdb.c_cpu {
        let vm = gdb.vm.clone();
        if let Err(e) = cpu_single_step(&vm, m, index, gdb.sstep_flags) {
            warn!("gdb: failed to single step cpu {}: {}", index, e);
        }
    }
    gdb.gdb_continue(m);
}

fn handle_backward(gdb: &mut GdbStub, m: &mut Guard, params: &[CmdParam]) {
    if m.replay.mode() != ReplayMode::Play {
        gdb.put_str("E22");
        return;
    }
    let moved = match params.first().map(|p| p.as_opcode()) {
        Some(b's') => m.replay.reverse_step(),
        Some(b'c') => m.replay.reverse_continue(),
        _ => {
            gdb.put_str("");
            return;
        }
    };
    if moved {
        gdb.gdb_continue(m);
    } else {
        gdb.put_str("E14");
    }
}

fn handle_kill(gdb: &mut GdbStub, _m: &mut Guard, _params: &[CmdParam]) {
    base::info!("gdb: terminated by the client");
    gdb.vm.request(VmRequest::Shutdown(0));
}

fn handle_detach(gdb: &mut GdbStub, m: &mut Guard, params: &[CmdParam]) {
    let pid = if gdb.multiprocess {
        match params.first() {
            Some(p) => p.as_int(),
            None => {
                gdb.put_str("E22");
                return;
            }
        }
    } else {
        1
    };
    let Some(process_pid) = gdb.get_process(pid).map(|p| p.pid) else {
        gdb.put_str("E22");
        return;
    };

    let vm = gdb.vm.clone();
    if let Some(first) = gdb.first_cpu_in_process(m, process_pid) {
        remove_all_breakpoints(&vm, m, first);
    }
    if let Some(process) = gdb.get_process_mut(pid) {
        process.attached = false;
    }

    let c_pid = gdb.c_cpu.and_then(|i| m.cpu(i)).map(|cpu| gdb.cpu_pid(&cpu));
    let g_pid = gdb.g_cpu.and_then(|i| m.cpu(i)).map(|cpu| gdb.cpu_pid(&cpu));
    if c_pid == Some(process_pid) {
        gdb.c_cpu = gdb.first_attached_cpu(m);
    }
    if g_pid == Some(process_pid) {
        gdb.g_cpu = gdb.first_attached_cpu(m);
    }

    if gdb.c_cpu.is_none() {
        // No more process attached.
        gdb.disable_syscalls(m);
        gdb.gdb_continue(m);
    }
    gdb.put_str("OK");
}

fn handle_read_all_regs(gdb: &mut GdbStub, m: &mut Guard, _params: &[CmdParam]) {
    let Some(index) = gdb.g_cpu else {
        gdb.put_str("E22");
        return;
    };
    let vm = gdb.vm.clone();
    cpu_synchronize_state(&vm, m, index);
    let mut buf = Vec::new();
    if let Some(state) = m.state_mut(index) {
        for reg in 0..state.registers.num_g_regs() {
            state.read_register(&mut buf, reg);
        }
    }
    gdb.put_str(&memtohex(&buf));
}

fn handle_write_all_regs(gdb: &mut GdbStub, m: &mut Guard, params: &[CmdParam]) {
    let (Some(index), Some(data)) = (gdb.g_cpu, params.first()) else {
        gdb.put_str("E22");
        return;
    };
    let vm = gdb.vm.clone();
    cpu_synchronize_state(&vm, m, index);
    let hex = data.as_str();
    let buf = hextomem(hex, hex.len() / 2);
    if let Some(state) = m.state_mut(index) {
        let mut pos = 0;
        for reg in 0..state.registers.num_g_regs() {
            if pos >= buf.len() {
                break;
            }
            let size = state.write_register(&buf[pos..], reg);
            if size == 0 {
                break;
            }
            pos += size;
        }
    }
    gdb.put_str("OK");
}

fn handle_get_reg(gdb: &mut GdbStub, m: &mut Guard, params: &[CmdParam]) {
    if !gdb.has_xml {
        gdb.put_str("");
        return;
    }
    let (Some(index), Some(reg)) = (gdb.g_cpu, params.first()) else {
        gdb.put_str("E14");
        return;
    };
    let vm = gdb.vm.clone();
    cpu_synchronize_state(&vm, m, index);
    let mut buf = Vec::new();
    let size = m
        .state_mut(index)
        .map_or(0, |s| s.read_register(&mut buf, reg.as_int() as usize));
    if size == 0 {
        gdb.put_str("E14");
        return;
    }
    gdb.put_str(&memtohex(&buf));
}

fn handle_set_reg(gdb: &mut GdbStub, m: &mut Guard, params: &[CmdParam]) {
    if !gdb.has_xml {
        gdb.put_str("");
        return;
    }
    let (Some(index), [reg, data]) = (gdb.g_cpu, params) else {
        gdb.put_str("E22");
        return;
    };
    let hex = data.as_str();
    let buf = hextomem(hex, hex.len() / 2);
    let vm = gdb.vm.clone();
    cpu_synchronize_state(&vm, m, index);
    if let Some(state) = m.state_mut(index) {
        state.write_register(&buf, reg.as_int() as usize);
    }
    gdb.put_str("OK");
}

fn handle_read_mem(gdb: &mut GdbStub, m: &mut Guard, params: &[CmdParam]) {
    let (Some(index), [addr, len]) = (gdb.g_cpu, params) else {
        gdb.put_str("E22");
        return;
    };
    let len = len.as_int();
    // The reply carries two hex digits per byte.
    if len > (MAX_PACKET_LENGTH / 2) as u64 {
        gdb.put_str("E22");
        return;
    }
    let mut buf = vec![0u8; len as usize];
    if !gdb.memory_rw_debug(m, index, addr.as_int(), &mut buf, false) {
        gdb.put_str("E14");
        return;
    }
    gdb.put_str(&memtohex(&buf));
}

fn handle_write_mem(gdb: &mut GdbStub, m: &mut Guard, params: &[CmdParam]) {
    let (Some(index), [addr, len, data]) = (gdb.g_cpu, params) else {
        gdb.put_str("E22");
        return;
    };
    let hex = data.as_str();
    let len = len.as_int();
    if len > (hex.len() / 2) as u64 {
        gdb.put_str("E22");
        return;
    }
    let mut buf = hextomem(hex, len as usize);
    if !gdb.memory_rw_debug(m, index, addr.as_int(), &mut buf, true) {
        gdb.put_str("E14");
        return;
    }
    gdb.put_str("OK");
}

fn breakpoint_reply(res: hypervisor::Result<()>) -> &'static str {
    match res {
        Ok(()) => "OK",
        Err(HypervisorError::CapabilityMissing { .. })
        | Err(HypervisorError::UnsupportedBreakpoint(_)) => "",
        Err(e) => {
            debug!("gdb: breakpoint request failed: {}", e);
            "E22"
        }
    }
}

fn handle_insert_bp(gdb: &mut GdbStub, m: &mut Guard, params: &[CmdParam]) {
    let (Some(index), [ty, addr, len]) = (gdb.g_cpu, params) else {
        gdb.put_str("E22");
        return;
    };
    let vm = gdb.vm.clone();
    let res = insert_breakpoint(&vm, m, index, ty.as_int(), addr.as_int(), len.as_int());
    gdb.put_str(breakpoint_reply(res));
}

fn handle_remove_bp(gdb: &mut GdbStub, m: &mut Guard, params: &[CmdParam]) {
    let (Some(index), [ty, addr, len]) = (gdb.g_cpu, params) else {
        gdb.put_str("E22");
        return;
    };
    let vm = gdb.vm.clone();
    let res = remove_breakpoint(&vm, m, index, ty.as_int(), addr.as_int(), len.as_int());
    gdb.put_str(breakpoint_reply(res));
}

fn handle_set_thread(gdb: &mut GdbStub, m: &mut Guard, params: &[CmdParam]) {
    let [op, thread] = params else {
        gdb.put_str("E22");
        return;
    };
    let thread = thread.as_thread();
    match thread.kind {
        ThreadIdKind::Invalid => {
            gdb.put_str("E22");
            return;
        }
        ThreadIdKind::One => {}
        _ => {
            gdb.put_str("OK");
            return;
        }
    }
    let Some(index) = gdb.get_cpu(m, thread.pid, thread.tid) else {
        gdb.put_str("E22");
        return;
    };
    // Deprecated in favor of vCont, still sent by clients.
    match op.as_opcode() {
        b'c' => {
            gdb.c_cpu = Some(index);
            gdb.put_str("OK");
        }
        b'g' => {
            gdb.g_cpu = Some(index);
            gdb.put_str("OK");
        }
        _ => gdb.put_str("E22"),
    }
}

fn handle_thread_alive(gdb: &mut GdbStub, m: &mut Guard, params: &[CmdParam]) {
    let Some(thread) = params.first().map(|p| p.as_thread()) else {
        gdb.put_str("E22");
        return;
    };
    if thread.kind == ThreadIdKind::Invalid {
        gdb.put_str("E22");
        return;
    }
    match gdb.get_cpu(m, thread.pid, thread.tid) {
        Some(_) => gdb.put_str("OK"),
        None => gdb.put_str("E22"),
    }
}

fn handle_v_commands(gdb: &mut GdbStub, m: &mut Guard, params: &[CmdParam]) {
    let Some(data) = params.first() else {
        gdb.put_str("");
        return;
    };
    run_cmd_parser(gdb, m, data.as_str(), GDB_V_COMMANDS_TABLE);
}

fn handle_v_cont_query(gdb: &mut GdbStub, _m: &mut Guard, _params: &[CmdParam]) {
    gdb.put_str("vCont;c;C;s;S");
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Action {
    Continue,
    Step,
}

#[derive(Debug, PartialEq, Eq)]
enum VContError {
    Invalid,
    NotSupported,
}

impl GdbStub {
    /// Builds the per-CPU action table of a `vCont` packet. The first action a CPU gets wins.
    fn parse_vcont(
        &mut self,
        m: &Machine,
        data: &[u8],
    ) -> Result<BTreeMap<usize, Action>, VContError> {
        let mut actions = BTreeMap::new();
        let mut signal = None;
        let mut pos = 0;
        while pos < data.len() {
            if data[pos] != b';' {
                return Err(VContError::NotSupported);
            }
            pos += 1;
            let Some(&op) = data.get(pos) else {
                return Err(VContError::NotSupported);
            };
            pos += 1;
            let action = match op {
                b'c' => Action::Continue,
                b's' => Action::Step,
                b'C' | b'S' => {
                    let (sig, len) =
                        parse_hex(data.get(pos..).unwrap_or_default()).ok_or(VContError::Invalid)?;
                    pos += len;
                    signal = Some(gdb_signal_to_target(sig));
                    if op == b'C' {
                        Action::Continue
                    } else {
                        Action::Step
                    }
                }
                _ => return Err(VContError::NotSupported),
            };

            let targets: Vec<usize> = match data.get(pos) {
                None | Some(b';') => {
                    // No thread specifier: every attached CPU of every process.
                    let mut cpus = Vec::new();
                    let mut cpu = self.first_attached_cpu(m);
                    while let Some(index) = cpu {
                        cpus.push(index);
                        cpu = self.next_attached_cpu(m, index);
                    }
                    cpus
                }
                Some(b':') => {
                    pos += 1;
                    let (thread, len) = read_thread_id(&data[pos..]);
                    pos += len;
                    match thread.kind {
                        ThreadIdKind::Invalid => return Err(VContError::Invalid),
                        ThreadIdKind::AllProcesses => {
                            let mut cpus = Vec::new();
                            let mut cpu = self.first_attached_cpu(m);
                            while let Some(index) = cpu {
                                cpus.push(index);
                                cpu = self.next_attached_cpu(m, index);
                            }
                            cpus
                        }
                        ThreadIdKind::AllThreads => {
                            let process = self
                                .get_process(thread.pid)
                                .filter(|p| p.attached)
                                .ok_or(VContError::Invalid)?;
                            let mut cpus = Vec::new();
                            let mut cpu = self.first_cpu_in_process(m, process.pid);
                            while let Some(index) = cpu {
                                cpus.push(index);
                                cpu = self.next_cpu_in_process(m, index);
                            }
                            cpus
                        }
                        ThreadIdKind::One => vec![self
                            .get_cpu(m, thread.pid, thread.tid)
                            .ok_or(VContError::Invalid)?],
                    }
                }
                Some(_) => {
                    pos += 1;
                    Vec::new()
                }
            };
            for index in targets {
                actions.entry(index).or_insert(action);
            }
        }
        if let Some(signal) = signal {
            self.signal = signal;
        }
        Ok(actions)
    }
}

fn handle_v_cont(gdb: &mut GdbStub, m: &mut Guard, params: &[CmdParam]) {
    let Some(data) = params.first() else {
        return;
    };
    match gdb.parse_vcont(m, data.as_str()) {
        Ok(actions) => {
            if actions.is_empty() {
                // Nothing resumes, so no stop reply will follow.
                gdb.allow_stop_reply = false;
            }
            gdb.gdb_continue_partial(m, &actions);
        }
        Err(VContError::Invalid) => gdb.put_str("E22"),
        Err(VContError::NotSupported) => gdb.put_str(""),
    }
}

fn handle_v_attach(gdb: &mut GdbStub, m: &mut Guard, params: &[CmdParam]) {
    let pid = params.first().map_or(0, |p| p.as_int());
    let Some(process_pid) = gdb.get_process(pid).map(|p| p.pid) else {
        gdb.put_str("E22");
        return;
    };
    let Some(index) = gdb.first_cpu_in_process(m, process_pid) else {
        gdb.put_str("E22");
        return;
    };
    if let Some(process) = gdb.get_process_mut(pid) {
        process.attached = true;
    }
    gdb.g_cpu = Some(index);
    gdb.c_cpu = Some(index);
    m.debugger_attached = true;

    if gdb.allow_stop_reply {
        let reply = gdb.stop_reply_for(m, index);
        gdb.put_str(&reply);
        gdb.allow_stop_reply = false;
    }
}

fn handle_v_kill(gdb: &mut GdbStub, _m: &mut Guard, _params: &[CmdParam]) {
    gdb.put_str("OK");
    base::info!("gdb: terminated by the client");
    gdb.vm.request(VmRequest::Shutdown(0));
}

fn handle_gen_query(gdb: &mut GdbStub, m: &mut Guard, params: &[CmdParam]) {
    let Some(data) = params.first().map(|p| p.as_str()) else {
        gdb.put_str("");
        return;
    };
    match process_string_cmd(gdb, m, data, GDB_GEN_QUERY_SET_COMMON_TABLE) {
        Dispatch::Done => {}
        Dispatch::BadParams => gdb.put_str("E22"),
        Dispatch::Unknown => run_cmd_parser(gdb, m, data, GDB_GEN_QUERY_TABLE),
    }
}

fn handle_gen_set(gdb: &mut GdbStub, m: &mut Guard, params: &[CmdParam]) {
    let Some(data) = params.first().map(|p| p.as_str()) else {
        gdb.put_str("");
        return;
    };
    match process_string_cmd(gdb, m, data, GDB_GEN_QUERY_SET_COMMON_TABLE) {
        Dispatch::Done => {}
        Dispatch::BadParams => gdb.put_str("E22"),
        Dispatch::Unknown => run_cmd_parser(gdb, m, data, GDB_GEN_SET_TABLE),
    }
}

fn handle_query_qemu_sstepbits(gdb: &mut GdbStub, _m: &mut Guard, _params: &[CmdParam]) {
    let mut reply = format!("ENABLE={:x}", SstepFlags::ENABLE.bits());
    if gdb.supported_sstep_flags.contains(SstepFlags::NOIRQ) {
        let _ = write!(reply, ",NOIRQ={:x}", SstepFlags::NOIRQ.bits());
    }
    if gdb.supported_sstep_flags.contains(SstepFlags::NOTIMER) {
        let _ = write!(reply, ",NOTIMER={:x}", SstepFlags::NOTIMER.bits());
    }
    gdb.put_str(&reply);
}

fn handle_query_qemu_sstep(gdb: &mut GdbStub, _m: &mut Guard, _params: &[CmdParam]) {
    let reply = format!("0x{:x}", gdb.sstep_flags.bits());
    gdb.put_str(&reply);
}

fn handle_set_qemu_sstep(gdb: &mut GdbStub, _m: &mut Guard, params: &[CmdParam]) {
    let Some(value) = params.first().map(|p| p.as_int()) else {
        gdb.put_str("E22");
        return;
    };
    let flags = u32::try_from(value)
        .ok()
        .and_then(SstepFlags::from_bits)
        .filter(|f| gdb.supported_sstep_flags.contains(*f));
    match flags {
        Some(flags) => {
            gdb.sstep_flags = flags;
            gdb.put_str("OK");
        }
        None => gdb.put_str("E22"),
    }
}

fn handle_query_curr_tid(gdb: &mut GdbStub, m: &mut Guard, _params: &[CmdParam]) {
    // The current thread is the first one of the current process, as gdb expects.
    let mut reply = String::from("QC");
    if let Some(cpu) = gdb.g_cpu.and_then(|i| m.cpu(i)) {
        if let Some(first) = gdb.first_cpu_in_process(m, gdb.cpu_pid(&cpu)) {
            reply.push_str(&gdb.thread_id(m, first));
        }
    }
    gdb.put_str(&reply);
}

fn handle_query_threads(gdb: &mut GdbStub, m: &mut Guard, _params: &[CmdParam]) {
    let Some(index) = gdb.query_cpu else {
        gdb.put_str("l");
        return;
    };
    let reply = format!("m{}", gdb.thread_id(m, index));
    gdb.put_str(&reply);
    gdb.query_cpu = gdb.next_attached_cpu(m, index);
}

fn handle_query_first_threads(gdb: &mut GdbStub, m: &mut Guard, params: &[CmdParam]) {
    gdb.query_cpu = gdb.first_attached_cpu(m);
    handle_query_threads(gdb, m, params);
}

fn handle_query_thread_extra(gdb: &mut GdbStub, m: &mut Guard, params: &[CmdParam]) {
    let thread = params.first().map(|p| p.as_thread());
    let index = thread
        .filter(|t| t.kind != ThreadIdKind::Invalid)
        .and_then(|t| gdb.get_cpu(m, t.pid, t.tid));
    let Some(index) = index else {
        gdb.put_str("E22");
        return;
    };
    let vm = gdb.vm.clone();
    cpu_synchronize_state(&vm, m, index);
    let Some(state) = m.state(index) else {
        gdb.put_str("E22");
        return;
    };
    let run = if state.halted { "halted " } else { "running" };
    let text = if gdb.multiprocess && gdb.processes.len() > 1 {
        let class = state.env().map_or("cpu", |env| env.class_name());
        format!("{} cpu{} [{}]", class, index, run)
    } else {
        format!("CPU#{} [{}]", index, run)
    };
    gdb.put_str(&memtohex(text.as_bytes()));
}

fn has_core_feature(m: &Machine, index: usize) -> bool {
    m.state(index)
        .and_then(|s| s.env())
        .is_some_and(|env| env.core_feature().is_some())
}

fn handle_query_supported(gdb: &mut GdbStub, m: &mut Guard, params: &[CmdParam]) {
    let mut reply = format!("PacketSize={:x}", MAX_PACKET_LENGTH);
    if m
        .first_cpu()
        .is_some_and(|cpu| has_core_feature(m, cpu.index()))
    {
        reply.push_str(";qXfer:features:read+");
    }
    if m.replay.mode() == ReplayMode::Play {
        reply.push_str(";ReverseStep+;ReverseContinue+");
    }
    if let Some(features) = params.first() {
        let features = features.as_str();
        if features
            .windows(b"multiprocess+".len())
            .any(|w| w == b"multiprocess+")
        {
            gdb.multiprocess = true;
        }
    }
    reply.push_str(&gdb.extra_features);
    reply.push_str(";vContSupported+;multiprocess+");
    gdb.put_str(&reply);
}

fn handle_query_xfer_features(gdb: &mut GdbStub, m: &mut Guard, params: &[CmdParam]) {
    let [annex, offset, length] = params else {
        gdb.put_str("E22");
        return;
    };
    let Some(index) = gdb.g_cpu else {
        gdb.put_str("E22");
        return;
    };
    if !has_core_feature(m, index) {
        gdb.put_str("");
        return;
    }
    gdb.has_xml = true;

    let annex = annex.as_str();
    let name = annex.split(|b| *b == b':').next().unwrap_or_default();
    let Some(xml) = gdb.get_feature_xml(m, index, name) else {
        gdb.put_str("E00");
        return;
    };
    let total = xml.len() as u64;
    let addr = offset.as_int();
    if addr > total {
        gdb.put_str("E00");
        return;
    }
    let len = length.as_int().min(((MAX_PACKET_LENGTH - 5) / 2) as u64);
    let start = addr as usize;
    // 'm' when more data follows, 'l' for the last chunk.
    let (kind, end) = if len < total - addr {
        (b'm', start + len as usize)
    } else {
        (b'l', xml.len())
    };
    let mut reply = vec![kind];
    reply.extend(escape_binary(&xml.as_bytes()[start..end]));
    gdb.put_packet(&reply);
}

fn handle_query_attached(gdb: &mut GdbStub, _m: &mut Guard, _params: &[CmdParam]) {
    gdb.put_str("1");
}

fn handle_query_qemu_supported(gdb: &mut GdbStub, _m: &mut Guard, _params: &[CmdParam]) {
    gdb.put_str("sstepbits;sstep;PhyMemMode");
}

fn handle_query_qemu_phy_mem_mode(gdb: &mut GdbStub, _m: &mut Guard, _params: &[CmdParam]) {
    let reply = format!("{}", gdb.phy_mem_mode as u8);
    gdb.put_str(&reply);
}

fn handle_set_qemu_phy_mem_mode(gdb: &mut GdbStub, _m: &mut Guard, params: &[CmdParam]) {
    match params.first().map(|p| p.as_int()) {
        Some(0) => gdb.phy_mem_mode = false,
        Some(1) => gdb.phy_mem_mode = true,
        _ => {
            gdb.put_str("E22");
            return;
        }
    }
    gdb.put_str("OK");
}
