// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host calls forwarded to the debugger (`F` packets).
//!
//! A guest host call stops the machine. The request goes out in place of the stop reply once the
//! stop is observed, so the client never sees a reply to a request that was not sent yet.

use std::fmt::Write;

use base::debug;
use vcpu::HostCallArg;

use super::cmd::CmdParam;
use super::handlers::Guard;
use super::session::GdbStub;
use super::session::GDB_SIGNAL_INT;

const EINTR: u64 = 4;
const EINVAL: u64 = 22;
const GDB_ENAMETOOLONG: u64 = 91;
const ENAMETOOLONG: u64 = 36;

/// Maps an errno of the File-I/O protocol onto the host's.
pub fn gdb_errno_to_host(err: u64) -> u64 {
    match err {
        // Shared by both numberings.
        0 | 1 | 2 | 4 | 9 | 13 | 14 | 16 | 17 | 19 | 20 | 21 | 22 | 23 | 24 | 27 | 28 | 29
        | 30 => err,
        GDB_ENAMETOOLONG => ENAMETOOLONG,
        _ => EINVAL,
    }
}

fn complete_host_call(m: &mut Guard, index: usize, ret: u64, errno: u64) {
    debug!(
        "gdb: host call of cpu {} returned {:#x}, errno {}",
        index, ret, errno
    );
    if let Some(env) = m.state_mut(index).and_then(|s| s.env_mut()) {
        env.complete_host_call(ret, errno);
    }
}

impl GdbStub {
    /// Sends the host call the machine stopped for, if any. Returns true if one was sent.
    pub(super) fn send_pending_syscall(&mut self, m: &mut Guard) -> bool {
        let Some((index, call)) = m.pending_host_call.take() else {
            return false;
        };
        let mut packet = format!("F{}", call.name);
        for arg in &call.args {
            let _ = match arg {
                HostCallArg::Int(val) => write!(packet, ",{:x}", val),
                HostCallArg::Buffer { addr, len } => write!(packet, ",{:x}/{:x}", addr, len),
            };
        }
        self.syscall_cpu = Some(index);
        self.put_str(&packet);
        true
    }

    /// Stops routing host calls to the debugger. A call still in flight fails with `EINTR`.
    pub(super) fn disable_syscalls(&mut self, m: &mut Guard) {
        m.debugger_attached = false;
        let pending = m.pending_host_call.take().map(|(index, _)| index);
        for index in self.syscall_cpu.take().into_iter().chain(pending) {
            complete_host_call(m, index, u64::MAX, EINTR);
        }
    }
}

pub(super) fn handle_file_io(gdb: &mut GdbStub, m: &mut Guard, params: &[CmdParam]) {
    if let Some(ret) = params.first() {
        if let Some(index) = gdb.syscall_cpu.take() {
            let errno = params.get(1).map_or(0, |p| p.as_int());
            complete_host_call(m, index, ret.as_int(), gdb_errno_to_host(errno));
        }
    }
    if params.get(2).map(|p| p.as_opcode()) == Some(b'C') {
        // The client was interrupted during the call, stay stopped.
        gdb.put_str(&format!("T{:02x}", GDB_SIGNAL_INT));
        return;
    }
    gdb.gdb_continue(m);
}

#[cfg(test)]
mod tests {
    use hypervisor::RunState;
    use hypervisor::StateChange;
    use vcpu::micro::MicroCpu;
    use vcpu::HostCall;

    use super::*;
    use crate::gdb::session::tests::request;
    use crate::gdb::session::tests::test_stub;

    #[test]
    fn errno_mapping() {
        assert_eq!(gdb_errno_to_host(0), 0);
        assert_eq!(gdb_errno_to_host(2), 2);
        assert_eq!(gdb_errno_to_host(30), 30);
        assert_eq!(gdb_errno_to_host(91), 36);
        assert_eq!(gdb_errno_to_host(9999), EINVAL);
        assert_eq!(gdb_errno_to_host(5), EINVAL);
    }

    #[test]
    fn request_replaces_the_stop_reply() {
        let (mut stub, out) = test_stub(&[None, None]);
        stub.allow_stop_reply = true;
        let vm = stub.vm.clone();
        {
            let mut m = vm.lock();
            m.pending_host_call = Some((
                1,
                HostCall {
                    name: "open",
                    args: vec![
                        HostCallArg::Buffer { addr: 0x40, len: 9 },
                        HostCallArg::Int(0),
                        HostCallArg::Int(0x1a4),
                    ],
                },
            ));
            m.debug_stop_cpu = Some(1);
            stub.handle_state_change(&mut m, StateChange::Stopped(RunState::Debug));
        }
        assert_eq!(out.packets(), vec!["Fopen,40/9,0,1a4".to_string()]);
        assert_eq!(stub.syscall_cpu, Some(1));
        // The stop reply is still owed.
        assert!(stub.allow_stop_reply);
        assert_eq!(request(&mut stub, &out, "F3,0,C"), "T02");
        let mut m = vm.lock();
        assert_eq!(m.state_mut(1).unwrap().arch::<MicroCpu>().unwrap().reg(0), 3);
    }

    #[test]
    fn disabling_fails_the_call_in_flight() {
        let (mut stub, _) = test_stub(&[None]);
        stub.syscall_cpu = Some(0);
        let vm = stub.vm.clone();
        let mut m = vm.lock();
        stub.disable_syscalls(&mut m);
        assert!(!m.debugger_attached);
        assert_eq!(stub.syscall_cpu, None);
        let cpu = m.state_mut(0).unwrap().arch::<MicroCpu>().unwrap();
        assert_eq!(cpu.reg(0), u64::MAX);
        assert_eq!(cpu.reg(1), EINTR);
    }
}
