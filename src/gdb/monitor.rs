// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt::Write;

use base::debug;
use hypervisor::cpu_synchronize_state;
use hypervisor::RunState;
use hypervisor::Vm;

use super::cmd::CmdParam;
use super::handlers::Guard;
use super::packet::hextomem;
use super::packet::memtohex;
use super::packet::MAX_PACKET_LENGTH;
use super::session::GdbStub;

/// Runs the text commands a client sends with `monitor <cmd>`.
pub trait MonitorHandler: Send {
    /// Executes `cmd` with the big lock held and returns the text to print on the client.
    fn execute(&mut self, vm: &Vm, m: &mut Guard, cmd: &str) -> String;
}

/// The default monitor: a few read-only commands about the machine.
pub struct BuiltinMonitor;

const HELP: &str = "\
help         -- show this text
info cpus    -- list the virtual CPUs
info status  -- show the run state of the machine
";

fn run_state_name(state: RunState) -> String {
    serde_json::to_value(state)
        .ok()
        .and_then(|v| v.as_str().map(str::to_owned))
        .unwrap_or_else(|| format!("{:?}", state))
}

impl BuiltinMonitor {
    fn info_cpus(vm: &Vm, m: &mut Guard) -> String {
        let mut out = String::new();
        for (n, index) in m.cpu_indices().into_iter().enumerate() {
            cpu_synchronize_state(vm, m, index);
            let Some(state) = m.state(index) else {
                continue;
            };
            let pc = state.env().map_or(0, |env| env.pc());
            let _ = write!(
                out,
                "{} CPU #{}: pc={:#018x}",
                if n == 0 { '*' } else { ' ' },
                index,
                pc
            );
            if state.halted {
                out.push_str(" (halted)");
            }
            out.push('\n');
        }
        out
    }

    fn info_status(m: &Guard) -> String {
        match m.run_state() {
            RunState::Running => "VM status: running\n".to_string(),
            RunState::Paused => "VM status: paused\n".to_string(),
            other => format!("VM status: paused ({})\n", run_state_name(other)),
        }
    }
}

impl MonitorHandler for BuiltinMonitor {
    fn execute(&mut self, vm: &Vm, m: &mut Guard, cmd: &str) -> String {
        match cmd.split_whitespace().collect::<Vec<_>>().as_slice() {
            ["help"] => HELP.to_string(),
            ["info", "cpus"] => Self::info_cpus(vm, m),
            ["info", "status"] => Self::info_status(m),
            _ => format!("unknown command: '{}'\n", cmd),
        }
    }
}

pub(super) fn handle_query_rcmd(gdb: &mut GdbStub, m: &mut Guard, params: &[CmdParam]) {
    let Some(hex) = params.first().map(|p| p.as_str()) else {
        gdb.put_str("E22");
        return;
    };
    if hex.len() % 2 != 0 {
        gdb.put_str("E01");
        return;
    }
    let cmd = hextomem(hex, hex.len() / 2);
    let cmd = String::from_utf8_lossy(&cmd);
    debug!("gdb: monitor command '{}'", cmd);

    let vm = gdb.vm.clone();
    let output = gdb.monitor.execute(&vm, m, &cmd);
    // Console output packets are `O` followed by hex, which must fit in one packet.
    for chunk in output.as_bytes().chunks(MAX_PACKET_LENGTH / 2 - 1) {
        gdb.put_str(&format!("O{}", memtohex(chunk)));
    }
    gdb.put_str("OK");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdb::session::tests::request;
    use crate::gdb::session::tests::send;
    use crate::gdb::session::tests::test_stub;

    struct Echo(usize);

    impl MonitorHandler for Echo {
        fn execute(&mut self, _vm: &Vm, _m: &mut Guard, cmd: &str) -> String {
            cmd.repeat(self.0)
        }
    }

    #[test]
    fn long_output_is_split() {
        let (mut stub, out) = test_stub(&[None]);
        stub.set_monitor(Box::new(Echo(MAX_PACKET_LENGTH)));
        send(&mut stub, &format!("qRcmd,{}", memtohex(b"x")));
        let packets = out.packets();
        assert_eq!(packets.len(), 4);
        for p in &packets[..3] {
            assert!(p.starts_with('O'));
            assert!(p.len() < MAX_PACKET_LENGTH);
        }
        let total: usize = packets[..3].iter().map(|p| (p.len() - 1) / 2).sum();
        assert_eq!(total, MAX_PACKET_LENGTH);
        assert_eq!(packets[3], "OK");
    }

    #[test]
    fn empty_output_is_just_ok() {
        let (mut stub, out) = test_stub(&[None]);
        stub.set_monitor(Box::new(Echo(0)));
        assert_eq!(request(&mut stub, &out, &format!("qRcmd,{}", memtohex(b"x"))), "OK");
    }

    #[test]
    fn builtin_commands() {
        let (stub, _) = test_stub(&[None]);
        let vm = stub.vm.clone();
        let mut m = vm.lock();
        let mut monitor = BuiltinMonitor;
        assert!(monitor.execute(&vm, &mut m, "help").contains("info cpus"));
        assert_eq!(
            monitor.execute(&vm, &mut m, "info  status"),
            "VM status: paused (prelaunch)\n"
        );
        m.set_run_state(RunState::Paused);
        assert_eq!(monitor.execute(&vm, &mut m, "info status"), "VM status: paused\n");
        m.state_mut(0).unwrap().halted = true;
        assert_eq!(
            monitor.execute(&vm, &mut m, "info cpus"),
            "* CPU #0: pc=0x0000000000000000 (halted)\n"
        );
        assert_eq!(
            monitor.execute(&vm, &mut m, "info"),
            "unknown command: 'info'\n"
        );
    }
}
