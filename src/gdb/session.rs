// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! State of one debugger connection and the byte and run-state entry points that drive it.
//!
//! Lifecycle: [`GdbStub::new`] once per machine, [`GdbStub::attach`] for every client that
//! connects (resetting whatever the previous client left behind), [`GdbStub::detach`] when it goes
//! away. All entry points run with the big lock held.

use std::fmt::Write as _;
use std::io::Write;
use std::sync::Arc;

use base::debug;
use base::info;
use base::trace;
use base::warn;
use hypervisor::cpu_single_step;
use hypervisor::remove_all_breakpoints;
use hypervisor::supports_guest_debug;
use hypervisor::vm_stop;
use hypervisor::Machine;
use hypervisor::RunState;
use hypervisor::StateChange;
use hypervisor::Vm;
use sync::BigLockGuard;
use vcpu::Cpu;
use vcpu::SstepFlags;

use super::monitor::BuiltinMonitor;
use super::monitor::MonitorHandler;
use super::packet::frame;
use super::packet::Frame;
use super::packet::PacketParser;
use super::Error;
use super::Result;

pub const GDB_SIGNAL_INT: u32 = 2;
pub const GDB_SIGNAL_QUIT: u32 = 3;
pub const GDB_SIGNAL_TRAP: u32 = 5;
pub const GDB_SIGNAL_ABRT: u32 = 6;
pub const GDB_SIGNAL_ALRM: u32 = 14;
pub const GDB_SIGNAL_IO: u32 = 23;
pub const GDB_SIGNAL_XCPU: u32 = 24;
pub const GDB_SIGNAL_UNKNOWN: u32 = 143;

/// Out-of-band interrupt sent by the client while the guest runs.
const CTRL_C: u8 = 0x03;

/// A debugger process: the CPUs of one cluster, or every CPU outside a cluster.
pub struct GdbProcess {
    pub pid: u32,
    pub attached: bool,
    /// `target.xml`, built on first request.
    pub target_xml: Option<String>,
}

impl GdbProcess {
    fn new(pid: u32) -> Self {
        GdbProcess {
            pid,
            attached: false,
            target_xml: None,
        }
    }
}

/// The state a machine reaches only through a reset.
pub fn runstate_needs_reset(state: RunState) -> bool {
    matches!(state, RunState::InternalError | RunState::Shutdown)
}

fn stop_signal(state: RunState) -> u32 {
    match state {
        RunState::Debug => GDB_SIGNAL_TRAP,
        RunState::Paused => GDB_SIGNAL_INT,
        RunState::Shutdown => GDB_SIGNAL_QUIT,
        RunState::IoError => GDB_SIGNAL_IO,
        RunState::Watchdog => GDB_SIGNAL_ALRM,
        RunState::InternalError => GDB_SIGNAL_ABRT,
        RunState::FinishMigrate => GDB_SIGNAL_XCPU,
        _ => GDB_SIGNAL_UNKNOWN,
    }
}

pub struct GdbStub {
    pub(super) vm: Arc<Vm>,
    /// `None` while no client is connected.
    out: Option<Box<dyn Write + Send>>,
    parser: PacketParser,
    last_packet: Vec<u8>,
    pub(super) processes: Vec<GdbProcess>,
    /// CPU for execution control.
    pub(super) c_cpu: Option<usize>,
    /// CPU for register and memory access.
    pub(super) g_cpu: Option<usize>,
    /// Cursor of `qfThreadInfo`/`qsThreadInfo`.
    pub(super) query_cpu: Option<usize>,
    pub(super) multiprocess: bool,
    pub(super) supported_sstep_flags: SstepFlags,
    pub(super) sstep_flags: SstepFlags,
    /// Single use permission to send an unsolicited stop reply.
    pub(super) allow_stop_reply: bool,
    pub(super) signal: u32,
    pub(super) has_xml: bool,
    pub(super) phy_mem_mode: bool,
    /// CPU whose host call was forwarded and awaits an `F` reply.
    pub(super) syscall_cpu: Option<usize>,
    pub(super) extra_features: String,
    pub(super) monitor: Box<dyn MonitorHandler>,
}

impl GdbStub {
    /// Prepares debugging of `vm`.
    ///
    /// Fails if the machine has no CPU or its accelerator cannot debug guests.
    pub fn new(vm: Arc<Vm>) -> Result<GdbStub> {
        if vm.lock().num_cpus() == 0 {
            return Err(Error::NoCpus);
        }
        if !supports_guest_debug(&vm) {
            return Err(Error::NoGuestDebug(vm.accel().name()));
        }
        let supported_sstep_flags = vm.accel().supported_sstep_flags();
        let sstep_flags =
            (SstepFlags::ENABLE | SstepFlags::NOIRQ | SstepFlags::NOTIMER) & supported_sstep_flags;
        Ok(GdbStub {
            vm,
            out: None,
            parser: PacketParser::new(),
            last_packet: Vec::new(),
            processes: Vec::new(),
            c_cpu: None,
            g_cpu: None,
            query_cpu: None,
            multiprocess: false,
            supported_sstep_flags,
            sstep_flags,
            allow_stop_reply: false,
            signal: 0,
            has_xml: false,
            phy_mem_mode: false,
            syscall_cpu: None,
            extra_features: String::new(),
            monitor: Box::new(BuiltinMonitor),
        })
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    /// Replaces the handler of `qRcmd` monitor commands.
    pub fn set_monitor(&mut self, monitor: Box<dyn MonitorHandler>) {
        self.monitor = monitor;
    }

    /// Adds `features` (`;`-separated, e.g. `foo+;bar+`) to the `qSupported` reply.
    pub fn extend_qsupported_features(&mut self, features: &str) {
        for feature in features.split(';').filter(|f| !f.is_empty()) {
            self.extra_features.push(';');
            self.extra_features.push_str(feature);
        }
    }

    pub fn is_active(&self) -> bool {
        self.out.is_some()
    }

    pub fn multiprocess(&self) -> bool {
        self.multiprocess
    }

    pub fn sstep_flags(&self) -> SstepFlags {
        self.sstep_flags
    }

    /// Starts a session for a newly connected client writing to `out`.
    ///
    /// The first process is attached, the machine is paused and every leftover of an earlier
    /// session is reset.
    pub fn attach(&mut self, m: &mut BigLockGuard<Machine>, out: Box<dyn Write + Send>) {
        self.allow_stop_reply = false;
        self.multiprocess = false;
        self.syscall_cpu = None;
        self.query_cpu = None;
        self.parser.reset();
        self.last_packet.clear();
        self.create_processes(m);
        self.out = Some(out);

        for (i, process) in self.processes.iter_mut().enumerate() {
            process.attached = i == 0;
        }
        self.c_cpu = self.first_attached_cpu(m);
        self.g_cpu = self.c_cpu;
        let vm = self.vm.clone();
        vm_stop(&vm, m, RunState::Paused);
        self.has_xml = false;
        m.debugger_attached = true;
        info!("gdb: client attached, {} process(es)", self.processes.len());
    }

    /// Ends the session after the client went away and lets the guest run again.
    pub fn detach(&mut self, m: &mut BigLockGuard<Machine>) {
        if self.out.take().is_none() {
            return;
        }
        self.disable_syscalls(m);
        let vm = self.vm.clone();
        if let Some(first) = m.first_cpu() {
            remove_all_breakpoints(&vm, m, first.index());
        }
        for index in m.cpu_indices() {
            if let Err(e) = cpu_single_step(&vm, m, index, SstepFlags::empty()) {
                warn!("gdb: failed to clear single step of cpu {}: {}", index, e);
            }
        }
        for process in self.processes.iter_mut() {
            process.attached = false;
        }
        self.c_cpu = None;
        self.g_cpu = None;
        info!("gdb: client detached");
        // Resume the VM when GDB session is disconnected.
        self.gdb_continue(m);
    }

    fn create_processes(&mut self, m: &Machine) {
        let mut clusters: Vec<u32> = m.cpus().iter().filter_map(|cpu| cpu.cluster()).collect();
        clusters.sort_unstable();
        clusters.dedup();
        self.processes = clusters.iter().map(|c| GdbProcess::new(c + 1)).collect();
        let max_pid = self.processes.iter().map(|p| p.pid).max().unwrap_or(0);
        self.processes.push(GdbProcess::new(max_pid + 1));
    }

    /// Handles one byte from the client.
    pub fn handle_byte(&mut self, m: &mut BigLockGuard<Machine>, ch: u8) {
        if self.out.is_none() {
            return;
        }
        if !self.last_packet.is_empty() {
            // Waiting for the acknowledgement of the last reply.
            match ch {
                b'-' => {
                    debug!("gdb: got NAK, retransmitting");
                    let packet = std::mem::take(&mut self.last_packet);
                    self.put_buffer(&packet);
                    self.last_packet = packet;
                }
                b'+' => trace!("gdb: got ACK"),
                _ => debug!("gdb: got {:#04x} when expecting ACK/NAK", ch),
            }
            if ch == b'+' || ch == b'$' {
                self.last_packet.clear();
            }
            if ch != b'$' {
                return;
            }
        }

        if m.is_running() {
            if ch == CTRL_C {
                self.allow_stop_reply = true;
                let vm = self.vm.clone();
                vm_stop(&vm, m, RunState::Paused);
            } else {
                warn!("gdb: unexpected byte {:#04x} while the guest runs", ch);
            }
            return;
        }

        match self.parser.feed(ch) {
            None => {}
            Some(Frame::BadChecksum) => self.put_buffer(b"-"),
            Some(Frame::Packet(line)) => {
                self.put_buffer(b"+");
                self.handle_packet(m, &line);
            }
        }
    }

    /// Reacts to a run state change of the machine. Returns false once the machine exited.
    pub fn handle_state_change(
        &mut self,
        m: &mut BigLockGuard<Machine>,
        change: StateChange,
    ) -> bool {
        let state = match change {
            StateChange::Running => return true,
            StateChange::Exited(code) => {
                self.gdb_exit(code);
                return false;
            }
            StateChange::Stopped(state) => state,
        };
        if self.out.is_none() {
            return true;
        }
        if let Some(index) = m.debug_stop_cpu.take() {
            self.set_stop_cpu(m, index);
        }
        if self.send_pending_syscall(m) {
            return true;
        }
        let Some(cpu) = self.c_cpu.and_then(|index| m.cpu(index)) else {
            // No process attached.
            return true;
        };
        if !self.allow_stop_reply {
            return true;
        }

        let index = cpu.index();
        let mut tid = String::new();
        self.append_thread_id(&cpu, &mut tid);
        let reply = match state {
            RunState::SaveVm | RunState::RestoreVm => return true,
            RunState::Debug => match m.state_mut(index).and_then(|s| s.watchpoint_hit.take()) {
                Some(hit) => format!(
                    "T{:02x}thread:{};{}watch:{:x};",
                    GDB_SIGNAL_TRAP,
                    tid,
                    hit.kind_prefix(),
                    hit.addr
                ),
                None => {
                    debug!("gdb: cpu {} hit a breakpoint", index);
                    self.set_stop_cpu(m, index);
                    format!("T{:02x}thread:{};", GDB_SIGNAL_TRAP, tid)
                }
            },
            other => {
                self.set_stop_cpu(m, index);
                format!("T{:02x}thread:{};", stop_signal(other), tid)
            }
        };
        self.put_str(&reply);
        self.allow_stop_reply = false;

        let vm = self.vm.clone();
        if let Err(e) = cpu_single_step(&vm, m, index, SstepFlags::empty()) {
            warn!("gdb: failed to clear single step of cpu {}: {}", index, e);
        }
        true
    }

    fn gdb_exit(&mut self, code: i32) {
        if self.out.is_none() {
            return;
        }
        info!("gdb: machine exited with code {}", code);
        self.put_str(&format!("W{:02x}", code as u8));
        self.out = None;
    }

    pub(super) fn put_buffer(&mut self, buf: &[u8]) {
        if let Some(out) = self.out.as_mut() {
            if let Err(e) = out.write_all(buf).and_then(|()| out.flush()) {
                warn!("gdb: failed to write to the client: {}", e);
            }
        }
    }

    pub(super) fn put_packet(&mut self, payload: &[u8]) {
        trace!("gdb: reply='{}'", String::from_utf8_lossy(payload));
        let packet = frame(payload);
        self.put_buffer(&packet);
        self.last_packet = packet;
    }

    pub(super) fn put_str(&mut self, s: &str) {
        self.put_packet(s.as_bytes());
    }

    /// Makes `index` the CPU the next stop reply reports, unless its process is detached.
    pub(super) fn set_stop_cpu(&mut self, m: &Machine, index: usize) {
        let Some(cpu) = m.cpu(index) else {
            return;
        };
        if !self.cpu_attached(&cpu) {
            // A stop CPU outside an attached process confuses the client.
            return;
        }
        self.c_cpu = Some(index);
        self.g_cpu = Some(index);
    }

    pub(super) fn cpu_pid(&self, cpu: &Cpu) -> u32 {
        match cpu.cluster() {
            Some(cluster) => cluster + 1,
            None => self.processes.last().map_or(1, |p| p.pid),
        }
    }

    /// Process `pid`, where 0 stands for the first process.
    pub(super) fn get_process(&self, pid: u64) -> Option<&GdbProcess> {
        if pid == 0 {
            return self.processes.first();
        }
        self.processes.iter().find(|p| u64::from(p.pid) == pid)
    }

    pub(super) fn get_process_mut(&mut self, pid: u64) -> Option<&mut GdbProcess> {
        if pid == 0 {
            return self.processes.first_mut();
        }
        self.processes.iter_mut().find(|p| u64::from(p.pid) == pid)
    }

    pub(super) fn cpu_attached(&self, cpu: &Cpu) -> bool {
        self.get_process(self.cpu_pid(cpu).into())
            .is_some_and(|p| p.attached)
    }

    pub(super) fn first_cpu_in_process(&self, m: &Machine, pid: u32) -> Option<usize> {
        m.cpus()
            .iter()
            .find(|cpu| self.cpu_pid(cpu) == pid)
            .map(|cpu| cpu.index())
    }

    pub(super) fn next_cpu_in_process(&self, m: &Machine, index: usize) -> Option<usize> {
        let cpus = m.cpus();
        let pid = self.cpu_pid(cpus.iter().find(|cpu| cpu.index() == index)?);
        cpus.iter()
            .skip_while(|cpu| cpu.index() != index)
            .skip(1)
            .find(|cpu| self.cpu_pid(cpu) == pid)
            .map(|cpu| cpu.index())
    }

    pub(super) fn first_attached_cpu(&self, m: &Machine) -> Option<usize> {
        m.cpus()
            .iter()
            .find(|cpu| self.cpu_attached(cpu))
            .map(|cpu| cpu.index())
    }

    pub(super) fn next_attached_cpu(&self, m: &Machine, index: usize) -> Option<usize> {
        m.cpus()
            .iter()
            .skip_while(|cpu| cpu.index() != index)
            .skip(1)
            .find(|cpu| self.cpu_attached(cpu))
            .map(|cpu| cpu.index())
    }

    /// Resolves a thread id from the wire. `pid` 0 means any process and `tid` 0 any thread.
    pub(super) fn get_cpu(&self, m: &Machine, pid: u64, tid: u64) -> Option<usize> {
        if pid == 0 && tid == 0 {
            return self.first_attached_cpu(m);
        }
        if tid == 0 {
            let process = self.get_process(pid)?;
            if !process.attached {
                return None;
            }
            return self.first_cpu_in_process(m, process.pid);
        }
        let cpu = m
            .cpus()
            .into_iter()
            .find(|cpu| cpu.index() as u64 + 1 == tid)?;
        let process = self.get_process(self.cpu_pid(&cpu).into())?;
        if pid != 0 && u64::from(process.pid) != pid {
            return None;
        }
        if !process.attached {
            return None;
        }
        Some(cpu.index())
    }

    pub(super) fn append_thread_id(&self, cpu: &Cpu, buf: &mut String) {
        let tid = cpu.index() + 1;
        if self.multiprocess {
            let _ = write!(buf, "p{:02x}.{:02x}", self.cpu_pid(cpu), tid);
        } else {
            let _ = write!(buf, "{:02x}", tid);
        }
    }

    pub(super) fn thread_id(&self, m: &Machine, index: usize) -> String {
        let mut buf = String::new();
        if let Some(cpu) = m.cpu(index) {
            self.append_thread_id(&cpu, &mut buf);
        }
        buf
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use hypervisor::tcg::TcgAccel;
    use hypervisor::tcg::TcgConfig;
    use hypervisor::VirtualClock;
    use vcpu::micro::MicroCpu;
    use vcpu::CpuState;
    use vcpu::GuestMemory;

    use super::*;
    use crate::gdb::packet::checksum;

    /// Client side of an in-memory connection.
    #[derive(Clone, Default)]
    pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        pub fn take(&self) -> Vec<u8> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }

        /// Payloads of the packets written so far. Acknowledgements are skipped.
        pub fn packets(&self) -> Vec<String> {
            let raw = self.take();
            let mut packets = Vec::new();
            let mut rest = raw.as_slice();
            while let Some(start) = rest.iter().position(|b| *b == b'$') {
                let end = start + rest[start..].iter().position(|b| *b == b'#').unwrap();
                let payload = &rest[start + 1..end];
                let csum = u8::from_str_radix(
                    std::str::from_utf8(&rest[end + 1..end + 3]).unwrap(),
                    16,
                )
                .unwrap();
                assert_eq!(csum, checksum(payload));
                packets.push(String::from_utf8_lossy(payload).into_owned());
                rest = &rest[end + 3..];
            }
            packets
        }
    }

    /// A machine with one micro CPU per entry of `clusters` and 64 KiB of RAM.
    pub fn test_machine(clusters: &[Option<u32>]) -> Machine {
        let mem = GuestMemory::new(0, 0x10000);
        let mut m = Machine::new(mem.clone(), VirtualClock::new(Default::default(), None));
        for (i, cluster) in clusters.iter().enumerate() {
            let mut state = CpuState::new(Box::new(MicroCpu::new(mem.clone())));
            state.init_registers();
            m.add_cpu(Cpu::new(i, *cluster), state);
        }
        m
    }

    /// A stub with an attached client on a machine whose CPUs have no threads.
    pub fn test_stub(clusters: &[Option<u32>]) -> (GdbStub, SharedBuf) {
        let vm = Vm::new(
            test_machine(clusters),
            Box::new(TcgAccel::new(TcgConfig::default())),
        );
        let mut stub = GdbStub::new(vm.clone()).unwrap();
        let out = SharedBuf::default();
        stub.attach(&mut vm.lock(), Box::new(out.clone()));
        (stub, out)
    }

    /// Stands in for the vCPU threads acknowledging a stop, so the machine can be paused again.
    pub fn park_cpus(vm: &Vm) {
        let mut m = vm.lock();
        for slot in m.slots_mut() {
            slot.state.stopped = true;
        }
    }

    /// Sends `payload` as a packet, acknowledges the previous reply first.
    pub fn send(stub: &mut GdbStub, payload: &str) {
        let vm = stub.vm.clone();
        let mut m = vm.lock();
        stub.handle_byte(&mut m, b'+');
        for b in frame(payload.as_bytes()) {
            stub.handle_byte(&mut m, b);
        }
    }

    /// Sends `payload` and returns the single reply.
    pub fn request(stub: &mut GdbStub, out: &SharedBuf, payload: &str) -> String {
        send(stub, payload);
        let mut packets = out.packets();
        assert_eq!(packets.len(), 1, "replies to {}: {:?}", payload, packets);
        packets.remove(0)
    }

    #[test]
    fn refuses_machine_without_cpus() {
        let vm = Vm::new(
            test_machine(&[]),
            Box::new(TcgAccel::new(TcgConfig::default())),
        );
        assert!(matches!(GdbStub::new(vm), Err(Error::NoCpus)));
    }

    #[test]
    fn processes_follow_clusters() {
        let (stub, _) = test_stub(&[Some(0), Some(0), Some(1), None]);
        let pids: Vec<u32> = stub.processes.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![1, 2, 3]);
        assert!(stub.processes[0].attached);
        assert!(!stub.processes[1].attached);

        let m = stub.vm.lock();
        assert_eq!(stub.cpu_pid(&m.cpu(3).unwrap()), 3);
        assert_eq!(stub.c_cpu, Some(0));
        assert_eq!(stub.next_cpu_in_process(&m, 0), Some(1));
        assert_eq!(stub.next_cpu_in_process(&m, 1), None);
        assert_eq!(stub.next_attached_cpu(&m, 1), None);
        // CPU 3 (tid 4) belongs to the detached default process.
        assert_eq!(stub.get_cpu(&m, 0, 4), None);
        assert_eq!(stub.get_cpu(&m, 1, 2), Some(1));
        assert_eq!(stub.get_cpu(&m, 2, 2), None);
        assert_eq!(stub.get_cpu(&m, 1, 0), Some(0));
    }

    #[test]
    fn nak_retransmits_last_reply() {
        let (mut stub, out) = test_stub(&[None]);
        assert_eq!(request(&mut stub, &out, "!"), "OK");
        let vm = stub.vm.clone();
        stub.handle_byte(&mut vm.lock(), b'-');
        assert_eq!(out.take(), b"$OK#9a".to_vec());
        stub.handle_byte(&mut vm.lock(), b'+');
        stub.handle_byte(&mut vm.lock(), b'-');
        // Acknowledged, nothing left to retransmit.
        assert!(out.take().is_empty());
    }

    #[test]
    fn bad_checksum_is_nacked() {
        let (mut stub, out) = test_stub(&[None]);
        let vm = stub.vm.clone();
        for b in b"$g#00" {
            stub.handle_byte(&mut vm.lock(), *b);
        }
        assert_eq!(out.take(), b"-".to_vec());
    }

    #[test]
    fn stop_reply_is_single_use() {
        let (mut stub, out) = test_stub(&[None, None]);
        let vm = stub.vm.clone();
        stub.allow_stop_reply = true;
        {
            let mut m = vm.lock();
            m.debug_stop_cpu = Some(1);
            assert!(stub.handle_state_change(&mut m, StateChange::Stopped(RunState::Debug)));
            assert!(stub.handle_state_change(&mut m, StateChange::Stopped(RunState::Paused)));
        }
        assert_eq!(out.packets(), vec!["T05thread:02;".to_string()]);
        assert_eq!(stub.c_cpu, Some(1));
        assert_eq!(stub.g_cpu, Some(1));
    }

    #[test]
    fn stop_signals() {
        let (mut stub, out) = test_stub(&[None]);
        let vm = stub.vm.clone();
        for (state, reply) in [
            (RunState::Paused, Some("T02thread:01;")),
            (RunState::Shutdown, Some("T03thread:01;")),
            (RunState::IoError, Some("T17thread:01;")),
            (RunState::SaveVm, None),
            (RunState::Prelaunch, Some("T8fthread:01;")),
        ] {
            stub.allow_stop_reply = true;
            stub.handle_state_change(&mut vm.lock(), StateChange::Stopped(state));
            assert_eq!(out.packets(), reply.into_iter().map(String::from).collect::<Vec<_>>());
        }
    }

    #[test]
    fn watchpoint_stop_reply() {
        let (mut stub, out) = test_stub(&[None]);
        let vm = stub.vm.clone();
        stub.allow_stop_reply = true;
        {
            let mut m = vm.lock();
            m.state_mut(0).unwrap().watchpoint_hit = Some(vcpu::WatchHit {
                addr: 0x1234,
                flags: vcpu::BpFlags::MEM_READ,
            });
            stub.handle_state_change(&mut m, StateChange::Stopped(RunState::Debug));
            assert!(m.state(0).unwrap().watchpoint_hit.is_none());
        }
        assert_eq!(out.packets(), vec!["T05thread:01;rwatch:1234;".to_string()]);
    }

    #[test]
    fn exit_ends_the_session() {
        let (mut stub, out) = test_stub(&[None]);
        let vm = stub.vm.clone();
        assert!(!stub.handle_state_change(&mut vm.lock(), StateChange::Exited(3)));
        assert_eq!(out.packets(), vec!["W03".to_string()]);
        assert!(!stub.is_active());
    }

    #[test]
    fn reattach_resets_the_session() {
        let (mut stub, out) = test_stub(&[None]);
        assert!(request(&mut stub, &out, "qSupported:multiprocess+").contains("multiprocess+"));
        assert!(stub.multiprocess());
        let vm = stub.vm.clone();
        stub.detach(&mut vm.lock());
        assert!(!stub.is_active());
        assert!(!vm.lock().debugger_attached);
        assert!(vm.lock().is_running());

        park_cpus(&vm);
        stub.attach(&mut vm.lock(), Box::new(out.clone()));
        assert!(!stub.multiprocess());
        assert_eq!(stub.c_cpu, Some(0));
        assert!(vm.lock().debugger_attached);
    }
}
