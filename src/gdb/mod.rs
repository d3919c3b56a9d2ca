// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Remote debugging of the guest over the GDB remote serial protocol.
//!
//! The protocol engine ([`GdbStub`]) is driven by two kinds of input: bytes from the client and
//! run state changes of the machine. [`GdbStub::serve`] turns both into one event stream and
//! feeds it to the engine under the big lock, so the engine never races the vCPUs.

pub mod cmd;
mod handlers;
mod monitor;
pub mod packet;
mod session;
mod syscall;
mod xml;

use std::io;
use std::io::Read;
use std::io::Write;
use std::net::TcpListener;
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::sync::mpsc::channel;
use std::sync::mpsc::Sender;
use std::thread;

use base::debug;
use base::error;
use base::info;
use hypervisor::StateChange;
use remain::sorted;
use thiserror::Error as ThisError;

pub use self::monitor::BuiltinMonitor;
pub use self::monitor::MonitorHandler;
pub use self::session::runstate_needs_reset;
pub use self::session::GdbProcess;
pub use self::session::GdbStub;
pub use self::syscall::gdb_errno_to_host;

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("failed to accept a connection from GDB: {0}")]
    Accept(io::Error),
    #[error("failed to listen on port {port}: {err}")]
    Bind { port: u16, err: io::Error },
    #[error("failed to clone the connection: {0}")]
    CloneStream(io::Error),
    #[error("the machine has no CPU to debug")]
    NoCpus,
    #[error("accelerator {0} cannot debug guests")]
    NoGuestDebug(&'static str),
    #[error("failed to spawn {name} thread: {err}")]
    SpawnThread { name: &'static str, err: io::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Input of a debug session.
#[derive(Debug)]
pub enum GdbEvent {
    Bytes(Vec<u8>),
    State(StateChange),
    Disconnected,
}

/// Why [`GdbStub::serve`] returned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client went away. The guest was resumed.
    Disconnected,
    /// The machine shut down with this exit code.
    Exited(i32),
}

/// Where the debugger connects.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Transport {
    Tcp(u16),
    Stdio,
}

/// The two directions of a client connection.
pub struct Connection {
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
}

impl Connection {
    pub fn new(reader: Box<dyn Read + Send>, writer: Box<dyn Write + Send>) -> Connection {
        Connection { reader, writer }
    }

    pub fn from_tcp(stream: TcpStream) -> Result<Connection> {
        // Replies are small and latency bound.
        if let Err(e) = stream.set_nodelay(true) {
            debug!("gdb: failed to set TCP_NODELAY: {}", e);
        }
        let reader = stream.try_clone().map_err(Error::CloneStream)?;
        Ok(Connection::new(Box::new(reader), Box::new(stream)))
    }

    pub fn from_unix(stream: UnixStream) -> Result<Connection> {
        let reader = stream.try_clone().map_err(Error::CloneStream)?;
        Ok(Connection::new(Box::new(reader), Box::new(stream)))
    }

    pub fn stdio() -> Connection {
        Connection::new(Box::new(io::stdin()), Box::new(io::stdout()))
    }
}

fn spawn(name: &'static str, f: impl FnOnce() + Send + 'static) -> Result<()> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map(|_| ())
        .map_err(|err| Error::SpawnThread { name, err })
}

fn read_client(mut reader: Box<dyn Read + Send>, events: Sender<GdbEvent>) {
    let mut buf = [0u8; packet::MAX_PACKET_LENGTH];
    loop {
        let event = match reader.read(&mut buf) {
            Ok(0) => GdbEvent::Disconnected,
            Ok(n) => GdbEvent::Bytes(buf[..n].to_vec()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("gdb: read failed: {}", e);
                GdbEvent::Disconnected
            }
        };
        let last = matches!(event, GdbEvent::Disconnected);
        if events.send(event).is_err() || last {
            return;
        }
    }
}

impl GdbStub {
    /// Runs a session with one client until it disconnects or the machine exits.
    pub fn serve(&mut self, conn: Connection) -> Result<SessionEnd> {
        let (event_tx, event_rx) = channel();

        let (state_tx, state_rx) = channel();
        let state_events = event_tx.clone();
        // Ends with the session: the next notification fails to forward and drops the listener.
        spawn("gdb state", move || {
            for change in state_rx {
                if state_events.send(GdbEvent::State(change)).is_err() {
                    return;
                }
            }
        })?;
        let reader = conn.reader;
        spawn("gdb reader", move || read_client(reader, event_tx))?;

        let vm = self.vm().clone();
        {
            let mut m = vm.lock();
            m.add_state_listener(state_tx);
            self.attach(&mut m, conn.writer);
        }

        for event in event_rx {
            let mut m = vm.lock();
            match event {
                GdbEvent::Bytes(bytes) => {
                    for b in bytes {
                        self.handle_byte(&mut m, b);
                    }
                }
                GdbEvent::State(change) => {
                    if !self.handle_state_change(&mut m, change) {
                        if let StateChange::Exited(code) = change {
                            return Ok(SessionEnd::Exited(code));
                        }
                    }
                }
                GdbEvent::Disconnected => break,
            }
        }
        self.detach(&mut vm.lock());
        Ok(SessionEnd::Disconnected)
    }
}

fn bind(port: u16) -> Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port)).map_err(|err| Error::Bind { port, err })
}

/// Logs the outcome of a session. Returns false once the machine is gone.
fn run_session(stub: &mut GdbStub, conn: Connection) -> bool {
    match stub.serve(conn) {
        Ok(reason) => {
            info!("GDB session closed: {:?}", reason);
            !matches!(reason, SessionEnd::Exited(_))
        }
        Err(e) => {
            error!("error occurred in GDB session: {}", e);
            true
        }
    }
}

/// Serves debugger clients on `transport`, one at a time, until the machine exits. Over TCP a
/// new client may connect after the previous one left.
pub fn gdb_thread(mut stub: GdbStub, transport: Transport) {
    let port = match transport {
        Transport::Stdio => {
            run_session(&mut stub, Connection::stdio());
            return;
        }
        Transport::Tcp(port) => port,
    };
    let listener = match bind(port) {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to create a TCP listener: {}", e);
            return;
        }
    };
    info!("Waiting for a GDB connection on port {}...", port);
    loop {
        let (stream, addr) = match listener.accept().map_err(Error::Accept) {
            Ok(v) => v,
            Err(e) => {
                error!("{}", e);
                return;
            }
        };
        info!("GDB connected from {}", addr);
        let conn = match Connection::from_tcp(stream) {
            Ok(conn) => conn,
            Err(e) => {
                error!("{}", e);
                continue;
            }
        };
        if !run_session(&mut stub, conn) {
            return;
        }
    }
}
