// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Command tables and positional parameter parsing.
//!
//! A schema is a sequence of `(type, delimiter)` character pairs. Types: `l` and `L` hex
//! integers, `s` the rest of the packet, `o` a single opcode byte, `t` a thread id and `?` a field
//! that is skipped. Delimiters: `?` any of `,;:=`, `0` end of packet, `.` exactly one byte,
//! anything else that literal byte.

use remain::sorted;
use thiserror::Error as ThisError;

#[sorted]
#[derive(ThisError, Debug, PartialEq, Eq)]
pub enum ParamError {
    #[error("bad hex number at offset {0}")]
    BadHex(usize),
    #[error("unknown schema type {0:#04x}")]
    BadSchema(u8),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThreadIdKind {
    /// `-1` as process id.
    AllProcesses,
    /// `-1` as thread id of a given process.
    AllThreads,
    Invalid,
    One,
}

/// A decoded `[p<pid>.]<tid>` thread id. `pid` is 1 when the client omitted it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ThreadId {
    pub kind: ThreadIdKind,
    pub pid: u64,
    pub tid: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CmdParam<'a> {
    Int(u64),
    Opcode(u8),
    Str(&'a [u8]),
    Thread(ThreadId),
}

impl<'a> CmdParam<'a> {
    pub fn as_int(&self) -> u64 {
        match self {
            CmdParam::Int(v) => *v,
            _ => 0,
        }
    }

    pub fn as_opcode(&self) -> u8 {
        match self {
            CmdParam::Opcode(op) => *op,
            _ => 0,
        }
    }

    pub fn as_str(&self) -> &'a [u8] {
        match self {
            CmdParam::Str(s) => *s,
            _ => &[],
        }
    }

    pub fn as_thread(&self) -> ThreadId {
        match self {
            CmdParam::Thread(t) => *t,
            _ => ThreadId {
                kind: ThreadIdKind::Invalid,
                pid: 0,
                tid: 0,
            },
        }
    }
}

/// One entry of a command table.
pub struct GdbCmdParseEntry<H: 'static> {
    pub handler: H,
    pub cmd: &'static str,
    /// Match `cmd` as a prefix instead of the whole packet.
    pub cmd_startswith: bool,
    pub schema: &'static str,
    /// The command may be answered by an asynchronous stop reply.
    pub allow_stop_reply: bool,
}

/// Finds the first entry matching `data`. Order matters for entries sharing a prefix.
pub fn find_cmd<'t, H>(
    data: &[u8],
    table: &'t [GdbCmdParseEntry<H>],
) -> Option<&'t GdbCmdParseEntry<H>> {
    table.iter().find(|entry| {
        if entry.cmd_startswith {
            data.starts_with(entry.cmd.as_bytes())
        } else {
            data == entry.cmd.as_bytes()
        }
    })
}

/// Parses a hex number the way `strtoul(s, &end, 16)` does: leading blanks, an optional sign and
/// an optional `0x` prefix are accepted and a negative number wraps. Returns the value and the
/// number of bytes consumed.
pub fn parse_hex(data: &[u8]) -> Option<(u64, usize)> {
    let mut pos = data
        .iter()
        .take_while(|b| b.is_ascii_whitespace())
        .count();
    let negative = match data.get(pos) {
        Some(b'-') => {
            pos += 1;
            true
        }
        Some(b'+') => {
            pos += 1;
            false
        }
        _ => false,
    };
    if data.get(pos) == Some(&b'0')
        && matches!(data.get(pos + 1), Some(b'x') | Some(b'X'))
        && data.get(pos + 2).is_some_and(u8::is_ascii_hexdigit)
    {
        pos += 2;
    }
    let digits = data[pos.min(data.len())..]
        .iter()
        .take_while(|b| b.is_ascii_hexdigit())
        .count();
    if digits == 0 {
        return None;
    }
    let mut val: u64 = 0;
    for &b in &data[pos..pos + digits] {
        val = val
            .checked_mul(16)?
            .checked_add(u64::from(super::packet::fromhex(b)))?;
    }
    let val = if negative { val.wrapping_neg() } else { val };
    Some((val, pos + digits))
}

/// Reads `[p<pid>.]<tid>`. Returns the id and the number of bytes consumed, zero when invalid.
pub fn read_thread_id(buf: &[u8]) -> (ThreadId, usize) {
    let invalid = ThreadId {
        kind: ThreadIdKind::Invalid,
        pid: 0,
        tid: 0,
    };
    let mut pos = 0;
    let pid = if buf.first() == Some(&b'p') {
        let Some((pid, len)) = parse_hex(&buf[1..]) else {
            return (invalid, 0);
        };
        // Skip the '.' separating pid and tid.
        pos = 1 + len + 1;
        pid
    } else {
        1
    };
    let Some((tid, len)) = parse_hex(&buf[pos.min(buf.len())..]) else {
        return (invalid, 0);
    };
    pos += len;

    let id = if pid == u64::MAX {
        ThreadId {
            kind: ThreadIdKind::AllProcesses,
            pid: 0,
            tid: 0,
        }
    } else if tid == u64::MAX {
        ThreadId {
            kind: ThreadIdKind::AllThreads,
            pid,
            tid: 0,
        }
    } else {
        ThreadId {
            kind: ThreadIdKind::One,
            pid,
            tid,
        }
    };
    (id, pos)
}

fn next_param(data: &[u8], pos: usize, delimiter: u8) -> usize {
    let rest = data.get(pos..).unwrap_or_default();
    let found = match delimiter {
        b'0' => return data.len(),
        b'.' => return (pos + 1).min(data.len()),
        b'?' => rest.iter().position(|b| b",;:=".contains(b)),
        d => rest.iter().position(|b| *b == d),
    };
    match found {
        Some(i) => pos + i + 1,
        None => data.len(),
    }
}

/// Splits `data` into parameters according to `schema`. Parsing stops early when the packet runs
/// out, so the result may hold fewer parameters than the schema names.
pub fn parse_params<'a>(data: &'a [u8], schema: &str) -> Result<Vec<CmdParam<'a>>, ParamError> {
    let mut params = Vec::new();
    let mut pos = 0;
    for pair in schema.as_bytes().chunks_exact(2) {
        if pos >= data.len() {
            break;
        }
        let (ty, delimiter) = (pair[0], pair[1]);
        match ty {
            b'l' | b'L' => {
                let (val, len) = parse_hex(&data[pos..]).ok_or(ParamError::BadHex(pos))?;
                params.push(CmdParam::Int(val));
                pos += len;
            }
            b's' => params.push(CmdParam::Str(&data[pos..])),
            b'o' => params.push(CmdParam::Opcode(data[pos])),
            b't' => {
                let (id, len) = read_thread_id(&data[pos..]);
                params.push(CmdParam::Thread(id));
                pos += len;
            }
            b'?' => {}
            _ => return Err(ParamError::BadSchema(ty)),
        }
        pos = next_param(data, pos, delimiter);
    }
    Ok(params)
}
