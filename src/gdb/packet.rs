// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Framing of the remote serial protocol: `$<payload>#<checksum>` with `}` escapes and `*`
//! run-length encoding.

use std::fmt::Write;

use base::debug;
use base::warn;

/// Size of the receive line buffer and the largest packet advertised to the client.
pub const MAX_PACKET_LENGTH: usize = 4096;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum RxState {
    Idle,
    GetLine,
    GetLineEsc,
    GetLineRle,
    Checksum1,
    Checksum2,
}

/// Result of feeding a byte that completed a packet.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// A packet whose checksum matched. The payload is unescaped and expanded.
    Packet(Vec<u8>),
    /// The checksum did not match and the packet was dropped.
    BadChecksum,
}

/// Incoming packet state machine. Fed one byte at a time.
pub struct PacketParser {
    state: RxState,
    line: Vec<u8>,
    sum: u8,
    csum: u8,
}

impl Default for PacketParser {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketParser {
    pub fn new() -> Self {
        PacketParser {
            state: RxState::Idle,
            line: Vec::with_capacity(MAX_PACKET_LENGTH),
            sum: 0,
            csum: 0,
        }
    }

    /// Drops any partially received packet.
    pub fn reset(&mut self) {
        self.state = RxState::Idle;
        self.line.clear();
    }

    pub fn is_idle(&self) -> bool {
        self.state == RxState::Idle
    }

    fn full(&self) -> bool {
        self.line.len() >= MAX_PACKET_LENGTH - 1
    }

    pub fn feed(&mut self, ch: u8) -> Option<Frame> {
        match self.state {
            RxState::Idle => match ch {
                b'$' => {
                    self.line.clear();
                    self.sum = 0;
                    self.state = RxState::GetLine;
                }
                // Late acknowledgement.
                b'+' => {}
                _ => debug!("gdb: garbage byte {:#04x} outside a packet", ch),
            },
            RxState::GetLine => match ch {
                b'}' => {
                    self.state = RxState::GetLineEsc;
                    self.sum = self.sum.wrapping_add(ch);
                }
                b'*' => {
                    self.state = RxState::GetLineRle;
                    self.sum = self.sum.wrapping_add(ch);
                }
                b'#' => self.state = RxState::Checksum1,
                _ if self.full() => {
                    warn!("gdb: packet overrun, dropped");
                    self.state = RxState::Idle;
                }
                _ => {
                    self.line.push(ch);
                    self.sum = self.sum.wrapping_add(ch);
                }
            },
            RxState::GetLineEsc => {
                if ch == b'#' {
                    debug!("gdb: escape character at the end of a packet");
                    self.state = RxState::Checksum1;
                } else if self.full() {
                    warn!("gdb: packet overrun, dropped");
                    self.state = RxState::Idle;
                } else {
                    self.line.push(ch ^ 0x20);
                    self.sum = self.sum.wrapping_add(ch);
                    self.state = RxState::GetLine;
                }
            }
            RxState::GetLineRle => {
                // Counts that would decode to `#` or `$`, or that are not printable, are invalid.
                if ch < b' ' || ch == b'#' || ch == b'$' || ch > 126 {
                    warn!("gdb: invalid run length byte {:#04x}", ch);
                    self.state = RxState::GetLine;
                    return None;
                }
                let repeat = usize::from(ch - b' ') + 3;
                if self.line.len() + repeat >= MAX_PACKET_LENGTH - 1 {
                    warn!("gdb: run length overruns the packet buffer");
                    self.state = RxState::Idle;
                    return None;
                }
                let Some(&last) = self.line.last() else {
                    warn!("gdb: run length with nothing to repeat");
                    self.state = RxState::GetLine;
                    return None;
                };
                self.line.resize(self.line.len() + repeat, last);
                self.sum = self.sum.wrapping_add(ch);
                self.state = RxState::GetLine;
            }
            RxState::Checksum1 => {
                if !ch.is_ascii_hexdigit() {
                    warn!("gdb: invalid checksum digit {:#04x}", ch);
                    self.state = RxState::GetLine;
                    return None;
                }
                self.csum = fromhex(ch) << 4;
                self.state = RxState::Checksum2;
            }
            RxState::Checksum2 => {
                if !ch.is_ascii_hexdigit() {
                    warn!("gdb: invalid checksum digit {:#04x}", ch);
                    self.state = RxState::GetLine;
                    return None;
                }
                self.csum |= fromhex(ch);
                self.state = RxState::Idle;
                if self.csum != self.sum {
                    warn!(
                        "gdb: bad checksum {:02x}, expected {:02x}",
                        self.csum, self.sum
                    );
                    self.line.clear();
                    return Some(Frame::BadChecksum);
                }
                return Some(Frame::Packet(std::mem::take(&mut self.line)));
            }
        }
        None
    }
}

/// Sum of the payload bytes modulo 256.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Wraps `payload` into `$...#xx`. The payload is sent as is.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(b'$');
    out.extend_from_slice(payload);
    out.push(b'#');
    let csum = checksum(payload);
    out.push(tohex(csum >> 4));
    out.push(tohex(csum & 0xf));
    out
}

/// Escapes the bytes that have a meaning inside a packet, for binary replies.
pub fn escape_binary(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        match b {
            b'#' | b'$' | b'*' | b'}' => {
                out.push(b'}');
                out.push(b ^ 0x20);
            }
            _ => out.push(b),
        }
    }
    out
}

pub fn fromhex(v: u8) -> u8 {
    match v {
        b'0'..=b'9' => v - b'0',
        b'A'..=b'F' => v - b'A' + 10,
        b'a'..=b'f' => v - b'a' + 10,
        _ => 0,
    }
}

pub fn tohex(v: u8) -> u8 {
    if v < 10 {
        v + b'0'
    } else {
        v - 10 + b'a'
    }
}

pub fn memtohex(mem: &[u8]) -> String {
    let mut s = String::with_capacity(mem.len() * 2);
    for b in mem {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// Decodes `len` bytes from hex digit pairs. Non-hex digits count as zero.
pub fn hextomem(hex: &[u8], len: usize) -> Vec<u8> {
    hex.chunks_exact(2)
        .take(len)
        .map(|pair| (fromhex(pair[0]) << 4) | fromhex(pair[1]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut PacketParser, bytes: &[u8]) -> Vec<Frame> {
        bytes.iter().filter_map(|b| parser.feed(*b)).collect()
    }

    fn packet(payload: &str) -> Frame {
        Frame::Packet(payload.as_bytes().to_vec())
    }

    #[test]
    fn checksum_is_sum_mod_256() {
        assert_eq!(checksum(b""), 0);
        assert_eq!(checksum(b"g"), 0x67);
        assert_eq!(checksum(b"?"), 0x3f);
        assert_eq!(checksum(&[0xff, 0x02]), 0x01);
        assert_eq!(frame(b"OK"), b"$OK#9a".to_vec());
    }

    #[test]
    fn valid_packets_are_delivered() {
        let mut p = PacketParser::new();
        assert_eq!(feed_all(&mut p, &frame(b"qSupported")), vec![packet("qSupported")]);
        assert!(p.is_idle());
        assert_eq!(feed_all(&mut p, b"$?#3f"), vec![packet("?")]);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut p = PacketParser::new();
        assert_eq!(feed_all(&mut p, b"$g#00"), vec![Frame::BadChecksum]);
        // The parser is ready for the retransmission.
        assert_eq!(feed_all(&mut p, b"$g#67"), vec![packet("g")]);
    }

    #[test]
    fn escapes_are_undone() {
        for b in [b'#', b'$', b'*', b'}', b'a', 0x00, 0xff] {
            let escaped = escape_binary(&[b'X', b, b'Y']);
            let mut p = PacketParser::new();
            assert_eq!(
                feed_all(&mut p, &frame(&escaped)),
                vec![Frame::Packet(vec![b'X', b, b'Y'])]
            );
        }
    }

    #[test]
    fn run_length_expands_previous_byte() {
        // ' ' encodes a repeat count of 3, '"' one of 5.
        let mut p = PacketParser::new();
        assert_eq!(feed_all(&mut p, &frame(b"a0* ")), vec![packet("a0000")]);
        assert_eq!(feed_all(&mut p, &frame(b"x*\"")), vec![packet("xxxxxx")]);
    }

    #[test]
    fn invalid_run_length_keeps_buffered_bytes() {
        for bad in [0x1f, b'$', 0x7f] {
            // The invalid count byte is dropped and does not count towards the checksum.
            let sum = checksum(b"ab*c");
            let mut bytes = b"$ab*".to_vec();
            bytes.push(bad);
            bytes.extend_from_slice(b"c#");
            bytes.push(tohex(sum >> 4));
            bytes.push(tohex(sum & 0xf));
            let mut p = PacketParser::new();
            assert_eq!(feed_all(&mut p, &bytes), vec![packet("abc")]);
        }
    }

    #[test]
    fn run_length_needs_a_previous_byte() {
        let mut p = PacketParser::new();
        // Only the marker is summed; the count byte is dropped with nothing to repeat.
        let sum = b'*';
        let mut bytes = b"$*!#".to_vec();
        bytes.push(tohex(sum >> 4));
        bytes.push(tohex(sum & 0xf));
        assert_eq!(feed_all(&mut p, &bytes), vec![Frame::Packet(Vec::new())]);
    }

    #[test]
    fn overflow_drops_the_packet() {
        let mut p = PacketParser::new();
        let mut bytes = vec![b'$'];
        bytes.extend(std::iter::repeat(b'a').take(MAX_PACKET_LENGTH));
        assert!(feed_all(&mut p, &bytes).is_empty());
        assert!(p.is_idle());
        assert_eq!(feed_all(&mut p, b"$?#3f"), vec![packet("?")]);
    }

    #[test]
    fn non_hex_checksum_resumes_the_line() {
        let mut p = PacketParser::new();
        // 'x' is dropped and "?" continues; the second '#' starts the real checksum.
        assert_eq!(feed_all(&mut p, b"$?#x#3f"), vec![packet("?")]);
    }

    #[test]
    fn garbage_and_acks_outside_packets() {
        let mut p = PacketParser::new();
        assert!(feed_all(&mut p, b"++garbage").is_empty());
        assert!(p.is_idle());
    }

    #[test]
    fn hex_helpers() {
        assert_eq!(memtohex(&[0x00, 0xab, 0x10]), "00ab10");
        assert_eq!(hextomem(b"00ab10", 3), vec![0x00, 0xab, 0x10]);
        assert_eq!(hextomem(b"00ab10", 2), vec![0x00, 0xab]);
        assert_eq!(hextomem(b"zz", 1), vec![0x00]);
    }
}
