// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use sync::Mutex;

use crate::Error;
use crate::Result;

/// Flat guest RAM starting at `base`, shared by every CPU of a machine.
#[derive(Clone, Debug)]
pub struct GuestMemory {
    base: u64,
    mem: Arc<Mutex<Vec<u8>>>,
}

impl GuestMemory {
    pub fn new(base: u64, size: usize) -> GuestMemory {
        GuestMemory {
            base,
            mem: Arc::new(Mutex::new(vec![0; size])),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.mem.lock().len()
    }

    fn offset(&self, addr: u64, len: usize, size: usize) -> Result<usize> {
        let out_of_range = || Error::MemoryOutOfRange { addr, len };
        let off = addr
            .checked_sub(self.base)
            .and_then(|off| usize::try_from(off).ok())
            .ok_or_else(out_of_range)?;
        match off.checked_add(len) {
            Some(end) if end <= size => Ok(off),
            _ => Err(out_of_range()),
        }
    }

    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let mem = self.mem.lock();
        let off = self.offset(addr, buf.len(), mem.len())?;
        buf.copy_from_slice(&mem[off..off + buf.len()]);
        Ok(())
    }

    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mut mem = self.mem.lock();
        let off = self.offset(addr, data.len(), mem.len())?;
        mem[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read(addr, &mut b)?;
        Ok(b[0])
    }

    pub fn write_u8(&self, addr: u64, val: u8) -> Result<()> {
        self.write(addr, &[val])
    }

    /// Atomically applies `f` to the byte at `addr`, returning the old value.
    pub fn update_u8(&self, addr: u64, f: impl FnOnce(u8) -> u8) -> Result<u8> {
        let mut mem = self.mem.lock();
        let off = self.offset(addr, 1, mem.len())?;
        let old = mem[off];
        mem[off] = f(old);
        Ok(old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds() {
        let mem = GuestMemory::new(0x1000, 0x100);
        mem.write(0x1000, &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 3];
        mem.read(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);

        assert!(mem.read(0xfff, &mut buf).is_err());
        assert!(mem.read(0x10fe, &mut buf).is_err());
        assert!(mem.write(u64::MAX, &[0]).is_err());
        mem.write_u8(0x10ff, 9).unwrap();
        assert_eq!(mem.read_u8(0x10ff).unwrap(), 9);
    }

    #[test]
    fn update() {
        let mem = GuestMemory::new(0, 4);
        assert_eq!(mem.update_u8(2, |v| v.wrapping_add(5)).unwrap(), 0);
        assert_eq!(mem.read_u8(2).unwrap(), 5);
        let clone = mem.clone();
        clone.write_u8(3, 7).unwrap();
        assert_eq!(mem.read_u8(3).unwrap(), 7);
    }
}
