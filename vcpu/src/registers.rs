// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt::Write;

use base::error;

use crate::CpuArch;

/// Appends the value of register `n` of a feature to the buffer and returns its size in bytes.
pub type GetRegFn = fn(&mut dyn CpuArch, &mut Vec<u8>, usize) -> usize;
/// Stores register `n` of a feature from the buffer and returns the number of bytes consumed.
pub type SetRegFn = fn(&mut dyn CpuArch, &[u8], usize) -> usize;

#[derive(Debug)]
pub struct RegisterDesc {
    pub name: &'static str,
    pub bitsize: u32,
    pub reg_type: &'static str,
}

/// A named group of registers with its target description annex.
#[derive(Debug)]
pub struct FeatureDescriptor {
    pub name: &'static str,
    pub xml_file: &'static str,
    pub registers: &'static [RegisterDesc],
}

impl FeatureDescriptor {
    pub fn num_regs(&self) -> usize {
        self.registers.len()
    }

    /// Renders the feature XML with register numbers starting at `base`.
    pub fn to_xml(&self, base: usize) -> String {
        let mut xml = String::from(
            "<?xml version=\"1.0\"?>\n<!DOCTYPE feature SYSTEM \"gdb-target.dtd\">\n",
        );
        let _ = writeln!(xml, "<feature name=\"{}\">", self.name);
        for (i, reg) in self.registers.iter().enumerate() {
            let _ = writeln!(
                xml,
                "  <reg name=\"{}\" bitsize=\"{}\" type=\"{}\" regnum=\"{}\"/>",
                reg.name,
                reg.bitsize,
                reg.reg_type,
                base + i
            );
        }
        xml.push_str("</feature>\n");
        xml
    }
}

/// The core register feature a CPU class declares.
#[derive(Copy, Clone, Debug)]
pub struct CoreFeature {
    pub descriptor: &'static FeatureDescriptor,
    pub get: GetRegFn,
    pub set: SetRegFn,
    /// Number of registers in the bulk `g`/`G` transfer.
    pub num_g_regs: usize,
}

struct RegisteredFeature {
    base: usize,
    descriptor: &'static FeatureDescriptor,
    get: GetRegFn,
    set: SetRegFn,
}

/// Register exposed to introspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterInfo {
    pub index: usize,
    pub name: &'static str,
    pub feature: &'static str,
}

/// Maps global register numbers onto the features registered for one CPU.
#[derive(Default)]
pub struct RegisterFile {
    features: Option<Vec<RegisteredFeature>>,
    num_regs: usize,
    num_g_regs: usize,
}

impl RegisterFile {
    /// Returns an uninitialized register file. Every lookup fails until [`init`](Self::init).
    pub fn new() -> Self {
        Default::default()
    }

    pub fn init(&mut self, arch: &dyn CpuArch) {
        self.features = Some(Vec::new());
        self.num_regs = 0;
        self.num_g_regs = 0;
        if let Some(core) = arch.core_feature() {
            self.push(core.descriptor, core.get, core.set);
            self.num_g_regs = core.num_g_regs;
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.features.is_some()
    }

    fn push(&mut self, descriptor: &'static FeatureDescriptor, get: GetRegFn, set: SetRegFn) {
        let base = self.num_regs;
        if let Some(features) = self.features.as_mut() {
            features.push(RegisteredFeature {
                base,
                descriptor,
                get,
                set,
            });
            self.num_regs += descriptor.num_regs();
        }
    }

    /// Registers an extra feature. Registering the same descriptor twice is a no-op.
    ///
    /// A non-zero `g_pos` asks for the feature to be part of the bulk register transfer, which
    /// only works if it is the next feature after the ones already there.
    pub fn register_feature(
        &mut self,
        get: GetRegFn,
        set: SetRegFn,
        descriptor: &'static FeatureDescriptor,
        g_pos: usize,
    ) {
        let Some(features) = self.features.as_ref() else {
            error!("register feature '{}' before init", descriptor.name);
            return;
        };
        if features
            .iter()
            .any(|f| std::ptr::eq(f.descriptor, descriptor))
        {
            return;
        }
        let base = self.num_regs;
        self.push(descriptor, get, set);
        if g_pos != 0 {
            if g_pos != base {
                error!(
                    "bad register numbering for '{}', expected {} got {}",
                    descriptor.xml_file, g_pos, base
                );
            } else {
                self.num_g_regs = self.num_regs;
            }
        }
    }

    fn find(&self, index: usize) -> Option<&RegisteredFeature> {
        self.features
            .as_ref()?
            .iter()
            .find(|f| index >= f.base && index < f.base + f.descriptor.num_regs())
    }

    /// Reads register `index`, returning the number of bytes appended or 0 if unknown.
    pub fn read(&self, arch: &mut dyn CpuArch, buf: &mut Vec<u8>, index: usize) -> usize {
        match self.find(index) {
            Some(f) => (f.get)(arch, buf, index - f.base),
            None => 0,
        }
    }

    /// Writes register `index`, returning the number of bytes consumed or 0 if unknown.
    pub fn write(&self, arch: &mut dyn CpuArch, buf: &[u8], index: usize) -> usize {
        match self.find(index) {
            Some(f) => (f.set)(arch, buf, index - f.base),
            None => 0,
        }
    }

    /// Drops every registered feature. Used when a CPU is unrealized.
    pub fn unregister_all(&mut self) {
        self.features = None;
        self.num_regs = 0;
        self.num_g_regs = 0;
    }

    pub fn num_regs(&self) -> usize {
        self.num_regs
    }

    pub fn num_g_regs(&self) -> usize {
        self.num_g_regs
    }

    pub fn enumerate(&self) -> Vec<RegisterInfo> {
        let Some(features) = self.features.as_ref() else {
            return Vec::new();
        };
        features
            .iter()
            .flat_map(|f| {
                f.descriptor
                    .registers
                    .iter()
                    .enumerate()
                    .map(move |(i, reg)| RegisterInfo {
                        index: f.base + i,
                        name: reg.name,
                        feature: f.descriptor.name,
                    })
            })
            .collect()
    }

    /// Registered features with their base register number, in registration order.
    pub fn features(&self) -> Vec<(usize, &'static FeatureDescriptor)> {
        self.features
            .iter()
            .flatten()
            .map(|f| (f.base, f.descriptor))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::micro::MicroCpu;
    use crate::GuestMemory;

    static EXTRA: FeatureDescriptor = FeatureDescriptor {
        name: "test.extra",
        xml_file: "test-extra.xml",
        registers: &[
            RegisterDesc {
                name: "x0",
                bitsize: 32,
                reg_type: "int",
            },
            RegisterDesc {
                name: "x1",
                bitsize: 32,
                reg_type: "int",
            },
        ],
    };

    static MORE: FeatureDescriptor = FeatureDescriptor {
        name: "test.more",
        xml_file: "test-more.xml",
        registers: &[RegisterDesc {
            name: "y0",
            bitsize: 64,
            reg_type: "int",
        }],
    };

    fn get_extra(_arch: &mut dyn CpuArch, buf: &mut Vec<u8>, n: usize) -> usize {
        buf.extend_from_slice(&(n as u32 + 100).to_le_bytes());
        4
    }

    fn set_extra(_arch: &mut dyn CpuArch, buf: &[u8], _n: usize) -> usize {
        buf.len().min(4)
    }

    #[test]
    fn uninitialized() {
        let mut cpu = MicroCpu::new(GuestMemory::new(0, 16));
        let regs = RegisterFile::new();
        let mut buf = Vec::new();
        assert_eq!(regs.read(&mut cpu, &mut buf, 0), 0);
        assert!(regs.enumerate().is_empty());
    }

    #[test]
    fn core_and_extra() {
        let mut cpu = MicroCpu::new(GuestMemory::new(0, 16));
        let mut regs = RegisterFile::new();
        regs.init(&cpu);
        let core = regs.num_regs();
        assert_eq!(regs.num_g_regs(), core);

        regs.register_feature(get_extra, set_extra, &EXTRA, 0);
        regs.register_feature(get_extra, set_extra, &EXTRA, 0);
        assert_eq!(regs.num_regs(), core + 2);
        assert_eq!(regs.num_g_regs(), core);

        let mut buf = Vec::new();
        assert_eq!(regs.read(&mut cpu, &mut buf, core + 1), 4);
        assert_eq!(buf, 101u32.to_le_bytes());
        assert_eq!(regs.read(&mut cpu, &mut buf, core + 2), 0);
        assert_eq!(regs.write(&mut cpu, &[0; 8], core), 4);

        let all = regs.enumerate();
        assert_eq!(all.len(), core + 2);
        assert_eq!(all[core].name, "x0");
        assert_eq!(all[core].feature, "test.extra");

        regs.unregister_all();
        assert_eq!(regs.read(&mut cpu, &mut buf, 0), 0);
    }

    #[test]
    fn indices_increase_in_registration_order() {
        let cpu = MicroCpu::new(GuestMemory::new(0, 16));
        let mut regs = RegisterFile::new();
        regs.init(&cpu);
        let core = regs.num_regs();
        regs.register_feature(get_extra, set_extra, &EXTRA, 0);
        regs.register_feature(get_extra, set_extra, &MORE, 0);
        regs.register_feature(get_extra, set_extra, &EXTRA, 0);

        let all = regs.enumerate();
        assert_eq!(all.len(), core + 3);
        assert!(all.windows(2).all(|w| w[0].index < w[1].index));
        assert!(all.iter().enumerate().all(|(i, r)| r.index == i));
        let features: Vec<_> = regs.features().iter().map(|(base, f)| (*base, f.name)).collect();
        assert_eq!(features[1..], [(core, "test.extra"), (core + 2, "test.more")]);
        assert_eq!(all[core + 2].name, "y0");
    }

    #[test]
    fn g_pos_extends_bulk_transfer() {
        let cpu = MicroCpu::new(GuestMemory::new(0, 16));
        let mut regs = RegisterFile::new();
        regs.init(&cpu);
        let core = regs.num_regs();
        regs.register_feature(get_extra, set_extra, &EXTRA, core);
        assert_eq!(regs.num_g_regs(), core + 2);
    }

    #[test]
    fn feature_xml() {
        let xml = EXTRA.to_xml(9);
        assert!(xml.contains("<feature name=\"test.extra\">"));
        assert!(xml.contains("name=\"x1\" bitsize=\"32\" type=\"int\" regnum=\"10\""));
    }
}
