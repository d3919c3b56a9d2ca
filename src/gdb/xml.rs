// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt::Write;

use hypervisor::Machine;
use vcpu::CpuState;

use super::session::GdbStub;

const TARGET_XML: &[u8] = b"target.xml";

fn build_target_xml(state: &CpuState) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\"?><!DOCTYPE target SYSTEM \"gdb-target.dtd\"><target>",
    );
    if let Some(arch) = state.env().and_then(|env| env.arch_name()) {
        let _ = write!(xml, "<architecture>{}</architecture>", arch);
    }
    for (_, feature) in state.registers.features() {
        let _ = write!(xml, "<xi:include href=\"{}\"/>", feature.xml_file);
    }
    xml.push_str("</target>");
    xml
}

impl GdbStub {
    /// Returns the document `annex` as seen by the process of CPU `index`: `target.xml`, built
    /// once per process, or one of the feature documents it includes.
    pub(super) fn get_feature_xml(
        &mut self,
        m: &Machine,
        index: usize,
        annex: &[u8],
    ) -> Option<String> {
        let pid = self.cpu_pid(&*m.cpu(index)?);
        let state = m.state(self.first_cpu_in_process(m, pid)?)?;
        if annex == TARGET_XML {
            let process = self.processes.iter_mut().find(|p| p.pid == pid)?;
            return Some(
                process
                    .target_xml
                    .get_or_insert_with(|| build_target_xml(state))
                    .clone(),
            );
        }
        state
            .registers
            .features()
            .into_iter()
            .find(|(_, feature)| feature.xml_file.as_bytes() == annex)
            .map(|(base, feature)| feature.to_xml(base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdb::session::tests::test_stub;

    #[test]
    fn target_xml_lists_features_in_order() {
        let (mut stub, _) = test_stub(&[None]);
        let vm = stub.vm.clone();
        let xml = stub.get_feature_xml(&vm.lock(), 0, b"target.xml").unwrap();
        assert_eq!(
            xml,
            "<?xml version=\"1.0\"?><!DOCTYPE target SYSTEM \"gdb-target.dtd\"><target>\
             <architecture>micro</architecture>\
             <xi:include href=\"micro-core.xml\"/>\
             <xi:include href=\"micro-sys.xml\"/>\
             </target>"
        );
    }

    #[test]
    fn target_xml_is_cached_per_process() {
        let (mut stub, _) = test_stub(&[Some(0), Some(1)]);
        let vm = stub.vm.clone();
        let m = vm.lock();
        stub.get_feature_xml(&m, 1, b"target.xml").unwrap();
        assert!(stub.processes[0].target_xml.is_none());
        assert!(stub.processes[1].target_xml.is_some());

        stub.processes[1].target_xml = Some("cached".to_string());
        assert_eq!(stub.get_feature_xml(&m, 1, b"target.xml").unwrap(), "cached");
    }

    #[test]
    fn feature_documents_use_global_register_numbers() {
        let (mut stub, _) = test_stub(&[None]);
        let vm = stub.vm.clone();
        let m = vm.lock();
        let sys = stub.get_feature_xml(&m, 0, b"micro-sys.xml").unwrap();
        assert!(sys.contains("<feature name=\"org.accelvm.micro.sys\">"));
        assert!(sys.contains("regnum=\"10\""));
        assert!(stub.get_feature_xml(&m, 0, b"micro-fpu.xml").is_none());
        assert!(stub.get_feature_xml(&m, 7, b"target.xml").is_none());
    }
}
