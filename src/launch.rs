// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Builds a machine from a [`Config`] and runs it to completion.

use std::fs;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use base::info;
use base::ClockSource;
use hypervisor::hw::hax::HaxAccel;
use hypervisor::hw::kvm::KvmAccel;
use hypervisor::hw::nvmm::NvmmAccel;
use hypervisor::hw::EmulatedBackend;
use hypervisor::tcg::TcgAccel;
use hypervisor::tcg::TcgConfig;
use hypervisor::tcg::TcgThreadMode;
use hypervisor::vm_start;
use hypervisor::AccelOps;
use hypervisor::Machine;
use hypervisor::Replay;
use hypervisor::VirtualClock;
use hypervisor::Vm;
use vcpu::micro::MicroCpu;
use vcpu::Cpu;
use vcpu::CpuState;
use vcpu::GuestMemory;

use crate::config::AccelKind;
use crate::config::Config;
use crate::gdb::gdb_thread;
use crate::gdb::GdbStub;

fn create_accel(cfg: &Config) -> Box<dyn AccelOps> {
    let tcg = |thread_mode| -> Box<dyn AccelOps> {
        Box::new(TcgAccel::new(TcgConfig {
            thread_mode,
            kick_period: Duration::from_millis(cfg.kick_period_ms),
            icount: cfg.icount.is_some(),
            record_replay: cfg.record.is_some() || cfg.replay.is_some(),
            ..Default::default()
        }))
    };
    // Hardware accelerators run on the in-process backend.
    let backend = Arc::new(EmulatedBackend::new());
    match cfg.accel {
        AccelKind::Tcg => tcg(TcgThreadMode::Multi),
        AccelKind::TcgRr => tcg(TcgThreadMode::RoundRobin),
        AccelKind::Kvm => Box::new(KvmAccel::new(backend)),
        AccelKind::Hax => Box::new(HaxAccel::new(backend)),
        AccelKind::Nvmm => Box::new(NvmmAccel::new(backend)),
    }
}

/// Creates the machine described by `cfg` with its program loaded and its vCPU threads started.
/// The machine stays stopped until [`vm_start`].
pub fn build_vm(cfg: &Config) -> anyhow::Result<Arc<Vm>> {
    let mem_size = usize::try_from(cfg.mem_size).context("guest RAM size does not fit in memory")?;
    let mem = GuestMemory::new(0, mem_size);
    if let Some(path) = &cfg.program {
        let image =
            fs::read(path).with_context(|| format!("failed to read program {}", path.display()))?;
        mem.write(cfg.load_addr, &image).map_err(|e| {
            anyhow!(
                "program {} ({} bytes) does not fit at {:#x}: {}",
                path.display(),
                image.len(),
                cfg.load_addr,
                e
            )
        })?;
        info!("loaded {} bytes at {:#x}", image.len(), cfg.load_addr);
    }

    let clock = VirtualClock::new(ClockSource::host(), cfg.icount);
    let mut m = Machine::new(mem.clone(), clock);
    m.console = Box::new(io::stdout());
    if let Some(path) = &cfg.replay {
        m.replay = Replay::load(path)?;
    } else if cfg.record.is_some() {
        m.replay = Replay::record();
    }
    for index in 0..cfg.cpus {
        let state = CpuState::new(Box::new(MicroCpu::with_entry(mem.clone(), cfg.load_addr)));
        m.add_cpu(Cpu::new(index, cfg.cluster_of(index)), state);
    }

    let vm = Vm::new(m, create_accel(cfg));
    vm.realize_cpus()
        .with_context(|| format!("failed to start vcpus on {}", vm.accel().name()))?;
    Ok(vm)
}

/// Runs the machine until it shuts down and returns its exit code.
///
/// With a debugger configured the machine waits for the client to resume it.
pub fn run_config(cfg: Config) -> anyhow::Result<i32> {
    let vm = build_vm(&cfg)?;
    match cfg.gdb_transport() {
        Some(transport) => {
            let stub = GdbStub::new(vm.clone()).context("failed to set up the GDB stub")?;
            thread::Builder::new()
                .name("gdb".to_string())
                .spawn(move || gdb_thread(stub, transport))
                .context("failed to spawn GDB thread")?;
        }
        None => vm_start(&vm, &mut vm.lock()),
    }

    let exit_code = vm.run_main_loop()?;
    if let Some(path) = &cfg.record {
        vm.lock().replay.save(path)?;
        info!("replay log written to {}", path.display());
    }
    Ok(exit_code)
}
