// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Machine configuration, from the command line and an optional JSON file.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::bail;
use anyhow::Context;
use argh::FromArgs;
use serde::Deserialize;
use serde::Serialize;

use crate::gdb::Transport;

/// Accelerator the vCPUs run on.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccelKind {
    /// Software translation, one thread per vCPU.
    #[default]
    Tcg,
    /// Software translation, all vCPUs on one thread.
    TcgRr,
    Kvm,
    Hax,
    Nvmm,
}

impl AccelKind {
    pub fn is_tcg(self) -> bool {
        matches!(self, AccelKind::Tcg | AccelKind::TcgRr)
    }
}

impl FromStr for AccelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).map_err(|_| {
            format!(
                "invalid accelerator '{}', expected one of tcg, tcg-rr, kvm, hax, nvmm",
                s
            )
        })
    }
}

fn parse_hex_or_decimal(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

#[derive(FromArgs, Debug, Default)]
/// Run a machine on the micro architecture, optionally under a debugger.
pub struct Args {
    #[argh(option)]
    /// path to a JSON configuration file. Command line options override its values.
    pub cfg: Option<PathBuf>,
    #[argh(option)]
    /// accelerator: tcg, tcg-rr, kvm, hax or nvmm
    pub accel: Option<AccelKind>,
    #[argh(option)]
    /// number of vCPUs
    pub cpus: Option<usize>,
    #[argh(option)]
    /// number of CPU clusters, 0 for none
    pub clusters: Option<usize>,
    #[argh(option)]
    /// enable instruction counting, 2^N ns per instruction
    pub icount: Option<u32>,
    #[argh(option)]
    /// round-robin time slice in milliseconds
    pub kick_period_ms: Option<u64>,
    #[argh(option)]
    /// wait for a debugger on this TCP port
    pub gdb: Option<u16>,
    #[argh(switch)]
    /// talk to a debugger over stdin and stdout
    pub gdb_stdio: bool,
    #[argh(option)]
    /// raw program image loaded into guest RAM
    pub program: Option<PathBuf>,
    #[argh(option, from_str_fn(parse_hex_or_decimal))]
    /// guest RAM size in bytes
    pub mem_size: Option<u64>,
    #[argh(option, from_str_fn(parse_hex_or_decimal))]
    /// guest address the program is loaded at and starts from
    pub load_addr: Option<u64>,
    #[argh(option)]
    /// record the instruction counts of every quantum into this file
    pub record: Option<PathBuf>,
    #[argh(option)]
    /// replay the instruction counts recorded in this file
    pub replay: Option<PathBuf>,
    #[argh(option)]
    /// log filter, such as "info,hypervisor=debug"
    pub log_filter: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    pub accel: AccelKind,
    pub cpus: usize,
    pub clusters: usize,
    pub icount: Option<u32>,
    pub kick_period_ms: u64,
    pub gdb: Option<u16>,
    pub gdb_stdio: bool,
    pub program: Option<PathBuf>,
    pub mem_size: u64,
    pub load_addr: u64,
    pub record: Option<PathBuf>,
    pub replay: Option<PathBuf>,
    pub log_filter: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            accel: AccelKind::Tcg,
            cpus: 1,
            clusters: 0,
            icount: None,
            kick_period_ms: 100,
            gdb: None,
            gdb_stdio: false,
            program: None,
            mem_size: 1 << 20,
            load_addr: 0,
            record: None,
            replay: None,
            log_filter: None,
        }
    }
}

macro_rules! override_opt {
    ($cfg:ident, $args:ident, $($field:ident),*) => {
        $(
            if let Some(v) = $args.$field {
                $cfg.$field = v;
            }
        )*
    };
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Config> {
        let file = File::open(path)
            .with_context(|| format!("failed to open config file {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Builds the configuration from the command line, on top of the `--cfg` file if given.
    pub fn from_args(args: Args) -> anyhow::Result<Config> {
        let mut cfg = match &args.cfg {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        override_opt!(cfg, args, accel, cpus, clusters, kick_period_ms, mem_size, load_addr);
        if args.icount.is_some() {
            cfg.icount = args.icount;
        }
        if args.gdb.is_some() {
            cfg.gdb = args.gdb;
        }
        if args.program.is_some() {
            cfg.program = args.program;
        }
        if args.record.is_some() {
            cfg.record = args.record;
        }
        if args.replay.is_some() {
            cfg.replay = args.replay;
        }
        if args.log_filter.is_some() {
            cfg.log_filter = args.log_filter;
        }
        cfg.gdb_stdio |= args.gdb_stdio;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cpus == 0 {
            bail!("at least one CPU is required");
        }
        if self.clusters > self.cpus {
            bail!(
                "{} clusters cannot be filled with {} CPUs",
                self.clusters,
                self.cpus
            );
        }
        if !self.accel.is_tcg() {
            if self.icount.is_some() {
                bail!("`icount` requires a tcg accelerator");
            }
            if self.record.is_some() || self.replay.is_some() {
                bail!("record and replay require a tcg accelerator");
            }
        }
        if self.record.is_some() && self.replay.is_some() {
            bail!("`record` and `replay` are mutually exclusive");
        }
        if self.gdb.is_some() && self.gdb_stdio {
            bail!("`gdb` and `gdb-stdio` are mutually exclusive");
        }
        if self.mem_size == 0 {
            bail!("guest RAM cannot be empty");
        }
        if self.load_addr >= self.mem_size {
            bail!(
                "load address {:#x} is outside of guest RAM ({:#x} bytes)",
                self.load_addr,
                self.mem_size
            );
        }
        Ok(())
    }

    pub fn gdb_transport(&self) -> Option<Transport> {
        if self.gdb_stdio {
            Some(Transport::Stdio)
        } else {
            self.gdb.map(Transport::Tcp)
        }
    }

    /// Cluster of CPU `index`. CPUs are spread over clusters in contiguous runs.
    pub fn cluster_of(&self, index: usize) -> Option<u32> {
        if self.clusters == 0 {
            return None;
        }
        u32::try_from(index * self.clusters / self.cpus).ok()
    }
}
