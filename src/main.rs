// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runs a machine on the micro architecture, optionally under a remote debugger.

use accelvm::config::Args;
use accelvm::config::Config;
use accelvm::launch::run_config;
use base::error;
use base::syslog;
use base::syslog::LogConfig;

fn main() {
    let args: Args = argh::from_env();
    let cfg = match Config::from_args(args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("invalid configuration: {:#}", e);
            std::process::exit(1);
        }
    };
    let log_config = LogConfig {
        filter: cfg.log_filter.clone(),
        ..Default::default()
    };
    if let Err(e) = syslog::init_with(log_config) {
        eprintln!("failed to initialize syslog: {}", e);
        std::process::exit(1);
    }

    let exit_code = match run_config(cfg) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            1
        }
    };
    std::process::exit(exit_code);
}
