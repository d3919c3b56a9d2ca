// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A small machine emulator built around an accelerator-neutral vCPU core, with a remote debug
//! protocol engine on top.

pub mod config;
pub mod gdb;
pub mod launch;
