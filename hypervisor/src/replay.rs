// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs::File;
use std::io::BufReader;
use std::io::BufWriter;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayMode {
    #[default]
    None,
    Record,
    Play,
}

#[derive(Default, Serialize, Deserialize)]
struct ReplayLog {
    quanta: Vec<u64>,
}

/// Record of how many instructions each quantum executed, in global execution order.
///
/// Recording appends one entry per quantum. Playing hands the recorded counts back as the
/// instruction budget, which makes the interleaving of CPUs and timers reproducible.
#[derive(Debug, Default)]
pub struct Replay {
    mode: ReplayMode,
    quanta: Vec<u64>,
    position: usize,
    consumed: u64,
}

impl Replay {
    pub fn record() -> Replay {
        Replay {
            mode: ReplayMode::Record,
            ..Default::default()
        }
    }

    pub fn play(quanta: Vec<u64>) -> Replay {
        Replay {
            mode: ReplayMode::Play,
            quanta,
            ..Default::default()
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Replay> {
        let file = File::open(path)
            .with_context(|| format!("failed to open replay log {}", path.display()))?;
        let log: ReplayLog = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse replay log {}", path.display()))?;
        Ok(Replay::play(log.quanta))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let file = File::create(path)
            .with_context(|| format!("failed to create replay log {}", path.display()))?;
        let log = ReplayLog {
            quanta: self.quanta.clone(),
        };
        serde_json::to_writer(BufWriter::new(file), &log).context("failed to write replay log")
    }

    pub fn mode(&self) -> ReplayMode {
        self.mode
    }

    pub fn quanta(&self) -> &[u64] {
        &self.quanta
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Instructions left in the current recorded quantum. Zero once the log is exhausted.
    pub fn instructions(&self) -> u64 {
        self.quanta
            .get(self.position)
            .map_or(0, |q| q.saturating_sub(self.consumed))
    }

    pub fn account_executed(&mut self, executed: u64) {
        match self.mode {
            ReplayMode::None => {}
            ReplayMode::Record => {
                if executed > 0 {
                    self.quanta.push(executed);
                }
            }
            ReplayMode::Play => {
                self.consumed += executed;
                if self.position < self.quanta.len() && self.consumed >= self.quanta[self.position]
                {
                    self.position += 1;
                    self.consumed = 0;
                }
            }
        }
    }

    /// Whether reverse execution is possible from the current position.
    pub fn can_reverse(&self) -> bool {
        self.mode == ReplayMode::Play && self.position > 0
    }

    /// Moves the cursor back by one quantum.
    pub fn reverse_step(&mut self) -> bool {
        if !self.can_reverse() {
            return false;
        }
        self.position -= 1;
        self.consumed = 0;
        true
    }

    /// Moves the cursor back to the start of the log.
    pub fn reverse_continue(&mut self) -> bool {
        if !self.can_reverse() {
            return false;
        }
        self.position = 0;
        self.consumed = 0;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_then_play() {
        let mut rec = Replay::record();
        rec.account_executed(10);
        rec.account_executed(0);
        rec.account_executed(4);
        assert_eq!(rec.quanta(), &[10, 4]);
        assert!(!rec.can_reverse());

        let mut play = Replay::play(rec.quanta().to_vec());
        assert_eq!(play.instructions(), 10);
        play.account_executed(6);
        assert_eq!(play.instructions(), 4);
        play.account_executed(4);
        assert_eq!(play.position(), 1);
        assert_eq!(play.instructions(), 4);
        play.account_executed(4);
        assert_eq!(play.instructions(), 0);
    }

    #[test]
    fn reverse() {
        let mut play = Replay::play(vec![1, 2, 3]);
        assert!(!play.reverse_step());
        play.account_executed(1);
        play.account_executed(2);
        assert!(play.reverse_step());
        assert_eq!(play.position(), 1);
        assert!(play.reverse_continue());
        assert_eq!(play.position(), 0);
        assert!(!play.reverse_continue());
        assert!(!Replay::default().can_reverse());
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.json");
        let mut rec = Replay::record();
        rec.account_executed(7);
        rec.save(&path).unwrap();
        let play = Replay::load(&path).unwrap();
        assert_eq!(play.mode(), ReplayMode::Play);
        assert_eq!(play.quanta(), &[7]);
        assert!(Replay::load(&dir.path().join("missing.json")).is_err());
    }
}
