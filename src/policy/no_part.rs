// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Observation-only baseline: no mask is ever written, the policy just
//! accounts IPC so a run can be compared against the partitioned ones.

use std::collections::BTreeMap;

use anyhow::Result;
use log::info;

use crate::config::Config;
use crate::config::NpStatsMode;
use crate::policy::CatPolicy;
use crate::stats::IntervalStats;
use crate::stats::TaskSample;

pub struct NoPart {
    every: u64,
    mode: NpStatsMode,
    totals: BTreeMap<u32, (u64, u64)>,
    last: IntervalStats,
}

impl NoPart {
    pub fn new(cfg: &Config) -> Self {
        Self {
            every: cfg.every,
            mode: cfg.np_stats,
            totals: BTreeMap::new(),
            last: IntervalStats::default(),
        }
    }
}

impl CatPolicy for NoPart {
    fn apply(&mut self, interval: u64, tasks: &[TaskSample]) -> Result<()> {
        if interval % self.every != 0 {
            return Ok(());
        }

        let mut ipc_total = 0.0;
        for task in tasks {
            let (insts, cycles) = self.totals.entry(task.id).or_insert((0, 0));
            *insts += task.instructions;
            *cycles += task.cycles;

            let ipc = match self.mode {
                NpStatsMode::Interval => {
                    if task.cycles == 0 {
                        continue;
                    }
                    task.instructions as f64 / task.cycles as f64
                }
                NpStatsMode::Total => {
                    if *cycles == 0 {
                        continue;
                    }
                    *insts as f64 / *cycles as f64
                }
            };
            info!("Task {} ({}): IPC = {:.3}", task.name, task.id, ipc);
            ipc_total += ipc;
        }

        self.totals.retain(|id, _| tasks.iter().any(|t| t.id == *id));

        self.last = IntervalStats {
            interval,
            nr_tasks: tasks.len(),
            ipc_total,
            ..Default::default()
        };
        Ok(())
    }

    fn stats(&self) -> IntervalStats {
        self.last.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn sample(id: u32, insts: u64, cycles: u64) -> TaskSample {
        TaskSample {
            id,
            pid: id as libc::pid_t + 100,
            cpu: 0,
            name: format!("t{}", id),
            instructions: insts,
            cycles,
            llc_miss: 0,
            llc_hit: 0,
            llc_occup_mb: 0.0,
            ipc: insts as f64 / cycles.max(1) as f64,
        }
    }

    #[test]
    fn test_interval_mode_sums_per_interval_ipc() {
        let cfg = Config::default();
        let mut np = NoPart::new(&cfg);
        np.apply(1, &[sample(1, 200, 100), sample(2, 50, 100)]).unwrap();
        assert!((np.stats().ipc_total - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_total_mode_accumulates() {
        let mut cfg = Config::default();
        cfg.np_stats = NpStatsMode::Total;
        let mut np = NoPart::new(&cfg);
        np.apply(1, &[sample(1, 100, 100)]).unwrap();
        np.apply(2, &[sample(1, 300, 100)]).unwrap();
        // 400 instructions over 200 cycles so far.
        assert!((np.stats().ipc_total - 2.0).abs() < 1e-9);
    }
}
