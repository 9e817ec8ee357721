// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-interval task samples as delivered by the counter backend, plus the
//! derived cache metrics the policies classify on.

use std::io::Write;

use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

/// One task's counters for one sampling interval. Produced externally
/// (perf leader plus CMT/CQM occupancy), consumed once, never mutated.
///
/// `id` is a stable synthetic identifier: it survives a task restart, while
/// `pid` does not. Policies key their history on `id` and re-resolve the
/// pid every interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSample {
    pub id: u32,
    pub pid: libc::pid_t,
    #[serde(default)]
    pub cpu: u32,
    #[serde(default)]
    pub name: String,
    pub instructions: u64,
    pub cycles: u64,
    pub llc_miss: u64,
    pub llc_hit: u64,
    #[serde(default)]
    pub llc_occup_mb: f64,
    pub ipc: f64,
}

impl TaskSample {
    /// LLC misses per thousand instructions. `None` when the interval saw
    /// no instructions; such a task is skipped for the classification pass
    /// rather than fed a division by zero.
    pub fn mpki_l3(&self) -> Option<f64> {
        if self.instructions == 0 {
            return None;
        }
        Some(self.llc_miss as f64 * 1000.0 / self.instructions as f64)
    }

    /// LLC hits per thousand instructions.
    pub fn hpki_l3(&self) -> Option<f64> {
        if self.instructions == 0 {
            return None;
        }
        Some(self.llc_hit as f64 * 1000.0 / self.instructions as f64)
    }
}

/// One sampling interval's batch: every currently-running task, exactly
/// once. The JSON-lines wire format of the sampling collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalBatch {
    pub interval: u64,
    pub tasks: Vec<TaskSample>,
}

impl IntervalBatch {
    pub fn from_json_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

#[derive(Clone, Debug, Default)]
pub struct IntervalStats {
    pub interval: u64,
    pub nr_tasks: usize,
    pub critical_apps: u32,
    pub isolated_apps: u32,
    pub ipc_total: f64,
    pub ipc_critical: f64,
    pub ipc_noncritical: f64,
    pub limit_outlier: f64,
    pub l3_occup_mb_total: f64,
    pub num_shared_ways: u32,
}

impl IntervalStats {
    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "int={:<6} tasks={:<3} crit={} iso={} ipc={:6.2} (cr {:5.2} / ncr {:5.2})",
            self.interval,
            self.nr_tasks,
            self.critical_apps,
            self.isolated_apps,
            self.ipc_total,
            self.ipc_critical,
            self.ipc_noncritical,
        )?;
        writeln!(
            w,
            "  outlier_limit={:6.2} l3_occup={:7.2}MB shared_ways={}",
            self.limit_outlier, self.l3_occup_mb_total, self.num_shared_ways,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(inst: u64, miss: u64, hit: u64) -> TaskSample {
        TaskSample {
            id: 0,
            pid: 1234,
            cpu: 0,
            name: "bench".into(),
            instructions: inst,
            cycles: inst,
            llc_miss: miss,
            llc_hit: hit,
            llc_occup_mb: 0.0,
            ipc: 1.0,
        }
    }

    #[test]
    fn test_derived_metrics() {
        let s = sample(1_000_000, 5_000, 20_000);
        assert_eq!(s.mpki_l3(), Some(5.0));
        assert_eq!(s.hpki_l3(), Some(20.0));
    }

    #[test]
    fn test_zero_instructions_yields_none() {
        let s = sample(0, 5_000, 20_000);
        assert_eq!(s.mpki_l3(), None);
        assert_eq!(s.hpki_l3(), None);
    }

    #[test]
    fn test_batch_json_round() {
        let line = r#"{"interval":7,"tasks":[{"id":1,"pid":42,"instructions":1000,
            "cycles":2000,"llc_miss":10,"llc_hit":30,"ipc":0.5}]}"#
            .replace('\n', "");
        let batch = IntervalBatch::from_json_line(&line).unwrap();
        assert_eq!(batch.interval, 7);
        assert_eq!(batch.tasks.len(), 1);
        assert_eq!(batch.tasks[0].mpki_l3(), Some(10.0));
    }
}
