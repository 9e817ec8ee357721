// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Critical-aware policy
//!
//! The simplest partitioning variant: one non-critical class (1) and one
//! critical class (2). The outlier threshold is a rolling mean + k·stddev
//! over the per-interval mean MPKI-L3, a task critical in at least half
//! the elapsed intervals stays critical below the threshold, and any
//! change in the critical set collapses the partition back to full masks
//! and re-settles from scratch. Between changes an 8-state hill climb
//! nudges the shared ways between the two classes.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use anyhow::Result;
use log::debug;
use log::info;

use crate::classes::ClassMap;
use crate::config::AssignMode;
use crate::config::Config;
use crate::config::PartitionTable;
use crate::feedback;
use crate::feedback::Flavor;
use crate::feedback::Guards;
use crate::feedback::IpcTrend;
use crate::feedback::Phase;
use crate::outlier::RollingMeanStd;
use crate::policy::CatPolicy;
use crate::policy::CRITICAL_CLASS;
use crate::policy::DEFAULT_CLASS;
use crate::resctrl::CacheController;
use crate::stats::IntervalStats;
use crate::stats::TaskSample;
use crate::waymask::WayMask;

struct Row {
    id: u32,
    pid: libc::pid_t,
    cpu: u32,
    mpki: f64,
    ipc: f64,
}

pub struct CriticalAware<C: CacheController> {
    ctl: C,
    every: u64,
    first_interval: u64,
    idle_intervals: u64,
    clos_add: AssignMode,
    table: PartitionTable,

    detector: RollingMeanStd,
    classes: ClassMap,
    freq_critical: BTreeMap<u32, u64>,

    first_time: bool,
    phase: Phase,
    expected_ipc_total: f64,
    ipc_cr_prev: f64,
    ipc_ncr_prev: f64,
    idle: bool,
    idle_count: u64,

    last: IntervalStats,
}

impl<C: CacheController> CriticalAware<C> {
    pub fn new(cfg: &Config, ctl: C) -> Result<Self> {
        Ok(Self {
            ctl,
            every: cfg.every,
            first_interval: cfg.first_interval,
            idle_intervals: cfg.idle_intervals,
            clos_add: cfg.clos_add,
            table: cfg.partitions.clone(),
            detector: RollingMeanStd::new(cfg.window_size, cfg.thresholds.rolling_k),
            classes: ClassMap::new(),
            freq_critical: BTreeMap::new(),
            first_time: true,
            phase: Phase::Collapsed,
            expected_ipc_total: 0.0,
            ipc_cr_prev: 0.0,
            ipc_ncr_prev: 0.0,
            idle: false,
            idle_count: cfg.idle_intervals,
            last: IntervalStats::default(),
        })
    }

    #[cfg(test)]
    pub fn controller(&self) -> &C {
        &self.ctl
    }

    fn assign(&mut self, class: u32, row: &Row) -> Result<()> {
        match self.clos_add {
            AssignMode::Task => self.ctl.assign_task_to_class(class, row.pid)?,
            AssignMode::Cpu => self.ctl.assign_cpu_to_class(class, row.cpu)?,
        }
        self.classes.assign(row.id, class);
        Ok(())
    }

    /// Collapse back to the unpartitioned configuration: every task in the
    /// default class, both masks full. The next classified interval
    /// re-settles as if it were the first.
    fn reset_configuration(&mut self, tasks: &[TaskSample]) -> Result<()> {
        let full = WayMask::full(self.ctl.total_ways());
        match self.clos_add {
            AssignMode::Task => {
                for task in tasks {
                    self.ctl.assign_task_to_class(DEFAULT_CLASS, task.pid)?;
                }
            }
            AssignMode::Cpu => {
                let cpus: BTreeSet<u32> = tasks.iter().map(|t| t.cpu).collect();
                for cpu in cpus {
                    self.ctl.assign_cpu_to_class(DEFAULT_CLASS, cpu)?;
                }
            }
        }
        self.ctl.set_class_mask(DEFAULT_CLASS, full)?;
        self.ctl.set_class_mask(CRITICAL_CLASS, full)?;

        for task in tasks {
            self.classes.assign(task.id, DEFAULT_CLASS);
        }
        self.first_time = true;
        self.phase = Phase::Collapsed;
        self.expected_ipc_total = 0.0;
        self.idle = false;
        self.idle_count = self.idle_intervals;
        info!("Reset performed, unpartitioned configuration restored");
        Ok(())
    }

    fn settle(&mut self, critical_apps: u32, rows: &[Row], verdicts: &BTreeMap<u32, bool>) -> Result<(f64, f64)> {
        let total = self.ctl.total_ways();
        let (cr_mask, ncr_mask) = if (1..=3).contains(&critical_apps) {
            self.phase = Phase::Settle(critical_apps);
            (
                self.table.critical_mask(critical_apps, total),
                self.table.noncritical_mask(critical_apps, total),
            )
        } else {
            self.phase = Phase::Collapsed;
            (WayMask::full(total), WayMask::full(total))
        };
        self.ctl.set_class_mask(DEFAULT_CLASS, ncr_mask)?;
        self.ctl.set_class_mask(CRITICAL_CLASS, cr_mask)?;
        info!("COS 2 (CR) now has mask {} ({} ways)", cr_mask, cr_mask.ways());
        info!("COS 1 (non-CR) now has mask {} ({} ways)", ncr_mask, ncr_mask.ways());
        self.first_time = false;

        let mut ipc_cr = 0.0;
        let mut ipc_ncr = 0.0;
        for row in rows {
            if verdicts.get(&row.id) == Some(&true) {
                self.assign(CRITICAL_CLASS, row)?;
                ipc_cr += row.ipc;
            } else {
                self.assign(DEFAULT_CLASS, row)?;
                ipc_ncr += row.ipc;
            }
        }
        Ok((ipc_cr, ipc_ncr))
    }
}

impl<C: CacheController> CatPolicy for CriticalAware<C> {
    fn apply(&mut self, interval: u64, tasks: &[TaskSample]) -> Result<()> {
        if interval % self.every != 0 {
            return Ok(());
        }

        let mut rows = Vec::with_capacity(tasks.len());
        let mut ipc_total = 0.0;
        let mut mpki_total = 0.0;
        let mut l3_occup_total = 0.0;
        for task in tasks {
            l3_occup_total += task.llc_occup_mb;
            let Some(mpki) = task.mpki_l3() else {
                debug!("Task {} reported no instructions, skipped this interval", task.id);
                continue;
            };
            debug!(
                "Task {} ({}): IPC = {:.3}, MPKI_L3 = {:.3}",
                task.name, task.id, task.ipc, mpki
            );
            rows.push(Row {
                id: task.id,
                pid: task.pid,
                cpu: task.cpu,
                mpki,
                ipc: task.ipc,
            });
            ipc_total += task.ipc;
            mpki_total += mpki;
        }

        // Reconcile membership: drop departed ids, pick up new or
        // restarted ones at whatever class the hardware reports.
        let active: BTreeSet<u32> = tasks.iter().map(|t| t.id).collect();
        for (id, _) in self.classes.prune(&active) {
            self.freq_critical.remove(&id);
            debug!("Task {} departed, state pruned", id);
        }
        for task in tasks {
            if !self.classes.contains(task.id) {
                let mut class = self.ctl.class_of_task(task.pid)?;
                if class == 0 {
                    self.ctl.assign_task_to_class(DEFAULT_CLASS, task.pid)?;
                    class = DEFAULT_CLASS;
                }
                self.classes.assign(task.id, class);
                self.freq_critical.entry(task.id).or_insert(0);
            }
        }

        if interval < self.first_interval || rows.is_empty() {
            self.last = IntervalStats {
                interval,
                nr_tasks: tasks.len(),
                ipc_total,
                l3_occup_mb_total: l3_occup_total,
                ..Default::default()
            };
            return Ok(());
        }

        self.detector.observe(mpki_total / rows.len() as f64);
        let limit_outlier = self.detector.limit_outlier().expect("window fed above");
        debug!("limit_outlier = {:.3}", limit_outlier);

        // Classify: at or above the threshold, or historically critical at
        // least half the time.
        let mut verdicts = BTreeMap::new();
        let mut critical_apps = 0u32;
        for row in &rows {
            let freq = self.freq_critical.entry(row.id).or_insert(0);
            let fraction = if interval > self.first_interval {
                *freq as f64 / (interval - self.first_interval) as f64
            } else {
                0.0
            };
            let critical = if row.mpki >= limit_outlier {
                *freq += 1;
                true
            } else {
                fraction >= 0.5
            };
            if critical {
                critical_apps += 1;
            }
            verdicts.insert(row.id, critical);
        }
        info!("critical_apps = {}", critical_apps);

        let mut ipc_cr = 0.0;
        let mut ipc_ncr = 0.0;
        let mut num_shared = self.last.num_shared_ways;

        if self.first_time {
            let (cr, ncr) = self.settle(critical_apps, &rows, &verdicts)?;
            ipc_cr = cr;
            ipc_ncr = ncr;
            num_shared = feedback::num_shared_ways(&self.ctl, CRITICAL_CLASS, DEFAULT_CLASS)?;
        } else {
            let mut change = false;
            for row in &rows {
                let critical = verdicts[&row.id];
                let class = self.classes.class_of(row.id).unwrap_or(DEFAULT_CLASS);
                if critical && class != CRITICAL_CLASS {
                    info!("New critical task {} (currently class {})", row.id, class);
                    change = true;
                } else if !critical && class == CRITICAL_CLASS {
                    info!("Task {} is no longer critical", row.id);
                    change = true;
                } else if critical {
                    ipc_cr += row.ipc;
                } else {
                    ipc_ncr += row.ipc;
                }
            }

            if change {
                self.reset_configuration(tasks)?;
            } else if self.idle {
                debug!("Idle interval, {} remaining", self.idle_count);
                self.idle_count -= 1;
                if self.idle_count == 0 {
                    self.idle = false;
                    self.idle_count = self.idle_intervals;
                }
            } else if (1..=3).contains(&critical_apps) {
                let trend = feedback::observe(
                    ipc_total,
                    self.expected_ipc_total,
                    ipc_cr,
                    self.ipc_cr_prev,
                    ipc_ncr,
                    self.ipc_ncr_prev,
                );
                if trend == IpcTrend::Better {
                    info!("New IPC is better, backing off for {} intervals", self.idle_intervals);
                    self.idle = true;
                } else {
                    let (next, action) =
                        feedback::transition(self.phase, trend, Flavor::CriticalAware);
                    self.phase = next;
                    let guards = Guards {
                        ncr_way_floor: self.ctl.min_ways(),
                        cr_way_ceiling: self.ctl.total_ways(),
                    };
                    feedback::execute(
                        &mut self.ctl,
                        action,
                        DEFAULT_CLASS,
                        &[CRITICAL_CLASS],
                        guards,
                    )?;
                }
                num_shared = feedback::num_shared_ways(&self.ctl, CRITICAL_CLASS, DEFAULT_CLASS)?;
            }
        }

        self.ipc_cr_prev = ipc_cr;
        self.ipc_ncr_prev = ipc_ncr;
        self.expected_ipc_total = ipc_total;
        self.last = IntervalStats {
            interval,
            nr_tasks: tasks.len(),
            critical_apps,
            isolated_apps: 0,
            ipc_total,
            ipc_critical: ipc_cr,
            ipc_noncritical: ipc_ncr,
            limit_outlier,
            l3_occup_mb_total: l3_occup_total,
            num_shared_ways: num_shared,
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
    use crate::resctrl::FakeController;

    fn sample(id: u32, mpki: f64, ipc: f64) -> TaskSample {
        let instructions = 1_000_000;
        TaskSample {
            id,
            pid: id as libc::pid_t + 1000,
            cpu: id,
            name: format!("t{}", id),
            instructions,
            cycles: (instructions as f64 / ipc.max(0.001)) as u64,
            llc_miss: (mpki * instructions as f64 / 1000.0) as u64,
            llc_hit: 0,
            llc_occup_mb: 1.0,
            ipc,
        }
    }

    fn policy() -> CriticalAware<FakeController> {
        let mut cfg = Config::default();
        cfg.policy = crate::config::PolicyKind::Ca;
        cfg.first_interval = 3;
        CriticalAware::new(&cfg, FakeController::new(20, 8)).unwrap()
    }

    #[test]
    fn test_cache_light_task_never_partitions() {
        // Scenario: one task with zero cache pressure across many
        // intervals only ever occupies the default class.
        let mut p = policy();
        for interval in 1..=20 {
            p.apply(interval, &[sample(1, 0.0, 1.5)]).unwrap();
        }
        assert_eq!(p.stats().critical_apps, 0);
        assert_eq!(p.controller().tasks_in(1), vec![1001]);
        assert_eq!(p.controller().tasks_in(2), Vec::<libc::pid_t>::new());
        // Both masks stayed full.
        assert_eq!(p.controller().get_class_mask(1).unwrap().bits(), 0xfffff);
        assert_eq!(p.controller().get_class_mask(2).unwrap().bits(), 0xfffff);
    }

    #[test]
    fn test_single_outlier_gets_critical_class() {
        let mut p = policy();
        let batch = vec![sample(1, 50.0, 0.5), sample(2, 1.0, 1.5), sample(3, 1.0, 1.5)];
        for interval in 1..=3 {
            p.apply(interval, &batch).unwrap();
        }
        assert_eq!(p.stats().critical_apps, 1);
        assert_eq!(p.controller().task_class[&1001], 2);
        assert_eq!(p.controller().task_class[&1002], 1);
        // Masks match the one-critical table entry right after settling.
        assert_eq!(p.controller().get_class_mask(2).unwrap().bits(), 0xfff00);
        assert_eq!(p.controller().get_class_mask(1).unwrap().bits(), 0x003ff);

        // A further stable interval hill-climbs without reclassifying.
        p.apply(4, &batch).unwrap();
        assert_eq!(p.stats().critical_apps, 1);
        assert_eq!(p.controller().task_class[&1001], 2);
    }

    #[test]
    fn test_change_in_critical_set_resets_configuration() {
        let mut p = policy();
        let hot = vec![sample(1, 50.0, 0.5), sample(2, 1.0, 1.5), sample(3, 1.0, 1.5)];
        for interval in 1..=4 {
            p.apply(interval, &hot).unwrap();
        }
        assert_eq!(p.controller().task_class[&1001], 2);

        // The hot task cools far below the threshold. The frequency
        // hysteresis keeps it critical while it has been critical at least
        // half the elapsed intervals; once that fraction decays the
        // partition collapses and everyone returns to class 1.
        let cool = vec![sample(1, 0.0, 1.5), sample(2, 1.0, 1.5), sample(3, 1.0, 1.5)];
        for interval in 5..=7 {
            p.apply(interval, &cool).unwrap();
            assert_eq!(p.controller().task_class[&1001], 2);
        }
        p.apply(8, &cool).unwrap();
        assert_eq!(p.controller().task_class[&1001], 1);
        assert_eq!(p.controller().get_class_mask(1).unwrap().bits(), 0xfffff);
        assert_eq!(p.controller().get_class_mask(2).unwrap().bits(), 0xfffff);
    }

    #[test]
    fn test_improved_ipc_backs_off_without_mask_action() {
        // Feedback scenario: expected total 10.0, current 10.5 clears the
        // +4% band, so the controller backs off into its cooldown and
        // performs no mask mutation this interval.
        let mut p = policy();
        let batch = |ipc_hot: f64| {
            vec![
                sample(1, 50.0, 0.5),
                sample(2, 1.0, ipc_hot),
                sample(3, 1.0, ipc_hot),
            ]
        };
        for interval in 1..=4 {
            p.apply(interval, &batch(4.75)).unwrap();
        }
        // Interval 4 ran one hill-climb step from the settle state.
        assert_eq!(p.phase, Phase::SqueezeNoncritical);
        let writes_before = p.controller().mask_writes.len();

        // total = 0.5 + 2 * 5.0 = 10.5 against an expected 10.0.
        p.apply(5, &batch(5.0)).unwrap();
        assert_eq!(p.controller().mask_writes.len(), writes_before);
        assert!(p.idle);
        assert_eq!(p.phase, Phase::SqueezeNoncritical);
    }

    #[test]
    fn test_departed_task_state_is_pruned() {
        let mut p = policy();
        let batch = vec![sample(1, 50.0, 0.5), sample(2, 1.0, 1.5)];
        for interval in 1..=4 {
            p.apply(interval, &batch).unwrap();
        }
        assert!(p.classes.contains(1));
        p.apply(5, &[sample(2, 1.0, 1.5)]).unwrap();
        assert!(!p.classes.contains(1));
        assert!(!p.freq_critical.contains_key(&1));
    }

    #[test]
    fn test_write_failure_aborts_interval() {
        let mut p = policy();
        let batch = vec![sample(1, 50.0, 0.5), sample(2, 1.0, 1.5), sample(3, 1.0, 1.5)];
        p.apply(1, &batch).unwrap();
        p.ctl.fail_writes = true;
        assert!(p.apply(3, &batch).is_err());
    }
}
