// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Critical-aware v4 policy
//!
//! The quantile-threshold variant. Per-task MPKI-L3 windows are pooled
//! each interval and the 75th percentile becomes the outlier threshold.
//! Up to three critical tasks get table-driven exclusive-ish classes
//! (2..4), bullies and oversized greedy tasks are parked in one of three
//! exclusive isolation classes (5..7), and a very-non-critical task can
//! be co-located into a critical class to soak up its spare bandwidth.
//! There is no hill climb; every reconfiguration is followed by an idle
//! interval instead.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use anyhow::Result;
use log::debug;
use log::info;

use crate::classes::ClassMap;
use crate::classes::ClassPool;
use crate::config::Config;
use crate::config::V4Table;
use crate::outlier;
use crate::policy::CatPolicy;
use crate::policy::DEFAULT_CLASS;
use crate::policy::TaskStates;
use crate::resctrl::CacheController;
use crate::rolling::QuantilePool;
use crate::stats::IntervalStats;
use crate::stats::TaskSample;

const CRITICAL_CLASSES: [u32; 3] = [2, 3, 4];
const ISO_CLASSES: [u32; 3] = [5, 6, 7];

/// A bully in an isolation class returns to the default class once its
/// hit rate calms down or its IPC collapses entirely.
const BULLY_RETURN_HPKI: f64 = 10.0;
const BULLY_RETURN_IPC: f64 = 0.4;
/// "Very non-critical": fast, cache-indifferent, small footprint. Such a
/// task can share a critical class without hurting its owner.
const VERY_NONCR_IPC: f64 = 1.7;
const VERY_NONCR_HPKI: f64 = 1.0;
const VERY_NONCR_OCCUP_MB: f64 = 2.0;
/// A group IPC within 4% of its previous value counts as unchanged.
const IPC_DEGRADE: f64 = 0.96;
/// Only two isolation slots serve greedy tasks; the third is reserved so
/// a bully can always be parked.
const MAX_GREEDY_ISOLATED: usize = 2;

fn is_critical(class: u32) -> bool {
    CRITICAL_CLASSES.contains(&class)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum V4Status {
    NonCritical,
    Critical,
    IsoGreedy,
    IsoBully,
}

#[derive(Debug, Clone, Copy)]
struct Row {
    pid: libc::pid_t,
    mpki: f64,
    hpki: f64,
    ipc: f64,
    occup: f64,
}

pub struct CriticalAwareV4<C: CacheController> {
    ctl: C,
    every: u64,
    first_interval: u64,
    idle_intervals: u64,
    ipc_threshold: f64,
    ipc_good_limit: f64,
    icov: f64,
    quantile: f64,
    table: V4Table,

    states: TaskStates,
    classes: ClassMap,
    status: BTreeMap<u32, V4Status>,
    iso_pool: ClassPool,

    idle: bool,
    idle_count: u64,
    prev_critical_apps: u32,

    last: IntervalStats,
}

impl<C: CacheController> CriticalAwareV4<C> {
    pub fn new(cfg: &Config, ctl: C) -> Result<Self> {
        Ok(Self {
            ctl,
            every: cfg.every,
            first_interval: cfg.first_interval,
            idle_intervals: cfg.idle_intervals,
            ipc_threshold: cfg.thresholds.ipc_medium,
            ipc_good_limit: cfg.thresholds.v4_ipc_good,
            icov: cfg.thresholds.icov,
            quantile: cfg.thresholds.quantile,
            table: cfg.v4.clone(),
            states: TaskStates::new(cfg.window_size),
            classes: ClassMap::new(),
            status: BTreeMap::new(),
            iso_pool: ClassPool::new("isolation", &ISO_CLASSES),
            idle: false,
            idle_count: cfg.idle_intervals,
            prev_critical_apps: 0,
            last: IntervalStats::default(),
        })
    }

    #[cfg(test)]
    pub fn controller(&self) -> &C {
        &self.ctl
    }

    /// Park a task in its own exclusive isolation class.
    fn isolate(&mut self, id: u32, pid: libc::pid_t, status: V4Status) -> Result<()> {
        let Some(clos) = self.iso_pool.checkout() else {
            info!("No isolation class free, task {} stays put", id);
            return Ok(());
        };
        let res = (|| -> Result<()> {
            self.ctl.assign_task_to_class(clos, pid)?;
            let mask = self.table.iso_mask(clos);
            self.ctl.set_class_mask(clos, mask)?;
            info!("Task {} isolated in class {} (mask {})", id, clos, mask);
            Ok(())
        })();
        if let Err(e) = res {
            self.iso_pool.put_back(clos);
            return Err(e);
        }
        self.classes.assign(id, clos);
        self.status.insert(id, status);
        Ok(())
    }

    fn include(&mut self, id: u32, pid: libc::pid_t) -> Result<()> {
        let Some(clos) = self.classes.class_of(id) else { return Ok(()) };
        self.ctl.assign_task_to_class(DEFAULT_CLASS, pid)?;
        self.iso_pool.put_back(clos);
        self.classes.assign(id, DEFAULT_CLASS);
        self.status.insert(id, V4Status::NonCritical);
        if let Some(st) = self.states.get_mut(id) {
            st.excluded = false;
        }
        info!("Task {} returned to class {}", id, DEFAULT_CLASS);
        Ok(())
    }
}

impl<C: CacheController> CatPolicy for CriticalAwareV4<C> {
    fn apply(&mut self, interval: u64, tasks: &[TaskSample]) -> Result<()> {
        if interval % self.every != 0 {
            return Ok(());
        }

        let active: BTreeSet<u32> = tasks.iter().map(|t| t.id).collect();
        for id in self.states.prune(&active) {
            debug!("Task {} departed, state pruned", id);
            self.status.remove(&id);
        }
        for (_, class) in self.classes.prune(&active) {
            if ISO_CLASSES.contains(&class) {
                self.iso_pool.put_back(class);
            }
        }

        let mut rows: BTreeMap<u32, Row> = BTreeMap::new();
        let mut verynoncr: Vec<u32> = Vec::new();
        let mut ipc_total = 0.0;
        let mut l3_occup_total = 0.0;

        let ncr_ways = self.ctl.get_class_mask(DEFAULT_CLASS)?.ways();
        let greedy_space = (ncr_ways / 3) as f64;

        for task in tasks {
            ipc_total += task.ipc;
            l3_occup_total += task.llc_occup_mb;
            let mpki = task.mpki_l3();
            let hpki = task.hpki_l3();

            if !self.states.contains(task.id) {
                self.ctl.assign_task_to_class(DEFAULT_CLASS, task.pid)?;
                self.states.insert_new(task.id, mpki, task.ipc);
                self.classes.assign(task.id, DEFAULT_CLASS);
                self.status.insert(task.id, V4Status::NonCritical);
                debug!("New task {} starts in class {}", task.id, DEFAULT_CLASS);
                continue;
            }
            let (Some(mpki), Some(hpki)) = (mpki, hpki) else {
                debug!("Task {} reported no instructions, skipped this interval", task.id);
                continue;
            };
            rows.insert(
                task.id,
                Row { pid: task.pid, mpki, hpki, ipc: task.ipc, occup: task.llc_occup_mb },
            );

            let obs = self
                .states
                .get_mut(task.id)
                .unwrap()
                .observe_phase(task.ipc, self.icov);
            debug!("Task {}: icov = {:.3} ({:.3})", task.id, obs.icov, task.ipc);

            if interval >= self.first_interval {
                let status = *self.status.get(&task.id).unwrap();
                let class = self.classes.class_of(task.id).unwrap_or(DEFAULT_CLASS);
                match status {
                    V4Status::IsoBully => {
                        if (obs.phase_changed && hpki < BULLY_RETURN_HPKI)
                            || task.ipc < BULLY_RETURN_IPC
                        {
                            info!("Bully task {} entered a calmer phase", task.id);
                            self.include(task.id, task.pid)?;
                            let st = self.states.get_mut(task.id).unwrap();
                            st.bully_strikes = st.bully_strikes.saturating_sub(1);
                        }
                    }
                    V4Status::IsoGreedy => {
                        let prev = self.states.get(task.id).unwrap().prev_ipc;
                        if hpki >= VERY_NONCR_HPKI
                            && obs.phase_changed
                            && task.ipc < IPC_DEGRADE * prev
                        {
                            info!("Isolated task {} started using the cache again", task.id);
                            self.include(task.id, task.pid)?;
                        }
                    }
                    V4Status::NonCritical if class == DEFAULT_CLASS => {
                        if task.ipc > VERY_NONCR_IPC
                            && hpki < VERY_NONCR_HPKI
                            && task.llc_occup_mb <= VERY_NONCR_OCCUP_MB
                        {
                            verynoncr.push(task.id);
                        }
                        if greedy_space >= 3.0
                            && task.llc_occup_mb > greedy_space
                            && hpki < VERY_NONCR_HPKI
                            && self.iso_pool.in_use() < MAX_GREEDY_ISOLATED
                        {
                            info!("Task {} occupies {:.2}MB: isolate", task.id, task.llc_occup_mb);
                            self.isolate(task.id, task.pid, V4Status::IsoGreedy)?;
                        }
                    }
                    V4Status::Critical => {
                        let idle = self.idle;
                        let ipc_threshold = self.ipc_threshold;
                        let st = self.states.get_mut(task.id).unwrap();
                        let prev = st.prev_ipc;
                        if obs.phase_changed {
                            if task.ipc < IPC_DEGRADE * prev && task.ipc < ipc_threshold {
                                debug!("Task {}: worse phase below the IPC threshold", task.id);
                                st.phase_change_pending = true;
                            } else {
                                st.phase_change_pending = false;
                                st.in_good_phase = true;
                            }
                        } else if !idle && !st.phase_change_pending {
                            if task.ipc < ipc_threshold {
                                st.phase_change_pending = true;
                                if hpki > BULLY_RETURN_HPKI {
                                    st.bully_strikes += 1;
                                    debug!("Task {}: bully strike {}", task.id, st.bully_strikes);
                                }
                            } else {
                                st.in_good_phase = true;
                                st.phase_change_pending = false;
                            }
                        } else if !idle
                            && st.phase_change_pending
                            && task.ipc < ipc_threshold
                            && hpki > BULLY_RETURN_HPKI
                        {
                            st.bully_strikes += 1;
                            debug!("Task {}: bully strike {}", task.id, st.bully_strikes);
                        }
                    }
                    V4Status::NonCritical => {}
                }
            }

            self.states.get_mut(task.id).unwrap().window.push(mpki);
        }

        if interval < self.first_interval || self.idle {
            let (mut ipc_cr, mut ipc_ncr) = (0.0, 0.0);
            for (id, class) in self.classes.iter() {
                let Some(row) = rows.get(&id) else { continue };
                if is_critical(class) {
                    ipc_cr += row.ipc;
                } else {
                    ipc_ncr += row.ipc;
                }
            }
            if self.idle {
                debug!("Idle interval, {} remaining", self.idle_count);
                self.idle_count -= 1;
                if self.idle_count == 0 {
                    self.idle = false;
                    self.idle_count = self.idle_intervals;
                }
            }
            self.last = IntervalStats {
                interval,
                nr_tasks: tasks.len(),
                critical_apps: self.prev_critical_apps,
                isolated_apps: self.iso_pool.in_use() as u32,
                ipc_total,
                ipc_critical: ipc_cr,
                ipc_noncritical: ipc_ncr,
                l3_occup_mb_total: l3_occup_total,
                ..Default::default()
            };
            return Ok(());
        }

        // Pool the windows of every non-excluded task; the 75th percentile
        // is the threshold.
        let mut pool = QuantilePool::new();
        for (id, st) in self.states.iter() {
            if st.excluded {
                debug!("Task {} is excluded from the distribution", id);
                continue;
            }
            for v in st.window.iter() {
                pool.push(v);
            }
        }
        let Some(limit_outlier) = outlier::pooled_quantile(&pool, self.quantile) else {
            info!("No usable samples this interval, classification skipped");
            return Ok(());
        };
        debug!("limit_outlier = {:.3}", limit_outlier);

        let mut critical: Vec<u32> = Vec::new();
        let mut noncritical: Vec<u32> = Vec::new();
        let mut change = false;

        let ids: Vec<u32> = rows.keys().copied().collect();
        for id in ids {
            let row = rows[&id];
            let status = *self.status.get(&id).unwrap();
            match status {
                V4Status::Critical => {
                    let st = self.states.get_mut(id).unwrap();
                    if !st.phase_change_pending && st.in_good_phase {
                        debug!("Critical task {} is doing well, stays", id);
                        critical.push(id);
                    } else {
                        info!("Critical task {} no longer profits from its space", id);
                        noncritical.push(id);
                        st.phase_change_pending = false;
                        self.status.insert(id, V4Status::NonCritical);
                        change = true;
                    }
                    self.states.get_mut(id).unwrap().in_good_phase = false;
                }
                V4Status::IsoGreedy | V4Status::IsoBully => {
                    debug!("Isolated task {} cannot be considered critical", id);
                }
                V4Status::NonCritical => {
                    let strikes = self.states.get(id).unwrap().bully_strikes;
                    if row.mpki >= limit_outlier
                        && row.ipc <= self.ipc_good_limit
                        && strikes < 2
                    {
                        info!(
                            "Task {} is an outlier: MPKI {:.2} >= {:.2}",
                            id, row.mpki, limit_outlier
                        );
                        critical.push(id);
                        self.states.get_mut(id).unwrap().excluded = false;
                        self.status.insert(id, V4Status::Critical);
                        change = true;
                    } else if row.mpki >= limit_outlier
                        && row.ipc <= self.ipc_threshold
                        && strikes >= 2
                        && self.iso_pool.free() > 0
                    {
                        info!("Task {} is a bully: isolate", id);
                        self.states.get_mut(id).unwrap().excluded = true;
                        self.isolate(id, row.pid, V4Status::IsoBully)?;
                    } else {
                        debug!("Task {} is not an outlier", id);
                        noncritical.push(id);
                    }
                }
            }
            self.states.get_mut(id).unwrap().prev_ipc = row.ipc;
        }

        let critical_apps = critical.len() as u32;
        info!("critical_apps = {}", critical_apps);

        if interval == self.first_interval || change {
            let masks = self.table.class_masks(critical_apps, self.ctl.total_ways());
            for (i, mask) in masks.iter().enumerate() {
                self.ctl.set_class_mask(i as u32 + 1, *mask)?;
                debug!("Class {} now has mask {} ({} ways)", i + 1, mask, mask.ways());
            }

            if (1..=3).contains(&critical_apps) {
                self.idle = true;
                self.idle_count = self.idle_intervals;

                for &id in &noncritical {
                    let Some(row) = rows.get(&id) else { continue };
                    self.ctl.assign_task_to_class(DEFAULT_CLASS, row.pid)?;
                    self.classes.assign(id, DEFAULT_CLASS);
                }
                let mut new_clos = CRITICAL_CLASSES[0];
                for &id in &critical {
                    let Some(row) = rows.get(&id) else { continue };
                    self.ctl.assign_task_to_class(new_clos, row.pid)?;
                    self.classes.assign(id, new_clos);
                    info!("Task {} assigned to class {}", id, new_clos);
                    // With two or three critical tasks each class has spare
                    // bandwidth; a very-non-critical task can ride along.
                    if critical_apps >= 2 {
                        if let Some(vid) = verynoncr.pop() {
                            if let Some(vrow) = rows.get(&vid) {
                                self.ctl.assign_task_to_class(new_clos, vrow.pid)?;
                                self.classes.assign(vid, new_clos);
                                info!("Task {} co-located into class {}", vid, new_clos);
                            }
                        }
                    }
                    new_clos += 1;
                }
            } else {
                // Zero or too many critical tasks: everyone previously
                // partitioned returns to the default class.
                for (id, class) in self.classes.clone().iter() {
                    let was_critical = self.status.get(&id) == Some(&V4Status::Critical);
                    if was_critical || (is_critical(class)) {
                        if let Some(row) = rows.get(&id) {
                            self.ctl.assign_task_to_class(DEFAULT_CLASS, row.pid)?;
                        }
                        self.classes.assign(id, DEFAULT_CLASS);
                        if was_critical {
                            self.status.insert(id, V4Status::NonCritical);
                        }
                    }
                }
            }
        } else {
            self.idle = true;
            self.idle_count = self.idle_intervals;
        }

        let (mut ipc_cr, mut ipc_ncr) = (0.0, 0.0);
        for (id, class) in self.classes.iter() {
            let Some(row) = rows.get(&id) else { continue };
            if is_critical(class) {
                ipc_cr += row.ipc;
            } else {
                ipc_ncr += row.ipc;
            }
        }
        self.prev_critical_apps = critical_apps;
        self.last = IntervalStats {
            interval,
            nr_tasks: tasks.len(),
            critical_apps,
            isolated_apps: self.iso_pool.in_use() as u32,
            ipc_total,
            ipc_critical: ipc_cr,
            ipc_noncritical: ipc_ncr,
            limit_outlier,
            l3_occup_mb_total: l3_occup_total,
            num_shared_ways: 0,
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

    fn sample(id: u32, mpki: f64, hpki: f64, ipc: f64, occup: f64) -> TaskSample {
        let instructions = 1_000_000u64;
        TaskSample {
            id,
            pid: id as libc::pid_t + 1000,
            cpu: id,
            name: format!("t{}", id),
            instructions,
            cycles: (instructions as f64 / ipc.max(0.001)) as u64,
            llc_miss: (mpki * instructions as f64 / 1000.0) as u64,
            llc_hit: (hpki * instructions as f64 / 1000.0) as u64,
            llc_occup_mb: occup,
            ipc,
        }
    }

    fn policy() -> CriticalAwareV4<FakeController> {
        let mut cfg = Config::default();
        cfg.policy = crate::config::PolicyKind::Cav4;
        cfg.first_interval = 3;
        cfg.idle_intervals = 1;
        CriticalAwareV4::new(&cfg, FakeController::new(20, 8)).unwrap()
    }

    #[test]
    fn test_quantile_flags_single_outlier_of_three() {
        let mut p = policy();
        // Three tasks; the 75th percentile of the pooled windows lands on
        // the hot task's MPKI, so it alone is flagged.
        let batch = vec![
            sample(1, 50.0, 20.0, 0.5, 6.0),
            sample(2, 1.0, 1.0, 1.5, 0.5),
            sample(3, 1.0, 1.0, 1.5, 0.5),
        ];
        for interval in 1..=3 {
            p.apply(interval, &batch).unwrap();
        }
        assert_eq!(p.stats().critical_apps, 1);
        assert_eq!(p.classes.class_of(1), Some(2));
        assert_eq!(p.controller().task_class[&1001], 2);
        // Class masks follow the one-critical v4 table row.
        assert_eq!(p.controller().get_class_mask(1).unwrap().bits(), 0x001ff);
        assert_eq!(p.controller().get_class_mask(2).unwrap().bits(), 0xfff80);
    }

    #[test]
    fn test_greedy_task_isolated_with_exclusive_mask() {
        let mut p = policy();
        // Low hit rate, big footprint, mediocre miss rate: greedy.
        let batch = vec![
            sample(1, 0.2, 0.3, 1.2, 8.0),
            sample(2, 1.0, 1.0, 1.5, 0.5),
            sample(3, 1.0, 1.0, 1.5, 0.5),
        ];
        for interval in 1..=3 {
            p.apply(interval, &batch).unwrap();
        }
        assert_eq!(p.classes.class_of(1), Some(5));
        assert_eq!(*p.status.get(&1).unwrap(), V4Status::IsoGreedy);
        assert_eq!(p.controller().get_class_mask(5).unwrap().bits(), 0x7);
        assert_eq!(p.iso_pool.in_use(), 1);
    }

    #[test]
    fn test_demoted_critical_collapses_partition() {
        let mut p = policy();
        let hot = vec![
            sample(1, 50.0, 20.0, 0.5, 6.0),
            sample(2, 1.0, 1.0, 1.5, 0.5),
            sample(3, 1.0, 1.0, 1.5, 0.5),
        ];
        for interval in 1..=3 {
            p.apply(interval, &hot).unwrap();
        }
        assert_eq!(p.classes.class_of(1), Some(2));

        // Interval 4 is the post-reconfiguration idle tick; afterwards the
        // task's collapsed IPC phase marks it pending and it is demoted.
        let cool = vec![
            sample(1, 50.0, 20.0, 0.1, 6.0),
            sample(2, 1.0, 1.0, 1.5, 0.5),
            sample(3, 1.0, 1.0, 1.5, 0.5),
        ];
        for interval in 4..=6 {
            p.apply(interval, &cool).unwrap();
            if p.classes.class_of(1) == Some(1) {
                break;
            }
        }
        assert_eq!(p.classes.class_of(1), Some(1));
        assert_eq!(*p.status.get(&1).unwrap(), V4Status::NonCritical);
        // Collapse row of the table: full masks everywhere.
        for clos in 1..=4 {
            assert_eq!(p.controller().get_class_mask(clos).unwrap().bits(), 0xfffff);
        }
    }

    #[test]
    fn test_verynoncr_colocated_with_two_criticals() {
        let mut p = policy();
        let batch = vec![
            sample(1, 50.0, 20.0, 0.5, 6.0),
            sample(2, 45.0, 18.0, 0.6, 5.0),
            sample(3, 0.2, 0.3, 2.0, 1.0),
            sample(4, 1.0, 1.0, 1.2, 0.5),
            sample(5, 1.0, 1.0, 1.2, 0.5),
            sample(6, 1.0, 1.0, 1.2, 0.5),
            sample(7, 1.0, 1.0, 1.2, 0.5),
        ];
        for interval in 1..=3 {
            p.apply(interval, &batch).unwrap();
        }
        assert_eq!(p.stats().critical_apps, 2);
        let c1 = p.classes.class_of(1).unwrap();
        let c2 = p.classes.class_of(2).unwrap();
        assert!(is_critical(c1) && is_critical(c2) && c1 != c2);
        // The fast, cache-indifferent task rides along in a critical
        // class instead of crowding class 1.
        let c3 = p.classes.class_of(3).unwrap();
        assert!(is_critical(c3));
        assert_eq!(*p.status.get(&3).unwrap(), V4Status::NonCritical);
    }

    #[test]
    fn test_departed_isolated_task_frees_slot() {
        let mut p = policy();
        let batch = vec![
            sample(1, 0.2, 0.3, 1.2, 8.0),
            sample(2, 1.0, 1.0, 1.5, 0.5),
            sample(3, 1.0, 1.0, 1.5, 0.5),
        ];
        for interval in 1..=3 {
            p.apply(interval, &batch).unwrap();
        }
        assert_eq!(p.iso_pool.in_use(), 1);
        p.apply(4, &batch[1..]).unwrap();
        assert_eq!(p.iso_pool.in_use(), 0);
        assert!(!p.classes.contains(1));
        assert!(!p.status.contains_key(&1));
    }
}
