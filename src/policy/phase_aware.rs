// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Critical phase-aware policy
//!
//! The most complete variant. Classification is gated on IPC phase
//! changes (ICOV), interpreted through a per-class decision table: the
//! same metrics read differently depending on whether the task currently
//! sits in the default class, a critical class or an isolation class,
//! which gives the classifier hysteresis. High-miss/low-hit tasks are
//! isolated as squanderers, high-miss/high-hit/low-IPC tasks are excluded
//! as bullies, and oversized non-critical occupants are isolated as
//! greedy. On top of the partition the feedback machine arbitrates the
//! shared ways, and a one-shot "limit" squeezes a medium-IPC critical
//! task that occupies more than half the critical space, undone if its
//! next phase is worse.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use anyhow::anyhow;
use anyhow::Result;
use log::debug;
use log::info;

use crate::classes::ClassMap;
use crate::classes::ClassPool;
use crate::config::Config;
use crate::config::PartitionTable;
use crate::feedback;
use crate::feedback::Action;
use crate::feedback::Flavor;
use crate::feedback::Guards;
use crate::feedback::IpcTrend;
use crate::feedback::Phase;
use crate::outlier;
use crate::policy::CatPolicy;
use crate::policy::DEFAULT_CLASS;
use crate::policy::TaskStates;
use crate::resctrl::CacheController;
use crate::rolling::QuantilePool;
use crate::stats::IntervalStats;
use crate::stats::TaskSample;
use crate::waymask::WayMask;

const CRITICAL_CLASSES: [u32; 3] = [2, 3, 4];
const ISO_CLASSES: [u32; 2] = [5, 6];

/// Metrics at or above these mark a bully regardless of the computed
/// outlier threshold.
const BULLY_MPKI: f64 = 10.0;
const BULLY_HPKI: f64 = 10.0;
/// A task this quiet on both hit and miss rate is only holding space.
const GREEDY_PKI: f64 = 0.5;

fn is_critical(class: u32) -> bool {
    CRITICAL_CLASSES.contains(&class)
}

fn is_isolated(class: u32) -> bool {
    ISO_CLASSES.contains(&class)
}

#[derive(Debug, Clone, Copy)]
struct Row {
    pid: libc::pid_t,
    mpki: f64,
    hpki: f64,
    ipc: f64,
    occup: f64,
}

pub struct CriticalPhaseAware<C: CacheController> {
    ctl: C,
    every: u64,
    first_interval: u64,
    idle_intervals: u64,
    ipc_low: f64,
    ipc_medium: f64,
    icov: f64,
    hpki_limit: f64,
    pooled_k: f64,
    table: PartitionTable,

    states: TaskStates,
    classes: ClassMap,
    iso_pool: ClassPool,
    critical_slots: ClassPool,

    critical_apps: u32,
    prev_critical_apps: u32,
    config_dirty: bool,

    limit: bool,
    limit_task: BTreeMap<u32, bool>,
    llc_ways_space: f64,

    phase: Phase,
    expected_ipc_total: f64,
    ipc_cr_prev: f64,
    ipc_ncr_prev: f64,
    idle: bool,
    idle_count: u64,
    first_time: bool,

    last: IntervalStats,
}

impl<C: CacheController> CriticalPhaseAware<C> {
    pub fn new(cfg: &Config, ctl: C) -> Result<Self> {
        Ok(Self {
            ctl,
            every: cfg.every,
            first_interval: cfg.first_interval,
            idle_intervals: cfg.idle_intervals,
            ipc_low: cfg.thresholds.ipc_low,
            ipc_medium: cfg.thresholds.ipc_medium,
            icov: cfg.thresholds.icov,
            hpki_limit: cfg.thresholds.hpki_l3_limit,
            pooled_k: cfg.thresholds.pooled_k,
            table: cfg.partitions.clone(),
            states: TaskStates::new(cfg.window_size),
            classes: ClassMap::new(),
            iso_pool: ClassPool::new("isolation", &ISO_CLASSES),
            critical_slots: ClassPool::new("critical", &CRITICAL_CLASSES),
            critical_apps: 0,
            prev_critical_apps: 0,
            config_dirty: false,
            limit: false,
            limit_task: BTreeMap::new(),
            llc_ways_space: 0.0,
            phase: Phase::Collapsed,
            expected_ipc_total: 0.0,
            ipc_cr_prev: 0.0,
            ipc_ncr_prev: 0.0,
            idle: false,
            idle_count: cfg.idle_intervals,
            first_time: true,
            last: IntervalStats::default(),
        })
    }

    #[cfg(test)]
    pub fn controller(&self) -> &C {
        &self.ctl
    }

    /// Move a task into a free isolation class. With one occupant the
    /// class gets the narrow single mask; with two, both isolation classes
    /// share the wider pair mask. No-op when the pool is exhausted.
    fn isolate(&mut self, id: u32, pid: libc::pid_t) -> Result<()> {
        let Some(clos) = self.iso_pool.checkout() else {
            info!("No isolation class free, task {} stays in class {}",
                  id, self.classes.class_of(id).unwrap_or(DEFAULT_CLASS));
            return Ok(());
        };
        let res = (|| -> Result<()> {
            self.ctl.assign_task_to_class(clos, pid)?;
            if self.iso_pool.in_use() == 2 {
                let pair = self.table.iso_pair_mask();
                for c in ISO_CLASSES {
                    self.ctl.set_class_mask(c, pair)?;
                }
                info!("Isolation classes 5 and 6 share mask {} ({} ways)", pair, pair.ways());
            } else {
                let single = self.table.iso_single_mask();
                self.ctl.set_class_mask(clos, single)?;
                info!("Isolation class {} has mask {} ({} ways)", clos, single, single.ways());
            }
            Ok(())
        })();
        if let Err(e) = res {
            self.iso_pool.put_back(clos);
            return Err(e);
        }
        self.classes.assign(id, clos);
        info!("Task {} isolated in class {}", id, clos);
        Ok(())
    }

    /// Return an isolated task to the default class and free its slot,
    /// dropping the remaining isolation class back to the single-occupant
    /// mask if this leaves exactly one.
    fn include(&mut self, id: u32, pid: libc::pid_t) -> Result<()> {
        let clos = self
            .classes
            .class_of(id)
            .ok_or_else(|| anyhow!("include of unknown task {}", id))?;
        self.ctl.assign_task_to_class(DEFAULT_CLASS, pid)?;
        self.iso_pool.put_back(clos);
        if self.iso_pool.in_use() == 1 {
            let other = if clos == ISO_CLASSES[0] { ISO_CLASSES[1] } else { ISO_CLASSES[0] };
            self.ctl.set_class_mask(other, self.table.iso_single_mask())?;
        }
        self.classes.assign(id, DEFAULT_CLASS);
        if let Some(st) = self.states.get_mut(id) {
            st.excluded = false;
        }
        info!("Task {} returned to class {}", id, DEFAULT_CLASS);
        Ok(())
    }

    /// A limited task entered a worse phase: the squeeze did not pay off,
    /// give the ways back per the partition table.
    fn undo_limit(&mut self, id: u32, class: u32) -> Result<()> {
        info!("Limiting task {} was not good, returning its ways", id);
        self.limit_task.insert(id, false);
        self.limit = false;
        let total = self.ctl.total_ways();
        let cr = self.table.critical_mask(self.critical_apps, total);
        match self.critical_apps {
            1 => {
                let ncr = self.table.noncritical_mask(1, total);
                self.ctl.set_class_mask(DEFAULT_CLASS, ncr)?;
                self.ctl.set_class_mask(class, cr)?;
                self.llc_ways_space = cr.ways() as f64;
            }
            2 | 3 => {
                self.ctl.set_class_mask(class, cr)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Full re-partition after the critical count changed. Zero or more
    /// than three critical tasks collapses to the share-everything
    /// configuration; otherwise masks come from the per-count table and
    /// critical tasks are redistributed over the slot pool, keeping their
    /// current slot where possible.
    fn update_configuration(&mut self, status: &[(u32, bool)], pid_of: &BTreeMap<u32, libc::pid_t>) -> Result<()> {
        let old = self.prev_critical_apps;
        let new = self.critical_apps;
        info!("[UPDATE] From {} to {} critical tasks", old, new);
        self.idle_count = self.idle_intervals;
        self.limit_task.clear();
        self.config_dirty = false;
        let total = self.ctl.total_ways();

        if new == 0 || new >= 4 {
            self.phase = Phase::Collapsed;
            self.critical_apps = 0;
            self.llc_ways_space = 0.0;
            let full = WayMask::full(total);
            for clos in 1..=6 {
                self.ctl.set_class_mask(clos, full)?;
            }
            for (id, clos) in self.classes.clone().iter() {
                if is_critical(clos) {
                    if let Some(&pid) = pid_of.get(&id) {
                        self.ctl.assign_task_to_class(DEFAULT_CLASS, pid)?;
                    }
                    self.critical_slots.put_back(clos);
                    self.classes.assign(id, DEFAULT_CLASS);
                    self.limit = false;
                } else if is_isolated(clos) {
                    let excluded = self.states.get(id).map(|s| s.excluded).unwrap_or(false);
                    if !excluded {
                        if let Some(&pid) = pid_of.get(&id) {
                            self.include(id, pid)?;
                        }
                    } else {
                        info!("Squanderer task {} remains in class {}", id, clos);
                    }
                }
            }
            info!("[UPDATE] Collapsed: all critical tasks back in class {}", DEFAULT_CLASS);
            return Ok(());
        }

        self.phase = Phase::Settle(new);
        self.critical_slots.reset();

        // Keep surviving critical tasks on their current slots, then hand
        // the remaining slots to the promotions.
        let mut kept: BTreeSet<u32> = BTreeSet::new();
        for &(id, crit) in status {
            if !crit {
                continue;
            }
            let cur = self.classes.class_of(id).unwrap_or(DEFAULT_CLASS);
            if is_critical(cur) && self.critical_slots.checkout_id(cur) {
                kept.insert(id);
                self.limit_task.insert(id, false);
            }
        }
        for &(id, crit) in status {
            let pid = *pid_of
                .get(&id)
                .ok_or_else(|| anyhow!("no pid for task {}", id))?;
            if crit {
                if kept.contains(&id) {
                    continue;
                }
                let slot = self
                    .critical_slots
                    .checkout()
                    .ok_or_else(|| anyhow!("critical slot pool exhausted with {} tasks", new))?;
                self.ctl.assign_task_to_class(slot, pid)?;
                self.classes.assign(id, slot);
                self.limit_task.insert(id, false);
                info!("Task {} assigned to class {}", id, slot);
            } else {
                self.ctl.assign_task_to_class(DEFAULT_CLASS, pid)?;
                self.classes.assign(id, DEFAULT_CLASS);
                self.limit = false;
                info!("Task {} assigned to class {}", id, DEFAULT_CLASS);
            }
        }

        let ncr = self.table.noncritical_mask(new, total);
        let cr = self.table.critical_mask(new, total);
        self.ctl.set_class_mask(DEFAULT_CLASS, ncr)?;
        for clos in CRITICAL_CLASSES {
            self.ctl.set_class_mask(clos, cr)?;
        }
        info!("[UPDATE] Class 1 (non-CR) mask {} ({} ways)", ncr, ncr.ways());
        info!("[UPDATE] Classes 2,3,4 (CR) mask {} ({} ways)", cr, cr.ways());
        self.llc_ways_space = cr.ways() as f64;
        self.idle = true;
        self.limit = false;
        Ok(())
    }

    /// First-ever partition: masks by critical count, every task moved to
    /// its side.
    fn settle_first(
        &mut self,
        verdicts: &BTreeMap<u32, bool>,
        rows: &BTreeMap<u32, Row>,
    ) -> Result<(f64, f64)> {
        let total = self.ctl.total_ways();
        let n = self.critical_apps;
        let mut ipc_cr = 0.0;
        let mut ipc_ncr = 0.0;

        if !(1..=3).contains(&n) {
            self.phase = Phase::Collapsed;
            return Ok((0.0, 0.0));
        }

        let ncr = self.table.noncritical_mask(n, total);
        let cr = self.table.critical_mask(n, total);
        self.ctl.set_class_mask(DEFAULT_CLASS, ncr)?;
        for clos in CRITICAL_CLASSES {
            self.ctl.set_class_mask(clos, cr)?;
        }
        info!("Class 1 (non-CR) now has mask {} ({} ways)", ncr, ncr.ways());
        info!("Critical classes now have mask {} ({} ways)", cr, cr.ways());
        self.llc_ways_space = cr.ways() as f64;
        self.phase = Phase::Settle(n);
        self.first_time = false;
        self.idle = true;
        self.idle_count = self.idle_intervals;

        for (&id, &crit) in verdicts {
            let Some(row) = rows.get(&id) else { continue };
            let class = self.classes.class_of(id).unwrap_or(DEFAULT_CLASS);
            if crit {
                let slot = self
                    .critical_slots
                    .checkout()
                    .ok_or_else(|| anyhow!("critical slot pool exhausted"))?;
                self.ctl.assign_task_to_class(slot, row.pid)?;
                self.classes.assign(id, slot);
                self.limit_task.insert(id, false);
                info!("Task {} assigned to class {}", id, slot);
                ipc_cr += row.ipc;
            } else if !is_isolated(class) {
                self.ctl.assign_task_to_class(DEFAULT_CLASS, row.pid)?;
                self.classes.assign(id, DEFAULT_CLASS);
                ipc_ncr += row.ipc;
            } else {
                debug!("Task {} stays isolated in class {}", id, class);
                ipc_ncr += row.ipc;
            }
        }
        Ok((ipc_cr, ipc_ncr))
    }

    /// The per-class decision table over the tasks whose phase changed.
    /// Returns the verdicts and whether the critical set changed.
    fn classify(
        &mut self,
        ids: &[u32],
        rows: &BTreeMap<u32, Row>,
        limit_outlier: f64,
    ) -> Result<(BTreeMap<u32, bool>, bool)> {
        let mut verdicts = BTreeMap::new();
        let mut change = false;

        let ncr_ways = self.ctl.get_class_mask(DEFAULT_CLASS)?.ways();
        // A non-critical occupant larger than a third of the non-critical
        // space (capped at 3 MB) with no cache activity is greedy.
        let limit_space = ((ncr_ways / 3) as f64).min(3.0);

        for &id in ids {
            let Some(row) = rows.get(&id).copied() else { continue };
            let class = self.classes.class_of(id).unwrap_or(DEFAULT_CLASS);
            let Row { pid, mpki, hpki, ipc, occup } = row;
            let is_bully = mpki >= BULLY_MPKI && hpki >= BULLY_HPKI && ipc <= self.ipc_low;

            if class == DEFAULT_CLASS {
                if is_bully {
                    info!("Task {} is a bully: excluded, stays in class 1", id);
                    self.states.get_mut(id).unwrap().excluded = true;
                    verdicts.insert(id, false);
                } else if mpki >= limit_outlier && hpki < self.hpki_limit {
                    info!("Task {} misses a lot but hits little: squanderer", id);
                    self.states.get_mut(id).unwrap().excluded = true;
                    self.isolate(id, pid)?;
                    verdicts.insert(id, false);
                } else {
                    if mpki >= limit_outlier && hpki >= self.hpki_limit && ipc <= self.ipc_medium {
                        info!(
                            "Task {} is critical: MPKI {:.2} >= {:.2}, HPKI {:.2} >= {:.2}",
                            id, mpki, limit_outlier, hpki, self.hpki_limit
                        );
                        verdicts.insert(id, true);
                        self.critical_apps += 1;
                        change = true;
                    } else if occup > limit_space && hpki < GREEDY_PKI && mpki < GREEDY_PKI {
                        info!("Task {} occupies {:.2}MB doing nothing: greedy", id, occup);
                        self.isolate(id, pid)?;
                        verdicts.insert(id, false);
                    } else {
                        debug!("Task {} is still non-critical", id);
                        verdicts.insert(id, false);
                    }
                    let st = self.states.get_mut(id).unwrap();
                    if st.excluded {
                        st.excluded = false;
                        st.reseed_window(mpki);
                    }
                }
            } else if is_critical(class) {
                if hpki > mpki && mpki < limit_outlier {
                    debug!("Critical task {} is profitable, stays critical", id);
                    verdicts.insert(id, true);
                } else if is_bully {
                    info!("Critical task {} is a bully: excluded, demoted", id);
                    self.states.get_mut(id).unwrap().excluded = true;
                    verdicts.insert(id, false);
                    self.critical_apps -= 1;
                    change = true;
                } else if mpki >= limit_outlier && hpki >= self.hpki_limit {
                    debug!("Task {} is still critical", id);
                    verdicts.insert(id, true);
                } else if mpki >= limit_outlier && hpki < self.hpki_limit {
                    info!("Critical task {} no longer hits: squanderer", id);
                    self.states.get_mut(id).unwrap().excluded = true;
                    self.isolate(id, pid)?;
                    if self.classes.class_of(id) != Some(class) {
                        // The move succeeded, so the critical slot is free;
                        // with the pool exhausted the re-partition below
                        // handles the demotion instead.
                        self.critical_slots.put_back(class);
                    }
                    verdicts.insert(id, false);
                    self.critical_apps -= 1;
                    change = true;
                } else {
                    info!("Task {} is no longer critical", id);
                    verdicts.insert(id, false);
                    self.critical_apps -= 1;
                    change = true;
                }
            } else if is_isolated(class) {
                if is_bully {
                    info!("Isolated task {} is a bully: back to class 1, excluded", id);
                    self.states.get_mut(id).unwrap().excluded = true;
                    self.include(id, pid)?;
                    verdicts.insert(id, false);
                } else if mpki >= limit_outlier && hpki < self.hpki_limit {
                    debug!("Task {} is still a squanderer", id);
                    self.states.get_mut(id).unwrap().excluded = true;
                    verdicts.insert(id, false);
                } else {
                    if mpki >= limit_outlier && hpki >= self.hpki_limit && ipc <= self.ipc_medium {
                        info!("Isolated task {} turned critical", id);
                        self.include(id, pid)?;
                        verdicts.insert(id, true);
                        self.critical_apps += 1;
                        change = true;
                    } else if hpki < GREEDY_PKI && mpki < GREEDY_PKI {
                        debug!("Task {} is still greedy", id);
                        verdicts.insert(id, false);
                    } else {
                        info!("Isolated task {} is ordinary again: back to class 1", id);
                        self.include(id, pid)?;
                        verdicts.insert(id, false);
                    }
                    let st = self.states.get_mut(id).unwrap();
                    if st.excluded {
                        st.excluded = false;
                        st.reseed_window(mpki);
                    }
                }
            }
        }
        Ok((verdicts, change))
    }

    /// One-shot space limit: a critical task with medium IPC holding at
    /// least half the critical way space gets its class squeezed.
    fn limit_step(&mut self, llc_critical: &[(u32, f64)], rows: &BTreeMap<u32, Row>) -> Result<bool> {
        for &(id, occup) in llc_critical {
            if self.limit_task.get(&id).copied().unwrap_or(false) {
                continue;
            }
            if occup < self.llc_ways_space / 2.0 {
                continue;
            }
            let Some(row) = rows.get(&id) else { continue };
            if row.ipc < self.ipc_medium {
                debug!("Task {} holds {:.2}MB but IPC {:.2} does not warrant a limit", id, occup, row.ipc);
                continue;
            }
            let class = self.classes.class_of(id).unwrap_or(DEFAULT_CLASS);
            info!("Task {} shows medium behavior, limiting class {}", id, class);
            if self.critical_apps < 3 && !self.limit {
                let ways = feedback::divide_half_ways_critical(
                    &mut self.ctl,
                    class,
                    self.critical_apps,
                    DEFAULT_CLASS,
                )?;
                if self.critical_apps == 1 {
                    self.llc_ways_space = ways as f64;
                }
            } else if self.critical_apps == 3 {
                feedback::divide_3_critical(&mut self.ctl, class, self.limit)?;
            } else {
                continue;
            }
            self.limit_task.insert(id, true);
            self.limit = true;
            return Ok(true);
        }
        Ok(false)
    }

    fn feedback_step(&mut self, ipc_total: f64, ipc_cr: f64, ipc_ncr: f64) -> Result<()> {
        let trend = feedback::observe(
            ipc_total,
            self.expected_ipc_total,
            ipc_cr,
            self.ipc_cr_prev,
            ipc_ncr,
            self.ipc_ncr_prev,
        );
        if trend == IpcTrend::Better {
            info!("New IPC is better, {} idle intervals", self.idle_intervals);
        } else {
            let (next, action) = feedback::transition(self.phase, trend, Flavor::PhaseAware);
            self.phase = next;
            let ncr_tasks = self.classes.count_in(DEFAULT_CLASS) as u32;
            let guards = Guards {
                ncr_way_floor: ncr_tasks.max(self.ctl.min_ways()),
                cr_way_ceiling: (self.ctl.total_ways() + 2).saturating_sub(ncr_tasks),
            };
            let applied = feedback::execute(
                &mut self.ctl,
                action,
                DEFAULT_CLASS,
                &CRITICAL_CLASSES,
                guards,
            )?;
            if applied {
                match action {
                    Action::ShrinkCritical => self.llc_ways_space -= 1.0,
                    Action::GrowCritical => self.llc_ways_space += 1.0,
                    _ => {}
                }
            }
        }
        // Every feedback interval is followed by a cooldown so the next
        // comparison sees a settled configuration.
        self.idle = true;
        self.idle_count = self.idle_intervals;
        Ok(())
    }
}

impl<C: CacheController> CatPolicy for CriticalPhaseAware<C> {
    fn apply(&mut self, interval: u64, tasks: &[TaskSample]) -> Result<()> {
        if interval % self.every != 0 {
            return Ok(());
        }

        // Step 1: ingest samples, update histories, resolve membership.
        let active: BTreeSet<u32> = tasks.iter().map(|t| t.id).collect();
        for id in self.states.prune(&active) {
            debug!("Task {} departed, state pruned", id);
            self.limit_task.remove(&id);
        }
        for (id, class) in self.classes.prune(&active) {
            if is_isolated(class) {
                self.iso_pool.put_back(class);
                if self.iso_pool.in_use() == 1 {
                    let other = if class == ISO_CLASSES[0] { ISO_CLASSES[1] } else { ISO_CLASSES[0] };
                    self.ctl.set_class_mask(other, self.table.iso_single_mask())?;
                }
            } else if is_critical(class) {
                self.critical_slots.put_back(class);
                self.critical_apps = self.critical_apps.saturating_sub(1);
                self.config_dirty = true;
                info!("Critical task {} departed, re-partition pending", id);
            }
        }

        let mut rows: BTreeMap<u32, Row> = BTreeMap::new();
        let mut pid_of: BTreeMap<u32, libc::pid_t> = BTreeMap::new();
        let mut phase_changed: BTreeSet<u32> = BTreeSet::new();
        let mut ipc_total = 0.0;
        let mut l3_occup_total = 0.0;

        for task in tasks {
            pid_of.insert(task.id, task.pid);
            l3_occup_total += task.llc_occup_mb;
            ipc_total += task.ipc;
            let mpki = task.mpki_l3();
            let hpki = task.hpki_l3();

            if !self.states.contains(task.id) {
                self.ctl.assign_task_to_class(DEFAULT_CLASS, task.pid)?;
                self.states.insert_new(task.id, mpki, task.ipc);
                self.classes.assign(task.id, DEFAULT_CLASS);
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
            debug!(
                "Task {} ({}): IPC = {:.3}, HPKI = {:.3}, MPKI = {:.3}, occup {:.2}MB",
                task.name, task.id, task.ipc, hpki, mpki, task.llc_occup_mb
            );

            let class = self.classes.class_of(task.id).unwrap_or(DEFAULT_CLASS);
            let obs = self
                .states
                .get_mut(task.id)
                .unwrap()
                .observe_phase(task.ipc, self.icov);
            debug!("Task {}: icov = {:.3} ({:.3})", task.id, obs.icov, task.ipc);
            if obs.phase_changed {
                phase_changed.insert(task.id);
                if self.limit_task.get(&task.id).copied().unwrap_or(false)
                    && task.ipc < self.ipc_medium
                    && is_critical(class)
                {
                    self.undo_limit(task.id, class)?;
                }
            } else if interval == self.first_interval {
                phase_changed.insert(task.id);
            }
            let st = self.states.get_mut(task.id).unwrap();
            if !st.excluded {
                st.window.push(mpki);
            }
        }

        // Step 2: warm-up gate.
        if interval < self.first_interval {
            self.last = IntervalStats {
                interval,
                nr_tasks: tasks.len(),
                ipc_total,
                l3_occup_mb_total: l3_occup_total,
                ..Default::default()
            };
            return Ok(());
        }

        // Step 3: the outlier threshold from the pooled windows.
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
        let Some(limit_outlier) = outlier::pooled_mean_std(&pool, self.pooled_k) else {
            info!("No usable samples this interval, classification skipped");
            return Ok(());
        };
        debug!("limit_outlier = {:.3}", limit_outlier);

        // Step 4: the decision table over phase-changed tasks.
        let ids: Vec<u32> = phase_changed.into_iter().collect();
        let (mut verdicts, mut change) = self.classify(&ids, &rows, limit_outlier)?;
        change |= self.config_dirty;

        // Unchanged tasks keep their side; collect critical occupancy.
        let mut llc_critical: Vec<(u32, f64)> = Vec::new();
        for (id, class) in self.classes.iter() {
            if is_critical(class) {
                verdicts.entry(id).or_insert(true);
                if let Some(row) = rows.get(&id) {
                    llc_critical.push((id, row.occup));
                }
            } else {
                verdicts.entry(id).or_insert(false);
            }
        }
        info!("critical_apps = {}", self.critical_apps);

        let mut ipc_cr = 0.0;
        let mut ipc_ncr = 0.0;

        if self.first_time {
            let (cr, ncr) = self.settle_first(&verdicts, &rows)?;
            ipc_cr = cr;
            ipc_ncr = ncr;
        } else {
            let mut status: Vec<(u32, bool)> = Vec::new();
            for (&id, &crit) in &verdicts {
                let class = self.classes.class_of(id).unwrap_or(DEFAULT_CLASS);
                let ipc = rows.get(&id).map(|r| r.ipc).unwrap_or(0.0);
                if crit && !is_critical(class) {
                    info!("New critical task {} (currently class {})", id, class);
                    status.push((id, true));
                    change = true;
                    ipc_cr += ipc;
                } else if !crit && is_critical(class) {
                    info!("Task {} is no longer critical", id);
                    status.push((id, false));
                    change = true;
                    ipc_ncr += ipc;
                } else if crit {
                    status.push((id, true));
                    ipc_cr += ipc;
                } else {
                    ipc_ncr += ipc;
                }
            }

            if change {
                self.update_configuration(&status, &pid_of)?;
            } else {
                // Step 5: the one-shot space limit.
                let mut change_critical = false;
                if (1..=3).contains(&self.critical_apps) {
                    change_critical = self.limit_step(&llc_critical, &rows)?;
                }
                // Step 6: cooldown, then the hill climb.
                if self.idle {
                    debug!("Idle interval, {} remaining", self.idle_count);
                    self.idle_count -= 1;
                    if self.idle_count == 0 {
                        self.idle = false;
                        self.idle_count = self.idle_intervals;
                    }
                } else if !change_critical && (1..=3).contains(&self.critical_apps) {
                    self.feedback_step(ipc_total, ipc_cr, ipc_ncr)?;
                }
            }
        }

        let num_shared = feedback::num_shared_ways(&self.ctl, CRITICAL_CLASSES[0], DEFAULT_CLASS)?;

        // Step 7: baselines for the next interval's comparisons.
        self.ipc_cr_prev = ipc_cr;
        self.ipc_ncr_prev = ipc_ncr;
        self.expected_ipc_total = ipc_total;
        self.prev_critical_apps = self.critical_apps;
        self.last = IntervalStats {
            interval,
            nr_tasks: tasks.len(),
            critical_apps: self.critical_apps,
            isolated_apps: self.iso_pool.in_use() as u32,
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

    fn policy() -> CriticalPhaseAware<FakeController> {
        let mut cfg = Config::default();
        cfg.first_interval = 3;
        cfg.idle_intervals = 2;
        CriticalPhaseAware::new(&cfg, FakeController::new(20, 8)).unwrap()
    }

    fn light(id: u32) -> TaskSample {
        sample(id, 1.0, 1.0, 1.5, 0.5)
    }

    #[test]
    fn test_single_critical_task_partitions_at_n1() {
        let mut p = policy();
        // One cache-hungry task among three light ones; pooled mean+1.5σ
        // flags it once the warm-up passes.
        let batch = vec![
            sample(1, 50.0, 20.0, 0.5, 6.0),
            light(2),
            light(3),
            light(4),
        ];
        for interval in 1..=3 {
            p.apply(interval, &batch).unwrap();
        }
        assert_eq!(p.critical_apps, 1);
        // The critical task sits in a class of its own, distinct from 1.
        let class = p.classes.class_of(1).unwrap();
        assert!(is_critical(class));
        assert_eq!(p.controller().task_class[&1001], class);
        // Masks match the one-critical table entry (60%/50%).
        assert_eq!(p.controller().get_class_mask(class).unwrap().bits(), 0xfff00);
        assert_eq!(p.controller().get_class_mask(1).unwrap().bits(), 0x003ff);
        assert_eq!(p.stats().critical_apps, 1);
    }

    #[test]
    fn test_boundary_oscillation_without_phase_change_is_ignored() {
        let mut p = policy();
        let batch = vec![
            sample(1, 50.0, 20.0, 0.5, 6.0),
            light(2),
            light(3),
            light(4),
        ];
        for interval in 1..=3 {
            p.apply(interval, &batch).unwrap();
        }
        let class_before = p.classes.class_of(1).unwrap();

        // MPKI oscillates around the threshold but IPC stays flat, so no
        // phase change qualifies task 1 for reclassification.
        for interval in 4..=10 {
            let mpki = if interval % 2 == 0 { 3.0 } else { 60.0 };
            let wobble = vec![
                sample(1, mpki, 20.0, 0.5, 6.0),
                light(2),
                light(3),
                light(4),
            ];
            p.apply(interval, &wobble).unwrap();
            assert_eq!(p.classes.class_of(1).unwrap(), class_before);
            assert_eq!(p.critical_apps, 1);
        }
    }

    #[test]
    fn test_bullies_stay_in_default_class_without_isolation() {
        let mut p = policy();
        // Two bullies: high miss and hit rate, low IPC.
        let batch = vec![
            sample(1, 50.0, 20.0, 0.4, 6.0),
            sample(2, 50.0, 20.0, 0.4, 6.0),
            light(3),
            light(4),
        ];
        for interval in 1..=3 {
            p.apply(interval, &batch).unwrap();
        }
        assert_eq!(p.classes.class_of(1), Some(1));
        assert_eq!(p.classes.class_of(2), Some(1));
        assert_eq!(p.iso_pool.in_use(), 0);
        assert_eq!(p.critical_apps, 0);
        assert!(p.states.get(1).unwrap().excluded);
        assert!(p.states.get(2).unwrap().excluded);
    }

    #[test]
    fn test_squanderers_isolated_up_to_pool_capacity() {
        let mut p = policy();
        let quiet = |id| sample(id, 0.1, 0.2, 1.5, 0.5);
        let squander = |id| sample(id, 50.0, 0.1, 0.5, 4.0);

        // One squanderer among seven quiet tasks: outlier MPKI, no hits.
        let mut batch = vec![squander(1)];
        batch.extend([2, 3, 4, 5, 6, 7, 8].map(quiet));
        for interval in 1..=3 {
            p.apply(interval, &batch).unwrap();
        }
        assert_eq!(p.classes.class_of(1), Some(5));
        assert_eq!(p.iso_pool.in_use(), 1);
        // Single occupant gets the narrow mask.
        assert_eq!(p.controller().get_class_mask(5).unwrap().bits(), 0x3);
        assert!(p.states.get(1).unwrap().excluded);

        // Task 2 turns squanderer: its IPC drop is a phase change, and
        // with task 1's window out of the distribution the threshold
        // catches it. Both isolation classes now share the pair mask.
        batch[1] = squander(2);
        p.apply(4, &batch).unwrap();
        assert_eq!(p.classes.class_of(2), Some(6));
        assert_eq!(p.iso_pool.in_use(), 2);
        assert_eq!(p.controller().get_class_mask(5).unwrap().bits(), 0xf);
        assert_eq!(p.controller().get_class_mask(6).unwrap().bits(), 0xf);

        // Task 3 turns squanderer with the pool exhausted: it stays in
        // the default class and consumes no slot.
        batch[2] = squander(3);
        p.apply(5, &batch).unwrap();
        assert_eq!(p.classes.class_of(3), Some(1));
        assert_eq!(p.iso_pool.in_use(), 2);
    }

    #[test]
    fn test_demotion_collapses_to_full_masks() {
        let mut p = policy();
        let hot = vec![
            sample(1, 50.0, 20.0, 0.5, 6.0),
            light(2),
            light(3),
            light(4),
        ];
        for interval in 1..=3 {
            p.apply(interval, &hot).unwrap();
        }
        assert_eq!(p.critical_apps, 1);

        // The task enters a clearly better phase: profitable rule no
        // longer applies (mpki still above threshold is required to stay),
        // here it cools completely and the phase change demotes it.
        let cool = vec![
            sample(1, 0.1, 0.05, 2.0, 1.0),
            light(2),
            light(3),
            light(4),
        ];
        for interval in 4..=8 {
            p.apply(interval, &cool).unwrap();
            if p.critical_apps == 0 {
                break;
            }
        }
        assert_eq!(p.critical_apps, 0);
        assert_eq!(p.classes.class_of(1), Some(1));
        for clos in 1..=6 {
            assert_eq!(p.controller().get_class_mask(clos).unwrap().bits(), 0xfffff);
        }
        assert_eq!(p.critical_slots.free(), 3);
    }

    #[test]
    fn test_update_configuration_same_count_is_idempotent() {
        let mut p = policy();
        let batch = vec![
            sample(1, 50.0, 20.0, 0.5, 6.0),
            light(2),
            light(3),
            light(4),
        ];
        for interval in 1..=3 {
            p.apply(interval, &batch).unwrap();
        }
        let classes_before: Vec<(u32, u32)> = p.classes.iter().collect();
        let masks_before = p.controller().masks.clone();

        // Re-partition with an unchanged critical set.
        let pid_of: BTreeMap<u32, libc::pid_t> =
            batch.iter().map(|t| (t.id, t.pid)).collect();
        let status = vec![(1u32, true)];
        p.update_configuration(&status, &pid_of).unwrap();

        let classes_after: Vec<(u32, u32)> = p.classes.iter().collect();
        assert_eq!(classes_before, classes_after);
        assert_eq!(masks_before, p.controller().masks);
    }

    #[test]
    fn test_departed_critical_task_releases_slot_and_repartitions() {
        let mut p = policy();
        let batch = vec![
            sample(1, 50.0, 20.0, 0.5, 6.0),
            light(2),
            light(3),
            light(4),
        ];
        for interval in 1..=3 {
            p.apply(interval, &batch).unwrap();
        }
        assert_eq!(p.critical_slots.in_use(), 1);

        // The critical task exits; its slot returns and the partition
        // collapses on the next interval.
        let remaining = vec![light(2), light(3), light(4)];
        p.apply(4, &remaining).unwrap();
        assert_eq!(p.critical_slots.in_use(), 0);
        assert_eq!(p.critical_apps, 0);
        assert!(!p.classes.contains(1));
        assert_eq!(p.controller().get_class_mask(1).unwrap().bits(), 0xfffff);
    }

    #[test]
    fn test_write_failure_propagates() {
        let mut p = policy();
        let batch = vec![
            sample(1, 50.0, 20.0, 0.5, 6.0),
            light(2),
            light(3),
            light(4),
        ];
        p.apply(1, &batch).unwrap();
        p.ctl.fail_writes = true;
        assert!(p.apply(3, &batch).is_err());
    }

    #[test]
    fn test_single_ownership_invariant_over_a_noisy_run() {
        let mut p = policy();
        for interval in 1..=30 {
            let mut batch = vec![
                sample(1, if interval % 5 == 0 { 60.0 } else { 45.0 }, 18.0, 0.5, 6.0),
                sample(2, 50.0, 0.1, 1.2, 4.0),
                light(3),
                light(4),
                light(5),
            ];
            if interval % 7 == 0 {
                // Short-lived tasks churn through; ids are never reused.
                batch.push(sample(100 + interval as u32, 30.0, 12.0, 0.8, 3.0));
            }
            p.apply(interval, &batch).unwrap();

            // Exactly one class per known task, and isolation never
            // exceeds its pool.
            let mut seen = BTreeSet::new();
            for (id, class) in p.classes.iter() {
                assert!(seen.insert(id));
                assert!((1..=6).contains(&class));
            }
            assert!(p.iso_pool.in_use() <= 2);
            assert_eq!(
                p.classes.iter().filter(|(_, c)| is_isolated(*c)).count(),
                p.iso_pool.in_use()
            );
        }
    }
}
