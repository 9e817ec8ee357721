// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-task history kept across intervals: the MPKI-L3 sliding window that
//! feeds the outlier distribution, the phase accumulator behind the ICOV
//! gate, and the exclusion bookkeeping for bullies and squanderers.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::rolling::RollingWindow;

#[derive(Debug)]
pub struct TaskState {
    /// Recent valid MPKI-L3 samples. Frozen while the task is excluded so
    /// bully spikes cannot contaminate the global distribution.
    pub window: RollingWindow,
    /// IPC accumulated since the last phase change.
    pub phase_sum_ipc: f64,
    pub phase_duration: u64,
    pub phase_count: u64,
    pub prev_ipc: f64,
    /// Excluded tasks contribute nothing to the outlier distribution.
    pub excluded: bool,
    pub bully_strikes: u32,
    /// Pending worse-phase verdict awaiting the next classification pass.
    pub phase_change_pending: bool,
    pub in_good_phase: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct PhaseObservation {
    pub icov: f64,
    pub phase_changed: bool,
}

impl TaskState {
    fn new(window_size: usize, mpki: Option<f64>, ipc: f64) -> Self {
        let mut window = RollingWindow::new(window_size);
        if let Some(m) = mpki {
            window.push(m);
        }
        Self {
            window,
            phase_sum_ipc: ipc,
            phase_duration: 1,
            phase_count: 1,
            prev_ipc: ipc,
            excluded: false,
            bully_strikes: 0,
            phase_change_pending: false,
            in_good_phase: false,
        }
    }

    /// Fold this interval's IPC into the phase accumulator and compute the
    /// instability coefficient: the current IPC's distance from the phase
    /// average excluding it, normalized by the running average. Crossing
    /// `icov_threshold` starts a new phase.
    pub fn observe_phase(&mut self, ipc: f64, icov_threshold: f64) -> PhaseObservation {
        self.phase_sum_ipc += ipc;
        self.phase_duration += 1;
        let avg = self.phase_sum_ipc / self.phase_duration as f64;
        let prev_avg = (self.phase_sum_ipc - ipc) / (self.phase_duration - 1) as f64;
        let icov = if avg > 0.0 { (ipc - prev_avg).abs() / avg } else { 0.0 };
        let phase_changed = icov >= icov_threshold;
        if phase_changed {
            self.phase_count += 1;
            self.phase_duration = 1;
            self.phase_sum_ipc = ipc;
        }
        PhaseObservation { icov, phase_changed }
    }

    /// Clear the frozen window when a task stops being excluded, seeding
    /// it with the current sample so stale spikes do not linger.
    pub fn reseed_window(&mut self, mpki: f64) {
        self.window.clear();
        self.window.push(mpki);
    }
}

/// All per-task state, keyed by the stable synthetic task id. Ids are
/// never recycled across restarts, so an entry can only ever describe one
/// task; entries are pruned the interval their id disappears.
#[derive(Debug)]
pub struct TaskStates {
    map: BTreeMap<u32, TaskState>,
    window_size: usize,
}

impl TaskStates {
    pub fn new(window_size: usize) -> Self {
        Self {
            map: BTreeMap::new(),
            window_size,
        }
    }

    pub fn contains(&self, id: u32) -> bool {
        self.map.contains_key(&id)
    }

    pub fn get(&self, id: u32) -> Option<&TaskState> {
        self.map.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut TaskState> {
        self.map.get_mut(&id)
    }

    pub fn insert_new(&mut self, id: u32, mpki: Option<f64>, ipc: f64) {
        self.map.insert(id, TaskState::new(self.window_size, mpki, ipc));
    }

    /// Drop state for every id not in `active`, returning what was pruned.
    pub fn prune(&mut self, active: &BTreeSet<u32>) -> Vec<u32> {
        let gone: Vec<u32> = self.map.keys().filter(|id| !active.contains(id)).copied().collect();
        for id in &gone {
            self.map.remove(id);
        }
        gone
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &TaskState)> {
        self.map.iter().map(|(&id, st)| (id, st))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}
