// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The CAT policy family. Each policy is invoked once per sampling
//! interval with the full batch of task samples and owns every decision
//! from classification to mask writes; the driver only feeds it.

mod task_state;

pub mod critical_aware;
pub mod critical_v4;
pub mod no_part;
pub mod phase_aware;

use anyhow::Result;

use crate::config::Config;
use crate::config::PolicyKind;
use crate::resctrl::CacheController;
use crate::stats::IntervalStats;
use crate::stats::TaskSample;

pub use task_state::TaskState;
pub use task_state::TaskStates;

/// The default class every task starts in and returns to.
pub const DEFAULT_CLASS: u32 = 1;
/// The critical class of the two-class policy.
pub const CRITICAL_CLASS: u32 = 2;

pub trait CatPolicy {
    /// Run one interval. A hardware write failure aborts the remaining
    /// steps of the interval and surfaces here; in-memory state is never
    /// updated for a write that failed.
    fn apply(&mut self, interval: u64, tasks: &[TaskSample]) -> Result<()>;

    /// Snapshot of the last applied interval, for logs and metrics.
    fn stats(&self) -> IntervalStats;
}

pub fn build(cfg: &Config, ctl: crate::resctrl::ResctrlFs) -> Result<Box<dyn CatPolicy>> {
    Ok(match cfg.policy {
        PolicyKind::Np => Box::new(no_part::NoPart::new(cfg)),
        PolicyKind::Ca => Box::new(critical_aware::CriticalAware::new(cfg, ctl)?),
        PolicyKind::Cav4 => Box::new(critical_v4::CriticalAwareV4::new(cfg, ctl)?),
        PolicyKind::Cpa => Box::new(phase_aware::CriticalPhaseAware::new(cfg, ctl)?),
    })
}
