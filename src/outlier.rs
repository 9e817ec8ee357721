// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Outlier detection
//!
//! Each interval the policies derive a single threshold, `limit_outlier`,
//! from the distribution of MPKI-L3 across tasks; values at or above it
//! mark critical candidates. Three strategies exist across the policy
//! family, all floored at 1.0 so an all-cache-light workload cannot
//! produce a degenerate threshold that flags everything.

use crate::rolling::QuantilePool;
use crate::rolling::RollingWindow;

pub const LIMIT_FLOOR: f64 = 1.0;

/// Mean + k·stddev over a rolling window of per-interval means. The window
/// persists across intervals; feed it one aggregate value per interval.
#[derive(Debug)]
pub struct RollingMeanStd {
    window: RollingWindow,
    k: f64,
}

impl RollingMeanStd {
    pub fn new(window_size: usize, k: f64) -> Self {
        Self {
            window: RollingWindow::new(window_size),
            k,
        }
    }

    pub fn observe(&mut self, interval_mean: f64) {
        self.window.push(interval_mean);
    }

    pub fn limit_outlier(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        Some((self.window.mean() + self.k * self.window.stddev()).max(LIMIT_FLOOR))
    }
}

/// One-shot detectors over the pooled window samples of every
/// non-excluded task. Rebuilt from scratch each interval.
pub fn pooled_mean_std(pool: &QuantilePool, k: f64) -> Option<f64> {
    let mean = pool.mean()?;
    let std = pool.stddev()?;
    Some((mean + k * std).max(LIMIT_FLOOR))
}

pub fn pooled_quantile(pool: &QuantilePool, q: f64) -> Option<f64> {
    Some(pool.quantile(q)?.max(LIMIT_FLOOR))
}
