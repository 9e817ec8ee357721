// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Small rolling-statistics helpers shared by the outlier detectors: a
//! bounded window with incremental mean/variance, and a sorted pool for
//! quantile lookups.

use std::collections::VecDeque;

use ordered_float::OrderedFloat;
use sorted_vec::SortedVec;

/// Fixed-capacity sliding window with O(1) mean and variance. The oldest
/// value is evicted on insert once the window is full.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    capacity: usize,
    values: VecDeque<f64>,
    sum: f64,
    sum_sq: f64,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity),
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    pub fn push(&mut self, val: f64) {
        if self.values.len() == self.capacity {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
                self.sum_sq -= old * old;
            }
        }
        self.values.push_back(val);
        self.sum += val;
        self.sum_sq += val * val;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.sum = 0.0;
        self.sum_sq = 0.0;
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            0.0
        } else {
            self.sum / self.values.len() as f64
        }
    }

    /// Population variance. Floating error can push the incremental form
    /// slightly negative, so clamp.
    pub fn variance(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let n = self.values.len() as f64;
        let mean = self.sum / n;
        (self.sum_sq / n - mean * mean).max(0.0)
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().copied()
    }
}

/// One interval's worth of pooled samples, kept sorted so quantiles are a
/// single index away.
#[derive(Debug)]
pub struct QuantilePool {
    values: SortedVec<OrderedFloat<f64>>,
    sum: f64,
    sum_sq: f64,
}

impl QuantilePool {
    pub fn new() -> Self {
        Self {
            values: SortedVec::new(),
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    pub fn push(&mut self, val: f64) {
        self.values.insert(OrderedFloat(val));
        self.sum += val;
        self.sum_sq += val * val;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The q-quantile (0.0 ..= 1.0) by lower index, matching a sorted
    /// multiset walked to `floor(len * q)`.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        let idx = ((self.values.len() as f64 * q) as usize).min(self.values.len() - 1);
        Some(self.values[idx].0)
    }

    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            None
        } else {
            Some(self.sum / self.values.len() as f64)
        }
    }

    pub fn stddev(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        let n = self.values.len() as f64;
        let mean = self.sum / n;
        Some((self.sum_sq / n - mean * mean).max(0.0).sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive_stats(vals: &[f64]) -> (f64, f64) {
        let n = vals.len() as f64;
        let mean = vals.iter().sum::<f64>() / n;
        let var = vals.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
        (mean, var)
    }

    #[test]
    fn test_window_eviction() {
        let mut w = RollingWindow::new(3);
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            w.push(v);
        }
        assert_eq!(w.len(), 3);
        let (mean, var) = naive_stats(&[3.0, 4.0, 5.0]);
        assert!((w.mean() - mean).abs() < 1e-9);
        assert!((w.variance() - var).abs() < 1e-9);
    }

    #[test]
    fn test_window_matches_naive_after_wraparound() {
        let vals: Vec<f64> = (0..57).map(|i| (i as f64 * 0.37).sin() * 10.0).collect();
        let mut w = RollingWindow::new(10);
        for &v in &vals {
            w.push(v);
        }
        let tail = &vals[vals.len() - 10..];
        let (mean, var) = naive_stats(tail);
        assert!((w.mean() - mean).abs() < 1e-6);
        assert!((w.variance() - var).abs() < 1e-6);
    }

    #[test]
    fn test_empty_window() {
        let w = RollingWindow::new(4);
        assert!(w.is_empty());
        assert_eq!(w.mean(), 0.0);
        assert_eq!(w.variance(), 0.0);
    }

    #[test]
    fn test_quantile() {
        let mut p = QuantilePool::new();
        assert_eq!(p.quantile(0.75), None);
        for v in [5.0, 1.0, 3.0, 2.0] {
            p.push(v);
        }
        assert_eq!(p.quantile(0.75), Some(5.0));
        assert_eq!(p.quantile(0.0), Some(1.0));
        assert_eq!(p.quantile(1.0), Some(5.0));
    }
}
