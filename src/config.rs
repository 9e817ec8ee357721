// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! TOML configuration: policy selection, classification thresholds and the
//! partition mask tables. Every value has a compiled-in default mirroring
//! the behavior the policies were tuned with, so an empty file (or none at
//! all) is a valid configuration. Everything is validated up front;
//! nothing in the policy loops re-checks these.

use std::fs;
use std::path::Path;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::waymask::WayMask;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// Observation only, no mask writes.
    Np,
    /// Critical-aware: rolling-threshold, two classes.
    Ca,
    /// Critical-aware v4: quantile threshold, exclusive isolation.
    Cav4,
    /// Critical phase-aware: the full decision table.
    Cpa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NpStatsMode {
    /// Per-interval IPC.
    Interval,
    /// Run-cumulative IPC.
    Total,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignMode {
    /// Move pids between classes (resctrl `tasks` files).
    Task,
    /// Pin whole CPUs to classes instead; used with core-partitioned runs.
    Cpu,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Thresholds {
    /// IPC at or below this marks a bully candidate.
    pub ipc_low: f64,
    /// IPC at or below this is required for promotion to critical; at or
    /// above it a space-limited critical task counts as "medium".
    pub ipc_medium: f64,
    /// ICOV above this is a phase change; classification is only
    /// re-evaluated on phase changes.
    pub icov: f64,
    /// HPKI-L3 below this makes a high-MPKI task a squanderer.
    pub hpki_l3_limit: f64,
    /// Stddev multiplier for the rolling detector (`ca`).
    pub rolling_k: f64,
    /// Stddev multiplier for the pooled detector (`cpa`).
    pub pooled_k: f64,
    /// Quantile for the pooled detector (`cav4`).
    pub quantile: f64,
    /// `cav4` only: IPC above this disqualifies a task from critical
    /// status regardless of miss rate.
    pub v4_ipc_good: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            ipc_low: 0.4,
            ipc_medium: 1.0,
            icov: 0.5,
            hpki_l3_limit: 5.0,
            rolling_k: 3.0,
            pooled_k: 1.5,
            quantile: 0.75,
            v4_ipc_good: 1.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheGeometry {
    pub total_ways: u32,
    pub min_ways: u32,
    pub max_classes: usize,
}

impl Default for CacheGeometry {
    fn default() -> Self {
        Self {
            total_ways: 20,
            min_ways: 2,
            max_classes: 8,
        }
    }
}

/// Way split for one supported critical-task count. Critical ways anchor
/// at the top of the cache, non-critical at the bottom; the sums exceed
/// the total on purpose (the excess is the shared region the feedback
/// loop arbitrates).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PartitionPair {
    pub critical_ways: u32,
    pub noncritical_ways: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PartitionTable {
    /// Indexed by critical count 1..=3.
    pub pairs: [PartitionPair; 3],
    /// Isolation class width with a single occupant.
    pub iso_single_ways: u32,
    /// Width shared by both isolation classes with two occupants.
    pub iso_pair_ways: u32,
}

impl Default for PartitionTable {
    fn default() -> Self {
        Self {
            // 60%/50%, 65%/45%, 70%/40% of a 20-way cache.
            pairs: [
                PartitionPair { critical_ways: 12, noncritical_ways: 10 },
                PartitionPair { critical_ways: 13, noncritical_ways: 9 },
                PartitionPair { critical_ways: 14, noncritical_ways: 8 },
            ],
            iso_single_ways: 2,
            iso_pair_ways: 4,
        }
    }
}

impl PartitionTable {
    pub fn critical_mask(&self, critical_apps: u32, total: u32) -> WayMask {
        let ways = self.pairs[critical_apps as usize - 1].critical_ways;
        WayMask::new(total - ways, ways).expect("validated at load")
    }

    pub fn noncritical_mask(&self, critical_apps: u32, _total: u32) -> WayMask {
        let ways = self.pairs[critical_apps as usize - 1].noncritical_ways;
        WayMask::new(0, ways).expect("validated at load")
    }

    pub fn iso_single_mask(&self) -> WayMask {
        WayMask::new(0, self.iso_single_ways).expect("validated at load")
    }

    pub fn iso_pair_mask(&self) -> WayMask {
        WayMask::new(0, self.iso_pair_ways).expect("validated at load")
    }
}

/// The v4 layout is table-driven per class rather than a single split:
/// each critical count maps to explicit masks for classes 1..=4, and the
/// three isolation classes own small exclusive regions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct V4Table {
    pub count1: [u64; 4],
    pub count2: [u64; 4],
    pub count3: [u64; 4],
    pub iso_masks: [u64; 3],
}

impl Default for V4Table {
    fn default() -> Self {
        Self {
            count1: [0x001ff, 0xfff80, 0xfffff, 0xfffff],
            count2: [0x0000f, 0xff800, 0x01ff0, 0xfffff],
            count3: [0x00003, 0xfe000, 0x07f00, 0x001fc],
            iso_masks: [0x00007, 0x00038, 0x001c0],
        }
    }
}

impl V4Table {
    pub fn class_masks(&self, critical_apps: u32, total: u32) -> [WayMask; 4] {
        let raw = match critical_apps {
            1 => &self.count1,
            2 => &self.count2,
            3 => &self.count3,
            _ => return [WayMask::full(total); 4],
        };
        raw.map(|bits| WayMask::from_bits(bits).expect("validated at load"))
    }

    pub fn iso_mask(&self, clos: u32) -> WayMask {
        WayMask::from_bits(self.iso_masks[clos as usize - 5]).expect("validated at load")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub policy: PolicyKind,
    /// Act only on intervals divisible by this (sampling decimation).
    pub every: u64,
    /// Warm-up: no classification before this interval.
    pub first_interval: u64,
    /// Cooldown length after a reconfiguration.
    pub idle_intervals: u64,
    /// MPKI-L3 sliding-window capacity per task.
    pub window_size: usize,
    pub clos_add: AssignMode,
    /// `np` only: what the baseline logs.
    pub np_stats: NpStatsMode,
    pub thresholds: Thresholds,
    pub cache: CacheGeometry,
    pub partitions: PartitionTable,
    pub v4: V4Table,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            policy: PolicyKind::Cpa,
            every: 1,
            first_interval: 10,
            idle_intervals: 5,
            window_size: 10,
            clos_add: AssignMode::Task,
            np_stats: NpStatsMode::Interval,
            thresholds: Thresholds::default(),
            cache: CacheGeometry::default(),
            partitions: PartitionTable::default(),
            v4: V4Table::default(),
        }
    }
}

impl Config {
    /// Load from an explicit path, or the first of the system paths, or
    /// fall back to defaults. Always validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) => Self::parse(
                &fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config {}", p.display()))?,
            )?,
            None => {
                let mut found = None;
                for p in ["/etc/cachepart/config.toml", "/etc/cachepart.toml"] {
                    if Path::new(p).exists() {
                        found = Some(Self::parse(&fs::read_to_string(p)?)?);
                        break;
                    }
                }
                found.unwrap_or_default()
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.every == 0 {
            bail!("'every' must be at least 1");
        }
        if self.window_size == 0 {
            bail!("'window_size' must be at least 1");
        }
        let t = &self.thresholds;
        if t.ipc_low < 0.0 || t.ipc_medium < 0.0 || t.icov < 0.0 || t.hpki_l3_limit < 0.0 {
            bail!("Thresholds must be non-negative");
        }
        if t.ipc_low >= t.ipc_medium {
            bail!("ipc_low ({}) must be below ipc_medium ({})", t.ipc_low, t.ipc_medium);
        }
        if t.quantile <= 0.0 || t.quantile > 1.0 {
            bail!("quantile must be in (0, 1]");
        }
        let c = &self.cache;
        if c.min_ways < 1 || c.min_ways > c.total_ways || c.total_ways > 64 {
            bail!("Bad cache geometry: {} total ways, {} minimum", c.total_ways, c.min_ways);
        }
        let needed_classes = match self.policy {
            PolicyKind::Np => 1,
            PolicyKind::Ca => 3,
            PolicyKind::Cpa => 7,
            PolicyKind::Cav4 => 8,
        };
        if c.max_classes < needed_classes {
            bail!(
                "Policy needs {} classes but the hardware maximum is {}",
                needed_classes,
                c.max_classes
            );
        }
        for (i, pair) in self.partitions.pairs.iter().enumerate() {
            for ways in [pair.critical_ways, pair.noncritical_ways] {
                if ways < c.min_ways || ways > c.total_ways {
                    bail!(
                        "Partition entry for {} critical task(s) has {} ways, outside [{}, {}]",
                        i + 1,
                        ways,
                        c.min_ways,
                        c.total_ways
                    );
                }
            }
        }
        for ways in [self.partitions.iso_single_ways, self.partitions.iso_pair_ways] {
            if ways < c.min_ways || ways > c.total_ways {
                bail!("Isolation width {} outside [{}, {}]", ways, c.min_ways, c.total_ways);
            }
        }
        for table in [&self.v4.count1, &self.v4.count2, &self.v4.count3] {
            for &bits in table {
                let mask = WayMask::from_bits(bits)
                    .with_context(|| format!("Bad v4 table mask {:#x}", bits))?;
                if mask.ways() < c.min_ways || mask.first_way() + mask.ways() > c.total_ways {
                    bail!("v4 table mask {:#x} does not fit the cache", bits);
                }
            }
        }
        for &bits in &self.v4.iso_masks {
            WayMask::from_bits(bits).with_context(|| format!("Bad v4 isolation mask {:#x}", bits))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_default_table_matches_known_splits() {
        let cfg = Config::default();
        assert_eq!(cfg.partitions.critical_mask(1, 20).bits(), 0xfff00);
        assert_eq!(cfg.partitions.noncritical_mask(1, 20).bits(), 0x003ff);
        assert_eq!(cfg.partitions.critical_mask(2, 20).bits(), 0xfff80);
        assert_eq!(cfg.partitions.noncritical_mask(2, 20).bits(), 0x001ff);
        assert_eq!(cfg.partitions.critical_mask(3, 20).bits(), 0xfffc0);
        assert_eq!(cfg.partitions.noncritical_mask(3, 20).bits(), 0x000ff);
        assert_eq!(cfg.partitions.iso_single_mask().bits(), 0x3);
        assert_eq!(cfg.partitions.iso_pair_mask().bits(), 0xf);
    }

    #[test]
    fn test_parse_overrides() {
        let cfg = Config::parse(
            r#"
            policy = "ca"
            every = 2
            first_interval = 5

            [thresholds]
            ipc_low = 0.4
            ipc_medium = 1.2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.policy, PolicyKind::Ca);
        assert_eq!(cfg.every, 2);
        assert_eq!(cfg.thresholds.ipc_low, 0.4);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.window_size, 10);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_validation_rejects_inverted_ipc_bands() {
        let mut cfg = Config::default();
        cfg.thresholds.ipc_low = 2.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_oversized_partition() {
        let mut cfg = Config::default();
        cfg.partitions.pairs[0].critical_ways = 24;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_every() {
        let mut cfg = Config::default();
        cfg.every = 0;
        assert!(cfg.validate().is_err());
    }
}
