// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # resctrl backend
//!
//! The kernel exposes cache-allocation classes of service as directories
//! under `/sys/fs/resctrl`: each class directory carries a `schemata` file
//! (the L3 way mask), a `tasks` file (member pids, one write per pid) and a
//! `cpus` file. This module wraps that surface behind [`CacheController`]
//! so the policies never touch the filesystem directly.
//!
//! Writes are verified by reading the value back: resctrl silently clamps
//! some invalid schemata instead of rejecting them, and a clamped write
//! would otherwise let the in-memory masks drift from hardware truth.

use std::fs;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;

use crate::waymask::WayMask;

pub trait CacheController {
    /// Apply a way mask to a class. Fails if the class is unknown, the mask
    /// is below the hardware minimum width, or the write does not stick.
    fn set_class_mask(&mut self, class_id: u32, mask: WayMask) -> Result<()>;
    fn get_class_mask(&self, class_id: u32) -> Result<WayMask>;
    fn assign_task_to_class(&mut self, class_id: u32, pid: libc::pid_t) -> Result<()>;
    fn assign_cpu_to_class(&mut self, class_id: u32, cpu: u32) -> Result<()>;
    /// The class currently hosting a pid. Used to reconcile after a task
    /// restart changes the pid behind a stable task id.
    fn class_of_task(&self, pid: libc::pid_t) -> Result<u32>;
    fn max_class_count(&self) -> usize;
    fn total_ways(&self) -> u32;
    fn min_ways(&self) -> u32;
}

pub struct ResctrlFs {
    root: PathBuf,
    total_ways: u32,
    min_ways: u32,
    max_classes: usize,
    cache_id: u32,
}

impl ResctrlFs {
    pub fn new(root: impl Into<PathBuf>, total_ways: u32, min_ways: u32, max_classes: usize) -> Result<Self> {
        let this = Self {
            root: root.into(),
            total_ways,
            min_ways,
            max_classes,
            cache_id: 0,
        };
        if !this.root.is_dir() {
            bail!("resctrl root {} is not mounted", this.root.display());
        }
        Ok(this)
    }

    fn class_dir(&self, class_id: u32) -> Result<PathBuf> {
        if class_id as usize >= self.max_class_count() {
            bail!("Class {} exceeds the hardware maximum of {}", class_id, self.max_classes);
        }
        // Class 0 is the resctrl root group itself.
        let dir = if class_id == 0 {
            self.root.clone()
        } else {
            self.root.join(format!("COS{}", class_id))
        };
        if !dir.is_dir() {
            fs::create_dir(&dir)
                .with_context(|| format!("Failed to create class dir {}", dir.display()))?;
        }
        Ok(dir)
    }

    /// Reset every class to the full mask. Called once at startup so a
    /// previous run's partitioning cannot leak into this one.
    pub fn reset(&mut self) -> Result<()> {
        for class in 1..self.max_classes as u32 {
            self.set_class_mask(class, WayMask::full(self.total_ways))?;
        }
        Ok(())
    }
}

impl CacheController for ResctrlFs {
    fn set_class_mask(&mut self, class_id: u32, mask: WayMask) -> Result<()> {
        if mask.ways() < self.min_ways {
            bail!(
                "Mask {} for class {} is below the {}-way hardware minimum",
                mask,
                class_id,
                self.min_ways
            );
        }
        let path = self.class_dir(class_id)?.join("schemata");
        fs::write(&path, format!("L3:{}={:x}\n", self.cache_id, mask))
            .with_context(|| format!("Failed to write schemata for class {}", class_id))?;
        let applied = self.get_class_mask(class_id)?;
        if applied != mask {
            bail!(
                "Schemata write for class {} did not stick: wanted {}, hardware kept {}",
                class_id,
                mask,
                applied
            );
        }
        Ok(())
    }

    fn get_class_mask(&self, class_id: u32) -> Result<WayMask> {
        let dir = if class_id == 0 {
            self.root.clone()
        } else {
            self.root.join(format!("COS{}", class_id))
        };
        let raw = fs::read_to_string(dir.join("schemata"))
            .with_context(|| format!("Failed to read schemata for class {}", class_id))?;
        for line in raw.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("L3:") {
                if let Some((_, mask)) = rest.split_once('=') {
                    let bits = u64::from_str_radix(mask.trim(), 16)
                        .with_context(|| format!("Bad schemata value {:?}", mask))?;
                    return WayMask::from_bits(bits);
                }
            }
        }
        bail!("No L3 line in schemata for class {}", class_id)
    }

    fn assign_task_to_class(&mut self, class_id: u32, pid: libc::pid_t) -> Result<()> {
        let path = self.class_dir(class_id)?.join("tasks");
        fs::write(&path, format!("{}\n", pid))
            .with_context(|| format!("Failed to assign pid {} to class {}", pid, class_id))?;
        Ok(())
    }

    fn assign_cpu_to_class(&mut self, class_id: u32, cpu: u32) -> Result<()> {
        let path = self.class_dir(class_id)?.join("cpus");
        fs::write(&path, format!("{:x}\n", 1u64 << cpu))
            .with_context(|| format!("Failed to assign cpu {} to class {}", cpu, class_id))?;
        Ok(())
    }

    fn class_of_task(&self, pid: libc::pid_t) -> Result<u32> {
        for class in 1..self.max_classes as u32 {
            let path = self.root.join(format!("COS{}", class)).join("tasks");
            let Ok(raw) = fs::read_to_string(&path) else {
                continue;
            };
            for line in raw.lines() {
                if line.trim().parse::<libc::pid_t>() == Ok(pid) {
                    return Ok(class);
                }
            }
        }
        // Not listed in any class group: the pid is in the root group.
        Ok(0)
    }

    fn max_class_count(&self) -> usize {
        self.max_classes
    }

    fn total_ways(&self) -> u32 {
        self.total_ways
    }

    fn min_ways(&self) -> u32 {
        self.min_ways
    }
}

/// In-memory controller for tests: same contract, no filesystem, and a
/// recorded history of every mask write so scenarios can assert on the
/// exact sequence of reconfigurations.
#[cfg(test)]
pub struct FakeController {
    pub masks: std::collections::BTreeMap<u32, WayMask>,
    pub task_class: std::collections::BTreeMap<libc::pid_t, u32>,
    pub cpu_class: std::collections::BTreeMap<u32, u32>,
    pub mask_writes: Vec<(u32, WayMask)>,
    pub fail_writes: bool,
    total_ways: u32,
    min_ways: u32,
    max_classes: usize,
}

#[cfg(test)]
impl FakeController {
    pub fn new(total_ways: u32, max_classes: usize) -> Self {
        let mut masks = std::collections::BTreeMap::new();
        for class in 0..max_classes as u32 {
            masks.insert(class, WayMask::full(total_ways));
        }
        Self {
            masks,
            task_class: Default::default(),
            cpu_class: Default::default(),
            mask_writes: Vec::new(),
            fail_writes: false,
            total_ways,
            min_ways: 2,
            max_classes,
        }
    }

    pub fn tasks_in(&self, class_id: u32) -> Vec<libc::pid_t> {
        self.task_class
            .iter()
            .filter(|(_, &c)| c == class_id)
            .map(|(&p, _)| p)
            .collect()
    }
}

#[cfg(test)]
impl CacheController for FakeController {
    fn set_class_mask(&mut self, class_id: u32, mask: WayMask) -> Result<()> {
        if self.fail_writes {
            bail!("injected write failure");
        }
        if class_id as usize >= self.max_classes {
            bail!("Class {} exceeds the hardware maximum", class_id);
        }
        if mask.ways() < self.min_ways {
            bail!("Mask {} below hardware minimum", mask);
        }
        self.masks.insert(class_id, mask);
        self.mask_writes.push((class_id, mask));
        Ok(())
    }

    fn get_class_mask(&self, class_id: u32) -> Result<WayMask> {
        self.masks
            .get(&class_id)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Unknown class {}", class_id))
    }

    fn assign_task_to_class(&mut self, class_id: u32, pid: libc::pid_t) -> Result<()> {
        if self.fail_writes {
            bail!("injected write failure");
        }
        self.task_class.insert(pid, class_id);
        Ok(())
    }

    fn assign_cpu_to_class(&mut self, class_id: u32, cpu: u32) -> Result<()> {
        self.cpu_class.insert(cpu, class_id);
        Ok(())
    }

    fn class_of_task(&self, pid: libc::pid_t) -> Result<u32> {
        Ok(self.task_class.get(&pid).copied().unwrap_or(0))
    }

    fn max_class_count(&self) -> usize {
        self.max_classes
    }

    fn total_ways(&self) -> u32 {
        self.total_ways
    }

    fn min_ways(&self) -> u32 {
        self.min_ways
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_fixture() -> (tempfile::TempDir, ResctrlFs) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("schemata"), "L3:0=fffff\n").unwrap();
        let ctl = ResctrlFs::new(dir.path(), 20, 2, 8).unwrap();
        (dir, ctl)
    }

    #[test]
    fn test_schemata_round_trip() {
        let (dir, mut ctl) = fs_fixture();
        let mask = WayMask::from_bits(0xfff00).unwrap();
        // Seed the class dir with a schemata file the way resctrl would.
        std::fs::create_dir(dir.path().join("COS2")).unwrap();
        std::fs::write(dir.path().join("COS2/schemata"), "L3:0=fffff\n").unwrap();
        ctl.set_class_mask(2, mask).unwrap();
        assert_eq!(ctl.get_class_mask(2).unwrap(), mask);
    }

    #[test]
    fn test_min_width_rejected() {
        let (_dir, mut ctl) = fs_fixture();
        let narrow = WayMask::from_bits(0x1).unwrap();
        assert!(ctl.set_class_mask(1, narrow).is_err());
    }

    #[test]
    fn test_task_listing() {
        let (dir, mut ctl) = fs_fixture();
        ctl.assign_task_to_class(3, 4242).unwrap();
        // The fixture's plain file keeps only the last write, which is
        // exactly what class_of_task scans for.
        let raw = std::fs::read_to_string(dir.path().join("COS3/tasks")).unwrap();
        assert_eq!(raw.trim(), "4242");
        assert_eq!(ctl.class_of_task(4242).unwrap(), 3);
        assert_eq!(ctl.class_of_task(1).unwrap(), 0);
    }

    #[test]
    fn test_swallowed_write_fails_verification() {
        let (dir, _) = fs_fixture();
        // Simulate hardware discarding the write: schemata is a sink, so
        // the read-back cannot match what was written.
        std::fs::create_dir(dir.path().join("COS1")).unwrap();
        std::os::unix::fs::symlink("/dev/null", dir.path().join("COS1/schemata")).unwrap();
        let mut ctl = ResctrlFs::new(dir.path(), 20, 2, 8).unwrap();
        assert!(ctl
            .set_class_mask(1, WayMask::from_bits(0xff).unwrap())
            .is_err());
    }
}
