// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Allocation bookkeeping: the task-to-class map and the scarce class-id
//! pools. The map is the single source of truth for ownership; per-class
//! member sets are derived views. Pool checkouts are explicit so a slot can
//! never be handed to two owners.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use log::warn;

/// Primary `task -> class` mapping. Exactly one entry per known task;
/// reassignment is a single insert, departure a single remove.
#[derive(Debug, Default, Clone)]
pub struct ClassMap {
    map: BTreeMap<u32, u32>,
}

impl ClassMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, task: u32, class: u32) {
        self.map.insert(task, class);
    }

    pub fn class_of(&self, task: u32) -> Option<u32> {
        self.map.get(&task).copied()
    }

    pub fn contains(&self, task: u32) -> bool {
        self.map.contains_key(&task)
    }

    /// Drop every task not in `active`, returning the pruned entries so the
    /// caller can release any class slots they held.
    pub fn prune(&mut self, active: &BTreeSet<u32>) -> Vec<(u32, u32)> {
        let gone: Vec<(u32, u32)> = self
            .map
            .iter()
            .filter(|(id, _)| !active.contains(id))
            .map(|(&id, &class)| (id, class))
            .collect();
        for (id, _) in &gone {
            self.map.remove(id);
        }
        gone
    }

    /// Derived member view of one class.
    pub fn tasks_in(&self, class: u32) -> Vec<u32> {
        self.map
            .iter()
            .filter(|(_, &c)| c == class)
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn count_in(&self, class: u32) -> usize {
        self.map.values().filter(|&&c| c == class).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.map.iter().map(|(&id, &class)| (id, class))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

/// A fixed set of class ids handed out one at a time: the isolation classes
/// and the critical-class slots. Checkout order is lowest-id-first.
/// Double-checkout and foreign returns are programming errors: they panic
/// in debug builds and are logged and ignored in release builds.
#[derive(Debug, Clone)]
pub struct ClassPool {
    name: &'static str,
    universe: BTreeSet<u32>,
    avail: BTreeSet<u32>,
}

impl ClassPool {
    pub fn new(name: &'static str, ids: &[u32]) -> Self {
        let universe: BTreeSet<u32> = ids.iter().copied().collect();
        Self {
            name,
            avail: universe.clone(),
            universe,
        }
    }

    pub fn checkout(&mut self) -> Option<u32> {
        self.avail.pop_first()
    }

    /// Check out one specific id, e.g. to keep a task on the slot it
    /// already occupies across a re-partition.
    pub fn checkout_id(&mut self, id: u32) -> bool {
        self.avail.remove(&id)
    }

    pub fn put_back(&mut self, id: u32) {
        if !self.universe.contains(&id) {
            debug_assert!(false, "{}: return of foreign class {}", self.name, id);
            warn!("{}: ignoring return of foreign class {}", self.name, id);
            return;
        }
        if !self.avail.insert(id) {
            debug_assert!(false, "{}: double return of class {}", self.name, id);
            warn!("{}: ignoring double return of class {}", self.name, id);
        }
    }

    /// Return every slot to the pool (full re-partition).
    pub fn reset(&mut self) {
        self.avail = self.universe.clone();
    }

    pub fn is_member(&self, id: u32) -> bool {
        self.universe.contains(&id)
    }

    pub fn is_checked_out(&self, id: u32) -> bool {
        self.universe.contains(&id) && !self.avail.contains(&id)
    }

    pub fn free(&self) -> usize {
        self.avail.len()
    }

    pub fn in_use(&self) -> usize {
        self.universe.len() - self.avail.len()
    }

    pub fn capacity(&self) -> usize {
        self.universe.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_prune_returns_dropped() {
        let mut map = ClassMap::new();
        map.assign(1, 1);
        map.assign(2, 3);
        map.assign(3, 5);
        let active: BTreeSet<u32> = [1].into_iter().collect();
        let mut gone = map.prune(&active);
        gone.sort();
        assert_eq!(gone, vec![(2, 3), (3, 5)]);
        assert_eq!(map.len(), 1);
        assert_eq!(map.class_of(1), Some(1));
    }

    #[test]
    fn test_map_single_ownership() {
        let mut map = ClassMap::new();
        map.assign(7, 1);
        map.assign(7, 2);
        assert_eq!(map.class_of(7), Some(2));
        assert_eq!(map.tasks_in(1), Vec::<u32>::new());
        assert_eq!(map.tasks_in(2), vec![7]);
    }

    #[test]
    fn test_pool_checkout_order_and_exhaustion() {
        let mut pool = ClassPool::new("iso", &[5, 6]);
        assert_eq!(pool.checkout(), Some(5));
        assert_eq!(pool.checkout(), Some(6));
        assert_eq!(pool.checkout(), None);
        assert_eq!(pool.in_use(), 2);
        pool.put_back(6);
        assert_eq!(pool.free(), 1);
        assert_eq!(pool.checkout(), Some(6));
    }

    #[test]
    fn test_pool_checkout_specific() {
        let mut pool = ClassPool::new("crit", &[2, 3, 4]);
        assert!(pool.checkout_id(3));
        assert!(!pool.checkout_id(3));
        assert_eq!(pool.checkout(), Some(2));
        assert!(pool.is_checked_out(3));
        assert!(!pool.is_checked_out(4));
    }

    #[test]
    #[should_panic]
    fn test_pool_double_return_panics_in_debug() {
        let mut pool = ClassPool::new("iso", &[5, 6]);
        let id = pool.checkout().unwrap();
        pool.put_back(id);
        pool.put_back(id);
    }
}
