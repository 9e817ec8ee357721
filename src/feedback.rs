// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Feedback controller
//!
//! Once the partition is settled, the policies hill-climb the way split
//! between the critical and non-critical groups: each non-idle interval the
//! aggregate IPC is compared against the previous interval (±4% band), the
//! two groups are compared against their own previous values, and one
//! shared way is moved toward whichever group regressed.
//!
//! The machine is split into a pure transition function over an enumerated
//! phase (testable without hardware) and an interpreter that executes the
//! resulting action against live masks. Masks are always re-read from the
//! controller before mutation; a cached copy can be stale after a limit
//! action or an external reconfiguration.

use anyhow::Result;
use log::debug;
use log::info;
use log::warn;

use crate::resctrl::CacheController;
use crate::waymask::WayMask;

/// Where the hill climb currently stands. `Settle` is the fresh-partition
/// state (one per supported critical count); the four converging states
/// name the mask action they take when re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Settle(u32),
    SqueezeNoncritical,
    SqueezeCritical,
    GrowNoncritical,
    GrowCritical,
    /// No partition in force (zero or too many critical tasks).
    Collapsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcTrend {
    Better,
    Equal,
    WorseNoncritical,
    WorseCritical,
    WorseBoth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    NoOp,
    ShrinkNoncritical,
    ShrinkCritical,
    GrowNoncritical,
    GrowCritical,
}

/// The two transition tables in the family. The phase-aware variant folds
/// the grow states back into the settle row; the original keeps them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    CriticalAware,
    PhaseAware,
}

/// Band the interval's aggregate and per-group IPC against their previous
/// values. Ordering matters and mirrors the policy: an aggregate
/// improvement wins outright, an in-band aggregate is "equal" even if one
/// group moved, and only then are the groups consulted.
pub fn observe(
    ipc_total: f64,
    expected_total: f64,
    ipc_cr: f64,
    ipc_cr_prev: f64,
    ipc_ncr: f64,
    ipc_ncr_prev: f64,
) -> IpcTrend {
    let up = expected_total * 1.04;
    let low = expected_total * 0.96;
    if ipc_total > up {
        return IpcTrend::Better;
    }
    if ipc_total >= low {
        return IpcTrend::Equal;
    }
    let cr_worse = ipc_cr < ipc_cr_prev * 0.96;
    let ncr_worse = ipc_ncr < ipc_ncr_prev * 0.96;
    match (ncr_worse, cr_worse) {
        (true, false) => IpcTrend::WorseNoncritical,
        (false, true) => IpcTrend::WorseCritical,
        _ => IpcTrend::WorseBoth,
    }
}

/// One step of the state machine. Returns the successor phase and the mask
/// action it calls for. `Better` freezes the phase: the caller enters its
/// cooldown instead of acting.
pub fn transition(phase: Phase, trend: IpcTrend, flavor: Flavor) -> (Phase, Action) {
    use IpcTrend::*;
    use Phase::*;

    if phase == Collapsed || trend == Better {
        return (phase, Action::NoOp);
    }

    let in_squeeze = matches!(phase, SqueezeNoncritical | SqueezeCritical);
    let in_grow = matches!(phase, GrowNoncritical | GrowCritical);

    let next = if in_squeeze {
        match trend {
            Equal => GrowCritical,
            WorseNoncritical => GrowNoncritical,
            WorseCritical | WorseBoth => GrowCritical,
            Better => unreachable!(),
        }
    } else if in_grow && flavor == Flavor::CriticalAware {
        match trend {
            Equal => SqueezeNoncritical,
            WorseNoncritical => SqueezeCritical,
            WorseCritical | WorseBoth => SqueezeNoncritical,
            Better => unreachable!(),
        }
    } else {
        // Settle states, and grow states under the phase-aware table.
        match trend {
            Equal => SqueezeNoncritical,
            WorseNoncritical => SqueezeCritical,
            WorseCritical | WorseBoth => SqueezeNoncritical,
            Better => unreachable!(),
        }
    };

    let action = match next {
        SqueezeNoncritical => Action::ShrinkNoncritical,
        SqueezeCritical => Action::ShrinkCritical,
        GrowNoncritical => Action::GrowNoncritical,
        GrowCritical => Action::GrowCritical,
        Settle(_) | Collapsed => Action::NoOp,
    };
    (next, action)
}

/// Clamps for the interpreter: a class never goes below the hardware
/// minimum, the non-critical class never shrinks below its occupant count,
/// and the critical group never grows past its way ceiling.
#[derive(Debug, Clone, Copy)]
pub struct Guards {
    pub ncr_way_floor: u32,
    pub cr_way_ceiling: u32,
}

/// Execute one action against live masks. Returns whether any mask
/// actually changed; a refused (guard-clamped) action is not an error.
pub fn execute(
    ctl: &mut dyn CacheController,
    action: Action,
    ncr_class: u32,
    cr_classes: &[u32],
    guards: Guards,
) -> Result<bool> {
    let total = ctl.total_ways();
    let min_ways = ctl.min_ways();

    match action {
        Action::NoOp => Ok(false),
        Action::ShrinkNoncritical => {
            let mask = ctl.get_class_mask(ncr_class)?;
            let floor = guards.ncr_way_floor.max(min_ways);
            if mask.ways() <= floor {
                info!("NCR-- refused: non-critical group at its {}-way floor", floor);
                return Ok(false);
            }
            let new = mask.shrink_left(1);
            debug!("NCR--: class {} {} -> {}", ncr_class, mask, new);
            ctl.set_class_mask(ncr_class, new)?;
            Ok(true)
        }
        Action::GrowNoncritical => {
            let mask = ctl.get_class_mask(ncr_class)?;
            let new = mask.grow_left(1, total);
            if new == mask {
                return Ok(false);
            }
            debug!("NCR++: class {} {} -> {}", ncr_class, mask, new);
            ctl.set_class_mask(ncr_class, new)?;
            Ok(true)
        }
        Action::ShrinkCritical => {
            // All critical classes move together so their masks stay equal.
            let masks: Vec<(u32, WayMask)> = cr_classes
                .iter()
                .map(|&c| ctl.get_class_mask(c).map(|m| (c, m)))
                .collect::<Result<_>>()?;
            if masks.iter().any(|(_, m)| m.ways() <= min_ways) {
                info!("CR-- refused: critical group at the {}-way minimum", min_ways);
                return Ok(false);
            }
            for (class, mask) in masks {
                let new = mask.shrink_right(1);
                debug!("CR--: class {} {} -> {}", class, mask, new);
                ctl.set_class_mask(class, new)?;
            }
            Ok(true)
        }
        Action::GrowCritical => {
            let masks: Vec<(u32, WayMask)> = cr_classes
                .iter()
                .map(|&c| ctl.get_class_mask(c).map(|m| (c, m)))
                .collect::<Result<_>>()?;
            let widest = masks.iter().map(|(_, m)| m.ways()).max().unwrap_or(0);
            if widest >= guards.cr_way_ceiling {
                info!(
                    "CR++ refused: critical group at its {}-way ceiling",
                    guards.cr_way_ceiling
                );
                return Ok(false);
            }
            let mut changed = false;
            for (class, mask) in masks {
                let new = mask.grow_right(1);
                if new != mask {
                    debug!("CR++: class {} {} -> {}", class, mask, new);
                    ctl.set_class_mask(class, new)?;
                    changed = true;
                }
            }
            Ok(changed)
        }
    }
}

/// Diagnostic shared-way count between the two groups, clamped at zero.
/// Fully-disjoint groups are legal after repeated squeezes, so a negative
/// raw value is clamped and logged rather than treated as fatal.
pub fn num_shared_ways(ctl: &dyn CacheController, cr_class: u32, ncr_class: u32) -> Result<u32> {
    let cr = ctl.get_class_mask(cr_class)?;
    let ncr = ctl.get_class_mask(ncr_class)?;
    let raw = cr.ways() as i64 + ncr.ways() as i64 - ctl.total_ways() as i64;
    if raw < 0 {
        warn!("Critical and non-critical groups are disjoint ({} spare ways)", -raw);
    }
    Ok(raw.max(0) as u32)
}

/// One-shot penalty for a medium-IPC critical task hogging the critical
/// group's space: halve its class, and with a single critical task hand
/// the reclaimed ways to the non-critical class. Returns the class's new
/// way count.
pub fn divide_half_ways_critical(
    ctl: &mut dyn CacheController,
    clos: u32,
    cr_apps: u32,
    ncr_class: u32,
) -> Result<u32> {
    let total = ctl.total_ways();
    let min_ways = ctl.min_ways();
    let mask = ctl.get_class_mask(clos)?;
    let ways = mask.ways();
    if ways <= min_ways {
        info!("Class {} already at minimum ways, limit skipped", clos);
        return Ok(ways);
    }
    let target = (ways / 2).max(min_ways);
    let new = mask.shrink_right(ways - target);
    info!("Limit: class {} reduced from {} to {} ways ({})", clos, ways, target, new);
    ctl.set_class_mask(clos, new)?;

    if cr_apps == 1 {
        // The freed space goes to the non-critical side, keeping two ways
        // of overlap with the squeezed critical class.
        let ncr = ctl.get_class_mask(ncr_class)?;
        let want = (total + 2).saturating_sub(target).min(total);
        if want > ncr.ways() {
            let grown = ncr.grow_left(want - ncr.ways(), total);
            info!("Limit: class {} grown to {} ways ({})", ncr_class, grown.ways(), grown);
            ctl.set_class_mask(ncr_class, grown)?;
        }
    }
    Ok(target)
}

/// The three-critical-task flavor of the limit: cut the class to one third
/// of its ways, or to two thirds when a limit was already applied once.
pub fn divide_3_critical(ctl: &mut dyn CacheController, clos: u32, limit_done: bool) -> Result<u32> {
    let min_ways = ctl.min_ways();
    let mask = ctl.get_class_mask(clos)?;
    let ways = mask.ways();
    if ways <= min_ways {
        info!("Class {} already at minimum ways, limit skipped", clos);
        return Ok(ways);
    }
    let target = if limit_done {
        (2 * (ways / 3)).max(min_ways)
    } else {
        (ways / 3).max(min_ways)
    };
    let new = mask.shrink_right(ways - target);
    info!("Limit: class {} reduced from {} to {} ways ({})", clos, ways, target, new);
    ctl.set_class_mask(clos, new)?;
    Ok(target)
}
