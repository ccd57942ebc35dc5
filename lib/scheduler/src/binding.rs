// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cell bindings and the per-attempt binding transaction.
//!
//! A binding pairs one virtual and one physical cell at matching chain and
//! level. Bindings propagate to ancestors transitively up to the virtual
//! root (the pre-assigned cell) and are torn down lazily on release, never
//! through a reserved cell.
//!
//! During a single scheduling attempt the mapping code needs *tentative*
//! pairings. Those never touch the arena: they live in a [`BindingTx`] value
//! threaded through the mapping functions and dropped when the attempt ends,
//! so no cleanup pass exists and a failed attempt cannot leak scratch state.

use std::collections::HashMap;

use crate::cell::{CellArena, CellId, CellPriority};
use crate::chain::FreeCellList;

/// Binds a physical and a virtual cell, walking upward until the virtual
/// side already has a physical binding or the virtual root is passed.
pub fn bind_cell(arena: &mut CellArena, physical: CellId, virtual_cell: CellId) {
    let mut pc = physical;
    let mut vc = virtual_cell;
    while arena.virtual_cell(vc).bound_physical.is_none() {
        arena.virtual_cell_mut(vc).bound_physical = Some(pc);
        arena.physical_mut(pc).bound_virtual = Some(vc);
        tracing::info!(
            virtual_cell = %arena.name(vc),
            physical_cell = %arena.name(pc),
            "cells bound"
        );
        match (arena.parent(vc), arena.parent(pc)) {
            (Some(vp), Some(pp)) => {
                vc = vp;
                pc = pp;
            }
            _ => break,
        }
    }
}

/// Unbinds starting from a physical leaf, ascending while no sibling of the
/// current virtual cell still holds a physical binding. Reserved bindings
/// are permanent: the walk stops when it reaches one.
pub fn unbind_cell(arena: &mut CellArena, physical: CellId) {
    let Some(mut bound_virtual) = arena.physical(physical).bound_virtual else {
        return;
    };
    loop {
        let Some(bound_physical) = arena.virtual_cell(bound_virtual).bound_physical else {
            break;
        };
        if arena.physical(bound_physical).reserved {
            break;
        }
        arena.physical_mut(bound_physical).bound_virtual = None;
        arena.virtual_cell_mut(bound_virtual).bound_physical = None;
        tracing::info!(
            virtual_cell = %arena.name(bound_virtual),
            physical_cell = %arena.name(bound_physical),
            "cells unbound"
        );
        let Some(parent) = arena.parent(bound_virtual) else {
            break;
        };
        let sibling_still_bound = arena
            .children(parent)
            .iter()
            .any(|c| arena.virtual_cell(*c).bound_physical.is_some());
        if sibling_still_bound {
            break;
        }
        bound_virtual = parent;
    }
}

/// Adjusts the used-GPU counter at `priority` for a cell and all its
/// ancestors.
pub fn update_used_gpu_num_at_priority(
    arena: &mut CellArena,
    cell: CellId,
    priority: CellPriority,
    increase: bool,
) {
    let delta = if increase { 1 } else { -1 };
    let mut current = Some(cell);
    while let Some(id) = current {
        arena
            .cell_mut(id)
            .generic
            .increase_used_gpu_num_at_priority(priority, delta);
        current = arena.parent(id);
    }
}

/// Tentative virtual↔physical pairings of one scheduling attempt.
#[derive(Debug, Default)]
pub struct PreBindings {
    virtual_to_physical: HashMap<CellId, CellId>,
    physical_to_virtual: HashMap<CellId, CellId>,
}

impl PreBindings {
    pub fn pre_bind(&mut self, virtual_cell: CellId, physical: CellId) {
        self.virtual_to_physical.insert(virtual_cell, physical);
        self.physical_to_virtual.insert(physical, virtual_cell);
    }

    pub fn physical_for(&self, virtual_cell: CellId) -> Option<CellId> {
        self.virtual_to_physical.get(&virtual_cell).copied()
    }

    pub fn is_physical_pre_bound(&self, physical: CellId) -> bool {
        self.physical_to_virtual.contains_key(&physical)
    }
}

/// Scratch state of one virtual→physical mapping attempt: a copy of the
/// chain's free list (the buddy allocator may split it) plus the tentative
/// pairings. Dropped whole when the attempt ends, successful or not.
#[derive(Debug)]
pub struct BindingTx {
    pub free: FreeCellList,
    pub pre: PreBindings,
}

impl BindingTx {
    pub fn new(free: FreeCellList) -> Self {
        Self {
            free,
            pre: PreBindings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Cell;

    /// One physical and one virtual two-level tree: a root with two leaves.
    fn two_trees() -> (CellArena, [CellId; 3], [CellId; 3]) {
        let mut arena = CellArena::new();
        let proot = arena.insert(Cell::new_physical(
            "CT1".into(),
            2,
            "T2".into(),
            "CT1/0".into(),
            true,
            2,
        ));
        let vroot_id = arena.next_id();
        let vroot = arena.insert(Cell::new_virtual(
            "CT1".into(),
            2,
            "T2".into(),
            "vc1/CT1/0".into(),
            true,
            2,
            "vc1".into(),
            vroot_id,
        ));
        let mut pleaves = [proot; 3];
        let mut vleaves = [vroot; 3];
        pleaves[0] = proot;
        vleaves[0] = vroot;
        for i in 0..2 {
            let p = arena.insert(Cell::new_physical(
                "CT1".into(),
                1,
                "T1".into(),
                format!("CT1/0/{i}").into(),
                false,
                1,
            ));
            arena.cell_mut(p).generic.parent = Some(proot);
            arena.cell_mut(proot).generic.children.push(p);
            let v = arena.insert(Cell::new_virtual(
                "CT1".into(),
                1,
                "T1".into(),
                format!("vc1/CT1/0/{i}").into(),
                false,
                1,
                "vc1".into(),
                vroot,
            ));
            arena.cell_mut(v).generic.parent = Some(vroot);
            arena.cell_mut(vroot).generic.children.push(v);
            pleaves[i + 1] = p;
            vleaves[i + 1] = v;
        }
        (arena, pleaves, vleaves)
    }

    #[test]
    fn bind_propagates_to_root_and_unbind_stops_at_bound_sibling() {
        let (mut arena, p, v) = two_trees();
        bind_cell(&mut arena, p[1], v[1]);
        assert_eq!(arena.virtual_cell(v[1]).bound_physical, Some(p[1]));
        assert_eq!(arena.virtual_cell(v[0]).bound_physical, Some(p[0]));
        assert_eq!(arena.physical(p[0]).bound_virtual, Some(v[0]));

        bind_cell(&mut arena, p[2], v[2]);
        unbind_cell(&mut arena, p[1]);
        // sibling leaf still bound, so the root pair survives
        assert_eq!(arena.virtual_cell(v[1]).bound_physical, None);
        assert_eq!(arena.virtual_cell(v[0]).bound_physical, Some(p[0]));

        unbind_cell(&mut arena, p[2]);
        assert_eq!(arena.virtual_cell(v[0]).bound_physical, None);
        assert_eq!(arena.physical(p[0]).bound_virtual, None);
    }

    #[test]
    fn unbind_never_crosses_a_reserved_cell() {
        let (mut arena, p, v) = two_trees();
        arena.physical_mut(p[0]).reserved = true;
        bind_cell(&mut arena, p[0], v[0]);
        bind_cell(&mut arena, p[1], v[1]);
        unbind_cell(&mut arena, p[1]);
        assert_eq!(arena.virtual_cell(v[1]).bound_physical, None);
        // the reserved pair is permanent
        assert_eq!(arena.virtual_cell(v[0]).bound_physical, Some(p[0]));
    }

    #[test]
    fn usage_updates_walk_ancestors() {
        let (mut arena, p, _) = two_trees();
        update_used_gpu_num_at_priority(&mut arena, p[1], CellPriority::OPPORTUNISTIC, true);
        assert_eq!(
            arena
                .cell(p[0])
                .generic
                .used_gpu_num_at_priority(CellPriority::OPPORTUNISTIC),
            1
        );
        update_used_gpu_num_at_priority(&mut arena, p[1], CellPriority::OPPORTUNISTIC, false);
        assert!(arena
            .cell(p[0])
            .generic
            .used_gpu_num_at_priorities
            .is_empty());
    }
}
