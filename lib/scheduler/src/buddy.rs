// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Buddy allocation over a chain's free cell list.
//!
//! Splits and merges are lazy and local. The maintained invariant:
//! `free_list[L]` contains exactly the cells at level L whose parent is
//! split (top-level cells count as always-split parents) and which have no
//! bound virtual cell.

use crate::binding::PreBindings;
use crate::cell::{CellArena, CellId, CellLevel, CellPriority};
use crate::chain::FreeCellList;

/// Allocates a free cell at `level`, splitting a higher-level cell when the
/// level is empty. Only ever runs on a scratch copy of the free list, so the
/// returned cell is not removed: exclusion of already-picked cells happens
/// through the pre-bindings.
pub fn buddy_alloc(
    arena: &CellArena,
    free: &mut FreeCellList,
    level: CellLevel,
    pre: &PreBindings,
) -> Option<CellId> {
    if free.len_at_level(level) == 0 && level < free.top_level() {
        if let Some(higher) = buddy_alloc(arena, free, level + 1, pre) {
            let children: Vec<CellId> = arena.children(higher).to_vec();
            for child in children {
                free.insert(level, child);
            }
        }
    }
    min_opportunistic_cell(arena, free.at_level(level), pre)
}

/// Picks the unbound, un-pre-bound cell with the fewest opportunistic GPUs
/// in use; first such cell in iteration order wins ties.
pub fn min_opportunistic_cell(
    arena: &CellArena,
    cells: impl Iterator<Item = CellId>,
    pre: &PreBindings,
) -> Option<CellId> {
    let mut min_usage = u32::MAX;
    let mut picked = None;
    for id in cells {
        let physical = arena.physical(id);
        if physical.bound_virtual.is_some() || pre.is_physical_pre_bound(id) {
            continue;
        }
        let usage = arena
            .cell(id)
            .generic
            .used_gpu_num_at_priority(CellPriority::OPPORTUNISTIC);
        if usage < min_usage {
            min_usage = usage;
            picked = Some(id);
        }
    }
    picked
}

/// Removes a cell from the real free list, splitting its unsplit ancestors
/// on the way up so their children become individually allocatable.
pub fn remove_cell_from_free_list(arena: &mut CellArena, free: &mut FreeCellList, cell: CellId) {
    let mut current = cell;
    loop {
        let level = arena.cell(current).level();
        match arena.parent(current) {
            Some(parent) if !arena.physical(parent).split => {
                let children: Vec<CellId> = arena.children(parent).to_vec();
                for child in children {
                    free.insert(level, child);
                }
                arena.physical_mut(parent).split = true;
                free.remove(level, current);
                current = parent;
            }
            _ => {
                free.remove(level, current);
                break;
            }
        }
    }
}

/// Adds a released cell back to the free list, merging buddies upward while
/// every child of the parent is unbound.
pub fn add_cell_to_free_list(arena: &mut CellArena, free: &mut FreeCellList, cell: CellId) {
    let mut current = cell;
    loop {
        let level = arena.cell(current).level();
        let all_buddies_free = arena.parent(current).is_some_and(|parent| {
            arena
                .children(parent)
                .iter()
                .all(|c| arena.physical(*c).bound_virtual.is_none())
        });
        match arena.parent(current) {
            Some(parent) if all_buddies_free => {
                let buddies: Vec<CellId> = arena.children(parent).to_vec();
                for buddy in buddies {
                    if buddy != current {
                        free.remove(level, buddy);
                    }
                }
                arena.physical_mut(parent).split = false;
                current = parent;
            }
            _ => {
                free.insert(level, current);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Cell;

    /// Builds one physical chain: `tops` top cells at level 3, each with two
    /// level-2 children of two GPUs each.
    fn chain(tops: usize) -> (CellArena, FreeCellList, Vec<CellId>) {
        let mut arena = CellArena::new();
        let mut free = FreeCellList::new(3);
        let mut top_ids = Vec::new();
        for t in 0..tops {
            let top = arena.insert(Cell::new_physical(
                "CT1".into(),
                3,
                "T3".into(),
                format!("CT1/{t}").into(),
                true,
                4,
            ));
            for m in 0..2 {
                let mid = arena.insert(Cell::new_physical(
                    "CT1".into(),
                    2,
                    "T2".into(),
                    format!("CT1/{t}/{m}").into(),
                    false,
                    2,
                ));
                arena.cell_mut(mid).generic.parent = Some(top);
                arena.cell_mut(top).generic.children.push(mid);
                for g in 0..2 {
                    let leaf = arena.insert(Cell::new_physical(
                        "CT1".into(),
                        1,
                        "T1".into(),
                        format!("CT1/{t}/{m}/{g}").into(),
                        false,
                        1,
                    ));
                    arena.cell_mut(leaf).generic.parent = Some(mid);
                    arena.cell_mut(mid).generic.children.push(leaf);
                }
            }
            free.insert(3, top);
            top_ids.push(top);
        }
        (arena, free, top_ids)
    }

    #[test]
    fn alloc_splits_from_the_top() {
        let (arena, free, tops) = chain(1);
        let mut scratch = free.clone();
        let pre = PreBindings::default();
        let got = buddy_alloc(&arena, &mut scratch, 2, &pre).unwrap();
        assert_eq!(arena.cell(got).level(), 2);
        assert_eq!(arena.parent(got), Some(tops[0]));
        // scratch now exposes both level-2 children
        assert_eq!(scratch.len_at_level(2), 2);
        // the real list is untouched
        assert_eq!(free.len_at_level(2), 0);
    }

    #[test]
    fn alloc_skips_pre_bound_cells() {
        let (arena, free, _) = chain(1);
        let mut scratch = free.clone();
        let mut pre = PreBindings::default();
        let first = buddy_alloc(&arena, &mut scratch, 2, &pre).unwrap();
        pre.pre_bind(CellId(999), first);
        let second = buddy_alloc(&arena, &mut scratch, 2, &pre).unwrap();
        assert_ne!(first, second);
        pre.pre_bind(CellId(998), second);
        assert!(buddy_alloc(&arena, &mut scratch, 2, &pre).is_none());
    }

    #[test]
    fn remove_splits_and_add_merges() {
        let (mut arena, mut free, tops) = chain(2);
        let mid = arena.children(tops[0])[0];
        remove_cell_from_free_list(&mut arena, &mut free, mid);
        assert!(arena.physical(tops[0]).split);
        // sibling stays free at level 2, the other top cell is untouched
        assert_eq!(free.len_at_level(2), 1);
        assert_eq!(free.len_at_level(3), 1);
        assert!(!free.contains(3, tops[0]));

        add_cell_to_free_list(&mut arena, &mut free, mid);
        assert!(!arena.physical(tops[0]).split);
        assert_eq!(free.len_at_level(2), 0);
        assert_eq!(free.len_at_level(3), 2);
    }

    #[test]
    fn add_stops_merging_below_a_bound_buddy() {
        let (mut arena, mut free, tops) = chain(1);
        let mid_a = arena.children(tops[0])[0];
        let mid_b = arena.children(tops[0])[1];
        remove_cell_from_free_list(&mut arena, &mut free, mid_a);
        remove_cell_from_free_list(&mut arena, &mut free, mid_b);
        // simulate a still-bound buddy
        arena.physical_mut(mid_b).bound_virtual = Some(CellId(999));
        add_cell_to_free_list(&mut arena, &mut free, mid_a);
        assert!(arena.physical(tops[0]).split);
        assert!(free.contains(2, mid_a));
        assert_eq!(free.len_at_level(3), 0);
    }
}
