// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Topology-aware placement of an affinity group over one chain.
//!
//! The placer is parameterized over the arena: the intra-VC scheduler runs
//! it over virtual cells, the opportunistic scheduler over physical cells.
//! Pods demanding more GPUs are placed first (they need the tightest
//! affinity); each pod lands in the single lowest-level cell that can hold
//! it, selected best-fit so large free cells survive for later requests.
//!
//! A GPU is usable at priority `p` when it is free or held by an occupant
//! `p` may evict. Occupants at equal or higher priority block the GPU;
//! so do regular occupants regardless of `p` — conflicts among regular
//! priorities resolve to a wait verdict, never to eviction.
//!
//! Placement never mutates the cells: GPUs consumed earlier in the same
//! attempt are tracked in a scratch usage overlay.

use std::collections::{BTreeMap, HashMap};

use crate::cell::{CellArena, CellId, CellLevel, CellPriority};
use crate::chain::ChainCellList;

/// Placement of a whole affinity group: for each gpus-per-pod class, one
/// cell list per pod with one level-1 cell per GPU.
pub type PodPlacements = BTreeMap<i32, Vec<Vec<CellId>>>;

/// GPUs consumed by the current attempt, per cell subtree.
type UsageOverlay = HashMap<CellId, u32>;

#[derive(Debug, Clone)]
pub struct TopologyAwarePlacer {
    cells: ChainCellList,
    /// GPUs per cell at each level (index `level - 1`).
    level_gpu_nums: Vec<u32>,
}

impl TopologyAwarePlacer {
    pub fn new(arena: &CellArena, cells: ChainCellList) -> Self {
        let level_gpu_nums = (1..=cells.top_level())
            .map(|level| {
                cells
                    .at_level(level)
                    .first()
                    .map(|c| arena.cell(*c).total_gpu_num())
                    .unwrap_or(0)
            })
            .collect();
        Self {
            cells,
            level_gpu_nums,
        }
    }

    pub fn cells(&self) -> &ChainCellList {
        &self.cells
    }

    /// Places `{gpus_per_pod -> pod_count}` at the given priority. Returns
    /// None when the gang does not fit as a whole.
    pub fn place(
        &self,
        arena: &CellArena,
        shape: &BTreeMap<i32, i32>,
        priority: CellPriority,
    ) -> Option<PodPlacements> {
        let mut overlay = UsageOverlay::new();
        let mut placements = PodPlacements::new();
        // larger pods first
        for (&gpu_number, &pod_number) in shape.iter().rev() {
            let need = gpu_number as u32;
            let level = self.placement_level(need)?;
            let pods = placements.entry(gpu_number).or_default();
            for _ in 0..pod_number {
                let cell = self.select_cell(arena, level, need, priority, &overlay)?;
                let gpus = take_gpus(arena, cell, need, priority, &mut overlay);
                if gpus.len() != need as usize {
                    return None;
                }
                pods.push(gpus);
            }
        }
        Some(placements)
    }

    /// Lowest level whose cells are large enough for one pod.
    fn placement_level(&self, gpu_number: u32) -> Option<CellLevel> {
        (1..=self.cells.top_level()).find(|level| {
            !self.cells.at_level(*level).is_empty() && self.level_gpu_nums[*level - 1] >= gpu_number
        })
    }

    /// Best-fit cell at `level`: the eligible cell with the fewest usable
    /// GPUs that still fits the pod; first one in list order wins ties.
    fn select_cell(
        &self,
        arena: &CellArena,
        level: CellLevel,
        need: u32,
        priority: CellPriority,
        overlay: &UsageOverlay,
    ) -> Option<CellId> {
        let mut best: Option<(u32, CellId)> = None;
        for id in self.cells.at_level(level) {
            let usable = usable_gpu_num(arena, *id, priority, overlay);
            if usable < need {
                continue;
            }
            if best.map_or(true, |(u, _)| usable < u) {
                best = Some((usable, *id));
            }
        }
        best.map(|(_, id)| id)
    }
}

/// GPUs of `cell` a request at `priority` could take right now.
fn usable_gpu_num(
    arena: &CellArena,
    cell: CellId,
    priority: CellPriority,
    overlay: &UsageOverlay,
) -> u32 {
    let generic = &arena.cell(cell).generic;
    let blocked: u32 = generic
        .used_gpu_num_at_priorities
        .iter()
        .filter(|(occupant, _)| !priority.can_evict(**occupant))
        .map(|(_, count)| *count)
        .sum();
    let taken = overlay.get(&cell).copied().unwrap_or(0);
    generic
        .total_gpu_num
        .saturating_sub(blocked)
        .saturating_sub(taken)
}

/// Collects `need` leaf GPUs from `cell`'s subtree, preferring to exhaust as
/// few children as possible (best fit per step). The caller guarantees the
/// subtree has `need` usable GPUs.
fn take_gpus(
    arena: &CellArena,
    cell: CellId,
    need: u32,
    priority: CellPriority,
    overlay: &mut UsageOverlay,
) -> Vec<CellId> {
    if arena.cell(cell).level() == 1 {
        debug_assert_eq!(need, 1);
        consume_gpu(arena, overlay, cell);
        return vec![cell];
    }
    let mut picked = Vec::new();
    let mut remaining = need;
    while remaining > 0 {
        let mut fitting: Option<(u32, CellId)> = None;
        let mut fullest: Option<(u32, CellId)> = None;
        for child in arena.children(cell) {
            let usable = usable_gpu_num(arena, *child, priority, overlay);
            if usable == 0 {
                continue;
            }
            if usable >= remaining && fitting.map_or(true, |(u, _)| usable < u) {
                fitting = Some((usable, *child));
            }
            if fullest.map_or(true, |(u, _)| usable > u) {
                fullest = Some((usable, *child));
            }
        }
        let Some((usable, child)) = fitting.or(fullest) else {
            break;
        };
        let take = remaining.min(usable);
        picked.extend(take_gpus(arena, child, take, priority, overlay));
        remaining -= take;
    }
    picked
}

/// Marks one leaf GPU as consumed by this attempt, on the leaf and every
/// ancestor.
fn consume_gpu(arena: &CellArena, overlay: &mut UsageOverlay, leaf: CellId) {
    let mut current = Some(leaf);
    while let Some(id) = current {
        *overlay.entry(id).or_insert(0) += 1;
        current = arena.parent(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::update_used_gpu_num_at_priority;
    use crate::cell::Cell;
    use rstest::rstest;

    /// One chain with `tops` top cells at level 3 (8 GPUs), each split into
    /// two level-2 cells of 4 GPUs.
    fn chain(tops: usize) -> (CellArena, ChainCellList) {
        let mut arena = CellArena::new();
        let mut list = ChainCellList::new(3);
        for t in 0..tops {
            let top = arena.insert(Cell::new_physical(
                "CT1".into(),
                3,
                "T3".into(),
                format!("CT1/{t}").into(),
                true,
                8,
            ));
            list.push(3, top);
            for m in 0..2 {
                let mid = arena.insert(Cell::new_physical(
                    "CT1".into(),
                    2,
                    "T2".into(),
                    format!("CT1/{t}/{m}").into(),
                    false,
                    4,
                ));
                arena.cell_mut(mid).generic.parent = Some(top);
                arena.cell_mut(top).generic.children.push(mid);
                list.push(2, mid);
                for g in 0..4 {
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
                    list.push(1, leaf);
                }
            }
        }
        (arena, list)
    }

    fn shape(pairs: &[(i32, i32)]) -> BTreeMap<i32, i32> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn gang_lands_in_sibling_subtrees() {
        let (arena, list) = chain(1);
        let placer = TopologyAwarePlacer::new(&arena, list);
        let placement = placer
            .place(&arena, &shape(&[(4, 2)]), CellPriority::REGULAR)
            .unwrap();
        let pods = &placement[&4];
        assert_eq!(pods.len(), 2);
        assert_eq!(pods[0].len(), 4);
        // the two pods occupy the two level-2 siblings, disjointly
        let parent_of = |gpus: &Vec<CellId>| arena.parent(gpus[0]).unwrap();
        assert_ne!(parent_of(&pods[0]), parent_of(&pods[1]));
        let mut all: Vec<CellId> = pods.iter().flatten().copied().collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 8);
    }

    #[test]
    fn larger_pods_are_placed_first() {
        let (arena, list) = chain(1);
        let placer = TopologyAwarePlacer::new(&arena, list);
        // 4+2+2 fits an 8-GPU cell only if the 4 takes a whole level-2 cell
        let placement = placer
            .place(&arena, &shape(&[(4, 1), (2, 2)]), CellPriority::REGULAR)
            .unwrap();
        let four = &placement[&4][0];
        assert_eq!(four.len(), 4);
        let mid = arena.parent(four[0]).unwrap();
        assert!(four.iter().all(|g| arena.parent(*g) == Some(mid)));
    }

    #[test]
    fn best_fit_prefers_the_tighter_cell() {
        let (mut arena, list) = chain(2);
        // one GPU of the last level-2 cell is already used, leaving 3 usable
        let top1 = list.at_level(3)[1];
        let mid = arena.children(top1)[1];
        let leaf = arena.children(mid)[0];
        arena.cell_mut(leaf).set_priority(CellPriority::OPPORTUNISTIC);
        update_used_gpu_num_at_priority(&mut arena, leaf, CellPriority::OPPORTUNISTIC, true);
        let placer = TopologyAwarePlacer::new(&arena, list.clone());
        let placement = placer
            .place(&arena, &shape(&[(3, 1)]), CellPriority::OPPORTUNISTIC)
            .unwrap();
        // a 3-GPU pod fits the 3-GPU remainder exactly; the wholly free
        // level-2 cells stay intact
        let gpus = &placement[&3][0];
        assert!(gpus.iter().all(|g| arena.parent(*g) == Some(mid)));
        assert!(!gpus.contains(&leaf));
    }

    #[rstest]
    #[case(CellPriority::REGULAR, true)]
    #[case(CellPriority::OPPORTUNISTIC, false)]
    fn opportunistic_occupants_block_only_opportunistic_requests(
        #[case] priority: CellPriority,
        #[case] fits: bool,
    ) {
        let (mut arena, list) = chain(1);
        for (level, id) in list.iter() {
            if level == 1 {
                arena.cell_mut(id).set_priority(CellPriority::OPPORTUNISTIC);
                update_used_gpu_num_at_priority(&mut arena, id, CellPriority::OPPORTUNISTIC, true);
            }
        }
        let placer = TopologyAwarePlacer::new(&arena, list);
        let placement = placer.place(&arena, &shape(&[(8, 1)]), priority);
        assert_eq!(placement.is_some(), fits);
    }

    #[test]
    fn regular_occupants_never_yield() {
        let (mut arena, list) = chain(1);
        let leaf = list.at_level(1)[0];
        arena.cell_mut(leaf).set_priority(CellPriority::REGULAR);
        update_used_gpu_num_at_priority(&mut arena, leaf, CellPriority::REGULAR, true);
        let placer = TopologyAwarePlacer::new(&arena, list);
        // even a higher regular priority waits instead of evicting
        assert!(placer
            .place(&arena, &shape(&[(8, 1)]), CellPriority(5))
            .is_none());
        assert!(placer
            .place(&arena, &shape(&[(4, 1)]), CellPriority(5))
            .is_some());
    }

    #[test]
    fn gang_fails_as_a_whole() {
        let (arena, list) = chain(1);
        let placer = TopologyAwarePlacer::new(&arena, list);
        // three 4-GPU pods exceed the chain; nothing is returned at all
        assert!(placer
            .place(&arena, &shape(&[(4, 3)]), CellPriority::REGULAR)
            .is_none());
    }
}
