// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Level-indexed views of the cells of one topology chain.
//!
//! [`ChainCellList`] is the ordered full view used by the placers and the
//! recovery lookups. [`FreeCellList`] is the buddy allocator's working set: a
//! per-level *set* of currently free cells, so membership updates during
//! split and merge stay O(log n) and iteration order is deterministic.

use std::collections::BTreeSet;

use crate::cell::{CellId, CellLevel};

/// Cells of one chain grouped by level (1-based).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainCellList {
    levels: Vec<Vec<CellId>>,
}

impl ChainCellList {
    pub fn new(top_level: CellLevel) -> Self {
        Self {
            levels: vec![Vec::new(); top_level],
        }
    }

    pub fn top_level(&self) -> CellLevel {
        self.levels.len()
    }

    pub fn at_level(&self, level: CellLevel) -> &[CellId] {
        self.levels
            .get(level.wrapping_sub(1))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn push(&mut self, level: CellLevel, id: CellId) {
        self.levels[level - 1].push(id);
    }

    pub fn remove(&mut self, level: CellLevel, id: CellId) {
        self.levels[level - 1].retain(|c| *c != id);
    }

    pub fn contains(&self, level: CellLevel, id: CellId) -> bool {
        self.at_level(level).contains(&id)
    }

    /// All cells across levels, bottom up.
    pub fn iter(&self) -> impl Iterator<Item = (CellLevel, CellId)> + '_ {
        self.levels
            .iter()
            .enumerate()
            .flat_map(|(i, cells)| cells.iter().map(move |c| (i + 1, *c)))
    }
}

/// The free cells of one chain, grouped by level. A level holds only cells
/// whose parent has been split; the top level always holds all unsplit top
/// cells.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeCellList {
    levels: Vec<BTreeSet<CellId>>,
}

impl FreeCellList {
    pub fn new(top_level: CellLevel) -> Self {
        Self {
            levels: vec![BTreeSet::new(); top_level],
        }
    }

    pub fn top_level(&self) -> CellLevel {
        self.levels.len()
    }

    pub fn at_level(&self, level: CellLevel) -> impl Iterator<Item = CellId> + '_ {
        self.levels
            .get(level.wrapping_sub(1))
            .into_iter()
            .flat_map(|s| s.iter().copied())
    }

    pub fn len_at_level(&self, level: CellLevel) -> usize {
        self.levels
            .get(level.wrapping_sub(1))
            .map(BTreeSet::len)
            .unwrap_or(0)
    }

    pub fn insert(&mut self, level: CellLevel, id: CellId) {
        self.levels[level - 1].insert(id);
    }

    pub fn remove(&mut self, level: CellLevel, id: CellId) -> bool {
        self.levels[level - 1].remove(&id)
    }

    pub fn contains(&self, level: CellLevel, id: CellId) -> bool {
        self.levels
            .get(level.wrapping_sub(1))
            .is_some_and(|s| s.contains(&id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (CellLevel, CellId)> + '_ {
        self.levels
            .iter()
            .enumerate()
            .flat_map(|(i, cells)| cells.iter().map(move |c| (i + 1, *c)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_cell_list_push_and_remove() {
        let mut list = ChainCellList::new(2);
        list.push(1, CellId(0));
        list.push(1, CellId(1));
        list.push(2, CellId(2));
        assert_eq!(list.at_level(1), &[CellId(0), CellId(1)]);
        list.remove(1, CellId(0));
        assert_eq!(list.at_level(1), &[CellId(1)]);
        assert_eq!(list.at_level(3), &[] as &[CellId]);
        assert_eq!(list.iter().count(), 2);
    }

    #[test]
    fn free_cell_list_is_deterministic() {
        let mut free = FreeCellList::new(1);
        free.insert(1, CellId(3));
        free.insert(1, CellId(1));
        free.insert(1, CellId(2));
        let order: Vec<_> = free.at_level(1).collect();
        assert_eq!(order, vec![CellId(1), CellId(2), CellId(3)]);
        assert!(free.remove(1, CellId(2)));
        assert!(!free.remove(1, CellId(2)));
        assert!(free.contains(1, CellId(1)));
    }
}
