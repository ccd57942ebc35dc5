// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Rendering of the observational status snapshot.
//!
//! Snapshots are produced on demand from arena state, so the two sides of a
//! binding can never disagree. The cross-link mirrors are shallow: a
//! physical cell embeds its bound virtual cell without children or
//! back-pointer, and vice versa.

use lattice_api::status::{CellHealthiness, CellState, PhysicalCellStatus, VirtualCellStatus};

use crate::cell::{CellArena, CellId, CellPriority};

fn cell_state(priority: CellPriority) -> CellState {
    if priority == CellPriority::FREE {
        CellState::Free
    } else {
        CellState::Used
    }
}

fn shallow_physical(arena: &CellArena, id: CellId) -> PhysicalCellStatus {
    let generic = &arena.cell(id).generic;
    PhysicalCellStatus {
        cell_type: generic.cell_type.clone(),
        cell_address: generic.address.clone(),
        cell_state: cell_state(generic.priority),
        cell_healthiness: CellHealthiness::Healthy,
        cell_priority: generic.priority.0,
        cell_children: Vec::new(),
        vc: None,
        virtual_cell: None,
    }
}

fn shallow_virtual(arena: &CellArena, id: CellId) -> VirtualCellStatus {
    let generic = &arena.cell(id).generic;
    VirtualCellStatus {
        cell_type: generic.cell_type.clone(),
        cell_address: generic.address.clone(),
        cell_state: cell_state(generic.priority),
        cell_healthiness: CellHealthiness::Healthy,
        cell_priority: generic.priority.0,
        cell_children: Vec::new(),
        physical_cell: None,
    }
}

/// Deep status of a physical cell: children recursively, bound virtual cell
/// shallowly.
pub(crate) fn physical_cell_status(arena: &CellArena, id: CellId) -> PhysicalCellStatus {
    let mut status = shallow_physical(arena, id);
    if let Some(bound) = arena.physical(id).bound_virtual {
        status.vc = Some(arena.virtual_cell(bound).vc.clone());
        status.virtual_cell = Some(Box::new(shallow_virtual(arena, bound)));
    }
    status.cell_children = arena
        .children(id)
        .iter()
        .map(|child| physical_cell_status(arena, *child))
        .collect();
    status
}

/// Deep status of a virtual cell: children recursively, bound physical cell
/// shallowly.
pub(crate) fn virtual_cell_status(arena: &CellArena, id: CellId) -> VirtualCellStatus {
    let mut status = shallow_virtual(arena, id);
    if let Some(bound) = arena.virtual_cell(id).bound_physical {
        status.physical_cell = Some(Box::new(shallow_physical(arena, bound)));
    }
    status.cell_children = arena
        .children(id)
        .iter()
        .map(|child| virtual_cell_status(arena, *child))
        .collect();
    status
}
