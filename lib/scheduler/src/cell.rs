// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The cell model.
//!
//! A cell represents a set of GPUs affinitized by their interconnection
//! topology. Cells form level-indexed trees (level 1 is a single GPU); all
//! cells — physical cells of every chain and virtual cells of every VC — live
//! in one [`CellArena`] and reference parent, children, and the bound
//! counterpart by [`CellId`]. This keeps the inherently cyclic
//! physical↔virtual and parent↔children relations out of the ownership
//! graph.
//!
//! [`Cell`] is a tagged variant over a shared generic record: the per-variant
//! extensions are reached through explicit downcasts ([`CellArena::physical`]
//! / [`CellArena::virtual_cell`]), which only happen where the tree kind is
//! structurally known.

use std::collections::BTreeMap;
use std::fmt;

use lattice_api::types::{
    CellAddress, CellChain, CellType, ReservationId, VirtualClusterName, HIGHEST_PRIORITY,
    REGULAR_PRIORITY,
};

/// Depth in a cell tree; level 1 is a single GPU.
pub type CellLevel = usize;

/// Priority a cell is used at. Signed, with reserved low values: free
/// (unallocated), opportunistic (best effort), and regular priorities from
/// zero up to [`CellPriority::HIGHEST`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellPriority(pub i32);

impl CellPriority {
    pub const FREE: CellPriority = CellPriority(-2);
    pub const OPPORTUNISTIC: CellPriority = CellPriority(-1);
    pub const REGULAR: CellPriority = CellPriority(REGULAR_PRIORITY);
    pub const HIGHEST: CellPriority = CellPriority(HIGHEST_PRIORITY);

    /// Maps a pod spec priority: anything below regular is normalized to
    /// opportunistic.
    pub fn from_pod_priority(priority: i32) -> Self {
        if priority < REGULAR_PRIORITY {
            Self::OPPORTUNISTIC
        } else {
            Self(priority)
        }
    }

    pub fn is_regular(self) -> bool {
        self >= Self::REGULAR
    }

    /// Whether a request at `self` may displace an occupant at `occupant`.
    /// Regular pods displace opportunistic occupants; conflicts between
    /// regular priorities are never resolved by eviction.
    pub fn can_evict(self, occupant: CellPriority) -> bool {
        self.is_regular() && occupant == Self::OPPORTUNISTIC
    }
}

impl fmt::Display for CellPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Arena index of a cell. Identity: two ids are the same cell; the address
/// is the human-readable stable identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellId(pub(crate) u32);

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State shared by physical and virtual cells.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericCell {
    pub(crate) chain: CellChain,
    pub(crate) level: CellLevel,
    pub(crate) cell_type: CellType,
    pub(crate) address: CellAddress,
    pub(crate) priority: CellPriority,
    pub(crate) parent: Option<CellId>,
    pub(crate) children: Vec<CellId>,
    pub(crate) at_or_above_node: bool,
    pub(crate) total_gpu_num: u32,
    /// GPU count in use per priority across the subtree. Invariant: the
    /// values sum to at most `total_gpu_num`; zero entries are removed.
    pub(crate) used_gpu_num_at_priorities: BTreeMap<CellPriority, u32>,
}

impl GenericCell {
    pub fn used_gpu_num_at_priority(&self, priority: CellPriority) -> u32 {
        self.used_gpu_num_at_priorities
            .get(&priority)
            .copied()
            .unwrap_or(0)
    }

    pub fn increase_used_gpu_num_at_priority(&mut self, priority: CellPriority, delta: i32) {
        let counter = self
            .used_gpu_num_at_priorities
            .entry(priority)
            .or_insert(0);
        if delta >= 0 {
            *counter += delta as u32;
        } else {
            debug_assert!(*counter >= delta.unsigned_abs());
            *counter = counter.saturating_sub(delta.unsigned_abs());
        }
        if *counter == 0 {
            self.used_gpu_num_at_priorities.remove(&priority);
        }
    }
}

/// Physical extension: a cell in the real cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalCell {
    /// Node names inside the cell.
    pub(crate) nodes: Vec<String>,
    /// GPU indices within the nodes; `[-1]` for cells above node level.
    pub(crate) gpu_indices: Vec<i32>,
    pub(crate) bound_virtual: Option<CellId>,
    /// True when the children sit in the free list instead of this cell.
    pub(crate) split: bool,
    /// True for statically reserved cells; their binding is permanent.
    pub(crate) reserved: bool,
    /// Name of the affinity group currently occupying this cell.
    pub(crate) affinity_group: Option<String>,
}

/// Virtual extension: a cell in a VC's quota.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualCell {
    pub(crate) vc: VirtualClusterName,
    pub(crate) reservation_id: Option<ReservationId>,
    /// The topmost granted ancestor; allocation binds physical capacity at
    /// this cell's level.
    pub(crate) pre_assigned: CellId,
    /// Stable position among the level-1 cells of the owning cell list; what
    /// bind info refers to.
    pub(crate) index: i32,
    pub(crate) bound_physical: Option<CellId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellKind {
    Physical(PhysicalCell),
    Virtual(VirtualCell),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub(crate) generic: GenericCell,
    pub(crate) kind: CellKind,
}

impl Cell {
    pub fn new_physical(
        chain: CellChain,
        level: CellLevel,
        cell_type: CellType,
        address: CellAddress,
        at_or_above_node: bool,
        total_gpu_num: u32,
    ) -> Self {
        Cell {
            generic: GenericCell {
                chain,
                level,
                cell_type,
                address,
                priority: CellPriority::FREE,
                parent: None,
                children: Vec::new(),
                at_or_above_node,
                total_gpu_num,
                used_gpu_num_at_priorities: BTreeMap::new(),
            },
            kind: CellKind::Physical(PhysicalCell {
                nodes: Vec::new(),
                gpu_indices: Vec::new(),
                bound_virtual: None,
                split: false,
                reserved: false,
                affinity_group: None,
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_virtual(
        chain: CellChain,
        level: CellLevel,
        cell_type: CellType,
        address: CellAddress,
        at_or_above_node: bool,
        total_gpu_num: u32,
        vc: VirtualClusterName,
        pre_assigned: CellId,
    ) -> Self {
        Cell {
            generic: GenericCell {
                chain,
                level,
                cell_type,
                address,
                priority: CellPriority::FREE,
                parent: None,
                children: Vec::new(),
                at_or_above_node,
                total_gpu_num,
                used_gpu_num_at_priorities: BTreeMap::new(),
            },
            kind: CellKind::Virtual(VirtualCell {
                vc,
                reservation_id: None,
                pre_assigned,
                index: -1,
                bound_physical: None,
            }),
        }
    }

    pub fn chain(&self) -> &CellChain {
        &self.generic.chain
    }

    pub fn level(&self) -> CellLevel {
        self.generic.level
    }

    pub fn address(&self) -> &CellAddress {
        &self.generic.address
    }

    pub fn priority(&self) -> CellPriority {
        self.generic.priority
    }

    pub fn set_priority(&mut self, priority: CellPriority) {
        self.generic.priority = priority;
    }

    pub fn total_gpu_num(&self) -> u32 {
        self.generic.total_gpu_num
    }

    pub fn at_or_above_node(&self) -> bool {
        self.generic.at_or_above_node
    }

    pub fn as_physical(&self) -> Option<&PhysicalCell> {
        match &self.kind {
            CellKind::Physical(p) => Some(p),
            CellKind::Virtual(_) => None,
        }
    }

    pub fn as_virtual(&self) -> Option<&VirtualCell> {
        match &self.kind {
            CellKind::Physical(_) => None,
            CellKind::Virtual(v) => Some(v),
        }
    }
}

/// Cells compare equal iff both are absent or both carry the same address.
pub fn cell_equal(arena: &CellArena, a: Option<CellId>, b: Option<CellId>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => arena.cell(a).address() == arena.cell(b).address(),
        _ => false,
    }
}

/// Owner of every cell. Ids are dense indices; cells are never removed, the
/// topology is fixed at construction.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CellArena {
    cells: Vec<Cell>,
}

impl CellArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// The id the next inserted cell will get. Lets tree builders point a
    /// root's `pre_assigned` at itself.
    pub fn next_id(&self) -> CellId {
        CellId(self.cells.len() as u32)
    }

    pub fn insert(&mut self, cell: Cell) -> CellId {
        let id = self.next_id();
        self.cells.push(cell);
        id
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cell(&self, id: CellId) -> &Cell {
        &self.cells[id.0 as usize]
    }

    pub fn cell_mut(&mut self, id: CellId) -> &mut Cell {
        &mut self.cells[id.0 as usize]
    }

    pub fn parent(&self, id: CellId) -> Option<CellId> {
        self.cell(id).generic.parent
    }

    pub fn children(&self, id: CellId) -> &[CellId] {
        &self.cell(id).generic.children
    }

    /// Downcast to the physical extension. The tree kind is structurally
    /// known at every call site; a mismatch is a construction bug.
    pub fn physical(&self, id: CellId) -> &PhysicalCell {
        match &self.cell(id).kind {
            CellKind::Physical(p) => p,
            CellKind::Virtual(_) => panic!("cell {id} is not physical"),
        }
    }

    pub fn physical_mut(&mut self, id: CellId) -> &mut PhysicalCell {
        match &mut self.cell_mut(id).kind {
            CellKind::Physical(p) => p,
            CellKind::Virtual(_) => panic!("cell {id} is not physical"),
        }
    }

    pub fn virtual_cell(&self, id: CellId) -> &VirtualCell {
        match &self.cell(id).kind {
            CellKind::Virtual(v) => v,
            CellKind::Physical(_) => panic!("cell {id} is not virtual"),
        }
    }

    pub fn virtual_cell_mut(&mut self, id: CellId) -> &mut VirtualCell {
        match &mut self.cell_mut(id).kind {
            CellKind::Virtual(v) => v,
            CellKind::Physical(_) => panic!("cell {id} is not virtual"),
        }
    }

    /// Human-readable name for log events.
    pub fn name(&self, id: CellId) -> String {
        let cell = self.cell(id);
        match &cell.kind {
            CellKind::Physical(_) => format!("physical cell {}", cell.generic.address),
            CellKind::Virtual(v) => format!("virtual cell {}/{}", v.vc, cell.generic.address),
        }
    }
}
