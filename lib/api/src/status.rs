// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Observational status snapshot of the cell trees.
//!
//! A physical cell exposes its bound virtual cell and vice versa; the mirror
//! is shallow (no children, no back-pointer) so the snapshot stays acyclic
//! and serializable.

use serde::{Deserialize, Serialize};

use crate::types::{CellAddress, CellType, VirtualClusterName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellState {
    Free,
    Used,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellHealthiness {
    Healthy,
    Bad,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalCellStatus {
    pub cell_type: CellType,
    pub cell_address: CellAddress,
    pub cell_state: CellState,
    pub cell_healthiness: CellHealthiness,
    pub cell_priority: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cell_children: Vec<PhysicalCellStatus>,
    /// Owning VC when the cell is bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vc: Option<VirtualClusterName>,
    /// Shallow mirror of the bound virtual cell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_cell: Option<Box<VirtualCellStatus>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualCellStatus {
    pub cell_type: CellType,
    pub cell_address: CellAddress,
    pub cell_state: CellState,
    pub cell_healthiness: CellHealthiness,
    pub cell_priority: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cell_children: Vec<VirtualCellStatus>,
    /// Shallow mirror of the bound physical cell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_cell: Option<Box<PhysicalCellStatus>>,
}
