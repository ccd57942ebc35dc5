// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! External types for the Lattice scheduler.
//!
//! Everything the host framework exchanges with the scheduling algorithm lives
//! here: the scheduling spec attached to a pod, the bind info produced by a
//! successful placement, the three-way schedule verdict, the cluster/VC
//! configuration, and the observational status snapshot. No algorithm logic —
//! these are plain serde types so the glue layers (CRD clients, watch loops,
//! annotation codecs) can depend on this crate alone.

pub mod config;
pub mod status;
pub mod types;

pub use config::{
    ChainSpec, ClusterConfig, ConfigError, LevelSpec, PhysicalCellSpec, PhysicalClusterConfig,
    ReservationSpec, VirtualCellSpec, VirtualClusterConfig,
};
pub use status::{CellHealthiness, CellState, PhysicalCellStatus, VirtualCellStatus};
pub use types::{
    AffinityGroupMemberBindInfo, AffinityGroupMemberSpec, AffinityGroupSpec, CellAddress,
    CellChain, CellType, Pod, PodBindInfo, PodKey, PodPlacementInfo, PodPreemptInfo,
    PodScheduleResult, PodSchedulingSpec, PodWaitInfo, ReservationId, VirtualClusterName,
    HIGHEST_PRIORITY, OPPORTUNISTIC_PRIORITY, REGULAR_PRIORITY,
};
