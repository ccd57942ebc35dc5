// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Internal form of one scheduling request, normalized from a pod spec.

use std::collections::BTreeMap;

use lattice_api::types::{CellChain, ReservationId, VirtualClusterName};

use crate::cell::CellPriority;

#[derive(Debug, Clone)]
pub struct SchedulingRequest {
    pub vc: VirtualClusterName,
    pub reservation_id: Option<ReservationId>,
    /// Chain under consideration; the orchestrator retargets this while it
    /// tries the chains eligible for the request.
    pub chain: CellChain,
    pub priority: CellPriority,
    /// Affinity group shape: gpus per pod -> pod count.
    pub affinity_group: BTreeMap<i32, i32>,
}
