// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Intra-VC scheduling: placing an affinity group within one virtual
//! cluster's quota.
//!
//! Each VC keeps a topology-aware placer per chain over its non-reserved
//! virtual cells and one per reservation over the reserved subtree. The VC
//! scheduler is nothing more than the placer parameterized over virtual
//! cells; quota enforcement falls out of the virtual cell trees themselves.

use std::collections::HashMap;

use lattice_api::types::{CellChain, ReservationId, VirtualClusterName};

use crate::cell::CellArena;
use crate::placer::{PodPlacements, TopologyAwarePlacer};
use crate::request::SchedulingRequest;

#[derive(Debug)]
pub struct IntraVcScheduler {
    vc: VirtualClusterName,
    non_reserved: HashMap<CellChain, TopologyAwarePlacer>,
    reserved: HashMap<ReservationId, TopologyAwarePlacer>,
}

impl IntraVcScheduler {
    pub fn new(
        vc: VirtualClusterName,
        non_reserved: HashMap<CellChain, TopologyAwarePlacer>,
        reserved: HashMap<ReservationId, TopologyAwarePlacer>,
    ) -> Self {
        Self {
            vc,
            non_reserved,
            reserved,
        }
    }

    pub fn vc(&self) -> &VirtualClusterName {
        &self.vc
    }

    pub fn non_reserved(&self) -> &HashMap<CellChain, TopologyAwarePlacer> {
        &self.non_reserved
    }

    pub fn reserved(&self) -> &HashMap<ReservationId, TopologyAwarePlacer> {
        &self.reserved
    }

    /// Places the request's affinity group within this VC's quota on the
    /// request's chain, or on the reservation's cells when a reservation id
    /// is set. Returns the virtual placement, or None when the quota cannot
    /// hold the gang right now.
    pub fn schedule(&self, arena: &CellArena, request: &SchedulingRequest) -> Option<PodPlacements> {
        let placer = match &request.reservation_id {
            Some(rid) => self.reserved.get(rid)?,
            None => self.non_reserved.get(&request.chain)?,
        };
        let placement = placer.place(arena, &request.affinity_group, request.priority);
        match &placement {
            Some(_) => tracing::debug!(vc = %self.vc, chain = %request.chain, "placed affinity group in VC"),
            None => tracing::debug!(vc = %self.vc, chain = %request.chain, "VC quota cannot hold affinity group"),
        }
        placement
    }
}
