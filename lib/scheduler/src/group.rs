// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Allocated affinity groups: gang-scheduled units sharing one placement.
//!
//! A group comes to life when its first pod is committed through
//! `add_allocated_pod`, is shared by all pods of the gang, and is destroyed
//! when the last allocated pod is removed.

use std::collections::BTreeMap;

use lattice_api::types::{AffinityGroupSpec, PodKey};

use crate::placer::PodPlacements;

#[derive(Debug, Clone, PartialEq)]
pub struct AffinityGroup {
    pub(crate) name: String,
    /// Configured pod count per gpus-per-pod class.
    pub(crate) total_pod_nums: BTreeMap<i32, i32>,
    pub(crate) physical_placement: PodPlacements,
    /// None for groups placed opportunistically.
    pub(crate) virtual_placement: Option<PodPlacements>,
    /// Pods committed so far, per gpus-per-pod class.
    pub(crate) allocated_pods: BTreeMap<i32, Vec<PodKey>>,
}

impl AffinityGroup {
    pub fn new(spec: &AffinityGroupSpec) -> Self {
        let mut total_pod_nums = BTreeMap::new();
        for member in &spec.members {
            *total_pod_nums.entry(member.gpu_number).or_insert(0) += member.pod_number;
        }
        Self {
            name: spec.name.clone(),
            total_pod_nums,
            physical_placement: PodPlacements::new(),
            virtual_placement: Some(PodPlacements::new()),
            allocated_pods: BTreeMap::new(),
        }
    }

    pub fn allocated_pod_count(&self, gpu_number: i32) -> i32 {
        self.allocated_pods
            .get(&gpu_number)
            .map_or(0, |pods| pods.len() as i32)
    }

    pub fn is_empty(&self) -> bool {
        self.allocated_pods.values().all(Vec::is_empty)
    }
}
