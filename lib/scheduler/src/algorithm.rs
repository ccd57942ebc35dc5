// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The scheduling orchestrator.
//!
//! [`Scheduler`] owns all mutable state behind one reader-writer lock and
//! exposes the scheduler plugin contract: `schedule` decides placements,
//! `add_allocated_pod` commits them, `delete_allocated_pod` reverses them.
//! Regular-priority requests go through the intra-VC scheduler and are then
//! mapped onto physical cells through the buddy allocator; opportunistic
//! requests place directly over free physical capacity. Preemption is only
//! ever *identified* here: when a new group's cells are held by
//! lower-priority occupants, the verdict lists every pod of every victim
//! group and the group is not recorded — it is retried after the victims
//! clear.
//!
//! All helpers assume the caller holds the lock and never block. Scratch
//! state of one scheduling attempt lives in a [`BindingTx`] and dies with
//! it, so no exit path can leak tentative bindings into the arena.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::RwLock;

use lattice_api::config::ClusterConfig;
use lattice_api::status::{PhysicalCellStatus, VirtualCellStatus};
use lattice_api::types::{
    AffinityGroupMemberBindInfo, CellChain, Pod, PodBindInfo, PodPlacementInfo, PodPreemptInfo,
    PodScheduleResult, PodSchedulingSpec, PodWaitInfo, ReservationId, VirtualClusterName,
};

use crate::binding::{bind_cell, unbind_cell, update_used_gpu_num_at_priority, BindingTx, PreBindings};
use crate::buddy::{
    add_cell_to_free_list, buddy_alloc, min_opportunistic_cell, remove_cell_from_free_list,
};
use crate::cell::{CellArena, CellId, CellPriority};
use crate::chain::{ChainCellList, FreeCellList};
use crate::config::{compile, CompiledState};
use crate::error::{fault, BadRequest, ConfigError, SchedulerError};
use crate::group::AffinityGroup;
use crate::placer::{PodPlacements, TopologyAwarePlacer};
use crate::request::SchedulingRequest;
use crate::status::{physical_cell_status, virtual_cell_status};
use crate::vc::IntraVcScheduler;

/// The topology-aware, multi-tenant GPU scheduler.
pub struct Scheduler {
    state: RwLock<State>,
}

pub(crate) struct State {
    pub(crate) arena: CellArena,
    pub(crate) chain_specs: HashMap<CellChain, lattice_api::config::ChainSpec>,
    pub(crate) full_cell_list: HashMap<CellChain, ChainCellList>,
    pub(crate) free_cell_list: HashMap<CellChain, FreeCellList>,
    pub(crate) chains_by_gpu_type: BTreeMap<String, Vec<CellChain>>,
    pub(crate) sorted_chains: Vec<CellChain>,
    pub(crate) vc_schedulers: HashMap<VirtualClusterName, IntraVcScheduler>,
    pub(crate) opportunistic_schedulers: HashMap<CellChain, TopologyAwarePlacer>,
    pub(crate) reserved_cells: HashMap<VirtualClusterName, HashMap<ReservationId, CellId>>,
    pub(crate) allocated_groups: HashMap<String, AffinityGroup>,
}

impl Scheduler {
    /// Compiles the configuration, validates that the granted quota fits the
    /// physical cluster, and installs the static reservations.
    pub fn new(config: &ClusterConfig) -> Result<Self, ConfigError> {
        let CompiledState {
            arena,
            chain_specs,
            full_cell_list,
            free_cell_list,
            chains_by_gpu_type,
            sorted_chains,
            vc_schedulers,
            reserved_cells,
        } = compile(config)?;

        let opportunistic_schedulers = full_cell_list
            .iter()
            .map(|(chain, list)| (chain.clone(), TopologyAwarePlacer::new(&arena, list.clone())))
            .collect();

        let mut state = State {
            arena,
            chain_specs,
            full_cell_list,
            free_cell_list,
            chains_by_gpu_type,
            sorted_chains,
            vc_schedulers,
            opportunistic_schedulers,
            reserved_cells,
            allocated_groups: HashMap::new(),
        };
        state.validate_initial_assignment()?;
        state.init_reservations();
        state.assert_invariants();
        Ok(Self {
            state: RwLock::new(state),
        })
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config = ClusterConfig::from_yaml_str(yaml)?;
        Self::new(&config)
    }

    /// Decides where a pod should run. Returns a bind verdict with concrete
    /// node and GPU indices, a preempt verdict naming every pod of each
    /// victim group, or a wait verdict when nothing fits.
    pub fn schedule(
        &self,
        pod: &Pod,
        suggested_nodes: &[String],
    ) -> Result<PodScheduleResult, SchedulerError> {
        let mut state = self.state.write();
        let result = state.schedule(pod, suggested_nodes);
        state.assert_invariants();
        result
    }

    /// Commits a placement previously issued by [`Scheduler::schedule`]. The
    /// first pod of a group reconstructs the whole group from its bind info,
    /// which also makes state rebuildable by replay after a restart.
    pub fn add_allocated_pod(&self, pod: &Pod) -> Result<(), SchedulerError> {
        let mut state = self.state.write();
        let result = state.add_allocated_pod(pod);
        state.assert_invariants();
        result
    }

    /// Removes an allocated pod; releasing the last pod of a group tears
    /// down its bindings and returns the capacity to the free lists.
    pub fn delete_allocated_pod(&self, pod: &Pod) -> Result<(), SchedulerError> {
        let mut state = self.state.write();
        let result = state.delete_allocated_pod(pod);
        state.assert_invariants();
        result
    }

    /// Reserved for future reconfiguration; currently a no-op.
    pub fn add_node(&self, _node: &str) {
        let _state = self.state.write();
    }

    /// Reserved for future reconfiguration; currently a no-op.
    pub fn update_node(&self, _old_node: &str, _new_node: &str) {
        let _state = self.state.write();
    }

    /// Reserved for future reconfiguration; currently a no-op.
    pub fn delete_node(&self, _node: &str) {
        let _state = self.state.write();
    }

    /// Status snapshot of every physical chain, top cells first.
    pub fn cluster_status(&self) -> BTreeMap<CellChain, Vec<PhysicalCellStatus>> {
        let state = self.state.read();
        state
            .full_cell_list
            .iter()
            .map(|(chain, list)| {
                let tops = list
                    .at_level(list.top_level())
                    .iter()
                    .map(|top| physical_cell_status(&state.arena, *top))
                    .collect();
                (chain.clone(), tops)
            })
            .collect()
    }

    /// Status snapshot of one VC: its pre-assigned cells (non-reserved and
    /// reserved), deep.
    pub fn virtual_cluster_status(
        &self,
        vc: &VirtualClusterName,
    ) -> Result<Vec<VirtualCellStatus>, SchedulerError> {
        let state = self.state.read();
        let Some(scheduler) = state.vc_schedulers.get(vc) else {
            return Err(BadRequest::UnknownVirtualCluster(vc.clone()).into());
        };
        let mut roots = Vec::new();
        for placer in scheduler.non_reserved().values() {
            for (_, id) in placer.cells().iter() {
                if state.arena.parent(id).is_none() {
                    roots.push(id);
                }
            }
        }
        for placer in scheduler.reserved().values() {
            for (_, id) in placer.cells().iter() {
                if state.arena.parent(id).is_none() {
                    roots.push(id);
                }
            }
        }
        roots.sort();
        Ok(roots
            .into_iter()
            .map(|id| virtual_cell_status(&state.arena, id))
            .collect())
    }
}

impl State {
    /// Checks that the cell assignment granted to all VCs fits the physical
    /// cells: top down per chain, assuming full fan-out below each level.
    fn validate_initial_assignment(&self) -> Result<(), ConfigError> {
        let mut total_quota: BTreeMap<CellChain, BTreeMap<usize, u32>> = BTreeMap::new();
        for scheduler in self.vc_schedulers.values() {
            for (chain, placer) in scheduler.non_reserved() {
                for (level, id) in placer.cells().iter() {
                    if self.arena.parent(id).is_none() {
                        *total_quota
                            .entry(chain.clone())
                            .or_default()
                            .entry(level)
                            .or_insert(0) += 1;
                    }
                }
            }
        }
        for (chain, quota) in &total_quota {
            let top_needed = quota.keys().max().copied().unwrap_or(1);
            let Some(full) = self.full_cell_list.get(chain) else {
                return Err(ConfigError::InsufficientCapacity {
                    chain: chain.clone(),
                    level: top_needed,
                    needed: quota.values().sum(),
                    available: 0,
                });
            };
            let spec = &self.chain_specs[chain];
            let top = full.top_level();
            let mut available = full.at_level(top).len() as u32;
            for level in (1..=top).rev() {
                let needed = quota.get(&level).copied().unwrap_or(0);
                if available < needed {
                    return Err(ConfigError::InsufficientCapacity {
                        chain: chain.clone(),
                        level,
                        needed,
                        available,
                    });
                }
                if level > 1 {
                    available = (available - needed) * spec.levels[level - 1].child_number;
                }
            }
        }
        Ok(())
    }

    /// Creates the permanent bindings for the reserved cells and removes the
    /// reserved physical cells from the free lists.
    fn init_reservations(&mut self) {
        let reservations: Vec<(VirtualClusterName, ReservationId, CellId)> = self
            .reserved_cells
            .iter()
            .flat_map(|(vc, rids)| {
                rids.iter()
                    .map(move |(rid, cell)| (vc.clone(), rid.clone(), *cell))
            })
            .collect();
        for (vc, rid, physical) in reservations {
            let chain = self.arena.cell(physical).chain().clone();
            {
                let Self {
                    arena,
                    free_cell_list,
                    ..
                } = self;
                if let Some(free) = free_cell_list.get_mut(&chain) {
                    remove_cell_from_free_list(arena, free, physical);
                }
            }
            self.arena.physical_mut(physical).reserved = true;
            let placer = &self.vc_schedulers[&vc].reserved()[&rid];
            let top = placer.cells().top_level();
            let virtual_root = placer.cells().at_level(top)[0];
            self.arena.virtual_cell_mut(virtual_root).bound_physical = Some(physical);
            self.arena.physical_mut(physical).bound_virtual = Some(virtual_root);
            tracing::info!(
                virtual_cell = %self.arena.name(virtual_root),
                physical_cell = %self.arena.name(physical),
                reservation = %rid,
                "cells bound (reservation)"
            );
        }
    }

    fn schedule(
        &mut self,
        pod: &Pod,
        suggested_nodes: &[String],
    ) -> Result<PodScheduleResult, SchedulerError> {
        let spec = &pod.scheduling_spec;
        tracing::info!(pod = %pod, group = %spec.affinity_group.name, "scheduling pod");

        if let Some(group) = self.allocated_groups.get(&spec.affinity_group.name) {
            let allocated = group.allocated_pod_count(spec.gpu_number);
            let limit = group
                .total_pod_nums
                .get(&spec.gpu_number)
                .copied()
                .unwrap_or(0);
            if allocated >= limit {
                return Err(BadRequest::PodCountExceeded {
                    group: group.name.clone(),
                    gpu_number: spec.gpu_number,
                    pod_number: limit,
                }
                .into());
            }
            tracing::info!(group = %spec.affinity_group.name, "pod from existing affinity group");
            let physical = group.physical_placement.clone();
            let virtual_placement = group.virtual_placement.clone();
            return self.generate_pod_schedule_result(
                &physical,
                virtual_placement.as_ref(),
                spec.gpu_number,
                allocated,
                false,
                suggested_nodes,
                pod,
            );
        }

        tracing::info!(group = %spec.affinity_group.name, "scheduling new affinity group");
        let (physical, virtual_placement) = self.schedule_new_affinity_group(spec)?;
        match physical {
            None => {
                tracing::info!(group = %spec.affinity_group.name, "failed to schedule affinity group");
                Ok(PodScheduleResult::Wait(PodWaitInfo::default()))
            }
            Some(physical) => self.generate_pod_schedule_result(
                &physical,
                virtual_placement.as_ref(),
                spec.gpu_number,
                0,
                true,
                suggested_nodes,
                pod,
            ),
        }
    }

    /// Schedules each pod of a new affinity group to a set of GPUs, in the
    /// VC and in the physical cluster for regular priority, physical-only
    /// for opportunistic.
    fn schedule_new_affinity_group(
        &mut self,
        spec: &PodSchedulingSpec,
    ) -> Result<(Option<PodPlacements>, Option<PodPlacements>), SchedulerError> {
        let mut shape = BTreeMap::new();
        for member in &spec.affinity_group.members {
            if member.gpu_number < 1 || member.pod_number < 1 {
                return Err(BadRequest::InvalidAffinityGroup {
                    group: spec.affinity_group.name.clone(),
                    reason: format!(
                        "member with gpuNumber {} and podNumber {}",
                        member.gpu_number, member.pod_number
                    ),
                }
                .into());
            }
            *shape.entry(member.gpu_number).or_insert(0) += member.pod_number;
        }
        if !shape.contains_key(&spec.gpu_number) {
            return Err(BadRequest::InvalidAffinityGroup {
                group: spec.affinity_group.name.clone(),
                reason: format!("pod gpuNumber {} is not among the members", spec.gpu_number),
            }
            .into());
        }

        let mut request = SchedulingRequest {
            vc: spec.virtual_cluster.clone(),
            reservation_id: spec.reservation_id.clone(),
            chain: CellChain::default(),
            priority: CellPriority::from_pod_priority(spec.priority),
            affinity_group: shape,
        };
        self.validate_scheduling_request(&request)?;

        let placements = if let Some(rid) = request.reservation_id.clone() {
            tracing::info!(reservation = %rid, "using reservation");
            request.chain = self
                .arena
                .cell(self.reserved_cells[&request.vc][&rid])
                .chain()
                .clone();
            self.process_scheduling_request(&request)?
        } else {
            self.schedule_affinity_group_for_gpu_type(&mut request, spec.gpu_type.as_deref())?
        };
        Ok(match placements {
            Some((physical, virtual_placement)) => (Some(physical), virtual_placement),
            None => (None, None),
        })
    }

    /// Checks the existence of VC and reservation, and the legality of the
    /// priority. These reject without mutating any state.
    fn validate_scheduling_request(
        &self,
        request: &SchedulingRequest,
    ) -> Result<(), SchedulerError> {
        let Some(scheduler) = self.vc_schedulers.get(&request.vc) else {
            return Err(BadRequest::UnknownVirtualCluster(request.vc.clone()).into());
        };
        if let Some(rid) = &request.reservation_id {
            if !scheduler.reserved().contains_key(rid) {
                return Err(BadRequest::UnknownReservation {
                    vc: request.vc.clone(),
                    reservation_id: rid.clone(),
                }
                .into());
            }
            if !request.priority.is_regular() {
                return Err(BadRequest::OpportunisticReservation(rid.clone()).into());
            }
        } else if request.priority > CellPriority::HIGHEST {
            return Err(BadRequest::PriorityOutOfRange(request.priority.0).into());
        }
        Ok(())
    }

    /// Tries the chains containing the requested GPU type, or every chain
    /// when no type is given, in deterministic order.
    fn schedule_affinity_group_for_gpu_type(
        &mut self,
        request: &mut SchedulingRequest,
        gpu_type: Option<&str>,
    ) -> Result<Option<(PodPlacements, Option<PodPlacements>)>, SchedulerError> {
        match gpu_type {
            Some(gpu_type) => {
                let Some(chains) = self.chains_by_gpu_type.get(gpu_type).cloned() else {
                    return Err(BadRequest::UnknownGpuType(gpu_type.to_owned()).into());
                };
                let mut vc_has_type = false;
                for chain in &chains {
                    if self.vc_schedulers[&request.vc]
                        .non_reserved()
                        .contains_key(chain)
                    {
                        vc_has_type = true;
                    }
                    request.chain = chain.clone();
                    if let Some(result) = self.process_scheduling_request(request)? {
                        return Ok(Some(result));
                    }
                }
                if request.priority.is_regular() && !vc_has_type {
                    return Err(BadRequest::GpuTypeNotInVc {
                        gpu_type: gpu_type.to_owned(),
                        vc: request.vc.clone(),
                    }
                    .into());
                }
                Ok(None)
            }
            None => {
                let chains = self.sorted_chains.clone();
                for chain in chains {
                    request.chain = chain;
                    if let Some(result) = self.process_scheduling_request(request)? {
                        return Ok(Some(result));
                    }
                }
                Ok(None)
            }
        }
    }

    /// Routes a request to the VC scheduler or the opportunistic scheduler
    /// according to its priority.
    fn process_scheduling_request(
        &mut self,
        request: &SchedulingRequest,
    ) -> Result<Option<(PodPlacements, Option<PodPlacements>)>, SchedulerError> {
        if request.priority.is_regular() {
            Ok(self
                .schedule_regular_affinity_group(request)?
                .map(|(physical, virtual_placement)| (physical, Some(virtual_placement))))
        } else {
            Ok(self
                .schedule_opportunistic_affinity_group(request)
                .map(|physical| (physical, None)))
        }
    }

    /// Schedules an affinity group in its VC, then maps the virtual
    /// placement to the physical cluster.
    fn schedule_regular_affinity_group(
        &self,
        request: &SchedulingRequest,
    ) -> Result<Option<(PodPlacements, PodPlacements)>, SchedulerError> {
        let Some(virtual_placement) = self.vc_schedulers[&request.vc].schedule(&self.arena, request)
        else {
            return Ok(None);
        };
        let physical = self.map_virtual_placement(&request.chain, &virtual_placement)?;
        Ok(Some((physical, virtual_placement)))
    }

    fn schedule_opportunistic_affinity_group(
        &self,
        request: &SchedulingRequest,
    ) -> Option<PodPlacements> {
        self.opportunistic_schedulers.get(&request.chain)?.place(
            &self.arena,
            &request.affinity_group,
            CellPriority::OPPORTUNISTIC,
        )
    }

    /// Maps every virtual leaf of a placement to a physical leaf. The
    /// pre-assigned ancestor gets a physical cell from the buddy allocator
    /// (on a scratch free list) unless it is already bound; below it, the
    /// virtual subtree is descended in parallel with the physical one,
    /// picking at each step the unbound physical child with minimal
    /// opportunistic usage. All tentative pairings live in the transaction
    /// and vanish with it.
    fn map_virtual_placement(
        &self,
        chain: &CellChain,
        virtual_placement: &PodPlacements,
    ) -> Result<PodPlacements, SchedulerError> {
        let Some(free) = self.free_cell_list.get(chain) else {
            fault!("no physical free list for chain {chain}");
        };
        let mut tx = BindingTx::new(free.clone());
        let mut physical = PodPlacements::new();
        for (gpu_number, pods) in virtual_placement {
            let mapped_pods = physical.entry(*gpu_number).or_default();
            for pod in pods {
                let mut mapped = Vec::with_capacity(pod.len());
                for &virtual_gpu in pod {
                    let pre_assigned = self.arena.virtual_cell(virtual_gpu).pre_assigned;
                    let bound = self
                        .arena
                        .virtual_cell(pre_assigned)
                        .bound_physical
                        .or_else(|| tx.pre.physical_for(pre_assigned));
                    if bound.is_none() {
                        let level = self.arena.cell(pre_assigned).level();
                        let Some(cell) = buddy_alloc(&self.arena, &mut tx.free, level, &tx.pre)
                        else {
                            fault!(
                                "cannot find physical cell for VC cell {}",
                                self.arena.name(pre_assigned)
                            );
                        };
                        tx.pre.pre_bind(pre_assigned, cell);
                    }
                    mapped.push(self.map_non_preassigned_cell(virtual_gpu, &mut tx.pre)?);
                }
                mapped_pods.push(mapped);
            }
        }
        Ok(physical)
    }

    /// Maps one virtual cell inside a pre-assigned subtree to a physical
    /// cell, keeping the inner-cell topology equivalent by recursively
    /// pairing ancestors first.
    fn map_non_preassigned_cell(
        &self,
        virtual_cell: CellId,
        pre: &mut PreBindings,
    ) -> Result<CellId, SchedulerError> {
        if let Some(physical) = self.arena.virtual_cell(virtual_cell).bound_physical {
            return Ok(physical);
        }
        if let Some(physical) = pre.physical_for(virtual_cell) {
            return Ok(physical);
        }
        let Some(parent) = self.arena.parent(virtual_cell) else {
            fault!(
                "virtual cell {} has neither a binding nor a parent during mapping",
                self.arena.name(virtual_cell)
            );
        };
        let parent_physical = self.map_non_preassigned_cell(parent, pre)?;
        let picked = min_opportunistic_cell(
            &self.arena,
            self.arena.children(parent_physical).iter().copied(),
            pre,
        );
        let Some(picked) = picked else {
            fault!(
                "cannot find physical cell for {}",
                self.arena.name(virtual_cell)
            );
        };
        if self.arena.cell(picked).priority() > CellPriority::OPPORTUNISTIC {
            fault!(
                "physical cell {} is used above opportunistic priority during mapping",
                self.arena.name(picked)
            );
        }
        pre.pre_bind(virtual_cell, picked);
        Ok(picked)
    }

    /// Turns a group placement into the verdict for the current pod:
    /// validates the selected node against the candidate set, collects gang
    /// preemption victims for new groups, and emits the bind info.
    #[allow(clippy::too_many_arguments)]
    fn generate_pod_schedule_result(
        &self,
        physical: &PodPlacements,
        virtual_placement: Option<&PodPlacements>,
        current_gpu_num: i32,
        current_pod_index: i32,
        new_group: bool,
        suggested_nodes: &[String],
        pod: &Pod,
    ) -> Result<PodScheduleResult, SchedulerError> {
        let (bind_infos, selected_node, selected_gpus) = self.generate_affinity_group_bind_info(
            physical,
            virtual_placement,
            current_gpu_num,
            current_pod_index,
            pod,
        )?;
        let Some(first) = physical
            .values()
            .flatten()
            .flatten()
            .next()
        else {
            fault!("[{pod}]: empty physical placement");
        };
        let chain = self.arena.cell(*first).chain().clone();

        if !suggested_nodes.iter().any(|n| *n == selected_node) {
            fault!("[{pod}]: node {selected_node} picked by algorithm but not in the candidate set");
        }

        if new_group {
            // gang preemption: every pod of every group holding any of the
            // selected cells
            let mut victim_groups: BTreeSet<String> = BTreeSet::new();
            for cell in physical.values().flatten().flatten() {
                if let Some(group) = &self.arena.physical(*cell).affinity_group {
                    victim_groups.insert(group.clone());
                }
            }
            if !victim_groups.is_empty() {
                let mut victim_pods = Vec::new();
                for group_name in &victim_groups {
                    let Some(group) = self.allocated_groups.get(group_name) else {
                        fault!("victim affinity group {group_name} is not allocated");
                    };
                    for pods in group.allocated_pods.values() {
                        victim_pods.extend(pods.iter().cloned());
                    }
                }
                tracing::info!(
                    pod = %pod,
                    victims = ?victim_pods.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "need to preempt pods"
                );
                return Ok(PodScheduleResult::Preempt(PodPreemptInfo { victim_pods }));
            }
        }

        tracing::info!(
            pod = %pod,
            node = %selected_node,
            gpus = ?selected_gpus,
            "pod scheduled"
        );
        Ok(PodScheduleResult::Bind(PodBindInfo {
            node: selected_node,
            gpu_isolation: selected_gpus,
            cell_chain: chain,
            affinity_group_bind_info: bind_infos,
        }))
    }

    /// Writes the group placement into bind infos and returns the node and
    /// GPU addresses of the current pod.
    fn generate_affinity_group_bind_info(
        &self,
        physical: &PodPlacements,
        virtual_placement: Option<&PodPlacements>,
        current_gpu_num: i32,
        current_pod_index: i32,
        pod: &Pod,
    ) -> Result<(Vec<AffinityGroupMemberBindInfo>, String, Vec<i32>), SchedulerError> {
        let mut bind_infos = Vec::with_capacity(physical.len());
        let mut selected: Option<(String, Vec<i32>)> = None;
        for (gpu_number, pod_placements) in physical {
            let mut member = AffinityGroupMemberBindInfo {
                pod_placements: Vec::with_capacity(pod_placements.len()),
            };
            for (pod_index, gpus) in pod_placements.iter().enumerate() {
                let mut placement = PodPlacementInfo {
                    physical_node: String::new(),
                    physical_gpu_indices: Vec::with_capacity(gpus.len()),
                    virtual_cell_indices: Vec::with_capacity(gpus.len()),
                };
                for (gpu_index, &physical_gpu) in gpus.iter().enumerate() {
                    // each cell here is a single GPU: one node, one index
                    let extension = self.arena.physical(physical_gpu);
                    if placement.physical_node.is_empty() {
                        placement.physical_node = extension.nodes[0].clone();
                    }
                    placement.physical_gpu_indices.push(extension.gpu_indices[0]);
                    let virtual_index = match virtual_placement {
                        Some(virtual_placement) => {
                            let virtual_gpu = virtual_placement
                                .get(gpu_number)
                                .and_then(|pods| pods.get(pod_index))
                                .and_then(|gpus| gpus.get(gpu_index));
                            let Some(virtual_gpu) = virtual_gpu else {
                                fault!(
                                    "[{pod}]: virtual placement missing GPU {gpu_index} of pod \
                                     {pod_index} ({gpu_number} GPUs)"
                                );
                            };
                            self.arena.virtual_cell(*virtual_gpu).index
                        }
                        None => -1,
                    };
                    placement.virtual_cell_indices.push(virtual_index);
                }
                if *gpu_number == current_gpu_num && pod_index as i32 == current_pod_index {
                    selected = Some((
                        placement.physical_node.clone(),
                        placement.physical_gpu_indices.clone(),
                    ));
                }
                member.pod_placements.push(placement);
            }
            bind_infos.push(member);
        }
        let Some((selected_node, selected_gpus)) = selected else {
            fault!("[{pod}]: placement has no entry for the current pod");
        };
        Ok((bind_infos, selected_node, selected_gpus))
    }

    fn add_allocated_pod(&mut self, pod: &Pod) -> Result<(), SchedulerError> {
        let spec = &pod.scheduling_spec;
        let Some(info) = &pod.bind_info else {
            fault!("[{pod}]: pod has no bind info when adding");
        };
        tracing::info!(pod = %pod, group = %spec.affinity_group.name, "adding allocated pod");

        let chain = info.cell_chain.clone();
        if !self.allocated_groups.contains_key(&spec.affinity_group.name) {
            let group = self.reconstruct_group(pod, spec, info, &chain)?;
            tracing::info!(group = %group.name, "new affinity group created");
            self.allocated_groups
                .insert(spec.affinity_group.name.clone(), group);
        }
        let Some(group) = self.allocated_groups.get_mut(&spec.affinity_group.name) else {
            fault!("[{pod}]: group {} missing after admission", spec.affinity_group.name);
        };
        group
            .allocated_pods
            .entry(spec.gpu_number)
            .or_default()
            .push(pod.key());
        tracing::info!(pod = %pod, node = %info.node, gpus = ?info.gpu_isolation, "pod added");
        Ok(())
    }

    /// Rebuilds a group from its bind info, recovering each physical cell by
    /// (chain, node, GPU index) and each virtual cell by its leaf index, and
    /// confirms every leaf allocation.
    fn reconstruct_group(
        &mut self,
        pod: &Pod,
        spec: &PodSchedulingSpec,
        info: &PodBindInfo,
        chain: &CellChain,
    ) -> Result<AffinityGroup, SchedulerError> {
        let mut group = AffinityGroup::new(&spec.affinity_group);
        let mut has_virtual_placement = true;
        let priority = CellPriority::from_pod_priority(spec.priority);
        for member in &info.affinity_group_bind_info {
            let Some(first_placement) = member.pod_placements.first() else {
                fault!("[{pod}]: bind info member without pod placements");
            };
            let gpu_number = first_placement.physical_gpu_indices.len() as i32;
            let mut physical_pods = Vec::with_capacity(member.pod_placements.len());
            let mut virtual_pods = Vec::with_capacity(member.pod_placements.len());
            for placement in &member.pod_placements {
                let node = &placement.physical_node;
                let mut physical_gpus = Vec::with_capacity(placement.physical_gpu_indices.len());
                let mut virtual_gpus = Vec::with_capacity(placement.physical_gpu_indices.len());
                for (gpu_index, &physical_gpu_index) in
                    placement.physical_gpu_indices.iter().enumerate()
                {
                    let Some(physical_gpu) = self.find_physical_gpu(chain, node, physical_gpu_index)
                    else {
                        fault!(
                            "[{pod}]: physical GPU cell not found when adding pod: node {node}, \
                             GPU index {physical_gpu_index}"
                        );
                    };
                    physical_gpus.push(physical_gpu);

                    let mut virtual_gpu = None;
                    if has_virtual_placement {
                        let virtual_cell_index = placement
                            .virtual_cell_indices
                            .get(gpu_index)
                            .copied()
                            .unwrap_or(-1);
                        if virtual_cell_index >= 0 {
                            let found = self.find_virtual_gpu(
                                &spec.virtual_cluster,
                                chain,
                                spec.reservation_id.as_ref(),
                                virtual_cell_index,
                            );
                            let Some(found) = found else {
                                fault!(
                                    "[{pod}]: virtual GPU cell not found when adding pod: \
                                     virtual cell index {virtual_cell_index}"
                                );
                            };
                            virtual_gpus.push(found);
                            virtual_gpu = Some(found);
                        } else {
                            has_virtual_placement = false;
                        }
                    }
                    self.confirm_allocated_gpu(
                        physical_gpu,
                        virtual_gpu,
                        priority,
                        &spec.affinity_group.name,
                    )?;
                }
                physical_pods.push(physical_gpus);
                virtual_pods.push(virtual_gpus);
            }
            group.physical_placement.insert(gpu_number, physical_pods);
            if has_virtual_placement {
                group.virtual_placement
                    .get_or_insert_with(PodPlacements::new)
                    .insert(gpu_number, virtual_pods);
            }
        }
        if !has_virtual_placement {
            group.virtual_placement = None;
        }
        Ok(group)
    }

    fn delete_allocated_pod(&mut self, pod: &Pod) -> Result<(), SchedulerError> {
        let spec = &pod.scheduling_spec;
        tracing::info!(pod = %pod, group = %spec.affinity_group.name, "deleting allocated pod");

        let released = {
            let Some(group) = self.allocated_groups.get_mut(&spec.affinity_group.name) else {
                fault!(
                    "[{pod}]: group {} not exists when deleting pod",
                    spec.affinity_group.name
                );
            };
            let pods = group.allocated_pods.entry(spec.gpu_number).or_default();
            let Some(index) = pods.iter().position(|key| key.uid == pod.uid) else {
                fault!(
                    "[{pod}]: pod not exists in group {}",
                    spec.affinity_group.name
                );
            };
            pods.swap_remove(index);
            if group.is_empty() {
                Some((group.name.clone(), group.physical_placement.clone()))
            } else {
                None
            }
        };

        if let Some((name, placement)) = released {
            for cells in placement.values().flatten() {
                for &cell in cells {
                    self.confirm_released_gpu(cell, &name)?;
                }
            }
            self.allocated_groups.remove(&name);
            tracing::info!(group = %name, "affinity group deleted");
        }
        Ok(())
    }

    /// Creates the cell bindings, removes the newly bound pre-assigned
    /// physical cell from the free list, and raises priorities and usage up
    /// both trees.
    fn confirm_allocated_gpu(
        &mut self,
        physical: CellId,
        virtual_cell: Option<CellId>,
        priority: CellPriority,
        group: &str,
    ) -> Result<(), SchedulerError> {
        let mut physical_priority = priority;
        if let Some(virtual_cell) = virtual_cell {
            let pre_assigned = self.arena.virtual_cell(virtual_cell).pre_assigned;
            let newly_bound = self
                .arena
                .virtual_cell(pre_assigned)
                .bound_physical
                .is_none();
            bind_cell(&mut self.arena, physical, virtual_cell);
            if newly_bound {
                let Some(bound) = self.arena.virtual_cell(pre_assigned).bound_physical else {
                    fault!(
                        "pre-assigned cell {} has no physical binding after bind",
                        self.arena.name(pre_assigned)
                    );
                };
                let chain = self.arena.cell(bound).chain().clone();
                let Self {
                    arena,
                    free_cell_list,
                    ..
                } = self;
                let Some(free) = free_cell_list.get_mut(&chain) else {
                    fault!("no physical free list for chain {chain}");
                };
                remove_cell_from_free_list(arena, free, bound);
            }
            self.arena.cell_mut(virtual_cell).set_priority(priority);
            update_used_gpu_num_at_priority(&mut self.arena, virtual_cell, priority, true);
        } else {
            physical_priority = CellPriority::OPPORTUNISTIC;
        }
        self.arena.cell_mut(physical).set_priority(physical_priority);
        update_used_gpu_num_at_priority(&mut self.arena, physical, physical_priority, true);
        let cell_name = self.arena.name(physical);
        let extension = self.arena.physical_mut(physical);
        if let Some(existing) = &extension.affinity_group {
            tracing::error!(
                cell = %cell_name,
                existing = %existing,
                group = %group,
                "cell already occupied when adding affinity group"
            );
        }
        extension.affinity_group = Some(group.to_owned());
        Ok(())
    }

    /// Destroys the cell bindings, returns the pre-assigned physical cell to
    /// the free list once nothing in its subtree remains bound, and resets
    /// priorities and usage.
    fn confirm_released_gpu(
        &mut self,
        physical: CellId,
        group: &str,
    ) -> Result<(), SchedulerError> {
        if let Some(virtual_cell) = self.arena.physical(physical).bound_virtual {
            let pre_assigned = self.arena.virtual_cell(virtual_cell).pre_assigned;
            let pre_assigned_physical = self.arena.virtual_cell(pre_assigned).bound_physical;
            unbind_cell(&mut self.arena, physical);
            if self
                .arena
                .virtual_cell(pre_assigned)
                .bound_physical
                .is_none()
            {
                let Some(released) = pre_assigned_physical else {
                    fault!(
                        "pre-assigned cell {} had no physical binding on release",
                        self.arena.name(pre_assigned)
                    );
                };
                let chain = self.arena.cell(released).chain().clone();
                let Self {
                    arena,
                    free_cell_list,
                    ..
                } = self;
                let Some(free) = free_cell_list.get_mut(&chain) else {
                    fault!("no physical free list for chain {chain}");
                };
                add_cell_to_free_list(arena, free, released);
            }
            let virtual_priority = self.arena.cell(virtual_cell).priority();
            update_used_gpu_num_at_priority(&mut self.arena, virtual_cell, virtual_priority, false);
            self.arena
                .cell_mut(virtual_cell)
                .set_priority(CellPriority::FREE);
        }
        let physical_priority = self.arena.cell(physical).priority();
        update_used_gpu_num_at_priority(&mut self.arena, physical, physical_priority, false);
        self.arena
            .cell_mut(physical)
            .set_priority(CellPriority::FREE);
        let cell_name = self.arena.name(physical);
        let extension = self.arena.physical_mut(physical);
        match &extension.affinity_group {
            Some(occupant) if occupant == group => {}
            _ => {
                tracing::error!(
                    cell = %cell_name,
                    group = %group,
                    "affinity group not found on cell when deleting"
                );
            }
        }
        extension.affinity_group = None;
        Ok(())
    }

    /// Finds a physical GPU cell by one node and one GPU index. Cells at the
    /// same level never overlap in resources.
    fn find_physical_gpu(&self, chain: &CellChain, node: &str, gpu_index: i32) -> Option<CellId> {
        let list = self.full_cell_list.get(chain)?;
        list.at_level(1).iter().copied().find(|&cell| {
            let extension = self.arena.physical(cell);
            extension.nodes.iter().any(|n| n == node)
                && (gpu_index < 0 || extension.gpu_indices.contains(&gpu_index))
        })
    }

    /// Finds a virtual GPU cell by its leaf index within the VC's
    /// non-reserved list for the chain, or the reservation's list.
    fn find_virtual_gpu(
        &self,
        vc: &VirtualClusterName,
        chain: &CellChain,
        reservation_id: Option<&ReservationId>,
        index: i32,
    ) -> Option<CellId> {
        if index < 0 {
            return None;
        }
        let scheduler = self.vc_schedulers.get(vc)?;
        let cells = match reservation_id {
            Some(rid) => scheduler.reserved().get(rid)?.cells(),
            None => scheduler.non_reserved().get(chain)?.cells(),
        };
        cells
            .at_level(1)
            .iter()
            .copied()
            .find(|&cell| self.arena.virtual_cell(cell).index == index)
    }

    /// Entry-point boundary check of the testable invariants; active in
    /// debug builds.
    fn assert_invariants(&self) {
        #[cfg(debug_assertions)]
        if let Err(violation) = self.check_invariants() {
            panic!("scheduler invariant violated: {violation}");
        }
    }

    /// Verifies the structural invariants: usage sums equal used leaf
    /// counts, the free lists hold exactly the unbound cells under split
    /// parents, bindings are bijective, reserved cells stay bound, and
    /// allocated pod counts stay within the configured numbers.
    pub(crate) fn check_invariants(&self) -> Result<(), String> {
        for (chain, list) in &self.full_cell_list {
            let free = self
                .free_cell_list
                .get(chain)
                .ok_or_else(|| format!("chain {chain} has no free list"))?;
            for (level, cell) in list.iter() {
                self.check_usage_sums(cell)?;
                let extension = self.arena.physical(cell);
                let parent_split = match self.arena.parent(cell) {
                    Some(parent) => self.arena.physical(parent).split,
                    None => true,
                };
                // a split cell is represented in the list by its children
                let should_be_free =
                    parent_split && extension.bound_virtual.is_none() && !extension.split;
                if should_be_free != free.contains(level, cell) {
                    return Err(format!(
                        "free list mismatch for {} (parent split: {parent_split}, split: {}, bound: {})",
                        self.arena.name(cell),
                        extension.split,
                        extension.bound_virtual.is_some(),
                    ));
                }
                if let Some(bound) = extension.bound_virtual {
                    let counterpart = self.arena.virtual_cell(bound).bound_physical;
                    if counterpart != Some(cell) {
                        return Err(format!(
                            "binding of {} is not bijective",
                            self.arena.name(cell)
                        ));
                    }
                    if self.arena.cell(bound).level() != level
                        || self.arena.cell(bound).chain() != chain
                    {
                        return Err(format!(
                            "binding of {} crosses chain or level",
                            self.arena.name(cell)
                        ));
                    }
                }
                if extension.reserved && extension.bound_virtual.is_none() {
                    return Err(format!(
                        "reserved cell {} has no bound virtual cell",
                        self.arena.name(cell)
                    ));
                }
            }
        }
        for scheduler in self.vc_schedulers.values() {
            for placer in scheduler
                .non_reserved()
                .values()
                .chain(scheduler.reserved().values())
            {
                for (_, cell) in placer.cells().iter() {
                    self.check_usage_sums(cell)?;
                    if let Some(bound) = self.arena.virtual_cell(cell).bound_physical {
                        if self.arena.physical(bound).bound_virtual != Some(cell) {
                            return Err(format!(
                                "binding of {} is not bijective",
                                self.arena.name(cell)
                            ));
                        }
                    }
                }
            }
        }
        for group in self.allocated_groups.values() {
            for (gpu_number, pods) in &group.allocated_pods {
                let limit = group.total_pod_nums.get(gpu_number).copied().unwrap_or(0);
                if pods.len() as i32 > limit {
                    return Err(format!(
                        "group {} has {} allocated pods for {gpu_number} GPUs (limit {limit})",
                        group.name,
                        pods.len()
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_usage_sums(&self, cell: CellId) -> Result<(), String> {
        let generic = &self.arena.cell(cell).generic;
        let used: u32 = generic.used_gpu_num_at_priorities.values().sum();
        if used > generic.total_gpu_num {
            return Err(format!(
                "{} uses {used} GPUs of {}",
                self.arena.name(cell),
                generic.total_gpu_num
            ));
        }
        let mut used_leaves = 0;
        let mut stack = vec![cell];
        while let Some(current) = stack.pop() {
            let current_cell = self.arena.cell(current);
            if current_cell.level() == 1 {
                if current_cell.priority() != CellPriority::FREE {
                    used_leaves += 1;
                }
            } else {
                stack.extend_from_slice(self.arena.children(current));
            }
        }
        if used != used_leaves {
            return Err(format!(
                "{} accounts {used} used GPUs but has {used_leaves} used leaves",
                self.arena.name(cell)
            ));
        }
        Ok(())
    }
}
