// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Compilation of a [`ClusterConfig`] into scheduler state.
//!
//! Builds the physical cell trees per chain (fanning node names and GPU
//! indices out over the declared level shapes), the per-VC virtual trees for
//! every quota grant and reservation, and the lookup tables the orchestrator
//! needs. Addresses are stable ordinals: top cell `i` of chain `CT1` is
//! `CT1/i`, its `j`-th child `CT1/i/j`, and so on; reservation specs refer
//! to these addresses.

use std::collections::{BTreeMap, HashMap};

use lattice_api::config::{ChainSpec, ClusterConfig};
use lattice_api::types::{CellAddress, CellChain, ReservationId, VirtualClusterName};

use crate::cell::{Cell, CellArena, CellId, CellLevel};
use crate::chain::{ChainCellList, FreeCellList};
use crate::error::ConfigError;
use crate::placer::TopologyAwarePlacer;
use crate::vc::IntraVcScheduler;

/// Everything `Scheduler::new` needs, fully built but not yet validated
/// against capacity and with reservations not yet installed.
pub(crate) struct CompiledState {
    pub arena: CellArena,
    pub chain_specs: HashMap<CellChain, ChainSpec>,
    pub full_cell_list: HashMap<CellChain, ChainCellList>,
    pub free_cell_list: HashMap<CellChain, FreeCellList>,
    pub chains_by_gpu_type: BTreeMap<String, Vec<CellChain>>,
    /// All chains in deterministic order, for requests without a GPU type.
    pub sorted_chains: Vec<CellChain>,
    pub vc_schedulers: HashMap<VirtualClusterName, IntraVcScheduler>,
    /// VC -> reservation id -> reserved physical cell.
    pub reserved_cells: HashMap<VirtualClusterName, HashMap<ReservationId, CellId>>,
}

/// GPUs per cell at `level` (level 1 is one GPU).
fn gpu_num_at_level(spec: &ChainSpec, level: CellLevel) -> u32 {
    spec.levels[1..level]
        .iter()
        .map(|l| l.child_number)
        .product()
}

/// Nodes covered by one cell at `level`; 1 at or below the node boundary.
fn nodes_in_subtree(spec: &ChainSpec, level: CellLevel) -> usize {
    let node_level = spec.node_level();
    if level <= node_level {
        1
    } else {
        spec.levels[node_level..level]
            .iter()
            .map(|l| l.child_number as usize)
            .product()
    }
}

pub(crate) fn compile(config: &ClusterConfig) -> Result<CompiledState, ConfigError> {
    config.validate().map_err(ConfigError::Api)?;

    let mut chain_specs = HashMap::new();
    let mut cell_type_index: HashMap<_, (CellChain, CellLevel)> = HashMap::new();
    let mut chains_by_gpu_type: BTreeMap<String, Vec<CellChain>> = BTreeMap::new();
    for spec in &config.physical_cluster.chains {
        for (i, level) in spec.levels.iter().enumerate() {
            cell_type_index.insert(level.cell_type.clone(), (spec.chain.clone(), i + 1));
        }
        chains_by_gpu_type
            .entry(spec.gpu_type.clone())
            .or_default()
            .push(spec.chain.clone());
        chain_specs.insert(spec.chain.clone(), spec.clone());
    }

    let mut arena = CellArena::new();
    let mut full_cell_list: HashMap<CellChain, ChainCellList> = HashMap::new();
    let mut free_cell_list: HashMap<CellChain, FreeCellList> = HashMap::new();
    let mut address_index: HashMap<CellAddress, CellId> = HashMap::new();
    let mut top_counters: HashMap<CellChain, usize> = HashMap::new();

    for cell_spec in &config.physical_cluster.cells {
        let spec = &chain_specs[&cell_spec.chain];
        let top_level = spec.top_level();
        let expected_nodes = nodes_in_subtree(spec, top_level);
        if cell_spec.nodes.len() != expected_nodes {
            return Err(ConfigError::NodeCountMismatch {
                chain: spec.chain.clone(),
                expected: expected_nodes,
                actual: cell_spec.nodes.len(),
            });
        }
        let list = full_cell_list
            .entry(spec.chain.clone())
            .or_insert_with(|| ChainCellList::new(top_level));
        let top_index = top_counters.entry(spec.chain.clone()).or_insert(0);
        let address = format!("{}/{}", spec.chain, top_index);
        *top_index += 1;
        let top = build_physical_cell(
            &mut arena,
            spec,
            top_level,
            address,
            &cell_spec.nodes,
            0,
            list,
            &mut address_index,
        );
        free_cell_list
            .entry(spec.chain.clone())
            .or_insert_with(|| FreeCellList::new(top_level))
            .insert(top_level, top);
    }

    let mut sorted_chains: Vec<CellChain> = full_cell_list.keys().cloned().collect();
    sorted_chains.sort();

    let mut vc_schedulers = HashMap::new();
    let mut reserved_cells: HashMap<VirtualClusterName, HashMap<ReservationId, CellId>> =
        HashMap::new();
    let mut reserved_physical: std::collections::HashSet<CellId> = std::collections::HashSet::new();

    for (vc, vc_config) in &config.virtual_clusters {
        let mut non_reserved_lists: HashMap<CellChain, ChainCellList> = HashMap::new();
        let mut leaf_counters: HashMap<CellChain, i32> = HashMap::new();

        for grant in &vc_config.virtual_cells {
            let (chain, level) = cell_type_index
                .get(&grant.cell_type)
                .cloned()
                .ok_or_else(|| ConfigError::UnknownCellType(grant.cell_type.clone()))?;
            let spec = &chain_specs[&chain];
            let list = non_reserved_lists
                .entry(chain.clone())
                .or_insert_with(|| ChainCellList::new(spec.top_level()));
            let leaf_counter = leaf_counters.entry(chain.clone()).or_insert(0);
            for k in 0..grant.cell_number {
                let address = format!("{}/{}/{}/{}", vc, chain, grant.cell_type, k);
                let root_id = arena.next_id();
                build_virtual_cell(
                    &mut arena,
                    spec,
                    level,
                    address,
                    vc.clone(),
                    None,
                    root_id,
                    list,
                    leaf_counter,
                );
            }
        }

        let mut reserved_lists: HashMap<ReservationId, ChainCellList> = HashMap::new();
        for reservation in &vc_config.reservations {
            let physical = address_index
                .get(&reservation.cell_address)
                .copied()
                .ok_or_else(|| ConfigError::UnknownCellAddress {
                    reservation_id: reservation.reservation_id.clone(),
                    address: reservation.cell_address.clone(),
                })?;
            if !reserved_physical.insert(physical) {
                return Err(ConfigError::DuplicateReservedCell {
                    address: reservation.cell_address.clone(),
                });
            }
            let chain = arena.cell(physical).chain().clone();
            let level = arena.cell(physical).level();
            let spec = &chain_specs[&chain];
            let mut list = ChainCellList::new(level);
            let mut leaf_counter = 0;
            let address = format!("{}/{}", vc, reservation.reservation_id);
            let root_id = arena.next_id();
            build_virtual_cell(
                &mut arena,
                spec,
                level,
                address,
                vc.clone(),
                Some(reservation.reservation_id.clone()),
                root_id,
                &mut list,
                &mut leaf_counter,
            );
            reserved_lists.insert(reservation.reservation_id.clone(), list);
            reserved_cells
                .entry(vc.clone())
                .or_default()
                .insert(reservation.reservation_id.clone(), physical);
        }

        let non_reserved = non_reserved_lists
            .into_iter()
            .map(|(chain, list)| (chain, TopologyAwarePlacer::new(&arena, list)))
            .collect();
        let reserved = reserved_lists
            .into_iter()
            .map(|(rid, list)| (rid, TopologyAwarePlacer::new(&arena, list)))
            .collect();
        vc_schedulers.insert(
            vc.clone(),
            IntraVcScheduler::new(vc.clone(), non_reserved, reserved),
        );
    }

    Ok(CompiledState {
        arena,
        chain_specs,
        full_cell_list,
        free_cell_list,
        chains_by_gpu_type,
        sorted_chains,
        vc_schedulers,
        reserved_cells,
    })
}

/// Builds one physical cell and its subtree. Above the node boundary,
/// `nodes` is the slice of node names the subtree covers; at or below it,
/// `nodes` is one node and `gpu_offset` the first GPU index of the subtree.
#[allow(clippy::too_many_arguments)]
fn build_physical_cell(
    arena: &mut CellArena,
    spec: &ChainSpec,
    level: CellLevel,
    address: String,
    nodes: &[String],
    gpu_offset: i32,
    list: &mut ChainCellList,
    address_index: &mut HashMap<CellAddress, CellId>,
) -> CellId {
    let node_level = spec.node_level();
    let total_gpu_num = gpu_num_at_level(spec, level);
    let id = arena.insert(Cell::new_physical(
        spec.chain.clone(),
        level,
        spec.levels[level - 1].cell_type.clone(),
        address.clone().into(),
        level >= node_level,
        total_gpu_num,
    ));
    {
        let physical = arena.physical_mut(id);
        if level > node_level {
            physical.nodes = nodes.to_vec();
            physical.gpu_indices = vec![-1];
        } else {
            physical.nodes = vec![nodes[0].clone()];
            physical.gpu_indices = (gpu_offset..gpu_offset + total_gpu_num as i32).collect();
        }
    }
    list.push(level, id);
    address_index.insert(address.clone().into(), id);

    if level > 1 {
        let child_level = level - 1;
        let child_count = spec.levels[level - 1].child_number as usize;
        let nodes_per_child = nodes_in_subtree(spec, child_level);
        let gpus_per_child = gpu_num_at_level(spec, child_level) as i32;
        for i in 0..child_count {
            let child_nodes = if level > node_level {
                &nodes[i * nodes_per_child..(i + 1) * nodes_per_child]
            } else {
                nodes
            };
            let child_offset = if level > node_level {
                0
            } else {
                gpu_offset + i as i32 * gpus_per_child
            };
            let child = build_physical_cell(
                arena,
                spec,
                child_level,
                format!("{address}/{i}"),
                child_nodes,
                child_offset,
                list,
                address_index,
            );
            arena.cell_mut(child).generic.parent = Some(id);
            arena.cell_mut(id).generic.children.push(child);
        }
    }
    id
}

/// Builds one virtual cell and its subtree with full fan-out. The root
/// passes its own (pre-allocated) id down as the pre-assigned cell; level-1
/// cells take consecutive indices from `leaf_counter`.
#[allow(clippy::too_many_arguments)]
fn build_virtual_cell(
    arena: &mut CellArena,
    spec: &ChainSpec,
    level: CellLevel,
    address: String,
    vc: VirtualClusterName,
    reservation_id: Option<ReservationId>,
    pre_assigned: CellId,
    list: &mut ChainCellList,
    leaf_counter: &mut i32,
) -> CellId {
    let node_level = spec.node_level();
    let id = arena.insert(Cell::new_virtual(
        spec.chain.clone(),
        level,
        spec.levels[level - 1].cell_type.clone(),
        address.clone().into(),
        level >= node_level,
        gpu_num_at_level(spec, level),
        vc.clone(),
        pre_assigned,
    ));
    {
        let virtual_cell = arena.virtual_cell_mut(id);
        virtual_cell.reservation_id = reservation_id.clone();
        if level == 1 {
            virtual_cell.index = *leaf_counter;
            *leaf_counter += 1;
        }
    }
    list.push(level, id);

    if level > 1 {
        let child_count = spec.levels[level - 1].child_number as usize;
        for i in 0..child_count {
            let child = build_virtual_cell(
                arena,
                spec,
                level - 1,
                format!("{address}/{i}"),
                vc.clone(),
                reservation_id.clone(),
                pre_assigned,
                list,
                leaf_counter,
            );
            arena.cell_mut(child).generic.parent = Some(id);
            arena.cell_mut(id).generic.children.push(child);
        }
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ClusterConfig {
        ClusterConfig::from_yaml_str(
            r#"
physicalCluster:
  chains:
    - chain: CT1
      gpuType: V100
      levels:
        - cellType: V100
        - cellType: V100-X4
          childNumber: 4
        - cellType: V100-NODE
          childNumber: 2
          isNodeLevel: true
        - cellType: V100-RACK
          childNumber: 2
  cells:
    - chain: CT1
      nodes: [node1, node2]
virtualClusters:
  vc1:
    virtualCells:
      - cellType: V100-NODE
        cellNumber: 1
"#,
        )
        .unwrap()
    }

    #[test]
    fn physical_tree_fans_out_nodes_and_gpu_indices() {
        let state = compile(&sample_config()).unwrap();
        let list = &state.full_cell_list[&CellChain::from("CT1")];
        assert_eq!(list.at_level(4).len(), 1);
        assert_eq!(list.at_level(3).len(), 2);
        assert_eq!(list.at_level(1).len(), 16);

        let top = list.at_level(4)[0];
        assert_eq!(state.arena.cell(top).total_gpu_num(), 16);
        assert_eq!(
            state.arena.physical(top).nodes,
            vec!["node1".to_owned(), "node2".to_owned()]
        );
        assert_eq!(state.arena.physical(top).gpu_indices, vec![-1]);

        // second node-level cell: node2, GPUs 0..8 again
        let node_cell = list.at_level(3)[1];
        assert_eq!(state.arena.physical(node_cell).nodes, vec!["node2".to_owned()]);
        assert_eq!(
            state.arena.physical(node_cell).gpu_indices,
            (0..8).collect::<Vec<i32>>()
        );
        assert!(state.arena.cell(node_cell).at_or_above_node());
        assert_eq!(
            state.arena.cell(node_cell).address().as_str(),
            "CT1/0/1"
        );

        // leaves under node2's second quad carry GPU indices 4..8
        let quad = state.arena.children(node_cell)[1];
        let leaf_indices: Vec<i32> = state
            .arena
            .children(quad)
            .iter()
            .map(|leaf| state.arena.physical(*leaf).gpu_indices[0])
            .collect();
        assert_eq!(leaf_indices, vec![4, 5, 6, 7]);
    }

    #[test]
    fn free_list_starts_with_top_cells_only() {
        let state = compile(&sample_config()).unwrap();
        let free = &state.free_cell_list[&CellChain::from("CT1")];
        assert_eq!(free.len_at_level(4), 1);
        for level in 1..4 {
            assert_eq!(free.len_at_level(level), 0);
        }
    }

    #[test]
    fn virtual_grants_build_indexed_trees() {
        let state = compile(&sample_config()).unwrap();
        let vc = &state.vc_schedulers[&VirtualClusterName::from("vc1")];
        let placer = &vc.non_reserved()[&CellChain::from("CT1")];
        assert_eq!(placer.cells().at_level(3).len(), 1);
        assert_eq!(placer.cells().at_level(1).len(), 8);
        let root = placer.cells().at_level(3)[0];
        assert_eq!(state.arena.virtual_cell(root).pre_assigned, root);
        let indices: Vec<i32> = placer
            .cells()
            .at_level(1)
            .iter()
            .map(|c| state.arena.virtual_cell(*c).index)
            .collect();
        assert_eq!(indices, (0..8).collect::<Vec<i32>>());
        // every cell of the subtree points at the same pre-assigned root
        for (_, id) in placer.cells().iter() {
            assert_eq!(state.arena.virtual_cell(id).pre_assigned, root);
        }
    }

    #[test]
    fn unknown_cell_type_is_rejected() {
        let mut config = sample_config();
        config
            .virtual_clusters
            .get_mut(&VirtualClusterName::from("vc1"))
            .unwrap()
            .virtual_cells[0]
            .cell_type = "P100".into();
        assert!(matches!(
            compile(&config),
            Err(ConfigError::UnknownCellType(_))
        ));
    }

    #[test]
    fn node_count_mismatch_is_rejected() {
        let mut config = sample_config();
        config.physical_cluster.cells[0].nodes.pop();
        assert!(matches!(
            compile(&config),
            Err(ConfigError::NodeCountMismatch { expected: 2, actual: 1, .. })
        ));
    }
}
