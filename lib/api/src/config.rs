// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cluster and virtual-cluster configuration.
//!
//! The configuration declares, per topology chain, the bottom-up shape of the
//! cell tree (level 1 is a single GPU), instantiates physical top cells with
//! concrete node names, grants virtual-cluster quota as lists of cells, and
//! installs static reservations. Only syntactic validation happens here; the
//! scheduler performs the semantic checks (quota vs. physical capacity,
//! address resolution) when it compiles the configuration.

use std::collections::BTreeMap;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::types::{CellAddress, CellChain, CellType, ReservationId, VirtualClusterName};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Shape of one level of a chain's cell tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelSpec {
    /// Name of the cell shape at this level (e.g. `V100-NODE`). Cell types
    /// are unique across the whole configuration; virtual-cluster grants
    /// refer to them.
    pub cell_type: CellType,
    /// Number of child cells under each cell of this level. Zero at level 1.
    #[serde(default)]
    pub child_number: u32,
    /// Marks the level whose cells correspond to exactly one cluster node.
    #[serde(default)]
    pub is_node_level: bool,
}

/// One topology chain: the GPU type it carries and its level shapes, leaf
/// first.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Validate, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSpec {
    pub chain: CellChain,
    /// GPU model contained in this chain; pods select chains by this name.
    #[validate(length(min = 1))]
    pub gpu_type: String,
    /// Level shapes from level 1 (single GPU) up to the chain's top.
    #[validate(custom(function = "validate_levels"))]
    pub levels: Vec<LevelSpec>,
}

impl ChainSpec {
    pub fn builder() -> ChainSpecBuilder {
        ChainSpecBuilder::default()
    }

    /// 1-based level of the node boundary.
    pub fn node_level(&self) -> usize {
        self.levels
            .iter()
            .position(|l| l.is_node_level)
            .map(|i| i + 1)
            .unwrap_or(1)
    }

    pub fn top_level(&self) -> usize {
        self.levels.len()
    }
}

fn validate_levels(levels: &Vec<LevelSpec>) -> Result<(), ValidationError> {
    if levels.is_empty() {
        return Err(ValidationError::new("chain_has_no_levels"));
    }
    if levels[0].child_number != 0 {
        return Err(ValidationError::new("leaf_level_has_children"));
    }
    if levels[1..].iter().any(|l| l.child_number < 2) {
        return Err(ValidationError::new("inner_level_needs_two_children"));
    }
    if levels.iter().filter(|l| l.is_node_level).count() != 1 {
        return Err(ValidationError::new("chain_needs_one_node_level"));
    }
    Ok(())
}

/// One physical top-level cell of a chain, covering the listed nodes. The
/// node list length must equal the number of node-level cells the chain shape
/// fans out to (checked during compilation).
#[derive(Debug, Clone, PartialEq, Eq, Builder, Validate, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalCellSpec {
    pub chain: CellChain,
    #[validate(length(min = 1))]
    pub nodes: Vec<String>,
}

impl PhysicalCellSpec {
    pub fn builder() -> PhysicalCellSpecBuilder {
        PhysicalCellSpecBuilder::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Validate, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalClusterConfig {
    pub chains: Vec<ChainSpec>,
    pub cells: Vec<PhysicalCellSpec>,
}

/// A quota grant: `cell_number` cells of the given type (the type fixes both
/// the chain and the level of the pre-assigned cells).
#[derive(Debug, Clone, PartialEq, Eq, Validate, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualCellSpec {
    pub cell_type: CellType,
    #[validate(range(min = 1))]
    pub cell_number: u32,
}

/// A static, permanent binding of one physical cell subtree to this VC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationSpec {
    pub reservation_id: ReservationId,
    /// Address of the reserved physical cell, e.g. `CT1/0/1`.
    pub cell_address: CellAddress,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualClusterConfig {
    #[serde(default)]
    #[builder(default)]
    pub virtual_cells: Vec<VirtualCellSpec>,
    #[serde(default)]
    #[builder(default)]
    pub reservations: Vec<ReservationSpec>,
}

impl VirtualClusterConfig {
    pub fn builder() -> VirtualClusterConfigBuilder {
        VirtualClusterConfigBuilder::default()
    }
}

/// Root configuration handed to `Scheduler::new`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub physical_cluster: PhysicalClusterConfig,
    #[serde(default)]
    pub virtual_clusters: BTreeMap<VirtualClusterName, VirtualClusterConfig>,
}

impl ClusterConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: ClusterConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Syntactic validation: per-field checks plus uniqueness of chain names
    /// and cell types across the whole configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for chain in &self.physical_cluster.chains {
            Validate::validate(chain)?;
        }
        for cell in &self.physical_cluster.cells {
            Validate::validate(cell)?;
        }
        for vc in self.virtual_clusters.values() {
            for grant in &vc.virtual_cells {
                Validate::validate(grant)?;
            }
            let mut reservation_ids = std::collections::HashSet::new();
            for reservation in &vc.reservations {
                if reservation.reservation_id.as_str().is_empty() {
                    return Err(ConfigError::Invalid("empty reservation id".to_owned()));
                }
                if !reservation_ids.insert(&reservation.reservation_id) {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate reservation id {}",
                        reservation.reservation_id
                    )));
                }
            }
        }

        let mut chains = std::collections::HashSet::new();
        let mut cell_types = std::collections::HashSet::new();
        for chain in &self.physical_cluster.chains {
            if !chains.insert(&chain.chain) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate chain {}",
                    chain.chain
                )));
            }
            for level in &chain.levels {
                if !cell_types.insert(&level.cell_type) {
                    return Err(ConfigError::Invalid(format!(
                        "cell type {} defined more than once",
                        level.cell_type
                    )));
                }
            }
        }
        for cell in &self.physical_cluster.cells {
            if !chains.contains(&cell.chain) {
                return Err(ConfigError::Invalid(format!(
                    "physical cell references unknown chain {}",
                    cell.chain
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
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
  cells:
    - chain: CT1
      nodes: [node1]
virtualClusters:
  vc1:
    virtualCells:
      - cellType: V100-X4
        cellNumber: 1
"#;

    #[test]
    fn parses_and_validates_sample() {
        let config = ClusterConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.physical_cluster.chains.len(), 1);
        assert_eq!(config.physical_cluster.chains[0].node_level(), 3);
        assert_eq!(config.physical_cluster.chains[0].top_level(), 3);
        let vc1 = config
            .virtual_clusters
            .get(&VirtualClusterName::from("vc1"))
            .unwrap();
        assert_eq!(vc1.virtual_cells[0].cell_number, 1);
    }

    #[test]
    fn rejects_chain_without_node_level() {
        let yaml = SAMPLE.replace("isNodeLevel: true", "isNodeLevel: false");
        let err = ClusterConfig::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn rejects_duplicate_cell_types() {
        let yaml = SAMPLE.replace("cellType: V100-X4", "cellType: V100");
        let err = ClusterConfig::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn builder_constructs_chain_spec() {
        let chain = ChainSpec::builder()
            .chain("CT2".into())
            .gpu_type("K80".to_owned())
            .levels(vec![
                LevelSpec {
                    cell_type: "K80".into(),
                    child_number: 0,
                    is_node_level: false,
                },
                LevelSpec {
                    cell_type: "K80-NODE".into(),
                    child_number: 4,
                    is_node_level: true,
                },
            ])
            .build()
            .unwrap();
        assert!(Validate::validate(&chain).is_ok());
        assert_eq!(chain.node_level(), 2);
    }
}
