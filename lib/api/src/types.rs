// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pod-facing wire types: scheduling spec, bind info, and schedule verdicts.
//!
//! Field names serialize in camelCase to match the annotation format the host
//! framework stores on pods.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Pod priorities below this value are treated as opportunistic (best effort,
/// no quota backing).
pub const REGULAR_PRIORITY: i32 = 0;

/// The priority all opportunistic pods are normalized to.
pub const OPPORTUNISTIC_PRIORITY: i32 = -1;

/// Cap for regular priorities; a spec carrying a larger value is rejected.
pub const HIGHEST_PRIORITY: i32 = 1000;

macro_rules! string_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_newtype!(
    /// A topology family; cells of different chains never interact.
    CellChain
);
string_newtype!(
    /// The shape name of a cell level within a chain (e.g. `V100-NODE`).
    CellType
);
string_newtype!(
    /// Stable identifier of one cell inside its chain.
    CellAddress
);
string_newtype!(
    /// Name of a virtual cluster (tenant).
    VirtualClusterName
);
string_newtype!(
    /// Identifier of a static reservation inside a virtual cluster.
    ReservationId
);

/// Identity of a pod as tracked by the algorithm: enough to report victims
/// and to match deletions against allocations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodKey {
    pub name: String,
    pub uid: String,
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.uid)
    }
}

/// The algorithm's view of a pod. The host framework extracts the scheduling
/// spec from pod annotations before calling in; bind info is present only on
/// pods that already went through a successful `schedule`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    pub name: String,
    pub uid: String,
    pub scheduling_spec: PodSchedulingSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_info: Option<PodBindInfo>,
}

impl Pod {
    pub fn key(&self) -> PodKey {
        PodKey {
            name: self.name.clone(),
            uid: self.uid.clone(),
        }
    }
}

impl fmt::Display for Pod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.uid)
    }
}

/// One member class of an affinity group: `pod_number` pods, each demanding
/// `gpu_number` GPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffinityGroupMemberSpec {
    pub gpu_number: i32,
    pub pod_number: i32,
}

/// A named gang of pods that must be placed together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffinityGroupSpec {
    pub name: String,
    pub members: Vec<AffinityGroupMemberSpec>,
}

/// Scheduling constraints attached to a pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSchedulingSpec {
    pub virtual_cluster: VirtualClusterName,
    /// Signed; values below [`REGULAR_PRIORITY`] request opportunistic
    /// scheduling.
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_type: Option<String>,
    pub gpu_number: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<ReservationId>,
    pub affinity_group: AffinityGroupSpec,
}

/// Placement of one pod: the node it runs on, the physical GPU indices it
/// isolates, and for each GPU the index of the bound virtual cell (`-1` when
/// the GPU was placed opportunistically and has no virtual counterpart).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodPlacementInfo {
    pub physical_node: String,
    pub physical_gpu_indices: Vec<i32>,
    pub virtual_cell_indices: Vec<i32>,
}

/// Placements of all pods of one member class (same `gpu_number`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffinityGroupMemberBindInfo {
    pub pod_placements: Vec<PodPlacementInfo>,
}

/// The full bind verdict for one pod, carrying enough information to replay
/// the whole group's placement through `add_allocated_pod` after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodBindInfo {
    pub node: String,
    pub gpu_isolation: Vec<i32>,
    pub cell_chain: CellChain,
    pub affinity_group_bind_info: Vec<AffinityGroupMemberBindInfo>,
}

/// No placement is currently available; the pod should stay pending.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodWaitInfo {
    /// Per-node reasons for rejection. Reserved; currently always empty.
    #[serde(default)]
    pub failed_node_reasons: HashMap<String, String>,
}

/// The intended cells are held by lower-priority occupants; every pod of each
/// victim affinity group must be preempted before the placement can proceed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodPreemptInfo {
    pub victim_pods: Vec<PodKey>,
}

/// Three-way verdict of a `schedule` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PodScheduleResult {
    Wait(PodWaitInfo),
    Preempt(PodPreemptInfo),
    Bind(PodBindInfo),
}

impl PodScheduleResult {
    pub fn as_bind(&self) -> Option<&PodBindInfo> {
        match self {
            PodScheduleResult::Bind(info) => Some(info),
            _ => None,
        }
    }

    pub fn is_wait(&self) -> bool {
        matches!(self, PodScheduleResult::Wait(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> PodSchedulingSpec {
        PodSchedulingSpec {
            virtual_cluster: "vc1".into(),
            priority: 1,
            gpu_type: Some("V100".to_owned()),
            gpu_number: 2,
            reservation_id: None,
            affinity_group: AffinityGroupSpec {
                name: "group-a".to_owned(),
                members: vec![AffinityGroupMemberSpec {
                    gpu_number: 2,
                    pod_number: 1,
                }],
            },
        }
    }

    #[test]
    fn scheduling_spec_round_trips_as_camel_case() {
        let spec = sample_spec();
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["virtualCluster"], "vc1");
        assert_eq!(json["gpuType"], "V100");
        assert_eq!(json["affinityGroup"]["members"][0]["podNumber"], 1);

        let back: PodSchedulingSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn bind_info_round_trips() {
        let info = PodBindInfo {
            node: "node1".to_owned(),
            gpu_isolation: vec![0, 1],
            cell_chain: "CT1".into(),
            affinity_group_bind_info: vec![AffinityGroupMemberBindInfo {
                pod_placements: vec![PodPlacementInfo {
                    physical_node: "node1".to_owned(),
                    physical_gpu_indices: vec![0, 1],
                    virtual_cell_indices: vec![-1, -1],
                }],
            }],
        };
        let json = serde_json::to_string(&info).unwrap();
        let back: PodBindInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }
}
