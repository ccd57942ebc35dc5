// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error surface of the scheduling algorithm.
//!
//! Three distinct classes, so callers can tell "fix your request" from
//! "restart me":
//!
//! - [`BadRequest`]: the client asked for something the configuration does
//!   not allow. Surfaced to the caller, no state was mutated.
//! - [`SchedulerError::Internal`]: a broken invariant inside the algorithm.
//!   The current operation aborts; recovery is a restart of the process that
//!   rebuilds state by replaying allocated pods.
//! - [`ConfigError`]: rejection at construction time.
//!
//! Transient unsatisfiability (no placement found) is *not* an error; it is
//! reported as a wait verdict.

use lattice_api::types::{ReservationId, VirtualClusterName};

/// Client-caused rejections. Requests failing these checks never mutate
/// scheduler state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BadRequest {
    #[error("VC {0} does not exist")]
    UnknownVirtualCluster(VirtualClusterName),

    #[error("VC {vc} does not have reservation {reservation_id}")]
    UnknownReservation {
        vc: VirtualClusterName,
        reservation_id: ReservationId,
    },

    #[error("priority {0} exceeds highest priority")]
    PriorityOutOfRange(i32),

    #[error("opportunistic pod not supported to use reservation {0}")]
    OpportunisticReservation(ReservationId),

    #[error("pod requesting an invalid GPU type: {0}")]
    UnknownGpuType(String),

    #[error("pod requesting GPU type {gpu_type} which VC {vc} does not have")]
    GpuTypeNotInVc {
        gpu_type: String,
        vc: VirtualClusterName,
    },

    #[error(
        "requesting more pods than the configured number for {gpu_number} GPUs \
         ({pod_number} pods) in affinity group {group}"
    )]
    PodCountExceeded {
        group: String,
        gpu_number: i32,
        pod_number: i32,
    },

    #[error("invalid affinity group {group}: {reason}")]
    InvalidAffinityGroup { group: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("bad request: {0}")]
    BadRequest(#[from] BadRequest),

    /// A detected invariant break: missing cell, allocation failure where
    /// allocation must succeed, mismatched binding state, placement outside
    /// the suggested nodes. Treated as a programmer error, not a recoverable
    /// state.
    #[error("internal invariant violation: {0}")]
    Internal(String),
}

/// Rejections while compiling a [`lattice_api::ClusterConfig`] into scheduler
/// state.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Api(#[from] lattice_api::config::ConfigError),

    #[error("virtual cell grant references unknown cell type {0}")]
    UnknownCellType(lattice_api::types::CellType),

    #[error("reservation {reservation_id} references unknown cell address {address}")]
    UnknownCellAddress {
        reservation_id: ReservationId,
        address: lattice_api::types::CellAddress,
    },

    #[error(
        "physical cell of chain {chain} needs {expected} nodes, {actual} declared"
    )]
    NodeCountMismatch {
        chain: lattice_api::types::CellChain,
        expected: usize,
        actual: usize,
    },

    #[error("physical cell {address} is reserved more than once")]
    DuplicateReservedCell {
        address: lattice_api::types::CellAddress,
    },

    #[error(
        "insufficient physical cells at chain {chain} level {level}: \
         {needed} needed, {available} available"
    )]
    InsufficientCapacity {
        chain: lattice_api::types::CellChain,
        level: usize,
        needed: u32,
        available: u32,
    },
}

/// Shorthand for raising [`SchedulerError::Internal`] with formatted context.
macro_rules! fault {
    ($($arg:tt)*) => {
        return Err($crate::error::SchedulerError::Internal(format!($($arg)*)))
    };
}

pub(crate) use fault;
