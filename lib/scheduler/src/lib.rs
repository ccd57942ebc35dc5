// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Lattice: a topology-aware, multi-tenant GPU scheduler for gang-scheduled
//! workloads.
//!
//! The scheduler decides, for each pod of an affinity group, which physical
//! GPUs on which nodes it should run on, honoring per-tenant (virtual
//! cluster) quota expressed as a hierarchy of cells and the physical
//! interconnect topology (a GPU tree where siblings share the tightest
//! interconnect).
//!
//! The entry point is [`Scheduler`]: build one from a
//! [`lattice_api::ClusterConfig`], then drive it with `schedule`,
//! `add_allocated_pod` and `delete_allocated_pod`. State is purely
//! in-memory; after a restart it is rebuilt by replaying the allocated pods'
//! bind infos.

pub mod algorithm;
pub mod binding;
pub mod buddy;
pub mod cell;
pub mod chain;
pub(crate) mod config;
pub mod error;
pub(crate) mod group;
pub mod logging;
pub mod placer;
pub mod request;
pub(crate) mod status;
pub mod vc;

pub use algorithm::Scheduler;
pub use cell::{CellArena, CellId, CellLevel, CellPriority};
pub use error::{BadRequest, ConfigError, SchedulerError};

pub use lattice_api as api;
