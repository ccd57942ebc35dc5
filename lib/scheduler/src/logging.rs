// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Opt-in tracing setup for binaries and tests.
//!
//! The scheduler itself only emits `tracing` events; hosts embedding it are
//! expected to install their own subscriber. [`init`] is a convenience for
//! processes without one: filters come from the `LATTICE_LOG` environment
//! variable (comma-separated `target=level` directives), defaulting to
//! `info`.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// ENV used to set the log filter.
const FILTER_ENV: &str = "LATTICE_LOG";

/// Default log level when the filter ENV is unset.
const DEFAULT_FILTER_LEVEL: &str = "info";

static INIT: Once = Once::new();

/// Installs a global formatting subscriber once; later calls are no-ops.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(FILTER_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER_LEVEL));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    });
}
