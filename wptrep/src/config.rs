// Copyright (c) The wptrep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Processor configuration.

use crate::early_exit::Threshold;
use camino::Utf8PathBuf;
use std::time::Duration;

/// Configuration for a [`StreamProcessor`](crate::processor::StreamProcessor).
#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    /// Directory artifacts and reports are written under.
    pub output_dir: Utf8PathBuf,

    /// Ceiling on unexpected failures before the run is terminated.
    pub failure_threshold: Threshold,

    /// Ceiling on unexpected crashes and timeouts before the run is
    /// terminated.
    pub crash_timeout_threshold: Threshold,

    /// Attempts at least this slow are flagged as slow tests. `None`
    /// disables the flag.
    pub slow_test_threshold: Option<Duration>,
}

impl ProcessorConfig {
    /// Creates a configuration with unlimited thresholds.
    pub fn new(output_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            failure_threshold: Threshold::Unlimited,
            crash_timeout_threshold: Threshold::Unlimited,
            slow_test_threshold: None,
        }
    }
}
