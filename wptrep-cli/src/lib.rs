// Copyright (c) The wptrep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Replay wptrunner structured logs into layout-test result reports.
//!
//! For the processing pipeline itself, see the `wptrep` crate.

mod dispatch;

pub use dispatch::WptrepApp;
