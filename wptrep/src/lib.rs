// Copyright (c) The wptrep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core results-processing logic for wptrep.
//!
//! A web-platform-test harness emits a stream of structured-log events while
//! it runs: suite lifecycle, per-test start/status/end, and raw output from
//! browser processes. This crate consumes that stream on a single task,
//! folds every test's statuses into one outcome under a "most interesting
//! status wins" rule, writes failure artifacts (metadata dumps, baseline
//! diffs, screenshots, crash logs), and aggregates the per-test histories
//! into the hierarchical `full_results.json` family of reports.
//!
//! The entry point is [`processor::StreamProcessor`]; feed it parsed
//! [`events::Event`]s and collect a [`processor::RunOutcome`], then fold
//! that into reports with [`report::summarize`] and
//! [`report::write_reports`].

pub mod artifacts;
pub mod config;
pub mod early_exit;
pub mod errors;
pub mod events;
pub mod expectations;
pub mod manifest;
pub mod processor;
pub mod report;
pub mod results;
pub mod sink;
