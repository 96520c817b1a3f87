// Copyright (c) The wptrep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The stream processor: a single consumer task over the harness's event
//! queue.
//!
//! One producer (the harness, plus the owning manager for shutdown) feeds an
//! unbounded FIFO channel; exactly one task drains it and runs every handler
//! in arrival order. All mutable state (in-flight results, per-test
//! histories, the crash-log buffer, the early-exit counters) is owned by
//! that task, so none of it needs locking. Artifact I/O runs to completion
//! between events; event production by real test execution is far slower
//! than local file writes.

mod imp;

pub use imp::{EventSender, ProcessorHandle, RunOutcome, StreamProcessor};
