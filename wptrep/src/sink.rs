// Copyright (c) The wptrep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reporting finalized results to an external sink.

use crate::results::Outcome;
use camino::Utf8PathBuf;
use indexmap::IndexMap;
use std::time::Duration;

/// One finalized attempt as reported to a [`ResultSink`].
#[derive(Debug)]
pub struct SinkResult<'a> {
    /// The test id.
    pub name: &'a str,

    /// Final outcome of the attempt.
    pub actual: Outcome,

    /// Outcomes that were acceptable for the attempt.
    pub expected: &'a [Outcome],

    /// True iff `actual` was not among `expected`.
    pub unexpected: bool,

    /// Wall time for the attempt.
    pub took: Duration,

    /// True if an earlier attempt within this run produced a different
    /// outcome.
    pub flaky: bool,

    /// Artifact kind to output-relative paths recorded for the attempt.
    pub artifacts: &'a IndexMap<String, Vec<Utf8PathBuf>>,
}

/// Receives one call per finalized test result.
///
/// Implementations typically forward to an external result-reporting
/// service. The processor is handed its sink at construction time; there is
/// no global registration.
pub trait ResultSink: Send {
    /// Reports one finalized attempt.
    fn report_result(&mut self, result: &SinkResult<'_>);
}

/// A sink that discards every result.
///
/// Used for upstream runs and wherever no reporting backend is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl ResultSink for NoopSink {
    fn report_result(&mut self, _result: &SinkResult<'_>) {}
}
