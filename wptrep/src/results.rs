// Copyright (c) The wptrep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-test result state and the status merge rule.
//!
//! A [`TestResult`] accumulates the statuses reported for one test over one
//! run attempt. Every observation (each subtest status, and finally the
//! harness-level status) is folded in under a "most interesting status
//! wins" rule, so that a single crashing subtest makes the whole test a
//! crash no matter how many other subtests passed.

use crate::{errors::StatusParseError, events::Screenshot};
use camino::Utf8PathBuf;
use indexmap::IndexMap;
use itertools::Itertools;
use serde::Serialize;
use smallvec::{SmallVec, smallvec};
use std::{fmt, str::FromStr, time::Duration};

/// A status in the runner's native vocabulary, as found on the wire.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RunnerStatus {
    /// The harness completed normally.
    Ok,
    /// The test or subtest passed.
    Pass,
    /// An assertion failed.
    Fail,
    /// The harness hit an error in the test file.
    Error,
    /// A precondition for the test was not met.
    PreconditionFailed,
    /// The test timed out.
    Timeout,
    /// The containing group timed out.
    ExternalTimeout,
    /// The browser crashed.
    Crash,
    /// The runner itself failed.
    InternalError,
    /// The test was skipped.
    Skip,
    /// The subtest never ran.
    NotRun,
}

impl RunnerStatus {
    /// The status's wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Error => "ERROR",
            Self::PreconditionFailed => "PRECONDITION_FAILED",
            Self::Timeout => "TIMEOUT",
            Self::ExternalTimeout => "EXTERNAL-TIMEOUT",
            Self::Crash => "CRASH",
            Self::InternalError => "INTERNAL-ERROR",
            Self::Skip => "SKIP",
            Self::NotRun => "NOTRUN",
        }
    }

    /// Maps the runner vocabulary onto the canonical outcome set.
    pub fn to_outcome(self) -> Outcome {
        match self {
            Self::Ok | Self::Pass => Outcome::Pass,
            Self::Fail | Self::Error | Self::PreconditionFailed | Self::NotRun => Outcome::Failure,
            Self::Timeout | Self::ExternalTimeout => Outcome::Timeout,
            Self::Crash | Self::InternalError => Outcome::Crash,
            Self::Skip => Outcome::Skip,
        }
    }
}

impl FromStr for RunnerStatus {
    type Err = StatusParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "OK" => Ok(Self::Ok),
            "PASS" => Ok(Self::Pass),
            "FAIL" => Ok(Self::Fail),
            "ERROR" => Ok(Self::Error),
            "PRECONDITION_FAILED" => Ok(Self::PreconditionFailed),
            "TIMEOUT" => Ok(Self::Timeout),
            "EXTERNAL-TIMEOUT" => Ok(Self::ExternalTimeout),
            "CRASH" => Ok(Self::Crash),
            "INTERNAL-ERROR" => Ok(Self::InternalError),
            "SKIP" => Ok(Self::Skip),
            "NOTRUN" => Ok(Self::NotRun),
            other => Err(StatusParseError::new(other)),
        }
    }
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The canonical outcome of a test attempt.
///
/// Variants are declared from least to most interesting; the merge rule
/// relies on this order.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Outcome {
    /// The test behaved as its harness and subtests expected.
    Pass,
    /// At least one assertion failed.
    Failure,
    /// The test was not run.
    Skip,
    /// The test ran out of time.
    Timeout,
    /// The browser or runner crashed.
    Crash,
}

impl Outcome {
    /// The outcome's spelling in the results JSON.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Failure => "FAIL",
            Self::Skip => "SKIP",
            Self::Timeout => "TIMEOUT",
            Self::Crash => "CRASH",
        }
    }

    /// True for outcomes where the test did not run to completion.
    pub fn is_incomplete(self) -> bool {
        matches!(self, Self::Timeout | Self::Crash)
    }

    fn rank(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a status observation came from.
///
/// Harness-level statuses outweigh subtest statuses on merge-priority ties,
/// so that ordering between the two never depends on arrival order.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum StatusSource {
    /// Reported by an individual subtest.
    Subtest,
    /// Reported by the harness for the test as a whole.
    Harness,
}

/// Priority key for the "most interesting status wins" merge rule.
///
/// Keys compare lexicographically: incomplete outcomes beat completed ones,
/// unexpected outcomes beat expected ones, and the outcome rank breaks the
/// rest.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct MergePriority {
    incomplete: bool,
    unexpected: bool,
    rank: u8,
}

impl MergePriority {
    /// Computes the priority key for an observation.
    pub fn new(outcome: Outcome, unexpected: bool) -> Self {
        Self {
            incomplete: outcome.is_incomplete(),
            unexpected,
            rank: outcome.rank(),
        }
    }
}

/// Decides whether a newly observed status replaces the stored one.
///
/// A strictly higher priority always replaces. On equal priority the source
/// weight decides: a new observation from the same or a higher-weight source
/// replaces, so repeated subtest statuses keep newest-wins behavior while a
/// subtest can never displace an equally interesting harness status.
pub fn should_replace(
    current: MergePriority,
    current_source: StatusSource,
    candidate: MergePriority,
    candidate_source: StatusSource,
) -> bool {
    match candidate.cmp(&current) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Equal => candidate_source >= current_source,
        std::cmp::Ordering::Less => false,
    }
}

/// Assembles the acceptable-status set for one observation: the primary
/// expectation (the reported status itself when the harness omitted one)
/// plus any known-intermittent statuses.
pub fn expected_set(
    status: RunnerStatus,
    expected: Option<RunnerStatus>,
    known_intermittent: &[RunnerStatus],
) -> Vec<RunnerStatus> {
    let mut set = vec![expected.unwrap_or(status)];
    for intermittent in known_intermittent {
        if !set.contains(intermittent) {
            set.push(*intermittent);
        }
    }
    set
}

/// The reported status of one subtest within a test.
#[derive(Clone, Debug)]
pub struct SubtestResult {
    /// The subtest name.
    pub name: String,
    /// The status as reported on the wire.
    pub status: RunnerStatus,
    /// Statuses that were acceptable for this subtest.
    pub expected: Vec<RunnerStatus>,
    /// Diagnostic message, usually the assertion text.
    pub message: Option<String>,
    /// True iff `status` was not in `expected`.
    pub unexpected: bool,
}

/// Pixel-difference statistics for a reftest screenshot comparison.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ImageDiffStats {
    /// Largest summed per-pixel channel difference observed.
    pub max_pixel_diff: u32,
    /// Largest single-channel difference observed.
    pub max_channel_diff: u8,
}

/// Accumulated state for one test over one run attempt.
///
/// Created at `test_start`, mutated by `test_status` and `test_end`
/// handlers, then archived into the per-test history. Retries of the same
/// test id each get a fresh `TestResult`.
#[derive(Clone, Debug)]
pub struct TestResult {
    /// The test id (path plus optional query and fragment).
    pub name: String,
    /// Best-known outcome so far under the merge rule.
    pub actual: Outcome,
    /// Outcomes considered acceptable for this test.
    pub expected: SmallVec<[Outcome; 4]>,
    /// True iff `actual` is not in `expected`.
    pub unexpected: bool,
    /// Harness timestamp of the `test_start` event, in epoch milliseconds.
    pub started_ms: u64,
    /// Wall time between `test_start` and `test_end`.
    pub took: Duration,
    /// Diagnostic messages from the harness and from subtests, in order.
    pub messages: Vec<String>,
    /// Per-subtest records, in reporting order.
    pub subtests: Vec<SubtestResult>,
    /// Artifact kind to output-relative paths written for this attempt.
    pub artifacts: IndexMap<String, Vec<Utf8PathBuf>>,
    /// Statistics for the reftest image comparison, when one was performed.
    pub image_diff_stats: Option<ImageDiffStats>,
    /// Screenshots attached to the `test_end` event. Cleared once the
    /// decoded images have been written as artifacts.
    pub screenshots: Vec<Screenshot>,
    /// True when the attempt exceeded the configured slow-test threshold.
    pub is_slow: bool,
    priority: MergePriority,
    source: StatusSource,
}

impl TestResult {
    /// Creates the state for a newly started test.
    pub fn new(name: impl Into<String>, started_ms: u64) -> Self {
        Self {
            name: name.into(),
            actual: Outcome::Pass,
            expected: smallvec![Outcome::Pass],
            unexpected: false,
            started_ms,
            took: Duration::ZERO,
            messages: Vec::new(),
            subtests: Vec::new(),
            artifacts: IndexMap::new(),
            image_diff_stats: None,
            screenshots: Vec::new(),
            is_slow: false,
            priority: MergePriority::new(Outcome::Pass, false),
            source: StatusSource::Subtest,
        }
    }

    /// Folds one observed `(status, expected)` pair into the result.
    pub fn update(&mut self, status: RunnerStatus, expected: &[RunnerStatus], source: StatusSource) {
        let (outcome, expected_outcomes, unexpected) =
            if status == RunnerStatus::NotRun && expected.contains(&RunnerStatus::NotRun) {
                // A subtest that ran despite a not-run expectation is
                // harmless; downgrade before the priority comparison.
                (Outcome::Pass, smallvec![Outcome::Pass], false)
            } else {
                let outcome = status.to_outcome();
                let unexpected = !expected.contains(&status);
                let mut outcomes: SmallVec<[Outcome; 4]> =
                    expected.iter().map(|status| status.to_outcome()).collect();
                outcomes.sort_unstable();
                outcomes.dedup();
                if unexpected {
                    // The outcome mapping is lossy (e.g. NOTRUN and FAIL both
                    // map to Failure); strip the observed outcome so the
                    // merged result still reads as unexpected downstream.
                    outcomes.retain(|candidate| *candidate != outcome);
                }
                (outcome, outcomes, unexpected)
            };

        let priority = MergePriority::new(outcome, unexpected);
        if should_replace(self.priority, self.source, priority, source) {
            self.actual = outcome;
            self.expected = expected_outcomes;
            self.unexpected = unexpected;
            self.priority = priority;
            self.source = source;
        }
    }

    /// Records one subtest status and folds it into the test-level outcome.
    pub fn record_subtest(
        &mut self,
        name: impl Into<String>,
        status: RunnerStatus,
        expected: Vec<RunnerStatus>,
        message: Option<String>,
    ) {
        self.update(status, &expected, StatusSource::Subtest);
        let unexpected = !expected.contains(&status);
        self.subtests.push(SubtestResult {
            name: name.into(),
            status,
            expected,
            message,
            unexpected,
        });
    }

    /// The expected outcomes, space-joined for the results JSON.
    pub fn expected_string(&self) -> String {
        self.expected
            .iter()
            .map(|outcome| outcome.as_str())
            .join(" ")
    }

    /// Renders the observed statuses in the expectation-metadata format, for
    /// the `actual_text` artifact.
    pub fn actual_metadata(&self) -> String {
        use std::fmt::Write;

        let section = self.name.rsplit('/').next().unwrap_or(&self.name);
        let mut out = String::new();
        let _ = writeln!(out, "[{section}]");
        let _ = writeln!(out, "  expected: {}", self.actual);
        for subtest in &self.subtests {
            let _ = writeln!(out, "  [{}]", subtest.name);
            let _ = writeln!(out, "    expected: {}", subtest.status);
        }
        out
    }
}
