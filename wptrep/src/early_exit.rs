// Copyright (c) The wptrep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Early termination of runs that are failing wholesale.
//!
//! Two independent countdown thresholds run over the stream of unexpected
//! results. The first one to be exhausted sends a termination signal to the
//! whole harness process: continuing to run a thoroughly broken suite only
//! wastes CI resources. The signal is sent exactly once per run and the
//! policy does not wait for shutdown to complete.

use crate::results::Outcome;
use std::num::NonZeroUsize;
use tracing::warn;

/// Ceiling on unexpected results of one class before the run is cut short.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Threshold {
    /// Never exit early.
    #[default]
    Unlimited,

    /// Exit after this many unexpected results.
    Count(NonZeroUsize),
}

impl Threshold {
    /// Builds a threshold from an optional count; `None` and zero both mean
    /// unlimited.
    pub fn from_count(count: Option<usize>) -> Self {
        match count.and_then(NonZeroUsize::new) {
            Some(count) => Self::Count(count),
            None => Self::Unlimited,
        }
    }

    fn to_remaining(self) -> Option<usize> {
        match self {
            Self::Unlimited => None,
            Self::Count(count) => Some(count.get()),
        }
    }
}

/// Which threshold was exhausted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BreachKind {
    /// The unexpected-failure threshold.
    Failures,

    /// The unexpected crash/timeout threshold.
    CrashesAndTimeouts,
}

impl BreachKind {
    /// Human-readable name of the exhausted threshold, for log messages.
    pub fn describe(self) -> &'static str {
        match self {
            Self::Failures => "unexpected failures",
            Self::CrashesAndTimeouts => "unexpected crashes and timeouts",
        }
    }
}

/// What the policy decided after observing one finalized result.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitDecision {
    /// Keep consuming events.
    Continue,

    /// A threshold was just exhausted and the termination signal has been
    /// fired.
    Terminated(BreachKind),
}

/// The early-exit policy over one run.
#[derive(Debug)]
pub struct EarlyExitPolicy {
    failures_remaining: Option<usize>,
    crash_timeouts_remaining: Option<usize>,
    signal: TerminationSignal,
    fired: bool,
}

impl EarlyExitPolicy {
    /// Creates a policy with the given thresholds, firing `signal` on
    /// breach.
    pub fn new(
        failure_threshold: Threshold,
        crash_timeout_threshold: Threshold,
        signal: TerminationSignal,
    ) -> Self {
        Self {
            failures_remaining: failure_threshold.to_remaining(),
            crash_timeouts_remaining: crash_timeout_threshold.to_remaining(),
            signal,
            fired: false,
        }
    }

    /// Observes one finalized result and fires the termination signal if a
    /// threshold was just exhausted.
    pub fn on_result(&mut self, actual: Outcome, unexpected: bool) -> ExitDecision {
        if !unexpected {
            return ExitDecision::Continue;
        }
        let breach = match actual {
            Outcome::Failure => {
                decrement(&mut self.failures_remaining).then_some(BreachKind::Failures)
            }
            Outcome::Crash | Outcome::Timeout => decrement(&mut self.crash_timeouts_remaining)
                .then_some(BreachKind::CrashesAndTimeouts),
            Outcome::Pass | Outcome::Skip => None,
        };
        match breach {
            Some(kind) if !self.fired => {
                self.fired = true;
                self.signal.fire();
                ExitDecision::Terminated(kind)
            }
            _ => ExitDecision::Continue,
        }
    }
}

// Returns true when the counter is exhausted.
fn decrement(remaining: &mut Option<usize>) -> bool {
    match remaining {
        Some(count) => {
            *count = count.saturating_sub(1);
            *count == 0
        }
        None => false,
    }
}

/// How a threshold breach terminates the harness process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TerminationSignal {
    kind: TerminationSignalKind,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TerminationSignalKind {
    Standard,
    Noop,
}

impl TerminationSignal {
    /// Sends the platform's termination signal to this process: `SIGTERM`
    /// on Unix, `CTRL_BREAK_EVENT` on Windows.
    pub fn standard() -> Self {
        Self {
            kind: TerminationSignalKind::Standard,
        }
    }

    /// Does nothing. Useful for tests.
    pub fn noop() -> Self {
        Self {
            kind: TerminationSignalKind::Noop,
        }
    }

    pub(crate) fn fire(&self) {
        match self.kind {
            TerminationSignalKind::Standard => imp::terminate(),
            TerminationSignalKind::Noop => {}
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod imp {
            use super::warn;

            pub(super) fn terminate() {
                // SAFETY: sending SIGTERM to our own process id.
                let rc = unsafe { libc::kill(libc::getpid(), libc::SIGTERM) };
                if rc != 0 {
                    warn!("failed to send SIGTERM to own process");
                }
            }
        }
    } else if #[cfg(windows)] {
        mod imp {
            use super::warn;
            use windows_sys::Win32::System::Console::{CTRL_BREAK_EVENT, GenerateConsoleCtrlEvent};

            pub(super) fn terminate() {
                // Signals the whole console process group, matching SIGTERM
                // semantics closely enough for a test harness.
                // SAFETY: no pointers involved; 0 targets our own group.
                let rc = unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, 0) };
                if rc == 0 {
                    warn!("failed to send CTRL_BREAK_EVENT to own process group");
                }
            }
        }
    } else {
        mod imp {
            use super::warn;

            pub(super) fn terminate() {
                warn!("early exit requested, but this platform has no termination signal");
            }
        }
    }
}
