// Copyright (c) The wptrep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The structured-log event model.
//!
//! Events are produced by an external harness process as JSON lines and
//! consumed exactly once by the
//! [`StreamProcessor`](crate::processor::StreamProcessor). The harness's
//! string-keyed action vocabulary is mapped onto the closed [`EventKind`]
//! enum at parse time so that dispatch over it is exhaustive.

use crate::{errors::EventParseError, results::RunnerStatus};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// A single structured-log event.
///
/// Immutable once constructed.
#[derive(Clone, Debug)]
pub struct Event {
    /// Milliseconds since the epoch at which the harness emitted the event.
    pub timestamp_ms: u64,

    /// Name of the harness thread that emitted the event.
    pub thread: String,

    /// Id of the emitting process.
    pub pid: u32,

    /// Name of the logger the event was emitted through.
    pub source: String,

    /// The action-specific payload.
    pub kind: EventKind,
}

impl Event {
    /// Parses one line of structured-log JSON.
    pub fn from_json_line(line: &str) -> Result<Self, EventParseError> {
        let raw: RawEvent = serde_json::from_str(line)?;
        raw.into_event()
    }

    /// An event that did not come from the harness, used for control flow
    /// such as [`EventKind::Shutdown`].
    pub(crate) fn internal(kind: EventKind) -> Self {
        Self {
            timestamp_ms: 0,
            thread: String::new(),
            pid: 0,
            source: String::new(),
            kind,
        }
    }
}

/// The kind of event this is, keyed by the harness's `action` field.
///
/// Forms part of [`Event`].
#[derive(Clone, Debug)]
pub enum EventKind {
    /// The harness started a suite run attempt.
    SuiteStart {
        /// Ids of the tests scheduled to run.
        tests: Vec<String>,

        /// Configuration properties for this run attempt.
        run_info: RunInfo,
    },

    /// A test began executing.
    TestStart {
        /// The test id.
        test: String,
    },

    /// A subtest reported its status.
    TestStatus {
        /// The test id.
        test: String,

        /// The subtest name.
        subtest: String,

        /// The reported status.
        status: RunnerStatus,

        /// The primary expected status, if the harness considered the
        /// reported status unexpected.
        expected: Option<RunnerStatus>,

        /// Further statuses that are acceptable as known intermittents.
        known_intermittent: Vec<RunnerStatus>,

        /// A diagnostic message, usually the assertion text.
        message: Option<String>,
    },

    /// A test finished executing and reported its harness-level status.
    TestEnd {
        /// The test id.
        test: String,

        /// The harness-level status.
        status: RunnerStatus,

        /// The primary expected status, if the harness considered the
        /// reported status unexpected.
        expected: Option<RunnerStatus>,

        /// Further statuses that are acceptable as known intermittents.
        known_intermittent: Vec<RunnerStatus>,

        /// A diagnostic message from the harness.
        message: Option<String>,

        /// Action-specific extras such as reftest screenshots.
        extra: TestEndExtra,
    },

    /// The harness finished the suite run attempt.
    SuiteEnd,

    /// A line of output from one of the harness's child processes.
    ProcessOutput {
        /// The command line of the emitting process.
        command: String,

        /// The output line.
        data: String,
    },

    /// A free-form log message from the harness. Ignored by the processor.
    Log {
        /// Log level as reported by the harness.
        level: String,

        /// The message text.
        message: String,
    },

    /// Stop draining the event queue.
    ///
    /// Never produced by the harness; enqueued by the owning manager on
    /// shutdown.
    Shutdown,

    /// An action this processor does not understand. Logged and dropped.
    Unknown {
        /// The unrecognized action tag.
        action: String,
    },
}

/// Process-wide configuration reported by the harness at suite start.
///
/// Set once per run attempt and read-only until the next `suite_start`
/// replaces it wholesale.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RunInfo {
    /// Operating system the suite is running on.
    #[serde(default)]
    pub os: Option<String>,

    /// The product under test.
    #[serde(default)]
    pub product: Option<String>,

    /// Name of the flag-specific suite configuration, if any.
    #[serde(default)]
    pub flag_specific: Option<String>,

    /// True when results will be synced with the upstream project and must
    /// not gate CI.
    #[serde(default)]
    pub used_upstream: bool,

    /// True when the product was built with a sanitizer.
    #[serde(default)]
    pub sanitizer_enabled: bool,

    /// Any further properties, retained for expectation-condition
    /// evaluation.
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl RunInfo {
    /// Looks up a property by name for expectation-condition evaluation.
    pub fn property(&self, name: &str) -> Option<Value> {
        match name {
            "os" => self.os.clone().map(Value::String),
            "product" => self.product.clone().map(Value::String),
            "flag_specific" => self.flag_specific.clone().map(Value::String),
            "used_upstream" => Some(Value::Bool(self.used_upstream)),
            "sanitizer_enabled" => Some(Value::Bool(self.sanitizer_enabled)),
            other => self.extra.get(other).cloned(),
        }
    }
}

/// Action-specific extras attached to a `test_end` event.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TestEndExtra {
    /// Screenshots captured for a reftest comparison.
    #[serde(default, deserialize_with = "deserialize_screenshots")]
    pub reftest_screenshots: Vec<Screenshot>,
}

/// One captured screenshot within a reftest comparison.
///
/// The harness reports the test's own rendering first and the reference's
/// second.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Screenshot {
    /// URL of the page the screenshot was taken of.
    pub url: String,

    /// Hash of the raw image data, as reported by the harness.
    #[serde(default)]
    pub hash: Option<String>,

    /// Base64-encoded PNG data.
    #[serde(rename = "screenshot")]
    pub data_base64: String,
}

// The harness interleaves relation strings ("==", "!=") between the
// screenshot records. Keep the records, drop the relations.
fn deserialize_screenshots<'de, D>(deserializer: D) -> Result<Vec<Screenshot>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Vec::<Value>::deserialize(deserializer)?;
    Ok(values
        .into_iter()
        .filter(|value| value.is_object())
        .filter_map(|value| serde_json::from_value(value).ok())
        .collect())
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    action: String,
    #[serde(default)]
    time: u64,
    #[serde(default)]
    thread: String,
    #[serde(default)]
    pid: u32,
    #[serde(default)]
    source: String,
    #[serde(default)]
    test: Option<String>,
    #[serde(default)]
    subtest: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    expected: Option<String>,
    #[serde(default)]
    known_intermittent: Vec<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    extra: Option<TestEndExtra>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    tests: Option<Value>,
    #[serde(default)]
    run_info: Option<RunInfo>,
}

impl RawEvent {
    fn into_event(self) -> Result<Event, EventParseError> {
        let kind = match self.action.as_str() {
            "suite_start" => EventKind::SuiteStart {
                tests: flatten_tests(self.tests),
                run_info: self.run_info.unwrap_or_default(),
            },
            "test_start" => EventKind::TestStart {
                test: self.test.unwrap_or_default(),
            },
            "test_status" => EventKind::TestStatus {
                test: self.test.unwrap_or_default(),
                subtest: self.subtest.unwrap_or_default(),
                status: parse_status(self.status)?,
                expected: parse_optional_status(self.expected)?,
                known_intermittent: parse_statuses(self.known_intermittent)?,
                message: self.message,
            },
            "test_end" => EventKind::TestEnd {
                test: self.test.unwrap_or_default(),
                status: parse_status(self.status)?,
                expected: parse_optional_status(self.expected)?,
                known_intermittent: parse_statuses(self.known_intermittent)?,
                message: self.message,
                extra: self.extra.unwrap_or_default(),
            },
            "suite_end" => EventKind::SuiteEnd,
            "process_output" => EventKind::ProcessOutput {
                command: self.command.unwrap_or_default(),
                data: match self.data {
                    Some(Value::String(data)) => data,
                    Some(other) => other.to_string(),
                    None => String::new(),
                },
            },
            "log" => EventKind::Log {
                level: self.level.unwrap_or_default(),
                message: self.message.unwrap_or_default(),
            },
            "shutdown" => EventKind::Shutdown,
            _ => EventKind::Unknown {
                action: self.action.clone(),
            },
        };
        Ok(Event {
            timestamp_ms: self.time,
            thread: self.thread,
            pid: self.pid,
            source: self.source,
            kind,
        })
    }
}

fn parse_status(status: Option<String>) -> Result<RunnerStatus, EventParseError> {
    Ok(status.as_deref().unwrap_or("").parse()?)
}

fn parse_optional_status(status: Option<String>) -> Result<Option<RunnerStatus>, EventParseError> {
    status
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(EventParseError::from)
}

fn parse_statuses(statuses: Vec<String>) -> Result<Vec<RunnerStatus>, EventParseError> {
    statuses
        .iter()
        .map(|status| status.parse())
        .collect::<Result<_, _>>()
        .map_err(EventParseError::from)
}

// `suite_start` reports either a flat list of test ids or a map from test
// group to ids, depending on how the run was sharded.
fn flatten_tests(tests: Option<Value>) -> Vec<String> {
    match tests {
        Some(Value::Array(entries)) => entries
            .into_iter()
            .filter_map(|entry| match entry {
                Value::String(test) => Some(test),
                _ => None,
            })
            .collect(),
        Some(Value::Object(groups)) => groups
            .into_iter()
            .flat_map(|(_, group)| match group {
                Value::Array(entries) => entries
                    .into_iter()
                    .filter_map(|entry| match entry {
                        Value::String(test) => Some(test),
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_test_status_line() {
        let line = r#"{"action": "test_status", "time": 1500, "thread": "TestRunner-1",
            "pid": 42, "source": "web-platform-tests", "test": "/a/b.html",
            "subtest": "sub1", "status": "FAIL", "expected": "PASS",
            "known_intermittent": ["TIMEOUT"], "message": "assert_true failed"}"#;
        let event = Event::from_json_line(line).expect("line should parse");
        assert_eq!(event.timestamp_ms, 1500);
        assert_eq!(event.pid, 42);
        let EventKind::TestStatus {
            test,
            subtest,
            status,
            expected,
            known_intermittent,
            message,
        } = event.kind
        else {
            panic!("expected TestStatus, found {:?}", event.kind);
        };
        assert_eq!(test, "/a/b.html");
        assert_eq!(subtest, "sub1");
        assert_eq!(status, RunnerStatus::Fail);
        assert_eq!(expected, Some(RunnerStatus::Pass));
        assert_eq!(known_intermittent, vec![RunnerStatus::Timeout]);
        assert_eq!(message.as_deref(), Some("assert_true failed"));
    }

    #[test]
    fn parses_suite_start_with_grouped_tests() {
        let line = r#"{"action": "suite_start", "time": 0,
            "tests": {"default": ["/a.html", "/b.html"]},
            "run_info": {"os": "linux", "used_upstream": true, "debug": false}}"#;
        let event = Event::from_json_line(line).expect("line should parse");
        let EventKind::SuiteStart { tests, run_info } = event.kind else {
            panic!("expected SuiteStart, found {:?}", event.kind);
        };
        assert_eq!(tests, vec!["/a.html".to_owned(), "/b.html".to_owned()]);
        assert_eq!(run_info.os.as_deref(), Some("linux"));
        assert!(run_info.used_upstream, "used_upstream should carry through");
        assert_eq!(
            run_info.property("debug"),
            Some(Value::Bool(false)),
            "unknown run-info keys should be retained"
        );
    }

    #[test]
    fn unknown_action_is_preserved() {
        let line = r#"{"action": "assertion_count", "time": 12}"#;
        let event = Event::from_json_line(line).expect("line should parse");
        let EventKind::Unknown { action } = event.kind else {
            panic!("expected Unknown, found {:?}", event.kind);
        };
        assert_eq!(action, "assertion_count");
    }

    #[test]
    fn missing_status_is_an_error() {
        let line = r#"{"action": "test_end", "time": 12, "test": "/a.html"}"#;
        let error = Event::from_json_line(line).expect_err("missing status should fail");
        assert!(
            matches!(error, EventParseError::Status(_)),
            "expected a status error, found {error:?}"
        );
    }

    #[test]
    fn screenshot_relations_are_dropped() {
        let line = r#"{"action": "test_end", "time": 90, "test": "/r.html",
            "status": "FAIL", "extra": {"reftest_screenshots": [
                {"url": "/r.html", "hash": "abc", "screenshot": "aGk="},
                "==",
                {"url": "/r-ref.html", "hash": "def", "screenshot": "aG8="}
            ]}}"#;
        let event = Event::from_json_line(line).expect("line should parse");
        let EventKind::TestEnd { extra, .. } = event.kind else {
            panic!("expected TestEnd, found {:?}", event.kind);
        };
        assert_eq!(extra.reftest_screenshots.len(), 2);
        assert_eq!(extra.reftest_screenshots[0].url, "/r.html");
        assert_eq!(extra.reftest_screenshots[1].data_base64, "aG8=");
    }

    #[test]
    fn process_output_coerces_non_string_data() {
        let line = r#"{"action": "process_output", "time": 5,
            "command": "/usr/bin/content_shell", "data": 123}"#;
        let event = Event::from_json_line(line).expect("line should parse");
        let EventKind::ProcessOutput { command, data } = event.kind else {
            panic!("expected ProcessOutput, found {:?}", event.kind);
        };
        assert_eq!(command, "/usr/bin/content_shell");
        assert_eq!(data, "123");
    }
}
