// Copyright (c) The wptrep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by wptrep.

use camino::Utf8PathBuf;
use std::time::Duration;
use thiserror::Error;

/// An error produced while applying an event to the per-test state machine.
///
/// These are recoverable: the processor logs the offending event, drops it,
/// and keeps draining the stream.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EventProcessingError {
    /// A `test_start` arrived for a test that is already in flight.
    #[error("test `{test}` started twice without an intervening end")]
    DoubleStart {
        /// The test id.
        test: String,
    },

    /// A `test_status` arrived for a test that was never started.
    #[error("subtest status for `{test}` arrived before the test started")]
    StatusWithoutStart {
        /// The test id.
        test: String,
    },

    /// A `test_end` arrived for a test that was never started.
    #[error("test `{test}` ended but was never started")]
    EndWithoutStart {
        /// The test id.
        test: String,
    },
}

/// An error returned while tearing down the consumer task.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// The consumer did not drain its queue within the allotted time. The
    /// stream may have been backlogged behind slow artifact writes.
    #[error("processor did not drain its event queue within {timeout:?}")]
    JoinTimeout {
        /// How long the caller was willing to wait.
        timeout: Duration,
    },

    /// The consumer task panicked.
    #[error("processor task panicked")]
    TaskPanicked,
}

/// The event channel is closed because the processor task has exited.
#[derive(Clone, Debug, Error)]
#[error("event channel closed: the processor task has exited")]
pub struct EventSendError(());

impl EventSendError {
    pub(crate) fn new() -> Self {
        Self(())
    }
}

/// An error returned while parsing a structured-log line into an [`Event`](crate::events::Event).
#[derive(Debug, Error)]
pub enum EventParseError {
    /// The line was not valid JSON or was missing required fields.
    #[error("malformed event line")]
    Json(#[from] serde_json::Error),

    /// The event carried a status outside the runner vocabulary.
    #[error("event carries an unrecognized status")]
    Status(#[from] StatusParseError),
}

/// An error returned while parsing a runner-native status string.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unrecognized runner status `{input}`")]
pub struct StatusParseError {
    input: String,
}

impl StatusParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// An error that occurred while writing a single artifact file.
///
/// Artifact failures are logged and skipped; they never abort the run.
#[derive(Debug, Error)]
pub enum ArtifactWriteError {
    /// Writing the artifact file itself failed.
    #[error("failed to write artifact `{path}`")]
    Write {
        /// The path that could not be written.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        error: std::io::Error,
    },

    /// A screenshot payload was not valid base64.
    #[error("failed to decode screenshot of `{url}`")]
    ScreenshotDecode {
        /// URL the screenshot was taken of.
        url: String,
        /// The underlying decode error.
        #[source]
        error: base64::DecodeError,
    },

    /// A screenshot's bytes were not a decodable PNG.
    #[error("failed to decode image for `{url}`")]
    ImageDecode {
        /// URL the screenshot was taken of.
        url: String,
        /// The underlying image error.
        #[source]
        error: image::ImageError,
    },

    /// Encoding the computed diff image failed.
    #[error("failed to encode image diff at `{path}`")]
    ImageEncode {
        /// The path that could not be written.
        path: Utf8PathBuf,
        /// The underlying image error.
        #[source]
        error: image::ImageError,
    },
}

/// An error returned while parsing a checked-in expectation metadata file.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExpectationParseError {
    /// Tabs are not valid indentation in the metadata format.
    #[error("line {line}: tab characters are not valid indentation")]
    TabIndent {
        /// 1-based line number.
        line: usize,
    },

    /// A section header was not closed with `]`.
    #[error("line {line}: unterminated section header")]
    UnterminatedSection {
        /// 1-based line number.
        line: usize,
    },

    /// A conditional value appeared outside of a key block.
    #[error("line {line}: conditional value outside of a key block")]
    StrayConditional {
        /// 1-based line number.
        line: usize,
    },

    /// A condition expression was not of a recognized form.
    #[error("line {line}: unsupported condition `{condition}`")]
    BadCondition {
        /// 1-based line number.
        line: usize,
        /// The condition text.
        condition: String,
    },

    /// The line fit none of the recognized forms.
    #[error("line {line}: expected a section header, `key: value`, or a value line")]
    Malformed {
        /// 1-based line number.
        line: usize,
    },
}

/// An error that occurred while loading the test manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Reading the manifest file failed.
    #[error("failed to read manifest at `{path}`")]
    Read {
        /// The manifest path.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        error: std::io::Error,
    },

    /// The manifest was not valid JSON of the expected shape.
    #[error("failed to parse manifest at `{path}`")]
    Parse {
        /// The manifest path.
        path: Utf8PathBuf,
        /// The underlying JSON error.
        #[source]
        error: serde_json::Error,
    },
}

/// An error returned while writing one of the end-of-run report files.
#[derive(Debug, Error)]
#[error("failed to write report file `{path}`")]
pub struct ReportWriteError {
    path: Utf8PathBuf,
    #[source]
    error: std::io::Error,
}

impl ReportWriteError {
    pub(crate) fn new(path: impl Into<Utf8PathBuf>, error: std::io::Error) -> Self {
        Self {
            path: path.into(),
            error,
        }
    }
}
