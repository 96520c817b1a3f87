// Copyright (c) The wptrep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    artifacts::ArtifactWriter,
    config::ProcessorConfig,
    early_exit::{EarlyExitPolicy, ExitDecision, TerminationSignal},
    errors::{EventProcessingError, EventSendError, ShutdownError},
    events::{Event, EventKind, RunInfo, TestEndExtra},
    expectations::ExpectationDoc,
    manifest::{TestManifest, TestType},
    results::{
        Outcome, RunnerStatus, StatusSource, TestResult, expected_set,
    },
    sink::{NoopSink, ResultSink, SinkResult},
};
use camino::Utf8PathBuf;
use debug_ignore::DebugIgnore;
use indexmap::IndexMap;
use std::{fs, ops::ControlFlow, time::Duration};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Executables whose process output feeds the crash-log buffer. Output from
/// anything else (wptserve, adb, ...) is noise for crash attribution.
const CRASH_LOG_COMMANDS: &[&str] = &[
    "content_shell",
    "content-shell",
    "chromedriver",
    "headless_shell",
    "logcat",
];

/// Consumes the harness's structured-log event stream and folds it into
/// per-test results.
///
/// Configure with the builder-style `with_` methods, then [`spawn`] the
/// consumer task.
///
/// [`spawn`]: StreamProcessor::spawn
#[derive(Debug)]
pub struct StreamProcessor {
    config: ProcessorConfig,
    manifest: Option<TestManifest>,
    metadata_root: Option<Utf8PathBuf>,
    sink: DebugIgnore<Box<dyn ResultSink>>,
    signal: TerminationSignal,
}

impl StreamProcessor {
    /// Creates a processor with a no-op sink and the standard termination
    /// signal.
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            config,
            manifest: None,
            metadata_root: None,
            sink: DebugIgnore(Box::new(NoopSink)),
            signal: TerminationSignal::standard(),
        }
    }

    /// Sets the manifest used to locate checked-in expectation files.
    pub fn with_manifest(mut self, manifest: TestManifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    /// Sets the root directory of checked-in expectation metadata.
    pub fn with_metadata_root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.metadata_root = Some(root.into());
        self
    }

    /// Sets the sink finalized results are reported to.
    pub fn with_sink(mut self, sink: Box<dyn ResultSink>) -> Self {
        self.sink = DebugIgnore(sink);
        self
    }

    /// Sets how a threshold breach terminates the process.
    pub fn with_termination_signal(mut self, signal: TerminationSignal) -> Self {
        self.signal = signal;
        self
    }

    /// Spawns the consumer task. Must be called within a tokio runtime.
    pub fn spawn(self) -> (EventSender, ProcessorHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let context = ProcessorContext::new(self);
        let join = tokio::task::spawn(context.run(rx));
        (EventSender { tx: tx.clone() }, ProcessorHandle { tx, join })
    }
}

/// Feeds events into the processor's queue. Clonable; safe to hand to
/// multiple producer threads.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: UnboundedSender<Event>,
}

impl EventSender {
    /// Enqueues one event.
    pub fn send(&self, event: Event) -> Result<(), EventSendError> {
        self.tx.send(event).map_err(|_| EventSendError::new())
    }
}

/// Owner-side handle for tearing the stream down and collecting the run
/// outcome.
#[derive(Debug)]
pub struct ProcessorHandle {
    tx: UnboundedSender<Event>,
    join: JoinHandle<RunOutcome>,
}

impl ProcessorHandle {
    /// Enqueues a shutdown event and joins the consumer.
    ///
    /// Exceeding `timeout` means the stream was still backlogged; the
    /// consumer task is left to finish detached and the caller gets
    /// [`ShutdownError::JoinTimeout`].
    pub async fn shutdown(self, timeout: Duration) -> Result<RunOutcome, ShutdownError> {
        // A send failure means the consumer already exited; the join below
        // will return its outcome regardless.
        let _ = self.tx.send(Event::internal(EventKind::Shutdown));
        match tokio::time::timeout(timeout, self.join).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(ShutdownError::TaskPanicked),
            Err(_) => Err(ShutdownError::JoinTimeout { timeout }),
        }
    }
}

/// Everything accumulated over one run, returned at shutdown.
#[derive(Debug)]
pub struct RunOutcome {
    /// Ordered result history per test id, one entry per attempt.
    pub results_by_name: IndexMap<String, Vec<TestResult>>,

    /// True if the run was cut short, either by an early-exit threshold or
    /// by shutting down with tests still in flight.
    pub interrupted: bool,

    /// Configuration reported by the harness at suite start.
    pub run_info: RunInfo,
}

// The `test_end` payload together with the event timestamp, handed to the
// end-of-test handler as one unit.
struct TestEndEvent {
    test: String,
    timestamp_ms: u64,
    status: RunnerStatus,
    expected: Option<RunnerStatus>,
    known_intermittent: Vec<RunnerStatus>,
    message: Option<String>,
    extra: TestEndExtra,
}

#[derive(Debug)]
struct ProcessorContext {
    manifest: Option<TestManifest>,
    metadata_root: Option<Utf8PathBuf>,
    artifact_writer: ArtifactWriter,
    sink: DebugIgnore<Box<dyn ResultSink>>,
    slow_test_threshold: Option<Duration>,
    run_info: RunInfo,
    in_flight: IndexMap<String, TestResult>,
    results_by_name: IndexMap<String, Vec<TestResult>>,
    crash_log: String,
    early_exit: EarlyExitPolicy,
    interrupted: bool,
}

impl ProcessorContext {
    fn new(processor: StreamProcessor) -> Self {
        let StreamProcessor {
            config,
            manifest,
            metadata_root,
            sink,
            signal,
        } = processor;
        Self {
            manifest,
            metadata_root,
            artifact_writer: ArtifactWriter::new(config.output_dir),
            sink,
            slow_test_threshold: config.slow_test_threshold,
            run_info: RunInfo::default(),
            in_flight: IndexMap::new(),
            results_by_name: IndexMap::new(),
            crash_log: String::new(),
            early_exit: EarlyExitPolicy::new(
                config.failure_threshold,
                config.crash_timeout_threshold,
                signal,
            ),
            interrupted: false,
        }
    }

    async fn run(mut self, mut rx: UnboundedReceiver<Event>) -> RunOutcome {
        while let Some(event) = rx.recv().await {
            match self.handle_event(event) {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => break,
                Err(error) => {
                    // One malformed event must not take down the pipeline.
                    warn!(%error, "dropped event");
                }
            }
        }
        RunOutcome {
            results_by_name: self.results_by_name,
            interrupted: self.interrupted,
            run_info: self.run_info,
        }
    }

    fn handle_event(
        &mut self,
        event: Event,
    ) -> Result<ControlFlow<()>, EventProcessingError> {
        let timestamp_ms = event.timestamp_ms;
        match event.kind {
            EventKind::SuiteStart { tests, run_info } => {
                self.handle_suite_start(tests, run_info);
            }
            EventKind::TestStart { test } => {
                self.handle_test_start(test, timestamp_ms)?;
            }
            EventKind::TestStatus {
                test,
                subtest,
                status,
                expected,
                known_intermittent,
                message,
            } => {
                self.handle_test_status(
                    test,
                    subtest,
                    status,
                    expected,
                    known_intermittent,
                    message,
                )?;
            }
            EventKind::TestEnd {
                test,
                status,
                expected,
                known_intermittent,
                message,
                extra,
            } => {
                self.handle_test_end(TestEndEvent {
                    test,
                    timestamp_ms,
                    status,
                    expected,
                    known_intermittent,
                    message,
                    extra,
                })?;
            }
            EventKind::SuiteEnd => self.handle_suite_end(),
            EventKind::ProcessOutput { command, data } => {
                self.handle_process_output(&command, &data);
            }
            EventKind::Log { .. } => {}
            EventKind::Unknown { action } => {
                warn!(%action, "ignoring unrecognized event action");
            }
            EventKind::Shutdown => {
                if !self.in_flight.is_empty() {
                    let tests: Vec<&str> =
                        self.in_flight.keys().map(String::as_str).collect();
                    warn!(?tests, "shutting down with tests still in flight");
                    self.interrupted = true;
                }
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn handle_suite_start(&mut self, tests: Vec<String>, run_info: RunInfo) {
        debug!(test_count = tests.len(), "suite started");
        // A retried suite replaces the run info wholesale.
        self.run_info = run_info;
    }

    fn handle_test_start(
        &mut self,
        test: String,
        timestamp_ms: u64,
    ) -> Result<(), EventProcessingError> {
        if self.in_flight.contains_key(&test) {
            return Err(EventProcessingError::DoubleStart { test });
        }
        let result = TestResult::new(test.clone(), timestamp_ms);
        self.in_flight.insert(test, result);
        Ok(())
    }

    fn handle_test_status(
        &mut self,
        test: String,
        subtest: String,
        status: RunnerStatus,
        expected: Option<RunnerStatus>,
        known_intermittent: Vec<RunnerStatus>,
        message: Option<String>,
    ) -> Result<(), EventProcessingError> {
        let Some(result) = self.in_flight.get_mut(&test) else {
            return Err(EventProcessingError::StatusWithoutStart { test });
        };
        if let Some(message) = &message {
            result.messages.push(format!("{subtest}: {message}"));
        }
        let expected = expected_set(status, expected, &known_intermittent);
        result.record_subtest(subtest, status, expected, message);
        Ok(())
    }

    fn handle_test_end(&mut self, event: TestEndEvent) -> Result<(), EventProcessingError> {
        let TestEndEvent {
            test,
            timestamp_ms,
            status,
            expected,
            known_intermittent,
            message,
            extra,
        } = event;
        let Some(mut result) = self.in_flight.shift_remove(&test) else {
            return Err(EventProcessingError::EndWithoutStart { test });
        };
        result.took = Duration::from_millis(timestamp_ms.saturating_sub(result.started_ms));
        if let Some(threshold) = self.slow_test_threshold
            && result.took >= threshold
        {
            result.is_slow = true;
        }
        if let Some(message) = message {
            result.messages.push(format!("harness: {message}"));
        }
        let expected = expected_set(status, expected, &known_intermittent);
        result.update(status, &expected, StatusSource::Harness);
        result.screenshots = extra.reftest_screenshots;

        self.extract_artifacts(&mut result);
        self.report_to_sink(&result);

        if let ExitDecision::Terminated(kind) =
            self.early_exit.on_result(result.actual, result.unexpected)
        {
            info!(
                threshold = kind.describe(),
                "early-exit threshold exceeded, terminating the run"
            );
            self.interrupted = true;
        }

        self.results_by_name.entry(test).or_default().push(result);
        Ok(())
    }

    fn handle_suite_end(&mut self) {
        if !self.in_flight.is_empty() {
            warn!(
                count = self.in_flight.len(),
                "suite ended with tests still in flight"
            );
        }
    }

    fn handle_process_output(&mut self, command: &str, data: &str) {
        if !is_crash_log_command(command) {
            return;
        }
        self.crash_log.push_str(data);
        self.crash_log.push('\n');
    }

    fn extract_artifacts(&mut self, result: &mut TestResult) {
        if matches!(result.actual, Outcome::Pass | Outcome::Skip) {
            // No artifacts for passing tests; the raw screenshot payloads
            // are dropped rather than archived for the rest of the run.
            result.screenshots.clear();
            return;
        }
        let expected_text = self.expected_text_for(&result.name);
        // The crash log is attributed to at most one test: the one active
        // when the output was captured.
        let crash_log =
            (!self.crash_log.is_empty()).then(|| std::mem::take(&mut self.crash_log));
        self.artifact_writer
            .extract(result, expected_text.as_deref(), crash_log.as_deref());
    }

    fn expected_text_for(&self, test: &str) -> Option<String> {
        let manifest = self.manifest.as_ref()?;
        let metadata_root = self.metadata_root.as_deref()?;
        if manifest.lookup(test)?.test_type == TestType::Reftest {
            // Reftests are compared pixelwise; there is no text baseline.
            return None;
        }
        let path = manifest.expectation_path(metadata_root, test)?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(error) => {
                debug!(%path, %error, "no checked-in expectation file");
                return None;
            }
        };
        match ExpectationDoc::parse(&contents) {
            Ok(doc) => Some(doc.evaluate(&self.run_info)),
            Err(error) => {
                // Degrade to "no baseline" rather than aborting the run.
                warn!(%path, %error, "failed to parse checked-in expectation file");
                None
            }
        }
    }

    fn report_to_sink(&mut self, result: &TestResult) {
        if self.run_info.used_upstream {
            return;
        }
        let flaky = self
            .results_by_name
            .get(&result.name)
            .is_some_and(|attempts| {
                attempts.iter().any(|attempt| attempt.actual != result.actual)
            });
        self.sink.report_result(&SinkResult {
            name: &result.name,
            actual: result.actual,
            expected: &result.expected,
            unexpected: result.unexpected,
            took: result.took,
            flaky,
            artifacts: &result.artifacts,
        });
    }
}

fn is_crash_log_command(command: &str) -> bool {
    let executable = command.split_whitespace().next().unwrap_or(command);
    let name = executable.rsplit(['/', '\\']).next().unwrap_or(executable);
    CRASH_LOG_COMMANDS.iter().any(|known| name.contains(known))
}
