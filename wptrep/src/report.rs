// Copyright (c) The wptrep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-of-run aggregation into the version-3 results trie.
//!
//! This is a pure fold over the per-test result histories accumulated by the
//! processor: nothing here mutates incrementally during the run. The trie
//! mirrors the on-disk test layout, with one leaf per test id holding the
//! space-joined outcomes across retries.

use crate::{errors::ReportWriteError, results::{Outcome, TestResult}};
use camino::Utf8Path;
use indexmap::IndexMap;
use itertools::Itertools;
use serde_json::{Map, Value, json};
use std::fs;
use tracing::debug;

/// The results JSON format version.
const RESULTS_VERSION: u32 = 3;

/// File names written by [`write_reports`].
pub mod files {
    /// The complete results trie.
    pub const FULL_RESULTS: &str = "full_results.json";
    /// JSONP wrapper around the complete trie.
    pub const FULL_RESULTS_JSONP: &str = "full_results_jsonp.js";
    /// JSONP-wrapped regressions-only trie.
    pub const FAILING_RESULTS: &str = "failing_results.json";
}

/// The end-of-run fold over all per-test result histories.
#[derive(Clone, Debug)]
pub struct ResultsSummary {
    /// The complete version-3 results trie, as written to
    /// `full_results.json`.
    pub full_results: Value,
    /// Count of tests whose final attempt passed.
    pub num_passes: usize,
    /// Count of tests whose final attempt was an unexpected non-pass.
    pub num_regressions: usize,
}

/// Folds the per-test histories into a [`ResultsSummary`].
///
/// Each value in `results_by_name` holds one entry per attempt, oldest
/// first; they are never empty.
pub fn summarize(
    results_by_name: &IndexMap<String, Vec<TestResult>>,
    interrupted: bool,
) -> ResultsSummary {
    let mut tests = Map::new();
    let mut num_passes = 0;
    let mut num_regressions = 0;
    let mut skipped = 0;
    let mut failures_by_type: IndexMap<&'static str, usize> = [
        Outcome::Pass,
        Outcome::Failure,
        Outcome::Skip,
        Outcome::Timeout,
        Outcome::Crash,
    ]
    .into_iter()
    .map(|outcome| (outcome.as_str(), 0))
    .collect();

    for (name, attempts) in results_by_name {
        let Some(leaf) = leaf_record(attempts) else {
            continue;
        };
        let last = attempts.last().expect("leaf_record checked non-emptiness");
        *failures_by_type.entry(last.actual.as_str()).or_default() += 1;
        match last.actual {
            Outcome::Pass => num_passes += 1,
            Outcome::Skip => skipped += 1,
            _ => {}
        }
        if last.unexpected && last.actual != Outcome::Pass {
            num_regressions += 1;
        }
        insert_leaf(&mut tests, name, Value::Object(leaf));
    }

    let full_results = json!({
        "version": RESULTS_VERSION,
        "interrupted": interrupted,
        "path_delimiter": "/",
        "seconds_since_epoch": chrono::Utc::now().timestamp(),
        "num_failures_by_type": failures_by_type,
        "num_passes": num_passes,
        "skipped": skipped,
        "num_regressions": num_regressions,
        "tests": Value::Object(tests),
    });

    ResultsSummary {
        full_results,
        num_passes,
        num_regressions,
    }
}

fn leaf_record(attempts: &[TestResult]) -> Option<Map<String, Value>> {
    let first = attempts.first()?;
    let last = attempts.last()?;

    let mut leaf = Map::new();
    // Retries share the first attempt's expectation.
    leaf.insert("expected".to_owned(), json!(first.expected_string()));
    leaf.insert(
        "actual".to_owned(),
        json!(attempts.iter().map(|attempt| attempt.actual.as_str()).join(" ")),
    );

    let distinct = attempts
        .iter()
        .map(|attempt| attempt.actual)
        .unique()
        .count();
    if distinct > 1 {
        leaf.insert("is_flaky".to_owned(), json!(true));
    }

    let time = round_tenths(first.took.as_secs_f64());
    if time > 0.0 {
        leaf.insert("time".to_owned(), json!(time));
    }

    if attempts.iter().any(|attempt| attempt.is_slow) {
        leaf.insert("is_slow_test".to_owned(), json!(true));
    }
    if last.unexpected {
        leaf.insert("is_unexpected".to_owned(), json!(true));
    }
    if last.unexpected && last.actual != Outcome::Pass {
        leaf.insert("is_regression".to_owned(), json!(true));
    }

    let mut artifacts: IndexMap<&str, Vec<&str>> = IndexMap::new();
    for attempt in attempts {
        for (kind, paths) in &attempt.artifacts {
            artifacts
                .entry(kind.as_str())
                .or_default()
                .extend(paths.iter().map(|path| path.as_str()));
        }
    }
    if !artifacts.is_empty() {
        leaf.insert("artifacts".to_owned(), json!(artifacts));
    }

    let has_stderr = attempts
        .iter()
        .any(|attempt| attempt.artifacts.contains_key(crate::artifacts::kind::STDERR));
    if has_stderr {
        leaf.insert("has_stderr".to_owned(), json!(true));
    }

    if let Some(stats) = attempts.iter().find_map(|attempt| attempt.image_diff_stats) {
        leaf.insert("image_diff_stats".to_owned(), json!(stats));
    }

    Some(leaf)
}

// Half-to-even at one decimal, so that a sub-50ms attempt folds away to
// nothing rather than being written as 0.
fn round_tenths(seconds: f64) -> f64 {
    (seconds * 10.0).round_ties_even() / 10.0
}

fn insert_leaf(tests: &mut Map<String, Value>, name: &str, leaf: Value) {
    let mut segments = name
        .trim_start_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty());
    let Some(mut current) = segments.next() else {
        return;
    };
    let mut node = tests;
    for next in segments {
        let entry = node
            .entry(current.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        node = entry
            .as_object_mut()
            .expect("entry was just made an object");
        current = next;
    }
    node.insert(current.to_owned(), leaf);
}

/// The regressions-only rendition of a full results trie: leaves without
/// `is_regression` are dropped, as is any subtree left empty.
pub fn failing_results(full_results: &Value) -> Value {
    let mut failing = full_results.clone();
    let tests = full_results
        .get("tests")
        .and_then(prune_to_regressions)
        .unwrap_or_else(|| Value::Object(Map::new()));
    failing["tests"] = tests;
    failing
}

fn prune_to_regressions(node: &Value) -> Option<Value> {
    let object = node.as_object()?;
    if object.contains_key("actual") {
        let is_regression = object
            .get("is_regression")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        return is_regression.then(|| node.clone());
    }
    let mut kept = Map::new();
    for (segment, child) in object {
        if let Some(pruned) = prune_to_regressions(child) {
            kept.insert(segment.clone(), pruned);
        }
    }
    (!kept.is_empty()).then_some(Value::Object(kept))
}

/// Writes `full_results.json`, `full_results_jsonp.js` and
/// `failing_results.json` under `output_dir`.
pub fn write_reports(
    output_dir: &Utf8Path,
    summary: &ResultsSummary,
) -> Result<(), ReportWriteError> {
    fs::create_dir_all(output_dir)
        .map_err(|error| ReportWriteError::new(output_dir, error))?;

    let full = to_json_string(&summary.full_results, output_dir)?;
    let failing = to_json_string(&failing_results(&summary.full_results), output_dir)?;

    let write = |file_name: &str, contents: String| {
        let path = output_dir.join(file_name);
        fs::write(&path, contents).map_err(|error| ReportWriteError::new(path.clone(), error))?;
        debug!(%path, "wrote report");
        Ok(())
    };
    write(files::FULL_RESULTS, full.clone())?;
    write(files::FULL_RESULTS_JSONP, format!("ADD_FULL_RESULTS({full});"))?;
    write(files::FAILING_RESULTS, format!("ADD_RESULTS({failing});"))?;
    Ok(())
}

fn to_json_string(value: &Value, output_dir: &Utf8Path) -> Result<String, ReportWriteError> {
    serde_json::to_string(value)
        .map_err(|error| ReportWriteError::new(output_dir, std::io::Error::other(error)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::{RunnerStatus, StatusSource};
    use camino_tempfile::tempdir;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use test_case::test_case;

    fn attempt(name: &str, status: RunnerStatus, expected: &[RunnerStatus]) -> TestResult {
        let mut result = TestResult::new(name, 0);
        result.update(status, expected, StatusSource::Harness);
        result
    }

    #[test]
    fn flaky_retry_is_a_regression_when_the_last_attempt_fails() {
        let mut results = IndexMap::new();
        results.insert(
            "/d.html".to_owned(),
            vec![
                attempt("/d.html", RunnerStatus::Ok, &[RunnerStatus::Ok]),
                attempt("/d.html", RunnerStatus::Error, &[RunnerStatus::Ok]),
            ],
        );
        let summary = summarize(&results, false);
        let leaf = &summary.full_results["tests"]["d.html"];
        assert_eq!(leaf["actual"], json!("PASS FAIL"));
        assert_eq!(leaf["is_flaky"], json!(true));
        assert_eq!(leaf["is_regression"], json!(true));
        assert_eq!(summary.num_regressions, 1);
        assert_eq!(summary.num_passes, 0);
    }

    #[test]
    fn identical_retries_are_not_flaky() {
        let mut results = IndexMap::new();
        results.insert(
            "/t.html".to_owned(),
            vec![
                attempt("/t.html", RunnerStatus::Error, &[RunnerStatus::Ok]),
                attempt("/t.html", RunnerStatus::Error, &[RunnerStatus::Ok]),
            ],
        );
        let summary = summarize(&results, false);
        let leaf = &summary.full_results["tests"]["t.html"];
        assert_eq!(leaf["actual"], json!("FAIL FAIL"));
        assert_eq!(leaf.get("is_flaky"), None);
    }

    #[test]
    fn trie_mirrors_path_segments() {
        let mut results = IndexMap::new();
        results.insert(
            "/css/flex/deep.html".to_owned(),
            vec![attempt(
                "/css/flex/deep.html",
                RunnerStatus::Ok,
                &[RunnerStatus::Ok],
            )],
        );
        let summary = summarize(&results, false);
        assert_eq!(
            summary.full_results["tests"]["css"]["flex"]["deep.html"]["actual"],
            json!("PASS")
        );
        assert_eq!(summary.full_results["path_delimiter"], json!("/"));
        assert_eq!(summary.full_results["version"], json!(3));
    }

    #[test]
    fn zero_duration_is_omitted() {
        let mut results = IndexMap::new();
        let mut fast = attempt("/fast.html", RunnerStatus::Ok, &[RunnerStatus::Ok]);
        fast.took = Duration::from_millis(40);
        let mut slow = attempt("/slow.html", RunnerStatus::Ok, &[RunnerStatus::Ok]);
        slow.took = Duration::from_millis(2370);
        results.insert("/fast.html".to_owned(), vec![fast]);
        results.insert("/slow.html".to_owned(), vec![slow]);
        let summary = summarize(&results, false);
        assert_eq!(summary.full_results["tests"]["fast.html"].get("time"), None);
        assert_eq!(
            summary.full_results["tests"]["slow.html"]["time"],
            json!(2.4)
        );
    }

    #[test_case(0.25, 0.2; "half rounds to even below")]
    #[test_case(0.75, 0.8; "half rounds to even above")]
    #[test_case(0.04, 0.0; "sub-fifty-millisecond folds away")]
    fn duration_rounding_is_half_to_even(seconds: f64, expected: f64) {
        assert_eq!(round_tenths(seconds), expected);
    }

    #[test]
    fn pruning_keeps_only_regressions() {
        let mut results = IndexMap::new();
        results.insert(
            "/a/pass.html".to_owned(),
            vec![attempt("/a/pass.html", RunnerStatus::Ok, &[RunnerStatus::Ok])],
        );
        results.insert(
            "/a/fail.html".to_owned(),
            vec![attempt(
                "/a/fail.html",
                RunnerStatus::Error,
                &[RunnerStatus::Ok],
            )],
        );
        results.insert(
            "/b/pass.html".to_owned(),
            vec![attempt("/b/pass.html", RunnerStatus::Ok, &[RunnerStatus::Ok])],
        );
        let summary = summarize(&results, false);
        let failing = failing_results(&summary.full_results);
        let tests = failing["tests"].as_object().expect("tests object");
        assert!(tests.contains_key("a"), "regressing subtree is kept");
        assert!(
            !tests.contains_key("b"),
            "subtree with no regressions is pruned"
        );
        assert!(tests["a"].get("pass.html").is_none());
        assert!(tests["a"]["fail.html"]["is_regression"].as_bool() == Some(true));
    }

    #[test]
    fn reports_are_written_with_jsonp_wrappers() {
        let dir = tempdir().expect("tempdir");
        let mut results = IndexMap::new();
        results.insert(
            "/a.html".to_owned(),
            vec![attempt("/a.html", RunnerStatus::Error, &[RunnerStatus::Ok])],
        );
        let summary = summarize(&results, true);
        write_reports(dir.path(), &summary).expect("reports should write");

        let full = fs::read_to_string(dir.path().join(files::FULL_RESULTS)).expect("readable");
        let parsed: Value = serde_json::from_str(&full).expect("valid JSON");
        assert_eq!(parsed["interrupted"], json!(true));
        assert_eq!(parsed["num_failures_by_type"]["FAIL"], json!(1));

        let jsonp =
            fs::read_to_string(dir.path().join(files::FULL_RESULTS_JSONP)).expect("readable");
        assert!(jsonp.starts_with("ADD_FULL_RESULTS({"));
        assert!(jsonp.ends_with("});"));

        let failing =
            fs::read_to_string(dir.path().join(files::FAILING_RESULTS)).expect("readable");
        assert!(failing.starts_with("ADD_RESULTS({"));
        assert!(failing.ends_with("});"));
    }
}
