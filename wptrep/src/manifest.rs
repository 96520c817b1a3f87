// Copyright (c) The wptrep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test manifest: where each test lives on disk and how it is compared.

use crate::errors::ManifestError;
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use serde::Deserialize;
use std::fs;

/// Maps test ids to on-disk test files.
///
/// Used to locate checked-in expectation files and to decide how a result
/// should be rendered for diffing.
#[derive(Clone, Debug, Default)]
pub struct TestManifest {
    entries: IndexMap<String, ManifestEntry>,
}

/// One manifest entry.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Path of the test file, relative to the web-tests root.
    pub path: Utf8PathBuf,

    /// How results for this test are compared.
    #[serde(rename = "type", default)]
    pub test_type: TestType,
}

/// How a test's results are compared.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    /// Compared through per-subtest assertions.
    #[default]
    Testharness,

    /// Compared through rendered-screenshot equality.
    Reftest,
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(default)]
    tests: IndexMap<String, ManifestEntry>,
}

impl TestManifest {
    /// Loads a manifest from a JSON file.
    pub fn load(path: &Utf8Path) -> Result<Self, ManifestError> {
        let data = fs::read_to_string(path).map_err(|error| ManifestError::Read {
            path: path.to_owned(),
            error,
        })?;
        Self::from_json(&data).map_err(|error| ManifestError::Parse {
            path: path.to_owned(),
            error,
        })
    }

    /// Parses a manifest from a JSON string.
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        let raw: RawManifest = serde_json::from_str(data)?;
        Ok(Self {
            entries: raw.tests,
        })
    }

    /// Looks up the entry for a test id, ignoring its query and fragment.
    pub fn lookup(&self, test_id: &str) -> Option<&ManifestEntry> {
        self.entries.get(strip_variant(test_id))
    }

    /// Resolves the checked-in expectation file for a test: the test file's
    /// path under `metadata_root`, suffixed `.ini`.
    pub fn expectation_path(
        &self,
        metadata_root: &Utf8Path,
        test_id: &str,
    ) -> Option<Utf8PathBuf> {
        let entry = self.lookup(test_id)?;
        let file_name = format!("{}.ini", entry.path.file_name()?);
        Some(metadata_root.join(entry.path.with_file_name(file_name)))
    }
}

/// Strips the query string and fragment from a test id.
pub fn strip_variant(test_id: &str) -> &str {
    match test_id.find(['?', '#']) {
        Some(index) => &test_id[..index],
        None => test_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn manifest() -> TestManifest {
        TestManifest::from_json(
            r#"{"tests": {
                "/a/b.html": {"path": "a/b.html"},
                "/r/match.html": {"path": "r/match.html", "type": "reftest"}
            }}"#,
        )
        .expect("manifest should parse")
    }

    #[test]
    fn lookup_ignores_query_and_fragment() {
        let manifest = manifest();
        let entry = manifest
            .lookup("/a/b.html?variant=1#frag")
            .expect("variant should resolve to the base test");
        assert_eq!(entry.path, "a/b.html");
        assert_eq!(entry.test_type, TestType::Testharness);
        assert!(manifest.lookup("/missing.html").is_none());
    }

    #[test]
    fn reftest_type_round_trips() {
        let manifest = manifest();
        let entry = manifest.lookup("/r/match.html").expect("entry exists");
        assert_eq!(entry.test_type, TestType::Reftest);
    }

    #[test]
    fn expectation_path_appends_ini_under_metadata_root() {
        let manifest = manifest();
        assert_eq!(
            manifest.expectation_path(Utf8Path::new("wpt-metadata"), "/a/b.html?x=1"),
            Some(Utf8PathBuf::from("wpt-metadata/a/b.html.ini"))
        );
    }
}
