// Copyright (c) The wptrep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Writing per-test artifacts to the output directory.
//!
//! For every finalized non-passing result the writer produces a
//! metadata-format dump of the observed statuses, diffs against the
//! checked-in baseline when one exists, decoded reftest screenshots with a
//! pixel diff, and stderr/crash-log captures. Each artifact is written
//! independently: an individual failure is logged and skipped, never fatal
//! to the run.

use crate::{
    errors::ArtifactWriteError,
    results::{ImageDiffStats, TestResult},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use camino::Utf8PathBuf;
use image::{ImageFormat, RgbaImage};
use similar::{ChangeTag, TextDiff};
use std::{fmt::Write as _, fs};
use tracing::warn;

/// Artifact kinds as recorded in the results JSON.
pub mod kind {
    /// Metadata-format dump of the observed statuses.
    pub const ACTUAL_TEXT: &str = "actual_text";
    /// The checked-in expectations, evaluated for this run.
    pub const EXPECTED_TEXT: &str = "expected_text";
    /// Unified diff of expected against actual.
    pub const TEXT_DIFF: &str = "text_diff";
    /// HTML rendering of the diff.
    pub const PRETTY_TEXT_DIFF: &str = "pretty_text_diff";
    /// The test's own rendering, for reftests.
    pub const ACTUAL_IMAGE: &str = "actual_image";
    /// The reference rendering, for reftests.
    pub const EXPECTED_IMAGE: &str = "expected_image";
    /// Per-channel difference of the two renderings.
    pub const IMAGE_DIFF: &str = "image_diff";
    /// Harness and subtest diagnostic messages.
    pub const STDERR: &str = "stderr";
    /// Output captured from crashed browser processes.
    pub const CRASH_LOG: &str = "crash_log";
}

/// Derives the output-relative artifact path for a test id.
///
/// The extension is dropped, query-string characters are flattened to `_`,
/// and the suffix (e.g. `-actual.txt`) is appended, so
/// `/a/b.html?mode=strict` becomes `a/b_mode_strict-actual.txt`.
pub fn artifact_path(test_id: &str, suffix: &str) -> Utf8PathBuf {
    let trimmed = test_id.trim_start_matches('/');
    let (base, variant) = match trimmed.find(['?', '#']) {
        Some(index) => (&trimmed[..index], &trimmed[index..]),
        None => (trimmed, ""),
    };
    let stem = match (base.rfind('.'), base.rfind('/')) {
        (Some(dot), Some(slash)) if dot > slash => &base[..dot],
        (Some(dot), None) => &base[..dot],
        _ => base,
    };
    let mut name = String::with_capacity(trimmed.len() + suffix.len());
    name.push_str(stem);
    for c in variant.chars() {
        name.push(match c {
            '?' | '#' | '=' | '&' | ':' | '*' | '<' | '>' | '|' | '"' | '\\' => '_',
            c => c,
        });
    }
    name.push_str(suffix);
    Utf8PathBuf::from(name)
}

/// Writes artifacts for finalized results under one output directory.
///
/// Only the consumer task writes through this; recorded paths are always
/// relative to the output directory.
#[derive(Clone, Debug)]
pub struct ArtifactWriter {
    output_dir: Utf8PathBuf,
}

impl ArtifactWriter {
    /// Creates a writer rooted at `output_dir`.
    pub fn new(output_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Writes every artifact for a finalized result, recording
    /// output-relative paths on the result itself.
    pub fn extract(
        &self,
        result: &mut TestResult,
        expected_text: Option<&str>,
        crash_log: Option<&str>,
    ) {
        let actual_text = result.actual_metadata();
        self.record_text(result, kind::ACTUAL_TEXT, "-actual.txt", &actual_text);
        if let Some(expected) = expected_text {
            self.record_text(result, kind::EXPECTED_TEXT, "-expected.txt", expected);
            let diff = unified_diff(expected, &actual_text);
            self.record_text(result, kind::TEXT_DIFF, "-diff.txt", &diff);
            let pretty = pretty_diff_html(expected, &actual_text);
            self.record_text(result, kind::PRETTY_TEXT_DIFF, "-pretty-diff.html", &pretty);
        }
        self.write_screenshots(result);
        if !result.messages.is_empty() {
            let stderr = result.messages.join("\n");
            self.record_text(result, kind::STDERR, "-stderr.txt", &stderr);
        }
        if let Some(log) = crash_log {
            self.record_text(result, kind::CRASH_LOG, "-crash-log.txt", log);
        }
    }

    fn record_text(&self, result: &mut TestResult, kind: &str, suffix: &str, contents: &str) {
        self.record(result, kind, suffix, contents.as_bytes());
    }

    fn record(&self, result: &mut TestResult, kind: &str, suffix: &str, contents: &[u8]) {
        match self.write_file(&result.name, suffix, contents) {
            Ok(path) => {
                result.artifacts.entry(kind.to_owned()).or_default().push(path);
            }
            Err(error) => {
                warn!(test = %result.name, %error, "skipping artifact");
            }
        }
    }

    fn write_file(
        &self,
        test_id: &str,
        suffix: &str,
        contents: &[u8],
    ) -> Result<Utf8PathBuf, ArtifactWriteError> {
        let rel = artifact_path(test_id, suffix);
        let abs = self.output_dir.join(&rel);
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent).map_err(|error| ArtifactWriteError::Write {
                path: abs.clone(),
                error,
            })?;
        }
        fs::write(&abs, contents).map_err(|error| ArtifactWriteError::Write {
            path: abs.clone(),
            error,
        })?;
        Ok(rel)
    }

    // Consumes the raw payloads: once decoded to disk, the result carries
    // only the artifact paths.
    fn write_screenshots(&self, result: &mut TestResult) {
        if result.screenshots.is_empty() {
            return;
        }
        let screenshots = std::mem::take(&mut result.screenshots);

        let mut decoded = Vec::with_capacity(2);
        for (index, shot) in screenshots.iter().take(2).enumerate() {
            let (suffix, kind) = if index == 0 {
                ("-actual.png", kind::ACTUAL_IMAGE)
            } else {
                ("-expected.png", kind::EXPECTED_IMAGE)
            };
            match STANDARD.decode(shot.data_base64.as_bytes()) {
                Ok(bytes) => {
                    self.record(result, kind, suffix, &bytes);
                    decoded.push((shot.url.clone(), bytes));
                }
                Err(error) => {
                    let error = ArtifactWriteError::ScreenshotDecode {
                        url: shot.url.clone(),
                        error,
                    };
                    warn!(%error, "skipping undecodable screenshot");
                }
            }
        }

        if let [(actual_url, actual), (_, expected)] = &decoded[..] {
            match compare_images(actual_url, actual, expected) {
                Ok(ImageComparison::Identical) => {}
                Ok(ImageComparison::DimensionMismatch(stats)) => {
                    warn!(test = %result.name, "screenshot dimensions differ");
                    result.image_diff_stats = Some(stats);
                }
                Ok(ImageComparison::Different { stats, diff }) => {
                    self.record_diff_image(result, &diff);
                    result.image_diff_stats = Some(stats);
                }
                Err(error) => {
                    warn!(test = %result.name, %error, "skipping image comparison");
                }
            }
        }
    }

    fn record_diff_image(&self, result: &mut TestResult, diff: &RgbaImage) {
        let rel = artifact_path(&result.name, "-diff.png");
        let abs = self.output_dir.join(&rel);
        let written = match abs.parent() {
            Some(parent) => fs::create_dir_all(parent).map_err(|error| {
                ArtifactWriteError::Write {
                    path: abs.clone(),
                    error,
                }
            }),
            None => Ok(()),
        }
        .and_then(|()| {
            diff.save(abs.as_std_path())
                .map_err(|error| ArtifactWriteError::ImageEncode {
                    path: abs.clone(),
                    error,
                })
        });
        match written {
            Ok(()) => {
                result
                    .artifacts
                    .entry(kind::IMAGE_DIFF.to_owned())
                    .or_default()
                    .push(rel);
            }
            Err(error) => {
                warn!(test = %result.name, %error, "skipping artifact");
            }
        }
    }
}

enum ImageComparison {
    Identical,
    DimensionMismatch(ImageDiffStats),
    Different {
        stats: ImageDiffStats,
        diff: RgbaImage,
    },
}

fn compare_images(
    actual_url: &str,
    actual: &[u8],
    expected: &[u8],
) -> Result<ImageComparison, ArtifactWriteError> {
    if actual == expected {
        return Ok(ImageComparison::Identical);
    }
    let decode = |bytes: &[u8]| {
        image::load_from_memory_with_format(bytes, ImageFormat::Png)
            .map(|img| img.to_rgba8())
            .map_err(|error| ArtifactWriteError::ImageDecode {
                url: actual_url.to_owned(),
                error,
            })
    };
    let actual = decode(actual)?;
    let expected = decode(expected)?;
    if actual.dimensions() != expected.dimensions() {
        return Ok(ImageComparison::DimensionMismatch(ImageDiffStats {
            max_pixel_diff: u32::from(u8::MAX) * 4,
            max_channel_diff: u8::MAX,
        }));
    }

    let (width, height) = actual.dimensions();
    let mut diff = RgbaImage::new(width, height);
    let mut stats = ImageDiffStats::default();
    for (diff_pixel, (actual_pixel, expected_pixel)) in diff
        .pixels_mut()
        .zip(actual.pixels().zip(expected.pixels()))
    {
        let mut pixel_total = 0u32;
        let mut channels = [0u8; 4];
        for (index, channel) in channels.iter_mut().enumerate() {
            let delta = actual_pixel.0[index].abs_diff(expected_pixel.0[index]);
            *channel = delta;
            pixel_total += u32::from(delta);
            stats.max_channel_diff = stats.max_channel_diff.max(delta);
        }
        stats.max_pixel_diff = stats.max_pixel_diff.max(pixel_total);
        // Full alpha so the diff is visible wherever the pixels disagree.
        diff_pixel.0 = [channels[0], channels[1], channels[2], u8::MAX];
    }

    if stats == ImageDiffStats::default() {
        Ok(ImageComparison::Identical)
    } else {
        Ok(ImageComparison::Different { stats, diff })
    }
}

fn unified_diff(expected: &str, actual: &str) -> String {
    let diff = TextDiff::from_lines(expected, actual);
    let mut unified = diff.unified_diff();
    unified.context_radius(3).header("expected", "actual");
    unified.to_string()
}

fn pretty_diff_html(expected: &str, actual: &str) -> String {
    let diff = TextDiff::from_lines(expected, actual);
    let mut rows = String::new();
    for change in diff.iter_all_changes() {
        let (class, sign) = match change.tag() {
            ChangeTag::Delete => ("del", "-"),
            ChangeTag::Insert => ("ins", "+"),
            ChangeTag::Equal => ("ctx", "&nbsp;"),
        };
        let _ = writeln!(
            rows,
            "<tr class=\"{class}\"><td>{sign}</td><td><pre>{}</pre></td></tr>",
            html_escape(change.value().trim_end_matches('\n')),
        );
    }
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<style>\n\
         table {{ border-collapse: collapse; font-family: monospace; }}\n\
         td {{ padding: 0 0.5em; vertical-align: top; }}\n\
         pre {{ margin: 0; }}\n\
         tr.del {{ background-color: #ffdddd; }}\n\
         tr.ins {{ background-color: #ddffdd; }}\n\
         </style>\n</head>\n<body>\n<table>\n{rows}</table>\n</body>\n</html>\n"
    )
}

fn html_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::{RunnerStatus, StatusSource};
    use camino_tempfile::tempdir;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("/a/b.html", "-actual.txt", "a/b-actual.txt"; "plain test id")]
    #[test_case("/a/b.html?mode=strict", "-actual.txt", "a/b_mode_strict-actual.txt"; "query string flattened")]
    #[test_case("/a/b.html?a=1&b=2", "-diff.txt", "a/b_a_1_b_2-diff.txt"; "multiple parameters")]
    #[test_case("/a/noext", "-stderr.txt", "a/noext-stderr.txt"; "no extension")]
    fn artifact_paths(test_id: &str, suffix: &str, expected: &str) {
        assert_eq!(artifact_path(test_id, suffix), Utf8PathBuf::from(expected));
    }

    fn failing_result() -> TestResult {
        let mut result = TestResult::new("/a/b.html", 0);
        result.record_subtest("sub1", RunnerStatus::Fail, vec![RunnerStatus::Pass], None);
        result.update(
            RunnerStatus::Ok,
            &[RunnerStatus::Ok],
            StatusSource::Harness,
        );
        result
    }

    #[test]
    fn writes_actual_text_and_diffs_against_a_baseline() {
        let dir = tempdir().expect("tempdir");
        let writer = ArtifactWriter::new(dir.path());
        let mut result = failing_result();
        let baseline = "[b.html]\n  expected: OK\n  [sub1]\n    expected: PASS\n";
        writer.extract(&mut result, Some(baseline), None);

        for kind in [
            kind::ACTUAL_TEXT,
            kind::EXPECTED_TEXT,
            kind::TEXT_DIFF,
            kind::PRETTY_TEXT_DIFF,
        ] {
            let paths = result
                .artifacts
                .get(kind)
                .unwrap_or_else(|| panic!("missing artifact kind {kind}"));
            assert_eq!(paths.len(), 1);
            assert!(
                dir.path().join(&paths[0]).is_file(),
                "artifact {kind} should exist on disk"
            );
        }
        let diff = fs::read_to_string(
            dir.path().join(&result.artifacts[kind::TEXT_DIFF][0]),
        )
        .expect("diff should be readable");
        assert!(
            diff.contains("-    expected: PASS") && diff.contains("+    expected: FAIL"),
            "diff should show the subtest regression:\n{diff}"
        );
    }

    #[test]
    fn missing_baseline_still_writes_actual_text() {
        let dir = tempdir().expect("tempdir");
        let writer = ArtifactWriter::new(dir.path());
        let mut result = failing_result();
        writer.extract(&mut result, None, None);
        assert!(result.artifacts.contains_key(kind::ACTUAL_TEXT));
        assert!(!result.artifacts.contains_key(kind::EXPECTED_TEXT));
        assert!(!result.artifacts.contains_key(kind::TEXT_DIFF));
    }

    #[test]
    fn crash_log_and_stderr_artifacts() {
        let dir = tempdir().expect("tempdir");
        let writer = ArtifactWriter::new(dir.path());
        let mut result = failing_result();
        result.messages.push("sub1: assert_true failed".to_owned());
        writer.extract(&mut result, None, Some("#0 0xdeadbeef base::Crash()\n"));
        let crash_path = &result.artifacts[kind::CRASH_LOG][0];
        assert_eq!(crash_path, &Utf8PathBuf::from("a/b-crash-log.txt"));
        let log = fs::read_to_string(dir.path().join(crash_path)).expect("readable");
        assert!(log.contains("0xdeadbeef"));
        assert!(result.artifacts.contains_key(kind::STDERR));
    }

    fn encode_png(pixels: &RgbaImage) -> Vec<u8> {
        use std::io::Cursor;
        let mut bytes = Vec::new();
        pixels
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .expect("in-memory PNG encode");
        bytes
    }

    #[test]
    fn differing_screenshots_produce_a_diff_and_stats() {
        let dir = tempdir().expect("tempdir");
        let writer = ArtifactWriter::new(dir.path());

        let mut left = RgbaImage::new(2, 1);
        left.put_pixel(0, 0, image::Rgba([10, 20, 30, 255]));
        left.put_pixel(1, 0, image::Rgba([0, 0, 0, 255]));
        let mut right = left.clone();
        right.put_pixel(1, 0, image::Rgba([5, 0, 0, 255]));

        let mut result = failing_result();
        result.screenshots = vec![
            crate::events::Screenshot {
                url: "/a/b.html".to_owned(),
                hash: None,
                data_base64: STANDARD.encode(encode_png(&left)),
            },
            crate::events::Screenshot {
                url: "/a/b-ref.html".to_owned(),
                hash: None,
                data_base64: STANDARD.encode(encode_png(&right)),
            },
        ];
        writer.extract(&mut result, None, None);

        assert!(result.artifacts.contains_key(kind::ACTUAL_IMAGE));
        assert!(result.artifacts.contains_key(kind::EXPECTED_IMAGE));
        assert!(result.artifacts.contains_key(kind::IMAGE_DIFF));
        assert_eq!(
            result.image_diff_stats,
            Some(ImageDiffStats {
                max_pixel_diff: 5,
                max_channel_diff: 5,
            })
        );
    }

    #[test]
    fn identical_screenshots_produce_no_diff() {
        let dir = tempdir().expect("tempdir");
        let writer = ArtifactWriter::new(dir.path());
        let mut image = RgbaImage::new(1, 1);
        image.put_pixel(0, 0, image::Rgba([1, 2, 3, 255]));
        let bytes = encode_png(&image);

        let mut result = failing_result();
        result.screenshots = vec![
            crate::events::Screenshot {
                url: "/a/b.html".to_owned(),
                hash: None,
                data_base64: STANDARD.encode(&bytes),
            },
            crate::events::Screenshot {
                url: "/a/b-ref.html".to_owned(),
                hash: None,
                data_base64: STANDARD.encode(&bytes),
            },
        ];
        writer.extract(&mut result, None, None);
        assert!(!result.artifacts.contains_key(kind::IMAGE_DIFF));
        assert_eq!(result.image_diff_stats, None);
    }
}
