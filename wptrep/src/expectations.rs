// Copyright (c) The wptrep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Checked-in expectation metadata files.
//!
//! One metadata file sits next to each test file (suffixed `.ini`) and
//! records the statuses the test and its subtests are expected to produce,
//! optionally conditioned on run-info properties:
//!
//! ```text
//! [test.html]
//!   expected: OK
//!   [a failing subtest]
//!     expected:
//!       if os == "linux": TIMEOUT
//!       FAIL
//! ```
//!
//! The parser here is deliberately minimal: it understands section nesting,
//! plain `key: value` pairs, and conditional value blocks with equality and
//! truthiness conditions. Files that do not parse degrade to "no checked-in
//! baseline" at the artifact layer. That is a known blind spot: a genuinely
//! malformed file is only ever reported in the logs.

use crate::{errors::ExpectationParseError, events::RunInfo};
use serde_json::Value;
use std::fmt::Write;

/// A parsed expectation metadata document.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExpectationDoc {
    sections: Vec<Section>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Section {
    name: String,
    keys: Vec<KeyBlock>,
    children: Vec<Section>,
}

impl Section {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: Vec::new(),
            children: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct KeyBlock {
    key: String,
    branches: Vec<ConditionalValue>,
    default: Option<String>,
}

impl KeyBlock {
    fn resolve(&self, run_info: &RunInfo) -> Option<&str> {
        for branch in &self.branches {
            if branch.condition.eval(run_info) {
                return Some(&branch.value);
            }
        }
        self.default.as_deref()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct ConditionalValue {
    condition: Condition,
    value: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Condition {
    Truthy(String),
    Not(String),
    Eq(String, String),
    Ne(String, String),
}

impl Condition {
    fn eval(&self, run_info: &RunInfo) -> bool {
        match self {
            Self::Truthy(name) => run_info.property(name).is_some_and(|value| truthy(&value)),
            Self::Not(name) => !run_info.property(name).is_some_and(|value| truthy(&value)),
            Self::Eq(name, literal) => run_info
                .property(name)
                .is_some_and(|value| property_string(&value) == *literal),
            Self::Ne(name, literal) => run_info
                .property(name)
                .is_none_or(|value| property_string(&value) != *literal),
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::String(text) => !text.is_empty(),
        Value::Number(number) => number.as_f64() != Some(0.0),
        Value::Null => false,
        _ => true,
    }
}

fn property_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

impl ExpectationDoc {
    /// Parses a metadata document.
    pub fn parse(input: &str) -> Result<Self, ExpectationParseError> {
        let mut parser = Parser::default();
        for (index, raw_line) in input.lines().enumerate() {
            parser.line(index + 1, raw_line)?;
        }
        Ok(Self {
            sections: parser.finish(),
        })
    }

    /// Renders the document with every conditional value resolved against
    /// `run_info`, in the shape used for the `expected_text` artifact.
    pub fn evaluate(&self, run_info: &RunInfo) -> String {
        let mut out = String::new();
        for section in &self.sections {
            render_section(&mut out, section, 0, run_info);
        }
        out
    }
}

fn render_section(out: &mut String, section: &Section, depth: usize, run_info: &RunInfo) {
    let indent = "  ".repeat(depth);
    let _ = writeln!(out, "{indent}[{}]", section.name);
    for key in &section.keys {
        if let Some(value) = key.resolve(run_info) {
            let _ = writeln!(out, "{indent}  {}: {value}", key.key);
        }
    }
    for child in &section.children {
        render_section(out, child, depth + 1, run_info);
    }
}

#[derive(Default)]
struct Parser {
    roots: Vec<Section>,
    // Sections still being built, innermost last, with their header indents.
    stack: Vec<(usize, Section)>,
    // A `key:` block awaiting conditional/default value lines.
    open_key: Option<(usize, KeyBlock)>,
}

impl Parser {
    fn line(&mut self, number: usize, raw: &str) -> Result<(), ExpectationParseError> {
        let indent = raw.len() - raw.trim_start_matches(' ').len();
        if raw[indent..].starts_with('\t') {
            return Err(ExpectationParseError::TabIndent { line: number });
        }
        let content = raw[indent..].trim_end();
        if content.is_empty() || content.starts_with('#') {
            return Ok(());
        }

        if let Some((key_indent, _)) = &self.open_key {
            if indent > *key_indent {
                return self.value_line(number, content);
            }
            self.close_key();
        }

        if let Some(rest) = content.strip_prefix('[') {
            let Some(name) = rest.strip_suffix(']') else {
                return Err(ExpectationParseError::UnterminatedSection { line: number });
            };
            self.close_sections(indent);
            self.stack.push((indent, Section::new(name.trim())));
            return Ok(());
        }

        if content.starts_with("if ") {
            return Err(ExpectationParseError::StrayConditional { line: number });
        }

        if let Some((key, value)) = content.split_once(':') {
            if self.stack.is_empty() {
                return Err(ExpectationParseError::Malformed { line: number });
            }
            let key = key.trim().to_owned();
            let value = value.trim();
            if value.is_empty() {
                self.open_key = Some((
                    indent,
                    KeyBlock {
                        key,
                        branches: Vec::new(),
                        default: None,
                    },
                ));
            } else {
                self.attach_key(KeyBlock {
                    key,
                    branches: Vec::new(),
                    default: Some(value.to_owned()),
                });
            }
            return Ok(());
        }

        Err(ExpectationParseError::Malformed { line: number })
    }

    // A line inside an open `key:` block: either `if cond: value` or a bare
    // default value.
    fn value_line(&mut self, number: usize, content: &str) -> Result<(), ExpectationParseError> {
        let Some((_, block)) = &mut self.open_key else {
            return Err(ExpectationParseError::Malformed { line: number });
        };
        if let Some(rest) = content.strip_prefix("if ") {
            let Some((condition, value)) = rest.split_once(':') else {
                return Err(ExpectationParseError::Malformed { line: number });
            };
            let value = value.trim();
            if value.is_empty() {
                return Err(ExpectationParseError::Malformed { line: number });
            }
            block.branches.push(ConditionalValue {
                condition: parse_condition(condition.trim(), number)?,
                value: value.to_owned(),
            });
        } else {
            block.default = Some(content.to_owned());
        }
        Ok(())
    }

    fn close_key(&mut self) {
        if let Some((_, block)) = self.open_key.take() {
            self.attach_key(block);
        }
    }

    fn attach_key(&mut self, block: KeyBlock) {
        if let Some((_, section)) = self.stack.last_mut() {
            section.keys.push(block);
        }
    }

    fn close_sections(&mut self, indent: usize) {
        while let Some((header_indent, _)) = self.stack.last() {
            if *header_indent < indent {
                break;
            }
            let (_, section) = self.stack.pop().expect("stack is non-empty");
            self.attach_section(section);
        }
    }

    fn attach_section(&mut self, section: Section) {
        match self.stack.last_mut() {
            Some((_, parent)) => parent.children.push(section),
            None => self.roots.push(section),
        }
    }

    fn finish(mut self) -> Vec<Section> {
        self.close_key();
        while let Some((_, section)) = self.stack.pop() {
            self.attach_section(section);
        }
        self.roots
    }
}

fn parse_condition(text: &str, line: usize) -> Result<Condition, ExpectationParseError> {
    if let Some((lhs, rhs)) = text.split_once("==") {
        return Ok(Condition::Eq(
            identifier(lhs.trim(), text, line)?,
            literal(rhs.trim(), text, line)?,
        ));
    }
    if let Some((lhs, rhs)) = text.split_once("!=") {
        return Ok(Condition::Ne(
            identifier(lhs.trim(), text, line)?,
            literal(rhs.trim(), text, line)?,
        ));
    }
    if let Some(name) = text.strip_prefix("not ") {
        return Ok(Condition::Not(identifier(name.trim(), text, line)?));
    }
    Ok(Condition::Truthy(identifier(text, text, line)?))
}

fn identifier(
    name: &str,
    condition: &str,
    line: usize,
) -> Result<String, ExpectationParseError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name.to_owned())
    } else {
        Err(ExpectationParseError::BadCondition {
            line,
            condition: condition.to_owned(),
        })
    }
}

// The right-hand side must be a single quoted string or bare token;
// anything else (boolean operators, concatenation) is out of scope for
// this evaluator and rejected outright.
fn literal(text: &str, condition: &str, line: usize) -> Result<String, ExpectationParseError> {
    if let Some(inner) = text
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        && !inner.contains('"')
    {
        return Ok(inner.to_owned());
    }
    if !text.is_empty()
        && !text.contains('"')
        && !text.contains(char::is_whitespace)
    {
        return Ok(text.to_owned());
    }
    Err(ExpectationParseError::BadCondition {
        line,
        condition: condition.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn linux_run_info() -> RunInfo {
        RunInfo {
            os: Some("linux".to_owned()),
            ..RunInfo::default()
        }
    }

    #[test]
    fn evaluates_conditions_against_run_info() {
        let doc = ExpectationDoc::parse(indoc! {r#"
            [test.html]
              expected: OK
              [subtest one]
                expected:
                  if os == "mac": PASS
                  if os == "linux": TIMEOUT
                  FAIL
        "#})
        .expect("document should parse");
        assert_eq!(
            doc.evaluate(&linux_run_info()),
            indoc! {"
                [test.html]
                  expected: OK
                  [subtest one]
                    expected: TIMEOUT
            "}
        );
    }

    #[test]
    fn falls_back_to_the_default_value() {
        let doc = ExpectationDoc::parse(indoc! {r#"
            [test.html]
              expected:
                if os == "mac": PASS
                CRASH
        "#})
        .expect("document should parse");
        assert_eq!(
            doc.evaluate(&linux_run_info()),
            "[test.html]\n  expected: CRASH\n"
        );
    }

    #[test]
    fn truthiness_and_negation_conditions() {
        let doc = ExpectationDoc::parse(indoc! {"
            [test.html]
              expected:
                if sanitizer_enabled: TIMEOUT
                if not sanitizer_enabled: PASS
        "})
        .expect("document should parse");
        let mut run_info = linux_run_info();
        assert_eq!(
            doc.evaluate(&run_info),
            "[test.html]\n  expected: PASS\n"
        );
        run_info.sanitizer_enabled = true;
        assert_eq!(
            doc.evaluate(&run_info),
            "[test.html]\n  expected: TIMEOUT\n"
        );
    }

    #[test]
    fn sibling_sections_close_at_matching_indent() {
        let doc = ExpectationDoc::parse(indoc! {"
            [a.html]
              expected: FAIL
            [b.html]
              expected: PASS
        "})
        .expect("document should parse");
        assert_eq!(
            doc.evaluate(&RunInfo::default()),
            "[a.html]\n  expected: FAIL\n[b.html]\n  expected: PASS\n"
        );
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let doc = ExpectationDoc::parse(indoc! {"
            # a checked-in note

            [test.html]
              expected: OK
        "})
        .expect("document should parse");
        assert_eq!(
            doc.evaluate(&RunInfo::default()),
            "[test.html]\n  expected: OK\n"
        );
    }

    #[test]
    fn tab_indentation_is_rejected() {
        let error = ExpectationDoc::parse("[a.html]\n\texpected: OK\n")
            .expect_err("tabs should be rejected");
        assert_eq!(error, ExpectationParseError::TabIndent { line: 2 });
    }

    #[test]
    fn unterminated_section_is_rejected() {
        let error =
            ExpectationDoc::parse("[a.html\n").expect_err("missing bracket should be rejected");
        assert_eq!(error, ExpectationParseError::UnterminatedSection { line: 1 });
    }

    #[test]
    fn conditional_outside_a_key_block_is_rejected() {
        let error = ExpectationDoc::parse("[a.html]\n  if os == \"linux\": FAIL\n")
            .expect_err("stray conditional should be rejected");
        assert_eq!(error, ExpectationParseError::StrayConditional { line: 2 });
    }

    #[test]
    fn unsupported_condition_is_rejected() {
        let error = ExpectationDoc::parse(indoc! {r#"
            [a.html]
              expected:
                if os == "linux" and debug: FAIL
        "#})
        .expect_err("compound conditions are not supported");
        assert!(
            matches!(error, ExpectationParseError::BadCondition { line: 3, .. }),
            "expected BadCondition, found {error:?}"
        );
    }
}
