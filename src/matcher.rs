//! Expectation matching against captured subject output.

use crate::schema::{ExpectClause, ExpectMode};
use regex::RegexBuilder;

/// Evaluate every clause against the output. Returns the overall verdict
/// plus each failing clause, so diagnostics can show all misses at once.
pub fn check_all<'a>(
    clauses: &'a [ExpectClause],
    output: &str,
) -> (bool, Vec<&'a ExpectClause>) {
    let mut failed = Vec::new();
    for clause in clauses {
        if !check_clause(clause, output) {
            failed.push(clause);
        }
    }
    (failed.is_empty(), failed)
}

pub fn check_clause(clause: &ExpectClause, output: &str) -> bool {
    match clause.mode {
        ExpectMode::Text => literal_found(&clause.value, output) == Some(true),
        ExpectMode::TextNone => literal_found(&clause.value, output) == Some(false),
        // A pattern that fails to compile can never be satisfied, in
        // either polarity.
        ExpectMode::Regex => pattern_found(&clause.value, output) == Some(true),
        ExpectMode::RegexNone => pattern_found(&clause.value, output) == Some(false),
        ExpectMode::File => match std::fs::read_to_string(&clause.value) {
            Ok(contents) => file_matches(&contents, output),
            Err(_) => false,
        },
        ExpectMode::Json => match std::fs::read_to_string(&clause.value) {
            Ok(contents) => json_matches(&clause.value, &contents, output),
            Err(_) => false,
        },
    }
}

/// Whether some output line, ignoring surrounding whitespace, equals the
/// literal. Implemented as an anchored multiline search so multiline
/// literals work too.
fn literal_found(literal: &str, output: &str) -> Option<bool> {
    pattern_found(&format!(r"^\s*{}\s*$", regex::escape(literal)), output)
}

fn pattern_found(pattern: &str, output: &str) -> Option<bool> {
    let re = RegexBuilder::new(pattern).multi_line(true).build().ok()?;
    Some(re.is_match(output))
}

fn file_matches(expected: &str, output: &str) -> bool {
    expected.trim() == output.trim()
}

/// Structural JSON equality. An `.ndjson` expectation compares the
/// outputs line by line; plain JSON requires the output to be exactly one
/// decodable line. Undecodable content on either side is a mismatch.
fn json_matches(path: &str, expected: &str, output: &str) -> bool {
    let parse = |s: &str| serde_json::from_str::<serde_json::Value>(s).ok();
    if path.ends_with(".ndjson") {
        let expected_lines: Vec<&str> = expected.trim().lines().collect();
        let output_lines: Vec<&str> = output.trim().lines().collect();
        if expected_lines.len() != output_lines.len() {
            return false;
        }
        expected_lines
            .iter()
            .zip(&output_lines)
            .all(|(e, o)| match (parse(e), parse(o)) {
                (Some(e), Some(o)) => e == o,
                _ => false,
            })
    } else {
        let output = output.trim();
        if output.lines().count() != 1 {
            return false;
        }
        match (parse(expected), parse(output)) {
            (Some(e), Some(o)) => e == o,
            _ => false,
        }
    }
}

/// Diagnostic lines for one failed clause, ready to print under the
/// FAILED banner.
pub fn failure_detail(clause: &ExpectClause, output: &str) -> String {
    match clause.mode {
        ExpectMode::Text => format!("\tExpected: {}", escape(&clause.value)),
        ExpectMode::TextNone => format!("\tExpected no: {}", escape(&clause.value)),
        ExpectMode::Regex => format!("\tExpected REGEX: {}", escape(&clause.value)),
        ExpectMode::RegexNone => format!("\tExpected no REGEX: {}", escape(&clause.value)),
        ExpectMode::File => match std::fs::read_to_string(&clause.value) {
            Ok(contents) => format!("\tExpected FILE:\n{}", contents.trim()),
            Err(err) => format!("\tExpected FILE: {} (unreadable: {err})", clause.value),
        },
        ExpectMode::Json => match std::fs::read_to_string(&clause.value) {
            Ok(contents) => format!(
                "\tExpected JSON:\n{}\n\tFound:\n{}",
                pretty_json(&contents),
                pretty_json(output)
            ),
            Err(err) => format!("\tExpected JSON: {} (unreadable: {err})", clause.value),
        },
    }
}

fn pretty_json(text: &str) -> String {
    let pretty_one = |line: &str| match serde_json::from_str::<serde_json::Value>(line) {
        Ok(value) => serde_json::to_string_pretty(&value)
            .unwrap_or_else(|_| line.to_string()),
        Err(err) => format!("could not parse JSON: {err}: {line}"),
    };
    text.trim().lines().map(pretty_one).collect::<Vec<_>>().join("\n")
}

/// Control characters made visible for diagnostics.
pub fn escape(s: &str) -> String {
    s.chars().flat_map(char::escape_default).collect()
}
