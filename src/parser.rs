//! Directive-file parser and test discovery.
//!
//! Test files are plain text: blank-line-delimited blocks of
//! `DIRECTIVE rest-of-line` entries, `#` comments, and continuation lines
//! indented to the column where the previous directive's argument began
//! (PROG and EXPECT-family payloads only).

use crate::features;
use crate::schema::{ExpectClause, ExpectMode, TestCase, AOT_SUITE};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Subdirectories of the test root that never contain test files.
pub const IGNORED_DIRS: &[&str] = &["engine", "scripts", "outputs"];

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("test {field} is required. Suite: {suite}")]
    RequiredField { field: &'static str, suite: String },
    #[error("field {field} is unknown. Suite: {suite}")]
    UnknownField { field: String, suite: String },
    #[error("{message}. Suite: {suite}")]
    InvalidField { message: String, suite: String },
    #[error("failed to read test files: {0}")]
    Io(#[from] std::io::Error),
}

/// Discover and parse every test file under `root`.
///
/// Returns (suite, tests) pairs sorted by suite name, tests sorted by
/// name. Suites with no tests surviving architecture filtering are
/// dropped. With `run_aot_tests`, every PROG-based test is additionally
/// re-tagged `aot`/`<suite>.<name>` into a synthetic trailing suite.
pub fn read_all(
    root: &Path,
    run_aot_tests: bool,
) -> Result<Vec<(String, Vec<TestCase>)>, ParseError> {
    let mut suites = Vec::new();
    let mut aot_tests = Vec::new();

    for file in find_test_files(root)? {
        let (suite, tests) = parse_file(&file)?;
        if tests.is_empty() {
            continue;
        }
        if run_aot_tests {
            for test in &tests {
                // Only PROG-based tests can be recompiled ahead of time.
                if test.prog.is_none() {
                    continue;
                }
                let mut aot = test.clone();
                aot.name = aot.full_name();
                aot.suite = AOT_SUITE.to_string();
                aot_tests.push(aot);
            }
        }
        suites.push((suite, tests));
    }

    if run_aot_tests && !aot_tests.is_empty() {
        suites.push((AOT_SUITE.to_string(), aot_tests));
    }

    suites.sort_by(|a, b| a.0.cmp(&b.0));
    for (_, tests) in &mut suites {
        tests.sort_by(|a, b| a.name.cmp(&b.name));
    }
    Ok(suites)
}

/// All candidate test files under `root`, skipping dotfiles and the fixed
/// non-test subdirectories.
pub fn find_test_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    collect_files_recursive(root, &mut files)?;
    files.sort();
    Ok(files)
}

fn collect_files_recursive(dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        if path.is_dir() {
            if IGNORED_DIRS.contains(&name.as_str()) {
                continue;
            }
            collect_files_recursive(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}

/// Parse one test file. The suite name is the file's base name.
pub fn parse_file(path: &Path) -> Result<(String, Vec<TestCase>), ParseError> {
    let suite = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let contents = std::fs::read_to_string(path)?;
    let tests = parse_str(&contents, &suite)?;
    Ok((suite, tests))
}

/// Parse raw directive text into test cases for the named suite.
///
/// Blocks whose ARCH allowlist excludes the host architecture are
/// silently dropped.
pub fn parse_str(input: &str, suite: &str) -> Result<Vec<TestCase>, ParseError> {
    let mut tests = Vec::new();
    let mut block: Vec<&str> = Vec::new();

    for line in input.lines().chain(std::iter::once("")) {
        if line.starts_with('#') {
            continue;
        }
        if line.trim().is_empty() {
            if !block.is_empty() {
                if let Some(test) = parse_block(&block, suite)? {
                    tests.push(test);
                }
                block.clear();
            }
        } else {
            block.push(line);
        }
    }
    Ok(tests)
}

/// Directives whose free-text payload accepts continuation lines.
#[derive(Clone, Copy)]
enum Continuable {
    Prog,
    Expect,
}

fn parse_block(lines: &[&str], suite: &str) -> Result<Option<TestCase>, ParseError> {
    let mut name = String::new();
    let mut run: Option<String> = None;
    let mut prog: Option<String> = None;
    let mut expects: Vec<ExpectClause> = Vec::new();
    let mut timeout: Option<u64> = None;
    let mut befores: Vec<String> = Vec::new();
    let mut after: Option<String> = None;
    let mut cleanup: Option<String> = None;
    let mut kernel_min: Option<String> = None;
    let mut kernel_max: Option<String> = None;
    let mut requirements: Vec<String> = Vec::new();
    let mut env: HashMap<String, String> = HashMap::new();
    let mut arch: Vec<String> = Vec::new();
    let mut feature_requirements: BTreeSet<String> = BTreeSet::new();
    let mut neg_feature_requirements: BTreeSet<String> = BTreeSet::new();
    let mut will_fail = false;
    let mut new_pidns = false;
    let mut skip_if_env_has: Option<(String, String)> = None;

    let invalid = |message: String| ParseError::InvalidField {
        message,
        suite: suite.to_string(),
    };

    // Column at which the previous free-text directive's argument began;
    // lines indented at least that far continue its payload.
    let mut last: Option<(Continuable, usize)> = None;

    for line in lines {
        let indent = line.len() - line.trim_start().len();
        if let Some((kind, col)) = last {
            if col > 0 && indent >= col {
                // The indent may be multibyte whitespace; land the cut
                // on a character boundary.
                let mut cut = col;
                while !line.is_char_boundary(cut) {
                    cut += 1;
                }
                let tail = line[cut..].trim_end();
                match kind {
                    Continuable::Prog => {
                        if let Some(p) = prog.as_mut() {
                            p.push('\n');
                            p.push_str(tail);
                        }
                    }
                    Continuable::Expect => {
                        if let Some(clause) = expects.last_mut() {
                            clause.value.push('\n');
                            clause.value.push_str(tail);
                        }
                    }
                }
                continue;
            }
        }
        last = None;

        let trimmed = line.trim_end();
        let (directive, rest, arg_col) = split_directive(trimmed);

        let mut push_expect = |mode: ExpectMode| {
            expects.push(ExpectClause {
                mode,
                value: rest.to_string(),
            });
        };

        match directive {
            "NAME" => name = rest.to_string(),
            "RUN" => run = Some(rest.to_string()),
            "PROG" => {
                prog = Some(rest.to_string());
                last = Some((Continuable::Prog, arg_col));
            }
            "EXPECT" => {
                push_expect(ExpectMode::Text);
                last = Some((Continuable::Expect, arg_col));
            }
            "EXPECT_NONE" => {
                push_expect(ExpectMode::TextNone);
                last = Some((Continuable::Expect, arg_col));
            }
            "EXPECT_REGEX" => {
                push_expect(ExpectMode::Regex);
                last = Some((Continuable::Expect, arg_col));
            }
            "EXPECT_REGEX_NONE" => {
                push_expect(ExpectMode::RegexNone);
                last = Some((Continuable::Expect, arg_col));
            }
            "EXPECT_FILE" => push_expect(ExpectMode::File),
            "EXPECT_JSON" => push_expect(ExpectMode::Json),
            "TIMEOUT" => {
                let secs: u64 = rest
                    .trim()
                    .parse()
                    .map_err(|_| invalid(format!("TIMEOUT '{rest}' is not a number")))?;
                if secs == 0 {
                    return Err(invalid("TIMEOUT must be positive".to_string()));
                }
                timeout = Some(secs);
            }
            "BEFORE" => befores.push(rest.to_string()),
            "AFTER" => after = Some(rest.to_string()),
            "CLEANUP" => cleanup = Some(rest.to_string()),
            "MIN_KERNEL" => kernel_min = Some(rest.trim().to_string()),
            "MAX_KERNEL" => kernel_max = Some(rest.trim().to_string()),
            "REQUIRES" => requirements.push(rest.to_string()),
            "ENV" => {
                for entry in rest.split_whitespace() {
                    let (key, value) = entry.split_once('=').ok_or_else(|| {
                        invalid(format!("ENV entry '{entry}' is not KEY=VALUE"))
                    })?;
                    env.insert(key.to_string(), value.to_string());
                }
            }
            "ARCH" => {
                arch = rest
                    .split('|')
                    .map(|a| a.trim().to_lowercase())
                    .filter(|a| !a.is_empty())
                    .collect();
            }
            "REQUIRES_FEATURE" => {
                for token in rest.split_whitespace() {
                    match token.strip_prefix('!') {
                        Some(feature) => neg_feature_requirements.insert(feature.to_string()),
                        None => feature_requirements.insert(token.to_string()),
                    };
                }
                let unknown: Vec<&str> = feature_requirements
                    .iter()
                    .chain(neg_feature_requirements.iter())
                    .filter(|f| !features::is_known(f))
                    .map(String::as_str)
                    .collect();
                if !unknown.is_empty() {
                    return Err(invalid(format!(
                        "{} is invalid for REQUIRES_FEATURE",
                        unknown.join(",")
                    )));
                }
            }
            "WILL_FAIL" => will_fail = true,
            "NEW_PIDNS" => new_pidns = true,
            "SKIP_IF_ENV_HAS" => {
                let (key, value) = rest.trim().split_once('=').ok_or_else(|| {
                    invalid(format!("SKIP_IF_ENV_HAS '{rest}' is not KEY=VALUE"))
                })?;
                skip_if_env_has = Some((key.to_string(), value.to_string()));
            }
            other => {
                return Err(ParseError::UnknownField {
                    field: other.to_string(),
                    suite: suite.to_string(),
                });
            }
        }
    }

    let required = |field: &'static str| ParseError::RequiredField {
        field,
        suite: suite.to_string(),
    };

    if name.is_empty() {
        return Err(required("NAME"));
    }
    match (&run, &prog) {
        (Some(_), Some(_)) => {
            return Err(invalid("RUN and PROG both specified".to_string()));
        }
        (None, None) => return Err(required("RUN or PROG")),
        _ => {}
    }
    if expects.is_empty() {
        return Err(required("EXPECT"));
    }
    let Some(timeout) = timeout else {
        return Err(required("TIMEOUT"));
    };
    if expects.iter().any(ExpectClause::is_exact) && expects.len() > 1 {
        return Err(invalid(
            "EXPECT_FILE/EXPECT_JSON cannot be combined with other EXPECT clauses".to_string(),
        ));
    }

    if !arch.is_empty() && !arch.iter().any(|a| a == host_arch()) {
        return Ok(None);
    }

    Ok(Some(TestCase {
        name,
        suite: suite.to_string(),
        run,
        prog,
        expects,
        timeout,
        befores,
        after,
        cleanup,
        kernel_min,
        kernel_max,
        requirements,
        env,
        arch,
        feature_requirements,
        neg_feature_requirements,
        will_fail,
        new_pidns,
        skip_if_env_has,
    }))
}

/// Split `DIRECTIVE rest-of-line`, returning the byte column where the
/// argument begins (used for continuation detection).
fn split_directive(line: &str) -> (&str, &str, usize) {
    match line.find(char::is_whitespace) {
        Some(end) => {
            let rest = &line[end..];
            let arg_offset = rest.len() - rest.trim_start().len();
            let col = end + arg_offset;
            (&line[..end], &line[col..], col)
        }
        None => (line, "", line.len()),
    }
}

fn host_arch() -> &'static str {
    std::env::consts::ARCH
}
