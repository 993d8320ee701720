//! gtest-style console reporting.

use crate::schema::{RunStatus, SkipReason, TestCase};
use once_cell::sync::OnceCell;
use std::time::Duration;

const OK_COLOR: &str = "\x1b[92m";
const WARN_COLOR: &str = "\x1b[94m";
const ERROR_COLOR: &str = "\x1b[91m";
const NO_COLOR: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Yes,
    No,
    Auto,
}

impl ColorMode {
    /// Read `RUNTIME_TEST_COLOR`. Absence means auto; anything but
    /// yes/no/auto is a configuration error.
    pub fn from_env() -> Result<Self, String> {
        match std::env::var("RUNTIME_TEST_COLOR") {
            Ok(value) => match value.as_str() {
                "yes" => Ok(ColorMode::Yes),
                "no" => Ok(ColorMode::No),
                "auto" => Ok(ColorMode::Auto),
                other => Err(format!(
                    "RUNTIME_TEST_COLOR must be yes, no or auto, got '{other}'"
                )),
            },
            Err(_) => Ok(ColorMode::Auto),
        }
    }

    fn enabled(self) -> bool {
        match self {
            ColorMode::Yes => true,
            ColorMode::No => false,
            ColorMode::Auto => atty::is(atty::Stream::Stdout),
        }
    }
}

static COLOR_ENABLED: OnceCell<bool> = OnceCell::new();

/// Fix the color decision for the rest of the process. Later calls keep
/// the first decision.
pub fn init(mode: ColorMode) {
    let _ = COLOR_ENABLED.set(mode.enabled());
}

fn paint(code: &str, s: &str) -> String {
    if *COLOR_ENABLED.get_or_init(|| ColorMode::Auto.enabled()) {
        format!("{code}{s}{NO_COLOR}")
    } else {
        s.to_string()
    }
}

pub fn ok(s: &str) -> String {
    paint(OK_COLOR, s)
}

pub fn warn(s: &str) -> String {
    paint(WARN_COLOR, s)
}

pub fn fail(s: &str) -> String {
    paint(ERROR_COLOR, s)
}

pub fn run_line(test: &TestCase) {
    println!("{} {}", ok("[ RUN      ]"), test.full_name());
}

pub fn ok_line(test: &TestCase) {
    println!("{} {}", ok("[       OK ]"), test.full_name());
}

pub fn fail_line(test: &TestCase) {
    println!("{} {}", fail("[  FAILED  ]"), test.full_name());
}

pub fn timeout_line(test: &TestCase) {
    println!("{} {}", fail("[  TIMEOUT ]"), test.full_name());
}

pub fn skip_line(test: &TestCase, reason: SkipReason) {
    println!(
        "{} {} ({})",
        warn("[   SKIP   ]"),
        test.full_name(),
        reason.describe(test)
    );
}

/// Aggregated outcomes across the whole run, printed as the trailing
/// summary block.
#[derive(Debug, Default)]
pub struct Summary {
    executed: usize,
    failed: Vec<String>,
    timeouted: Vec<String>,
    skipped: Vec<(String, String)>,
}

impl Summary {
    pub fn record(&mut self, test: &TestCase, status: RunStatus) {
        match status {
            RunStatus::Pass => self.executed += 1,
            RunStatus::Fail => {
                self.executed += 1;
                self.failed.push(test.full_name());
            }
            RunStatus::Timeout => {
                self.executed += 1;
                self.timeouted.push(test.full_name());
            }
            RunStatus::Skip(reason) => {
                self.skipped.push((test.full_name(), reason.describe(test)));
            }
        }
    }

    /// Whether the process should exit non-zero.
    pub fn run_failed(&self) -> bool {
        !self.failed.is_empty() || !self.timeouted.is_empty()
    }

    pub fn print(&self, suites: usize, elapsed: Duration) {
        let millis = elapsed.as_millis();
        println!();
        // Skipped tests never ran; they are excluded from this count.
        println!(
            "{} {} tests from {} test cases ran. ({} ms total)",
            ok("[==========]"),
            self.executed,
            suites,
            millis
        );
        let passed = self.executed - self.failed.len() - self.timeouted.len();
        println!("{} {} tests.", ok("[  PASSED  ]"), passed);

        if !self.skipped.is_empty() {
            println!("{} {} tests, listed below:", warn("[   SKIP   ]"), self.skipped.len());
            for (name, reason) in &self.skipped {
                println!("{} {} ({})", warn("[   SKIP   ]"), name, reason);
            }
        }
        if !self.timeouted.is_empty() {
            println!(
                "{} {} tests, listed below:",
                fail("[  TIMEOUT ]"),
                self.timeouted.len()
            );
            for name in &self.timeouted {
                println!("{} {}", fail("[  TIMEOUT ]"), name);
            }
        }
        if !self.failed.is_empty() {
            println!(
                "{} {} tests, listed below:",
                fail("[  FAILED  ]"),
                self.failed.len()
            );
            for name in &self.failed {
                println!("{} {}", fail("[  FAILED  ]"), name);
            }
        }
    }
}
