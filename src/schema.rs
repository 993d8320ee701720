//! Data model for runtime test cases.
//!
//! A [`TestCase`] is one parsed block of a directive file. Instances are
//! built by the parser, validated there, and immutable afterwards.

use std::collections::{BTreeSet, HashMap};

/// Line the subject binary prints once its probes are live.
pub const ATTACH_SENTINEL: &str = "__BPFTRACE_NOTIFY_PROBES_ATTACHED";

/// Marker the subject prints when an ahead-of-time artifact cannot run here.
pub const AOT_DISABLED_MARKER: &str = "__BPFTRACE_NOTIFY_AOT_PORTABILITY_DISABLED";

/// Suite name given to synthesized ahead-of-time test variants.
pub const AOT_SUITE: &str = "aot";

/// How an expectation clause is matched against captured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectMode {
    /// Some output line, trimmed of surrounding whitespace, equals the literal.
    Text,
    /// No such line exists.
    TextNone,
    /// Multiline regex search succeeds.
    Regex,
    /// Multiline regex search fails.
    RegexNone,
    /// Output equals the referenced file, both trimmed of blank edges.
    File,
    /// Output structurally equals the JSON (or NDJSON) in the referenced file.
    Json,
}

/// One assertion against captured subject output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectClause {
    pub mode: ExpectMode,
    /// Literal text, regex pattern, or file path depending on `mode`.
    pub value: String,
}

impl ExpectClause {
    /// Exact-output modes are structurally exclusive with any other clause.
    pub fn is_exact(&self) -> bool {
        matches!(self.mode, ExpectMode::File | ExpectMode::Json)
    }
}

/// A single parsed test case.
#[derive(Debug, Clone, Default)]
pub struct TestCase {
    pub name: String,
    pub suite: String,
    /// Shell command to run; mutually exclusive with `prog`.
    pub run: Option<String>,
    /// Program text passed to the subject via `-e`; mutually exclusive with `run`.
    pub prog: Option<String>,
    pub expects: Vec<ExpectClause>,
    /// Run-phase timeout in seconds. Always > 0 after parsing.
    pub timeout: u64,
    pub befores: Vec<String>,
    pub after: Option<String>,
    pub cleanup: Option<String>,
    pub kernel_min: Option<String>,
    pub kernel_max: Option<String>,
    /// Shell preconditions; any non-zero exit skips the test.
    pub requirements: Vec<String>,
    pub env: HashMap<String, String>,
    /// Lowercased architecture allowlist; empty means all.
    pub arch: Vec<String>,
    pub feature_requirements: BTreeSet<String>,
    pub neg_feature_requirements: BTreeSet<String>,
    pub will_fail: bool,
    pub new_pidns: bool,
    pub skip_if_env_has: Option<(String, String)>,
}

impl TestCase {
    /// `suite.name`, the identifier used by filters, skiplists and reports.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.suite, self.name)
    }

    /// Whether the expectation requires exact output (file or JSON mode),
    /// in which case pre-attach output is discarded.
    pub fn has_exact_expect(&self) -> bool {
        self.expects.iter().any(ExpectClause::is_exact)
    }
}

/// Why a test was skipped rather than executed to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    KernelVersionMin,
    KernelVersionMax,
    RequirementUnsatisfied,
    EnvironmentDisabled,
    FeatureRequirementUnsatisfied,
    AotNotSupported,
    InSkiplist,
}

impl SkipReason {
    /// Human-readable explanation for the summary block.
    pub fn describe(&self, test: &TestCase) -> String {
        match self {
            SkipReason::KernelVersionMin => {
                format!("min Kernel: {}", test.kernel_min.as_deref().unwrap_or(""))
            }
            SkipReason::KernelVersionMax => {
                format!("max Kernel: {}", test.kernel_max.as_deref().unwrap_or(""))
            }
            SkipReason::RequirementUnsatisfied => {
                format!("unmet condition: '{}'", test.requirements.join(" && "))
            }
            SkipReason::FeatureRequirementUnsatisfied => {
                let mut features: Vec<String> = test
                    .feature_requirements
                    .iter()
                    .cloned()
                    .chain(test.neg_feature_requirements.iter().map(|f| format!("!{f}")))
                    .collect();
                features.sort();
                format!("missed feature: '{}'", features.join(","))
            }
            SkipReason::EnvironmentDisabled => "disabled by environment variable".to_string(),
            SkipReason::AotNotSupported => "aot does not yet support this".to_string(),
            SkipReason::InSkiplist => "disabled by entry in skiplist file".to_string(),
        }
    }
}

/// Per-test outcome, produced exactly once per executed test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Pass,
    Fail,
    Timeout,
    Skip(SkipReason),
}
