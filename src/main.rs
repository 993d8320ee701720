mod features;
mod matcher;
mod parser;
mod report;
mod runner;
mod schema;

use clap::{Parser, Subcommand};
use regex::Regex;
use schema::{RunStatus, SkipReason};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Runtime test runner for bpftrace-style tracing tools.
#[derive(Parser)]
#[command(name = "tracetest", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover and execute runtime tests under a directory
    Run {
        /// Test root directory
        path: PathBuf,
        /// Regex over full test names (suite.name)
        #[arg(short, long, env = "TEST_FILTER")]
        filter: Option<String>,
        /// File with one suite.name per line to skip
        #[arg(long)]
        skiplist_file: Option<PathBuf>,
        /// Also run the synthesized ahead-of-time suite
        #[arg(long)]
        run_aot_tests: bool,
        /// Seconds to wait for the attach sentinel
        #[arg(
            long,
            env = "RUNTIME_TEST_ATTACH_TIMEOUT",
            default_value_t = runner::DEFAULT_ATTACH_TIMEOUT_SECS
        )]
        attach_timeout: u64,
    },
    /// Parse all test files and report errors without running anything
    Validate {
        /// Test root directory
        path: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run {
            path,
            filter,
            skiplist_file,
            run_aot_tests,
            attach_timeout,
        } => run(path, filter, skiplist_file, run_aot_tests, attach_timeout),
        Commands::Validate { path } => validate(path),
    };
    std::process::exit(code);
}

fn run(
    path: PathBuf,
    filter: Option<String>,
    skiplist_file: Option<PathBuf>,
    run_aot_tests: bool,
    attach_timeout: u64,
) -> i32 {
    match report::ColorMode::from_env() {
        Ok(mode) => report::init(mode),
        Err(err) => {
            eprintln!("{err}");
            return 1;
        }
    }

    let Ok(subject) = std::env::var("BPFTRACE_RUNTIME_TEST_EXECUTABLE") else {
        eprintln!("BPFTRACE_RUNTIME_TEST_EXECUTABLE is not set");
        return 1;
    };
    let config = runner::Config {
        subject,
        attach_timeout: Duration::from_secs(attach_timeout),
    };

    let filter = match filter.as_deref().map(Regex::new) {
        Some(Ok(re)) => Some(re),
        Some(Err(err)) => {
            eprintln!("invalid filter: {err}");
            return 1;
        }
        None => None,
    };

    let skiplist: HashSet<String> = match skiplist_file {
        Some(file) => match std::fs::read_to_string(&file) {
            Ok(contents) => contents
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect(),
            Err(err) => {
                eprintln!("failed to read skiplist {}: {err}", file.display());
                return 1;
            }
        },
        None => HashSet::new(),
    };

    let mut suites = match parser::read_all(&path, run_aot_tests) {
        Ok(suites) => suites,
        Err(err) => {
            println!("{}", report::fail(&err.to_string()));
            return 1;
        }
    };

    if let Some(re) = &filter {
        for (_, tests) in &mut suites {
            tests.retain(|t| re.is_match(&t.full_name()));
        }
        suites.retain(|(_, tests)| !tests.is_empty());
    }

    let total: usize = suites.iter().map(|(_, tests)| tests.len()).sum();
    println!(
        "{} Running {} tests from {} test cases.\n",
        report::ok("[==========]"),
        total,
        suites.len()
    );

    let mut summary = report::Summary::default();
    let started = Instant::now();

    for (suite, tests) in &suites {
        println!(
            "{} {} tests from {}",
            report::ok("[----------]"),
            tests.len(),
            suite
        );
        for test in tests {
            if skiplist.contains(&test.full_name()) {
                summary.record(test, RunStatus::Skip(SkipReason::InSkiplist));
                continue;
            }
            match runner::run_test(test, &config) {
                Ok(status) => summary.record(test, status),
                Err(err) => {
                    println!("{}", report::fail(&err.to_string()));
                    return 1;
                }
            }
        }
        println!(
            "{} {} tests from {}",
            report::ok("[----------]"),
            tests.len(),
            suite
        );
    }

    summary.print(suites.len(), started.elapsed());
    if summary.run_failed() {
        1
    } else {
        0
    }
}

fn validate(path: PathBuf) -> i32 {
    match report::ColorMode::from_env() {
        Ok(mode) => report::init(mode),
        Err(err) => {
            eprintln!("{err}");
            return 1;
        }
    }

    let files = match parser::find_test_files(&path) {
        Ok(files) => files,
        Err(err) => {
            eprintln!("failed to scan {}: {err}", path.display());
            return 1;
        }
    };

    let mut errors = 0;
    for file in &files {
        match parser::parse_file(file) {
            Ok((_, tests)) => {
                println!("{} {} ({} tests)", report::ok("✓"), file.display(), tests.len());
            }
            Err(err) => {
                println!("{} {}: {err}", report::fail("✗"), file.display());
                errors += 1;
            }
        }
    }
    println!();
    if errors > 0 {
        println!("{}", report::fail(&format!("{errors} invalid file(s)")));
        1
    } else {
        println!("{}", report::ok(&format!("{} file(s) valid", files.len())));
        0
    }
}
