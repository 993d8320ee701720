//! Single-test execution: helper processes, subject lifecycle, timeouts
//! and teardown.
//!
//! Every spawned process gets its own process group so that shell
//! wrappers and their descendants can be terminated together. Teardown
//! runs on every exit path; `Drop` impls back up the explicit paths.

use crate::features::{self, KernelVersion};
use crate::matcher;
use crate::report;
use crate::schema::{
    ExpectMode, RunStatus, SkipReason, TestCase, AOT_DISABLED_MARKER, AOT_SUITE, ATTACH_SENTINEL,
};
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_ATTACH_TIMEOUT_SECS: u64 = 10;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long helpers and a terminated subject get to flush output.
const OUTPUT_GRACE: Duration = Duration::from_secs(1);

const SUBJECT_PLACEHOLDER: &str = "{{BPFTRACE}}";
const BEFORE_PID_PLACEHOLDER: &str = "{{BEFORE_PID}}";

const AOT_ARTIFACT: &str = "/tmp/tmpprog.btaot";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid test configuration: {0}")]
    InvalidTest(String),
    #[error("failed to probe subject capabilities: {0}")]
    CapabilityProbe(#[source] std::io::Error),
    #[error("failed to spawn {what}: {source}")]
    Spawn {
        what: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct Config {
    /// Path to the subject binary under test.
    pub subject: String,
    /// Deadline for the attach sentinel to appear.
    pub attach_timeout: Duration,
}

fn new_group(cmd: &mut Command) {
    // Safety: setpgid is async-signal-safe and touches no state shared
    // with the parent.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

fn kill_group(pid: u32, signal: i32) {
    unsafe {
        libc::killpg(pid as i32, signal);
    }
}

/// A BEFORE or AFTER process with its combined output accumulated in the
/// background.
struct Helper {
    child: Child,
    output: Arc<Mutex<String>>,
    readers: Vec<JoinHandle<()>>,
}

impl Helper {
    fn spawn(mut cmd: Command, what: &str) -> Result<Self, EngineError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        new_group(&mut cmd);
        let mut child = cmd.spawn().map_err(|source| EngineError::Spawn {
            what: what.to_string(),
            source,
        })?;

        let output = Arc::new(Mutex::new(String::new()));
        let mut readers = Vec::new();
        let streams: Vec<Box<dyn Read + Send>> = vec![
            Box::new(child.stdout.take().ok_or_else(|| {
                EngineError::InvalidTest(format!("no stdout pipe for '{what}'"))
            })?),
            Box::new(child.stderr.take().ok_or_else(|| {
                EngineError::InvalidTest(format!("no stderr pipe for '{what}'"))
            })?),
        ];
        for stream in streams {
            let sink = Arc::clone(&output);
            readers.push(std::thread::spawn(move || {
                for line in BufReader::new(stream).lines().map_while(Result::ok) {
                    if let Ok(mut buf) = sink.lock() {
                        buf.push_str(&line);
                        buf.push('\n');
                    }
                }
            }));
        }
        Ok(Helper {
            child,
            output,
            readers,
        })
    }

    fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Let the helper flush briefly, then tear its group down and return
    /// everything it printed.
    fn finish(mut self) -> String {
        let deadline = Instant::now() + OUTPUT_GRACE;
        while Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(_) => break,
            }
        }
        // Even an exited helper may have forked children that inherited
        // the output pipes; the reader joins below would block until
        // they exit. Kill the whole group first.
        kill_group(self.pid(), libc::SIGKILL);
        let _ = self.child.wait();
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
        match self.output.lock() {
            Ok(buf) => buf.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Drop for Helper {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            kill_group(self.pid(), libc::SIGKILL);
            let _ = self.child.wait();
        }
    }
}

/// The subject process. Output lines from both streams arrive on one
/// channel so the control loop can wait with a deadline.
struct Subject {
    child: Child,
    lines: Receiver<String>,
    _readers: Vec<JoinHandle<()>>,
}

impl Subject {
    fn spawn(cmdline: &str, test: &TestCase) -> Result<Self, EngineError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(cmdline)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .env("test", &test.name)
            .env(ATTACH_SENTINEL, "1")
            .env(AOT_DISABLED_MARKER, "1")
            .env("BPFTRACE_VERIFY_LLVM_IR", "1")
            .env("PATH", std::env::var("PATH").unwrap_or_default());
        for (key, value) in &test.env {
            cmd.env(key, value);
        }
        new_group(&mut cmd);
        let mut child = cmd.spawn().map_err(|source| EngineError::Spawn {
            what: cmdline.to_string(),
            source,
        })?;

        let (sender, lines) = mpsc::channel();
        let mut readers = Vec::new();
        let streams: Vec<Box<dyn Read + Send>> = vec![
            Box::new(child.stdout.take().ok_or_else(|| {
                EngineError::InvalidTest("no stdout pipe for subject".to_string())
            })?),
            Box::new(child.stderr.take().ok_or_else(|| {
                EngineError::InvalidTest("no stderr pipe for subject".to_string())
            })?),
        ];
        for stream in streams {
            let tx = sender.clone();
            readers.push(std::thread::spawn(move || {
                for line in BufReader::new(stream).lines().map_while(Result::ok) {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            }));
        }
        Ok(Subject {
            child,
            lines,
            _readers: readers,
        })
    }

    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn stop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            kill_group(self.pid(), libc::SIGKILL);
            let _ = self.child.wait();
        }
    }
}

impl Drop for Subject {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Direct children of `parent` from the process table, as (pid, comm).
fn children_of(parent: u32) -> std::io::Result<Vec<(u32, String)>> {
    let mut children = Vec::new();
    for entry in std::fs::read_dir("/proc")? {
        let entry = entry?;
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        // pid (comm) state ppid ...; comm may itself contain parens.
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        let (Some(open), Some(close)) = (stat.find('('), stat.rfind(')')) else {
            continue;
        };
        let comm = stat[open + 1..close].to_string();
        let fields: Vec<&str> = stat[close + 1..].split_whitespace().collect();
        let Some(ppid) = fields.get(1).and_then(|f| f.parse::<u32>().ok()) else {
            continue;
        };
        if ppid == parent {
            children.push((pid, comm));
        }
    }
    Ok(children)
}

/// Poll `parent`'s children until `ready` accepts the snapshot or the
/// timeout passes.
fn wait_for_children<F>(parent: u32, timeout: Duration, mut ready: F) -> std::io::Result<bool>
where
    F: FnMut(&[(u32, String)]) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let children = children_of(parent)?;
        if ready(&children) {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// The kernel truncates comm to 15 bytes.
fn comm_from_path(path: &str) -> String {
    let base = path.rsplit('/').next().unwrap_or(path);
    base.chars().take(15).collect()
}

/// Helpers are launched by path, so the visible name is the basename of
/// the command's last token.
fn comm_name(command: &str) -> String {
    comm_from_path(command.split_whitespace().last().unwrap_or(command))
}

/// Namespace-scoped argv for a helper command. Relative paths would be
/// resolved against the namespace's mount root, so the executable token
/// is absolutized first; arguments pass through untouched.
fn ns_command(prefix: &[String], command: &str) -> Vec<String> {
    let mut argv = prefix.to_vec();
    let mut tokens = command.split_whitespace();
    if let Some(exe) = tokens.next() {
        let abs = std::fs::canonicalize(exe)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| exe.to_string());
        argv.push(abs);
    }
    argv.extend(tokens.map(str::to_string));
    argv
}

fn argv_command(argv: &[String]) -> Command {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd
}

/// Final shell command line for the subject, before `{{BEFORE_PID}}`
/// substitution.
fn prepare_subject_call(test: &TestCase, nsenter: &[String], subject: &str) -> String {
    let prefix = if nsenter.is_empty() {
        String::new()
    } else {
        format!("{} ", nsenter.join(" "))
    };
    if let Some(run) = &test.run {
        return format!("{prefix}{}", run.replace(SUBJECT_PLACEHOLDER, subject));
    }
    let Some(prog) = &test.prog else {
        return String::new();
    };
    let json_flags = match test.expects.first().map(|c| c.mode) {
        Some(ExpectMode::Json) => " -q -f json",
        _ => "",
    };
    let escaped = prog.replace('\'', r"'\''");
    let mut call = format!("{prefix}{subject}{json_flags} -e '{escaped}'");
    if test.suite == AOT_SUITE {
        call.push_str(&format!(" --aot {AOT_ARTIFACT} && {AOT_ARTIFACT}"));
    }
    call
}

/// Pre-run gates evaluated before the RUN line. `Ok(Some(..))` is a
/// skip; `Ok(None)` means proceed.
fn precheck(test: &TestCase) -> Result<Option<SkipReason>, EngineError> {
    if let Some(min) = &test.kernel_min {
        if KernelVersion::current()? < KernelVersion::parse(min) {
            return Ok(Some(SkipReason::KernelVersionMin));
        }
    }
    if let Some(max) = &test.kernel_max {
        if KernelVersion::current()? > KernelVersion::parse(max) {
            return Ok(Some(SkipReason::KernelVersionMax));
        }
    }
    if let Some((key, value)) = &test.skip_if_env_has {
        if std::env::var(key).as_deref() == Ok(value) {
            return Ok(Some(SkipReason::EnvironmentDisabled));
        }
    }
    Ok(None)
}

fn feature_gate(test: &TestCase, config: &Config) -> Result<Option<SkipReason>, EngineError> {
    if test.feature_requirements.is_empty() && test.neg_feature_requirements.is_empty() {
        return Ok(None);
    }
    let caps = features::capabilities(&config.subject).map_err(EngineError::CapabilityProbe)?;
    let lookup = |feature: &str| {
        caps.get(feature)
            .copied()
            .ok_or_else(|| EngineError::InvalidTest(format!("unknown feature '{feature}'")))
    };
    for feature in &test.feature_requirements {
        if !lookup(feature)? {
            return Ok(Some(SkipReason::FeatureRequirementUnsatisfied));
        }
    }
    for feature in &test.neg_feature_requirements {
        if lookup(feature)? {
            return Ok(Some(SkipReason::FeatureRequirementUnsatisfied));
        }
    }
    Ok(None)
}

fn requirements_met(test: &TestCase) -> Result<bool, EngineError> {
    for requirement in &test.requirements {
        let status = Command::new("sh")
            .arg("-c")
            .arg(requirement)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|source| EngineError::Spawn {
                what: requirement.clone(),
                source,
            })?;
        if !status.success() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Execute one test to a final status. Prints the per-test report lines
/// as it goes; the caller only aggregates.
pub fn run_test(test: &TestCase, config: &Config) -> Result<RunStatus, EngineError> {
    if let Some(reason) = precheck(test)? {
        report::skip_line(test, reason);
        return Ok(RunStatus::Skip(reason));
    }

    report::run_line(test);

    if !requirements_met(test)? {
        report::skip_line(test, SkipReason::RequirementUnsatisfied);
        return Ok(RunStatus::Skip(SkipReason::RequirementUnsatisfied));
    }

    if let Some(reason) = feature_gate(test, config)? {
        report::skip_line(test, reason);
        return Ok(RunStatus::Skip(reason));
    }

    let test_timeout = Duration::from_secs(test.timeout);
    let mut befores: Vec<Helper> = Vec::new();
    let mut nsenter: Vec<String> = Vec::new();

    if test.new_pidns {
        let Some((first, rest)) = test.befores.split_first() else {
            return Err(EngineError::InvalidTest(
                "NEW_PIDNS requires at least one BEFORE".to_string(),
            ));
        };
        let mut cmd = Command::new("unshare");
        cmd.args(["--fork", "--pid", "--mount-proc", "-r", "--kill-child"]);
        cmd.args(first.split_whitespace());
        let helper = Helper::spawn(cmd, first)?;

        // unshare forks once more; its child is pid 1 of the new
        // namespace and the target for nsenter.
        let mut ns_pid = 0u32;
        let settled = {
            let observed = &mut ns_pid;
            wait_for_children(helper.pid(), test_timeout, |children| {
                match children.first() {
                    Some((pid, _)) => {
                        *observed = *pid;
                        true
                    }
                    None => false,
                }
            })?
        };
        befores.push(helper);
        if !settled {
            report::timeout_line(test);
            println!("\tBEFORE did not settle: {first}");
            return Ok(RunStatus::Timeout);
        }
        nsenter = vec![
            "nsenter".to_string(),
            "-p".to_string(),
            "-m".to_string(),
            "-t".to_string(),
            ns_pid.to_string(),
        ];
        for before in rest {
            let argv = ns_command(&nsenter, before);
            let helper = Helper::spawn(argv_command(&argv), before)?;
            // nsenter forks to enter the pid namespace; the command is
            // its child and must be visible before the subject starts.
            let expected = comm_from_path(&argv[nsenter.len()]);
            let started = wait_for_children(helper.pid(), test_timeout, |children| {
                children.iter().any(|(_, comm)| *comm == expected)
            })?;
            befores.push(helper);
            if !started {
                report::timeout_line(test);
                println!("\tBEFORE did not settle: {before}");
                return Ok(RunStatus::Timeout);
            }
        }
    } else if !test.befores.is_empty() {
        for before in &test.befores {
            let tokens: Vec<&str> = before.split_whitespace().collect();
            if tokens.is_empty() {
                return Err(EngineError::InvalidTest("empty BEFORE command".to_string()));
            }
            let mut cmd = Command::new(tokens[0]);
            cmd.args(&tokens[1..]);
            befores.push(Helper::spawn(cmd, before)?);
        }
        // Every BEFORE must be visible in the process table before the
        // subject starts, or its probe target would not exist yet.
        let expected: Vec<String> = test.befores.iter().map(|b| comm_name(b)).collect();
        let settled = wait_for_children(std::process::id(), test_timeout, |children| {
            expected
                .iter()
                .all(|name| children.iter().any(|(_, comm)| comm == name))
        })?;
        if !settled {
            report::timeout_line(test);
            println!("\tBEFORE did not settle: {}", test.befores.join(", "));
            return Ok(RunStatus::Timeout);
        }
    }

    let mut cmdline = prepare_subject_call(test, &nsenter, &config.subject);
    if cmdline.contains(BEFORE_PID_PLACEHOLDER) {
        if test.new_pidns {
            return Err(EngineError::InvalidTest(
                "{{BEFORE_PID}} cannot be used with NEW_PIDNS".to_string(),
            ));
        }
        if befores.len() != 1 {
            return Err(EngineError::InvalidTest(format!(
                "{{{{BEFORE_PID}}}} requires exactly one BEFORE, found {}",
                befores.len()
            )));
        }
        cmdline = cmdline.replace(BEFORE_PID_PLACEHOLDER, &befores[0].pid().to_string());
    }

    let mut subject = Subject::spawn(&cmdline, test)?;
    let mut output = String::new();
    let mut attached = false;
    let mut after: Option<Helper> = None;
    let mut deadline = Instant::now() + config.attach_timeout;
    let mut timed_out = false;
    let mut exit_code: Option<i32> = None;

    loop {
        let now = Instant::now();
        if now >= deadline {
            timed_out = true;
            break;
        }
        match subject.lines.recv_timeout(deadline - now) {
            Ok(line) => {
                output.push_str(&line);
                output.push('\n');
                // Only the bare sentinel line counts; traced output may
                // legitimately mention the marker string.
                if !attached && line.trim() == ATTACH_SENTINEL {
                    attached = true;
                    // Exact expectations compare whole output; anything
                    // printed before attach is startup noise.
                    if test.has_exact_expect() {
                        output.clear();
                    }
                    deadline = Instant::now() + test_timeout;
                    if let Some(after_cmd) = &test.after {
                        let helper = if nsenter.is_empty() {
                            let mut cmd = Command::new("sh");
                            cmd.arg("-c").arg(after_cmd);
                            Helper::spawn(cmd, after_cmd)?
                        } else {
                            let argv = ns_command(&nsenter, after_cmd);
                            Helper::spawn(argv_command(&argv), after_cmd)?
                        };
                        after = Some(helper);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                timed_out = true;
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if !timed_out {
        // Output streams closed; wait out the process itself.
        loop {
            if let Some(status) = subject.child.try_wait()? {
                let code = match status.code() {
                    Some(code) => code,
                    None => -status.signal().unwrap_or(0),
                };
                exit_code = Some(code);
                break;
            }
            if Instant::now() >= deadline {
                timed_out = true;
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    if timed_out {
        // SIGTERM first: the subject contract is a clean exit that
        // flushes buffered results, which may still satisfy the test.
        kill_group(subject.pid(), libc::SIGTERM);
        let drain_deadline = Instant::now() + OUTPUT_GRACE;
        loop {
            let now = Instant::now();
            if now >= drain_deadline {
                break;
            }
            match subject.lines.recv_timeout(drain_deadline - now) {
                Ok(line) => {
                    output.push_str(&line);
                    output.push('\n');
                }
                Err(_) => break,
            }
        }
        let (matched, _) = matcher::check_all(&test.expects, &output);
        if !matched {
            report::timeout_line(test);
            println!("\tCommand: {cmdline}");
            println!("\tTimeout: {}s", test.timeout);
            println!("\tCurrent output: {output}");
            return Ok(RunStatus::Timeout);
        }
    }

    // Teardown, oldest first. Outputs are kept for diagnostics.
    let mut before_output = String::new();
    for helper in befores.drain(..) {
        before_output.push_str(&helper.finish());
    }
    subject.stop();
    let after_output = match after.take() {
        Some(helper) => helper.finish(),
        None => String::new(),
    };

    let print_helper_output = |test: &TestCase| {
        if !test.befores.is_empty() {
            println!("\tBEFORE output: {before_output}");
        }
        if test.after.is_some() {
            println!("\tAFTER output: {after_output}");
        }
    };

    if let Some(cleanup) = &test.cleanup {
        let result = Command::new("sh")
            .arg("-c")
            .arg(cleanup)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| EngineError::Spawn {
                what: cleanup.clone(),
                source,
            })?;
        if !result.status.success() {
            report::fail_line(test);
            println!(
                "\tCLEANUP error: {}",
                String::from_utf8_lossy(&result.stderr)
            );
            return Ok(RunStatus::Fail);
        }
    }

    if output.contains(AOT_DISABLED_MARKER) {
        report::skip_line(test, SkipReason::AotNotSupported);
        return Ok(RunStatus::Skip(SkipReason::AotNotSupported));
    }

    if let Some(code) = exit_code {
        if code != 0 && !test.will_fail {
            report::fail_line(test);
            println!("\tCommand: {cmdline}");
            println!("\tUnclean exit code: {code}");
            println!("\tOutput: {output}");
            print_helper_output(test);
            return Ok(RunStatus::Fail);
        }
    }

    let (matched, failed) = matcher::check_all(&test.expects, &output);
    if matched {
        report::ok_line(test);
        Ok(RunStatus::Pass)
    } else {
        report::fail_line(test);
        println!("\tCommand: {cmdline}");
        for clause in failed {
            println!("{}", matcher::failure_detail(clause, &output));
        }
        println!("\tFound: {output}");
        print_helper_output(test);
        Ok(RunStatus::Fail)
    }
}
