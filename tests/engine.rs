//! End-to-end tests driving the built binary against throwaway test
//! trees and stub subject scripts.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn write_file(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

fn write_script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = write_file(dir, name, &format!("#!/bin/sh\n{body}\n"));
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn run_engine(tests_dir: &TempDir, args: &[&str], envs: &[(&str, &str)]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_tracetest"));
    cmd.arg("run")
        .arg(tests_dir.path())
        .args(args)
        .env("BPFTRACE_RUNTIME_TEST_EXECUTABLE", "/bin/true")
        .env("RUNTIME_TEST_COLOR", "no")
        .env_remove("TEST_FILTER");
    for (key, value) in envs {
        cmd.env(key, value);
    }
    cmd.output().unwrap()
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn passing_test_reports_ok() {
    let dir = TempDir::new().unwrap();
    write_file(
        &dir,
        "basics",
        "NAME echoes\nRUN echo hello\nEXPECT hello\nTIMEOUT 5\n",
    );
    let output = run_engine(&dir, &[], &[]);
    let stdout = stdout_of(&output);
    assert!(output.status.success(), "stdout: {stdout}");
    assert!(stdout.contains("[ RUN      ] basics.echoes"));
    assert!(stdout.contains("[       OK ] basics.echoes"));
    assert!(stdout.contains("[  PASSED  ] 1 tests."));
}

#[test]
fn unmatched_expectation_fails() {
    let dir = TempDir::new().unwrap();
    write_file(
        &dir,
        "basics",
        "NAME mismatch\nRUN echo hello\nEXPECT goodbye\nTIMEOUT 5\n",
    );
    let output = run_engine(&dir, &[], &[]);
    let stdout = stdout_of(&output);
    assert_eq!(output.status.code(), Some(1));
    assert!(stdout.contains("[  FAILED  ] basics.mismatch"));
    assert!(stdout.contains("Expected: goodbye"));
    assert!(stdout.contains("Found: hello"));
}

#[test]
fn unclean_exit_fails_despite_matching_output() {
    let dir = TempDir::new().unwrap();
    write_file(
        &dir,
        "basics",
        "NAME dies\nRUN echo out && exit 3\nEXPECT out\nTIMEOUT 5\n",
    );
    let output = run_engine(&dir, &[], &[]);
    let stdout = stdout_of(&output);
    assert_eq!(output.status.code(), Some(1));
    assert!(stdout.contains("[  FAILED  ] basics.dies"));
    assert!(stdout.contains("Unclean exit code: 3"));
}

#[test]
fn will_fail_accepts_nonzero_exit() {
    let dir = TempDir::new().unwrap();
    write_file(
        &dir,
        "basics",
        "NAME dies_ok\nRUN echo out && exit 3\nEXPECT out\nTIMEOUT 5\nWILL_FAIL\n",
    );
    let output = run_engine(&dir, &[], &[]);
    assert!(output.status.success(), "stdout: {}", stdout_of(&output));
    assert!(stdout_of(&output).contains("[       OK ] basics.dies_ok"));
}

#[test]
fn hung_subject_times_out() {
    let dir = TempDir::new().unwrap();
    write_file(
        &dir,
        "basics",
        "NAME hangs\nRUN sleep 30\nEXPECT never\nTIMEOUT 1\n",
    );
    let output = run_engine(&dir, &["--attach-timeout", "1"], &[]);
    let stdout = stdout_of(&output);
    assert_eq!(output.status.code(), Some(1));
    assert!(stdout.contains("[  TIMEOUT ] basics.hangs"));
    assert!(stdout.contains("Timeout: 1s"));
}

#[test]
fn timed_out_subject_with_matching_output_passes() {
    let dir = TempDir::new().unwrap();
    write_file(
        &dir,
        "basics",
        "NAME slow_flush\n\
         RUN echo __BPFTRACE_NOTIFY_PROBES_ATTACHED; echo result; sleep 30\n\
         EXPECT result\nTIMEOUT 1\n",
    );
    let output = run_engine(&dir, &[], &[]);
    let stdout = stdout_of(&output);
    assert!(output.status.success(), "stdout: {stdout}");
    assert!(stdout.contains("[       OK ] basics.slow_flush"));
}

#[test]
fn attach_sentinel_rearms_deadline() {
    // Attach takes longer than the run timeout; the sentinel must reset
    // the clock or this would be reported as a timeout.
    let dir = TempDir::new().unwrap();
    write_file(
        &dir,
        "basics",
        "NAME late_attach\n\
         RUN sleep 2; echo __BPFTRACE_NOTIFY_PROBES_ATTACHED; echo done\n\
         EXPECT done\nTIMEOUT 1\n",
    );
    let output = run_engine(&dir, &["--attach-timeout", "10"], &[]);
    assert!(output.status.success(), "stdout: {}", stdout_of(&output));
}

#[test]
fn exact_expectation_discards_preattach_output() {
    let dir = TempDir::new().unwrap();
    // Expectation files live outside the discovery tree.
    let outside = TempDir::new().unwrap();
    let expected = outside.path().join("expected.txt");
    std::fs::write(&expected, "body\n").unwrap();

    write_file(
        &dir,
        "basics",
        &format!(
            "NAME exact\n\
             RUN echo startup noise; echo __BPFTRACE_NOTIFY_PROBES_ATTACHED; echo body\n\
             EXPECT_FILE {}\nTIMEOUT 5\n",
            expected.display()
        ),
    );
    let output = run_engine(&dir, &[], &[]);
    assert!(output.status.success(), "stdout: {}", stdout_of(&output));
}

#[test]
fn json_expectation_matches_structurally() {
    let dir = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    let expected = outside.path().join("expected.json");
    std::fs::write(&expected, "{\"a\": 1, \"b\": [2, 3]}\n").unwrap();

    write_file(
        &dir,
        "json_suite",
        &format!(
            "NAME structural\n\
             RUN echo '{{\"b\": [2, 3], \"a\": 1}}'\n\
             EXPECT_JSON {}\nTIMEOUT 5\n",
            expected.display()
        ),
    );
    let output = run_engine(&dir, &[], &[]);
    assert!(output.status.success(), "stdout: {}", stdout_of(&output));
}

#[test]
fn ndjson_expectation_matches_line_by_line() {
    let dir = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    let expected = outside.path().join("expected.ndjson");
    std::fs::write(&expected, "{\"n\": 1}\n{\"n\": 2}\n").unwrap();

    write_file(
        &dir,
        "json_suite",
        &format!(
            "NAME stream\n\
             RUN echo '{{\"n\":1}}'; echo '{{\"n\":2}}'\n\
             EXPECT_JSON {}\nTIMEOUT 5\n",
            expected.display()
        ),
    );
    let output = run_engine(&dir, &[], &[]);
    assert!(output.status.success(), "stdout: {}", stdout_of(&output));
}

#[test]
fn failing_cleanup_overrides_pass() {
    let dir = TempDir::new().unwrap();
    write_file(
        &dir,
        "basics",
        "NAME dirty\nRUN echo hello\nEXPECT hello\nTIMEOUT 5\n\
         CLEANUP echo broken >&2; false\n",
    );
    let output = run_engine(&dir, &[], &[]);
    let stdout = stdout_of(&output);
    assert_eq!(output.status.code(), Some(1));
    assert!(stdout.contains("[  FAILED  ] basics.dirty"));
    assert!(stdout.contains("CLEANUP error: broken"));
}

#[test]
fn skiplist_preempts_execution() {
    let dir = TempDir::new().unwrap();
    write_file(
        &dir,
        "basics",
        "NAME skipped\nRUN exit 99\nEXPECT x\nTIMEOUT 5\n",
    );
    let outside = TempDir::new().unwrap();
    let skiplist = outside.path().join("skiplist");
    std::fs::write(&skiplist, "basics.skipped\n").unwrap();

    let output = run_engine(
        &dir,
        &["--skiplist-file", skiplist.to_str().unwrap()],
        &[],
    );
    let stdout = stdout_of(&output);
    assert!(output.status.success(), "stdout: {stdout}");
    assert!(!stdout.contains("[ RUN      ]"));
    assert!(stdout.contains("disabled by entry in skiplist file"));
    assert!(stdout.contains("0 tests from 1 test cases ran."));
}

#[test]
fn filter_selects_by_full_name() {
    let dir = TempDir::new().unwrap();
    write_file(
        &dir,
        "basics",
        "NAME wanted\nRUN echo a\nEXPECT a\nTIMEOUT 5\n\n\
         NAME unwanted\nRUN exit 99\nEXPECT x\nTIMEOUT 5\n",
    );
    let output = run_engine(&dir, &["--filter", "basics\\.wanted"], &[]);
    let stdout = stdout_of(&output);
    assert!(output.status.success(), "stdout: {stdout}");
    assert!(stdout.contains("Running 1 tests from 1 test cases."));
    assert!(!stdout.contains("unwanted"));
}

#[test]
fn env_overrides_reach_subject() {
    let dir = TempDir::new().unwrap();
    write_file(
        &dir,
        "basics",
        "NAME env_passthrough\nRUN echo $GREETING\nEXPECT bonjour\nTIMEOUT 5\n\
         ENV GREETING=bonjour\n",
    );
    let output = run_engine(&dir, &[], &[]);
    assert!(output.status.success(), "stdout: {}", stdout_of(&output));
}

#[test]
fn skip_if_env_has_matches_environment() {
    let dir = TempDir::new().unwrap();
    write_file(
        &dir,
        "basics",
        "NAME env_disabled\nRUN exit 99\nEXPECT x\nTIMEOUT 5\n\
         SKIP_IF_ENV_HAS CI_SANDBOX=1\n",
    );
    let output = run_engine(&dir, &[], &[("CI_SANDBOX", "1")]);
    let stdout = stdout_of(&output);
    assert!(output.status.success(), "stdout: {stdout}");
    assert!(stdout.contains("disabled by environment variable"));
}

#[test]
fn unmet_requires_skips() {
    let dir = TempDir::new().unwrap();
    write_file(
        &dir,
        "basics",
        "NAME gated\nRUN exit 99\nEXPECT x\nTIMEOUT 5\nREQUIRES false\n",
    );
    let output = run_engine(&dir, &[], &[]);
    let stdout = stdout_of(&output);
    assert!(output.status.success(), "stdout: {stdout}");
    assert!(stdout.contains("unmet condition: 'false'"));
}

#[test]
fn future_min_kernel_skips() {
    let dir = TempDir::new().unwrap();
    write_file(
        &dir,
        "basics",
        "NAME futuristic\nRUN exit 99\nEXPECT x\nTIMEOUT 5\nMIN_KERNEL 99.0\n",
    );
    let output = run_engine(&dir, &[], &[]);
    let stdout = stdout_of(&output);
    assert!(output.status.success(), "stdout: {stdout}");
    assert!(stdout.contains("min Kernel: 99.0"));
}

#[test]
fn missing_feature_skips_and_present_feature_runs() {
    let scripts = TempDir::new().unwrap();
    let subject = write_script(&scripts, "stub_subject", "if [ \"$1\" = --info ]; then echo 'btf: yes'; fi");

    let dir = TempDir::new().unwrap();
    write_file(
        &dir,
        "basics",
        "NAME needs_btf\nRUN echo ok\nEXPECT ok\nTIMEOUT 5\nREQUIRES_FEATURE btf\n\n\
         NAME shuns_btf\nRUN exit 99\nEXPECT x\nTIMEOUT 5\nREQUIRES_FEATURE !btf\n",
    );
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_tracetest"));
    cmd.arg("run")
        .arg(dir.path())
        .env("BPFTRACE_RUNTIME_TEST_EXECUTABLE", &subject)
        .env("RUNTIME_TEST_COLOR", "no")
        .env_remove("TEST_FILTER");
    let output = cmd.output().unwrap();
    let stdout = stdout_of(&output);
    assert!(output.status.success(), "stdout: {stdout}");
    assert!(stdout.contains("[       OK ] basics.needs_btf"));
    assert!(stdout.contains("missed feature: '!btf'"));
}

#[test]
fn before_process_is_waited_for_and_pid_substituted() {
    let scripts = TempDir::new().unwrap();
    let waiter = write_script(&scripts, "waiter", "sleep 10");

    let dir = TempDir::new().unwrap();
    write_file(
        &dir,
        "basics",
        &format!(
            "NAME traced\n\
             RUN test -d /proc/{{{{BEFORE_PID}}}} && echo target_alive\n\
             EXPECT target_alive\nTIMEOUT 5\n\
             BEFORE {}\n",
            waiter.display()
        ),
    );
    let output = run_engine(&dir, &[], &[]);
    assert!(output.status.success(), "stdout: {}", stdout_of(&output));
}

#[test]
fn before_with_background_child_does_not_stall_teardown() {
    let scripts = TempDir::new().unwrap();
    // Exits almost immediately, leaving a long-lived child holding the
    // output pipes; teardown must not wait for the grandchild.
    let spawner = write_script(&scripts, "spawner", "sleep 30 &\nsleep 0.3");

    let dir = TempDir::new().unwrap();
    write_file(
        &dir,
        "basics",
        &format!(
            "NAME quick\nRUN echo done\nEXPECT done\nTIMEOUT 2\nBEFORE {}\n",
            spawner.display()
        ),
    );
    let started = Instant::now();
    let output = run_engine(&dir, &[], &[]);
    assert!(output.status.success(), "stdout: {}", stdout_of(&output));
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "teardown stalled for {:?}",
        started.elapsed()
    );
}

#[test]
fn requirement_skip_reported_before_feature_check() {
    let dir = TempDir::new().unwrap();
    write_file(
        &dir,
        "basics",
        "NAME both_gates\nRUN exit 99\nEXPECT x\nTIMEOUT 5\n\
         REQUIRES false\nREQUIRES_FEATURE btf\n",
    );
    let output = run_engine(&dir, &[], &[]);
    let stdout = stdout_of(&output);
    assert!(output.status.success(), "stdout: {stdout}");
    assert!(stdout.contains("[ RUN      ] basics.both_gates"));
    assert!(stdout.contains("unmet condition: 'false'"));
    assert!(!stdout.contains("missed feature"));
}

#[test]
fn attach_requires_bare_sentinel_line() {
    let dir = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    let expected = outside.path().join("expected.txt");
    std::fs::write(&expected, "body\n").unwrap();

    // A line merely mentioning the marker must not trigger attach; only
    // the bare sentinel line discards the startup output.
    write_file(
        &dir,
        "basics",
        &format!(
            "NAME embedded_marker\n\
             RUN echo mentions __BPFTRACE_NOTIFY_PROBES_ATTACHED here; \
             echo __BPFTRACE_NOTIFY_PROBES_ATTACHED; echo body\n\
             EXPECT_FILE {}\nTIMEOUT 5\n",
            expected.display()
        ),
    );
    let output = run_engine(&dir, &[], &[]);
    assert!(output.status.success(), "stdout: {}", stdout_of(&output));
}

#[test]
fn pidns_secondary_before_visible_to_subject() {
    let probe = Command::new("unshare")
        .args(["--fork", "--pid", "--mount-proc", "-r", "--kill-child", "true"])
        .status();
    if !matches!(probe, Ok(status) if status.success()) {
        return; // kernel or sandbox forbids user namespaces
    }

    let scripts = TempDir::new().unwrap();
    let waiter = write_script(&scripts, "ns_waiter", "sleep 30");

    let dir = TempDir::new().unwrap();
    write_file(
        &dir,
        "basics",
        &format!(
            "NAME namespaced\n\
             RUN sh -c 'cat /proc/[0-9]*/comm'\n\
             EXPECT ns_waiter\nTIMEOUT 5\n\
             NEW_PIDNS\nBEFORE sleep 30\nBEFORE {}\n",
            waiter.display()
        ),
    );
    let output = run_engine(&dir, &[], &[]);
    assert!(output.status.success(), "stdout: {}", stdout_of(&output));
}

#[test]
fn subject_environment_is_minimal() {
    let dir = TempDir::new().unwrap();
    write_file(
        &dir,
        "basics",
        "NAME clean_env\nRUN test -z \"$LEAKY\" && echo clean\nEXPECT clean\nTIMEOUT 5\n",
    );
    let output = run_engine(&dir, &[], &[("LEAKY", "1")]);
    assert!(output.status.success(), "stdout: {}", stdout_of(&output));
}

#[test]
fn validate_reports_parse_errors() {
    let dir = TempDir::new().unwrap();
    write_file(&dir, "good", "NAME fine\nRUN true\nEXPECT x\nTIMEOUT 5\n");
    write_file(&dir, "bad", "NAME broken\nRUN true\nBOGUS directive\nEXPECT x\nTIMEOUT 5\n");

    let output = Command::new(env!("CARGO_BIN_EXE_tracetest"))
        .arg("validate")
        .arg(dir.path())
        .env("RUNTIME_TEST_COLOR", "no")
        .output()
        .unwrap();
    let stdout = stdout_of(&output);
    assert_eq!(output.status.code(), Some(1));
    assert!(stdout.contains("field BOGUS is unknown. Suite: bad"));
    assert!(stdout.contains("1 invalid file(s)"));
}

#[test]
fn invalid_color_setting_aborts() {
    let dir = TempDir::new().unwrap();
    write_file(&dir, "basics", "NAME t\nRUN true\nEXPECT x\nTIMEOUT 5\n");
    let output = run_engine(&dir, &[], &[("RUNTIME_TEST_COLOR", "sometimes")]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("RUNTIME_TEST_COLOR"));
}

#[test]
fn missing_subject_binary_setting_aborts() {
    let dir = TempDir::new().unwrap();
    write_file(&dir, "basics", "NAME t\nRUN true\nEXPECT x\nTIMEOUT 5\n");
    let output = Command::new(env!("CARGO_BIN_EXE_tracetest"))
        .arg("run")
        .arg(dir.path())
        .env_remove("BPFTRACE_RUNTIME_TEST_EXECUTABLE")
        .env("RUNTIME_TEST_COLOR", "no")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr)
        .contains("BPFTRACE_RUNTIME_TEST_EXECUTABLE"));
}
